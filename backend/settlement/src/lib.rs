//! Project funding lifecycle and settlement engine.
//!
//! Tracks community energy projects from origination to end of life: a
//! ten-stage state machine, contractor auctions, reputation rewards, the
//! investment raise, the recipient unlock handshake and escrow funding,
//! and the payback loop that shifts ownership and pays investors.
//!
//! Ledger, wallet, escrow, identity and notification delivery are reached
//! through traits ([`ledger::Ledger`], [`ledger::Wallet`],
//! [`ledger::EscrowService`], [`identity::IdentityService`],
//! [`notify::Notifier`]); records persist through [`store::RecordStore`].
//! Background work (unlock wait, payback monitor, payment reminders) runs on
//! tokio tasks registered per project in [`tasks::TaskRegistry`].

pub mod api;
pub mod auction;
pub mod config;
pub mod engine;
pub mod errors;
pub mod funding;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod monitor;
pub mod notify;
pub mod payback;
pub mod projects;
pub mod reputation;
pub mod secrets;
pub mod stages;
pub mod store;
pub mod tasks;
pub mod types;
pub mod unlock;

#[cfg(test)]
mod test_lifecycle;
#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Config, EngineSettings};
pub use engine::{Collaborators, Engine};
pub use errors::{EngineError, Result};
pub use types::{Entity, Investor, Project, ProjectIndex, Recipient, User};
