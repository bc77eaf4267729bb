//! # Types
//!
//! Records owned by the engine and the read-only views it receives from the
//! identity collaborator.
//!
//! ## Invariants on [`Project`]
//!
//! - `money_raised <= total_value`, and both only grow.
//! - `lock` is set exactly when the raise completes and cleared by the
//!   recipient's unlock handshake.
//! - `escrow_pubkey` is written once, when the escrow is created.
//! - `ownership_shift == 1.0` implies `bal_left == 0.0` and `amount_owed == 0.0`.
//!
//! Secrets (unlock passwords, one-time unlocks, first-loss credentials) are
//! deliberately absent: they live in [`crate::secrets::CredentialVault`] and
//! never reach the record store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ProjectIndex = u64;

/// How a project's capital is raised and repaid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentType {
    /// Debt repaid by the recipient, ownership shifting with each payment.
    #[default]
    Munibond,
    EquityCrowdfunding,
    DebtCrowdfunding,
}

impl InvestmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Munibond => "munibond",
            Self::EquityCrowdfunding => "equity_crowdfunding",
            Self::DebtCrowdfunding => "debt_crowdfunding",
        }
    }
}

/// Rule used to pick a winner among competing contractor bids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionType {
    /// Lowest bid wins and pays its own price.
    #[default]
    Blind,
    /// Lowest bid wins and is paid the second-lowest price.
    Vickrey,
    /// Shortest completion time wins.
    Time,
}

impl AuctionType {
    /// Parse a user-supplied auction name. Unknown names fall back to blind.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "vickrey" => Self::Vickrey,
            "time" | "least_time" | "leasttime" => Self::Time,
            _ => Self::Blind,
        }
    }
}

/// Why a project's stage changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum StageChangeReason {
    /// Promoted through the attested checklist gate.
    Checklist,
    /// Set directly by an engine path that skips the checklist.
    Administrative { path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    pub from: u8,
    pub to: u8,
    pub at: i64,
    pub reason: StageChangeReason,
}

/// One funded (or to-be-funded) renewable-energy asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub index: ProjectIndex,
    pub stage: u8,
    pub metadata: String,

    // Funding
    pub total_value: f64,
    pub money_raised: f64,
    pub seed_money_raised: f64,
    pub seed_investment_factor: f64,
    pub seed_investment_cap: f64,
    pub investor_indices: Vec<u64>,
    /// Investor public key → fraction of `total_value` held.
    pub investor_map: BTreeMap<String, f64>,
    pub votes: f64,
    pub reputation: f64,
    pub interest_rate: f64,

    // Acceptance handshake and escrow
    pub lock: bool,
    pub escrow_pubkey: Option<String>,
    /// Disbursements from the escrow are refused while this is false.
    pub escrow_active: bool,

    // Assets
    pub issuer_pubkey: Option<String>,
    pub investor_asset_code: Option<String>,
    pub seed_asset_code: Option<String>,
    pub debt_asset_code: Option<String>,
    pub payback_asset_code: Option<String>,

    // Payback bookkeeping
    pub bal_left: f64,
    pub amount_owed: f64,
    pub ownership_shift: f64,
    pub date_initiated: i64,
    pub date_funded: Option<i64>,
    pub date_last_paid: Option<i64>,
    /// Secondary payee public key → remaining entitlement.
    pub waterfall_map: BTreeMap<String, f64>,

    // Configuration fixed at proposal time
    pub auction_type: AuctionType,
    pub investment_type: InvestmentType,
    pub payback_period_secs: u64,
    /// Years until the recipient is expected to own the asset outright.
    pub estimated_acquisition: u32,

    // Roles (lookup only)
    pub originator_index: Option<u64>,
    pub contractor_index: Option<u64>,
    pub recipient_index: u64,
    pub guarantor_index: Option<u64>,

    // Moderation
    pub admin_flagged: bool,
    pub flagged_by: Option<u64>,
    pub reports: u32,
    pub user_flagged_by: Vec<u64>,

    // Stage attestation
    pub stage_checklist: Option<Vec<Vec<bool>>>,
    pub stage_data: Option<Vec<Vec<String>>>,
    pub stage_history: Vec<StageChange>,
}

impl Project {
    pub fn new(
        index: ProjectIndex,
        total_value: f64,
        recipient_index: u64,
        metadata: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            index,
            total_value,
            recipient_index,
            metadata: metadata.into(),
            date_initiated: now,
            seed_investment_factor: 1.0,
            ..Self::default()
        }
    }

    /// Amount still needed to complete the raise.
    pub fn remaining(&self) -> f64 {
        (self.total_value - self.money_raised).max(0.0)
    }

    pub fn is_fully_raised(&self) -> bool {
        self.money_raised >= self.total_value
    }

    /// Stages 8 (handoff) and 9 (disposal) end all background monitoring.
    pub fn is_terminal(&self) -> bool {
        self.stage >= 8
    }

    /// Unique investor indices in first-investment order.
    pub fn unique_investors(&self) -> Vec<u64> {
        let mut seen = Vec::with_capacity(self.investor_indices.len());
        for idx in &self.investor_indices {
            if !seen.contains(idx) {
                seen.push(*idx);
            }
        }
        seen
    }
}

/// Role an [`Entity`] plays on the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    #[default]
    Originator,
    Contractor,
    Developer,
    Guarantor,
}

/// Originator, contractor, developer or guarantor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    /// Same index as the entity's user record.
    pub index: u64,
    pub role: EntityRole,
    pub collateral: f64,
    pub collateral_data: Vec<String>,
    /// Remaining first-loss cover the guarantor has pledged.
    pub first_loss_guarantee_amt: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Investor {
    pub index: u64,
    pub voting_balance: f64,
    pub amount_invested: f64,
    pub invested_projects: Vec<ProjectIndex>,
    pub seed_invested_projects: Vec<ProjectIndex>,
    pub invested_assets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipient {
    pub index: u64,
    /// Energy reported by the recipient's teller since the last payback.
    pub teller_energy: u64,
    pub next_payment_interval: Option<i64>,
    pub received_projects: Vec<ProjectIndex>,
    pub received_assets: Vec<String>,
}

/// Identity and authentication fields, owned by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub index: u64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub public_key: String,
    pub encrypted_seed: Vec<u8>,
    pub reputation: f64,
    pub kyc: bool,
    pub banned: bool,
    pub admin: bool,
    /// Opted in to notifications.
    pub notification: bool,
}
