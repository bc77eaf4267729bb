//! Identity / user service seam. Owns usernames, tokens, KYC flags and
//! reputation; the engine only reads users and applies reputation deltas.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::User;

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn retrieve(&self, index: u64) -> Result<User>;

    /// Resolve a session token to its user.
    async fn validate(&self, username: &str, token: &str) -> Result<User>;

    async fn change_reputation(&self, index: u64, delta: f64) -> Result<()>;
}
