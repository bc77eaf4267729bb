//! Ledger, wallet and escrow seams.
//!
//! The engine never builds transactions itself: asset issuance, trust lines,
//! transfers and the 2-of-2 escrow are delegated to these traits. Every call
//! may fail and failures are surfaced as [`EngineError::Ledger`] or
//! [`EngineError::Escrow`].

use async_trait::async_trait;
use secrecy::SecretString;
use sha3::{Digest, Sha3_256};

use crate::errors::Result;
use crate::types::ProjectIndex;

pub type TxHash = String;

/// Maximum length of a ledger asset code.
const ASSET_CODE_LEN: usize = 12;

pub const INVESTOR_ASSET_PREFIX: &str = "InvestorAssets_";
pub const SEED_ASSET_PREFIX: &str = "SeedAssets_";
pub const DEBT_ASSET_PREFIX: &str = "DebtAssets_";
pub const PAYBACK_ASSET_PREFIX: &str = "PaybackAssets_";

/// An asset identified by its code and issuing account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    pub code: String,
    pub issuer: String,
}

impl Asset {
    pub fn new(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issuer: issuer.into(),
        }
    }
}

/// Derive a ledger asset code from a prefix and project metadata.
pub fn asset_code(prefix: &str, metadata: &str) -> String {
    let digest = Sha3_256::digest(format!("{prefix}{metadata}").as_bytes());
    let mut code = hex::encode_upper(digest);
    code.truncate(ASSET_CODE_LEN);
    code
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn account_exists(&self, pubkey: &str) -> Result<bool>;

    async fn balance(&self, pubkey: &str, asset_code: &str) -> Result<f64>;

    /// Allow the signer's account to hold up to `limit` of `asset`.
    async fn create_trustline(
        &self,
        asset: &Asset,
        pubkey: &str,
        limit: f64,
        signer: &SecretString,
    ) -> Result<TxHash>;

    async fn transfer(
        &self,
        asset: &Asset,
        from: &str,
        to: &str,
        amount: f64,
        signer: &SecretString,
        memo: &str,
    ) -> Result<TxHash>;

    /// Create the project's issuing account, funded by `funder`. Returns its public key.
    async fn init_issuer(&self, project: ProjectIndex, funder: &SecretString) -> Result<String>;

    /// Send freshly issued units of `asset` from the project issuer to `to`.
    async fn issue_asset(
        &self,
        project: ProjectIndex,
        asset: &Asset,
        to: &str,
        amount: f64,
    ) -> Result<TxHash>;

    /// Lock the issuer so no further units can be minted.
    async fn freeze_issuer(&self, project: ProjectIndex) -> Result<TxHash>;
}

/// Credential primitives: encrypted seed storage and key derivation.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn decrypt_seed(&self, encrypted: &[u8], secret: &SecretString) -> Result<SecretString>;

    async fn public_key(&self, seed: &SecretString) -> Result<String>;
}

/// The project's 2-of-2 settlement account, co-signed by platform and recipient.
#[async_trait]
pub trait EscrowService: Send + Sync {
    async fn create(
        &self,
        project: ProjectIndex,
        owner_pubkey: &str,
        counterparty_seed: &SecretString,
        platform_seed: &SecretString,
    ) -> Result<String>;

    async fn fund(&self, escrow_pubkey: &str, amount: f64, signer: &SecretString) -> Result<TxHash>;

    async fn disburse(
        &self,
        escrow_pubkey: &str,
        destination: &str,
        signer: &SecretString,
        amount: f64,
        memo: &str,
        asset: &Asset,
    ) -> Result<TxHash>;
}
