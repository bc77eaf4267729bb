//! Engine-wide error types.
//!
//! Variants fall into three groups: validation failures that are returned to
//! the caller and never retried, collaborator failures (store, ledger, escrow,
//! identity, HTTP) that are wrapped with context and propagated, and task
//! failures raised by the background workers.

use thiserror::Error;

use crate::types::ProjectIndex;

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Validation ───────────────────────────────────────────
    #[error("{kind} {index} not found")]
    NotFound { kind: &'static str, index: u64 },

    #[error("stage {0} is out of bounds or not eligible for promotion")]
    StageOutOfBounds(u8),

    #[error("stage checklist or stage data is missing for project {0}")]
    ChecklistMissing(ProjectIndex),

    #[error("checklist for stage {stage} has {got} items, catalog lists {expected}")]
    ChecklistLengthMismatch { stage: u8, got: usize, expected: usize },

    #[error("stage data for stage {0} is empty")]
    StageDataEmpty(u8),

    #[error("checklist for stage {0} is not fully attested")]
    ChecklistIncomplete(u8),

    #[error("project {project} is at stage {stage}, operation requires {required}")]
    WrongStage {
        project: ProjectIndex,
        stage: u8,
        required: &'static str,
    },

    #[error("investment type {0:?} is not supported")]
    UnsupportedInvestmentType(String),

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("ledger account {0} does not exist")]
    AccountMissing(String),

    #[error("investment of {amount} exceeds the {remaining} still required")]
    ExceedsRemaining { amount: f64, remaining: f64 },

    #[error("investment of {amount} exceeds the seed cap of {cap}")]
    SeedCapExceeded { amount: f64, cap: f64 },

    #[error("project {0} has been flagged by an admin")]
    Flagged(ProjectIndex),

    #[error("project {0} has not reached the report threshold")]
    ReportThresholdNotReached(ProjectIndex),

    #[error("project {0} is not locked")]
    NotLocked(ProjectIndex),

    #[error("{role} {index} is not assigned to project {project}")]
    RoleMismatch {
        role: &'static str,
        index: u64,
        project: ProjectIndex,
    },

    #[error("originator {0} has not passed KYC or is banned")]
    OriginatorNotVerified(u64),

    #[error("supplied credential does not unlock the expected account")]
    InvalidCredential,

    #[error("escrow for project {0} is not active")]
    EscrowInactive(ProjectIndex),

    #[error("no bids to select from")]
    EmptyAuction,

    #[error("payment of {amount} is below the billed amount of {bill}")]
    BelowBill { amount: f64, bill: f64 },

    #[error("vote of {votes} exceeds voting balance of {balance}")]
    VotingBalanceExceeded { votes: f64, balance: f64 },

    #[error("{0} is not a waterfall payee of this project")]
    WaterfallPayeeMissing(String),

    #[error("withdrawal of {amount} exceeds the waterfall entitlement of {entitled}")]
    WaterfallExceeded { amount: f64, entitled: f64 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(f64),

    #[error("invalid project terms: {0}")]
    InvalidTerms(&'static str),

    // ── Collaborators ────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("escrow error: {0}")]
    Escrow(String),

    #[error("identity service error: {0}")]
    Identity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Background tasks ─────────────────────────────────────
    #[error("project {0} was not unlocked before the timeout")]
    UnlockTimeout(ProjectIndex),

    #[error("task for project {0} was cancelled")]
    Cancelled(ProjectIndex),
}

impl EngineError {
    pub fn not_found(kind: &'static str, index: u64) -> Self {
        Self::NotFound { kind, index }
    }

    /// `true` for errors caused by the request itself; retrying them is pointless.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Self::Database(_)
                | Self::Migrate(_)
                | Self::Http(_)
                | Self::Json(_)
                | Self::Ledger(_)
                | Self::Escrow(_)
                | Self::Identity(_)
                | Self::Config(_)
                | Self::UnlockTimeout(_)
                | Self::Cancelled(_)
        )
    }

    /// Prefix a collaborator error with what the engine was doing at the time.
    pub fn context(self, what: &str) -> Self {
        match self {
            Self::Ledger(msg) => Self::Ledger(format!("{what}: {msg}")),
            Self::Escrow(msg) => Self::Escrow(format!("{what}: {msg}")),
            Self::Identity(msg) => Self::Identity(format!("{what}: {msg}")),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
