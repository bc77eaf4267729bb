//! Settlement engine service entry point.
//!
//! Opens the record store, resumes background work for persisted projects and
//! serves the read-only status API. Ledger, escrow and identity backends are
//! deployment adapters; until one is wired in, calls that need them fail with
//! a "not configured" error and the engine stays read-only.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use settlement::api::{self, ApiState};
use settlement::engine::{Collaborators, Engine};
use settlement::errors::{EngineError, Result};
use settlement::identity::IdentityService;
use settlement::ledger::{Asset, EscrowService, Ledger, TxHash, Wallet};
use settlement::notify::{LogNotifier, Notifier, WebhookNotifier};
use settlement::store::{self, SqliteStore};
use settlement::types::{ProjectIndex, User};
use settlement::Config;

/// Stand-in for the ledger, wallet, escrow and identity backends.
struct Unconfigured;

fn ledger_missing<T>() -> Result<T> {
    Err(EngineError::Ledger("ledger backend not configured".into()))
}

#[async_trait]
impl Ledger for Unconfigured {
    async fn account_exists(&self, _pubkey: &str) -> Result<bool> {
        ledger_missing()
    }

    async fn balance(&self, _pubkey: &str, _asset_code: &str) -> Result<f64> {
        ledger_missing()
    }

    async fn create_trustline(
        &self,
        _asset: &Asset,
        _pubkey: &str,
        _limit: f64,
        _signer: &SecretString,
    ) -> Result<TxHash> {
        ledger_missing()
    }

    async fn transfer(
        &self,
        _asset: &Asset,
        _from: &str,
        _to: &str,
        _amount: f64,
        _signer: &SecretString,
        _memo: &str,
    ) -> Result<TxHash> {
        ledger_missing()
    }

    async fn init_issuer(&self, _project: ProjectIndex, _funder: &SecretString) -> Result<String> {
        ledger_missing()
    }

    async fn issue_asset(
        &self,
        _project: ProjectIndex,
        _asset: &Asset,
        _to: &str,
        _amount: f64,
    ) -> Result<TxHash> {
        ledger_missing()
    }

    async fn freeze_issuer(&self, _project: ProjectIndex) -> Result<TxHash> {
        ledger_missing()
    }
}

#[async_trait]
impl Wallet for Unconfigured {
    async fn decrypt_seed(&self, _encrypted: &[u8], _secret: &SecretString) -> Result<SecretString> {
        ledger_missing()
    }

    async fn public_key(&self, _seed: &SecretString) -> Result<String> {
        ledger_missing()
    }
}

#[async_trait]
impl EscrowService for Unconfigured {
    async fn create(
        &self,
        _project: ProjectIndex,
        _owner_pubkey: &str,
        _counterparty_seed: &SecretString,
        _platform_seed: &SecretString,
    ) -> Result<String> {
        Err(EngineError::Escrow("escrow backend not configured".into()))
    }

    async fn fund(&self, _escrow_pubkey: &str, _amount: f64, _signer: &SecretString) -> Result<TxHash> {
        Err(EngineError::Escrow("escrow backend not configured".into()))
    }

    async fn disburse(
        &self,
        _escrow_pubkey: &str,
        _destination: &str,
        _signer: &SecretString,
        _amount: f64,
        _memo: &str,
        _asset: &Asset,
    ) -> Result<TxHash> {
        Err(EngineError::Escrow("escrow backend not configured".into()))
    }
}

#[async_trait]
impl IdentityService for Unconfigured {
    async fn retrieve(&self, _index: u64) -> Result<User> {
        Err(EngineError::Identity("identity backend not configured".into()))
    }

    async fn validate(&self, _username: &str, _token: &str) -> Result<User> {
        Err(EngineError::Identity("identity backend not configured".into()))
    }

    async fn change_reputation(&self, _index: u64, _delta: f64) -> Result<()> {
        Err(EngineError::Identity("identity backend not configured".into()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = store::init_pool(&config.database_url, 5).await?;

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!("Delivering notifications to {url}");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            warn!("NOTIFY_WEBHOOK_URL not set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };
    let backend = Arc::new(Unconfigured);

    let engine = Engine::new(
        Collaborators {
            store: Arc::new(SqliteStore::new(pool)),
            ledger: backend.clone(),
            wallet: backend.clone(),
            escrow: backend.clone(),
            identity: backend,
            notifier,
        },
        config.settings,
    );

    // ─── Background work ──────────────────────────────────
    engine.resume().await?;

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState {
        engine: Arc::clone(&engine),
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    engine.shutdown();
    Ok(())
}
