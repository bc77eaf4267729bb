//! The engine handle: collaborators, settings and the shared coordination
//! state (per-project, escrow and entity locks, the task registry and the
//! credential vault).
//!
//! Operations are implemented as `impl Engine` blocks in the module that owns
//! them (`stages`, `funding`, `payback`, `monitor`, ...). Methods that may
//! start background work take `self: &Arc<Self>` so the task can hold the
//! engine.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::errors::{EngineError, Result};
use crate::identity::IdentityService;
use crate::ledger::{Asset, EscrowService, Ledger, Wallet};
use crate::locks::KeyedLocks;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::secrets::CredentialVault;
use crate::store::{self, RecordStore};
use crate::tasks::TaskRegistry;
use crate::types::{Entity, Investor, Project, ProjectIndex, Recipient, User};

/// The external services the engine is wired to.
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub ledger: Arc<dyn Ledger>,
    pub wallet: Arc<dyn Wallet>,
    pub escrow: Arc<dyn EscrowService>,
    pub identity: Arc<dyn IdentityService>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Engine {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) escrow: Arc<dyn EscrowService>,
    pub(crate) identity: Arc<dyn IdentityService>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) settings: EngineSettings,
    pub(crate) project_locks: KeyedLocks,
    pub(crate) escrow_locks: KeyedLocks,
    /// Guards entity balances shared across projects (first-loss pledges).
    pub(crate) entity_locks: KeyedLocks,
    pub(crate) tasks: TaskRegistry,
    pub(crate) vault: CredentialVault,
    /// Serialises index allocation for new projects.
    pub(crate) creation: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(collaborators: Collaborators, settings: EngineSettings) -> Arc<Self> {
        Arc::new(Self {
            store: collaborators.store,
            ledger: collaborators.ledger,
            wallet: collaborators.wallet,
            escrow: collaborators.escrow,
            identity: collaborators.identity,
            notifier: collaborators.notifier,
            settings,
            project_locks: KeyedLocks::new(),
            escrow_locks: KeyedLocks::new(),
            entity_locks: KeyedLocks::new(),
            tasks: TaskRegistry::new(),
            vault: CredentialVault::new(),
            creation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Cancel every background task of `project`.
    pub fn stop(&self, project: ProjectIndex) {
        self.tasks.stop(project);
    }

    pub fn shutdown(&self) {
        self.tasks.stop_all();
    }

    pub(crate) fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub(crate) fn stablecoin(&self) -> Asset {
        Asset::new(
            self.settings.stablecoin_code.clone(),
            self.settings.stablecoin_issuer.clone(),
        )
    }

    pub(crate) fn platform_seed(&self) -> &SecretString {
        &self.settings.platform_seed
    }

    /// Restart background work for persisted projects after a restart.
    ///
    /// Locked projects without an escrow get an unlock wait; projects between
    /// construction and handoff with an active escrow get the payback monitor
    /// and the payment reminder. Returns the number of projects resumed.
    pub async fn resume(self: &Arc<Self>) -> Result<usize> {
        let mut resumed = 0;
        for project in self.projects().await? {
            if project.lock && project.escrow_pubkey.is_none() {
                self.spawn_unlock_wait(project.index);
                resumed += 1;
            } else if project.escrow_active && (5..8).contains(&project.stage) {
                self.spawn_payback_monitor(project.index);
                self.spawn_payment_reminder(project.index);
                resumed += 1;
            }
        }
        info!("Resumed background tasks for {resumed} projects");
        Ok(resumed)
    }

    // ── Record access ────────────────────────────────────

    pub async fn project(&self, index: ProjectIndex) -> Result<Project> {
        store::load(self.store.as_ref(), index).await
    }

    pub async fn projects(&self) -> Result<Vec<Project>> {
        store::load_all(self.store.as_ref()).await
    }

    pub async fn projects_at_stage(&self, stage: u8) -> Result<Vec<Project>> {
        Ok(self
            .projects()
            .await?
            .into_iter()
            .filter(|p| p.stage == stage)
            .collect())
    }

    pub(crate) async fn save_project(&self, project: &Project) -> Result<()> {
        store::save(self.store.as_ref(), project).await
    }

    pub async fn investor(&self, index: u64) -> Result<Investor> {
        store::load(self.store.as_ref(), index).await
    }

    pub async fn recipient(&self, index: u64) -> Result<Recipient> {
        store::load(self.store.as_ref(), index).await
    }

    pub async fn entity(&self, index: u64) -> Result<Entity> {
        store::load(self.store.as_ref(), index).await
    }

    /// Register (or overwrite) the business record of a funding party.
    pub async fn register_investor(&self, investor: &Investor) -> Result<()> {
        store::save(self.store.as_ref(), investor).await
    }

    pub async fn register_recipient(&self, recipient: &Recipient) -> Result<()> {
        store::save(self.store.as_ref(), recipient).await
    }

    pub async fn register_entity(&self, entity: &Entity) -> Result<()> {
        store::save(self.store.as_ref(), entity).await
    }

    pub(crate) async fn user(&self, index: u64) -> Result<User> {
        self.identity
            .retrieve(index)
            .await
            .map_err(|e| e.context("retrieving user"))
    }

    // ── Credentials ──────────────────────────────────────

    /// Decrypt a user's seed with `secret` and check it reproduces their public key.
    pub(crate) async fn unlock_seed(&self, user: &User, secret: &SecretString) -> Result<SecretString> {
        let seed = self
            .wallet
            .decrypt_seed(&user.encrypted_seed, secret)
            .await
            .map_err(|_| EngineError::InvalidCredential)?;
        let pubkey = self.wallet.public_key(&seed).await?;
        if pubkey != user.public_key {
            return Err(EngineError::InvalidCredential);
        }
        Ok(seed)
    }

    // ── Notifications ────────────────────────────────────

    /// Fire-and-forget delivery; failures are logged only.
    pub(crate) async fn notify(&self, notification: Notification) {
        let kind = notification.kind;
        let to = notification.to.clone();
        if let Err(e) = self.notifier.send(notification).await {
            warn!("Failed to deliver {kind:?} notification to {to}: {e}");
        }
    }

    /// Notify `user` only if they opted in.
    pub(crate) async fn notify_opted(
        &self,
        user: &User,
        kind: NotificationKind,
        project: ProjectIndex,
        context: Vec<String>,
    ) {
        if user.notification {
            self.notify(Notification::new(kind, project, user.email.clone()).with_context(context))
                .await;
        }
    }
}
