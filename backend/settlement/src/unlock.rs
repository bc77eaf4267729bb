//! # Unlock handshake and escrow funding
//!
//! A fully raised project is locked until its recipient proves control of
//! their wallet. The handshake has two halves:
//!
//! - [`Engine::unlock_project`], called by the recipient, checks the secret
//!   and stages it in the vault.
//! - The unlock-wait task, started when the raise completes, waits for the
//!   staged secret (or consumes a pre-registered one-time unlock), creates
//!   and funds the escrow, issues debt and payback assets to the recipient
//!   and moves the project to construction.
//!
//! The wait is bounded by `lock_timeout`. A staged secret that no longer
//! unlocks the recipient's wallet re-locks the project and the wait goes on.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::ledger::{self, Asset};
use crate::notify::NotificationKind;
use crate::secrets::CredentialSlot;
use crate::stages::administrative;
use crate::tasks::TaskKind;
use crate::types::{Project, ProjectIndex, User};

impl Engine {
    /// Recipient side of the handshake.
    pub async fn unlock_project(
        self: &Arc<Self>,
        username: &str,
        token: &str,
        index: ProjectIndex,
        secret: SecretString,
    ) -> Result<()> {
        let user = self
            .identity
            .validate(username, token)
            .await
            .map_err(|e| e.context("validating recipient"))?;

        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if user.index != project.recipient_index {
            return Err(EngineError::RoleMismatch {
                role: "recipient",
                index: user.index,
                project: index,
            });
        }
        self.unlock_seed(&user, &secret).await?;
        if !project.lock {
            return Err(EngineError::NotLocked(index));
        }

        self.vault.stage(CredentialSlot::UnlockSecret, index, secret);
        project.lock = false;
        self.save_project(&project).await?;
        info!("Project {index} unlocked by recipient {}", user.index);
        Ok(())
    }

    pub(crate) fn spawn_unlock_wait(self: &Arc<Self>, index: ProjectIndex) {
        let Some(ticket) = self.tasks.register(index, TaskKind::UnlockWait) else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.wait_for_unlock(index, ticket.token()).await {
                Ok(()) => info!("Escrow funding for project {index} complete"),
                Err(e) => error!("Escrow funding for project {index} failed: {e}"),
            }
            engine.tasks.finished(index, TaskKind::UnlockWait, &ticket);
        });
    }

    /// Body of the unlock-wait task.
    pub(crate) async fn wait_for_unlock(
        self: &Arc<Self>,
        index: ProjectIndex,
        token: CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.settings.lock_timeout;

        let mut recipient_seed = None;
        if let Some(secret) = self.vault.take(CredentialSlot::OneTimeUnlock, index) {
            let project = self.project(index).await?;
            match self.recipient_seed(&project, &secret).await {
                Ok(seed) => recipient_seed = Some(seed),
                Err(e) => warn!("One-time unlock for project {index} failed ({e}), waiting for recipient"),
            }
        }

        let recipient_seed = match recipient_seed {
            Some(seed) => seed,
            None => loop {
                if Instant::now() >= deadline {
                    return Err(EngineError::UnlockTimeout(index));
                }
                match self.project(index).await {
                    Ok(project) if !project.lock => {
                        match self.vault.take(CredentialSlot::UnlockSecret, index) {
                            Some(secret) => match self.recipient_seed(&project, &secret).await {
                                Ok(seed) => break seed,
                                Err(e) => {
                                    warn!("Staged secret for project {index} rejected ({e}), re-locking");
                                    self.relock(index).await?;
                                }
                            },
                            None => {
                                warn!("Project {index} unlocked without a staged secret, re-locking");
                                self.relock(index).await?;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Could not reload project {index}: {e}"),
                }

                tokio::select! {
                    _ = token.cancelled() => return Err(EngineError::Cancelled(index)),
                    _ = sleep(self.settings.unlock_poll_interval) => {}
                }
            },
        };

        self.fund_escrow(index, &recipient_seed).await
    }

    async fn recipient_seed(&self, project: &Project, secret: &SecretString) -> Result<SecretString> {
        let user = self.user(project.recipient_index).await?;
        self.unlock_seed(&user, secret).await
    }

    async fn relock(&self, index: ProjectIndex) -> Result<()> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        project.lock = true;
        self.save_project(&project).await
    }

    /// Create and fund the escrow, hand the recipient their assets and move
    /// the project to construction.
    pub(crate) async fn fund_escrow(
        self: &Arc<Self>,
        index: ProjectIndex,
        recipient_seed: &SecretString,
    ) -> Result<()> {
        let guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.escrow_pubkey.is_some() {
            warn!("Project {index} already has an escrow");
            return Ok(());
        }
        let recipient = self.user(project.recipient_index).await?;

        let escrow = self
            .escrow
            .create(index, &recipient.public_key, recipient_seed, self.platform_seed())
            .await
            .map_err(|e| e.context("creating escrow"))?;
        info!("Created escrow {escrow} for project {index}");
        project.escrow_pubkey = Some(escrow.clone());
        project.lock = false;
        self.save_project(&project).await?;

        // the seed premium is owed by the recipient but not held in escrow
        let fund_tx = self
            .escrow
            .fund(&escrow, project.total_value, self.platform_seed())
            .await
            .map_err(|e| e.context("funding escrow"))?;
        info!("Moved {} into escrow {escrow} ({fund_tx})", project.total_value);
        project.escrow_active = true;

        project.debt_asset_code = Some(ledger::asset_code(ledger::DEBT_ASSET_PREFIX, &project.metadata));
        project.payback_asset_code =
            Some(ledger::asset_code(ledger::PAYBACK_ASSET_PREFIX, &project.metadata));
        let obligation = project.total_value + project.seed_money_raised;
        self.munibond_receive(&project, &recipient, recipient_seed, obligation)
            .await?;

        project.bal_left = obligation;
        project.date_funded = Some(Engine::now());
        self.apply_stage(&mut project, 5, administrative("escrow_funded"))
            .await?;
        drop(guard);

        self.spawn_payment_reminder(index);
        self.spawn_payback_monitor(index);
        Ok(())
    }

    /// Issue payback and debt assets to the recipient and freeze the issuer.
    async fn munibond_receive(
        &self,
        project: &Project,
        user: &User,
        recipient_seed: &SecretString,
        obligation: f64,
    ) -> Result<()> {
        let issuer = project
            .issuer_pubkey
            .clone()
            .ok_or_else(|| EngineError::Ledger(format!("project {} has no issuer", project.index)))?;
        let debt = Asset::new(project.debt_asset_code.clone().unwrap_or_default(), issuer.clone());
        let payback = Asset::new(project.payback_asset_code.clone().unwrap_or_default(), issuer);

        let years = project.estimated_acquisition.max(1);
        let payback_units = f64::from(years * 24);

        let payback_trust = self
            .ledger
            .create_trustline(&payback, &user.public_key, payback_units, recipient_seed)
            .await
            .map_err(|e| e.context("trusting payback asset"))?;
        let payback_tx = self
            .ledger
            .issue_asset(project.index, &payback, &user.public_key, payback_units)
            .await
            .map_err(|e| e.context("issuing payback asset"))?;
        let debt_trust = self
            .ledger
            .create_trustline(&debt, &user.public_key, obligation * 2.0, recipient_seed)
            .await
            .map_err(|e| e.context("trusting debt asset"))?;
        let debt_tx = self
            .ledger
            .issue_asset(project.index, &debt, &user.public_key, obligation)
            .await
            .map_err(|e| e.context("issuing debt asset"))?;
        info!(
            "Issued {obligation} debt and {payback_units} payback units to recipient {}",
            user.index
        );

        let mut recipient = self.recipient(user.index).await?;
        if !recipient.received_projects.contains(&project.index) {
            recipient.received_projects.push(project.index);
        }
        recipient.received_assets.push(debt.code.clone());
        self.register_recipient(&recipient).await?;

        let freeze_tx = self
            .ledger
            .freeze_issuer(project.index)
            .await
            .map_err(|e| e.context("freezing issuer"))?;
        info!("Issuer of project {} frozen ({freeze_tx})", project.index);

        self.notify_opted(
            user,
            NotificationKind::AssetsIssued,
            project.index,
            vec![payback_trust, payback_tx, debt_trust, debt_tx],
        )
        .await;
        Ok(())
    }
}
