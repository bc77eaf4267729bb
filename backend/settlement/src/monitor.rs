//! # Payback monitor
//!
//! One long-lived task per funded project compares the time since the last
//! payment with the payback period and escalates:
//!
//! | factor        | tier          | action                                          |
//! |---------------|---------------|-------------------------------------------------|
//! | `<= 1`        | on track      | none                                            |
//! | `(1, 2)`      | normal        | none                                            |
//! | `[2, 4)`      | gentle        | recipient                                       |
//! | `[4, 6)`      | stern         | recipient, opted-in investors, guarantor        |
//! | `>= 6`        | disconnection | opted-in investors, guarantor, first-loss cover |
//!
//! Every cycle adds `factor * bill` to `amount_owed`, whatever the tier. The
//! task sleeps one payback period between cycles and stops on cancellation
//! or once the project reaches stage 8 or 9.
//!
//! The same module runs the payment-reminder task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::funding::ADMIN_CHANNEL;
use crate::ledger::TxHash;
use crate::notify::{Notification, NotificationKind};
use crate::secrets::CredentialSlot;
use crate::tasks::TaskKind;
use crate::types::{Project, ProjectIndex, User};

/// Delay before retrying a cycle whose records could not be loaded.
const LOOKUP_RETRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    OnTrack,
    /// One to two periods late; reserved, no action.
    Normal,
    Gentle,
    Stern,
    Disconnection,
}

/// First matching band; the bands are not cumulative.
pub fn classify(factor: f64) -> EscalationTier {
    if factor <= 1.0 {
        EscalationTier::OnTrack
    } else if factor < 2.0 {
        EscalationTier::Normal
    } else if factor < 4.0 {
        EscalationTier::Gentle
    } else if factor < 6.0 {
        EscalationTier::Stern
    } else {
        EscalationTier::Disconnection
    }
}

/// Payback period in seconds; zero falls back to one second.
pub fn period_secs(project: &Project) -> u64 {
    project.payback_period_secs.max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorCycle {
    pub factor: f64,
    pub tier: EscalationTier,
    pub amount_owed: f64,
    /// First-loss transfer made this cycle, if any.
    pub first_loss_tx: Option<TxHash>,
}

impl Engine {
    pub(crate) fn spawn_payback_monitor(self: &Arc<Self>, index: ProjectIndex) {
        let Some(ticket) = self.tasks.register(index, TaskKind::PaybackMonitor) else {
            return;
        };
        info!("Starting payback monitor for project {index}");
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_payback_monitor(index, ticket.token()).await;
            engine.tasks.finished(index, TaskKind::PaybackMonitor, &ticket);
        });
    }

    async fn run_payback_monitor(&self, index: ProjectIndex, token: CancellationToken) {
        loop {
            let wait = match self.run_monitor_cycle(index, Engine::now()).await {
                Ok(None) => {
                    info!("Project {index} reached a terminal stage, payback monitor stopping");
                    return;
                }
                Ok(Some(_)) => match self.project(index).await {
                    Ok(project) => Duration::from_secs(period_secs(&project)),
                    Err(_) => LOOKUP_RETRY,
                },
                Err(e) => {
                    error!("Payback monitor cycle for project {index} failed: {e}");
                    LOOKUP_RETRY
                }
            };
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(wait) => {}
            }
        }
    }

    /// One monitor pass at time `now`. Returns `None` once the project is terminal.
    pub async fn run_monitor_cycle(
        &self,
        index: ProjectIndex,
        now: i64,
    ) -> Result<Option<MonitorCycle>> {
        let guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.is_terminal() {
            return Ok(None);
        }
        let recipient = self.recipient(project.recipient_index).await?;
        let recipient_user = self.user(project.recipient_index).await?;
        let guarantor = match project.guarantor_index {
            Some(g) => match self.user(g).await {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!("Guarantor {g} of project {index} not found: {e}");
                    None
                }
            },
            None => None,
        };

        let since = project.date_last_paid.unwrap_or(project.date_initiated);
        let factor = (now - since) as f64 / period_secs(&project) as f64;
        project.amount_owed += factor * self.monthly_bill(&recipient);
        self.save_project(&project).await?;
        drop(guard);

        let tier = classify(factor);
        let mut cycle = MonitorCycle {
            factor,
            tier,
            amount_owed: project.amount_owed,
            first_loss_tx: None,
        };
        match tier {
            EscalationTier::OnTrack | EscalationTier::Normal => {}
            EscalationTier::Gentle => {
                info!("Project {index} is {factor:.2} periods behind, sending gentle alert");
                self.notify(Notification::new(
                    NotificationKind::GentlePaybackAlert,
                    index,
                    recipient_user.email.clone(),
                ))
                .await;
            }
            EscalationTier::Stern => {
                info!("Project {index} is {factor:.2} periods behind, sending stern alerts");
                self.notify(Notification::new(
                    NotificationKind::SternPaybackAlert,
                    index,
                    recipient_user.email.clone(),
                ))
                .await;
                self.alert_investors(&project, NotificationKind::SternPaybackAlertInvestor)
                    .await;
                if let Some(g) = &guarantor {
                    self.notify(Notification::new(
                        NotificationKind::SternPaybackAlertGuarantor,
                        index,
                        g.email.clone(),
                    ))
                    .await;
                }
            }
            EscalationTier::Disconnection => {
                warn!("Project {index} is {factor:.2} periods behind, disconnecting");
                self.alert_investors(&project, NotificationKind::DisconnectionInvestor)
                    .await;
                if let Some(g) = &guarantor {
                    self.notify(Notification::new(
                        NotificationKind::DisconnectionGuarantor,
                        index,
                        g.email.clone(),
                    ))
                    .await;
                    match self.cover_first_loss(index, g.index, project.amount_owed).await {
                        Ok(tx) => cycle.first_loss_tx = Some(tx),
                        Err(e) => error!("First-loss cover for project {index} failed: {e}"),
                    }
                }
            }
        }
        Ok(Some(cycle))
    }

    async fn alert_investors(&self, project: &Project, kind: NotificationKind) {
        for investor in project.unique_investors() {
            match self.user(investor).await {
                Ok(user) => self.notify_opted(&user, kind, project.index, Vec::new()).await,
                Err(e) => warn!("Skipping {kind:?} to investor {investor}: {e}"),
            }
        }
    }

    /// Move up to `amount` from the guarantor into the project escrow,
    /// limited by what the guarantor still has pledged.
    pub async fn cover_first_loss(
        &self,
        index: ProjectIndex,
        guarantor_index: u64,
        amount: f64,
    ) -> Result<TxHash> {
        let project = self.project(index).await?;
        if project.guarantor_index != Some(guarantor_index) {
            return Err(EngineError::RoleMismatch {
                role: "guarantor",
                index: guarantor_index,
                project: index,
            });
        }
        let _pledge = self.entity_locks.acquire(guarantor_index).await;
        let mut entity = self.entity(guarantor_index).await?;
        let amount = amount.min(entity.first_loss_guarantee_amt);
        if !(amount > 0.0) {
            return Err(EngineError::InvalidAmount(amount));
        }
        let escrow = project
            .escrow_pubkey
            .clone()
            .ok_or(EngineError::EscrowInactive(index))?;

        let secret = self
            .vault
            .peek(CredentialSlot::FirstLoss, guarantor_index)
            .ok_or(EngineError::InvalidCredential)?;
        let user: User = self.user(guarantor_index).await?;
        let seed = self.unlock_seed(&user, &secret).await?;

        let tx = self
            .ledger
            .transfer(
                &self.stablecoin(),
                &user.public_key,
                &escrow,
                amount,
                &seed,
                "first loss guarantee",
            )
            .await
            .map_err(|e| e.context("covering first loss"))?;
        entity.first_loss_guarantee_amt -= amount;
        self.register_entity(&entity).await?;
        info!("Guarantor {guarantor_index} covered {amount} of project {index} ({tx})");
        Ok(tx)
    }

    pub(crate) fn spawn_payment_reminder(self: &Arc<Self>, index: ProjectIndex) {
        let Some(ticket) = self.tasks.register(index, TaskKind::PaymentReminder) else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let token = ticket.token();
            let mut cycles = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(engine.settings.reminder_interval) => {}
                }
                match engine.send_payment_reminder(index).await {
                    Ok(true) => {
                        cycles += 1;
                        info!("Sent payment reminder {cycles} for project {index}");
                    }
                    Ok(false) => break,
                    Err(e) => warn!("Payment reminder for project {index} failed: {e}"),
                }
            }
            engine.tasks.finished(index, TaskKind::PaymentReminder, &ticket);
        });
    }

    /// Remind the recipient that a payment is due. `false` once the project is terminal.
    pub(crate) async fn send_payment_reminder(&self, index: ProjectIndex) -> Result<bool> {
        let project = self.project(index).await?;
        if project.is_terminal() {
            return Ok(false);
        }
        match self.user(project.recipient_index).await {
            Ok(user) => {
                self.notify(Notification::new(NotificationKind::PaymentReminder, index, user.email))
                    .await;
                Ok(true)
            }
            Err(e) => {
                self.notify(
                    Notification::new(NotificationKind::RecipientNotFound, index, ADMIN_CHANNEL)
                        .with_context(vec![project.recipient_index.to_string()]),
                )
                .await;
                Err(e)
            }
        }
    }
}
