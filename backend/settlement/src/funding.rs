//! # Investment
//!
//! Seed rounds run at stages 1 and 2; the primary raise runs at stage 4.
//! Every round goes through the same sequence under the project lock:
//!
//! 1. [`Engine::pre_investment_check`]: balance, account, remaining amount,
//!    moderation flag; provisions the project issuer on first use.
//! 2. Ledger moves: stablecoin to the platform, trust line and issued
//!    investor (or seed) asset back to the investor.
//! 3. [`Engine::update_after_investment`]: counters, ownership map, and the
//!    lock once the raise is complete.
//!
//! Completing the raise starts the unlock-wait task (see [`crate::unlock`]).

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{error, info};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::ledger::{self, Asset};
use crate::notify::{Notification, NotificationKind};
use crate::types::{InvestmentType, Project, ProjectIndex, User};

/// Operator channel for admin alerts.
pub const ADMIN_CHANNEL: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Seed,
    Primary,
}

impl Engine {
    /// Invest `amount` of stablecoin. Stages 1 and 2 are redirected to the seed round.
    pub async fn invest(
        self: &Arc<Self>,
        index: ProjectIndex,
        investor_index: u64,
        amount: f64,
        investor_seed: &SecretString,
    ) -> Result<Project> {
        let guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        let round = match project.stage {
            1 | 2 => Round::Seed,
            4 => Round::Primary,
            stage => {
                return Err(EngineError::WrongStage {
                    project: index,
                    stage,
                    required: "1, 2 or 4",
                })
            }
        };
        let completed = self
            .fund_round(&mut project, investor_index, amount, investor_seed, round)
            .await?;
        drop(guard);

        if completed {
            self.on_raise_complete(&project).await;
        }
        Ok(project)
    }

    pub async fn seed_invest(
        self: &Arc<Self>,
        index: ProjectIndex,
        investor_index: u64,
        amount: f64,
        investor_seed: &SecretString,
    ) -> Result<Project> {
        let guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if !matches!(project.stage, 1 | 2) {
            return Err(EngineError::WrongStage {
                project: index,
                stage: project.stage,
                required: "1 or 2",
            });
        }
        let completed = self
            .fund_round(&mut project, investor_index, amount, investor_seed, Round::Seed)
            .await?;
        drop(guard);

        if completed {
            self.on_raise_complete(&project).await;
        }
        Ok(project)
    }

    async fn fund_round(
        &self,
        project: &mut Project,
        investor_index: u64,
        amount: f64,
        investor_seed: &SecretString,
        round: Round,
    ) -> Result<bool> {
        if !(amount > 0.0) {
            return Err(EngineError::InvalidAmount(amount));
        }
        if project.investment_type != InvestmentType::Munibond {
            return Err(EngineError::UnsupportedInvestmentType(
                project.investment_type.as_str().to_string(),
            ));
        }
        if round == Round::Seed && amount > project.seed_investment_cap {
            return Err(EngineError::SeedCapExceeded {
                amount,
                cap: project.seed_investment_cap,
            });
        }

        let user = self.user(investor_index).await?;
        self.pre_investment_check(project, &user, amount).await?;

        let code = match round {
            Round::Seed => project.seed_asset_code.clone().unwrap_or_else(|| {
                ledger::asset_code(ledger::SEED_ASSET_PREFIX, &project.metadata)
            }),
            Round::Primary => project.investor_asset_code.clone().unwrap_or_else(|| {
                ledger::asset_code(ledger::INVESTOR_ASSET_PREFIX, &project.metadata)
            }),
        };
        match round {
            Round::Seed => project.seed_asset_code = Some(code.clone()),
            Round::Primary => project.investor_asset_code = Some(code.clone()),
        }
        self.munibond_invest(project, &user, amount, investor_seed, &code, round)
            .await?;
        self.update_after_investment(project, investor_index, amount, round)
            .await
    }

    /// Checks that must pass before any ledger call, in order.
    pub(crate) async fn pre_investment_check(
        &self,
        project: &mut Project,
        investor: &User,
        amount: f64,
    ) -> Result<()> {
        let available = self
            .ledger
            .balance(&investor.public_key, &self.settings.stablecoin_code)
            .await?;
        if available < amount {
            return Err(EngineError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        if !self.ledger.account_exists(&investor.public_key).await? {
            return Err(EngineError::AccountMissing(investor.public_key.clone()));
        }
        let remaining = project.remaining();
        if amount > remaining {
            return Err(EngineError::ExceedsRemaining { amount, remaining });
        }
        if project.admin_flagged {
            return Err(EngineError::Flagged(project.index));
        }

        if project.issuer_pubkey.is_none() {
            let issuer = self
                .ledger
                .init_issuer(project.index, self.platform_seed())
                .await
                .map_err(|e| e.context("initialising issuer"))?;
            info!("Provisioned issuer {issuer} for project {}", project.index);
            project.investor_asset_code =
                Some(ledger::asset_code(ledger::INVESTOR_ASSET_PREFIX, &project.metadata));
            project.issuer_pubkey = Some(issuer);
            self.save_project(project).await?;
        }
        Ok(())
    }

    /// Stablecoin to the platform, project asset back to the investor.
    async fn munibond_invest(
        &self,
        project: &Project,
        user: &User,
        amount: f64,
        investor_seed: &SecretString,
        code: &str,
        round: Round,
    ) -> Result<()> {
        let memo = format!("investment: {}", project.index);
        let stable_tx = self
            .ledger
            .transfer(
                &self.stablecoin(),
                &user.public_key,
                &self.settings.platform_pubkey,
                amount,
                investor_seed,
                &memo,
            )
            .await
            .map_err(|e| e.context("sending stablecoin to platform"))?;

        let issuer = project.issuer_pubkey.clone().unwrap_or_default();
        let asset = Asset::new(code, issuer);
        let trust_tx = self
            .ledger
            .create_trustline(&asset, &user.public_key, project.total_value, investor_seed)
            .await
            .map_err(|e| e.context("trusting investor asset"))?;
        let asset_tx = self
            .ledger
            .issue_asset(project.index, &asset, &user.public_key, amount)
            .await
            .map_err(|e| e.context("issuing investor asset"))?;
        info!(
            "Investor {} put {amount} into project {} ({round:?}), asset tx {asset_tx}",
            user.index, project.index
        );

        let mut investor = self.investor(user.index).await?;
        investor.amount_invested += amount;
        let projects = match round {
            Round::Seed => &mut investor.seed_invested_projects,
            Round::Primary => &mut investor.invested_projects,
        };
        if !projects.contains(&project.index) {
            projects.push(project.index);
        }
        if !investor.invested_assets.iter().any(|a| a == code) {
            investor.invested_assets.push(code.to_string());
        }
        self.register_investor(&investor).await?;

        self.notify_opted(
            user,
            NotificationKind::InvestmentConfirmed,
            project.index,
            vec![stable_tx, trust_tx, asset_tx],
        )
        .await;
        Ok(())
    }

    /// Returns `true` when this investment completed the raise.
    pub(crate) async fn update_after_investment(
        &self,
        project: &mut Project,
        investor_index: u64,
        amount: f64,
        round: Round,
    ) -> Result<bool> {
        project.money_raised += amount;
        if round == Round::Seed {
            // seed investors are owed their premium on top of the raise
            project.seed_money_raised += amount * (project.seed_investment_factor - 1.0);
        }
        project.investor_indices.push(investor_index);
        self.rebuild_investor_map(project).await?;

        let completed = project.is_fully_raised() && !project.lock && project.escrow_pubkey.is_none();
        if completed {
            project.lock = true;
            info!("Project {} fully raised, locked until recipient unlocks", project.index);
        }
        self.save_project(project).await?;
        Ok(completed)
    }

    /// Ownership fractions from each investor's on-ledger holdings of the
    /// investor and seed assets.
    async fn rebuild_investor_map(&self, project: &mut Project) -> Result<()> {
        let codes: Vec<&String> = project
            .investor_asset_code
            .iter()
            .chain(project.seed_asset_code.iter())
            .collect();

        let mut map = std::collections::BTreeMap::new();
        for investor_index in project.unique_investors() {
            let user = self.user(investor_index).await?;
            let mut held = 0.0;
            for code in &codes {
                held += self.ledger.balance(&user.public_key, code).await?;
            }
            map.insert(user.public_key, held / project.total_value);
        }
        project.investor_map = map;
        Ok(())
    }

    /// Ask the recipient to unlock and start waiting for them.
    async fn on_raise_complete(self: &Arc<Self>, project: &Project) {
        match self.user(project.recipient_index).await {
            Ok(recipient) => {
                self.notify(Notification::new(
                    NotificationKind::UnlockRequest,
                    project.index,
                    recipient.email,
                ))
                .await;
            }
            Err(e) => {
                error!(
                    "Recipient {} of project {} not found: {e}",
                    project.recipient_index, project.index
                );
                self.notify(
                    Notification::new(NotificationKind::RecipientNotFound, project.index, ADMIN_CHANNEL)
                        .with_context(vec![project.recipient_index.to_string()]),
                )
                .await;
            }
        }
        self.spawn_unlock_wait(project.index);
    }
}
