//! Origination, moderation and entity bookkeeping.
//!
//! These operations feed the lifecycle: an originated project (stage 0) is
//! authorised by its recipient (stage 1), contractors propose bids against it
//! (stage 2), investors vote on bids, and users or admins may report and flag
//! projects, which closes them to investment.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::secrets::CredentialSlot;
use crate::stages::administrative;
use crate::store;
use crate::types::{AuctionType, Entity, EntityRole, InvestmentType, Project, ProjectIndex};

pub const ONE_WEEK_SECS: u64 = 7 * 24 * 60 * 60;

/// Financial terms an originator fixes for a project. Bids inherit them.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectTerms {
    pub investment_type: InvestmentType,
    /// Time the recipient has between payments.
    pub payback_period_secs: u64,
    /// Share of each payment returned to investors; zero uses the engine default.
    pub interest_rate: f64,
    pub seed_investment_cap: f64,
    pub seed_investment_factor: f64,
}

impl Default for ProjectTerms {
    fn default() -> Self {
        Self {
            investment_type: InvestmentType::Munibond,
            payback_period_secs: ONE_WEEK_SECS,
            interest_rate: 0.0,
            seed_investment_cap: 0.0,
            seed_investment_factor: 1.0,
        }
    }
}

impl ProjectTerms {
    /// Terms with a payback period of `weeks` weeks.
    pub fn weekly(weeks: u64) -> Self {
        Self {
            payback_period_secs: weeks.saturating_mul(ONE_WEEK_SECS),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.payback_period_secs == 0 {
            return Err(EngineError::InvalidTerms("payback period must be positive"));
        }
        if !(0.0..1.0).contains(&self.interest_rate) {
            return Err(EngineError::InvalidTerms("interest rate must be in [0, 1)"));
        }
        if !(self.seed_investment_cap >= 0.0 && self.seed_investment_cap.is_finite()) {
            return Err(EngineError::InvalidTerms("seed cap must be non-negative"));
        }
        if !(self.seed_investment_factor >= 1.0 && self.seed_investment_factor.is_finite()) {
            return Err(EngineError::InvalidTerms("seed factor must be at least 1"));
        }
        Ok(())
    }

    fn apply(&self, project: &mut Project) {
        project.investment_type = self.investment_type;
        project.payback_period_secs = self.payback_period_secs;
        project.interest_rate = self.interest_rate;
        project.seed_investment_cap = self.seed_investment_cap;
        project.seed_investment_factor = self.seed_investment_factor;
    }
}

/// A contractor's bid against an originated project.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub contractor_index: u64,
    pub total_value: f64,
    /// Years until the recipient owns the asset outright.
    pub years: u32,
    pub auction_type: AuctionType,
    /// Overrides the originated project's payback period when set.
    pub payback_period_secs: Option<u64>,
    pub metadata: String,
}

fn positive(amount: f64) -> Result<()> {
    if amount > 0.0 && amount.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidAmount(amount))
    }
}

fn require_role(entity: &Entity, role: EntityRole, project: ProjectIndex) -> Result<()> {
    if entity.role == role {
        return Ok(());
    }
    Err(EngineError::RoleMismatch {
        role: match role {
            EntityRole::Originator => "originator",
            EntityRole::Contractor => "contractor",
            EntityRole::Developer => "developer",
            EntityRole::Guarantor => "guarantor",
        },
        index: entity.index,
        project,
    })
}

impl Engine {
    /// Create a stage-0 project for `recipient_index`.
    pub async fn originate(
        self: &Arc<Self>,
        originator_index: u64,
        recipient_index: u64,
        total_value: f64,
        terms: ProjectTerms,
        metadata: &str,
    ) -> Result<Project> {
        positive(total_value)?;
        terms.validate()?;
        let originator = self.entity(originator_index).await?;
        require_role(&originator, EntityRole::Originator, 0)?;
        self.recipient(recipient_index).await?;

        let _creating = self.creation.lock().await;
        let index = store::next_index::<Project>(self.store.as_ref()).await?;
        let mut project = Project::new(index, total_value, recipient_index, metadata, Engine::now());
        project.originator_index = Some(originator_index);
        project.reputation = total_value;
        terms.apply(&mut project);
        self.save_project(&project).await?;

        info!(
            "Originator {originator_index} originated project {index} worth {total_value}, paid back every {}s",
            terms.payback_period_secs
        );
        Ok(project)
    }

    /// Recipient accepts an originated project, moving it from stage 0 to 1.
    pub async fn recipient_authorize(
        self: &Arc<Self>,
        index: ProjectIndex,
        recipient_index: u64,
    ) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.stage != 0 {
            return Err(EngineError::WrongStage {
                project: index,
                stage: project.stage,
                required: "0",
            });
        }
        if project.recipient_index != recipient_index {
            return Err(EngineError::RoleMismatch {
                role: "recipient",
                index: recipient_index,
                project: index,
            });
        }
        if let Some(orig) = project.originator_index {
            let user = self.user(orig).await?;
            if !user.kyc || user.banned {
                return Err(EngineError::OriginatorNotVerified(orig));
            }
        }

        self.reward_originator(&project).await?;
        self.apply_stage(&mut project, 1, administrative("recipient_authorize"))
            .await?;
        info!("Recipient {recipient_index} authorised project {index}");
        Ok(project)
    }

    /// Create a stage-2 bid against `originated`, inheriting its recipient and terms.
    pub async fn propose(
        self: &Arc<Self>,
        originated: ProjectIndex,
        proposal: Proposal,
    ) -> Result<Project> {
        positive(proposal.total_value)?;
        if proposal.payback_period_secs == Some(0) {
            return Err(EngineError::InvalidTerms("payback period must be positive"));
        }
        let contractor = self.entity(proposal.contractor_index).await?;
        require_role(&contractor, EntityRole::Contractor, originated)?;

        let base = self.project(originated).await?;
        if base.stage > 1 {
            return Err(EngineError::WrongStage {
                project: originated,
                stage: base.stage,
                required: "0 or 1",
            });
        }

        let _creating = self.creation.lock().await;
        let index = store::next_index::<Project>(self.store.as_ref()).await?;
        let mut project = Project::new(
            index,
            proposal.total_value,
            base.recipient_index,
            proposal.metadata,
            Engine::now(),
        );
        project.stage = 2;
        project.reputation = proposal.total_value;
        project.contractor_index = Some(proposal.contractor_index);
        project.originator_index = base.originator_index;
        project.guarantor_index = base.guarantor_index;
        project.estimated_acquisition = proposal.years;
        project.auction_type = proposal.auction_type;
        project.investment_type = base.investment_type;
        project.payback_period_secs = proposal
            .payback_period_secs
            .unwrap_or(base.payback_period_secs);
        project.interest_rate = base.interest_rate;
        project.seed_investment_cap = base.seed_investment_cap;
        project.seed_investment_factor = base.seed_investment_factor;
        self.save_project(&project).await?;

        info!(
            "Contractor {} proposed project {index} against {originated} at {}",
            proposal.contractor_index, proposal.total_value
        );
        Ok(project)
    }

    /// Attach a guarantor to a project that has not been funded yet.
    pub async fn assign_guarantor(
        self: &Arc<Self>,
        index: ProjectIndex,
        guarantor_index: u64,
    ) -> Result<Project> {
        let guarantor = self.entity(guarantor_index).await?;
        require_role(&guarantor, EntityRole::Guarantor, index)?;

        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.stage > 4 || project.escrow_pubkey.is_some() {
            return Err(EngineError::WrongStage {
                project: index,
                stage: project.stage,
                required: "0 to 4",
            });
        }
        project.guarantor_index = Some(guarantor_index);
        self.save_project(&project).await?;
        info!("Guarantor {guarantor_index} assigned to project {index}");
        Ok(project)
    }

    /// Spend `votes` of an investor's voting balance on a stage-2 bid.
    pub async fn vote(
        self: &Arc<Self>,
        index: ProjectIndex,
        investor_index: u64,
        votes: f64,
    ) -> Result<Project> {
        positive(votes)?;
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.stage != 2 {
            return Err(EngineError::WrongStage {
                project: index,
                stage: project.stage,
                required: "2",
            });
        }
        let mut investor = self.investor(investor_index).await?;
        if votes > investor.voting_balance {
            return Err(EngineError::VotingBalanceExceeded {
                votes,
                balance: investor.voting_balance,
            });
        }

        investor.voting_balance -= votes;
        project.votes += votes;
        self.register_investor(&investor).await?;
        self.save_project(&project).await?;
        Ok(project)
    }

    /// Record a user report. Repeated reports by the same user count once.
    pub async fn report_project(
        self: &Arc<Self>,
        index: ProjectIndex,
        user_index: u64,
    ) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.user_flagged_by.contains(&user_index) {
            return Ok(project);
        }
        project.user_flagged_by.push(user_index);
        project.reports += 1;
        self.save_project(&project).await?;
        Ok(project)
    }

    /// Admin flag; only allowed once enough users reported the project.
    pub async fn flag_project(
        self: &Arc<Self>,
        index: ProjectIndex,
        admin_index: u64,
    ) -> Result<Project> {
        let admin = self.user(admin_index).await?;
        if !admin.admin {
            return Err(EngineError::RoleMismatch {
                role: "admin",
                index: admin_index,
                project: index,
            });
        }

        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.reports < self.settings.report_threshold {
            return Err(EngineError::ReportThresholdNotReached(index));
        }
        project.admin_flagged = true;
        project.flagged_by = Some(admin_index);
        self.save_project(&project).await?;
        info!("Project {index} flagged by admin {admin_index}");
        Ok(project)
    }

    pub async fn add_collateral(
        self: &Arc<Self>,
        entity_index: u64,
        amount: f64,
        data: impl Into<String>,
    ) -> Result<Entity> {
        positive(amount)?;
        let mut entity = self.entity(entity_index).await?;
        entity.collateral += amount;
        entity.collateral_data.push(data.into());
        self.register_entity(&entity).await?;
        Ok(entity)
    }

    /// Pledge first-loss cover. `secret` must unlock the guarantor's wallet; it
    /// is kept in the vault for [`Engine::cover_first_loss`].
    pub async fn add_first_loss_guarantee(
        self: &Arc<Self>,
        entity_index: u64,
        secret: SecretString,
        amount: f64,
    ) -> Result<Entity> {
        positive(amount)?;
        let _pledge = self.entity_locks.acquire(entity_index).await;
        let mut entity = self.entity(entity_index).await?;
        require_role(&entity, EntityRole::Guarantor, 0)?;
        let user = self.user(entity_index).await?;
        self.unlock_seed(&user, &secret).await?;

        self.vault.stage(CredentialSlot::FirstLoss, entity_index, secret);
        entity.first_loss_guarantee_amt = amount;
        self.register_entity(&entity).await?;
        info!("Guarantor {entity_index} pledged {amount} first-loss cover");
        Ok(entity)
    }

    /// Add (or top up) a secondary payee entitled to draw from the escrow.
    pub async fn add_waterfall_account(
        self: &Arc<Self>,
        index: ProjectIndex,
        pubkey: &str,
        amount: f64,
    ) -> Result<Project> {
        positive(amount)?;
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        *project.waterfall_map.entry(pubkey.to_string()).or_insert(0.0) += amount;
        self.save_project(&project).await?;
        Ok(project)
    }

    /// Stop all disbursements from the project's escrow.
    pub async fn freeze_escrow(self: &Arc<Self>, index: ProjectIndex) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        project.escrow_active = false;
        self.save_project(&project).await?;
        info!("Escrow of project {index} frozen");
        Ok(project)
    }

    /// Pre-register the recipient's password so a completed raise unlocks
    /// without waiting for the recipient.
    pub async fn set_one_time_unlock(
        self: &Arc<Self>,
        index: ProjectIndex,
        recipient_index: u64,
        secret: SecretString,
    ) -> Result<()> {
        let project = self.project(index).await?;
        if project.recipient_index != recipient_index {
            return Err(EngineError::RoleMismatch {
                role: "recipient",
                index: recipient_index,
                project: index,
            });
        }
        let user = self.user(recipient_index).await?;
        self.unlock_seed(&user, &secret).await?;
        self.vault.stage(CredentialSlot::OneTimeUnlock, index, secret);
        Ok(())
    }
}
