//! # Stages
//!
//! The ten-stage project lifecycle and the two ways a project moves through
//! it:
//!
//! | Operation              | Gate                                        |
//! |------------------------|---------------------------------------------|
//! | [`Engine::stage_x_to_y`] | every activity of the current stage attested |
//! | [`Engine::set_stage`]    | none (administrative path)                  |
//!
//! ```text
//! 0 Handshake ─► 1 Engagement ─► 2 Quotes ─► 3 Signing ─► 4 Raise
//!   ─► 5 Construction ─► 6 Interconnection ─► 7 Legacy ─► 8 Handoff ─► 9 End of Life
//! ```
//!
//! Entering stage 3, 5 or 6 pays out reputation (see [`crate::reputation`]).
//! Every change is appended to `Project::stage_history` with its reason, so
//! changes that skipped the checklist stay visible.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::reputation::ReputationRole;
use crate::types::{Project, ProjectIndex, StageChange, StageChangeReason};

pub const FINAL_STAGE: u8 = 9;

/// Immutable catalog entry.
#[derive(Debug, Serialize)]
pub struct Stage {
    pub number: u8,
    pub friendly_name: &'static str,
    pub name: &'static str,
    /// Checklist items that must be attested before leaving this stage.
    pub activities: &'static [&'static str],
    pub state_trigger: &'static [&'static str],
    pub breach_condition: &'static [&'static str],
}

pub static STAGES: [Stage; 10] = [
    Stage {
        number: 0,
        friendly_name: "Handshake",
        name: "Idea Consolidation",
        activities: &[
            "Originator proposes the project and secures a solar developer, or serves as one",
            "Solar developer produces a general estimate of the project",
            "Host states legal ownership of the site if the originator is not the landowner",
        ],
        state_trigger: &["Originator and recipient are matched and approve the intent"],
        breach_condition: &[],
    },
    Stage {
        number: 1,
        friendly_name: "Engagement",
        name: "RFP Development",
        activities: &[
            "Solar developer analyses parameters and builds the financial model",
            "Host and developer engage legal counsel and scope the site",
            "Solar developer creates the request for proposal",
            "Simple projects: automatic calculation",
            "Complex projects: third-party RFP consultant",
            "Originator, developer and offtaker post the project for RFP",
            "Beneficiary selects the RFP developer",
            "First angel investment option is offered",
            "Time banking is allowed as sweat equity",
        ],
        state_trigger: &[
            "An RFP is issued",
            "Letter of intent between originator and developer",
        ],
        breach_condition: &[],
    },
    Stage {
        number: 2,
        friendly_name: "Quotes",
        name: "Actions",
        activities: &[
            "Developer, offtaker and legal negotiate the PPA model",
            "Originator and beneficiary compare bidder quotes",
            "Quotes for engineering, procurement and construction",
            "Quotes for hardware vendors",
            "Quotes for insurers",
            "Quotes for the issuer",
            "Quotes for the intermediary portal",
            "Negotiation with the utility begins",
            "Developer checks whether site upgrades are necessary",
            "Developer and host prepare permitting submissions",
            "Angel incorporation",
        ],
        state_trigger: &[
            "Quotes and vendors are selected",
            "Installers and offtaker are identified",
        ],
        breach_condition: &[],
    },
    Stage {
        number: 3,
        friendly_name: "Signing",
        name: "Contract Execution",
        activities: &[
            "Developer pays legal for PPA finalisation",
            "Developer and host sign the site lease",
            "Developer or issuer signs the offering agreement with the portal",
            "Developer and beneficiary sign supplier contracts",
            "Contract with engineering, procurement and construction",
            "Contract with hardware vendors",
            "Contract with insurers",
            "Contract with the issuer or portal",
            "EPC contracts are signed",
            "PPA or offtake agreement is signed",
            "Second stage of eligible funding",
            "Downpayment to engineering, procurement and construction",
            "Investor risk profile",
        ],
        state_trigger: &["Contracts are executed"],
        breach_condition: &[],
    },
    Stage {
        number: 4,
        friendly_name: "The Raise",
        name: "Finance and Capitalization",
        activities: &[
            "Issuer engages the portal to develop the offering document",
            "Portal lists the project",
            "Originator, developer and offtaker market the offering",
            "Investors commit capital",
            "Portal closes the offering and disburses capital from escrow",
            "Issuer passes funds to the developer when they differ",
        ],
        state_trigger: &["Project account receives funds covering the raise amount"],
        breach_condition: &[],
    },
    Stage {
        number: 5,
        friendly_name: "Construction",
        name: "Payments and Construction",
        activities: &[
            "Developer coordinates installation dates with host and offtakers",
            "Equipment is delivered by the vendor",
            "Utility issues conditional interconnection",
            "Developer schedules installation",
            "Installation is completed",
            "Developer pays for substantial completion",
            "Insurer verifies the policy and is paid",
            "Investor role is confirmed",
        ],
        state_trigger: &[
            "Installation reaches substantial completion",
            "IoT devices detect energy generation",
        ],
        breach_condition: &[],
    },
    Stage {
        number: 6,
        friendly_name: "Interconnection",
        name: "Contract Execution",
        activities: &[
            "Developer schedules interconnection with the utility",
            "As-built drawings are submitted to inspectors",
            "Building inspector visit is scheduled",
            "Utility performs the witness test",
            "Utility places the project in service",
        ],
        state_trigger: &["Utility places the project in service"],
        breach_condition: &[],
    },
    Stage {
        number: 7,
        friendly_name: "Legacy",
        name: "Operation and Management",
        activities: &[
            "Developer hires or becomes the manager",
            "Manager hires an operations and maintenance provider",
            "Manager sets up billing and collects payments",
            "Manager monitors for payment and contract breaches",
            "Manager files annual taxes",
            "Manager handles the annual net-metering true-up",
            "Manager makes annual distributions to investors",
            "Manager executes the ownership flip if applicable",
            "System performance is monitored and maintained",
            "Inverters are replaced as needed",
            "Investors may use the secondary market",
        ],
        state_trigger: &["Investors reach the preferred return or the flip date"],
        breach_condition: &["Offtaker fails to pay for energy after the due period"],
    },
    Stage {
        number: 8,
        friendly_name: "Handoff",
        name: "Ownership Flip",
        activities: &[
            "Beneficiary payments cover the investor principal",
            "Escrow pays off the principal to investors",
        ],
        state_trigger: &[
            "Beneficiary becomes full legal owner of the assets",
            "Investors exit the project",
        ],
        breach_condition: &[],
    },
    Stage {
        number: 9,
        friendly_name: "End of Life",
        name: "Disposal",
        activities: &[
            "Equipment generates below the productivity threshold",
            "Equipment is sent to a recycling program",
            "Recycler certifies receipt",
        ],
        state_trigger: &["Project termination", "Wallet terminations"],
        breach_condition: &[],
    },
];

pub fn stage(number: u8) -> Option<&'static Stage> {
    STAGES.get(number as usize)
}

/// Check the attestation containers of `project` for its current stage.
pub fn check_promotable(project: &Project) -> Result<()> {
    let current = project.stage;
    if current >= FINAL_STAGE {
        return Err(EngineError::StageOutOfBounds(current));
    }
    let (Some(checklist), Some(data)) = (&project.stage_checklist, &project.stage_data) else {
        return Err(EngineError::ChecklistMissing(project.index));
    };
    let base = stage(current).ok_or(EngineError::StageOutOfBounds(current))?;

    let items = checklist.get(current as usize).map(Vec::as_slice).unwrap_or(&[]);
    if items.len() != base.activities.len() {
        return Err(EngineError::ChecklistLengthMismatch {
            stage: current,
            got: items.len(),
            expected: base.activities.len(),
        });
    }
    if data.get(current as usize).map_or(true, Vec::is_empty) {
        return Err(EngineError::StageDataEmpty(current));
    }
    if !items.iter().all(|done| *done) {
        return Err(EngineError::ChecklistIncomplete(current));
    }
    Ok(())
}

impl Engine {
    /// Promote `index` from its current stage to the next one, provided every
    /// activity of the current stage has been attested.
    pub async fn stage_x_to_y(self: &Arc<Self>, index: ProjectIndex) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;

        if let Err(e) = check_promotable(&project) {
            warn!("Project {index} cannot leave stage {}: {e}", project.stage);
            return Err(e);
        }
        let next = project.stage + 1;
        info!("Upgrading project {index} from stage {} to {next}", project.stage);
        self.apply_stage(&mut project, next, StageChangeReason::Checklist)
            .await?;
        Ok(project)
    }

    /// Set the stage of `index` directly, bypassing the checklist.
    pub async fn set_stage(self: &Arc<Self>, index: ProjectIndex, number: u8) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        self.apply_stage(&mut project, number, administrative("set_stage"))
            .await?;
        Ok(project)
    }

    /// Stage change on an already locked and loaded project: reputation side
    /// effects first, then the stage is written. A failing side effect aborts
    /// before anything is saved.
    pub(crate) async fn apply_stage(
        &self,
        project: &mut Project,
        number: u8,
        reason: StageChangeReason,
    ) -> Result<()> {
        if number > FINAL_STAGE {
            return Err(EngineError::StageOutOfBounds(number));
        }
        if let StageChangeReason::Administrative { path } = &reason {
            warn!(
                "Project {} moved from stage {} to {number} without checklist ({path})",
                project.index, project.stage
            );
        }

        match number {
            3 => {
                // price is final now
                project.reputation = project.total_value;
                self.reward_originator(project).await?;
            }
            5 => {
                if let Some(contractor) = project.contractor_index {
                    self.reward(ReputationRole::Contractor, contractor, project.total_value)
                        .await?;
                }
                for investor in project.unique_investors() {
                    self.reward(ReputationRole::Investor, investor, project.total_value)
                        .await?;
                }
            }
            6 => {
                self.reward(
                    ReputationRole::Recipient,
                    project.recipient_index,
                    project.total_value,
                )
                .await?;
            }
            _ => {}
        }

        project.stage_history.push(StageChange {
            from: project.stage,
            to: number,
            at: Engine::now(),
            reason,
        });
        project.stage = number;
        self.save_project(project).await?;

        if project.is_terminal() {
            self.tasks.stop(project.index);
        }
        Ok(())
    }

    /// Attest (or retract) one activity of `stage`.
    pub async fn record_checklist_item(
        self: &Arc<Self>,
        index: ProjectIndex,
        stage_number: u8,
        item: usize,
        done: bool,
    ) -> Result<()> {
        let base = stage(stage_number).ok_or(EngineError::StageOutOfBounds(stage_number))?;
        if item >= base.activities.len() {
            return Err(EngineError::ChecklistLengthMismatch {
                stage: stage_number,
                got: item + 1,
                expected: base.activities.len(),
            });
        }

        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        let checklist = project.stage_checklist.get_or_insert_with(Vec::new);
        if checklist.len() <= stage_number as usize {
            checklist.resize(stage_number as usize + 1, Vec::new());
        }
        let items = &mut checklist[stage_number as usize];
        if items.len() != base.activities.len() {
            items.resize(base.activities.len(), false);
        }
        items[item] = done;
        self.save_project(&project).await
    }

    /// Attach a payload (document hash, contract reference, ...) to `stage`.
    pub async fn attach_stage_data(
        self: &Arc<Self>,
        index: ProjectIndex,
        stage_number: u8,
        payload: impl Into<String>,
    ) -> Result<()> {
        if stage(stage_number).is_none() {
            return Err(EngineError::StageOutOfBounds(stage_number));
        }
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        let data = project.stage_data.get_or_insert_with(Vec::new);
        if data.len() <= stage_number as usize {
            data.resize(stage_number as usize + 1, Vec::new());
        }
        data[stage_number as usize].push(payload.into());
        self.save_project(&project).await
    }
}

pub(crate) fn administrative(path: &str) -> StageChangeReason {
    StageChangeReason::Administrative {
        path: path.to_string(),
    }
}
