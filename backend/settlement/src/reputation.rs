//! Reputation accounting.
//!
//! Each role earns a fixed share of a project's `total_value` when the project
//! crosses the stage that role is responsible for. The weights are a closed
//! constant set, not configurable per project.

use std::sync::Arc;

use tracing::info;

use crate::engine::Engine;
use crate::errors::Result;
use crate::types::Project;

/// Share of a contract's value removed when an entity reneges.
pub const SLASH_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationRole {
    Investor,
    Originator,
    Contractor,
    Developer,
    Recipient,
}

impl ReputationRole {
    pub const fn weight(self) -> f64 {
        match self {
            Self::Investor => 0.1,
            Self::Originator => 0.1,
            Self::Contractor => 0.3,
            Self::Developer => 0.2,
            Self::Recipient => 0.3,
        }
    }

    /// Reputation earned on a project worth `total_value`.
    pub fn reward(self, total_value: f64) -> f64 {
        total_value * self.weight()
    }
}

impl Engine {
    pub(crate) async fn reward(
        &self,
        role: ReputationRole,
        user_index: u64,
        total_value: f64,
    ) -> Result<()> {
        let delta = role.reward(total_value);
        self.identity
            .change_reputation(user_index, delta)
            .await
            .map_err(|e| e.context("changing reputation"))?;
        info!("{role:?} {user_index} reputation +{delta}");
        Ok(())
    }

    /// Originator reward, applied at authorisation and again once the price is fixed.
    pub(crate) async fn reward_originator(&self, project: &Project) -> Result<()> {
        match project.originator_index {
            Some(orig) => {
                self.reward(ReputationRole::Originator, orig, project.total_value)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Reduce an entity's reputation by [`SLASH_RATE`] of the contract it reneged on.
    pub async fn slash(self: &Arc<Self>, entity_index: u64, contract_value: f64) -> Result<()> {
        // make sure it's an entity, not an arbitrary user
        self.entity(entity_index).await?;
        let delta = -contract_value * SLASH_RATE;
        self.identity
            .change_reputation(entity_index, delta)
            .await
            .map_err(|e| e.context("slashing reputation"))?;
        info!("Entity {entity_index} slashed by {}", -delta);
        Ok(())
    }
}
