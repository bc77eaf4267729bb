//! # Payback and distribution
//!
//! A recipient's payment moves stablecoin into the project escrow and returns
//! the same amount of debt asset to the issuer. The part of the payment above
//! the period's bill buys ownership:
//!
//! ```text
//! pct             = (amount - bill) / total_value
//! bal_left       -= (1 - pct) * amount
//! amount_owed    -= amount
//! ownership_shift += pct
//! ```
//!
//! Full ownership zeroes the balance; a zero balance ends the project
//! (stage 9). The bookkeeping is saved before investors are paid their
//! `interest_rate * amount` share out of the escrow, one best-effort
//! disbursement per payee.

use std::sync::Arc;

use chrono::Duration;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::ledger::{Asset, TxHash};
use crate::notify::NotificationKind;
use crate::stages::{administrative, FINAL_STAGE};
use crate::types::{InvestmentType, Project, ProjectIndex, Recipient};

/// Days between payment due dates.
const PAYMENT_CYCLE_DAYS: i64 = 28;

/// Outcome of one distribution fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistributionReport {
    pub attempted: usize,
    /// Payee public key and amount sent.
    pub delivered: Vec<(String, f64)>,
    pub failed: Vec<String>,
}

impl DistributionReport {
    pub fn total_delivered(&self) -> f64 {
        self.delivered.iter().map(|(_, amount)| amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaybackReceipt {
    pub project: ProjectIndex,
    pub amount: f64,
    pub bill: f64,
    pub ownership_pct: f64,
    pub bal_left: f64,
    pub ownership_shift: f64,
    pub stage: u8,
    pub stable_tx: TxHash,
    pub debt_tx: TxHash,
    /// `None` when the distribution could not run at all.
    pub distribution: Option<DistributionReport>,
}

/// Projected repayment horizon in months for a regular payment of `amount`.
pub fn calculate_payback(project: &Project, amount: f64) -> f64 {
    amount / project.total_value * f64::from(project.estimated_acquisition) * 12.0
}

/// Apply a payment of `amount` with ownership fraction `pct` to the bookkeeping.
pub(crate) fn apply_payment(project: &mut Project, amount: f64, pct: f64, now: i64) {
    project.bal_left -= (1.0 - pct) * amount;
    project.amount_owed -= amount;
    project.ownership_shift += pct;
    project.date_last_paid = Some(now);

    if project.ownership_shift >= 1.0 {
        project.ownership_shift = 1.0;
        project.bal_left = 0.0;
        project.amount_owed = 0.0;
    }
    if project.bal_left < 0.0 {
        project.bal_left = 0.0;
    }
}

impl Engine {
    /// Bill for the current period from the recipient's reported energy.
    pub fn monthly_bill(&self, recipient: &Recipient) -> f64 {
        if recipient.teller_energy > 0 {
            self.settings.energy_price * recipient.teller_energy as f64 / 1_000_000.0
        } else {
            self.settings.energy_price * self.settings.average_consumption_kwh
        }
    }

    pub async fn payback(
        self: &Arc<Self>,
        recipient_index: u64,
        index: ProjectIndex,
        amount: f64,
        recipient_seed: &SecretString,
    ) -> Result<PaybackReceipt> {
        if !(amount > 0.0) {
            return Err(EngineError::InvalidAmount(amount));
        }

        let guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.recipient_index != recipient_index {
            return Err(EngineError::RoleMismatch {
                role: "recipient",
                index: recipient_index,
                project: index,
            });
        }
        if project.investment_type != InvestmentType::Munibond {
            return Err(EngineError::UnsupportedInvestmentType(
                project.investment_type.as_str().to_string(),
            ));
        }
        let escrow = project
            .escrow_pubkey
            .clone()
            .ok_or(EngineError::EscrowInactive(index))?;

        let mut recipient = self.recipient(recipient_index).await?;
        let user = self.user(recipient_index).await?;
        let bill = self.monthly_bill(&recipient);
        if amount < bill {
            return Err(EngineError::BelowBill { amount, bill });
        }
        let available = self
            .ledger
            .balance(&user.public_key, &self.settings.stablecoin_code)
            .await?;
        if available < amount {
            return Err(EngineError::InsufficientBalance {
                needed: amount,
                available,
            });
        }

        let memo = format!("payback: {index}");
        let stable_tx = self
            .ledger
            .transfer(&self.stablecoin(), &user.public_key, &escrow, amount, recipient_seed, &memo)
            .await
            .map_err(|e| e.context("paying stablecoin into escrow"))?;
        let issuer = project.issuer_pubkey.clone().unwrap_or_default();
        let debt = Asset::new(project.debt_asset_code.clone().unwrap_or_default(), issuer.clone());
        let debt_tx = self
            .ledger
            .transfer(&debt, &user.public_key, &issuer, amount, recipient_seed, &memo)
            .await
            .map_err(|e| e.context("returning debt asset"))?;

        let pct = (amount - bill) / project.total_value;
        let now = Engine::now();
        apply_payment(&mut project, amount, pct, now);
        info!(
            "Recipient {recipient_index} paid {amount} on project {index}: bill {bill}, ownership +{pct}, balance {}",
            project.bal_left
        );
        if project.bal_left <= 0.0 && project.stage < FINAL_STAGE {
            self.apply_stage(&mut project, FINAL_STAGE, administrative("payback_complete"))
                .await?;
        } else {
            self.save_project(&project).await?;
        }

        recipient.teller_energy = 0;
        recipient.next_payment_interval = Some(now + Duration::days(PAYMENT_CYCLE_DAYS).num_seconds());
        self.register_recipient(&recipient).await?;
        drop(guard);

        let context = vec![stable_tx.clone(), debt_tx.clone()];
        self.notify_opted(&user, NotificationKind::PaybackReceipt, index, context.clone())
            .await;
        for investor in project.unique_investors() {
            match self.user(investor).await {
                Ok(inv) => {
                    self.notify_opted(&inv, NotificationKind::PaybackReceipt, index, context.clone())
                        .await
                }
                Err(e) => warn!("Skipping payback notice to investor {investor}: {e}"),
            }
        }

        let distribution = match self.distribute_payments(index, amount, recipient_seed).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Distribution for project {index} did not run: {e}");
                None
            }
        };

        Ok(PaybackReceipt {
            project: index,
            amount,
            bill,
            ownership_pct: pct,
            bal_left: project.bal_left,
            ownership_shift: project.ownership_shift,
            stage: project.stage,
            stable_tx,
            debt_tx,
            distribution,
        })
    }

    /// Pay each investor their share of `interest_rate * amount` from the escrow.
    ///
    /// A failing payee is logged and skipped; the others are still paid.
    pub async fn distribute_payments(
        &self,
        index: ProjectIndex,
        amount: f64,
        signer: &SecretString,
    ) -> Result<DistributionReport> {
        let project = self.project(index).await?;
        let escrow = match (&project.escrow_pubkey, project.escrow_active) {
            (Some(escrow), true) => escrow.clone(),
            _ => return Err(EngineError::EscrowInactive(index)),
        };
        let _escrow = self.escrow_locks.acquire(index).await;

        let rate = if project.interest_rate > 0.0 {
            project.interest_rate
        } else {
            self.settings.default_interest_rate
        };
        let given_back = rate * amount;
        let stablecoin = self.stablecoin();
        let memo = format!("returns: {index}");

        let mut report = DistributionReport {
            attempted: project.investor_map.len(),
            ..Default::default()
        };
        for (pubkey, fraction) in &project.investor_map {
            let share = fraction * given_back;
            match self
                .escrow
                .disburse(&escrow, pubkey, signer, share, &memo, &stablecoin)
                .await
            {
                Ok(tx) => {
                    info!("Sent {share} to investor {pubkey} ({tx})");
                    report.delivered.push((pubkey.clone(), share));
                }
                Err(e) => {
                    warn!("Could not pay investor {pubkey} from escrow {escrow}: {e}");
                    report.failed.push(pubkey.clone());
                }
            }
        }
        Ok(report)
    }

    pub async fn calculate_payback(&self, index: ProjectIndex, amount: f64) -> Result<f64> {
        Ok(calculate_payback(&self.project(index).await?, amount))
    }

    /// Let a waterfall payee draw part of its entitlement from the escrow.
    pub async fn request_waterfall_withdrawal(
        self: &Arc<Self>,
        entity_index: u64,
        index: ProjectIndex,
        amount: f64,
        recipient_seed: &SecretString,
    ) -> Result<TxHash> {
        if !(amount > 0.0) {
            return Err(EngineError::InvalidAmount(amount));
        }
        self.entity(entity_index).await?;
        let payee = self.user(entity_index).await?.public_key;

        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        if project.admin_flagged {
            return Err(EngineError::Flagged(index));
        }
        let entitled = *project
            .waterfall_map
            .get(&payee)
            .ok_or_else(|| EngineError::WaterfallPayeeMissing(payee.clone()))?;
        if amount > entitled {
            return Err(EngineError::WaterfallExceeded { amount, entitled });
        }
        let escrow = match (&project.escrow_pubkey, project.escrow_active) {
            (Some(escrow), true) => escrow.clone(),
            _ => return Err(EngineError::EscrowInactive(index)),
        };

        let _escrow = self.escrow_locks.acquire(index).await;
        let available = self
            .ledger
            .balance(&escrow, &self.settings.stablecoin_code)
            .await?;
        if available < amount {
            return Err(EngineError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        let tx = self
            .escrow
            .disburse(
                &escrow,
                &payee,
                recipient_seed,
                amount,
                &format!("waterfall: {index}"),
                &self.stablecoin(),
            )
            .await
            .map_err(|e| e.context("waterfall withdrawal"))?;

        project.waterfall_map.insert(payee.clone(), entitled - amount);
        self.save_project(&project).await?;
        info!("Waterfall payee {payee} withdrew {amount} from project {index}");
        Ok(tx)
    }
}
