//! Notification delivery.
//!
//! Notifications are fire-and-forget: [`crate::engine::Engine::notify`] logs
//! delivery failures and never lets them block business logic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::errors::Result;
use crate::types::ProjectIndex;

/// All notification kinds the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Raise complete; the recipient should unlock the project.
    UnlockRequest,
    InvestmentConfirmed,
    AssetsIssued,
    PaybackReceipt,
    PaymentReminder,
    /// Gentle tier, to the recipient.
    GentlePaybackAlert,
    /// Stern tier, to the recipient.
    SternPaybackAlert,
    SternPaybackAlertInvestor,
    SternPaybackAlertGuarantor,
    DisconnectionInvestor,
    DisconnectionGuarantor,
    /// Operator alert: the project's recipient could not be found.
    RecipientNotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub project: ProjectIndex,
    /// Email address, or the operator channel for admin alerts.
    pub to: String,
    /// Transaction hashes or other details to include.
    pub context: Vec<String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, project: ProjectIndex, to: impl Into<String>) -> Self {
        Self {
            kind,
            project,
            to: to.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: Notification) -> Result<()> {
        info!(
            kind = ?n.kind,
            project = n.project,
            to = %n.to,
            "notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook (mail relay, chat bridge, ...).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, n: Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&n)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serialises_kind_as_snake_case() {
        let n = Notification::new(NotificationKind::SternPaybackAlertGuarantor, 4, "g@x.io")
            .with_context(vec!["tx1".into()]);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "stern_payback_alert_guarantor");
        assert_eq!(json["project"], 4);
        assert_eq!(json["context"][0], "tx1");
    }
}
