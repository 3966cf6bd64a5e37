use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::NotificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    Success,
    Error,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    kind: NotifyKind,
    message: &'a str,
    timestamp: String,
}

/// Run notifications. Always logged; also POSTed to the webhook when one is
/// configured and the kind is enabled.
pub struct Notifier {
    cfg: NotificationConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(cfg: NotificationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { cfg, client }
    }

    pub fn wants(&self, kind: NotifyKind) -> bool {
        if !self.cfg.enabled || self.cfg.webhook_url.trim().is_empty() {
            return false;
        }
        match kind {
            NotifyKind::Success => self.cfg.notify_on_success,
            NotifyKind::Error => self.cfg.notify_on_error,
        }
    }

    pub async fn send(&self, kind: NotifyKind, message: &str) {
        match kind {
            NotifyKind::Success => info!("[NOTIFY] {message}"),
            NotifyKind::Error => warn!("[NOTIFY] {message}"),
        }
        if !self.wants(kind) {
            return;
        }

        let payload = WebhookPayload {
            kind,
            message,
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        let sent = self
            .client
            .post(&self.cfg.webhook_url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = sent {
            warn!("Webhook notification failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(enabled: bool, url: &str) -> NotificationConfig {
        NotificationConfig {
            enabled,
            webhook_url: url.to_string(),
            notify_on_error: true,
            notify_on_success: false,
        }
    }

    #[test]
    fn webhook_needs_enabled_url_and_kind() {
        assert!(!Notifier::new(cfg(false, "http://hook.test")).wants(NotifyKind::Error));
        assert!(!Notifier::new(cfg(true, " ")).wants(NotifyKind::Error));

        let n = Notifier::new(cfg(true, "http://hook.test"));
        assert!(n.wants(NotifyKind::Error));
        assert!(!n.wants(NotifyKind::Success));
    }

    #[tokio::test]
    async fn disabled_notifier_only_logs() {
        Notifier::new(cfg(false, "")).send(NotifyKind::Error, "boom").await;
    }
}
