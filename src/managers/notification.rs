//! Outcome notifications.
//!
//! Sinks are keyed by a stable id per concern ("snapshot/<game>",
//! "retention", ...) so a later notification about the same concern
//! replaces the earlier one instead of stacking up during long sessions.

use crate::config::{NotificationConfig, NotificationLevel};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Destination for user-facing outcome messages. Implementations must not
/// fail the operation they report on.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, id: &str, message: &str, severity: Severity);
}

/// Logs notifications through tracing, honoring the configured verbosity.
/// Errors always pass regardless of level.
pub struct ConsoleNotifier {
    min_severity: Severity,
}

impl ConsoleNotifier {
    pub fn new(level: NotificationLevel) -> Self {
        let min_severity = match level {
            NotificationLevel::Verbose => Severity::Info,
            NotificationLevel::Summary => Severity::Warning,
            NotificationLevel::ErrorsOnly => Severity::Error,
        };
        Self { min_severity }
    }
}

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, id: &str, message: &str, severity: Severity) {
        if severity < self.min_severity {
            return;
        }
        match severity {
            Severity::Info => info!("[{}] {}", id, message),
            Severity::Warning => warn!("[{}] {}", id, message),
            Severity::Error => error!("[{}] {}", id, message),
        }
    }
}

/// Posts notifications to a webhook as JSON. Delivery failures are logged
/// and swallowed; a flaky webhook must not fail a backup.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
    last_sent: Mutex<HashMap<String, String>>,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            url: url.to_string(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }
}

impl NotificationSink for WebhookNotifier {
    fn notify(&self, id: &str, message: &str, severity: Severity) {
        {
            let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            if last.get(id).map(String::as_str) == Some(message) {
                return;
            }
            last.insert(id.to_string(), message.to_string());
        }

        let payload = json!({
            "id": id,
            "severity": match severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Error => "error",
            },
            "message": message,
        });

        if let Err(e) = self.client.post(&self.url).json(&payload).send() {
            warn!("Webhook delivery failed for {}: {}", id, e);
        }
    }
}

/// Fan-out to several sinks.
pub struct CompositeNotifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationSink for CompositeNotifier {
    fn notify(&self, id: &str, message: &str, severity: Severity) {
        for sink in &self.sinks {
            sink.notify(id, message, severity);
        }
    }
}

/// Build the notifier stack from configuration: console always, webhook
/// when a URL is configured.
pub fn build_notifier(config: &NotificationConfig) -> Arc<dyn NotificationSink> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> =
        vec![Arc::new(ConsoleNotifier::new(config.level))];
    if !config.webhook_url.trim().is_empty() {
        sinks.push(Arc::new(WebhookNotifier::new(&config.webhook_url)));
    }
    Arc::new(CompositeNotifier { sinks })
}

/// In-memory sink for tests.
pub mod mock {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Notification {
        pub id: String,
        pub message: String,
        pub severity: Severity,
    }

    #[derive(Default)]
    pub struct MemoryNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl MemoryNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn last_severity(&self) -> Option<Severity> {
            self.sent.lock().unwrap().last().map(|n| n.severity)
        }
    }

    impl NotificationSink for MemoryNotifier {
        fn notify(&self, id: &str, message: &str, severity: Severity) {
            self.sent.lock().unwrap().push(Notification {
                id: id.to_string(),
                message: message.to_string(),
                severity,
            });
        }
    }
}
