//! Peripheral observers: webhook notifications and alert rules.
//!
//! Both plug into the same seams the live-tail hub uses: the webhook
//! notifier is an [`EntryObserver`] on the ingest path, and the alert
//! manager periodically runs its rules through the query engine.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ingest::EntryObserver;
use crate::labels::LabelSet;
use crate::model::LogEntry;
use crate::query::Executor;

/// One configured webhook endpoint and the event kinds it subscribes to
/// (`"log"`, `"alert"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<String>,
}

/// Posts event payloads to subscribed webhooks, fire-and-forget.
pub struct WebhookNotifier {
    webhooks: Vec<WebhookConfig>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhooks: Vec<WebhookConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("http client construction should not fail");
        Self { webhooks, client }
    }

    /// Loads webhook definitions from a JSON file: `[{"url": ...,
    /// "events": ["log", "alert"]}, ...]`.
    pub async fn load(path: &std::path::Path) -> Result<Vec<WebhookConfig>> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::InvalidInput(format!("webhook config {}: {}", path.display(), e)))
    }

    /// Sends `payload` to every webhook subscribed to `event`. Delivery
    /// runs in the background; failures are logged and swallowed.
    pub fn notify(&self, event: &str, payload: serde_json::Value) {
        for webhook in &self.webhooks {
            if !webhook.events.iter().any(|e| e == event) {
                continue;
            }
            let client = self.client.clone();
            let url = webhook.url.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(err) = client.post(&url).json(&payload).send().await {
                    tracing::warn!("webhook {} delivery failed: {}", url, err);
                }
            });
        }
    }

    fn subscribes_to(&self, event: &str) -> bool {
        self.webhooks
            .iter()
            .any(|w| w.events.iter().any(|e| e == event))
    }
}

impl EntryObserver for WebhookNotifier {
    fn publish(&self, entry: &LogEntry) {
        if !self.subscribes_to("log") {
            return;
        }
        self.notify(
            "log",
            json!({
                "id": entry.id,
                "timestamp": entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                "message": entry.line,
                "labels": entry.labels,
                "level": entry.labels.get("level").unwrap_or("info"),
            }),
        );
    }
}

/// A threshold rule evaluated against the query engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    /// Query expression, e.g. `count_over_time({service="api"} |= "error" [5m])`.
    pub expr: String,
    pub threshold: f64,
    /// Evaluation window in seconds, ending at evaluation time.
    pub window_seconds: u64,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub labels: LabelSet,
}

/// Periodically evaluates alert rules and notifies on breaches.
pub struct AlertManager {
    rules: RwLock<Vec<AlertRule>>,
    notifier: Arc<WebhookNotifier>,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>, notifier: Arc<WebhookNotifier>) -> Self {
        Self {
            rules: RwLock::new(rules),
            notifier,
        }
    }

    /// Loads alert rules from a JSON file.
    pub async fn load(path: &std::path::Path) -> Result<Vec<AlertRule>> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::InvalidInput(format!("alert config {}: {}", path.display(), e)))
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().unwrap().push(rule);
    }

    /// Evaluates every rule once. A rule whose scalar exceeds its
    /// threshold fires an `alert` event; rule errors are logged and the
    /// remaining rules still run.
    pub async fn evaluate_rules(&self, executor: &Executor, clock: &dyn Clock) {
        let rules = self.rules.read().unwrap().clone();
        for rule in rules {
            let end = clock.now_utc();
            let start = end - chrono::Duration::seconds(rule.window_seconds as i64);
            let result = match executor.execute(&rule.expr, start, end, 0).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("alert rule {} failed to evaluate: {}", rule.name, err);
                    continue;
                }
            };
            let value = result
                .aggregation
                .as_ref()
                .map(|agg| agg.value)
                .unwrap_or(result.logs.len() as f64);
            if value > rule.threshold {
                tracing::info!("alert rule {} fired with value {}", rule.name, value);
                self.notifier.notify(
                    "alert",
                    json!({
                        "rule": rule.name,
                        "expr": rule.expr,
                        "value": value,
                        "labels": rule.labels,
                        "channels": rule.channels,
                        "timestamp": end.to_rfc3339_opts(SecondsFormat::Secs, true),
                    }),
                );
            }
        }
    }

    /// Runs evaluations forever on the given interval. Spawn as a
    /// background task.
    pub async fn run(
        self: Arc<Self>,
        executor: Arc<Executor>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.evaluate_rules(&executor, clock.as_ref()).await;
        }
    }
}
