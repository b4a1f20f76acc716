//! Operator alerts.
//!
//! Every alert is logged at its level and broadcast to subscribers (CLI,
//! future notifiers). Repeats of the same alert inside the rate-limit
//! window are suppressed, except Critical ones, which always go out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    /// Warning - degraded but trading continues
    Warning,
    /// Error - new trades halted
    Error,
    /// Critical - exchange exposure outside the engine's model
    Critical,
}

impl AlertLevel {
    /// Get severity string
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub position_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            position_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_position(mut self, position_id: &str) -> Self {
        self.position_id = Some(position_id.to_string());
        self
    }

    /// Single-line rendering for terminals and plain-text sinks
    pub fn format_line(&self) -> String {
        match &self.position_id {
            Some(id) => format!(
                "[{}] {} {} ({}): {}",
                self.level.as_str().to_uppercase(),
                self.component,
                self.title,
                id,
                self.message
            ),
            None => format!(
                "[{}] {} {}: {}",
                self.level.as_str().to_uppercase(),
                self.component,
                self.title,
                self.message
            ),
        }
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (default: 60s)
    pub rate_limit_secs: u64,
    /// Broadcast channel capacity
    pub channel_capacity: usize,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            channel_capacity: 64,
        }
    }
}

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

pub struct AlertManager {
    config: AlertManagerConfig,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
    event_tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            rate_limits: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Subscribe to alerts
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Generate rate limit key for an alert
    fn rate_limit_key(alert: &Alert) -> String {
        format!(
            "{}:{}:{}:{}",
            alert.component,
            alert.level,
            alert.title,
            alert.position_id.as_deref().unwrap_or("-")
        )
    }

    /// Check if alert should be rate limited
    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        if alert.level == AlertLevel::Critical {
            return false;
        }

        let key = Self::rate_limit_key(alert);
        let now = Utc::now();
        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    title = %alert.title,
                    suppressed = state.suppressed_count,
                    "duplicate alert suppressed"
                );
                return true;
            }
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Send an alert
    pub async fn alert(&self, alert: Alert) {
        if self.should_rate_limit(&alert).await {
            return;
        }

        let position_id = alert.position_id.as_deref().unwrap_or("");
        match alert.level {
            AlertLevel::Info => info!(
                component = %alert.component,
                position_id,
                "{}: {}",
                alert.title,
                alert.message
            ),
            AlertLevel::Warning => warn!(
                component = %alert.component,
                position_id,
                "{}: {}",
                alert.title,
                alert.message
            ),
            AlertLevel::Error => error!(
                component = %alert.component,
                position_id,
                "{}: {}",
                alert.title,
                alert.message
            ),
            AlertLevel::Critical => error!(
                component = %alert.component,
                position_id,
                "CRITICAL {}: {}",
                alert.title,
                alert.message
            ),
        }

        // No subscribers is fine.
        let _ = self.event_tx.send(alert);
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// Exposure left on the exchange that the engine could not flatten
    pub async fn manual_intervention(&self, position_id: &str, instruments: &[String], context: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "lifecycle",
                "MANUAL INTERVENTION REQUIRED",
                &format!("{}; open exposure on {}", context, instruments.join(", ")),
            )
            .for_position(position_id),
        )
        .await;
    }

    pub async fn circuit_breaker_tripped(&self, reason: &str) {
        self.alert(Alert::new(
            AlertLevel::Error,
            "risk",
            "Circuit breaker tripped",
            &format!("New trades halted: {}", reason),
        ))
        .await;
    }

    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        self.rate_limits
            .read()
            .await
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}
