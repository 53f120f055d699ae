//! Drawdown monitoring with leveled alerts and a max-drawdown hard stop.
//!
//! Not a discrete state machine: every equity update recomputes the current
//! drawdown from the running peak and classifies it against the warning,
//! critical and maximum thresholds. Crossing the maximum sets a sticky
//! `exceeded` flag that blocks trading until explicitly reset.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::events::{EventBus, EventHandler, RiskEvent, RiskEventKind};
use crate::ConfigError;

/// Bounded equity history: batch-compacted, not a strict ring buffer.
const HISTORY_CAP: usize = 10_000;
const HISTORY_KEEP: usize = 5_000;

/// Severity of a drawdown alert, most severe last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownAlertLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

/// Transient alert produced by [`DrawdownMonitor::update`]; not stored.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownAlert {
    pub level: DrawdownAlertLevel,
    pub current_drawdown: Decimal,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    /// The threshold this alert crossed.
    pub threshold: Decimal,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// One entry of the bounded equity history.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub drawdown: Decimal,
}

/// Drawdown thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownConfig {
    /// Hard ceiling; crossing it sets the sticky exceeded flag.
    pub max_drawdown: Decimal,
    pub warning_threshold: Decimal,
    pub critical_threshold: Decimal,
    /// Whether the exceeded flag blocks trading.
    pub auto_stop_on_exceed: bool,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            max_drawdown: Decimal::new(15, 2),       // 15%
            warning_threshold: Decimal::new(5, 2),   // 5%
            critical_threshold: Decimal::new(10, 2), // 10%
            auto_stop_on_exceed: true,
        }
    }
}

impl DrawdownConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_drawdown", self.max_drawdown),
            ("warning_threshold", self.warning_threshold),
            ("critical_threshold", self.critical_threshold),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if self.warning_threshold > self.critical_threshold
            || self.critical_threshold > self.max_drawdown
        {
            return Err(ConfigError::Invalid {
                field: "drawdown thresholds",
                reason: "must be ordered warning <= critical <= max",
            });
        }
        Ok(())
    }
}

/// Serializable view of the monitor, stable for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownStatus {
    pub current_drawdown: Decimal,
    pub max_recorded_drawdown: Decimal,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub initial_equity: Decimal,
    pub alert_level: DrawdownAlertLevel,
    pub is_exceeded: bool,
    pub can_trade: bool,
    pub config: DrawdownConfig,
}

struct MonitorInner {
    initial_equity: Decimal,
    peak_equity: Decimal,
    current_equity: Decimal,
    current_drawdown: Decimal,
    max_recorded_drawdown: Decimal,
    exceeded: bool,
    history: Vec<EquityPoint>,
}

/// Continuously recomputed drawdown classification over an equity feed.
pub struct DrawdownMonitor {
    config: DrawdownConfig,
    inner: Mutex<MonitorInner>,
    events: EventBus,
}

impl DrawdownMonitor {
    /// # Panics
    /// Panics on an invalid configuration.
    pub fn new(config: DrawdownConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("invalid drawdown configuration: {e}");
        }
        Self {
            config,
            inner: Mutex::new(MonitorInner {
                initial_equity: Decimal::ZERO,
                peak_equity: Decimal::ZERO,
                current_equity: Decimal::ZERO,
                current_drawdown: Decimal::ZERO,
                max_recorded_drawdown: Decimal::ZERO,
                exceeded: false,
                history: Vec::new(),
            }),
            events: EventBus::new(),
        }
    }

    /// Register a handler for `Warning`, `Critical`, `Exceeded` or the
    /// generic `Alert` kind.
    pub fn subscribe(&self, kind: RiskEventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// Reset peak, drawdown, exceeded flag and history to a fresh baseline.
    pub fn initialize(&self, initial_equity: Decimal) {
        {
            let mut inner = self.inner.lock();
            inner.initial_equity = initial_equity;
            inner.peak_equity = initial_equity;
            inner.current_equity = initial_equity;
            inner.current_drawdown = Decimal::ZERO;
            inner.max_recorded_drawdown = Decimal::ZERO;
            inner.exceeded = false;
            inner.history.clear();
        }
        info!(equity = %initial_equity, "drawdown monitor initialized");
    }

    /// Feed a new equity observation. Returns the single highest alert that
    /// applies, or `None` below the warning threshold.
    pub fn update(&self, current_equity: Decimal) -> Option<DrawdownAlert> {
        let alert = {
            let mut inner = self.inner.lock();
            inner.current_equity = current_equity;

            if current_equity > inner.peak_equity {
                inner.peak_equity = current_equity;
            }

            inner.current_drawdown = if inner.peak_equity > Decimal::ZERO {
                (inner.peak_equity - current_equity) / inner.peak_equity
            } else {
                Decimal::ZERO
            };

            if inner.current_drawdown > inner.max_recorded_drawdown {
                inner.max_recorded_drawdown = inner.current_drawdown;
            }

            let point = EquityPoint {
                timestamp: Utc::now(),
                equity: current_equity,
                drawdown: inner.current_drawdown,
            };
            inner.history.push(point);
            if inner.history.len() > HISTORY_CAP {
                let excess = inner.history.len() - HISTORY_KEEP;
                inner.history.drain(..excess);
            }

            let alert = self.classify(&inner);
            if matches!(
                alert.as_ref().map(|a| a.level),
                Some(DrawdownAlertLevel::Exceeded)
            ) {
                inner.exceeded = true;
            }
            alert
        };

        if let Some(ref alert) = alert {
            match alert.level {
                DrawdownAlertLevel::Exceeded => error!(message = %alert.message, "drawdown exceeded"),
                DrawdownAlertLevel::Critical => warn!(message = %alert.message, "critical drawdown"),
                DrawdownAlertLevel::Warning => warn!(message = %alert.message, "drawdown warning"),
                DrawdownAlertLevel::Normal => {}
            }
            self.events.emit(&RiskEvent::Drawdown(alert.clone()));
        }

        alert
    }

    /// False while the exceeded flag is set and `auto_stop_on_exceed` is on.
    pub fn can_trade(&self) -> bool {
        !(self.config.auto_stop_on_exceed && self.inner.lock().exceeded)
    }

    /// Clear the sticky exceeded flag; the only way to resume after a
    /// max-drawdown stop.
    pub fn reset_exceeded(&self) {
        self.inner.lock().exceeded = false;
        info!("drawdown exceeded flag reset");
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.inner.lock().current_drawdown
    }

    pub fn max_recorded_drawdown(&self) -> Decimal {
        self.inner.lock().max_recorded_drawdown
    }

    pub fn peak_equity(&self) -> Decimal {
        self.inner.lock().peak_equity
    }

    pub fn current_equity(&self) -> Decimal {
        self.inner.lock().current_equity
    }

    pub fn is_exceeded(&self) -> bool {
        self.inner.lock().exceeded
    }

    pub fn config(&self) -> &DrawdownConfig {
        &self.config
    }

    /// The most recent `last_n` history entries, oldest first.
    pub fn history(&self, last_n: usize) -> Vec<EquityPoint> {
        let inner = self.inner.lock();
        let start = inner.history.len().saturating_sub(last_n);
        inner.history[start..].to_vec()
    }

    /// Snapshot for monitoring.
    pub fn status(&self) -> DrawdownStatus {
        let inner = self.inner.lock();
        let alert_level = self.level_for(inner.current_drawdown);
        DrawdownStatus {
            current_drawdown: inner.current_drawdown,
            max_recorded_drawdown: inner.max_recorded_drawdown,
            peak_equity: inner.peak_equity,
            current_equity: inner.current_equity,
            initial_equity: inner.initial_equity,
            alert_level,
            is_exceeded: inner.exceeded,
            can_trade: !(self.config.auto_stop_on_exceed && inner.exceeded),
            config: self.config.clone(),
        }
    }

    fn level_for(&self, drawdown: Decimal) -> DrawdownAlertLevel {
        if drawdown >= self.config.max_drawdown {
            DrawdownAlertLevel::Exceeded
        } else if drawdown >= self.config.critical_threshold {
            DrawdownAlertLevel::Critical
        } else if drawdown >= self.config.warning_threshold {
            DrawdownAlertLevel::Warning
        } else {
            DrawdownAlertLevel::Normal
        }
    }

    // Checks thresholds from most to least severe; a single alert at most.
    fn classify(&self, inner: &MonitorInner) -> Option<DrawdownAlert> {
        let dd = inner.current_drawdown;
        let (level, threshold, message) = match self.level_for(dd) {
            DrawdownAlertLevel::Exceeded => (
                DrawdownAlertLevel::Exceeded,
                self.config.max_drawdown,
                format!(
                    "drawdown {dd} exceeded max threshold {}",
                    self.config.max_drawdown
                ),
            ),
            DrawdownAlertLevel::Critical => (
                DrawdownAlertLevel::Critical,
                self.config.critical_threshold,
                format!("critical drawdown: {dd}"),
            ),
            DrawdownAlertLevel::Warning => (
                DrawdownAlertLevel::Warning,
                self.config.warning_threshold,
                format!("drawdown warning: {dd}"),
            ),
            DrawdownAlertLevel::Normal => return None,
        };

        Some(DrawdownAlert {
            level,
            current_drawdown: dd,
            peak_equity: inner.peak_equity,
            current_equity: inner.current_equity,
            threshold,
            timestamp: Utc::now(),
            message,
        })
    }
}
