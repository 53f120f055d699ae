//! Typed event bus for risk notifications.
//!
//! Each component owns an [`EventBus`] and emits into it after releasing its
//! state lock, so handlers never run under a component mutex. Dispatch is
//! synchronous and failure-isolated: a handler returning an error is logged
//! and skipped, and never affects the trade decision that triggered it or
//! the delivery to later handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::circuit_breaker::TradingStats;
use crate::drawdown_monitor::{DrawdownAlert, DrawdownAlertLevel};
use crate::slippage_checker::SlippageViolation;

/// Callback invoked on a risk event.
pub type EventHandler = Arc<dyn Fn(&RiskEvent) -> anyhow::Result<()> + Send + Sync>;

/// Subscription key for [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    /// Circuit breaker tripped to Open.
    Trip,
    /// Circuit breaker entered the half-open trial.
    HalfOpen,
    /// Circuit breaker recovered to Closed.
    Recover,
    /// Warning-level drawdown alert, or a slippage warning.
    Warning,
    /// Critical-level drawdown alert.
    Critical,
    /// Max-drawdown ceiling exceeded.
    Exceeded,
    /// Any drawdown alert, regardless of level.
    Alert,
    /// Slippage violation recorded.
    Violation,
}

/// A risk notification carried to subscribers.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    /// The circuit breaker halted trading.
    Trip {
        reason: String,
        stats: TradingStats,
    },
    /// The circuit breaker entered its half-open trial.
    HalfOpen,
    /// The circuit breaker closed again.
    Recover,
    /// A drawdown alert was produced.
    Drawdown(DrawdownAlert),
    /// Slippage exceeded the warning threshold but not the maximum.
    SlippageWarning(SlippageViolation),
    /// Slippage exceeded the maximum allowed.
    Violation(SlippageViolation),
}

impl RiskEvent {
    /// The subscription kind this event dispatches to.
    ///
    /// Drawdown alerts map to their level's kind and additionally reach
    /// [`RiskEventKind::Alert`] subscribers (see [`EventBus::emit`]).
    pub fn kind(&self) -> RiskEventKind {
        match self {
            RiskEvent::Trip { .. } => RiskEventKind::Trip,
            RiskEvent::HalfOpen => RiskEventKind::HalfOpen,
            RiskEvent::Recover => RiskEventKind::Recover,
            RiskEvent::Drawdown(alert) => match alert.level {
                DrawdownAlertLevel::Warning => RiskEventKind::Warning,
                DrawdownAlertLevel::Critical => RiskEventKind::Critical,
                DrawdownAlertLevel::Exceeded => RiskEventKind::Exceeded,
                // Normal-level alerts are never constructed, but the mapping
                // must stay total.
                DrawdownAlertLevel::Normal => RiskEventKind::Alert,
            },
            RiskEvent::SlippageWarning(_) => RiskEventKind::Warning,
            RiskEvent::Violation(_) => RiskEventKind::Violation,
        }
    }
}

/// Per-kind handler registry with synchronous dispatch.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<RiskEventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers are invoked in
    /// registration order.
    pub fn subscribe(&self, kind: RiskEventKind, handler: EventHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Deliver an event to all matching handlers.
    ///
    /// Drawdown events are delivered to their level-specific subscribers and
    /// then to generic `Alert` subscribers. Handler errors are logged and do
    /// not stop dispatch.
    pub fn emit(&self, event: &RiskEvent) {
        let kind = event.kind();
        let targets: Vec<EventHandler> = {
            let handlers = self.handlers.read();
            let mut targets = handlers.get(&kind).cloned().unwrap_or_default();
            if matches!(event, RiskEvent::Drawdown(_)) && kind != RiskEventKind::Alert {
                if let Some(generic) = handlers.get(&RiskEventKind::Alert) {
                    targets.extend(generic.iter().cloned());
                }
            }
            targets
        };

        for handler in targets {
            if let Err(e) = handler(event) {
                error!(kind = ?kind, error = %e, "risk event handler failed");
            }
        }
    }
}
