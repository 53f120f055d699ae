//! Execution slippage validation.
//!
//! Measures realized slippage of each fill against its expected price, keeps
//! a rolling window for the running average, records violations, and can
//! optionally pre-reject orders whose quoted spread already implies
//! excessive slippage.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EventBus, EventHandler, RiskEvent, RiskEventKind};
use crate::ConfigError;

/// Violation records kept; trimmed in a batch on overflow.
const VIOLATION_CAP: usize = 1_000;
const VIOLATION_KEEP: usize = 500;

/// Slippage thresholds and window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageConfig {
    /// Above this absolute slippage a check is a violation (strict).
    pub max_slippage: Decimal,
    /// Above this absolute slippage a warning event fires.
    pub warning_threshold: Decimal,
    /// Enables the `can_execute` spread pre-check.
    pub reject_high_slippage: bool,
    /// Rolling window length for the running average.
    pub stats_window_size: usize,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            max_slippage: Decimal::new(2, 3),       // 0.2%
            warning_threshold: Decimal::new(1, 3),  // 0.1%
            reject_high_slippage: false,
            stats_window_size: 100,
        }
    }
}

impl SlippageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_slippage < Decimal::ZERO {
            return Err(ConfigError::Negative {
                field: "max_slippage",
                value: self.max_slippage,
            });
        }
        if self.warning_threshold < Decimal::ZERO {
            return Err(ConfigError::Negative {
                field: "warning_threshold",
                value: self.warning_threshold,
            });
        }
        if self.stats_window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "stats_window_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Per-order slippage record, returned by every check.
///
/// `slippage` is signed: positive means the fill was worse than expected for
/// a buy (executed above expected). The violation test uses the magnitude.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageViolation {
    pub symbol: String,
    pub expected_price: Decimal,
    pub executed_price: Decimal,
    pub slippage: Decimal,
    pub threshold: Decimal,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SlippageViolation {
    /// Strict inequality: slippage exactly at the threshold is not a
    /// violation.
    pub fn is_violation(&self) -> bool {
        self.slippage.abs() > self.threshold
    }
}

/// Serializable view of the checker, stable for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageStatus {
    pub total_checks: u64,
    pub violation_count: u64,
    pub violation_rate: Decimal,
    pub average_slippage: Decimal,
    pub recent_slippages: Vec<Decimal>,
    pub config: SlippageConfig,
}

struct CheckerInner {
    window: VecDeque<Decimal>,
    violations: Vec<SlippageViolation>,
    total_checks: u64,
    violation_count: u64,
}

/// Realized-slippage checker with an optional pre-trade spread guard.
pub struct SlippageChecker {
    config: SlippageConfig,
    inner: Mutex<CheckerInner>,
    events: EventBus,
}

impl SlippageChecker {
    /// # Panics
    /// Panics on an invalid configuration.
    pub fn new(config: SlippageConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("invalid slippage configuration: {e}");
        }
        Self {
            config,
            inner: Mutex::new(CheckerInner {
                window: VecDeque::new(),
                violations: Vec::new(),
                total_checks: 0,
                violation_count: 0,
            }),
            events: EventBus::new(),
        }
    }

    /// Register a handler for `Violation` or `Warning` events.
    pub fn subscribe(&self, kind: RiskEventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// Measure the realized slippage of a fill. Always returns the record;
    /// consult [`SlippageViolation::is_violation`] for the verdict.
    pub fn check_slippage(
        &self,
        symbol: &str,
        expected_price: Decimal,
        executed_price: Decimal,
        order_id: Option<&str>,
    ) -> SlippageViolation {
        let slippage = if expected_price > Decimal::ZERO {
            (executed_price - expected_price) / expected_price
        } else {
            Decimal::ZERO
        };

        let record = SlippageViolation {
            symbol: symbol.to_string(),
            expected_price,
            executed_price,
            slippage,
            threshold: self.config.max_slippage,
            order_id: order_id.map(str::to_string),
            timestamp: Utc::now(),
        };
        let is_violation = record.is_violation();

        {
            let mut inner = self.inner.lock();
            inner.total_checks += 1;
            inner.window.push_back(slippage.abs());
            while inner.window.len() > self.config.stats_window_size {
                inner.window.pop_front();
            }

            if is_violation {
                inner.violation_count += 1;
                inner.violations.push(record.clone());
                if inner.violations.len() > VIOLATION_CAP {
                    let excess = inner.violations.len() - VIOLATION_KEEP;
                    inner.violations.drain(..excess);
                }
            }
        }

        if is_violation {
            warn!(
                symbol = %symbol,
                slippage = %slippage,
                threshold = %self.config.max_slippage,
                "slippage violation"
            );
            self.events.emit(&RiskEvent::Violation(record.clone()));
        } else if slippage.abs() > self.config.warning_threshold {
            info!(symbol = %symbol, slippage = %slippage, "slippage warning");
            self.events.emit(&RiskEvent::SlippageWarning(record.clone()));
        }

        record
    }

    /// Pre-trade spread guard: estimates worst-case slippage from the quoted
    /// bid/ask and rejects if it exceeds the maximum. Always allows when
    /// `reject_high_slippage` is off or the expected price is not positive.
    pub fn can_execute(
        &self,
        symbol: &str,
        expected_price: Decimal,
        bid_price: Decimal,
        ask_price: Decimal,
    ) -> bool {
        if !self.config.reject_high_slippage {
            return true;
        }
        if expected_price <= Decimal::ZERO {
            return true;
        }

        let worst_case = ((ask_price - expected_price).abs())
            .max((bid_price - expected_price).abs())
            / expected_price;

        if worst_case > self.config.max_slippage {
            warn!(
                symbol = %symbol,
                bid = %bid_price,
                ask = %ask_price,
                expected = %expected_price,
                "order rejected for potential slippage"
            );
            return false;
        }
        true
    }

    /// Mean absolute slippage over the rolling window.
    pub fn average_slippage(&self) -> Decimal {
        let inner = self.inner.lock();
        if inner.window.is_empty() {
            return Decimal::ZERO;
        }
        let sum: Decimal = inner.window.iter().copied().sum();
        sum / Decimal::from(inner.window.len() as u64)
    }

    /// Fraction of checks that were violations.
    pub fn violation_rate(&self) -> Decimal {
        let inner = self.inner.lock();
        if inner.total_checks > 0 {
            Decimal::from(inner.violation_count) / Decimal::from(inner.total_checks)
        } else {
            Decimal::ZERO
        }
    }

    /// The most recent `last_n` violation records, oldest first.
    pub fn violations(&self, last_n: usize) -> Vec<SlippageViolation> {
        let inner = self.inner.lock();
        let start = inner.violations.len().saturating_sub(last_n);
        inner.violations[start..].to_vec()
    }

    /// Clear the window, violation list and counters.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.window.clear();
        inner.violations.clear();
        inner.total_checks = 0;
        inner.violation_count = 0;
        info!("slippage stats reset");
    }

    pub fn config(&self) -> &SlippageConfig {
        &self.config
    }

    /// Snapshot for monitoring.
    pub fn status(&self) -> SlippageStatus {
        let inner = self.inner.lock();
        let average_slippage = if inner.window.is_empty() {
            Decimal::ZERO
        } else {
            inner.window.iter().copied().sum::<Decimal>()
                / Decimal::from(inner.window.len() as u64)
        };
        let violation_rate = if inner.total_checks > 0 {
            Decimal::from(inner.violation_count) / Decimal::from(inner.total_checks)
        } else {
            Decimal::ZERO
        };
        let recent_slippages = inner
            .window
            .iter()
            .rev()
            .take(20)
            .rev()
            .copied()
            .collect();
        SlippageStatus {
            total_checks: inner.total_checks,
            violation_count: inner.violation_count,
            violation_rate,
            average_slippage,
            recent_slippages,
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn checker() -> SlippageChecker {
        SlippageChecker::new(SlippageConfig::default())
    }

    #[test]
    fn boundary_slippage_is_not_a_violation() {
        let c = checker(); // max 0.2%

        // (100.2 - 100) / 100 = 0.002 exactly: at the threshold, allowed
        let r = c.check_slippage("AAPL", Decimal::new(1_000, 1), Decimal::new(1_002, 1), None);
        assert_eq!(r.slippage, Decimal::new(2, 3));
        assert!(!r.is_violation());

        // 100.21: just over the threshold
        let r = c.check_slippage("AAPL", Decimal::new(1_000, 1), Decimal::new(10_021, 2), None);
        assert!(r.is_violation());
    }

    #[test]
    fn slippage_is_signed_and_violation_uses_magnitude() {
        let c = checker();
        let r = c.check_slippage("AAPL", Decimal::new(1_000, 1), Decimal::new(9_970, 2), None);
        assert_eq!(r.slippage, Decimal::new(-3, 3));
        assert!(r.is_violation());
    }

    #[test]
    fn zero_expected_price_yields_zero_slippage() {
        let c = checker();
        let r = c.check_slippage("AAPL", Decimal::ZERO, Decimal::new(100, 0), None);
        assert_eq!(r.slippage, Decimal::ZERO);
        assert!(!r.is_violation());
    }

    #[test]
    fn violation_rate_and_average_track_checks() {
        let c = checker();
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(100, 0), None); // 0
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(101, 0), None); // 1%, violation

        assert_eq!(c.violation_rate(), Decimal::new(5, 1));
        assert_eq!(c.average_slippage(), Decimal::new(5, 3));
        assert_eq!(c.violations(10).len(), 1);
    }

    #[test]
    fn rolling_window_trims_oldest() {
        let c = SlippageChecker::new(SlippageConfig {
            stats_window_size: 2,
            ..Default::default()
        });
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(110, 0), None); // 10%
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(100, 0), None); // 0
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(100, 0), None); // 0

        // the 10% observation fell out of the window
        assert_eq!(c.average_slippage(), Decimal::ZERO);
    }

    #[test]
    fn spread_guard_only_active_when_enabled() {
        let passive = checker();
        assert!(passive.can_execute(
            "AAPL",
            Decimal::new(100, 0),
            Decimal::new(90, 0),
            Decimal::new(110, 0)
        ));

        let active = SlippageChecker::new(SlippageConfig {
            reject_high_slippage: true,
            ..Default::default()
        });
        // 10% potential slippage on either side
        assert!(!active.can_execute(
            "AAPL",
            Decimal::new(100, 0),
            Decimal::new(90, 0),
            Decimal::new(110, 0)
        ));
        // tight quote inside the 0.2% budget
        assert!(active.can_execute(
            "AAPL",
            Decimal::new(100, 0),
            Decimal::new(9_990, 2),
            Decimal::new(10_010, 2)
        ));
    }

    #[test]
    fn violation_and_warning_events_fire() {
        let c = checker();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let s1 = seen.clone();
        c.subscribe(
            RiskEventKind::Violation,
            Arc::new(move |event| {
                if let RiskEvent::Violation(v) = event {
                    s1.lock().push(("violation", v.slippage));
                }
                Ok(())
            }),
        );
        let s2 = seen.clone();
        c.subscribe(
            RiskEventKind::Warning,
            Arc::new(move |event| {
                if let RiskEvent::SlippageWarning(v) = event {
                    s2.lock().push(("warning", v.slippage));
                }
                Ok(())
            }),
        );

        // 0.15%: warning band, not a violation
        c.check_slippage("AAPL", Decimal::new(10_000, 2), Decimal::new(10_015, 2), None);
        // 1%: violation
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(101, 0), Some("ord-1"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "warning");
        assert_eq!(seen[1].0, "violation");
    }

    #[test]
    fn reset_clears_statistics() {
        let c = checker();
        c.check_slippage("AAPL", Decimal::new(100, 0), Decimal::new(101, 0), None);
        c.reset_stats();
        assert_eq!(c.violation_rate(), Decimal::ZERO);
        assert_eq!(c.average_slippage(), Decimal::ZERO);
        assert!(c.violations(10).is_empty());
        assert_eq!(c.status().total_checks, 0);
    }

    #[test]
    #[should_panic(expected = "invalid slippage configuration")]
    fn negative_max_slippage_fails_fast() {
        SlippageChecker::new(SlippageConfig {
            max_slippage: Decimal::new(-2, 3),
            ..Default::default()
        });
    }
}
