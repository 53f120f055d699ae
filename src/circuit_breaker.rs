//! Circuit breaker for automatic trading halts.
//!
//! Tracks daily trading statistics and trips to `Open` when the daily loss or
//! consecutive-loss thresholds are breached. Recovery runs through a timed
//! half-open trial: after `recovery_time` the next [`CircuitBreaker::can_trade`]
//! poll moves the breaker to `HalfOpen`, a bounded number of trial polls are
//! allowed, and the caller reports the trial outcome via
//! [`CircuitBreaker::record_half_open_result`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EventBus, EventHandler, RiskEvent, RiskEventKind};
use crate::ConfigError;

/// Breaker state machine. Transitions only along:
/// Closed→Open (trip), Open→HalfOpen (recovery timer), HalfOpen→Closed
/// (successful trial), HalfOpen→Open (failed trial).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation, trading allowed.
    Closed,
    /// Tripped, trading halted.
    Open,
    /// Timed recovery trial, a bounded number of orders allowed.
    HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Thresholds for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Daily loss fraction that trips the breaker (e.g. 0.03 = 3%).
    pub daily_loss_threshold: Decimal,
    /// Number of consecutive losing trades that trips the breaker.
    pub consecutive_loss_count: u32,
    /// How long the breaker stays open before the half-open trial.
    pub recovery_time: Duration,
    /// Trial polls allowed while half-open.
    pub half_open_order_limit: u32,
    /// Whether the breaker transitions to half-open on its own once
    /// `recovery_time` has elapsed. When false, only `force_recover` reopens
    /// trading.
    pub auto_recover: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss_threshold: Decimal::new(3, 2), // 3%
            consecutive_loss_count: 5,
            recovery_time: Duration::from_secs(300),
            half_open_order_limit: 1,
            auto_recover: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_loss_threshold < Decimal::ZERO {
            return Err(ConfigError::Negative {
                field: "daily_loss_threshold",
                value: self.daily_loss_threshold,
            });
        }
        if self.consecutive_loss_count == 0 {
            return Err(ConfigError::Invalid {
                field: "consecutive_loss_count",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Daily trading statistics, reset when the tracked date changes.
#[derive(Debug, Clone, Serialize)]
pub struct TradingStats {
    pub date: NaiveDate,
    pub initial_equity: Decimal,
    pub current_equity: Decimal,
    pub high_watermark: Decimal,
    pub total_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub trade_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub consecutive_losses: u32,
}

impl TradingStats {
    fn new(date: NaiveDate, initial_equity: Decimal) -> Self {
        Self {
            date,
            initial_equity,
            current_equity: initial_equity,
            high_watermark: initial_equity,
            total_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            consecutive_losses: 0,
        }
    }

    /// Fractional return since the day's initial equity. Zero when the
    /// initial equity is not positive.
    pub fn daily_return(&self) -> Decimal {
        if self.initial_equity > Decimal::ZERO {
            (self.current_equity - self.initial_equity) / self.initial_equity
        } else {
            Decimal::ZERO
        }
    }

    /// Fractional decline from the day's high watermark.
    pub fn drawdown(&self) -> Decimal {
        if self.high_watermark > Decimal::ZERO {
            (self.high_watermark - self.current_equity) / self.high_watermark
        } else {
            Decimal::ZERO
        }
    }

    pub fn win_rate(&self) -> Decimal {
        if self.trade_count > 0 {
            Decimal::from(self.win_count) / Decimal::from(self.trade_count)
        } else {
            Decimal::ZERO
        }
    }
}

/// Serializable view of the breaker, stable for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitBreakerState,
    pub trip_reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    /// Remaining time before the half-open trial becomes available. Zero
    /// when not tripped or already eligible.
    pub time_to_recovery: Duration,
    /// Non-consuming view of whether a trade would currently be allowed.
    pub trading_allowed: bool,
    pub stats: TradingStats,
    pub config: CircuitBreakerConfig,
}

struct BreakerInner {
    state: CircuitBreakerState,
    stats: TradingStats,
    tripped_at: Option<DateTime<Utc>>,
    trip_reason: Option<String>,
    half_open_orders: u32,
}

/// Daily-loss / consecutive-loss circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: EventBus,
}

impl CircuitBreaker {
    /// Create a breaker in the `Closed` state.
    ///
    /// # Panics
    /// Panics if the configuration is invalid; an invalid risk threshold is
    /// a programmer error that must not be masked.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("invalid circuit breaker configuration: {e}");
        }
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                stats: TradingStats::new(Utc::now().date_naive(), Decimal::ZERO),
                tripped_at: None,
                trip_reason: None,
                half_open_orders: 0,
            }),
            events: EventBus::new(),
        }
    }

    /// Register a handler for `Trip`, `HalfOpen` or `Recover` events.
    pub fn subscribe(&self, kind: RiskEventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// Reset the day's statistics and close the breaker.
    pub fn initialize(&self, initial_equity: Decimal) {
        {
            let mut inner = self.inner.lock();
            inner.stats = TradingStats::new(Utc::now().date_naive(), initial_equity);
            inner.state = CircuitBreakerState::Closed;
            inner.tripped_at = None;
            inner.trip_reason = None;
            inner.half_open_orders = 0;
        }
        info!(equity = %initial_equity, "circuit breaker initialized");
    }

    /// Update equity and, when a trade closed, its realized P&L. Runs the
    /// trip check after the mutation.
    ///
    /// The first call observing a new Utc calendar date reinitializes the
    /// day's statistics with the observed equity and skips the trip check.
    pub fn update_equity(&self, current_equity: Decimal, trade_pnl: Option<Decimal>) {
        let tripped = {
            let mut inner = self.inner.lock();

            let today = Utc::now().date_naive();
            if inner.stats.date != today {
                inner.stats = TradingStats::new(today, current_equity);
                inner.state = CircuitBreakerState::Closed;
                inner.tripped_at = None;
                inner.trip_reason = None;
                inner.half_open_orders = 0;
                drop(inner);
                info!(equity = %current_equity, "new trading day, circuit breaker stats reset");
                return;
            }

            inner.stats.current_equity = current_equity;
            if current_equity > inner.stats.high_watermark {
                inner.stats.high_watermark = current_equity;
            }
            inner.stats.total_pnl = current_equity - inner.stats.initial_equity;

            if let Some(pnl) = trade_pnl {
                inner.stats.trade_count += 1;
                inner.stats.realized_pnl += pnl;
                if pnl > Decimal::ZERO {
                    inner.stats.win_count += 1;
                    inner.stats.consecutive_losses = 0;
                } else if pnl < Decimal::ZERO {
                    inner.stats.loss_count += 1;
                    inner.stats.consecutive_losses += 1;
                }
            }
            inner.stats.unrealized_pnl = inner.stats.total_pnl - inner.stats.realized_pnl;

            if inner.state == CircuitBreakerState::Open {
                None
            } else {
                self.check_triggers(&mut inner)
            }
        };

        if let Some(event) = tripped {
            if let RiskEvent::Trip { reason, .. } = &event {
                warn!(reason = %reason, "circuit breaker TRIPPED, trading halted");
            }
            self.events.emit(&event);
        }
    }

    /// Whether a trade attempt is currently allowed. This is the order-path
    /// poll: while half-open it consumes a trial slot on every call, whether
    /// or not an order follows. Read paths should use
    /// [`CircuitBreaker::trading_allowed`] instead.
    pub fn can_trade(&self) -> bool {
        let (allowed, entered_half_open) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitBreakerState::Closed => (true, false),
                CircuitBreakerState::Open => {
                    if self.config.auto_recover && self.recovery_elapsed(&inner) {
                        inner.state = CircuitBreakerState::HalfOpen;
                        inner.half_open_orders = 0;
                        // The transitioning poll permits a trade without
                        // consuming a trial slot; exactly
                        // `half_open_order_limit` later polls succeed.
                        (true, true)
                    } else {
                        (false, false)
                    }
                }
                CircuitBreakerState::HalfOpen => {
                    if inner.half_open_orders < self.config.half_open_order_limit {
                        inner.half_open_orders += 1;
                        (true, false)
                    } else {
                        (false, false)
                    }
                }
            }
        };

        if entered_half_open {
            info!("circuit breaker entering half-open trial");
            self.events.emit(&RiskEvent::HalfOpen);
        }
        allowed
    }

    /// Non-consuming view of whether a trade would be allowed right now.
    /// Does not advance the recovery state machine.
    pub fn trading_allowed(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => false,
            CircuitBreakerState::HalfOpen => {
                inner.half_open_orders < self.config.half_open_order_limit
            }
        }
    }

    /// Report the outcome of a half-open trial order. A success closes the
    /// breaker; a failure reopens it with a freshly reset recovery clock.
    /// No-op outside the half-open state.
    pub fn record_half_open_result(&self, success: bool) {
        let recovered = {
            let mut inner = self.inner.lock();
            if inner.state != CircuitBreakerState::HalfOpen {
                return;
            }
            if success {
                inner.state = CircuitBreakerState::Closed;
                inner.tripped_at = None;
                inner.trip_reason = None;
                true
            } else {
                inner.state = CircuitBreakerState::Open;
                inner.tripped_at = Some(Utc::now());
                false
            }
        };

        if recovered {
            info!("circuit breaker recovered to closed");
            self.events.emit(&RiskEvent::Recover);
        } else {
            warn!("half-open trial failed, circuit breaker back to open");
        }
    }

    /// Manually trip the breaker. Idempotent.
    pub fn force_trip(&self, reason: &str) {
        let event = {
            let mut inner = self.inner.lock();
            self.trip_locked(&mut inner, reason.to_string())
        };
        warn!(reason = %reason, "circuit breaker manually tripped");
        self.events.emit(&event);
    }

    /// Manually close the breaker, clearing trip state. Idempotent.
    pub fn force_recover(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CircuitBreakerState::Closed;
            inner.tripped_at = None;
            inner.trip_reason = None;
            inner.half_open_orders = 0;
        }
        info!("circuit breaker manually recovered");
        self.events.emit(&RiskEvent::Recover);
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> TradingStats {
        self.inner.lock().stats.clone()
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.inner.lock().trip_reason.clone()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Snapshot for monitoring. Never consumes a half-open trial slot.
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        let time_to_recovery = match inner.tripped_at {
            Some(tripped_at) if inner.state == CircuitBreakerState::Open => {
                let elapsed = (Utc::now() - tripped_at).to_std().unwrap_or_default();
                self.config.recovery_time.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        };
        let trading_allowed = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => false,
            CircuitBreakerState::HalfOpen => {
                inner.half_open_orders < self.config.half_open_order_limit
            }
        };
        CircuitBreakerStatus {
            state: inner.state,
            trip_reason: inner.trip_reason.clone(),
            tripped_at: inner.tripped_at,
            time_to_recovery,
            trading_allowed,
            stats: inner.stats.clone(),
            config: self.config.clone(),
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        match inner.tripped_at {
            Some(tripped_at) => {
                let elapsed = (Utc::now() - tripped_at).to_std().unwrap_or_default();
                elapsed >= self.config.recovery_time
            }
            None => false,
        }
    }

    fn check_triggers(&self, inner: &mut BreakerInner) -> Option<RiskEvent> {
        let daily_return = inner.stats.daily_return();
        if daily_return <= -self.config.daily_loss_threshold {
            let reason = format!(
                "daily loss {daily_return} breached threshold {}",
                self.config.daily_loss_threshold
            );
            return Some(self.trip_locked(inner, reason));
        }

        if inner.stats.consecutive_losses >= self.config.consecutive_loss_count {
            let reason = format!("consecutive losses: {}", inner.stats.consecutive_losses);
            return Some(self.trip_locked(inner, reason));
        }

        None
    }

    fn trip_locked(&self, inner: &mut BreakerInner, reason: String) -> RiskEvent {
        inner.state = CircuitBreakerState::Open;
        inner.tripped_at = Some(Utc::now());
        inner.trip_reason = Some(reason.clone());
        RiskEvent::Trip {
            reason,
            stats: inner.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(config);
        breaker.initialize(Decimal::new(10_000, 0));
        breaker
    }

    #[test]
    fn daily_loss_boundary_trips_at_threshold_only() {
        let b = breaker(CircuitBreakerConfig::default()); // 3%

        // -2.99% does not trip
        b.update_equity(Decimal::new(9_701, 0), None);
        assert_eq!(b.state(), CircuitBreakerState::Closed);

        // exactly -3.00% trips
        b.update_equity(Decimal::new(9_700, 0), None);
        assert_eq!(b.state(), CircuitBreakerState::Open);
        assert!(!b.can_trade());
        assert!(b.trip_reason().unwrap().contains("daily loss"));
    }

    #[test]
    fn consecutive_losses_trip_with_flat_equity() {
        let b = breaker(CircuitBreakerConfig {
            consecutive_loss_count: 3,
            ..Default::default()
        });

        // tiny losses, drawdown near zero
        b.update_equity(Decimal::new(9_999, 0), Some(Decimal::new(-1, 0)));
        b.update_equity(Decimal::new(9_998, 0), Some(Decimal::new(-1, 0)));
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        b.update_equity(Decimal::new(9_997, 0), Some(Decimal::new(-1, 0)));
        assert_eq!(b.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn winning_trade_resets_consecutive_losses() {
        let b = breaker(CircuitBreakerConfig {
            consecutive_loss_count: 3,
            ..Default::default()
        });

        b.update_equity(Decimal::new(9_999, 0), Some(Decimal::new(-1, 0)));
        b.update_equity(Decimal::new(9_998, 0), Some(Decimal::new(-1, 0)));
        b.update_equity(Decimal::new(10_000, 0), Some(Decimal::new(2, 0)));
        b.update_equity(Decimal::new(9_999, 0), Some(Decimal::new(-1, 0)));
        b.update_equity(Decimal::new(9_998, 0), Some(Decimal::new(-1, 0)));
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        assert_eq!(b.stats().consecutive_losses, 2);
    }

    #[test]
    fn recovery_cycle_half_open_to_closed() {
        let b = breaker(CircuitBreakerConfig {
            recovery_time: Duration::ZERO,
            half_open_order_limit: 2,
            ..Default::default()
        });
        b.force_trip("test halt");
        assert_eq!(b.state(), CircuitBreakerState::Open);

        // transitioning poll enters half-open without consuming a slot
        assert!(b.can_trade());
        assert_eq!(b.state(), CircuitBreakerState::HalfOpen);

        // exactly half_open_order_limit polls succeed, then denial
        assert!(b.can_trade());
        assert!(b.can_trade());
        assert!(!b.can_trade());

        b.record_half_open_result(true);
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        assert!(b.trip_reason().is_none());
        assert!(b.can_trade());
    }

    #[test]
    fn failed_trial_reopens_with_fresh_timer() {
        let b = breaker(CircuitBreakerConfig {
            recovery_time: Duration::from_secs(300),
            ..Default::default()
        });
        b.force_trip("test halt");

        // elapse the timer by rewinding tripped_at
        {
            let mut inner = b.inner.lock();
            inner.tripped_at = Some(Utc::now() - chrono::Duration::seconds(301));
        }
        assert!(b.can_trade());
        assert_eq!(b.state(), CircuitBreakerState::HalfOpen);

        b.record_half_open_result(false);
        assert_eq!(b.state(), CircuitBreakerState::Open);
        // fresh trip timestamp means recovery has not elapsed again
        assert!(!b.can_trade());
    }

    #[test]
    fn day_rollover_rebases_stats_without_tripping() {
        let b = breaker(CircuitBreakerConfig::default());
        let trips = Arc::new(PlMutex::new(0u32));
        let trips2 = trips.clone();
        b.subscribe(
            RiskEventKind::Trip,
            Arc::new(move |_| {
                *trips2.lock() += 1;
                Ok(())
            }),
        );

        b.update_equity(Decimal::new(9_600, 0), Some(Decimal::new(-400, 0))); // -4%
        assert_eq!(b.state(), CircuitBreakerState::Open);
        assert_eq!(*trips.lock(), 1);

        // pretend the stats were opened yesterday
        {
            let mut inner = b.inner.lock();
            inner.stats.date = Utc::now().date_naive() - chrono::Duration::days(1);
        }

        // -4% against yesterday's baseline, but the new day rebases instead
        b.update_equity(Decimal::new(9_600, 0), None);
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        assert!(b.trip_reason().is_none());
        assert!(b.can_trade());
        assert_eq!(*trips.lock(), 1);

        let stats = b.stats();
        assert_eq!(stats.initial_equity, Decimal::new(9_600, 0));
        assert_eq!(stats.current_equity, Decimal::new(9_600, 0));
        assert_eq!(stats.trade_count, 0);
        assert_eq!(stats.daily_return(), Decimal::ZERO);
    }

    #[test]
    fn no_auto_recover_without_flag() {
        let b = breaker(CircuitBreakerConfig {
            recovery_time: Duration::ZERO,
            auto_recover: false,
            ..Default::default()
        });
        b.force_trip("test halt");
        assert!(!b.can_trade());
        assert_eq!(b.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn force_recover_is_idempotent() {
        let b = breaker(CircuitBreakerConfig::default());
        b.force_trip("test halt");
        b.force_recover();
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        b.force_recover();
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        assert!(b.can_trade());
    }

    #[test]
    fn half_open_result_outside_half_open_is_noop() {
        let b = breaker(CircuitBreakerConfig::default());
        b.record_half_open_result(false);
        assert_eq!(b.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn trip_event_carries_reason_and_stats() {
        let b = breaker(CircuitBreakerConfig::default());
        let seen: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen2 = seen.clone();
        b.subscribe(
            RiskEventKind::Trip,
            Arc::new(move |event| {
                if let RiskEvent::Trip { reason, stats } = event {
                    seen2.lock().push(format!("{reason}|{}", stats.current_equity));
                }
                Ok(())
            }),
        );

        b.update_equity(Decimal::new(9_600, 0), None);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("daily loss"));
        assert!(seen[0].contains("9600"));
    }

    #[test]
    fn stats_accumulate_and_derive() {
        let b = breaker(CircuitBreakerConfig::default());
        b.update_equity(Decimal::new(10_100, 0), Some(Decimal::new(100, 0)));
        b.update_equity(Decimal::new(10_050, 0), Some(Decimal::new(-50, 0)));

        let stats = b.stats();
        assert_eq!(stats.trade_count, 2);
        assert_eq!(stats.win_count, 1);
        assert_eq!(stats.loss_count, 1);
        assert_eq!(stats.high_watermark, Decimal::new(10_100, 0));
        assert_eq!(stats.total_pnl, Decimal::new(50, 0));
        assert_eq!(stats.realized_pnl, Decimal::new(50, 0));
        assert_eq!(stats.win_rate(), Decimal::new(5, 1));
        assert_eq!(stats.daily_return(), Decimal::new(5, 3));
    }

    #[test]
    fn zero_equity_derived_ratios_are_zero() {
        let stats = TradingStats::new(Utc::now().date_naive(), Decimal::ZERO);
        assert_eq!(stats.daily_return(), Decimal::ZERO);
        assert_eq!(stats.drawdown(), Decimal::ZERO);
        assert_eq!(stats.win_rate(), Decimal::ZERO);
    }

    #[test]
    #[should_panic(expected = "invalid circuit breaker configuration")]
    fn negative_threshold_fails_fast() {
        CircuitBreaker::new(CircuitBreakerConfig {
            daily_loss_threshold: Decimal::new(-3, 2),
            ..Default::default()
        });
    }

    #[test]
    fn status_does_not_consume_trial_slots() {
        let b = breaker(CircuitBreakerConfig {
            recovery_time: Duration::ZERO,
            half_open_order_limit: 1,
            ..Default::default()
        });
        b.force_trip("test halt");
        assert!(b.can_trade()); // enters half-open

        for _ in 0..5 {
            let status = b.status();
            assert!(status.trading_allowed);
        }
        assert!(b.can_trade()); // the single trial slot is still available
        assert!(!b.can_trade());
    }
}
