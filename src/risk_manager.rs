//! Composite risk manager.
//!
//! Owns one circuit breaker, drawdown monitor and slippage checker plus an
//! order-rate limiter and order-value/position caps, and exposes the single
//! pre-trade / post-trade check API used by the execution path.
//!
//! `pre_trade_check` evaluates its rules in a fixed order and fails fast on
//! the first violation; it only inspects the order-rate window.
//! `post_trade_check` is the one place an order is counted against the rate
//! limiter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::drawdown_monitor::{DrawdownConfig, DrawdownMonitor, DrawdownStatus};
use crate::events::{EventHandler, RiskEventKind};
use crate::slippage_checker::{
    SlippageChecker, SlippageConfig, SlippageStatus, SlippageViolation,
};
use crate::ConfigError;

/// Coarse account-risk classification for display and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    /// Trading is halted by the circuit breaker or drawdown stop.
    Halted,
}

/// Direction of the order under check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Long,
    Short,
    Flat,
}

/// Aggregate configuration; flattened tunables for all components plus the
/// manager's own limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    // circuit breaker
    pub daily_loss_threshold: Decimal,
    pub consecutive_loss_count: u32,
    pub recovery_time: Duration,
    pub half_open_order_limit: u32,
    pub auto_recover: bool,

    // drawdown
    pub max_drawdown: Decimal,
    pub warning_drawdown: Decimal,
    pub critical_drawdown: Decimal,
    pub auto_stop_on_exceed: bool,

    // slippage
    pub max_slippage: Decimal,
    pub slippage_warning: Decimal,
    pub reject_high_slippage: bool,
    pub slippage_window_size: usize,

    // position / order limits
    pub max_position_pct: Decimal,
    pub max_order_value: Decimal,
    pub min_order_interval: Duration,
    pub max_orders_per_minute: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_threshold: Decimal::new(3, 2), // 3%
            consecutive_loss_count: 5,
            recovery_time: Duration::from_secs(300),
            half_open_order_limit: 1,
            auto_recover: true,

            max_drawdown: Decimal::new(15, 2),     // 15%
            warning_drawdown: Decimal::new(5, 2),  // 5%
            critical_drawdown: Decimal::new(10, 2), // 10%
            auto_stop_on_exceed: true,

            max_slippage: Decimal::new(2, 3),      // 0.2%
            slippage_warning: Decimal::new(1, 3),  // 0.1%
            reject_high_slippage: false,
            slippage_window_size: 100,

            max_position_pct: Decimal::new(20, 2), // 20%
            max_order_value: Decimal::new(50_000, 0),
            min_order_interval: Duration::from_millis(500),
            max_orders_per_minute: 60,
        }
    }
}

impl RiskConfig {
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            daily_loss_threshold: self.daily_loss_threshold,
            consecutive_loss_count: self.consecutive_loss_count,
            recovery_time: self.recovery_time,
            half_open_order_limit: self.half_open_order_limit,
            auto_recover: self.auto_recover,
        }
    }

    pub fn drawdown_config(&self) -> DrawdownConfig {
        DrawdownConfig {
            max_drawdown: self.max_drawdown,
            warning_threshold: self.warning_drawdown,
            critical_threshold: self.critical_drawdown,
            auto_stop_on_exceed: self.auto_stop_on_exceed,
        }
    }

    pub fn slippage_config(&self) -> SlippageConfig {
        SlippageConfig {
            max_slippage: self.max_slippage,
            warning_threshold: self.slippage_warning,
            reject_high_slippage: self.reject_high_slippage,
            stats_window_size: self.slippage_window_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker_config().validate()?;
        self.drawdown_config().validate()?;
        self.slippage_config().validate()?;
        for (field, value) in [
            ("max_position_pct", self.max_position_pct),
            ("max_order_value", self.max_order_value),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if self.max_orders_per_minute == 0 {
            return Err(ConfigError::Invalid {
                field: "max_orders_per_minute",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Immutable outcome of a pre-trade check.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheckResult {
    pub allowed: bool,
    pub risk_level: RiskLevel,
    /// Blocking reasons, in evaluation order.
    pub reasons: Vec<String>,
    /// Non-blocking advisories.
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl RiskCheckResult {
    fn rejected(risk_level: RiskLevel, reason: String) -> Self {
        Self {
            allowed: false,
            risk_level,
            reasons: vec![reason],
            warnings: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn passed(risk_level: RiskLevel, warnings: Vec<String>) -> Self {
        Self {
            allowed: true,
            risk_level,
            reasons: Vec::new(),
            warnings,
            timestamp: Utc::now(),
        }
    }
}

/// Order-rate occupancy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRateStatus {
    pub orders_last_minute: usize,
    pub max_per_minute: u32,
    pub min_interval: Duration,
}

/// Composite snapshot; the stable contract for monitoring and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub risk_level: RiskLevel,
    pub can_trade: bool,
    pub circuit_breaker: CircuitBreakerStatus,
    pub drawdown: DrawdownStatus,
    pub slippage: SlippageStatus,
    pub order_rate: OrderRateStatus,
    pub config: RiskConfig,
}

/// Sliding 60-second window of recorded order timestamps plus the most
/// recent order, used for the per-minute cap and the minimum interval.
struct OrderRateWindow {
    timestamps: VecDeque<Instant>,
    last_order: Option<Instant>,
}

impl OrderRateWindow {
    fn prune(&mut self, now: Instant) {
        // The clock may be under 60s old; nothing can be stale then.
        let Some(cutoff) = now.checked_sub(Duration::from_secs(60)) else {
            return;
        };
        while let Some(&front) = self.timestamps.front() {
            if front < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The risk-governance engine: one instance per trading process, shared by
/// reference with every caller on the order path.
pub struct RiskManager {
    config: RiskConfig,
    circuit_breaker: CircuitBreaker,
    drawdown_monitor: DrawdownMonitor,
    slippage_checker: SlippageChecker,
    order_rate: Mutex<OrderRateWindow>,
}

impl RiskManager {
    /// # Panics
    /// Panics on an invalid configuration.
    pub fn new(config: RiskConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("invalid risk configuration: {e}");
        }
        Self {
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker_config()),
            drawdown_monitor: DrawdownMonitor::new(config.drawdown_config()),
            slippage_checker: SlippageChecker::new(config.slippage_config()),
            order_rate: Mutex::new(OrderRateWindow {
                timestamps: VecDeque::new(),
                last_order: None,
            }),
            config,
        }
    }

    /// Initialize all stateful components with the account's equity.
    pub fn initialize(&self, initial_equity: Decimal) {
        self.circuit_breaker.initialize(initial_equity);
        self.drawdown_monitor.initialize(initial_equity);
        info!(equity = %initial_equity, "risk manager initialized");
    }

    /// Feed an equity observation (and a closed trade's P&L, when known) to
    /// the circuit breaker and drawdown monitor.
    pub fn update_equity(&self, current_equity: Decimal, trade_pnl: Option<Decimal>) {
        self.circuit_breaker.update_equity(current_equity, trade_pnl);
        self.drawdown_monitor.update(current_equity);
    }

    /// Pre-trade gate. Rules are evaluated in fixed order and the first
    /// violation rejects the order:
    ///
    /// 1. circuit breaker halted
    /// 2. drawdown stop
    /// 3. minimum order interval
    /// 4. orders-per-minute cap
    /// 5. order value cap
    /// 6. position-percentage cap (needs `total_equity > 0`)
    ///
    /// This method does not record the order; only a reported fill via
    /// [`RiskManager::post_trade_check`] counts against the rate limiter.
    pub fn pre_trade_check(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        current_position_value: Decimal,
        total_equity: Decimal,
    ) -> RiskCheckResult {
        if !self.circuit_breaker.can_trade() {
            let reason = format!("circuit breaker is {}", self.circuit_breaker.state());
            warn!(symbol = %symbol, reason = %reason, "order rejected");
            return RiskCheckResult::rejected(RiskLevel::Halted, reason);
        }

        if !self.drawdown_monitor.can_trade() {
            let reason = format!(
                "drawdown exceeded: {}",
                self.drawdown_monitor.current_drawdown()
            );
            warn!(symbol = %symbol, reason = %reason, "order rejected");
            return RiskCheckResult::rejected(RiskLevel::Halted, reason);
        }

        {
            let mut window = self.order_rate.lock();
            let now = Instant::now();

            if let Some(last) = window.last_order {
                if now.duration_since(last) < self.config.min_order_interval {
                    warn!(symbol = %symbol, "order rejected: interval too short");
                    return RiskCheckResult::rejected(
                        RiskLevel::High,
                        "order interval too short".to_string(),
                    );
                }
            }

            window.prune(now);
            if window.timestamps.len() >= self.config.max_orders_per_minute as usize {
                warn!(symbol = %symbol, "order rejected: per-minute cap");
                return RiskCheckResult::rejected(
                    RiskLevel::High,
                    "max orders per minute exceeded".to_string(),
                );
            }
        }

        let order_value = quantity * price;
        if order_value > self.config.max_order_value {
            let reason = format!(
                "order value {order_value} exceeds max {}",
                self.config.max_order_value
            );
            warn!(symbol = %symbol, reason = %reason, "order rejected");
            return RiskCheckResult::rejected(RiskLevel::High, reason);
        }

        if total_equity > Decimal::ZERO {
            let new_position_value = match side {
                OrderSide::Long => current_position_value + order_value,
                OrderSide::Short | OrderSide::Flat => current_position_value,
            };
            let position_pct = new_position_value / total_equity;
            if position_pct > self.config.max_position_pct {
                let reason = format!(
                    "position {position_pct} would exceed max {}",
                    self.config.max_position_pct
                );
                warn!(symbol = %symbol, reason = %reason, "order rejected");
                return RiskCheckResult::rejected(RiskLevel::High, reason);
            }
        }

        // Passing path: level and advisories from drawdown depth.
        let dd = self.drawdown_monitor.current_drawdown();
        let (risk_level, warnings) = if dd >= self.config.critical_drawdown {
            (
                RiskLevel::Critical,
                vec![format!("high drawdown: {dd}")],
            )
        } else if dd >= self.config.warning_drawdown {
            (RiskLevel::High, vec![format!("elevated drawdown: {dd}")])
        } else if dd >= self.config.warning_drawdown / Decimal::from(2) {
            (RiskLevel::Medium, Vec::new())
        } else {
            (RiskLevel::Low, Vec::new())
        };

        RiskCheckResult::passed(risk_level, warnings)
    }

    /// Post-trade reporting: records the order against the rate limiter and
    /// checks the fill's slippage.
    pub fn post_trade_check(
        &self,
        symbol: &str,
        expected_price: Decimal,
        executed_price: Decimal,
        order_id: Option<&str>,
    ) -> SlippageViolation {
        {
            let mut window = self.order_rate.lock();
            let now = Instant::now();
            window.last_order = Some(now);
            window.timestamps.push_back(now);
            window.prune(now);
        }

        self.slippage_checker
            .check_slippage(symbol, expected_price, executed_price, order_id)
    }

    /// Operator override: trip the circuit breaker immediately.
    pub fn force_halt(&self, reason: &str) {
        self.circuit_breaker.force_trip(reason);
        warn!(reason = %reason, "trading halted");
    }

    /// Operator override: close the breaker and clear the drawdown stop.
    pub fn resume_trading(&self) {
        self.circuit_breaker.force_recover();
        self.drawdown_monitor.reset_exceeded();
        info!("trading resumed");
    }

    /// Read-only classification of current account risk. Never consumes a
    /// half-open trial slot.
    pub fn get_risk_level(&self) -> RiskLevel {
        if !self.circuit_breaker.trading_allowed() || !self.drawdown_monitor.can_trade() {
            return RiskLevel::Halted;
        }

        let dd = self.drawdown_monitor.current_drawdown();
        let daily_return = self.circuit_breaker.stats().daily_return();

        if dd >= self.config.critical_drawdown || daily_return <= Decimal::new(-2, 2) {
            RiskLevel::Critical
        } else if dd >= self.config.warning_drawdown || daily_return <= Decimal::new(-1, 2) {
            RiskLevel::High
        } else if dd >= self.config.warning_drawdown / Decimal::from(2) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Register a handler for one of the engine's event kinds. The kind
    /// determines which component(s) the subscription reaches; `Warning`
    /// covers both drawdown warnings and slippage warnings.
    pub fn register_callback(&self, kind: RiskEventKind, handler: EventHandler) {
        match kind {
            RiskEventKind::Trip | RiskEventKind::HalfOpen | RiskEventKind::Recover => {
                self.circuit_breaker.subscribe(kind, handler);
            }
            RiskEventKind::Critical | RiskEventKind::Exceeded | RiskEventKind::Alert => {
                self.drawdown_monitor.subscribe(kind, handler);
            }
            RiskEventKind::Warning => {
                self.drawdown_monitor.subscribe(kind, handler.clone());
                self.slippage_checker.subscribe(kind, handler);
            }
            RiskEventKind::Violation => {
                self.slippage_checker.subscribe(kind, handler);
            }
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn drawdown_monitor(&self) -> &DrawdownMonitor {
        &self.drawdown_monitor
    }

    pub fn slippage_checker(&self) -> &SlippageChecker {
        &self.slippage_checker
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Composite snapshot for monitoring and dashboards. Field names are a
    /// stable contract. Never consumes a half-open trial slot.
    pub fn get_status(&self) -> RiskStatus {
        let orders_last_minute = {
            let mut window = self.order_rate.lock();
            window.prune(Instant::now());
            window.timestamps.len()
        };
        RiskStatus {
            risk_level: self.get_risk_level(),
            can_trade: self.circuit_breaker.trading_allowed()
                && self.drawdown_monitor.can_trade(),
            circuit_breaker: self.circuit_breaker.status(),
            drawdown: self.drawdown_monitor.status(),
            slippage: self.slippage_checker.status(),
            order_rate: OrderRateStatus {
                orders_last_minute,
                max_per_minute: self.config.max_orders_per_minute,
                min_interval: self.config.min_order_interval,
            },
            config: self.config.clone(),
        }
    }
}
