//! Risk Engine
//!
//! Real-time risk governance for automated equities trading. Every order
//! attempt passes through [`RiskManager::pre_trade_check`]; fills are
//! reported back through [`RiskManager::post_trade_check`] and
//! [`RiskManager::update_equity`] so the engine can autonomously halt
//! trading when loss conditions are met.
//!
//! - `circuit_breaker`: daily-loss / consecutive-loss halt with half-open recovery
//! - `drawdown_monitor`: peak tracking, leveled alerts, max-drawdown hard stop
//! - `slippage_checker`: realized slippage validation and spread pre-checks
//! - `risk_manager`: orchestration, order-rate limiting, value/position caps
//! - `performance`: trade bookkeeping and derived performance metrics
//!
//! The engine is synchronous and in-memory: no threads, no I/O, no waiting.
//! Construct one [`RiskManager`] and share it by reference.

use rust_decimal::Decimal;

pub mod circuit_breaker;
pub mod drawdown_monitor;
pub mod events;
pub mod performance;
pub mod risk_manager;
pub mod slippage_checker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStatus, TradingStats,
};
pub use drawdown_monitor::{
    DrawdownAlert, DrawdownAlertLevel, DrawdownConfig, DrawdownMonitor, DrawdownStatus, EquityPoint,
};
pub use events::{EventBus, EventHandler, RiskEvent, RiskEventKind};
pub use performance::{
    DailyStats, EquityCurvePoint, PerformanceAnalyzer, PerformanceMetrics, TradeRecord,
};
pub use risk_manager::{
    OrderRateStatus, OrderSide, RiskCheckResult, RiskConfig, RiskLevel, RiskManager, RiskStatus,
};
pub use slippage_checker::{
    SlippageChecker, SlippageConfig, SlippageStatus, SlippageViolation,
};

/// Rejected configuration value.
///
/// A nonsensical threshold is a programmer error with safety implications, so
/// component constructors panic on it rather than clamping. The `validate`
/// methods are public for callers that load configuration from files and want
/// to reject bad input gracefully instead.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: Decimal },
    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
