//! Integration tests for component interactions.
//!
//! These tests drive the risk manager through full pre-trade / post-trade
//! cycles and verify that the circuit breaker, drawdown monitor and slippage
//! checker cooperate as one gate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use risk_engine::{
    OrderSide, RiskConfig, RiskEvent, RiskEventKind, RiskLevel, RiskManager,
};

/// Default limits with the timing rules disabled so checks are deterministic.
fn quiet_config() -> RiskConfig {
    RiskConfig {
        min_order_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn small_order(manager: &RiskManager) -> risk_engine::RiskCheckResult {
    manager.pre_trade_check(
        "AAPL",
        OrderSide::Long,
        Decimal::new(10, 0),
        Decimal::new(100, 0),
        Decimal::ZERO,
        Decimal::new(50_000, 0),
    )
}

/// A 4% daily loss trips the breaker and blocks the next order.
#[test]
fn breaker_trip_blocks_orders_end_to_end() {
    let manager = RiskManager::new(quiet_config());
    manager.initialize(Decimal::new(50_000, 0));

    let trips = Arc::new(AtomicUsize::new(0));
    let seen = trips.clone();
    manager.register_callback(
        RiskEventKind::Trip,
        Arc::new(move |event| {
            assert!(matches!(event, RiskEvent::Trip { .. }));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    assert!(small_order(&manager).allowed);

    manager.update_equity(Decimal::new(48_000, 0), Some(Decimal::new(-2_000, 0)));

    let result = small_order(&manager);
    assert!(!result.allowed);
    assert_eq!(result.risk_level, RiskLevel::Halted);
    assert!(result.reasons[0].contains("circuit breaker"));
    assert_eq!(manager.get_risk_level(), RiskLevel::Halted);
    assert_eq!(trips.load(Ordering::SeqCst), 1);
}

/// The drawdown stop halts trading independently of the breaker, and
/// `resume_trading` clears it.
#[test]
fn drawdown_stop_halts_and_resume_clears() {
    // Breaker threshold lifted so only the drawdown stop can halt.
    let config = RiskConfig {
        daily_loss_threshold: Decimal::ONE,
        ..quiet_config()
    };
    let manager = RiskManager::new(config);
    manager.initialize(Decimal::new(50_000, 0));

    // 16% drawdown from the peak.
    manager.update_equity(Decimal::new(42_000, 0), None);

    let result = small_order(&manager);
    assert!(!result.allowed);
    assert_eq!(result.risk_level, RiskLevel::Halted);
    assert!(result.reasons[0].contains("drawdown"));

    manager.resume_trading();

    // Still deep under water, but the sticky stop has been cleared.
    let result = small_order(&manager);
    assert!(result.allowed);
    assert_eq!(result.risk_level, RiskLevel::Critical);
}

#[test]
fn order_value_cap_rejects_oversized_orders() {
    let manager = RiskManager::new(quiet_config());
    manager.initialize(Decimal::new(500_000, 0));

    // 100 * 600 = 60,000 > 50,000 cap.
    let result = manager.pre_trade_check(
        "AAPL",
        OrderSide::Long,
        Decimal::new(100, 0),
        Decimal::new(600, 0),
        Decimal::ZERO,
        Decimal::new(500_000, 0),
    );
    assert!(!result.allowed);
    assert_eq!(result.risk_level, RiskLevel::High);
    assert!(result.reasons[0].contains("order value"));
}

/// A reported fill counts against the rate limiter and runs the slippage
/// check; violations reach registered callbacks.
#[test]
fn fill_flow_records_rate_and_slippage() {
    let manager = RiskManager::new(quiet_config());
    manager.initialize(Decimal::new(50_000, 0));

    let violations = Arc::new(AtomicUsize::new(0));
    let seen = violations.clone();
    manager.register_callback(
        RiskEventKind::Violation,
        Arc::new(move |event| {
            assert!(matches!(event, RiskEvent::Violation(_)));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    assert!(small_order(&manager).allowed);

    // 100.00 -> 100.30 is 0.3% slippage, above the 0.2% limit.
    let record = manager.post_trade_check(
        "AAPL",
        Decimal::new(100, 0),
        Decimal::new(10_030, 2),
        Some("order-1"),
    );
    assert!(record.is_violation());
    assert_eq!(record.slippage, Decimal::new(3, 3));
    assert_eq!(violations.load(Ordering::SeqCst), 1);

    let status = manager.get_status();
    assert_eq!(status.order_rate.orders_last_minute, 1);
    assert_eq!(status.slippage.total_checks, 1);
    assert_eq!(status.slippage.violation_count, 1);

    // The fill does not block the next order under the quiet config.
    assert!(small_order(&manager).allowed);
}

#[test]
fn force_halt_round_trip() {
    let manager = RiskManager::new(quiet_config());
    manager.initialize(Decimal::new(50_000, 0));

    manager.force_halt("manual intervention");
    let result = small_order(&manager);
    assert!(!result.allowed);
    assert_eq!(result.risk_level, RiskLevel::Halted);
    assert_eq!(
        manager.circuit_breaker().trip_reason().as_deref(),
        Some("manual intervention")
    );

    manager.resume_trading();
    assert!(small_order(&manager).allowed);
    assert_eq!(manager.get_risk_level(), RiskLevel::Low);
}

/// The composite status snapshot serializes with its documented field names.
#[test]
fn status_snapshot_serializes() {
    let manager = RiskManager::new(quiet_config());
    manager.initialize(Decimal::new(50_000, 0));
    manager.update_equity(Decimal::new(49_900, 0), Some(Decimal::new(-100, 0)));

    let value = serde_json::to_value(manager.get_status()).unwrap();
    assert_eq!(value["risk_level"], "low");
    assert_eq!(value["can_trade"], true);
    assert_eq!(value["circuit_breaker"]["state"], "closed");
    assert_eq!(value["drawdown"]["alert_level"], "normal");
    assert!(value["slippage"]["total_checks"].is_u64());
    assert!(value["order_rate"]["max_per_minute"].is_u64());
}
