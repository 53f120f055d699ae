//! Trade performance bookkeeping and derived metrics.
//!
//! Tracks closed trades, an equity curve and per-day statistics, and derives
//! the usual summary metrics: Sharpe and Sortino ratios, annualized
//! volatility, max drawdown with duration, profit factor, fill rate and
//! holding times. Ratio math runs in `f64`; money stays in `Decimal`.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::risk_manager::OrderSide;

/// Annualized risk-free rate used for Sharpe/Sortino.
const RISK_FREE_RATE: f64 = 0.05;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// One round-trip (or still-open) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub closed: bool,
}

impl TradeRecord {
    /// Open a new trade at the given entry.
    pub fn open(
        trade_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            exit_price: None,
            entry_time: Utc::now(),
            exit_time: None,
            commission: Decimal::ZERO,
            slippage: Decimal::ZERO,
            closed: false,
        }
    }

    /// Close the trade at the given exit price.
    pub fn close(&mut self, exit_price: Decimal) {
        self.exit_price = Some(exit_price);
        self.exit_time = Some(Utc::now());
        self.closed = true;
    }

    /// Directional P&L before commission; zero while open or for flat trades.
    pub fn gross_pnl(&self) -> Decimal {
        let exit = match (self.closed, self.exit_price) {
            (true, Some(exit)) => exit,
            _ => return Decimal::ZERO,
        };
        match self.side {
            OrderSide::Long => (exit - self.entry_price) * self.quantity,
            OrderSide::Short => (self.entry_price - exit) * self.quantity,
            OrderSide::Flat => Decimal::ZERO,
        }
    }

    pub fn net_pnl(&self) -> Decimal {
        self.gross_pnl() - self.commission
    }

    /// Return on the entry notional; zero when the notional is not positive.
    pub fn return_pct(&self) -> Decimal {
        let notional = self.entry_price * self.quantity;
        if notional > Decimal::ZERO {
            self.gross_pnl() / notional
        } else {
            Decimal::ZERO
        }
    }

    pub fn holding_time(&self) -> Option<chrono::Duration> {
        self.exit_time.map(|exit| exit - self.entry_time)
    }
}

/// Statistics for one trading day.
#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub starting_equity: Decimal,
    pub ending_equity: Decimal,
    pub high_watermark: Decimal,
    pub low_watermark: Decimal,
    pub total_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub trade_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub total_volume: Decimal,
    pub total_commission: Decimal,
}

impl DailyStats {
    fn new(date: NaiveDate, starting_equity: Decimal, current_equity: Decimal) -> Self {
        Self {
            date,
            starting_equity,
            ending_equity: current_equity,
            high_watermark: current_equity,
            low_watermark: current_equity,
            total_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            total_volume: Decimal::ZERO,
            total_commission: Decimal::ZERO,
        }
    }

    pub fn daily_return(&self) -> Decimal {
        if self.starting_equity > Decimal::ZERO {
            (self.ending_equity - self.starting_equity) / self.starting_equity
        } else {
            Decimal::ZERO
        }
    }

    /// Intraday high-to-low drawdown.
    pub fn drawdown(&self) -> Decimal {
        if self.high_watermark > Decimal::ZERO {
            (self.high_watermark - self.low_watermark) / self.high_watermark
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

/// Summary metrics derived from the recorded history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total_return: Decimal,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: Decimal,
    pub max_drawdown_duration_days: i64,
    pub volatility: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub profit_factor: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub avg_trade: Decimal,
    pub total_volume: Decimal,
    pub avg_daily_volume: Decimal,
    pub fill_rate: Decimal,
    pub avg_slippage: Decimal,
    pub trading_days: usize,
    pub avg_holding_time_hours: f64,
}

/// Point on the equity curve.
#[derive(Debug, Clone, Serialize)]
pub struct EquityCurvePoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

struct AnalyzerInner {
    initial_equity: Decimal,
    current_equity: Decimal,
    high_watermark: Decimal,
    trades: Vec<TradeRecord>,
    daily_stats: Vec<DailyStats>,
    daily_returns: Vec<Decimal>,
    equity_curve: Vec<EquityCurvePoint>,
    today: Option<DailyStats>,
    orders_submitted: u64,
    orders_filled: u64,
    orders_rejected: u64,
    total_slippage: Decimal,
}

impl AnalyzerInner {
    fn fresh(initial_equity: Decimal) -> Self {
        Self {
            initial_equity,
            current_equity: initial_equity,
            high_watermark: initial_equity,
            trades: Vec::new(),
            daily_stats: Vec::new(),
            daily_returns: Vec::new(),
            equity_curve: Vec::new(),
            today: None,
            orders_submitted: 0,
            orders_filled: 0,
            orders_rejected: 0,
            total_slippage: Decimal::ZERO,
        }
    }
}

/// In-memory trade performance tracker.
pub struct PerformanceAnalyzer {
    inner: Mutex<AnalyzerInner>,
}

impl PerformanceAnalyzer {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            inner: Mutex::new(AnalyzerInner::fresh(initial_equity)),
        }
    }

    /// Record a trade. Closed trades move equity, extend the equity curve
    /// and roll the daily statistics; open trades are only stored.
    pub fn record_trade(&self, trade: TradeRecord) {
        let mut inner = self.inner.lock();
        let closed = trade.closed;
        let net_pnl = trade.net_pnl();
        let volume = trade.entry_price * trade.quantity;
        let commission = trade.commission;
        inner.trades.push(trade);

        if closed {
            inner.current_equity += net_pnl;
            let equity = inner.current_equity;
            inner.equity_curve.push(EquityCurvePoint {
                timestamp: Utc::now(),
                equity,
            });
            if equity > inner.high_watermark {
                inner.high_watermark = equity;
            }
            Self::roll_daily_stats(&mut inner, net_pnl, volume, commission);
        }
    }

    /// Count an order submission.
    pub fn record_submission(&self) {
        self.inner.lock().orders_submitted += 1;
    }

    /// Count a filled order and its absolute slippage.
    pub fn record_fill(&self, slippage: Decimal) {
        let mut inner = self.inner.lock();
        inner.orders_filled += 1;
        inner.total_slippage += slippage.abs();
    }

    /// Count a rejected order.
    pub fn record_rejection(&self) {
        self.inner.lock().orders_rejected += 1;
    }

    fn roll_daily_stats(
        inner: &mut AnalyzerInner,
        net_pnl: Decimal,
        volume: Decimal,
        commission: Decimal,
    ) {
        let today = Utc::now().date_naive();

        let rollover = inner.today.as_ref().map(|stats| stats.date != today);
        match rollover {
            None | Some(true) => {
                if let Some(finished) = inner.today.take() {
                    inner.daily_returns.push(finished.daily_return());
                    inner.daily_stats.push(finished);
                }
                let starting = inner.current_equity - net_pnl;
                inner.today = Some(DailyStats::new(today, starting, inner.current_equity));
            }
            Some(false) => {}
        }

        let equity = inner.current_equity;
        let Some(stats) = inner.today.as_mut() else {
            return;
        };
        stats.ending_equity = equity;
        stats.high_watermark = stats.high_watermark.max(equity);
        stats.low_watermark = stats.low_watermark.min(equity);
        stats.total_pnl += net_pnl;
        stats.realized_pnl += net_pnl;
        stats.trade_count += 1;
        stats.total_volume += volume;
        stats.total_commission += commission;
        if net_pnl > Decimal::ZERO {
            stats.win_count += 1;
        } else if net_pnl < Decimal::ZERO {
            stats.loss_count += 1;
        }
    }

    /// Compute the full metric set from the recorded history.
    pub fn metrics(&self) -> PerformanceMetrics {
        let inner = self.inner.lock();

        let mut returns: Vec<f64> = inner
            .daily_returns
            .iter()
            .map(|r| r.to_f64().unwrap_or(0.0))
            .collect();
        if let Some(today) = &inner.today {
            returns.push(today.daily_return().to_f64().unwrap_or(0.0));
        }

        let closed: Vec<&TradeRecord> = inner.trades.iter().filter(|t| t.closed).collect();
        let wins: Vec<Decimal> = closed
            .iter()
            .map(|t| t.net_pnl())
            .filter(|p| *p > Decimal::ZERO)
            .collect();
        let losses: Vec<Decimal> = closed
            .iter()
            .map(|t| t.net_pnl())
            .filter(|p| *p < Decimal::ZERO)
            .collect();

        let total_return = if inner.initial_equity > Decimal::ZERO {
            (inner.current_equity - inner.initial_equity) / inner.initial_equity
        } else {
            Decimal::ZERO
        };
        let trading_days = returns.len().max(1);
        let annualized_return = (1.0 + total_return.to_f64().unwrap_or(0.0))
            .powf(TRADING_DAYS_PER_YEAR / trading_days as f64)
            - 1.0;

        let (max_drawdown, max_drawdown_duration_days) =
            max_drawdown_of(&inner.equity_curve, inner.initial_equity);

        let fill_rate =
            Decimal::from(inner.orders_filled) / Decimal::from(inner.orders_submitted.max(1));
        let avg_slippage = inner.total_slippage / Decimal::from(inner.orders_filled.max(1));

        let holding_hours: Vec<f64> = closed
            .iter()
            .filter_map(|t| t.holding_time())
            .map(|d| d.num_seconds() as f64 / 3600.0)
            .collect();
        let avg_holding_time_hours = if holding_hours.is_empty() {
            0.0
        } else {
            holding_hours.iter().sum::<f64>() / holding_hours.len() as f64
        };

        let mut total_volume: Decimal = inner.daily_stats.iter().map(|s| s.total_volume).sum();
        if let Some(today) = &inner.today {
            total_volume += today.total_volume;
        }
        let avg_daily_volume = total_volume / Decimal::from(trading_days as u64);

        let sum_wins: Decimal = wins.iter().copied().sum();
        let sum_losses: Decimal = losses.iter().copied().sum();
        let sum_all: Decimal = closed.iter().map(|t| t.net_pnl()).sum();

        PerformanceMetrics {
            total_return,
            annualized_return,
            sharpe_ratio: sharpe_ratio(&returns),
            sortino_ratio: sortino_ratio(&returns),
            max_drawdown,
            max_drawdown_duration_days,
            volatility: annualized_volatility(&returns),
            total_trades: closed.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: Decimal::from(wins.len() as u64)
                / Decimal::from(closed.len().max(1) as u64),
            profit_factor: profit_factor(sum_wins, sum_losses),
            avg_win: sum_wins / Decimal::from(wins.len().max(1) as u64),
            avg_loss: sum_losses / Decimal::from(losses.len().max(1) as u64),
            avg_trade: sum_all / Decimal::from(closed.len().max(1) as u64),
            total_volume,
            avg_daily_volume,
            fill_rate,
            avg_slippage,
            trading_days,
            avg_holding_time_hours,
        }
    }

    /// Per-day statistics, including the in-progress day.
    pub fn daily_stats(&self) -> Vec<DailyStats> {
        let inner = self.inner.lock();
        let mut stats = inner.daily_stats.clone();
        if let Some(today) = &inner.today {
            stats.push(today.clone());
        }
        stats
    }

    /// The most recent `last_n` trades, oldest first.
    pub fn trades(&self, last_n: usize) -> Vec<TradeRecord> {
        let inner = self.inner.lock();
        let start = inner.trades.len().saturating_sub(last_n);
        inner.trades[start..].to_vec()
    }

    pub fn equity_curve(&self) -> Vec<EquityCurvePoint> {
        self.inner.lock().equity_curve.clone()
    }

    pub fn current_equity(&self) -> Decimal {
        self.inner.lock().current_equity
    }

    /// Drop all history; optionally rebase on a new initial equity.
    pub fn reset(&self, initial_equity: Option<Decimal>) {
        let mut inner = self.inner.lock();
        let base = initial_equity.unwrap_or(inner.initial_equity);
        *inner = AnalyzerInner::fresh(base);
        info!(equity = %base, "performance analyzer reset");
    }
}

/// Annualized Sharpe ratio over daily returns; zero with fewer than two
/// observations or zero dispersion.
fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let avg = returns.iter().sum::<f64>() / n;
    let excess = avg - RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    (excess / std_dev) * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Annualized Sortino ratio: like Sharpe but penalizing only downside
/// deviation. Infinite when there are excess returns and no down days.
fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let avg = returns.iter().sum::<f64>() / n;
    let excess = avg - RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return if excess > 0.0 { f64::INFINITY } else { 0.0 };
    }
    let downside_std = (downside.iter().map(|r| r.powi(2)).sum::<f64>() / n).sqrt();
    if downside_std == 0.0 {
        return 0.0;
    }
    (excess / downside_std) * TRADING_DAYS_PER_YEAR.sqrt()
}

fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let avg = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

fn profit_factor(gross_profit: Decimal, gross_loss_signed: Decimal) -> f64 {
    let gross_loss = gross_loss_signed.abs();
    if gross_loss == Decimal::ZERO {
        return if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };
    }
    (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
}

/// Walk the equity curve and find the deepest peak-to-trough decline and the
/// longest time spent below a peak, in whole days.
fn max_drawdown_of(curve: &[EquityCurvePoint], initial_equity: Decimal) -> (Decimal, i64) {
    if curve.is_empty() {
        return (Decimal::ZERO, 0);
    }

    let mut peak = initial_equity;
    let mut max_dd = Decimal::ZERO;
    let mut max_duration_days: i64 = 0;
    let mut drawdown_start: Option<DateTime<Utc>> = None;

    for point in curve {
        if point.equity > peak {
            peak = point.equity;
            drawdown_start = None;
        } else if peak > Decimal::ZERO {
            let dd = (peak - point.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
            match drawdown_start {
                None => drawdown_start = Some(point.timestamp),
                Some(start) => {
                    let days = (point.timestamp - start).num_days();
                    if days > max_duration_days {
                        max_duration_days = days;
                    }
                }
            }
        }
    }

    (max_dd, max_duration_days)
}
