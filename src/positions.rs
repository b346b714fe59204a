// ===============================
// src/positions.rs (paper ledger: cash, posisi, PnL, auto-exit)
// ===============================

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::domain::{Exposure, Order, OrderOrigin, PortfolioSnapshot, Position, Side, Trade};

const QTY_EPS: f64 = 1e-9;
const MAX_EQUITY_POINTS: usize = 10_000;
const SECS_PER_YEAR: f64 = 365.0 * 86_400.0;

/// Pelanggaran invariant ledger. Bukan policy outcome: engine
/// mengangkat ini sebagai alert operator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("insufficient cash for {symbol}: need {needed:.2}, have {available:.2}")]
    InsufficientCash { symbol: String, needed: f64, available: f64 },
    #[error("no open position for {0}")]
    NoPosition(String),
    #[error("close of {requested} {symbol} exceeds open quantity {open}")]
    OversizedClose { symbol: String, requested: f64, open: f64 },
    #[error("invalid order {id}: {reason}")]
    InvalidOrder { id: String, reason: String },
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Executed(Trade),
    /// Order id sudah pernah diterapkan (replay tick yang sama).
    Duplicate,
}

pub struct Ledger {
    initial_capital: f64,
    cash: f64,
    fee_rate: f64,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    applied: HashSet<String>,
    equity: Vec<(DateTime<Utc>, f64)>,
    next_trade_id: u64,
}

impl Ledger {
    pub fn new(initial_capital: f64, fee_rate: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            fee_rate,
            positions: HashMap::new(),
            trades: Vec::new(),
            applied: HashSet::new(),
            equity: Vec::new(),
            next_trade_id: 1,
        }
    }

    pub fn cash(&self) -> f64 { self.cash }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.positions.values().cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }

    /// `limit` trade terbaru, terbaru lebih dulu.
    pub fn trades(&self, limit: usize) -> Vec<Trade> {
        self.trades.iter().rev().take(limit).cloned().collect()
    }

    pub fn all_trades(&self) -> &[Trade] { &self.trades }

    pub fn total_value(&self) -> f64 {
        self.cash + self.positions.values().map(Position::market_value).sum::<f64>()
    }

    /// Restore dari store. `trades` (urut id) adalah sumber kebenaran: cash,
    /// posisi, dan dedup set di-replay dari history. Snapshot `positions`
    /// hanya dipakai untuk harga mark terakhir.
    pub fn restore(&mut self, marks: Vec<Position>, mut trades: Vec<Trade>) {
        trades.sort_by_key(|t| t.id);
        self.cash = self.initial_capital;
        self.positions.clear();
        for t in &trades {
            self.replay_fill(t);
            self.applied.insert(t.order_id.clone());
        }
        for m in marks {
            if let Some(pos) = self.positions.get_mut(&m.symbol) {
                if m.last_price.is_finite() && m.last_price > 0.0 {
                    pos.last_price = m.last_price;
                    pos.unrealized_pnl = (pos.last_price - pos.avg_entry_price) * pos.quantity;
                }
            }
        }
        self.next_trade_id = trades.last().map(|t| t.id).unwrap_or(0) + 1;
        self.trades = trades;
    }

    /// Terapkan ulang satu fill historis tanpa validasi ulang.
    fn replay_fill(&mut self, t: &Trade) {
        let notional = t.quantity * t.price;
        match t.side {
            Side::Buy => {
                self.cash -= notional + t.fees;
                let pos = self.positions.entry(t.symbol.clone()).or_insert_with(|| Position {
                    symbol: t.symbol.clone(),
                    quantity: 0.0,
                    avg_entry_price: t.price,
                    stop_loss: None,
                    take_profit: None,
                    opened_at: t.timestamp,
                    realized_pnl: 0.0,
                    last_price: t.price,
                    unrealized_pnl: 0.0,
                });
                let qty = pos.quantity + t.quantity;
                pos.avg_entry_price = (pos.avg_entry_price * pos.quantity + t.price * t.quantity) / qty;
                pos.quantity = qty;
                pos.last_price = t.price;
                pos.stop_loss = t.stop_loss.or(pos.stop_loss);
                pos.take_profit = t.take_profit.or(pos.take_profit);
                pos.unrealized_pnl = (pos.last_price - pos.avg_entry_price) * pos.quantity;
            }
            Side::Sell => {
                self.cash += notional - t.fees;
                let Some(pos) = self.positions.get_mut(&t.symbol) else {
                    warn!(symbol = %t.symbol, trade = t.id, "sell without open position in history");
                    return;
                };
                pos.quantity -= t.quantity.min(pos.quantity);
                pos.realized_pnl += t.realized_pnl.unwrap_or(0.0);
                pos.last_price = t.price;
                pos.unrealized_pnl = (pos.last_price - pos.avg_entry_price) * pos.quantity;
                if pos.quantity <= QTY_EPS {
                    self.positions.remove(&t.symbol);
                }
            }
        }
    }

    pub fn apply(&mut self, order: &Order, now: DateTime<Utc>) -> Result<ApplyOutcome, LedgerError> {
        if self.applied.contains(&order.id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(LedgerError::InvalidOrder { id: order.id.clone(), reason: format!("quantity {}", order.quantity) });
        }
        if !(order.price.is_finite() && order.price > 0.0) {
            return Err(LedgerError::InvalidOrder { id: order.id.clone(), reason: format!("price {}", order.price) });
        }

        let (filled, fees, realized) = match order.side {
            Side::Buy => {
                let notional = order.notional();
                let fees = notional * self.fee_rate;
                let needed = notional + fees;
                if needed > self.cash + QTY_EPS {
                    return Err(LedgerError::InsufficientCash {
                        symbol: order.symbol.clone(),
                        needed,
                        available: self.cash,
                    });
                }
                self.cash -= needed;
                match self.positions.get_mut(&order.symbol) {
                    Some(pos) => {
                        // add: average price volume-weighted
                        let qty = pos.quantity + order.quantity;
                        pos.avg_entry_price = (pos.avg_entry_price * pos.quantity + order.price * order.quantity) / qty;
                        pos.quantity = qty;
                        pos.last_price = order.price;
                        pos.stop_loss = order.stop_loss.or(pos.stop_loss);
                        pos.take_profit = order.take_profit.or(pos.take_profit);
                        pos.unrealized_pnl = (pos.last_price - pos.avg_entry_price) * pos.quantity;
                    }
                    None => {
                        self.positions.insert(
                            order.symbol.clone(),
                            Position {
                                symbol: order.symbol.clone(),
                                quantity: order.quantity,
                                avg_entry_price: order.price,
                                stop_loss: order.stop_loss,
                                take_profit: order.take_profit,
                                opened_at: now,
                                realized_pnl: 0.0,
                                last_price: order.price,
                                unrealized_pnl: 0.0,
                            },
                        );
                    }
                }
                (order.quantity, fees, None)
            }
            Side::Sell => {
                let pos = self
                    .positions
                    .get_mut(&order.symbol)
                    .ok_or_else(|| LedgerError::NoPosition(order.symbol.clone()))?;
                if order.quantity > pos.quantity + QTY_EPS {
                    return Err(LedgerError::OversizedClose {
                        symbol: order.symbol.clone(),
                        requested: order.quantity,
                        open: pos.quantity,
                    });
                }
                let closed = order.quantity.min(pos.quantity);
                let fees = closed * order.price * self.fee_rate;
                let pnl = (order.price - pos.avg_entry_price) * closed - fees;
                self.cash += closed * order.price - fees;
                pos.quantity -= closed;
                pos.realized_pnl += pnl;
                pos.last_price = order.price;
                pos.unrealized_pnl = (pos.last_price - pos.avg_entry_price) * pos.quantity;
                if pos.quantity <= QTY_EPS {
                    self.positions.remove(&order.symbol);
                }
                (closed, fees, Some(pnl))
            }
        };

        let trade = Trade {
            id: self.next_trade_id,
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: filled,
            price: order.price,
            fees,
            realized_pnl: realized,
            timestamp: now,
            strategy: order.strategy.clone(),
            origin: order.origin,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
        };
        self.next_trade_id += 1;
        self.applied.insert(order.id.clone());
        self.trades.push(trade.clone());
        Ok(ApplyOutcome::Executed(trade))
    }

    /// Order penutupan penuh untuk posisi `symbol` di harga `price`.
    pub fn close_order(
        &self,
        symbol: &str,
        price: f64,
        origin: OrderOrigin,
        tick_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Order, LedgerError> {
        let pos = self
            .positions
            .get(symbol)
            .ok_or_else(|| LedgerError::NoPosition(symbol.to_string()))?;
        Ok(Order {
            id: Order::dedup_key(symbol, Side::Sell, origin, tick_ts),
            symbol: symbol.to_string(),
            side: Side::Sell,
            quantity: pos.quantity,
            price,
            stop_loss: pos.stop_loss,
            take_profit: pos.take_profit,
            strategy: origin.as_str().to_string(),
            origin,
            created_at: now,
        })
    }

    /// Re-mark posisi ke harga terbaru; kalau SL/TP tersentuh, ledger
    /// sendiri membuat & menerapkan order penutupan (tanpa arbitrase/risk).
    pub fn mark_and_exit(
        &mut self,
        symbol: &str,
        price: f64,
        tick_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Trade>, LedgerError> {
        let Some(pos) = self.positions.get_mut(symbol) else { return Ok(None) };
        if !(price.is_finite() && price > 0.0) {
            return Ok(None);
        }
        pos.last_price = price;
        pos.unrealized_pnl = (price - pos.avg_entry_price) * pos.quantity;

        let origin = match (pos.stop_loss, pos.take_profit) {
            (Some(sl), _) if price <= sl => OrderOrigin::StopLoss,
            (_, Some(tp)) if price >= tp => OrderOrigin::TakeProfit,
            _ => return Ok(None),
        };
        let order = self.close_order(symbol, price, origin, tick_ts, now)?;
        match self.apply(&order, now)? {
            ApplyOutcome::Executed(t) => Ok(Some(t)),
            ApplyOutcome::Duplicate => Ok(None),
        }
    }

    pub fn record_equity(&mut self, at: DateTime<Utc>) {
        let v = self.total_value();
        self.equity.push((at, v));
        if self.equity.len() > MAX_EQUITY_POINTS {
            let excess = self.equity.len() - MAX_EQUITY_POINTS;
            self.equity.drain(..excess);
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PortfolioSnapshot {
        let total_value = self.total_value();
        let invested: f64 = self.positions.values().map(Position::market_value).sum();
        let unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let realized: f64 = self.trades.iter().filter_map(|t| t.realized_pnl).sum();

        let mut curve: Vec<f64> = Vec::with_capacity(self.equity.len() + 2);
        curve.push(self.initial_capital);
        curve.extend(self.equity.iter().map(|(_, v)| *v));
        curve.push(total_value);

        let mut exposures: Vec<Exposure> = self
            .positions
            .values()
            .map(|p| Exposure { symbol: p.symbol.clone(), quantity: p.quantity, market_value: p.market_value() })
            .collect();
        exposures.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        PortfolioSnapshot {
            ts: now,
            initial_capital: self.initial_capital,
            cash: self.cash,
            invested,
            total_value,
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            total_return_pct: if self.initial_capital > 0.0 {
                (total_value - self.initial_capital) / self.initial_capital * 100.0
            } else {
                0.0
            },
            sharpe_ratio: sharpe_ratio(&curve, self.periods_per_year()),
            max_drawdown: max_drawdown(&curve),
            current_drawdown: current_drawdown(&curve),
            win_rate: win_rate(&self.trades),
            open_positions: self.positions.len(),
            trade_count: self.trades.len(),
            exposures,
        }
    }

    fn periods_per_year(&self) -> f64 {
        match (self.equity.first(), self.equity.last()) {
            (Some((a, _)), Some((b, _))) if self.equity.len() > 1 => {
                let span = (*b - *a).num_seconds() as f64 / (self.equity.len() - 1) as f64;
                if span > 0.0 { SECS_PER_YEAR / span } else { 0.0 }
            }
            _ => 0.0,
        }
    }
}

// ─── metrics (pure) ───

fn period_returns(curve: &[f64]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Sharpe annualized dengan jumlah periode per tahun dari jarak sampel equity.
pub fn sharpe_ratio(curve: &[f64], periods_per_year: f64) -> f64 {
    let r = period_returns(curve);
    if r.len() < 2 || periods_per_year <= 0.0 {
        return 0.0;
    }
    let n = r.len() as f64;
    let mean = r.iter().sum::<f64>() / n;
    let var = r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std < 1e-15 {
        return 0.0;
    }
    mean / std * periods_per_year.sqrt()
}

/// Max drawdown sebagai fraksi positif (0.2 = turun 20% dari puncak).
pub fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &v in curve {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

pub fn current_drawdown(curve: &[f64]) -> f64 {
    let peak = curve.iter().copied().fold(f64::MIN, f64::max);
    match curve.last() {
        Some(&last) if peak > 0.0 => ((peak - last) / peak).max(0.0),
        _ => 0.0,
    }
}

/// Fraksi trade penutupan dengan realized PnL > 0.
pub fn win_rate(trades: &[Trade]) -> f64 {
    let closed: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl).collect();
    if closed.is_empty() {
        return 0.0;
    }
    closed.iter().filter(|p| **p > 0.0).count() as f64 / closed.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
    }

    fn order(id: &str, side: Side, qty: f64, price: f64) -> Order {
        Order {
            id: id.into(),
            symbol: "BTCUSDT".into(),
            side,
            quantity: qty,
            price,
            stop_loss: Some(price * 0.95),
            take_profit: Some(price * 1.15),
            strategy: "momentum".into(),
            origin: OrderOrigin::Signal,
            created_at: t0(),
        }
    }

    fn executed(o: ApplyOutcome) -> Trade {
        match o {
            ApplyOutcome::Executed(t) => t,
            ApplyOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn round_trip_returns_cash_minus_fees() {
        let mut l = Ledger::new(10_000.0, 0.001);
        let b = executed(l.apply(&order("b", Side::Buy, 10.0, 100.0), t0()).unwrap());
        let s = executed(l.apply(&order("s", Side::Sell, 10.0, 110.0), t0()).unwrap());
        let expected = 10_000.0 - b.fees - s.fees + 10.0 * 10.0;
        assert!((l.cash() - expected).abs() < 1e-9);
        assert!(l.position("BTCUSDT").is_none());
        assert!((s.realized_pnl.unwrap() - (100.0 - s.fees)).abs() < 1e-9);
    }

    #[test]
    fn replayed_order_applies_once() {
        let mut l = Ledger::new(10_000.0, 0.001);
        let o = order("ORD-1", Side::Buy, 1.0, 100.0);
        executed(l.apply(&o, t0()).unwrap());
        let cash = l.cash();
        assert!(matches!(l.apply(&o, t0()).unwrap(), ApplyOutcome::Duplicate));
        assert_eq!(l.cash(), cash);
        assert_eq!(l.all_trades().len(), 1);
        assert_eq!(l.position("BTCUSDT").unwrap().quantity, 1.0);
    }

    #[test]
    fn adds_recompute_weighted_average() {
        let mut l = Ledger::new(10_000.0, 0.0);
        l.apply(&order("a", Side::Buy, 1.0, 100.0), t0()).unwrap();
        l.apply(&order("b", Side::Buy, 3.0, 200.0), t0() + Duration::minutes(5)).unwrap();
        let p = l.position("BTCUSDT").unwrap();
        assert_eq!(p.quantity, 4.0);
        assert!((p.avg_entry_price - 175.0).abs() < 1e-9);
        assert_eq!(p.opened_at, t0());
    }

    #[test]
    fn invariant_violations_are_errors() {
        let mut l = Ledger::new(100.0, 0.0);
        assert!(matches!(
            l.apply(&order("x", Side::Sell, 1.0, 10.0), t0()),
            Err(LedgerError::NoPosition(_))
        ));
        assert!(matches!(
            l.apply(&order("y", Side::Buy, 2.0, 100.0), t0()),
            Err(LedgerError::InsufficientCash { .. })
        ));
        l.apply(&order("z", Side::Buy, 0.5, 100.0), t0()).unwrap();
        assert!(matches!(
            l.apply(&order("w", Side::Sell, 0.6, 100.0), t0()),
            Err(LedgerError::OversizedClose { .. })
        ));
        assert!(matches!(
            l.apply(&order("v", Side::Buy, 0.0, 100.0), t0()),
            Err(LedgerError::InvalidOrder { .. })
        ));
        assert!((l.cash() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_triggers_ledger_originated_exit() {
        let mut l = Ledger::new(10_000.0, 0.001);
        l.apply(&order("b", Side::Buy, 5.0, 100.0), t0()).unwrap();

        let tick = t0() + Duration::minutes(1);
        assert!(l.mark_and_exit("BTCUSDT", 97.0, tick, tick).unwrap().is_none());
        assert!((l.position("BTCUSDT").unwrap().unrealized_pnl + 15.0).abs() < 1e-9);

        let tick = t0() + Duration::minutes(2);
        let t = l.mark_and_exit("BTCUSDT", 94.0, tick, tick).unwrap().unwrap();
        assert_eq!(t.origin, OrderOrigin::StopLoss);
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.quantity, 5.0);
        assert!(l.position("BTCUSDT").is_none());
    }

    #[test]
    fn take_profit_triggers_exit() {
        let mut l = Ledger::new(10_000.0, 0.001);
        l.apply(&order("b", Side::Buy, 5.0, 100.0), t0()).unwrap();
        let t = l.mark_and_exit("BTCUSDT", 116.0, t0(), t0()).unwrap().unwrap();
        assert_eq!(t.origin, OrderOrigin::TakeProfit);
        assert!(t.realized_pnl.unwrap() > 0.0);
    }

    #[test]
    fn snapshot_metrics() {
        let mut l = Ledger::new(1_000.0, 0.0);
        let mut o = order("b", Side::Buy, 1.0, 500.0);
        o.stop_loss = None;
        l.apply(&o, t0()).unwrap();
        l.record_equity(t0());
        l.mark_and_exit("BTCUSDT", 400.0, t0(), t0() + Duration::minutes(1)).unwrap();
        l.record_equity(t0() + Duration::minutes(1));
        let s = l.snapshot(t0() + Duration::minutes(1));
        assert!((s.total_value - 900.0).abs() < 1e-9);
        assert!((s.max_drawdown - 0.1).abs() < 1e-9);
        assert!((s.current_drawdown - 0.1).abs() < 1e-9);
        assert_eq!(s.open_positions, 1);
        assert!((s.unrealized_pnl + 100.0).abs() < 1e-9);
        assert!((s.total_return_pct + 10.0).abs() < 1e-9);
        assert_eq!(s.exposure("BTCUSDT").unwrap().market_value, 400.0);
    }

    #[test]
    fn restore_replays_cash_and_dedup() {
        let mut l = Ledger::new(10_000.0, 0.001);
        l.apply(&order("b", Side::Buy, 2.0, 100.0), t0()).unwrap();
        let positions = l.open_positions();
        let trades = l.all_trades().to_vec();

        let mut r = Ledger::new(10_000.0, 0.001);
        r.restore(positions, trades);
        assert!((r.cash() - l.cash()).abs() < 1e-9);
        assert_eq!(r.position("BTCUSDT").unwrap().quantity, 2.0);
        assert!(matches!(r.apply(&order("b", Side::Buy, 2.0, 100.0), t0()).unwrap(), ApplyOutcome::Duplicate));
        let next = executed(r.apply(&order("c", Side::Buy, 1.0, 100.0), t0()).unwrap());
        assert_eq!(next.id, 2);
    }

    #[test]
    fn restore_rebuilds_positions_from_history_not_snapshot() {
        let mut l = Ledger::new(10_000.0, 0.001);
        l.apply(&order("a", Side::Buy, 1.0, 100.0), t0()).unwrap();
        let stale = l.open_positions();
        l.apply(&order("b", Side::Buy, 3.0, 200.0), t0() + Duration::minutes(1)).unwrap();
        let mut eth = order("c", Side::Buy, 2.0, 50.0);
        eth.symbol = "ETHUSDT".into();
        l.apply(&eth, t0()).unwrap();
        l.apply(&order("d", Side::Sell, 1.0, 210.0), t0() + Duration::minutes(2)).unwrap();

        // history tidak urut (append dari task paralel), snapshot posisi basi
        let mut trades = l.all_trades().to_vec();
        trades.reverse();
        let mut r = Ledger::new(10_000.0, 0.001);
        r.restore(stale, trades);

        assert!((r.cash() - l.cash()).abs() < 1e-9);
        assert!((r.total_value() - l.total_value()).abs() < 1e-9);
        assert_eq!(r.open_positions().len(), 2);
        let btc = r.position("BTCUSDT").unwrap();
        let live = l.position("BTCUSDT").unwrap();
        assert!((btc.quantity - 3.0).abs() < 1e-9);
        assert!((btc.avg_entry_price - live.avg_entry_price).abs() < 1e-9);
        assert!((btc.realized_pnl - live.realized_pnl).abs() < 1e-9);
        assert_eq!(btc.opened_at, t0());
        assert!((r.position("ETHUSDT").unwrap().quantity - 2.0).abs() < 1e-9);
        let next = executed(r.apply(&order("e", Side::Buy, 0.1, 100.0), t0()).unwrap());
        assert_eq!(next.id, 5);
    }

    #[test]
    fn sell_trade_records_quantity_actually_closed() {
        let mut l = Ledger::new(10_000.0, 0.001);
        l.apply(&order("b", Side::Buy, 2.0, 100.0), t0()).unwrap();
        let cash = l.cash();
        let s = executed(l.apply(&order("s", Side::Sell, 2.0 + 5e-10, 100.0), t0()).unwrap());
        assert_eq!(s.quantity, 2.0);
        assert!((s.fees - 0.2).abs() < 1e-12);
        assert!((l.cash() - (cash + s.quantity * s.price - s.fees)).abs() < 1e-12);
        assert!(l.position("BTCUSDT").is_none());
    }

    #[test]
    fn metric_helpers() {
        assert_eq!(max_drawdown(&[100.0, 120.0, 90.0, 130.0]), 0.25);
        assert_eq!(current_drawdown(&[100.0, 120.0, 90.0, 130.0]), 0.0);
        assert_eq!(sharpe_ratio(&[100.0, 100.0, 100.0], 252.0), 0.0);
        assert!(sharpe_ratio(&[100.0, 101.0, 103.0, 104.0], 252.0) > 0.0);
    }

    fn arb_step() -> impl Strategy<Value = (bool, f64, f64)> {
        (any::<bool>(), 0.01..5.0_f64, 10.0..500.0_f64)
    }

    proptest! {
        /// Urutan order apa pun: maksimal satu posisi per symbol, qty tidak pernah negatif,
        /// cash tidak pernah negatif.
        #[test]
        fn position_invariant_holds(steps in prop::collection::vec(arb_step(), 1..60)) {
            let mut l = Ledger::new(10_000.0, 0.001);
            for (i, (is_buy, qty, price)) in steps.into_iter().enumerate() {
                let side = if is_buy { Side::Buy } else { Side::Sell };
                let o = order(&format!("ORD-{i}"), side, qty, price);
                let _ = l.apply(&o, t0() + Duration::seconds(i as i64));
                let open = l.open_positions();
                prop_assert!(open.iter().filter(|p| p.symbol == "BTCUSDT").count() <= 1);
                prop_assert!(open.iter().all(|p| p.quantity > 0.0));
                prop_assert!(l.cash() >= -1e-6);
            }
        }
    }
}
