// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action { Buy, Sell, Hold }

impl Action {
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell => Some(Side::Sell),
            Action::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

/// Sisi posisi yang sedang dipegang (mirror dari ledger).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

impl PositionSide {
    pub fn from_quantity(qty: f64) -> Self {
        if qty > 0.0 {
            PositionSide::Long
        } else if qty < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    /// true kalau `side` akan membalik (atau menutup) posisi ini.
    pub fn is_reversed_by(&self, side: Side) -> bool {
        matches!((self, side), (PositionSide::Long, Side::Sell) | (PositionSide::Short, Side::Buy))
    }
}

/// Precomputed indicator bag. `None` = not enough history yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Indicators {
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub avg_volume: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub rolling_mean: Option<f64>,
    pub rolling_std: Option<f64>,
    pub return_volatility: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub change_percent: f64,
    pub ts: DateTime<Utc>,
    pub indicators: Indicators,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Hasil arbitrase: satu keputusan per symbol per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratedSignal {
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub price: f64,
    pub strategy: String,
    pub contributors: Vec<String>,
    pub snapshot_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOrigin {
    Signal,
    StopLoss,
    TakeProfit,
    Manual,
}

impl OrderOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderOrigin::Signal => "signal",
            OrderOrigin::StopLoss => "stop_loss",
            OrderOrigin::TakeProfit => "take_profit",
            OrderOrigin::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: String,
    pub origin: OrderOrigin,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Dedup key: replay dari tick yang sama menghasilkan key yang sama.
    pub fn dedup_key(symbol: &str, side: Side, origin: OrderOrigin, tick_ts: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(side.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(origin.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(tick_ts.timestamp_millis().to_be_bytes());
        let digest = hasher.finalize();
        format!("ORD-{}", hex::encode(&digest[..12]))
    }

    pub fn notional(&self) -> f64 { self.quantity * self.price }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: f64,
    pub last_price: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn side(&self) -> PositionSide { PositionSide::from_quantity(self.quantity) }
    pub fn market_value(&self) -> f64 { self.quantity * self.last_price }
    pub fn cost_basis(&self) -> f64 { self.quantity * self.avg_entry_price }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub fees: f64,
    pub realized_pnl: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub origin: OrderOrigin,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exposure { pub symbol: String, pub quantity: f64, pub market_value: f64 }

/// Derived on demand from positions + trades + equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub ts: DateTime<Utc>,
    pub initial_capital: f64,
    pub cash: f64,
    pub invested: f64,
    pub total_value: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub win_rate: f64,
    pub open_positions: usize,
    pub trade_count: usize,
    pub exposures: Vec<Exposure>,
}

impl PortfolioSnapshot {
    pub fn exposure(&self, symbol: &str) -> Option<&Exposure> {
        self.exposures.iter().find(|e| e.symbol == symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Sig(Signal),
    Verdict { symbol: String, accepted: bool, detail: String },
    Ord(Order),
    Fill(Trade),
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dedup_key_is_stable_for_same_tick() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let a = Order::dedup_key("BTCUSDT", Side::Buy, OrderOrigin::Signal, ts);
        let b = Order::dedup_key("BTCUSDT", Side::Buy, OrderOrigin::Signal, ts);
        let c = Order::dedup_key("BTCUSDT", Side::Sell, OrderOrigin::Signal, ts);
        let d = Order::dedup_key("BTCUSDT", Side::Buy, OrderOrigin::Signal, ts + chrono::Duration::seconds(60));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("ORD-"));
    }

    #[test]
    fn position_side_reversal() {
        assert!(PositionSide::Long.is_reversed_by(Side::Sell));
        assert!(!PositionSide::Long.is_reversed_by(Side::Buy));
        assert!(PositionSide::Short.is_reversed_by(Side::Buy));
        assert!(!PositionSide::Flat.is_reversed_by(Side::Sell));
        assert_eq!(PositionSide::from_quantity(-2.0), PositionSide::Short);
    }
}
