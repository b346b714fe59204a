// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade checks (urutan tetap, stop di kegagalan pertama):
//   1. daily trades / daily loss
//   2. sizing (min of position cap & risk budget, dibatasi cash)
//   3. sector exposure & korelasi
//   4. parametric VaR portfolio
// Ditambah: harga valid, long-only (SELL butuh posisi), no pyramiding,
// volume floor, circuit drawdown.
//
// Rejection = hasil normal, bukan error.

use std::fmt;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arbitration::ArbitrationState;
use crate::domain::{
    ArbitratedSignal, Order, OrderOrigin, PortfolioSnapshot, PositionSide, Side, Snapshot, Trade,
};

/// Hot-reloadable limits. Persen dalam bentuk fraksi (0.1 = 10%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_position_size_percent: f64,
    pub max_portfolio_risk_percent: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub max_daily_trades: u32,
    pub max_daily_loss_percent: f64,
    pub correlation_threshold: f64,
    pub max_sector_exposure_percent: f64,
    pub max_var_percent: f64,
    pub var_confidence: f64,
    pub max_drawdown_percent: f64,
    pub min_order_notional: f64,
    pub min_volume: f64,
    pub allow_pyramiding: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_percent: 0.10,
            max_portfolio_risk_percent: 0.02,
            stop_loss_percent: 0.05,
            take_profit_percent: 0.15,
            max_daily_trades: 10,
            max_daily_loss_percent: 0.05,
            correlation_threshold: 0.7,
            max_sector_exposure_percent: 0.30,
            max_var_percent: 0.05,
            var_confidence: 0.95,
            max_drawdown_percent: 0.15,
            min_order_notional: 10.0,
            min_volume: 0.0,
            allow_pyramiding: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid risk limit `{field}`: {reason}")]
    InvalidLimit { field: &'static str, reason: String },
}

fn fraction(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidLimit { field, reason: format!("{v} not in (0, 1]") })
    }
}

fn non_negative(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidLimit { field, reason: format!("{v} must be >= 0") })
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fraction("max_position_size_percent", self.max_position_size_percent)?;
        fraction("max_portfolio_risk_percent", self.max_portfolio_risk_percent)?;
        fraction("stop_loss_percent", self.stop_loss_percent)?;
        non_negative("take_profit_percent", self.take_profit_percent)?;
        if self.max_daily_trades == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "max_daily_trades",
                reason: "must be at least 1".into(),
            });
        }
        fraction("max_daily_loss_percent", self.max_daily_loss_percent)?;
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return Err(ConfigError::InvalidLimit {
                field: "correlation_threshold",
                reason: format!("{} not in [0, 1]", self.correlation_threshold),
            });
        }
        fraction("max_sector_exposure_percent", self.max_sector_exposure_percent)?;
        fraction("max_var_percent", self.max_var_percent)?;
        if !(self.var_confidence > 0.5 && self.var_confidence < 1.0) {
            return Err(ConfigError::InvalidLimit {
                field: "var_confidence",
                reason: format!("{} not in (0.5, 1)", self.var_confidence),
            });
        }
        fraction("max_drawdown_percent", self.max_drawdown_percent)?;
        non_negative("min_order_notional", self.min_order_notional)?;
        non_negative("min_volume", self.min_volume)?;
        Ok(())
    }

    /// Terapkan patch secara atomik: semua field valid atau tidak ada yang berubah.
    pub fn patched(&self, patch: &RiskLimitsPatch) -> Result<RiskLimits, ConfigError> {
        let mut next = self.clone();
        macro_rules! apply {
            ($($f:ident),* $(,)?) => {
                $( if let Some(v) = patch.$f { next.$f = v; } )*
            };
        }
        apply!(
            max_position_size_percent,
            max_portfolio_risk_percent,
            stop_loss_percent,
            take_profit_percent,
            max_daily_trades,
            max_daily_loss_percent,
            correlation_threshold,
            max_sector_exposure_percent,
            max_var_percent,
            var_confidence,
            max_drawdown_percent,
            min_order_notional,
            min_volume,
            allow_pyramiding,
        );
        next.validate()?;
        Ok(next)
    }
}

/// Partial update untuk `RiskLimits`; field `None` tidak diubah.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimitsPatch {
    pub max_position_size_percent: Option<f64>,
    pub max_portfolio_risk_percent: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub take_profit_percent: Option<f64>,
    pub max_daily_trades: Option<u32>,
    pub max_daily_loss_percent: Option<f64>,
    pub correlation_threshold: Option<f64>,
    pub max_sector_exposure_percent: Option<f64>,
    pub max_var_percent: Option<f64>,
    pub var_confidence: Option<f64>,
    pub max_drawdown_percent: Option<f64>,
    pub min_order_notional: Option<f64>,
    pub min_volume: Option<f64>,
    pub allow_pyramiding: Option<bool>,
}

/// Lookup eksternal: sector map + tabel korelasi statis, ditambah
/// volatilitas & volume terakhir per symbol (di-refresh tiap tick).
#[derive(Debug, Clone)]
pub struct MarketContext {
    sectors: HashMap<String, String>,
    correlations: HashMap<(String, String), f64>,
    volatilities: HashMap<String, f64>,
    volumes: HashMap<String, f64>,
    pub default_volatility: f64,
    pub var_default_correlation: f64,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) }
}

impl MarketContext {
    pub fn new(sectors: HashMap<String, String>, pairs: Vec<(String, String, f64)>) -> Self {
        let correlations = pairs
            .into_iter()
            .map(|(a, b, rho)| (pair_key(&a, &b), rho))
            .collect();
        Self {
            sectors,
            correlations,
            volatilities: HashMap::new(),
            volumes: HashMap::new(),
            default_volatility: 0.02,
            var_default_correlation: 0.5,
        }
    }

    pub fn sector(&self, symbol: &str) -> Option<&str> {
        self.sectors.get(symbol).map(String::as_str)
    }

    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        self.correlations.get(&pair_key(a, b)).copied()
    }

    pub fn volatility(&self, symbol: &str) -> f64 {
        self.volatilities.get(symbol).copied().unwrap_or(self.default_volatility)
    }

    pub fn volume(&self, symbol: &str) -> Option<f64> {
        self.volumes.get(symbol).copied()
    }

    /// Catat volatilitas & volume dari snapshot terbaru.
    pub fn observe(&mut self, snap: &Snapshot) {
        if let Some(vol) = snap.indicators.return_volatility.filter(|v| v.is_finite() && *v > 0.0) {
            self.volatilities.insert(snap.symbol.clone(), vol);
        }
        self.volumes.insert(snap.symbol.clone(), snap.volume);
    }
}

impl Default for MarketContext {
    fn default() -> Self {
        Self::new(HashMap::new(), Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    InvalidPrice { price: f64 },
    DailyTradeLimit { count: u32, max: u32 },
    DailyLossLimit { realized: f64, limit: f64 },
    NoPosition,
    AlreadyOpen,
    VolumeTooLow { volume: f64, min: f64 },
    Drawdown { current: f64, max: f64 },
    BelowMinNotional { notional: f64, min: f64 },
    SectorExposure { sector: String, exposure: f64, limit: f64 },
    Correlation { other: String, rho: f64, threshold: f64 },
    ValueAtRisk { var: f64, limit: f64 },
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidPrice { .. } => "invalid_price",
            Rejection::DailyTradeLimit { .. } => "daily_trades",
            Rejection::DailyLossLimit { .. } => "daily_loss",
            Rejection::NoPosition => "no_position",
            Rejection::AlreadyOpen => "already_open",
            Rejection::VolumeTooLow { .. } => "volume",
            Rejection::Drawdown { .. } => "drawdown",
            Rejection::BelowMinNotional { .. } => "min_notional",
            Rejection::SectorExposure { .. } => "sector",
            Rejection::Correlation { .. } => "correlation",
            Rejection::ValueAtRisk { .. } => "var",
        }
    }

    /// Breach limit portfolio -> layak dikirim sebagai alert.
    pub fn is_limit_breach(&self) -> bool {
        matches!(
            self,
            Rejection::DailyTradeLimit { .. }
                | Rejection::DailyLossLimit { .. }
                | Rejection::Drawdown { .. }
                | Rejection::ValueAtRisk { .. }
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidPrice { price } => write!(f, "invalid reference price {price}"),
            Rejection::DailyTradeLimit { count, max } => {
                write!(f, "daily trade limit reached ({count}/{max})")
            }
            Rejection::DailyLossLimit { realized, limit } => {
                write!(f, "daily loss limit reached (realized {realized:.2}, limit -{limit:.2})")
            }
            Rejection::NoPosition => write!(f, "no open position to close"),
            Rejection::AlreadyOpen => write!(f, "position already open, pyramiding disabled"),
            Rejection::VolumeTooLow { volume, min } => {
                write!(f, "volume {volume:.0} below minimum {min:.0}")
            }
            Rejection::Drawdown { current, max } => write!(
                f,
                "drawdown {:.2}% exceeds limit {:.2}%",
                current * 100.0,
                max * 100.0
            ),
            Rejection::BelowMinNotional { notional, min } => {
                write!(f, "order notional {notional:.2} below minimum {min:.2}")
            }
            Rejection::SectorExposure { sector, exposure, limit } => write!(
                f,
                "sector `{sector}` exposure {exposure:.2} would exceed {limit:.2}"
            ),
            Rejection::Correlation { other, rho, threshold } => {
                write!(f, "correlation {rho:.2} with held {other} exceeds {threshold:.2}")
            }
            Rejection::ValueAtRisk { var, limit } => {
                write!(f, "portfolio VaR {var:.2} would exceed {limit:.2}")
            }
        }
    }
}

/// z-score satu sisi untuk confidence p (Abramowitz & Stegun 26.2.23).
pub fn z_score(p: f64) -> f64 {
    let q = (1.0 - p).clamp(1e-12, 0.5);
    let t = (-2.0 * q.ln()).sqrt();
    let (c0, c1, c2) = (2.515517, 0.802853, 0.010328);
    let (d1, d2, d3) = (1.432788, 0.189269, 0.001308);
    t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t)
}

/// Parametric VaR atas nilai posisi (dalam mata uang).
pub fn portfolio_var(holdings: &[(String, f64)], ctx: &MarketContext, confidence: f64) -> f64 {
    let mut variance = 0.0;
    for (a, va) in holdings {
        for (b, vb) in holdings {
            let rho = ctx.correlation(a, b).unwrap_or(ctx.var_default_correlation);
            variance += va * vb * ctx.volatility(a) * ctx.volatility(b) * rho;
        }
    }
    z_score(confidence) * variance.max(0.0).sqrt()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCounters {
    pub date: NaiveDate,
    pub trades: u32,
    pub realized_pnl: f64,
}

impl DailyCounters {
    fn fresh(date: NaiveDate) -> Self {
        Self { date, trades: 0, realized_pnl: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub date: NaiveDate,
    pub daily_trades: u32,
    pub daily_realized_pnl: f64,
    pub value_at_risk: f64,
    pub current_drawdown: f64,
    pub limits: RiskLimits,
}

pub struct RiskValidator {
    fee_rate: f64,
    count_auto_exits: bool,
    daily: DailyCounters,
    rolled: Option<DailyCounters>,
}

impl RiskValidator {
    pub fn new(fee_rate: f64, count_auto_exits: bool, now: DateTime<Utc>) -> Self {
        Self {
            fee_rate,
            count_auto_exits,
            daily: DailyCounters::fresh(now.date_naive()),
            rolled: None,
        }
    }

    pub fn daily(&self) -> &DailyCounters {
        &self.daily
    }

    /// Reset di UTC midnight. Counters hari sebelumnya disimpan sampai
    /// diambil lewat `take_rollover` (untuk daily summary).
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.daily.date {
            return false;
        }
        let prev = std::mem::replace(&mut self.daily, DailyCounters::fresh(today));
        self.rolled = Some(prev);
        true
    }

    pub fn take_rollover(&mut self) -> Option<DailyCounters> {
        self.rolled.take()
    }

    pub fn record_fill(&mut self, trade: &Trade, now: DateTime<Utc>) {
        self.roll_day(now);
        let auto_exit = matches!(trade.origin, OrderOrigin::StopLoss | OrderOrigin::TakeProfit);
        if !auto_exit || self.count_auto_exits {
            self.daily.trades += 1;
        }
        self.daily.realized_pnl += trade.realized_pnl.unwrap_or(0.0);
    }

    /// Rebuild counters hari ini dari trade history (dipakai saat boot).
    pub fn replay<'a>(&mut self, trades: impl IntoIterator<Item = &'a Trade>, now: DateTime<Utc>) {
        self.roll_day(now);
        let today = self.daily.date;
        for t in trades.into_iter().filter(|t| t.timestamp.date_naive() == today) {
            self.record_fill(t, now);
        }
    }

    pub fn validate(
        &mut self,
        sig: &ArbitratedSignal,
        portfolio: &PortfolioSnapshot,
        state: &ArbitrationState,
        limits: &RiskLimits,
        market: &MarketContext,
        now: DateTime<Utc>,
    ) -> Result<Order, Rejection> {
        self.roll_day(now);
        let price = sig.price;
        if !(price.is_finite() && price > 0.0) {
            return Err(Rejection::InvalidPrice { price });
        }
        let value = portfolio.total_value;

        // 1) daily limits
        if self.daily.trades >= limits.max_daily_trades {
            return Err(Rejection::DailyTradeLimit {
                count: self.daily.trades,
                max: limits.max_daily_trades,
            });
        }
        let loss_limit = limits.max_daily_loss_percent * value;
        if self.daily.realized_pnl <= -loss_limit {
            return Err(Rejection::DailyLossLimit { realized: self.daily.realized_pnl, limit: loss_limit });
        }

        let held = portfolio.exposure(&sig.symbol).filter(|e| e.quantity > 0.0);
        let quantity = match sig.side {
            Side::Sell => {
                // long-only: SELL = tutup seluruh posisi
                match held {
                    Some(e) if state.current_side == PositionSide::Long => e.quantity,
                    _ => return Err(Rejection::NoPosition),
                }
            }
            Side::Buy => {
                if held.is_some() && !limits.allow_pyramiding {
                    return Err(Rejection::AlreadyOpen);
                }
                if limits.min_volume > 0.0 {
                    let volume = market.volume(&sig.symbol).unwrap_or(0.0);
                    if volume < limits.min_volume {
                        return Err(Rejection::VolumeTooLow { volume, min: limits.min_volume });
                    }
                }
                if portfolio.current_drawdown > limits.max_drawdown_percent {
                    return Err(Rejection::Drawdown {
                        current: portfolio.current_drawdown,
                        max: limits.max_drawdown_percent,
                    });
                }

                // 2) sizing
                let by_position = limits.max_position_size_percent * value;
                let by_risk = limits.max_portfolio_risk_percent * value / limits.stop_loss_percent;
                let by_cash = (portfolio.cash / (1.0 + self.fee_rate)).max(0.0);
                let notional = by_position.min(by_risk).min(by_cash);
                if notional < limits.min_order_notional || notional <= 0.0 {
                    return Err(Rejection::BelowMinNotional { notional, min: limits.min_order_notional });
                }

                // 3) sector + correlation
                if let Some(sector) = market.sector(&sig.symbol) {
                    let current: f64 = portfolio
                        .exposures
                        .iter()
                        .filter(|e| market.sector(&e.symbol) == Some(sector))
                        .map(|e| e.market_value.abs())
                        .sum();
                    let limit = limits.max_sector_exposure_percent * value;
                    if current + notional > limit {
                        return Err(Rejection::SectorExposure {
                            sector: sector.to_string(),
                            exposure: current + notional,
                            limit,
                        });
                    }
                }
                for e in portfolio.exposures.iter().filter(|e| e.symbol != sig.symbol) {
                    if let Some(rho) = market.correlation(&sig.symbol, &e.symbol) {
                        if rho > limits.correlation_threshold {
                            return Err(Rejection::Correlation {
                                other: e.symbol.clone(),
                                rho,
                                threshold: limits.correlation_threshold,
                            });
                        }
                    }
                }

                // 4) VaR setelah posisi hipotetis ditambahkan
                let mut holdings: Vec<(String, f64)> = portfolio
                    .exposures
                    .iter()
                    .map(|e| (e.symbol.clone(), e.market_value))
                    .collect();
                match holdings.iter_mut().find(|(s, _)| *s == sig.symbol) {
                    Some((_, v)) => *v += notional,
                    None => holdings.push((sig.symbol.clone(), notional)),
                }
                let var = portfolio_var(&holdings, market, limits.var_confidence);
                let limit = limits.max_var_percent * value;
                if var > limit {
                    return Err(Rejection::ValueAtRisk { var, limit });
                }

                notional / price
            }
        };

        let (stop_loss, take_profit) = match sig.side {
            Side::Buy => (price * (1.0 - limits.stop_loss_percent), price * (1.0 + limits.take_profit_percent)),
            Side::Sell => (price * (1.0 + limits.stop_loss_percent), price * (1.0 - limits.take_profit_percent)),
        };

        Ok(Order {
            id: Order::dedup_key(&sig.symbol, sig.side, OrderOrigin::Signal, sig.snapshot_ts),
            symbol: sig.symbol.clone(),
            side: sig.side,
            quantity,
            price,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            strategy: sig.strategy.clone(),
            origin: OrderOrigin::Signal,
            created_at: now,
        })
    }

    pub fn metrics(
        &mut self,
        portfolio: &PortfolioSnapshot,
        limits: &RiskLimits,
        market: &MarketContext,
        now: DateTime<Utc>,
    ) -> RiskMetrics {
        self.roll_day(now);
        let holdings: Vec<(String, f64)> = portfolio
            .exposures
            .iter()
            .map(|e| (e.symbol.clone(), e.market_value))
            .collect();
        RiskMetrics {
            date: self.daily.date,
            daily_trades: self.daily.trades,
            daily_realized_pnl: self.daily.realized_pnl,
            value_at_risk: portfolio_var(&holdings, market, limits.var_confidence),
            current_drawdown: portfolio.current_drawdown,
            limits: limits.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Exposure;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap()
    }

    fn portfolio(cash: f64, exposures: Vec<Exposure>) -> PortfolioSnapshot {
        let invested: f64 = exposures.iter().map(|e| e.market_value).sum();
        PortfolioSnapshot {
            ts: now(),
            initial_capital: 10_000.0,
            cash,
            invested,
            total_value: cash + invested,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_return_pct: 0.0,
            sharpe_ratio: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            win_rate: 0.0,
            open_positions: exposures.len(),
            trade_count: 0,
            exposures,
        }
    }

    fn buy(symbol: &str, price: f64) -> ArbitratedSignal {
        ArbitratedSignal {
            symbol: symbol.into(),
            side: Side::Buy,
            confidence: 0.8,
            price,
            strategy: "momentum".into(),
            contributors: vec!["momentum".into()],
            snapshot_ts: now(),
        }
    }

    fn exposure(symbol: &str, qty: f64, price: f64) -> Exposure {
        Exposure { symbol: symbol.into(), quantity: qty, market_value: qty * price }
    }

    fn trade(pnl: Option<f64>, origin: OrderOrigin) -> Trade {
        Trade {
            id: 1,
            order_id: "ORD-x".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            quantity: 1.0,
            price: 100.0,
            fees: 0.1,
            realized_pnl: pnl,
            timestamp: now(),
            strategy: "momentum".into(),
            origin,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[test]
    fn sizing_caps_at_position_limit() {
        let mut rv = RiskValidator::new(0.001, false, now());
        let limits = RiskLimits::default();
        let order = rv
            .validate(&buy("BTCUSDT", 50.0), &portfolio(10_000.0, vec![]), &ArbitrationState::default(), &limits, &MarketContext::default(), now())
            .unwrap();
        assert!((order.notional() - 1_000.0).abs() < 1e-9);
        assert!((order.quantity - 20.0).abs() < 1e-9);
        assert!((order.stop_loss.unwrap() - 47.5).abs() < 1e-9);
        assert!((order.take_profit.unwrap() - 57.5).abs() < 1e-9);
        assert_eq!(order.origin, OrderOrigin::Signal);
    }

    #[test]
    fn sizing_capped_by_cash_and_min_notional() {
        let mut rv = RiskValidator::new(0.0, false, now());
        let limits = RiskLimits::default();
        let held = vec![exposure("ETHUSDT", 1.0, 9_500.0)];
        let order = rv
            .validate(&buy("BTCUSDT", 10.0), &portfolio(500.0, held.clone()), &ArbitrationState::default(), &limits, &MarketContext::default(), now())
            .unwrap();
        assert!((order.notional() - 500.0).abs() < 1e-9);

        let err = rv
            .validate(&buy("BTCUSDT", 10.0), &portfolio(5.0, held), &ArbitrationState::default(), &limits, &MarketContext::default(), now())
            .unwrap_err();
        assert_eq!(err.label(), "min_notional");
    }

    #[test]
    fn daily_trade_limit_resets_next_day() {
        let mut rv = RiskValidator::new(0.001, false, now());
        let limits = RiskLimits { max_daily_trades: 2, ..Default::default() };
        rv.record_fill(&trade(None, OrderOrigin::Signal), now());
        rv.record_fill(&trade(None, OrderOrigin::Signal), now());
        let pf = portfolio(10_000.0, vec![]);
        let st = ArbitrationState::default();
        let ctx = MarketContext::default();
        assert_eq!(
            rv.validate(&buy("BTCUSDT", 50.0), &pf, &st, &limits, &ctx, now()).unwrap_err(),
            Rejection::DailyTradeLimit { count: 2, max: 2 }
        );

        let tomorrow = now() + Duration::hours(12);
        assert!(rv.validate(&buy("BTCUSDT", 50.0), &pf, &st, &limits, &ctx, tomorrow).is_ok());
        assert_eq!(rv.daily().trades, 0);
        let prev = rv.take_rollover().unwrap();
        assert_eq!(prev.trades, 2);
        assert!(rv.take_rollover().is_none());
    }

    #[test]
    fn auto_exits_count_only_when_configured() {
        let mut rv = RiskValidator::new(0.001, false, now());
        rv.record_fill(&trade(Some(-30.0), OrderOrigin::StopLoss), now());
        assert_eq!(rv.daily().trades, 0);
        assert_eq!(rv.daily().realized_pnl, -30.0);

        let mut counting = RiskValidator::new(0.001, true, now());
        counting.record_fill(&trade(Some(10.0), OrderOrigin::TakeProfit), now());
        assert_eq!(counting.daily().trades, 1);
    }

    #[test]
    fn daily_loss_blocks_trading() {
        let mut rv = RiskValidator::new(0.001, false, now());
        rv.record_fill(&trade(Some(-600.0), OrderOrigin::Signal), now());
        let err = rv
            .validate(&buy("BTCUSDT", 50.0), &portfolio(10_000.0, vec![]), &ArbitrationState::default(), &RiskLimits::default(), &MarketContext::default(), now())
            .unwrap_err();
        assert_eq!(err.label(), "daily_loss");
        assert!(err.is_limit_breach());
    }

    #[test]
    fn sell_requires_position_and_closes_all() {
        let mut rv = RiskValidator::new(0.001, false, now());
        let limits = RiskLimits::default();
        let ctx = MarketContext::default();
        let mut sig = buy("BTCUSDT", 100.0);
        sig.side = Side::Sell;

        let err = rv
            .validate(&sig, &portfolio(10_000.0, vec![]), &ArbitrationState::default(), &limits, &ctx, now())
            .unwrap_err();
        assert_eq!(err, Rejection::NoPosition);

        let st = ArbitrationState { current_side: PositionSide::Long, ..Default::default() };
        let order = rv
            .validate(&sig, &portfolio(9_000.0, vec![exposure("BTCUSDT", 7.5, 100.0)]), &st, &limits, &ctx, now())
            .unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.quantity, 7.5);
    }

    #[test]
    fn pyramiding_is_rejected_by_default() {
        let mut rv = RiskValidator::new(0.001, false, now());
        let st = ArbitrationState { current_side: PositionSide::Long, ..Default::default() };
        let pf = portfolio(9_000.0, vec![exposure("BTCUSDT", 10.0, 100.0)]);
        let err = rv
            .validate(&buy("BTCUSDT", 100.0), &pf, &st, &RiskLimits::default(), &MarketContext::default(), now())
            .unwrap_err();
        assert_eq!(err, Rejection::AlreadyOpen);
    }

    #[test]
    fn sector_and_correlation_limits() {
        let mut rv = RiskValidator::new(0.0, false, now());
        let mut sectors = HashMap::new();
        sectors.insert("SOLUSDT".to_string(), "layer1".to_string());
        sectors.insert("AVAXUSDT".to_string(), "layer1".to_string());
        let ctx = MarketContext::new(sectors, vec![("BTCUSDT".into(), "ETHUSDT".into(), 0.9)]);
        let limits = RiskLimits { max_var_percent: 1.0, ..Default::default() };

        let pf = portfolio(7_500.0, vec![exposure("SOLUSDT", 25.0, 100.0)]);
        let err = rv
            .validate(&buy("AVAXUSDT", 20.0), &pf, &ArbitrationState::default(), &limits, &ctx, now())
            .unwrap_err();
        assert_eq!(err.label(), "sector");

        let pf = portfolio(9_000.0, vec![exposure("ETHUSDT", 1.0, 1_000.0)]);
        let err = rv
            .validate(&buy("BTCUSDT", 100.0), &pf, &ArbitrationState::default(), &limits, &ctx, now())
            .unwrap_err();
        assert!(matches!(err, Rejection::Correlation { ref other, .. } if other == "ETHUSDT"));

        // unmapped symbol tidak kena cek sector
        assert!(rv
            .validate(&buy("DOGEUSDT", 0.1), &pf, &ArbitrationState::default(), &limits, &ctx, now())
            .is_ok());
    }

    #[test]
    fn var_ceiling_rejects_volatile_candidate() {
        let mut rv = RiskValidator::new(0.0, false, now());
        let mut ctx = MarketContext::default();
        let mut snap_ind = crate::domain::Indicators::default();
        snap_ind.return_volatility = Some(0.5);
        ctx.observe(&Snapshot {
            symbol: "PEPEUSDT".into(),
            price: 1.0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            volume: 1e9,
            change_percent: 0.0,
            ts: now(),
            indicators: snap_ind,
        });
        let limits = RiskLimits { max_var_percent: 0.05, ..Default::default() };
        // 1000 * 0.5 * 1.645 = ~822 > 500
        let err = rv
            .validate(&buy("PEPEUSDT", 1.0), &portfolio(10_000.0, vec![]), &ArbitrationState::default(), &limits, &ctx, now())
            .unwrap_err();
        assert_eq!(err.label(), "var");
    }

    #[test]
    fn z_score_matches_known_quantiles() {
        assert!((z_score(0.95) - 1.645).abs() < 1e-3);
        assert!((z_score(0.99) - 2.326).abs() < 1e-3);
    }

    #[test]
    fn patch_is_atomic() {
        let base = RiskLimits::default();
        let ok = base
            .patched(&RiskLimitsPatch { max_daily_trades: Some(3), stop_loss_percent: Some(0.03), ..Default::default() })
            .unwrap();
        assert_eq!(ok.max_daily_trades, 3);
        assert_eq!(ok.stop_loss_percent, 0.03);

        let bad = base.patched(&RiskLimitsPatch {
            max_daily_trades: Some(3),
            max_position_size_percent: Some(1.5),
            ..Default::default()
        });
        assert!(matches!(bad, Err(ConfigError::InvalidLimit { field: "max_position_size_percent", .. })));
    }
}
