// ===============================
// src/strategy.rs
// ===============================
//
// Disediakan 3 strategi (semua stateless, input = snapshot + indicator bag):
// 1) Momentum           -> perubahan harga + konfirmasi volume
// 2) Mean-Reversion     -> z-score terhadap rolling mean + RSI + Bollinger
// 3) Technical Analysis -> voting berbobot MA / RSI / MACD / Bollinger
//
// Kontrak: `Strategy::produce(symbol, snapshot) -> Option<Signal>`.
// Indicator yang belum ada (history kurang) => None, bukan error.
//

use std::collections::BTreeMap;

use serde_json::json;

use crate::config::StrategyMode;
use crate::domain::{Action, Signal, Snapshot};

/// Stop-loss / take-profit suggestion attached to every signal.
#[derive(Debug, Clone, Copy)]
pub struct ExitLevels {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

impl Default for ExitLevels {
    fn default() -> Self { Self { stop_loss_pct: 0.05, take_profit_pct: 0.15 } }
}

impl ExitLevels {
    pub fn for_action(&self, price: f64, action: Action) -> (Option<f64>, Option<f64>) {
        match action {
            Action::Buy => (
                Some(price * (1.0 - self.stop_loss_pct)),
                Some(price * (1.0 + self.take_profit_pct)),
            ),
            Action::Sell => (
                Some(price * (1.0 + self.stop_loss_pct)),
                Some(price * (1.0 - self.take_profit_pct)),
            ),
            Action::Hold => (None, None),
        }
    }
}

fn build_signal(
    symbol: &str,
    snap: &Snapshot,
    action: Action,
    confidence: f64,
    strategy: &str,
    exits: &ExitLevels,
    metadata: BTreeMap<String, serde_json::Value>,
) -> Signal {
    let (stop_loss, take_profit) = exits.for_action(snap.price, action);
    Signal {
        symbol: symbol.to_string(),
        action,
        confidence: confidence.clamp(0.0, 1.0),
        price: snap.price,
        stop_loss,
        take_profit,
        strategy: strategy.to_string(),
        metadata,
    }
}

// -----------------------------------------------------------------------------
// 1) MOMENTUM
//    Ide: score = 0.7*|change%|/100 + 0.3*(volume/avgVolume)
//         change% > +threshold & score > min_score -> Buy
//         change% < -threshold & score > min_score -> Sell
//    Konfirmasi: RSI belum di ekstrem berlawanan (Buy butuh RSI < overbought).
//    Risiko:
//      - Masuk terlambat saat move sudah habis.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MomentumParams {
    /// percent, e.g. 0.5 = 0.5%
    pub change_threshold: f64,
    pub min_score: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self { change_threshold: 0.5, min_score: 0.6, rsi_overbought: 80.0, rsi_oversold: 30.0 }
    }
}

impl MomentumParams {
    pub fn produce(&self, symbol: &str, snap: &Snapshot, exits: &ExitLevels) -> Option<Signal> {
        if snap.price <= 0.0 || snap.volume <= 0.0 {
            return None;
        }
        let avg_volume = snap.indicators.avg_volume.filter(|v| *v > 0.0)?;
        let rsi = snap.indicators.rsi?;

        let volume_ratio = snap.volume / avg_volume;
        let change = snap.change_percent;
        let score = 0.7 * change.abs() / 100.0 + 0.3 * volume_ratio;
        if score <= self.min_score {
            return None;
        }

        let action = if change > self.change_threshold && rsi < self.rsi_overbought {
            Action::Buy
        } else if change < -self.change_threshold && rsi > self.rsi_oversold {
            Action::Sell
        } else {
            return None;
        };

        let mut meta = BTreeMap::new();
        meta.insert("score".into(), json!(score));
        meta.insert("change_percent".into(), json!(change));
        meta.insert("volume_ratio".into(), json!(volume_ratio));
        meta.insert("rsi".into(), json!(rsi));
        Some(build_signal(symbol, snap, action, score, "momentum", exits, meta))
    }
}

// -----------------------------------------------------------------------------
// 2) MEAN-REVERSION
//    Ide: z = (price - rollingMean) / rollingStd
//         z < -z_entry & RSI < oversold & harga dekat lower band  -> Buy
//         z > +z_entry & RSI > overbought & harga dekat upper band -> Sell
//    Kapan cocok:
//      - Pasar sideways.
//    Risiko:
//      - Trending kuat (perlu stop-loss dari modul risk).
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MeanReversionParams {
    pub z_entry: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// fraction around the band that still counts as "near", e.g. 0.01 = 1%
    pub band_tolerance: f64,
    pub min_volume_ratio: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            z_entry: 2.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            band_tolerance: 0.01,
            min_volume_ratio: 0.8,
        }
    }
}

impl MeanReversionParams {
    pub fn produce(&self, symbol: &str, snap: &Snapshot, exits: &ExitLevels) -> Option<Signal> {
        let ind = &snap.indicators;
        let mean = ind.rolling_mean?;
        let std = ind.rolling_std.filter(|s| *s > 0.0)?;
        let rsi = ind.rsi?;
        let lower = ind.bb_lower?;
        let upper = ind.bb_upper?;
        if snap.price <= 0.0 {
            return None;
        }
        if let Some(vr) = ind.volume_ratio {
            if vr < self.min_volume_ratio {
                return None;
            }
        }

        let price = snap.price;
        let z = (price - mean) / std;
        let action = if z < -self.z_entry
            && rsi < self.rsi_oversold
            && price <= lower * (1.0 + self.band_tolerance)
        {
            Action::Buy
        } else if z > self.z_entry
            && rsi > self.rsi_overbought
            && price >= upper * (1.0 - self.band_tolerance)
        {
            Action::Sell
        } else {
            return None;
        };

        let band_pos = if upper > lower {
            ((price - lower) / (upper - lower)).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let confidence = (z.abs() / 3.0).min(1.0) * 0.4
            + (band_pos - 0.5).abs() * 2.0 * 0.3
            + (rsi / 100.0 - 0.5).abs() * 2.0 * 0.3;

        let mut meta = BTreeMap::new();
        meta.insert("z_score".into(), json!(z));
        meta.insert("rolling_mean".into(), json!(mean));
        meta.insert("rolling_std".into(), json!(std));
        meta.insert("band_position".into(), json!(band_pos));
        meta.insert("rsi".into(), json!(rsi));
        Some(build_signal(symbol, snap, action, confidence, "mean_reversion", exits, meta))
    }
}

// -----------------------------------------------------------------------------
// 3) TECHNICAL ANALYSIS (weighted vote)
//    Bobot: MA crossover 0.3, RSI ekstrem 0.4, MACD crossover 0.3, Bollinger 0.2
//    Volume konfirmasi: x1.2 kalau volume > ratio * avgVolume.
//    Sinyal hanya kalau semua indikator yang "menyala" searah (unanimous)
//    dan skor gabungan > min_score.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct TechnicalParams {
    pub ma_weight: f64,
    pub rsi_weight: f64,
    pub macd_weight: f64,
    pub bb_weight: f64,
    /// price must sit this far beyond the short MA for the MA vote
    pub ma_gap: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_confirm_ratio: f64,
    pub volume_boost: f64,
    pub min_score: f64,
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            ma_weight: 0.3,
            rsi_weight: 0.4,
            macd_weight: 0.3,
            bb_weight: 0.2,
            ma_gap: 0.01,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            volume_confirm_ratio: 1.5,
            volume_boost: 1.2,
            min_score: 0.6,
        }
    }
}

impl TechnicalParams {
    pub fn produce(&self, symbol: &str, snap: &Snapshot, exits: &ExitLevels) -> Option<Signal> {
        let ind = &snap.indicators;
        let sma_short = ind.sma_short?;
        let sma_long = ind.sma_long?;
        let rsi = ind.rsi?;
        let macd = ind.macd?;
        let macd_signal = ind.macd_signal?;
        let macd_hist = ind.macd_histogram?;
        let bb_upper = ind.bb_upper?;
        let bb_lower = ind.bb_lower?;
        let price = snap.price;
        if price <= 0.0 {
            return None;
        }

        let mut votes: Vec<(Action, f64, &'static str)> = Vec::with_capacity(4);

        if sma_short > sma_long && price > sma_short * (1.0 + self.ma_gap) {
            votes.push((Action::Buy, self.ma_weight, "sma_bullish"));
        } else if sma_short < sma_long && price < sma_short * (1.0 - self.ma_gap) {
            votes.push((Action::Sell, self.ma_weight, "sma_bearish"));
        }

        if rsi < self.rsi_oversold {
            votes.push((Action::Buy, self.rsi_weight, "rsi_oversold"));
        } else if rsi > self.rsi_overbought {
            votes.push((Action::Sell, self.rsi_weight, "rsi_overbought"));
        }

        if macd > macd_signal && macd_hist > 0.0 {
            votes.push((Action::Buy, self.macd_weight, "macd_bullish"));
        } else if macd < macd_signal && macd_hist < 0.0 {
            votes.push((Action::Sell, self.macd_weight, "macd_bearish"));
        }

        if bb_upper > bb_lower {
            let pos = (price - bb_lower) / (bb_upper - bb_lower);
            if pos < 0.1 {
                votes.push((Action::Buy, self.bb_weight, "bb_lower_band"));
            } else if pos > 0.9 {
                votes.push((Action::Sell, self.bb_weight, "bb_upper_band"));
            }
        }

        let first = votes.first()?.0;
        if votes.iter().any(|(a, _, _)| *a != first) {
            // arah tidak bulat -> tidak ada sinyal
            return None;
        }

        let volume_factor = match ind.avg_volume {
            Some(avg) if avg > 0.0 && snap.volume > self.volume_confirm_ratio * avg => self.volume_boost,
            _ => 1.0,
        };
        let score = votes.iter().map(|(_, w, _)| w).sum::<f64>() * volume_factor;
        if score <= self.min_score {
            return None;
        }

        let reasons: Vec<&str> = votes.iter().map(|(_, _, r)| *r).collect();
        let mut meta = BTreeMap::new();
        meta.insert("score".into(), json!(score));
        meta.insert("volume_factor".into(), json!(volume_factor));
        meta.insert("reasons".into(), json!(reasons));
        Some(build_signal(symbol, snap, first, score, "technical_analysis", exits, meta))
    }
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub enum Strategy {
    Momentum(MomentumParams),
    MeanReversion(MeanReversionParams),
    TechnicalAnalysis(TechnicalParams),
}

impl Strategy {
    pub fn from_mode(mode: &StrategyMode) -> Self {
        match mode {
            StrategyMode::Momentum => Strategy::Momentum(MomentumParams::default()),
            StrategyMode::MeanReversion => Strategy::MeanReversion(MeanReversionParams::default()),
            StrategyMode::TechnicalAnalysis => Strategy::TechnicalAnalysis(TechnicalParams::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Momentum(_) => "momentum",
            Strategy::MeanReversion(_) => "mean_reversion",
            Strategy::TechnicalAnalysis(_) => "technical_analysis",
        }
    }

    /// HOLD tidak pernah dikembalikan; None = tidak ada sinyal.
    pub fn produce(&self, symbol: &str, snap: &Snapshot, exits: &ExitLevels) -> Option<Signal> {
        let sig = match self {
            Strategy::Momentum(p) => p.produce(symbol, snap, exits),
            Strategy::MeanReversion(p) => p.produce(symbol, snap, exits),
            Strategy::TechnicalAnalysis(p) => p.produce(symbol, snap, exits),
        };
        sig.filter(|s| s.action != Action::Hold)
    }
}

pub fn registry(modes: &[StrategyMode]) -> Vec<Strategy> {
    modes.iter().map(Strategy::from_mode).collect()
}
