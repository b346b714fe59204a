// ===============================
// src/arbitration.rs
// ===============================
//
// Arbitrase sinyal per symbol (state machine NONE/LONG/SHORT):
//   1. buang sinyal dengan confidence < min
//   2. kosong -> tidak ada aksi
//   3. cooldown sejak sinyal terakhir yang diterima
//   4. konflik BUY vs SELL: pihak kuat harus >= ratio x pihak lemah
//   5. pembalikan posisi butuh min hold
//   6. terima -> satu ArbitratedSignal, update last_signal_at
//
// Semua jalur "gagal" berakhir di Verdict::Suppress, tidak pernah error.
//

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ArbitratedSignal, Position, PositionSide, Side, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictAggregation { Sum, Max }

#[derive(Debug, Clone)]
pub struct ArbitrationCfg {
    pub min_signal_confidence: f64,
    pub signal_cooldown_seconds: i64,
    pub conflict_strength_ratio: f64,
    pub min_hold_seconds: i64,
    pub reset_interval_seconds: i64,
    pub aggregation: ConflictAggregation,
}

impl Default for ArbitrationCfg {
    fn default() -> Self {
        Self {
            min_signal_confidence: 0.5,
            signal_cooldown_seconds: 300,
            conflict_strength_ratio: 1.35,
            min_hold_seconds: 900,
            reset_interval_seconds: 86_400,
            aggregation: ConflictAggregation::Sum,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArbitrationState {
    pub last_signal_at: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub current_side: PositionSide,
    pub held_since: Option<DateTime<Utc>>,
    pub direction: Option<Side>,
    pub cumulative_confidence: f64,
    pub window_started_at: Option<DateTime<Utc>>,
}

impl ArbitrationState {
    /// Sinkronkan dengan posisi aktual di ledger.
    pub fn reconcile(&mut self, position: Option<&Position>) {
        match position {
            Some(p) => {
                self.current_side = p.side();
                self.held_since = Some(p.opened_at);
            }
            None => {
                self.current_side = PositionSide::Flat;
                self.held_since = None;
            }
        }
    }

    pub fn mark_traded(&mut self, at: DateTime<Utc>) {
        self.last_trade_at = Some(at);
    }

    /// Reset periodik: timestamp sinyal & akumulasi confidence, sisi posisi tetap.
    pub fn maybe_reset(&mut self, now: DateTime<Utc>, interval_secs: i64) -> bool {
        let Some(started) = self.window_started_at else {
            self.window_started_at = Some(now);
            return false;
        };
        if interval_secs > 0 && (now - started).num_seconds() >= interval_secs {
            self.last_signal_at = None;
            self.direction = None;
            self.cumulative_confidence = 0.0;
            self.window_started_at = Some(now);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Suppression {
    NoSignals,
    BelowConfidence { best: f64, min: f64 },
    Cooldown { remaining_secs: i64 },
    ConflictWash { buy: f64, sell: f64 },
    MinHold { held_secs: i64, required_secs: i64 },
}

impl Suppression {
    pub fn label(&self) -> &'static str {
        match self {
            Suppression::NoSignals => "no_signals",
            Suppression::BelowConfidence { .. } => "below_confidence",
            Suppression::Cooldown { .. } => "cooldown",
            Suppression::ConflictWash { .. } => "conflict_wash",
            Suppression::MinHold { .. } => "min_hold",
        }
    }
}

impl fmt::Display for Suppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suppression::NoSignals => write!(f, "no signals"),
            Suppression::BelowConfidence { best, min } => {
                write!(f, "best confidence {:.2} below minimum {:.2}", best, min)
            }
            Suppression::Cooldown { remaining_secs } => {
                write!(f, "cooldown active ({}s remaining)", remaining_secs)
            }
            Suppression::ConflictWash { buy, sell } => {
                write!(f, "conflicting signals wash out (buy {:.2} vs sell {:.2})", buy, sell)
            }
            Suppression::MinHold { held_secs, required_secs } => {
                write!(f, "position held {}s, reversal needs {}s", held_secs, required_secs)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accept(ArbitratedSignal),
    Suppress(Suppression),
}

fn aggregate(values: impl Iterator<Item = f64>, mode: ConflictAggregation) -> f64 {
    match mode {
        ConflictAggregation::Sum => values.sum(),
        ConflictAggregation::Max => values.fold(0.0, f64::max),
    }
}

pub fn arbitrate(
    state: &mut ArbitrationState,
    signals: &[Signal],
    price: f64,
    snapshot_ts: DateTime<Utc>,
    now: DateTime<Utc>,
    cfg: &ArbitrationCfg,
) -> Verdict {
    let directional: Vec<(Side, &Signal)> = signals
        .iter()
        .filter_map(|s| s.action.side().map(|side| (side, s)))
        .collect();
    if directional.is_empty() {
        return Verdict::Suppress(Suppression::NoSignals);
    }

    // 1-2
    let eligible: Vec<(Side, &Signal)> = directional
        .iter()
        .copied()
        .filter(|(_, s)| s.confidence >= cfg.min_signal_confidence)
        .collect();
    if eligible.is_empty() {
        let best = directional.iter().map(|(_, s)| s.confidence).fold(0.0, f64::max);
        return Verdict::Suppress(Suppression::BelowConfidence { best, min: cfg.min_signal_confidence });
    }

    // 3
    if let Some(last) = state.last_signal_at {
        let elapsed = (now - last).num_seconds();
        if elapsed < cfg.signal_cooldown_seconds {
            return Verdict::Suppress(Suppression::Cooldown {
                remaining_secs: cfg.signal_cooldown_seconds - elapsed,
            });
        }
    }

    // 4
    let buy = aggregate(
        eligible.iter().filter(|(side, _)| *side == Side::Buy).map(|(_, s)| s.confidence),
        cfg.aggregation,
    );
    let sell = aggregate(
        eligible.iter().filter(|(side, _)| *side == Side::Sell).map(|(_, s)| s.confidence),
        cfg.aggregation,
    );
    let side = if buy > 0.0 && sell > 0.0 {
        let (strong, weak, side) = if buy >= sell { (buy, sell, Side::Buy) } else { (sell, buy, Side::Sell) };
        if strong < weak * cfg.conflict_strength_ratio {
            return Verdict::Suppress(Suppression::ConflictWash { buy, sell });
        }
        side
    } else if buy > 0.0 {
        Side::Buy
    } else {
        Side::Sell
    };

    // 5
    if state.current_side.is_reversed_by(side) {
        if let Some(since) = state.held_since {
            let held = (now - since).num_seconds();
            if held < cfg.min_hold_seconds {
                return Verdict::Suppress(Suppression::MinHold {
                    held_secs: held,
                    required_secs: cfg.min_hold_seconds,
                });
            }
        }
    }

    // 6
    let agreeing: Vec<&Signal> = eligible
        .iter()
        .filter(|(s, _)| *s == side)
        .map(|(_, sig)| *sig)
        .collect();
    let Some(strongest) = agreeing
        .iter()
        .copied()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    else {
        return Verdict::Suppress(Suppression::NoSignals);
    };

    state.last_signal_at = Some(now);
    if state.direction == Some(side) {
        state.cumulative_confidence += strongest.confidence;
    } else {
        state.direction = Some(side);
        state.cumulative_confidence = strongest.confidence;
    }

    Verdict::Accept(ArbitratedSignal {
        symbol: strongest.symbol.clone(),
        side,
        confidence: strongest.confidence,
        price,
        strategy: strongest.strategy.clone(),
        contributors: agreeing.iter().map(|s| s.strategy.clone()).collect(),
        snapshot_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap()
    }

    fn sig(action: Action, confidence: f64, strategy: &str) -> Signal {
        Signal {
            symbol: "ADAUSDT".into(),
            action,
            confidence,
            price: 0.27,
            stop_loss: None,
            take_profit: None,
            strategy: strategy.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn accepted(v: Verdict) -> ArbitratedSignal {
        match v {
            Verdict::Accept(a) => a,
            Verdict::Suppress(s) => panic!("expected accept, got {s}"),
        }
    }

    fn suppressed(v: Verdict) -> Suppression {
        match v {
            Verdict::Suppress(s) => s,
            Verdict::Accept(a) => panic!("expected suppression, got {:?}", a.side),
        }
    }

    #[test]
    fn single_buy_on_fresh_symbol_is_actionable() {
        let cfg = ArbitrationCfg::default();
        let mut st = ArbitrationState::default();
        let a = accepted(arbitrate(&mut st, &[sig(Action::Buy, 0.5, "momentum")], 0.28, t0(), t0(), &cfg));
        assert_eq!(a.side, Side::Buy);
        assert_eq!(a.price, 0.28);
        assert_eq!(st.last_signal_at, Some(t0()));
    }

    #[test]
    fn low_confidence_and_hold_only_do_nothing() {
        let cfg = ArbitrationCfg::default();
        let mut st = ArbitrationState::default();
        assert_eq!(
            suppressed(arbitrate(&mut st, &[sig(Action::Hold, 0.9, "ta")], 1.0, t0(), t0(), &cfg)),
            Suppression::NoSignals
        );
        assert_eq!(
            suppressed(arbitrate(&mut st, &[sig(Action::Buy, 0.49, "ta")], 1.0, t0(), t0(), &cfg)).label(),
            "below_confidence"
        );
        assert!(st.last_signal_at.is_none());
    }

    #[test]
    fn cooldown_suppresses_then_releases() {
        let cfg = ArbitrationCfg { signal_cooldown_seconds: 300, ..Default::default() };
        let mut st = ArbitrationState::default();
        let buy = [sig(Action::Buy, 0.8, "momentum")];
        accepted(arbitrate(&mut st, &buy, 1.0, t0(), t0(), &cfg));

        let early = t0() + Duration::seconds(120);
        assert_eq!(
            suppressed(arbitrate(&mut st, &buy, 1.0, early, early, &cfg)),
            Suppression::Cooldown { remaining_secs: 180 }
        );

        let later = t0() + Duration::seconds(301);
        accepted(arbitrate(&mut st, &buy, 1.0, later, later, &cfg));
        assert!((st.cumulative_confidence - 1.6).abs() < 1e-9);
    }

    #[test]
    fn conflict_wash_below_ratio() {
        let cfg = ArbitrationCfg { conflict_strength_ratio: 1.35, ..Default::default() };
        let mut st = ArbitrationState::default();
        let signals = [sig(Action::Buy, 0.6, "momentum"), sig(Action::Sell, 0.5, "technical_analysis")];
        assert_eq!(
            suppressed(arbitrate(&mut st, &signals, 1.0, t0(), t0(), &cfg)).label(),
            "conflict_wash"
        );
        assert!(st.last_signal_at.is_none());
    }

    #[test]
    fn dominant_side_wins_conflict() {
        let cfg = ArbitrationCfg { conflict_strength_ratio: 1.35, ..Default::default() };
        let mut st = ArbitrationState::default();
        let signals = [
            sig(Action::Buy, 0.8, "momentum"),
            sig(Action::Sell, 0.5, "technical_analysis"),
            sig(Action::Buy, 0.55, "mean_reversion"),
        ];
        let a = accepted(arbitrate(&mut st, &signals, 1.0, t0(), t0(), &cfg));
        assert_eq!(a.side, Side::Buy);
        assert_eq!(a.confidence, 0.8);
        assert_eq!(a.strategy, "momentum");
        assert_eq!(a.contributors, vec!["momentum", "mean_reversion"]);
    }

    #[test]
    fn exact_tie_is_a_wash_in_max_mode() {
        let cfg = ArbitrationCfg { aggregation: ConflictAggregation::Max, ..Default::default() };
        let mut st = ArbitrationState::default();
        let signals = [sig(Action::Buy, 0.7, "a"), sig(Action::Sell, 0.7, "b")];
        assert!(matches!(
            arbitrate(&mut st, &signals, 1.0, t0(), t0(), &cfg),
            Verdict::Suppress(Suppression::ConflictWash { .. })
        ));
    }

    #[test]
    fn reversal_requires_min_hold() {
        let cfg = ArbitrationCfg { min_hold_seconds: 3_600, ..Default::default() };
        let mut st = ArbitrationState::default();
        let pos = Position {
            symbol: "SOLUSDT".into(),
            quantity: 1.0,
            avg_entry_price: 100.0,
            stop_loss: None,
            take_profit: None,
            opened_at: t0(),
            realized_pnl: 0.0,
            last_price: 100.0,
            unrealized_pnl: 0.0,
        };
        st.reconcile(Some(&pos));
        assert_eq!(st.current_side, PositionSide::Long);

        let sell = [sig(Action::Sell, 0.9, "technical_analysis")];
        let soon = t0() + Duration::seconds(600);
        assert!(matches!(
            suppressed(arbitrate(&mut st, &sell, 100.0, soon, soon, &cfg)),
            Suppression::MinHold { held_secs: 600, .. }
        ));

        let after = t0() + Duration::seconds(3_600);
        assert_eq!(accepted(arbitrate(&mut st, &sell, 100.0, after, after, &cfg)).side, Side::Sell);
    }

    #[test]
    fn periodic_reset_clears_cooldown_but_keeps_side() {
        let cfg = ArbitrationCfg { signal_cooldown_seconds: 10_000, reset_interval_seconds: 3_600, ..Default::default() };
        let mut st = ArbitrationState::default();
        st.current_side = PositionSide::Long;
        assert!(!st.maybe_reset(t0(), cfg.reset_interval_seconds));
        accepted(arbitrate(&mut st, &[sig(Action::Buy, 0.9, "m")], 1.0, t0(), t0(), &cfg));

        let next = t0() + Duration::seconds(3_600);
        assert!(st.maybe_reset(next, cfg.reset_interval_seconds));
        assert!(st.last_signal_at.is_none());
        assert_eq!(st.cumulative_confidence, 0.0);
        assert_eq!(st.current_side, PositionSide::Long);
    }
}
