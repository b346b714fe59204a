// ===============================
// src/feed.rs
// ===============================
//
// Snapshot provider:
// - SnapshotProvider : batch query symbol -> Snapshot (+ indikator)
// - MockFeed         : random walk per symbol, indikator dihitung dari
//                      history lokal (SMA, RSI, MACD, Bollinger, volume,
//                      rolling z, volatilitas return)
//
// Retry/backoff milik provider; engine hanya membungkus call dengan timeout.
//

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{Indicators, Snapshot};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("snapshot provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("snapshot provider unavailable: {0}")]
    Unavailable(String),
}

/// Symbol yang tidak dikenal provider cukup absen dari hasil.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshots(&self, symbols: &[String]) -> Result<HashMap<String, Snapshot>, FeedError>;
}

const HISTORY: usize = 120;
const WARMUP_BARS: usize = 60;
const CHANGE_LOOKBACK: usize = 24;

const SMA_SHORT: usize = 10;
const SMA_LONG: usize = 30;
const RSI_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const VOL_PERIOD: usize = 20;

struct Series {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    base_volume: f64,
}

struct MockState {
    rng: StdRng,
    series: HashMap<String, Series>,
}

/// Random-walk generator (seeded, jadi reproducible di test).
pub struct MockFeed {
    state: Mutex<MockState>,
}

fn start_price(symbol: &str) -> f64 {
    match symbol {
        "BTCUSDT" => 65_000.0,
        "ETHUSDT" => 3_200.0,
        "SOLUSDT" => 150.0,
        "BNBUSDT" => 580.0,
        _ => 100.0,
    }
}

impl MockState {
    fn step(&mut self, symbol: &str) {
        let rng = &mut self.rng;
        let s = self.series.entry(symbol.to_string()).or_insert_with(|| Series {
            prices: VecDeque::from([start_price(symbol)]),
            volumes: VecDeque::from([1_000.0]),
            base_volume: 1_000.0,
        });
        let last = s.prices.back().copied().unwrap_or(100.0);
        // sesekali lonjakan (news) biar strategi punya sesuatu untuk dikerjakan
        let shock = if rng.gen_bool(0.03) { rng.gen_range(-0.03..0.03) } else { 0.0 };
        let ret = rng.gen_range(-0.004..0.004) + shock;
        let price = (last * (1.0 + ret)).max(0.0001);
        let spike = if shock != 0.0 { rng.gen_range(1.5..3.0) } else { 1.0 };
        let volume = s.base_volume * rng.gen_range(0.5..1.5) * spike;

        s.prices.push_back(price);
        s.volumes.push_back(volume);
        while s.prices.len() > HISTORY {
            s.prices.pop_front();
        }
        while s.volumes.len() > HISTORY {
            s.volumes.pop_front();
        }
    }
}

impl MockFeed {
    pub fn new(symbols: &[String], seed: u64) -> Self {
        let mut st = MockState { rng: StdRng::seed_from_u64(seed), series: HashMap::new() };
        for sym in symbols {
            for _ in 0..WARMUP_BARS {
                st.step(sym);
            }
        }
        Self { state: Mutex::new(st) }
    }
}

#[async_trait]
impl SnapshotProvider for MockFeed {
    async fn get_snapshots(&self, symbols: &[String]) -> Result<HashMap<String, Snapshot>, FeedError> {
        let mut st = self.state.lock().await;
        let ts = Utc::now();
        let mut out = HashMap::with_capacity(symbols.len());
        for sym in symbols {
            st.step(sym);
            let Some(s) = st.series.get(sym) else { continue };
            let prices: Vec<f64> = s.prices.iter().copied().collect();
            let volumes: Vec<f64> = s.volumes.iter().copied().collect();
            let n = prices.len();
            let price = prices[n - 1];
            let open = prices[n.saturating_sub(2)];
            let reference = prices[n.saturating_sub(CHANGE_LOOKBACK + 1)];
            out.insert(
                sym.clone(),
                Snapshot {
                    symbol: sym.clone(),
                    price,
                    open,
                    high: open.max(price),
                    low: open.min(price),
                    volume: volumes[volumes.len() - 1],
                    change_percent: (price / reference - 1.0) * 100.0,
                    ts,
                    indicators: compute_indicators(&prices, &volumes),
                },
            );
        }
        Ok(out)
    }
}

// ---------- indikator (pure) ----------

fn tail(xs: &[f64], n: usize) -> Option<&[f64]> {
    (n > 0 && xs.len() >= n).then(|| &xs[xs.len() - n..])
}

pub fn sma(xs: &[f64], n: usize) -> Option<f64> {
    tail(xs, n).map(|w| w.iter().sum::<f64>() / n as f64)
}

/// Std populasi dari `n` nilai terakhir.
pub fn std_dev(xs: &[f64], n: usize) -> Option<f64> {
    let w = tail(xs, n)?;
    let mean = w.iter().sum::<f64>() / n as f64;
    Some((w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64).sqrt())
}

fn ema_series(xs: &[f64], n: usize) -> Vec<f64> {
    let k = 2.0 / (n as f64 + 1.0);
    let mut out = Vec::with_capacity(xs.len());
    let mut prev = match xs.first() {
        Some(v) => *v,
        None => return out,
    };
    for &x in xs {
        prev = x * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

pub fn rsi(xs: &[f64], n: usize) -> Option<f64> {
    let w = tail(xs, n + 1)?;
    let (mut gain, mut loss) = (0.0, 0.0);
    for pair in w.windows(2) {
        let d = pair[1] - pair[0];
        if d > 0.0 { gain += d } else { loss -= d }
    }
    if loss == 0.0 {
        return Some(if gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// (macd, signal, histogram) dengan EMA 12/26/9.
pub fn macd(xs: &[f64]) -> Option<(f64, f64, f64)> {
    if xs.len() < 26 + 9 {
        return None;
    }
    let fast = ema_series(xs, 12);
    let slow = ema_series(xs, 26);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema_series(&line[25..], 9);
    let m = *line.last()?;
    let s = *signal.last()?;
    Some((m, s, m - s))
}

pub fn compute_indicators(prices: &[f64], volumes: &[f64]) -> Indicators {
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let bb_mid = sma(prices, BB_PERIOD);
    let bb_std = std_dev(prices, BB_PERIOD);
    let avg_volume = sma(volumes, VOL_PERIOD);
    let (macd_line, macd_signal, macd_hist) = match macd(prices) {
        Some((m, s, h)) => (Some(m), Some(s), Some(h)),
        None => (None, None, None),
    };
    Indicators {
        sma_short: sma(prices, SMA_SHORT),
        sma_long: sma(prices, SMA_LONG),
        rsi: rsi(prices, RSI_PERIOD),
        macd: macd_line,
        macd_signal,
        macd_histogram: macd_hist,
        bb_upper: bb_mid.zip(bb_std).map(|(m, s)| m + 2.0 * s),
        bb_middle: bb_mid,
        bb_lower: bb_mid.zip(bb_std).map(|(m, s)| m - 2.0 * s),
        avg_volume,
        volume_ratio: avg_volume
            .filter(|a| *a > 0.0)
            .and_then(|a| volumes.last().map(|v| v / a)),
        rolling_mean: bb_mid,
        rolling_std: bb_std,
        return_volatility: std_dev(&returns, VOL_PERIOD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicators_need_history() {
        let short: Vec<f64> = (1..=5).map(|x| x as f64).collect();
        let ind = compute_indicators(&short, &short);
        assert!(ind.sma_long.is_none());
        assert!(ind.rsi.is_none());
        assert!(ind.macd.is_none());
        assert!(ind.return_volatility.is_none());
    }

    #[test]
    fn rising_series_reads_overbought() {
        let prices: Vec<f64> = (0..60).map(|x| 100.0 + x as f64).collect();
        let vols = vec![10.0; 60];
        let ind = compute_indicators(&prices, &vols);
        assert_eq!(ind.rsi, Some(100.0));
        assert!(ind.sma_short.unwrap() > ind.sma_long.unwrap());
        assert!(ind.macd.unwrap() > 0.0);
        assert_eq!(ind.volume_ratio, Some(1.0));
        assert!((ind.bb_middle.unwrap() - 149.5).abs() < 1e-9);
    }

    #[test]
    fn sma_and_std() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(sma(&xs, 8), Some(5.0));
        assert_eq!(std_dev(&xs, 8), Some(2.0));
        assert_eq!(sma(&xs, 9), None);
    }

    #[tokio::test]
    async fn mock_feed_is_seeded_and_warm() {
        let syms = vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()];
        let a = MockFeed::new(&syms, 7).get_snapshots(&syms).await.unwrap();
        let b = MockFeed::new(&syms, 7).get_snapshots(&syms).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a["BTCUSDT"].price, b["BTCUSDT"].price);
        let ind = &a["SOLUSDT"].indicators;
        assert!(ind.rsi.is_some() && ind.macd.is_some() && ind.bb_lower.is_some());
        assert!(ind.return_volatility.unwrap() > 0.0);
    }
}
