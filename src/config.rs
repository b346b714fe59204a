// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : paper_trader — async multi-strategy paper trading engine in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Evaluates a basket of symbols every tick, runs pluggable
          strategies (momentum, mean-reversion, technical analysis),
          arbitrates conflicting signals, gates them through portfolio
          risk limits, and executes the result as paper trades.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use tracing::warn;

use crate::arbitration::{ArbitrationCfg, ConflictAggregation};
use crate::risk::{MarketContext, RiskLimits};

// ===== Strategi =====
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    Momentum,
    MeanReversion,
    TechnicalAnalysis,
}

impl StrategyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "momentum" | "mom" => Some(StrategyMode::Momentum),
            "mean_reversion" | "meanreversion" | "mr" => Some(StrategyMode::MeanReversion),
            "technical_analysis" | "technical" | "ta" => Some(StrategyMode::TechnicalAnalysis),
            _ => None,
        }
    }

    /// Parse "momentum,mr,ta". Nama yang tidak dikenal di-skip (dengan warning).
    pub fn parse_many(list: &str) -> Vec<Self> {
        let mut out: Vec<Self> = Vec::new();
        for token in list.split(',').filter(|t| !t.trim().is_empty()) {
            match Self::parse_one(token) {
                Some(mode) if !out.contains(&mode) => out.push(mode),
                Some(_) => {}
                None => warn!(strategy = %token.trim(), "unknown strategy ignored"),
            }
        }
        out
    }

    pub fn label(&self) -> &'static str {
        match self {
            StrategyMode::Momentum => "momentum",
            StrategyMode::MeanReversion => "mean_reversion",
            StrategyMode::TechnicalAnalysis => "technical_analysis",
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "paper_trader", version, about = "Multi-strategy paper trading engine")]
pub struct Args {
    /// SYMBOLS=BTCUSDT,ETHUSDT,SOLUSDT
    #[arg(long, env = "SYMBOLS", value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
    pub symbols: Vec<String>,

    /// STRATEGIES=momentum,mean_reversion,technical_analysis
    #[arg(long, env = "STRATEGIES", default_value = "momentum,mean_reversion,technical_analysis")]
    pub strategies: String,

    #[arg(long, env = "TICK_INTERVAL_SECS", default_value_t = 60)]
    pub tick_interval_secs: u64,

    /// max symbol yang dievaluasi paralel dalam satu tick
    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = 4)]
    pub worker_pool_size: usize,

    #[arg(long, env = "PROVIDER_TIMEOUT_MS", default_value_t = 5_000)]
    pub provider_timeout_ms: u64,

    /// folder untuk trades.jsonl / positions.json / risk_limits.json (kosong = in-memory)
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "INITIAL_CAPITAL", default_value_t = 10_000.0)]
    pub initial_capital: f64,

    #[arg(long, env = "FEE_RATE", default_value_t = 0.001)]
    pub fee_rate: f64,

    // ===== Arbitrase =====
    #[arg(long, env = "MIN_SIGNAL_CONFIDENCE", default_value_t = 0.5)]
    pub min_signal_confidence: f64,

    #[arg(long, env = "SIGNAL_COOLDOWN_SECONDS", default_value_t = 300)]
    pub signal_cooldown_seconds: i64,

    #[arg(long, env = "CONFLICT_STRENGTH_RATIO", default_value_t = 1.35)]
    pub conflict_strength_ratio: f64,

    #[arg(long, env = "MIN_HOLD_SECONDS", default_value_t = 900)]
    pub min_hold_seconds: i64,

    #[arg(long, env = "ARBITRATION_RESET_SECONDS", default_value_t = 86_400)]
    pub arbitration_reset_seconds: i64,

    /// sum | max
    #[arg(long, env = "CONFLICT_AGGREGATION", default_value = "sum")]
    pub conflict_aggregation: String,

    // ===== Data risk eksternal =====
    /// SECTORS=BTCUSDT=layer1,ETHUSDT=layer1,UNIUSDT=defi
    #[arg(long, env = "SECTORS", default_value = "")]
    pub sectors: String,

    /// CORRELATIONS=BTCUSDT/ETHUSDT=0.85,BTCUSDT/SOLUSDT=0.7
    #[arg(long, env = "CORRELATIONS", default_value = "")]
    pub correlations: String,

    /// auto-exit (SL/TP) ikut dihitung ke MAX_DAILY_TRADES
    #[arg(long, env = "COUNT_AUTO_EXITS")]
    pub count_auto_exits: bool,

    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,
}

/// Everything the engine needs that is not hot-reloadable.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub strategy_modes: Vec<StrategyMode>,
    pub tick_interval: Duration,
    pub worker_pool_size: usize,
    pub provider_timeout: Duration,
    pub initial_capital: f64,
    pub fee_rate: f64,
    pub arbitration: ArbitrationCfg,
    pub market: MarketContext,
    pub count_auto_exits: bool,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        let symbols: Vec<String> = self
            .symbols
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let mut strategy_modes = StrategyMode::parse_many(&self.strategies);
        if strategy_modes.is_empty() {
            warn!("no valid strategies configured, falling back to momentum");
            strategy_modes.push(StrategyMode::Momentum);
        }

        let aggregation = match self.conflict_aggregation.trim().to_ascii_lowercase().as_str() {
            "max" => ConflictAggregation::Max,
            _ => ConflictAggregation::Sum,
        };

        EngineConfig {
            symbols,
            strategy_modes,
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            worker_pool_size: self.worker_pool_size.max(1),
            provider_timeout: Duration::from_millis(self.provider_timeout_ms),
            initial_capital: self.initial_capital,
            fee_rate: self.fee_rate,
            arbitration: ArbitrationCfg {
                min_signal_confidence: self.min_signal_confidence,
                signal_cooldown_seconds: self.signal_cooldown_seconds,
                conflict_strength_ratio: self.conflict_strength_ratio,
                min_hold_seconds: self.min_hold_seconds,
                reset_interval_seconds: self.arbitration_reset_seconds,
                aggregation,
            },
            market: MarketContext::new(
                parse_sector_map(&self.sectors),
                parse_correlations(&self.correlations),
            ),
            count_auto_exits: self.count_auto_exits,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|x| x.trim().parse().ok()).unwrap_or(default)
}

/// Risk limits dari ENV (fallback ke default). Nilai persisted di store
/// (kalau ada) menimpa ini saat boot.
pub fn load_limits() -> RiskLimits {
    let d = RiskLimits::default();
    RiskLimits {
        max_position_size_percent: env_or("MAX_POSITION_SIZE", d.max_position_size_percent),
        max_portfolio_risk_percent: env_or("MAX_PORTFOLIO_RISK", d.max_portfolio_risk_percent),
        stop_loss_percent: env_or("STOP_LOSS_PERCENTAGE", d.stop_loss_percent),
        take_profit_percent: env_or("TAKE_PROFIT_PERCENTAGE", d.take_profit_percent),
        max_daily_trades: env_or("MAX_DAILY_TRADES", d.max_daily_trades),
        max_daily_loss_percent: env_or("MAX_DAILY_LOSS", d.max_daily_loss_percent),
        correlation_threshold: env_or("CORRELATION_THRESHOLD", d.correlation_threshold),
        max_sector_exposure_percent: env_or("MAX_SECTOR_EXPOSURE", d.max_sector_exposure_percent),
        max_var_percent: env_or("MAX_VAR_PERCENT", d.max_var_percent),
        var_confidence: env_or("VAR_CONFIDENCE", d.var_confidence),
        max_drawdown_percent: env_or("MAX_DRAWDOWN", d.max_drawdown_percent),
        min_order_notional: env_or("MIN_ORDER_NOTIONAL", d.min_order_notional),
        min_volume: env_or("MIN_VOLUME", d.min_volume),
        allow_pyramiding: env_or("ALLOW_PYRAMIDING", d.allow_pyramiding),
    }
}

pub fn load() -> (Args, RiskLimits) {
    // Pastikan .env dibaca sebelum clap membaca ENV
    let _ = dotenv();
    let args = Args::parse();
    let limits = load_limits();
    (args, limits)
}

/// "BTCUSDT=layer1, ethusdt=Layer1" -> {BTCUSDT: layer1, ETHUSDT: layer1}
pub fn parse_sector_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (sym, sector) = pair.split_once('=')?;
            let sym = sym.trim().to_ascii_uppercase();
            let sector = sector.trim().to_ascii_lowercase();
            if sym.is_empty() || sector.is_empty() {
                return None;
            }
            Some((sym, sector))
        })
        .collect()
}

/// "BTCUSDT/ETHUSDT=0.85" -> [(BTCUSDT, ETHUSDT, 0.85)]. Entry rusak di-skip.
pub fn parse_correlations(raw: &str) -> Vec<(String, String, f64)> {
    raw.split(',')
        .filter_map(|entry| {
            let (pair, value) = entry.split_once('=')?;
            let (a, b) = pair.split_once('/')?;
            let rho: f64 = value.trim().parse().ok()?;
            if !(-1.0..=1.0).contains(&rho) {
                warn!(entry = %entry.trim(), "correlation out of [-1, 1], ignored");
                return None;
            }
            Some((a.trim().to_ascii_uppercase(), b.trim().to_ascii_uppercase(), rho))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_list_dedups_and_skips_unknown() {
        let modes = StrategyMode::parse_many("momentum, mr ,bogus,MOMENTUM,ta");
        assert_eq!(
            modes,
            vec![StrategyMode::Momentum, StrategyMode::MeanReversion, StrategyMode::TechnicalAnalysis]
        );
        assert!(StrategyMode::parse_many("").is_empty());
    }

    #[test]
    fn sector_map_parsing() {
        let m = parse_sector_map("btcusdt=Layer1, ETHUSDT = layer1,broken,=x");
        assert_eq!(m.len(), 2);
        assert_eq!(m["BTCUSDT"], "layer1");
        assert_eq!(m["ETHUSDT"], "layer1");
    }

    #[test]
    fn correlation_parsing_rejects_garbage() {
        let c = parse_correlations("BTCUSDT/ethusdt=0.85,A/B=1.7,C/D=abc,E=0.1");
        assert_eq!(c, vec![("BTCUSDT".to_string(), "ETHUSDT".to_string(), 0.85)]);
    }

    #[test]
    fn args_build_engine_config() {
        let args = Args::parse_from([
            "paper_trader",
            "--symbols",
            "btcusdt, ethusdt",
            "--strategies",
            "nope",
            "--conflict-aggregation",
            "MAX",
            "--worker-pool-size",
            "0",
        ]);
        let cfg = args.engine_config();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.strategy_modes, vec![StrategyMode::Momentum]);
        assert_eq!(cfg.arbitration.aggregation, ConflictAggregation::Max);
        assert_eq!(cfg.worker_pool_size, 1);
    }
}
