// ===============================
// src/main.rs
// ===============================
/*
 # jalankan dengan data dir + journal
 DATA_DIR=./data RECORD_FILE=./data/events.jsonl cargo run --release

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(symbol|strategy_active)'

# aktivitas pipeline
curl -s localhost:9898/metrics | grep '^signals_total_by'
curl -s localhost:9898/metrics | egrep '^(arbitration_suppressed|risk_rejected|trades)_total'
curl -s localhost:9898/metrics | egrep '^portfolio_(value|cash)'

*/
/*
=============================================================================
Project : paper_trader — async multi-strategy paper trading engine in Rust
Module  : main.rs
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
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use paper_trader::config;
use paper_trader::engine::{Collaborators, Engine};
use paper_trader::feed::MockFeed;
use paper_trader::metrics;
use paper_trader::notify::{LogNotifier, Notifier, WebhookNotifier};
use paper_trader::recorder;
use paper_trader::store::{JsonlStore, MemoryStore, TradeStore};

#[tokio::main]
async fn main() {
    // ---- Logging (RUST_LOG menimpa default) ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config & limits ----
    let (args, limits) = config::load();
    let cfg = args.engine_config();

    // ---- Metrics ----
    metrics::init();
    let port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(port).await {
            error!(%e, port, "metrics server stopped");
        }
    });

    info!(
        symbols = ?cfg.symbols,
        strategies = ?cfg.strategy_modes.iter().map(|m| m.label()).collect::<Vec<_>>(),
        tick = ?cfg.tick_interval,
        workers = cfg.worker_pool_size,
        capital = cfg.initial_capital,
        "config loaded"
    );

    // ---- Persistence ----
    let store: Arc<dyn TradeStore> = match &args.data_dir {
        Some(dir) => match JsonlStore::open(dir).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!(%e, dir = %dir.display(), "cannot open data dir");
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATA_DIR not set, trades kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // ---- Notifications ----
    let notifier: Arc<dyn Notifier> = match args.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };

    // ---- Journal (opsional) ----
    let (journal, journal_task) = match args.record_file.clone() {
        Some(path) => match recorder::spawn(path.clone(), 10_000).await {
            Ok((j, h)) => (Some(j), Some(h)),
            Err(e) => {
                warn!(%e, %path, "recorder disabled");
                (None, None)
            }
        },
        None => (None, None),
    };

    // ---- Snapshot provider ----
    let provider = Arc::new(MockFeed::new(&cfg.symbols, rand::random()));

    let engine = match Engine::bootstrap(cfg, limits, Collaborators { provider, store, notifier, journal }).await {
        Ok(e) => e,
        Err(e) => {
            error!(%e, "startup failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = engine.start().await {
        error!(%e, "engine start failed");
        std::process::exit(1);
    }

    // ---- Tunggu Ctrl-C, lalu drain ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl_c handler failed");
    }
    info!("shutdown requested");
    engine.stop().await;

    let snap = engine.get_portfolio_snapshot().await;
    info!(
        value = snap.total_value,
        cash = snap.cash,
        realized = snap.realized_pnl,
        unrealized = snap.unrealized_pnl,
        return_pct = snap.total_return_pct,
        trades = snap.trade_count,
        "final portfolio"
    );

    // tutup journal: sender ikut ter-drop bersama engine
    drop(engine);
    if let Some(h) = journal_task {
        let _ = h.await;
    }
}
