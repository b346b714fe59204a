// ===============================
// src/engine.rs
// ===============================
//
// Orchestration loop:
//   driver task (interval) -> tick:
//     1. snapshot batch (dibatasi timeout; timeout = tick di-skip)
//     2. per symbol, paralel (Semaphore = worker pool), berurutan per symbol:
//        mark/auto-exit -> strategies -> arbitrase -> risk -> ledger -> persist
//     3. equity point + gauges
//
// Lock order (selalu): slot symbol -> persist gate -> ledger -> risk. Limits & market context
// di-snapshot di awal tick, jadi update baru berlaku di tick berikutnya.
// Error satu symbol tidak pernah menghentikan tick atau loop.
//

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex, RwLock, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::arbitration::{arbitrate, ArbitrationState, Suppression, Verdict};
use crate::config::EngineConfig;
use crate::domain::{Event, OrderOrigin, PortfolioSnapshot, Position, Signal, Snapshot, Trade};
use crate::feed::{FeedError, SnapshotProvider};
use crate::metrics::{
    ARB_SUPPRESSED, CASH, CONFIG_STRATEGY_ACTIVE, CONFIG_SYMBOL, ENGINE_RUNNING, OPEN_POSITIONS, ORDERS,
    PNL_REALIZED, PNL_UNREALIZED, PORTFOLIO_VALUE, RISK_REJECTED, SIGNALS_BY, SYMBOL_ERRORS, TICKS,
    TICKS_SKIPPED, TICK_DURATION, TRADES,
};
use crate::notify::{dispatch, Notifier, NotifyEvent};
use crate::positions::{ApplyOutcome, Ledger, LedgerError};
use crate::recorder::Journal;
use crate::risk::{ConfigError, MarketContext, RiskLimits, RiskLimitsPatch, RiskMetrics, RiskValidator};
use crate::store::{StoreError, TradeStore};
use crate::strategy::{registry, ExitLevels, Strategy};

/// Error yang mengakhiri pemrosesan satu symbol (atau satu tick) saja.
#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("ledger invariant violated: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("symbol {0} is not configured")]
    UnknownSymbol(String),
}

impl TickError {
    pub fn kind(&self) -> &'static str {
        match self {
            TickError::Feed(FeedError::Timeout(_)) => "provider_timeout",
            TickError::Feed(_) => "provider",
            TickError::Ledger(_) => "invariant",
            TickError::Store(_) => "persistence",
            TickError::UnknownSymbol(_) => "unknown_symbol",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,
    #[error("persistence: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("symbol {0} is not configured")]
    UnknownSymbol(String),
}

/// Kolaborator eksternal engine.
pub struct Collaborators {
    pub provider: Arc<dyn SnapshotProvider>,
    pub store: Arc<dyn TradeStore>,
    pub notifier: Arc<dyn Notifier>,
    pub journal: Option<Journal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub strategies_enabled: Vec<String>,
    pub symbols: Vec<String>,
    pub last_tick_time: Option<DateTime<Utc>>,
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub evaluated: usize,
    pub missing: usize,
    pub trades: usize,
    pub errors: usize,
}

struct Shared {
    cfg: EngineConfig,
    strategies: Vec<Strategy>,
    provider: Arc<dyn SnapshotProvider>,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    journal: Option<Journal>,
    slots: HashMap<String, Arc<Mutex<ArbitrationState>>>,
    ledger: Mutex<Ledger>,
    risk: Mutex<RiskValidator>,
    limits: RwLock<RiskLimits>,
    market: RwLock<MarketContext>,
    tick_gate: Mutex<()>,
    /// Serialisasi tulis ke store: snapshot posisi dibaca ulang di dalam gate.
    persist_gate: Mutex<()>,
    running: AtomicBool,
    ticks: AtomicU64,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Default)]
struct Control {
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct Engine {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl Engine {
    /// Restore state dari store lalu siapkan engine (belum jalan).
    /// Gagal baca store = startup error.
    pub async fn bootstrap(
        cfg: EngineConfig,
        env_limits: RiskLimits,
        io: Collaborators,
    ) -> Result<Self, EngineError> {
        let now = Utc::now();
        let limits = match io.store.load_risk_limits().await? {
            Some(saved) => match saved.validate() {
                Ok(()) => {
                    info!("risk limits restored from store");
                    saved
                }
                Err(e) => {
                    warn!(%e, "persisted risk limits invalid, using environment");
                    env_limits
                }
            },
            None => env_limits,
        };
        limits.validate()?;

        let positions = io.store.load_open_positions().await?;
        let trades = io.store.load_trades().await?;
        let mut ledger = Ledger::new(cfg.initial_capital, cfg.fee_rate);
        let mut risk = RiskValidator::new(cfg.fee_rate, cfg.count_auto_exits, now);
        if !positions.is_empty() || !trades.is_empty() {
            risk.replay(trades.iter(), now);
            info!(positions = positions.len(), trades = trades.len(), "ledger restored");
            ledger.restore(positions, trades);
        }

        let slots = cfg
            .symbols
            .iter()
            .map(|sym| {
                let mut st = ArbitrationState::default();
                st.reconcile(ledger.position(sym));
                (sym.clone(), Arc::new(Mutex::new(st)))
            })
            .collect();

        let strategies = registry(&cfg.strategy_modes);
        for s in &strategies {
            CONFIG_STRATEGY_ACTIVE.with_label_values(&[s.name()]).set(1);
        }
        for sym in &cfg.symbols {
            CONFIG_SYMBOL.with_label_values(&[sym]).set(1);
        }

        let market = cfg.market.clone();
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                strategies,
                provider: io.provider,
                store: io.store,
                notifier: io.notifier,
                journal: io.journal,
                slots,
                ledger: Mutex::new(ledger),
                risk: Mutex::new(risk),
                limits: RwLock::new(limits),
                market: RwLock::new(market),
                tick_gate: Mutex::new(()),
                persist_gate: Mutex::new(()),
                running: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                last_tick: RwLock::new(None),
            }),
            control: Mutex::new(Control::default()),
        })
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        let mut ctl = self.control.lock().await;
        if ctl.handle.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.shared.running.store(true, Ordering::SeqCst);
        ENGINE_RUNNING.set(1);
        let shared = Arc::clone(&self.shared);
        ctl.handle = Some(tokio::spawn(drive(shared, stop_rx)));
        ctl.stop_tx = Some(stop_tx);

        info!(
            symbols = ?self.shared.cfg.symbols,
            strategies = ?self.strategy_names(),
            interval = ?self.shared.cfg.tick_interval,
            "engine started"
        );
        dispatch(
            &self.shared.notifier,
            NotifyEvent::EngineStarted { symbols: self.shared.cfg.symbols.clone(), strategies: self.strategy_names() },
        );
        Ok(())
    }

    /// Hentikan driver; tick yang sedang berjalan dibiarkan selesai.
    pub async fn stop(&self) {
        let mut ctl = self.control.lock().await;
        let Some(handle) = ctl.handle.take() else { return };
        if let Some(tx) = ctl.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Err(e) = handle.await {
            error!(?e, "driver task ended abnormally");
        }
        self.shared.running.store(false, Ordering::SeqCst);
        ENGINE_RUNNING.set(0);
        let ticks = self.shared.ticks.load(Ordering::SeqCst);
        info!(ticks, "engine stopped");
        dispatch(&self.shared.notifier, NotifyEvent::EngineStopped { ticks });
    }

    fn strategy_names(&self) -> Vec<String> {
        self.shared.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            strategies_enabled: self.strategy_names(),
            symbols: self.shared.cfg.symbols.clone(),
            last_tick_time: *self.shared.last_tick.read().await,
            ticks: self.shared.ticks.load(Ordering::SeqCst),
        }
    }

    /// Jalankan satu tick sekarang (di luar jadwal driver).
    pub async fn tick_once(&self) -> TickReport {
        run_tick(&self.shared).await
    }

    pub async fn get_portfolio_snapshot(&self) -> PortfolioSnapshot {
        self.shared.ledger.lock().await.snapshot(Utc::now())
    }

    pub async fn get_open_positions(&self) -> Vec<Position> {
        self.shared.ledger.lock().await.open_positions()
    }

    pub async fn get_trades(&self, limit: usize) -> Vec<Trade> {
        self.shared.ledger.lock().await.trades(limit)
    }

    pub async fn risk_limits(&self) -> RiskLimits {
        self.shared.limits.read().await.clone()
    }

    /// Patch atomik: divalidasi, dipersist, baru diterapkan. Berlaku tick berikutnya.
    pub async fn update_risk_limits(&self, patch: RiskLimitsPatch) -> Result<RiskLimits, EngineError> {
        let mut current = self.shared.limits.write().await;
        let next = current.patched(&patch)?;
        self.shared.store.save_risk_limits(&next).await?;
        *current = next.clone();
        info!(?patch, "risk limits updated");
        Ok(next)
    }

    pub async fn risk_metrics(&self) -> RiskMetrics {
        let now = Utc::now();
        let limits = self.shared.limits.read().await.clone();
        let market = self.shared.market.read().await.clone();
        let portfolio = self.shared.ledger.lock().await.snapshot(now);
        self.shared.risk.lock().await.metrics(&portfolio, &limits, &market, now)
    }

    /// Tutup posisi secara manual di harga mark terakhir, di bawah lock symbol.
    pub async fn close_position(&self, symbol: &str) -> Result<Trade, EngineError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let slot = self
            .shared
            .slots
            .get(&symbol)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        let mut state = slot.lock().await;
        let now = Utc::now();

        let trade = {
            let mut ledger = self.shared.ledger.lock().await;
            let price = ledger
                .position(&symbol)
                .map(|p| p.last_price)
                .ok_or_else(|| LedgerError::NoPosition(symbol.clone()))?;
            let order = ledger.close_order(&symbol, price, OrderOrigin::Manual, now, now)?;
            let trade = match ledger.apply(&order, now)? {
                ApplyOutcome::Executed(t) => t,
                ApplyOutcome::Duplicate => return Err(LedgerError::NoPosition(symbol).into()),
            };
            self.shared.risk.lock().await.record_fill(&trade, now);
            state.reconcile(ledger.position(&symbol));
            state.mark_traded(now);
            trade
        };
        info!(%symbol, qty = trade.quantity, price = trade.price, "position closed manually");
        after_fill(&self.shared, &trade).await;
        Ok(trade)
    }
}

async fn drive(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let mut iv = interval(shared.cfg.tick_interval);
    iv.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = iv.tick() => {
                // tick dijalankan di body branch: sinyal stop menunggu tick selesai
                run_tick(&shared).await;
            }
        }
    }
    debug!("driver exited");
}

async fn run_tick(shared: &Arc<Shared>) -> TickReport {
    let _gate = shared.tick_gate.lock().await;
    let started = Instant::now();
    let now = Utc::now();
    let mut report = TickReport::default();

    daily_rollover(shared, now).await;

    let snapshots = match fetch(shared).await {
        Ok(map) => map,
        Err(e) => {
            warn!(%e, "snapshot fetch failed, tick skipped");
            TICKS_SKIPPED.with_label_values(&[e.kind()]).inc();
            report.skipped = true;
            return report;
        }
    };

    let limits = Arc::new(shared.limits.read().await.clone());
    let market = {
        let mut m = shared.market.write().await;
        for snap in snapshots.values() {
            m.observe(snap);
        }
        Arc::new(m.clone())
    };

    let sem = Arc::new(Semaphore::new(shared.cfg.worker_pool_size.max(1)));
    let mut set = JoinSet::new();
    let mut snapshots = snapshots;
    for sym in &shared.cfg.symbols {
        let Some(snap) = snapshots.remove(sym) else {
            debug!(symbol = %sym, "no snapshot this tick");
            report.missing += 1;
            continue;
        };
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else { break };
        let shared = Arc::clone(shared);
        let limits = Arc::clone(&limits);
        let market = Arc::clone(&market);
        set.spawn(async move {
            let _permit = permit;
            let symbol = snap.symbol.clone();
            let res = process_symbol(&shared, snap, &limits, &market, now).await;
            (symbol, res)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(trades))) => {
                report.evaluated += 1;
                report.trades += trades;
            }
            Ok((symbol, Err(e))) => {
                report.errors += 1;
                symbol_failed(shared, &symbol, &e);
            }
            Err(e) => {
                report.errors += 1;
                error!(?e, "symbol task panicked");
                SYMBOL_ERRORS.with_label_values(&["?", "panic"]).inc();
            }
        }
    }

    let portfolio = {
        let mut ledger = shared.ledger.lock().await;
        ledger.record_equity(now);
        ledger.snapshot(now)
    };
    PORTFOLIO_VALUE.set(portfolio.total_value);
    CASH.set(portfolio.cash);
    PNL_REALIZED.set(portfolio.realized_pnl);
    PNL_UNREALIZED.set(portfolio.unrealized_pnl);
    OPEN_POSITIONS.set(portfolio.open_positions as i64);

    *shared.last_tick.write().await = Some(now);
    shared.ticks.fetch_add(1, Ordering::SeqCst);
    TICKS.inc();
    TICK_DURATION.observe(started.elapsed().as_secs_f64());
    debug!(?report, value = portfolio.total_value, "tick done");
    report
}

async fn fetch(shared: &Shared) -> Result<HashMap<String, Snapshot>, TickError> {
    let budget = shared.cfg.provider_timeout;
    match timeout(budget, shared.provider.get_snapshots(&shared.cfg.symbols)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(FeedError::Timeout(budget).into()),
    }
}

async fn daily_rollover(shared: &Shared, now: DateTime<Utc>) {
    let rolled = {
        let mut risk = shared.risk.lock().await;
        risk.roll_day(now);
        risk.take_rollover()
    };
    let Some(prev) = rolled else { return };
    let pf = shared.ledger.lock().await.snapshot(now);
    info!(date = %prev.date, trades = prev.trades, realized = prev.realized_pnl, "day closed");
    dispatch(
        &shared.notifier,
        NotifyEvent::DailySummary {
            date: prev.date,
            trades: prev.trades,
            realized_pnl: prev.realized_pnl,
            total_value: pf.total_value,
            total_return_pct: pf.total_return_pct,
        },
    );
}

fn symbol_failed(shared: &Shared, symbol: &str, e: &TickError) {
    SYMBOL_ERRORS.with_label_values(&[symbol, e.kind()]).inc();
    match e {
        TickError::Ledger(_) => {
            error!(%symbol, %e, "symbol processing aborted");
            dispatch(
                &shared.notifier,
                NotifyEvent::InvariantViolation { symbol: symbol.to_string(), detail: e.to_string() },
            );
        }
        _ => warn!(%symbol, %e, "symbol skipped this tick"),
    }
}

fn journal(shared: &Shared, ev: Event) {
    if let Some(j) = &shared.journal {
        j.record(ev);
    }
}

/// Satu symbol, satu tick. Return jumlah fill.
async fn process_symbol(
    shared: &Shared,
    snap: Snapshot,
    limits: &RiskLimits,
    market: &MarketContext,
    now: DateTime<Utc>,
) -> Result<usize, TickError> {
    let symbol = snap.symbol.clone();
    let slot = shared
        .slots
        .get(&symbol)
        .cloned()
        .ok_or_else(|| TickError::UnknownSymbol(symbol.clone()))?;
    let mut state = slot.lock().await;
    state.maybe_reset(now, shared.cfg.arbitration.reset_interval_seconds);
    let mut fills = 0;

    // 1) mark-to-market + auto exit
    let exit = {
        let mut ledger = shared.ledger.lock().await;
        let exit = ledger.mark_and_exit(&symbol, snap.price, snap.ts, now)?;
        if let Some(t) = &exit {
            shared.risk.lock().await.record_fill(t, now);
            state.mark_traded(now);
        }
        state.reconcile(ledger.position(&symbol));
        exit
    };
    if let Some(trade) = exit {
        info!(%symbol, origin = trade.origin.as_str(), price = trade.price, pnl = ?trade.realized_pnl, "auto exit");
        after_fill(shared, &trade).await;
        fills += 1;
    }

    // 2) strategies
    let exits = ExitLevels { stop_loss_pct: limits.stop_loss_percent, take_profit_pct: limits.take_profit_percent };
    let signals: Vec<Signal> = shared
        .strategies
        .iter()
        .filter_map(|s| s.produce(&symbol, &snap, &exits))
        .collect();
    for s in &signals {
        SIGNALS_BY.with_label_values(&[&s.strategy, &symbol]).inc();
        debug!(%symbol, strategy = %s.strategy, action = ?s.action, confidence = s.confidence, "signal");
        journal(shared, Event::Sig(s.clone()));
    }

    // 3) arbitrase
    let arb = match arbitrate(&mut state, &signals, snap.price, snap.ts, now, &shared.cfg.arbitration) {
        Verdict::Accept(a) => a,
        Verdict::Suppress(Suppression::NoSignals) => return Ok(fills),
        Verdict::Suppress(s) => {
            info!(%symbol, reason = %s, "signal suppressed");
            ARB_SUPPRESSED.with_label_values(&[s.label()]).inc();
            journal(shared, Event::Verdict { symbol, accepted: false, detail: s.to_string() });
            return Ok(fills);
        }
    };
    info!(%symbol, side = arb.side.as_str(), confidence = arb.confidence, strategy = %arb.strategy, "signal accepted");

    // 4) risk + ledger (cash = counter global, validasi & apply di bawah lock yang sama)
    let filled = {
        let mut ledger = shared.ledger.lock().await;
        let portfolio = ledger.snapshot(now);
        let mut risk = shared.risk.lock().await;
        let order = match risk.validate(&arb, &portfolio, &state, limits, market, now) {
            Ok(o) => o,
            Err(rej) => {
                info!(%symbol, reason = %rej, "risk rejected");
                RISK_REJECTED.with_label_values(&[rej.label()]).inc();
                if rej.is_limit_breach() {
                    dispatch(
                        &shared.notifier,
                        NotifyEvent::LimitBreach { symbol: symbol.clone(), reason: rej.to_string() },
                    );
                }
                journal(shared, Event::Verdict { symbol, accepted: false, detail: rej.to_string() });
                return Ok(fills);
            }
        };
        ORDERS.inc();
        journal(shared, Event::Ord(order.clone()));
        match ledger.apply(&order, now)? {
            ApplyOutcome::Executed(t) => {
                risk.record_fill(&t, now);
                state.reconcile(ledger.position(&symbol));
                state.mark_traded(now);
                Some(t)
            }
            ApplyOutcome::Duplicate => {
                debug!(%symbol, order = %order.id, "order already applied");
                None
            }
        }
    };

    // 5) persist & notify, masih di bawah lock symbol
    if let Some(trade) = filled {
        info!(
            %symbol,
            side = trade.side.as_str(),
            qty = trade.quantity,
            price = trade.price,
            fees = trade.fees,
            pnl = ?trade.realized_pnl,
            "paper fill"
        );
        after_fill(shared, &trade).await;
        fills += 1;
    }
    Ok(fills)
}

/// Tulis trade lalu posisi terkini. Di dalam gate, jadi penulis terakhir
/// selalu membawa snapshot ledger terbaru.
async fn persist(shared: &Shared, trade: &Trade) -> Result<(), TickError> {
    let _gate = shared.persist_gate.lock().await;
    shared.store.persist_trade(trade).await?;
    let positions = shared.ledger.lock().await.open_positions();
    shared.store.persist_positions(&positions).await?;
    Ok(())
}

/// Persist + notify + metrics untuk fill yang sudah ada di ledger.
/// Gagal persist: fill tetap di memori, warn + alert.
async fn after_fill(shared: &Shared, trade: &Trade) {
    TRADES.with_label_values(&[trade.side.as_str(), trade.origin.as_str()]).inc();
    journal(shared, Event::Fill(trade.clone()));
    if let Err(e) = persist(shared, trade).await {
        warn!(symbol = %trade.symbol, %e, "persist failed, fill kept in memory");
        SYMBOL_ERRORS.with_label_values(&[&trade.symbol, e.kind()]).inc();
        dispatch(
            &shared.notifier,
            NotifyEvent::PersistenceFailure { symbol: trade.symbol.clone(), detail: e.to_string() },
        );
    }
    dispatch(&shared.notifier, NotifyEvent::TradeExecuted { trade: trade.clone() });
}
