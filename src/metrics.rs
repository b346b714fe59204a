// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::info;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Loop --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "orchestration ticks completed").unwrap());

pub static TICKS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_skipped_total", "ticks skipped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("tick_duration_seconds", "wall time of one tick (s)")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .unwrap()
});

pub static SYMBOL_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("symbol_errors_total", "per-symbol failures (labels: symbol, kind)"),
        &["symbol", "kind"],
    )
    .unwrap()
});

pub static ENGINE_RUNNING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("engine_running", "1 while the tick loop runs").unwrap());

// -------- Pipeline --------
pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "signals_total_by",
            "strategy signals by strategy & symbol (labels: strategy, symbol)",
        ),
        &["strategy", "symbol"],
    )
    .unwrap()
});

pub static ARB_SUPPRESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("arbitration_suppressed_total", "suppressed decisions (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static RISK_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_rejected_total", "risk rejections (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_total", "orders accepted by risk").unwrap());

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_total", "paper fills (labels: side, origin)"),
        &["side", "origin"],
    )
    .unwrap()
});

// -------- Portfolio --------
pub static PORTFOLIO_VALUE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_value", "cash + marked positions").unwrap());

pub static CASH: Lazy<Gauge> = Lazy::new(|| Gauge::new("portfolio_cash", "cash balance").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "open paper positions").unwrap());

// ---- Config visibility (strategies / symbols) ----
pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_strategy_active", "enabled strategies (label: strategy)"),
        &["strategy"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry (duplikat diabaikan)
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_SKIPPED.clone())),
        REGISTRY.register(Box::new(TICK_DURATION.clone())),
        REGISTRY.register(Box::new(SYMBOL_ERRORS.clone())),
        REGISTRY.register(Box::new(ENGINE_RUNNING.clone())),
        REGISTRY.register(Box::new(SIGNALS_BY.clone())),
        REGISTRY.register(Box::new(ARB_SUPPRESSED.clone())),
        REGISTRY.register(Box::new(RISK_REJECTED.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_VALUE.clone())),
        REGISTRY.register(Box::new(CASH.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY_ACTIVE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Body::from(encode_metrics()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found\n"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

/// Serve GET / dan /metrics sampai proses berhenti.
pub async fn serve_metrics(port: u16) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make);
    info!(%addr, "metrics listening on / and /metrics");
    server.await
}
