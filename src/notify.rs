// ===============================
// src/notify.rs
// ===============================
//
// Fire-and-forget alerting. Engine tidak pernah menunggu (atau gagal
// karena) pengiriman notifikasi: `dispatch` spawn task terpisah.
//

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::Trade;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyEvent {
    EngineStarted { symbols: Vec<String>, strategies: Vec<String> },
    EngineStopped { ticks: u64 },
    TradeExecuted { trade: Trade },
    LimitBreach { symbol: String, reason: String },
    InvariantViolation { symbol: String, detail: String },
    PersistenceFailure { symbol: String, detail: String },
    DailySummary {
        date: NaiveDate,
        trades: u32,
        realized_pnl: f64,
        total_value: f64,
        total_return_pct: f64,
    },
}

impl NotifyEvent {
    pub fn title(&self) -> &'static str {
        match self {
            NotifyEvent::EngineStarted { .. } => "Engine started",
            NotifyEvent::EngineStopped { .. } => "Engine stopped",
            NotifyEvent::TradeExecuted { .. } => "Trade executed",
            NotifyEvent::LimitBreach { .. } => "Risk limit breach",
            NotifyEvent::InvariantViolation { .. } => "Ledger invariant violation",
            NotifyEvent::PersistenceFailure { .. } => "Persistence failure",
            NotifyEvent::DailySummary { .. } => "Daily summary",
        }
    }

    pub fn body(&self) -> String {
        match self {
            NotifyEvent::EngineStarted { symbols, strategies } => {
                format!("symbols: {}\nstrategies: {}", symbols.join(", "), strategies.join(", "))
            }
            NotifyEvent::EngineStopped { ticks } => format!("stopped after {ticks} ticks"),
            NotifyEvent::TradeExecuted { trade: t } => {
                let pnl = t.realized_pnl.map(|p| format!(" pnl {p:.2}")).unwrap_or_default();
                format!(
                    "{} {} {:.6} @ {:.4} ({}, {}){}",
                    t.side.as_str(),
                    t.symbol,
                    t.quantity,
                    t.price,
                    t.strategy,
                    t.origin.as_str(),
                    pnl
                )
            }
            NotifyEvent::LimitBreach { symbol, reason } => format!("{symbol}: {reason}"),
            NotifyEvent::InvariantViolation { symbol, detail }
            | NotifyEvent::PersistenceFailure { symbol, detail } => format!("{symbol}: {detail}"),
            NotifyEvent::DailySummary { date, trades, realized_pnl, total_value, total_return_pct } => format!(
                "{date}: {trades} trades, realized {realized_pnl:.2}, value {total_value:.2} ({total_return_pct:+.2}%)"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError>;
}

/// Default tanpa WEBHOOK_URL: cukup log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        info!(title = event.title(), body = %event.body(), "notify");
        Ok(())
    }
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: Client::new(), url: url.into() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        let payload = json!({
            "title": event.title(),
            "text": event.body(),
            "event": event,
        });
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        Ok(())
    }
}

/// Kirim di background; kegagalan hanya di-log.
pub fn dispatch(notifier: &Arc<dyn Notifier>, event: NotifyEvent) {
    let n = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = n.notify(&event).await {
            warn!(?e, title = event.title(), "notification failed");
        }
    });
}

/// Notifier untuk test: simpan semua event.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: tokio::sync::Mutex<Vec<NotifyEvent>>,
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
