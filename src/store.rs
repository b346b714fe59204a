// ===============================
// src/store.rs
// ===============================
//
// Persistence boundary:
//   <dir>/trades.jsonl      append-only, satu Trade per baris
//   <dir>/positions.json    snapshot posisi terbuka (ditulis ulang tiap mutasi)
//   <dir>/risk_limits.json  override RiskLimits
//
// Tulis JSON via file sementara + rename, jadi per-call all-or-nothing.
//

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{info, warn};

use crate::domain::{Position, Trade};
use crate::risk::RiskLimits;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn persist_trade(&self, trade: &Trade) -> Result<(), StoreError>;
    async fn persist_positions(&self, positions: &[Position]) -> Result<(), StoreError>;
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;
    async fn load_trades(&self) -> Result<Vec<Trade>, StoreError>;
    async fn load_risk_limits(&self) -> Result<Option<RiskLimits>, StoreError>;
    async fn save_risk_limits(&self, limits: &RiskLimits) -> Result<(), StoreError>;
}

const TRADES_FILE: &str = "trades.jsonl";
const POSITIONS_FILE: &str = "positions.json";
const LIMITS_FILE: &str = "risk_limits.json";

pub struct JsonlStore {
    dir: PathBuf,
    // serialisasi penulis (append + rename) dalam satu proses
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Gagal di sini = startup error (persistence tidak bisa dijangkau).
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "store: opened");
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        let target = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
        drop(f);
        fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(name)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TradeStore for JsonlStore {
    async fn persist_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(trade)?;
        line.push(b'\n');
        let _g = self.write_lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(TRADES_FILE))
            .await?;
        // satu write_all per baris
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }

    async fn persist_positions(&self, positions: &[Position]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(positions)?;
        self.write_atomic(POSITIONS_FILE, &bytes).await
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        match self.read_optional(POSITIONS_FILE).await? {
            Some(s) if !s.trim().is_empty() => Ok(serde_json::from_str(&s)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn load_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let Some(raw) = self.read_optional(TRADES_FILE).await? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Trade>(line) {
                Ok(t) => out.push(t),
                // baris terakhir bisa terpotong kalau proses mati saat append
                Err(e) => warn!(line = i + 1, ?e, "store: skipping unreadable trade line"),
            }
        }
        Ok(out)
    }

    async fn load_risk_limits(&self) -> Result<Option<RiskLimits>, StoreError> {
        match self.read_optional(LIMITS_FILE).await? {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save_risk_limits(&self, limits: &RiskLimits) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(limits)?;
        self.write_atomic(LIMITS_FILE, &bytes).await
    }
}

#[derive(Default)]
struct MemoryInner {
    trades: Vec<Trade>,
    positions: Vec<Position>,
    limits: Option<RiskLimits>,
}

/// Store in-memory (tanpa DATA_DIR). `set_failing(true)` mensimulasikan
/// persistence yang down.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(positions: Vec<Position>, trades: Vec<Trade>, limits: Option<RiskLimits>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner { trades, positions, limits }),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }

    pub async fn trade_count(&self) -> usize {
        self.inner.lock().await.trades.len()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn persist_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.trades.push(trade.clone());
        Ok(())
    }

    async fn persist_positions(&self, positions: &[Position]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.positions = positions.to_vec();
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.positions.clone())
    }

    async fn load_trades(&self) -> Result<Vec<Trade>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.trades.clone())
    }

    async fn load_risk_limits(&self) -> Result<Option<RiskLimits>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.limits.clone())
    }

    async fn save_risk_limits(&self, limits: &RiskLimits) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.limits = Some(limits.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderOrigin, Side};
    use chrono::{TimeZone, Utc};

    fn trade(id: u64) -> Trade {
        Trade {
            id,
            order_id: format!("ORD-{id}"),
            symbol: "ETHUSDT".into(),
            side: Side::Buy,
            quantity: 0.25,
            price: 3_000.0,
            fees: 0.75,
            realized_pnl: None,
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
            strategy: "technical_analysis".into(),
            origin: OrderOrigin::Signal,
            stop_loss: Some(2_850.0),
            take_profit: Some(3_450.0),
        }
    }

    #[tokio::test]
    async fn jsonl_store_round_trips_and_survives_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("data")).await.unwrap();

        assert!(store.load_trades().await.unwrap().is_empty());
        assert!(store.load_open_positions().await.unwrap().is_empty());
        assert!(store.load_risk_limits().await.unwrap().is_none());

        store.persist_trade(&trade(1)).await.unwrap();
        store.persist_trade(&trade(2)).await.unwrap();
        // simulasi append yang terpotong
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join("data").join(TRADES_FILE))
            .await
            .unwrap();
        f.write_all(b"{\"id\":3,\"order").await.unwrap();
        f.flush().await.unwrap();

        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);

        let limits = RiskLimits { max_daily_trades: 4, ..Default::default() };
        store.save_risk_limits(&limits).await.unwrap();
        assert_eq!(store.load_risk_limits().await.unwrap(), Some(limits));
    }

    #[tokio::test]
    async fn positions_snapshot_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        let pos = Position {
            symbol: "ETHUSDT".into(),
            quantity: 0.25,
            avg_entry_price: 3_000.0,
            stop_loss: Some(2_850.0),
            take_profit: None,
            opened_at: Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
            realized_pnl: 0.0,
            last_price: 3_010.0,
            unrealized_pnl: 2.5,
        };
        store.persist_positions(&[pos]).await.unwrap();
        assert_eq!(store.load_open_positions().await.unwrap().len(), 1);
        store.persist_positions(&[]).await.unwrap();
        assert!(store.load_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_can_fail() {
        let store = MemoryStore::new();
        store.persist_trade(&trade(1)).await.unwrap();
        store.set_failing(true);
        assert!(matches!(store.persist_trade(&trade(2)).await, Err(StoreError::Unavailable(_))));
        store.set_failing(false);
        assert_eq!(store.trade_count().await, 1);
    }
}
