// ===============================
// src/recorder.rs
// ===============================
//
// Journal JSONL untuk Event pipeline (signal, verdict, order, fill):
// - aktif kalau RECORD_FILE di-set (lihat main.rs)
// - BufWriter, flush tiap 1s atau tiap N event
// - kalau write gagal: reopen sekali, kalau masih gagal event di-drop
// - engine mengirim via try_send: journal penuh tidak memperlambat tick
//

use std::path::Path;

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 256;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

/// Handle pengirim; clone murah.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<Event>,
}

impl Journal {
    pub fn record(&self, ev: Event) {
        if let Err(e) = self.tx.try_send(ev) {
            warn!(?e, "recorder: journal backlog full, event dropped");
        }
    }
}

/// Buka file & spawn writer task. Error open dikembalikan ke caller.
pub async fn spawn(path: String, capacity: usize) -> std::io::Result<(Journal, tokio::task::JoinHandle<()>)> {
    let writer = open_writer(&path).await?;
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run(rx, writer, path));
    Ok((Journal { tx }, handle))
}

async fn run(mut rx: mpsc::Receiver<Event>, mut writer: BufWriter<File>, path: String) {
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_vec(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journal_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let (journal, handle) = spawn(path.display().to_string(), 16).await.unwrap();

        journal.record(Event::Note("boot".into()));
        journal.record(Event::Verdict { symbol: "BTCUSDT".into(), accepted: false, detail: "cooldown".into() });
        drop(journal);
        handle.await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["Verdict"]["detail"], "cooldown");
    }
}
