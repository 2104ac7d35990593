// ===============================
// src/recorder.rs
// ===============================
//
// JSONL journal of order transitions, fills, closed positions and
// divergences:
// - one serialized `Event` per line, appended
// - buffered; flushed every second, every 500 events and on exit
// - parent directory created on open; a failed write reopens the file once
//
// Enabled with `RECORD_FILE=/path/to/journal.jsonl` (see config.rs).
//
use std::path::Path;

use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;
use crate::shutdown::Shutdown;

const FLUSH_EVERY_N_EVENTS: u32 = 500;

#[derive(Serialize)]
struct Line<'a> {
    recorded_ms: i64,
    #[serde(flatten)]
    event: &'a Event,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String, mut shutdown: Shutdown) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(%path, err = %e, "journal open failed, journaling disabled");
            return;
        }
    };
    info!(%path, "journal started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else { break };
                let line = match serde_json::to_vec(&Line { recorded_ms: crate::domain::now_ms(), event: &ev }) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(err = %e, "journal serialize failed, event skipped");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(err = %e, "journal write failed, reopening");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(err = %e2, "journal write failed after reopen, event dropped");
                                continue;
                            }
                        }
                        Err(e2) => {
                            error!(err = %e2, "journal reopen failed, event dropped");
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
                if since_last_flush > 0 {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = shutdown.wait() => {
                // drain what is already queued
                while let Ok(ev) = rx.try_recv() {
                    if let Ok(line) = serde_json::to_vec(&Line { recorded_ms: crate::domain::now_ms(), event: &ev }) {
                        let _ = write_line(&mut writer, &line).await;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.flush().await;
    info!(%path, "journal stopped");
}
