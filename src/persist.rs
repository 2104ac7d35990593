// ===============================
// src/persist.rs
// ===============================
//
// State file: open orders, positions and execution watermarks as one JSON
// document. Written to a sibling temp file, synced, then renamed over the
// target so a crash leaves either the old or the new file.
//
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::domain::now_ms;
use crate::error::PersistError;
use crate::shutdown::Shutdown;
use crate::state::{SharedState, StateSnapshot};

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub async fn save_atomic(path: &Path, snap: &StateSnapshot) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let bytes = serde_json::to_vec_pretty(snap)?;
    let tmp = tmp_path(path);
    let mut f = fs::File::create(&tmp).await?;
    f.write_all(&bytes).await?;
    f.sync_all().await?;
    drop(f);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// `Ok(None)` when there is no state file yet.
pub async fn load(path: &Path) -> Result<Option<StateSnapshot>, PersistError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Restore a saved snapshot into the state before any task starts.
pub async fn restore_into(path: &Path, state: &SharedState) -> Result<bool, PersistError> {
    let Some(snap) = load(path).await? else {
        info!(path = %path.display(), "no state file, starting empty");
        return Ok(false);
    };
    info!(
        path = %path.display(),
        orders = snap.orders.len(),
        positions = snap.positions.len(),
        saved_ms = snap.saved_ms,
        "state restored"
    );
    state.write().restore(snap);
    Ok(true)
}

/// Periodic snapshots, plus a final one on shutdown.
pub async fn run(state: SharedState, path: PathBuf, every: Duration, mut shutdown: Shutdown) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tick.tick() => {
                let snap = state.read().snapshot(now_ms());
                if let Err(e) = save_atomic(&path, &snap).await {
                    warn!(path = %path.display(), err = %e, "state save failed");
                }
            }
        }
    }
    let snap = state.read().snapshot(now_ms());
    match save_atomic(&path, &snap).await {
        Ok(()) => info!(path = %path.display(), "final state saved"),
        Err(e) => error!(path = %path.display(), err = %e, "final state save failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Position, Side};
    use crate::state::TradingState;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn save_then_load_and_no_temp_left() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let snap = StateSnapshot {
            orders: vec![],
            positions: vec![Position::open("ETHUSDT", Side::Sell, dec!(2.5), dec!(3000), 7)],
            exec_watermarks: vec![("ETHUSDT".into(), 1_700_000_000_000)],
            saved_ms: 9,
        };
        save_atomic(&path, &snap).await.unwrap();
        assert!(!tmp_path(&path).exists());
        assert_eq!(load(&path).await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn missing_file_is_none_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(load(&path).await.unwrap(), None);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path).await, Err(PersistError::Json(_))));
    }

    #[tokio::test]
    async fn restore_seeds_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut st = TradingState::new();
        st.advance_watermark("BTCUSDT", 42);
        save_atomic(&path, &st.snapshot(1)).await.unwrap();

        let shared = SharedState::new(TradingState::new());
        assert!(restore_into(&path, &shared).await.unwrap());
        assert_eq!(shared.read().exec_watermark("BTCUSDT"), Some(42));
    }

    #[tokio::test]
    async fn final_save_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let shared = SharedState::new(TradingState::new());
        shared.write().advance_watermark("BTCUSDT", 5);
        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(run(shared.clone(), path.clone(), Duration::from_secs(3600), shutdown));
        trigger.trigger();
        task.await.unwrap();
        let snap = load(&path).await.unwrap().unwrap();
        assert_eq!(snap.exec_watermarks, vec![("BTCUSDT".to_string(), 5)]);
    }
}
