// ===============================
// src/shutdown.rs
// ===============================
use std::time::Duration;

use tokio::sync::watch;

/// Owner side of the global stop signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable listener every task and retry loop observes.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

impl Shutdown {
    /// A listener that never fires (tests, one-off tools).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive so `changed()` never resolves
        std::mem::forget(tx);
        Shutdown { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the trigger is dropped).
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep unless shutdown arrives first. `true` when the full duration elapsed.
    pub async fn sleep(&self, d: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        let mut me = self.clone();
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = me.wait() => false,
        }
    }
}
