// ===============================
// src/rate_limiter.rs
// ===============================
//
// Per endpoint-prefix sliding-window admission.
//
// - Each configured prefix owns its own window behind its own mutex, so a
//   saturated prefix never blocks admission checks on another one.
// - `acquire` never fails: when the window is full it sleeps until the oldest
//   call leaves the window and re-checks.
// - An adaptive factor in [0.5, 1.5] scales the effective limit: it creeps up
//   after a run of clean calls and drops on every throttle response.
//
use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::metrics::RATE_LIMIT_WAITS;

const FACTOR_MIN: f64 = 0.5;
const FACTOR_MAX: f64 = 1.5;
const FACTOR_STEP_UP: f64 = 1.05;
const FACTOR_STEP_DOWN: f64 = 0.8;
/// Clean calls needed before the factor is nudged up.
const HEADROOM_RUN: u32 = 50;

#[derive(Debug, Clone)]
pub struct RateRule {
    pub prefix: String,
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub fn new(prefix: &str, limit: u32, window: Duration) -> Self {
        Self { prefix: prefix.to_string(), limit, window }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitCfg {
    pub rules: Vec<RateRule>,
    /// Extra headroom on top of each limit, e.g. 0.1 = +10%.
    pub burst_allowance: f64,
}

impl Default for RateLimitCfg {
    fn default() -> Self {
        let s = Duration::from_secs(1);
        Self {
            rules: vec![
                RateRule::new("/v5/order", 10, s),
                RateRule::new("/v5/position", 10, s),
                RateRule::new("/v5/execution", 10, s),
                RateRule::new("/v5/account", 5, s),
                RateRule::new("/v5/market", 50, s),
                RateRule::new("/", 20, s),
            ],
            burst_allowance: 0.0,
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    calls: VecDeque<Instant>,
    factor: f64,
    clean_run: u32,
}

impl RateWindow {
    fn new() -> Self {
        Self { calls: VecDeque::new(), factor: 1.0, clean_run: 0 }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.calls.front() {
            if now.duration_since(*front) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateLimiter {
    burst_allowance: f64,
    // sorted longest prefix first
    windows: Vec<(RateRule, Mutex<RateWindow>)>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitCfg) -> Self {
        let mut rules = cfg.rules;
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        let windows = rules.into_iter().map(|r| (r, Mutex::new(RateWindow::new()))).collect();
        Self { burst_allowance: cfg.burst_allowance, windows }
    }

    /// Longest configured prefix of `endpoint`.
    fn slot(&self, endpoint: &str) -> Option<&(RateRule, Mutex<RateWindow>)> {
        self.windows.iter().find(|(rule, _)| endpoint.starts_with(&rule.prefix))
    }

    fn effective_limit(&self, rule: &RateRule, factor: f64) -> usize {
        let eff = (rule.limit as f64) * (1.0 + self.burst_allowance) * factor;
        (eff.floor() as usize).max(1)
    }

    /// Wait for admission. Returns how long the caller was held back.
    pub async fn acquire(&self, endpoint: &str) -> Duration {
        let Some((rule, window)) = self.slot(endpoint) else {
            return Duration::ZERO;
        };
        let started = Instant::now();
        loop {
            let wait = {
                let mut w = window.lock().await;
                let now = Instant::now();
                w.prune(now, rule.window);
                let limit = self.effective_limit(rule, w.factor);
                if w.calls.len() < limit {
                    w.calls.push_back(now);
                    return started.elapsed();
                }
                // full: sleep until the call that frees a slot exits the window
                let freeing = w.calls.len() - limit;
                match w.calls.get(freeing) {
                    Some(t) => (*t + rule.window).saturating_duration_since(now),
                    None => rule.window,
                }
            };
            RATE_LIMIT_WAITS.with_label_values(&[&rule.prefix]).inc();
            debug!(endpoint, wait_ms = wait.as_millis() as u64, "rate limiter holding call");
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub async fn record_success(&self, endpoint: &str) {
        if let Some((_, window)) = self.slot(endpoint) {
            let mut w = window.lock().await;
            w.clean_run += 1;
            if w.clean_run >= HEADROOM_RUN {
                w.factor = (w.factor * FACTOR_STEP_UP).min(FACTOR_MAX);
                w.clean_run = 0;
            }
        }
    }

    pub async fn record_throttled(&self, endpoint: &str) {
        if let Some((rule, window)) = self.slot(endpoint) {
            let mut w = window.lock().await;
            w.factor = (w.factor * FACTOR_STEP_DOWN).max(FACTOR_MIN);
            w.clean_run = 0;
            debug!(prefix = %rule.prefix, factor = w.factor, "rate factor lowered after throttle");
        }
    }

    pub async fn record_failure(&self, endpoint: &str) {
        if let Some((_, window)) = self.slot(endpoint) {
            window.lock().await.clean_run = 0;
        }
    }

    pub async fn factor(&self, endpoint: &str) -> Option<f64> {
        match self.slot(endpoint) {
            Some((_, window)) => Some(window.lock().await.factor),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitCfg {
            rules: vec![
                RateRule::new("/v5/order", limit, Duration::from_secs(1)),
                RateRule::new("/v5/order/create", 2, Duration::from_secs(1)),
            ],
            burst_allowance: 0.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_in_any_window() {
        let rl = Arc::new(limiter(5));
        let stamps = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rl = rl.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..6 {
                    rl.acquire("/v5/order/cancel").await;
                    stamps.lock().await.push(Instant::now());
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let mut s = stamps.lock().await.clone();
        s.sort();
        assert_eq!(s.len(), 24);
        for (i, t) in s.iter().enumerate() {
            let in_window = s[i..].iter().filter(|u| u.duration_since(*t) < Duration::from_secs(1)).count();
            assert!(in_window <= 5, "{in_window} calls inside one window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn longest_prefix_wins() {
        let rl = limiter(100);
        let t0 = Instant::now();
        rl.acquire("/v5/order/create").await;
        rl.acquire("/v5/order/create").await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
        let waited = rl.acquire("/v5/order/create").await;
        assert!(waited >= Duration::from_millis(999));
        // the shorter prefix has its own window
        let waited = rl.acquire("/v5/order/amend").await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn factor_is_clamped() {
        let rl = limiter(10);
        for _ in 0..20 {
            rl.record_throttled("/v5/order/cancel").await;
        }
        assert_eq!(rl.factor("/v5/order/cancel").await, Some(FACTOR_MIN));
        for _ in 0..(HEADROOM_RUN * 40) {
            rl.record_success("/v5/order/cancel").await;
        }
        assert_eq!(rl.factor("/v5/order/cancel").await, Some(FACTOR_MAX));
    }

    #[tokio::test]
    async fn unknown_prefix_is_not_limited() {
        let rl = limiter(1);
        assert_eq!(rl.acquire("/v5/market/time").await, Duration::ZERO);
        assert_eq!(rl.acquire("/v5/market/time").await, Duration::ZERO);
    }
}
