// ===============================
// src/stream.rs
// ===============================
//
// Persistent venue WebSocket sessions (one public, one private).
//
// - connect -> (private: auth, wait for ack) -> subscribe -> read loop
// - application ping every `ping_interval`; no inbound frame for
//   `liveness_timeout` counts as a dead link and forces a reconnect
// - reconnect backoff min(base * 2^attempt, max) + jitter; the attempt
//   counter resets once a subscribe ack arrives
// - decoded events go out on an mpsc channel; state on a watch channel
//
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::metrics::{DECODE_ERRORS, FRAMES, WS_LAST_FRAME_TS, WS_RECONNECTS, WS_STATE};
use crate::shutdown::Shutdown;
use crate::signing::{self, Credentials};
use crate::wire::{Inbound, StreamEvent, TopicRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Public,
    Private,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Public => "public",
            StreamKind::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error(String),
}

impl ConnectionState {
    fn gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Authenticated => 3,
            ConnectionState::Error(_) => -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamCfg {
    pub kind: StreamKind,
    pub url: String,
    pub topics: Vec<String>,
    /// Required for `StreamKind::Private`.
    pub credentials: Option<Credentials>,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub auth_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Venue caps topics per subscribe request.
    pub subscribe_chunk: usize,
}

impl StreamCfg {
    pub fn public(url: &str, topics: Vec<String>) -> Self {
        Self {
            kind: StreamKind::Public,
            url: url.to_string(),
            topics,
            credentials: None,
            ping_interval: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            subscribe_chunk: 10,
        }
    }

    pub fn private(url: &str, credentials: Credentials) -> Self {
        Self {
            kind: StreamKind::Private,
            topics: vec!["order".into(), "execution".into(), "position".into(), "wallet".into()],
            credentials: Some(credentials),
            ..Self::public(url, Vec::new())
        }
    }
}

/// Requests from other tasks into a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Drop and re-add a topic; for order books the venue answers with a
    /// fresh snapshot.
    Resubscribe(String),
}

/// What callers keep after spawning a manager.
#[derive(Clone)]
pub struct StreamHandle {
    pub state: watch::Receiver<ConnectionState>,
    pub commands: mpsc::Sender<StreamCommand>,
}

impl StreamHandle {
    pub fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

/// min(base * 2^attempt, max) plus up to 25% jitter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped = base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(max);
    let jitter_ms = (capped.as_millis() as u64 / 4).max(1);
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

enum SessionEnd {
    /// Dropped, timed out or refused; try again after backoff.
    Retry,
    Shutdown,
    /// Downstream receiver is gone; nothing left to deliver to.
    Closed,
}

pub struct StreamManager {
    cfg: StreamCfg,
    router: TopicRouter,
    events: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::Receiver<StreamCommand>,
    shutdown: Shutdown,
    attempt: u32,
}

impl StreamManager {
    pub fn new(cfg: StreamCfg, events: mpsc::Sender<StreamEvent>, shutdown: Shutdown) -> (Self, StreamHandle) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let mgr = Self {
            cfg,
            router: TopicRouter::new(),
            events,
            state_tx,
            commands: cmd_rx,
            shutdown,
            attempt: 0,
        };
        (mgr, StreamHandle { state: state_rx, commands: cmd_tx })
    }

    fn set_state(&self, next: ConnectionState) {
        WS_STATE.with_label_values(&[self.cfg.kind.label()]).set(next.gauge());
        self.state_tx.send_replace(next);
    }

    /// Every dropped session is reported as `Error` for the whole backoff.
    fn retry(&self, reason: impl Into<String>) -> SessionEnd {
        self.set_state(ConnectionState::Error(reason.into()));
        SessionEnd::Retry
    }

    /// Reconnect loop; returns on shutdown or when the event receiver is dropped.
    pub async fn run(mut self) {
        let stream = self.cfg.kind.label();
        if let Err(e) = Url::parse(&self.cfg.url) {
            error!(stream, url = %self.cfg.url, ?e, "bad ws url");
            self.set_state(ConnectionState::Error(format!("bad url: {e}")));
            return;
        }
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.session().await {
                SessionEnd::Shutdown | SessionEnd::Closed => break,
                SessionEnd::Retry => {}
            }
            let delay = backoff_delay(self.attempt, self.cfg.backoff_base, self.cfg.backoff_max);
            self.attempt = self.attempt.saturating_add(1);
            WS_RECONNECTS.with_label_values(&[stream]).inc();
            info!(stream, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "stream reconnecting");
            if !self.shutdown.sleep(delay).await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!(stream, "stream manager stopped");
    }

    async fn session(&mut self) -> SessionEnd {
        let stream = self.cfg.kind.label();
        self.set_state(ConnectionState::Connecting);
        info!(stream, url = %self.cfg.url, "connecting");
        let ws = tokio::select! {
            r = connect_async(self.cfg.url.as_str()) => match r {
                Ok((ws, _resp)) => ws,
                Err(e) => {
                    error!(stream, ?e, "connect failed");
                    return self.retry(e.to_string());
                }
            },
            _ = self.shutdown.wait() => return SessionEnd::Shutdown,
        };
        self.set_state(ConnectionState::Connected);
        let (mut sink, mut source) = ws.split();

        if self.cfg.kind == StreamKind::Private {
            let Some(creds) = self.cfg.credentials.clone() else {
                error!(stream, "private stream without credentials");
                self.set_state(ConnectionState::Error("missing credentials".into()));
                return SessionEnd::Closed;
            };
            let expires = signing::timestamp_ms() + 10_000;
            let sig = signing::ws_auth_signature(&creds.api_secret, expires);
            let auth = json!({"op": "auth", "args": [creds.api_key, expires, sig]});
            if let Err(e) = sink.send(Message::Text(auth.to_string())).await {
                warn!(stream, ?e, "auth send failed");
                return self.retry(format!("auth send failed: {e}"));
            }
            // nothing is subscribed until the venue confirms the login
            let deadline = Instant::now() + self.cfg.auth_timeout;
            loop {
                let next = tokio::select! {
                    m = source.next() => m,
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(stream, "auth ack timed out");
                        return self.retry("auth timeout");
                    }
                    _ = self.shutdown.wait() => return SessionEnd::Shutdown,
                };
                let text = match next {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(stream, ?e, "read failed during auth");
                        return self.retry(format!("read failed during auth: {e}"));
                    }
                    None => return self.retry("closed during auth"),
                };
                match self.router.route(&text) {
                    Ok(Inbound::Control(c)) if c.op == "auth" => {
                        if c.success {
                            info!(stream, "private stream authenticated");
                            self.set_state(ConnectionState::Authenticated);
                            break;
                        }
                        warn!(stream, reason = %c.ret_msg, "private stream auth rejected");
                        return self.retry(format!("auth rejected: {}", c.ret_msg));
                    }
                    _ => debug!(stream, "frame before auth ack ignored"),
                }
            }
        }

        for chunk in self.cfg.topics.chunks(self.cfg.subscribe_chunk.max(1)) {
            let sub = json!({"op": "subscribe", "args": chunk});
            if let Err(e) = sink.send(Message::Text(sub.to_string())).await {
                warn!(stream, ?e, "subscribe send failed");
                return self.retry(format!("subscribe send failed: {e}"));
            }
        }
        info!(stream, topics = self.cfg.topics.len(), "subscribe sent");

        let mut ping = interval(self.cfg.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = ping.tick() => {
                    if last_frame.elapsed() >= self.cfg.liveness_timeout {
                        let silent_ms = last_frame.elapsed().as_millis() as u64;
                        warn!(stream, silent_ms, "no frames inside liveness window");
                        return self.retry(format!("no frames for {silent_ms} ms"));
                    }
                    if let Err(e) = sink.send(Message::Text(json!({"op": "ping"}).to_string())).await {
                        warn!(stream, ?e, "ping send failed");
                        return self.retry(format!("ping send failed: {e}"));
                    }
                }
                Some(cmd) = self.commands.recv() => match cmd {
                    StreamCommand::Resubscribe(topic) => {
                        info!(stream, %topic, "resubscribing");
                        let unsub = json!({"op": "unsubscribe", "args": [topic.clone()]});
                        let sub = json!({"op": "subscribe", "args": [topic]});
                        if sink.send(Message::Text(unsub.to_string())).await.is_err()
                            || sink.send(Message::Text(sub.to_string())).await.is_err()
                        {
                            warn!(stream, "resubscribe send failed");
                            return self.retry("resubscribe send failed");
                        }
                    }
                },
                frame = source.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Ping(p))) => {
                            last_frame = Instant::now();
                            let _ = sink.send(Message::Pong(p)).await;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_frame = Instant::now();
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(stream, "stream closed by venue");
                            return self.retry("closed by venue");
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(stream, ?e, "ws read error");
                            return self.retry(e.to_string());
                        }
                    };
                    last_frame = Instant::now();
                    WS_LAST_FRAME_TS.with_label_values(&[stream]).set(chrono::Utc::now().timestamp());
                    match self.router.route(&text) {
                        Ok(Inbound::Events(events)) => {
                            for ev in events {
                                FRAMES.with_label_values(&[ev.kind()]).inc();
                                if self.events.send(ev).await.is_err() {
                                    return SessionEnd::Closed;
                                }
                            }
                        }
                        Ok(Inbound::Control(c)) if c.op == "subscribe" => {
                            if c.success {
                                self.attempt = 0;
                                debug!(stream, "subscribe acknowledged");
                            } else {
                                error!(stream, reason = %c.ret_msg, "subscribe rejected");
                            }
                        }
                        Ok(Inbound::Control(c)) => debug!(stream, op = %c.op, "control frame"),
                        Ok(Inbound::Ignored) => {}
                        Err(e) => {
                            DECODE_ERRORS.with_label_values(&[stream]).inc();
                            warn!(stream, error = %e, "frame dropped");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        let d0 = backoff_delay(0, base, max);
        assert!(d0 >= base && d0 <= base + base / 4 + Duration::from_millis(1));
        let d20 = backoff_delay(20, base, max);
        assert!(d20 >= max && d20 <= max + max / 4 + Duration::from_millis(1));
    }

    /// One-shot venue: answers auth as told, then pushes one order frame.
    async fn fake_private_venue(accept_auth: bool) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut seen = Vec::new();
            let auth = ws.next().await.unwrap().unwrap().into_text().unwrap();
            seen.push(auth);
            let reply = json!({"op": "auth", "success": accept_auth, "ret_msg": if accept_auth { "" } else { "bad sig" }});
            ws.send(Message::Text(reply.to_string())).await.unwrap();
            if !accept_auth {
                // give the client a moment to react before hanging up
                let _ = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
                return seen;
            }
            let sub = ws.next().await.unwrap().unwrap().into_text().unwrap();
            seen.push(sub);
            ws.send(Message::Text(json!({"op": "subscribe", "success": true}).to_string())).await.unwrap();
            let order = r#"{"topic":"order","creationTime":5,"data":[{"orderId":"o1","orderLinkId":"l1","symbol":"BTCUSDT","side":"Buy","orderType":"Limit","orderStatus":"New","qty":"1","price":"100","cumExecQty":"0","avgPrice":"","updatedTime":"5"}]}"#;
            ws.send(Message::Text(order.into())).await.unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(1), ws.next()).await;
            seen
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn private_stream_subscribes_only_after_auth() {
        let (url, venue) = fake_private_venue(true).await;
        let (tx, mut rx) = mpsc::channel(8);
        let (trigger, sd) = shutdown::channel();
        let cfg = StreamCfg::private(&url, Credentials::new("key", "secret"));
        let (mgr, handle) = StreamManager::new(cfg, tx, sd);
        let task = tokio::spawn(mgr.run());

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::Order(ref u) if u[0].link_id == "l1"));
        assert_eq!(handle.current(), ConnectionState::Authenticated);

        trigger.trigger();
        task.await.unwrap();
        let seen = venue.await.unwrap();
        assert!(seen[0].contains("\"op\":\"auth\""));
        assert!(seen[1].contains("\"op\":\"subscribe\""));
    }

    #[tokio::test]
    async fn silent_link_reports_error_through_backoff() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let venue = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // swallow subscribe and pings, answer nothing
            while let Some(Ok(_)) = ws.next().await {}
        });
        let (tx, _rx) = mpsc::channel(8);
        let (trigger, sd) = shutdown::channel();
        let mut cfg = StreamCfg::public(&format!("ws://{addr}"), vec!["tickers.BTCUSDT".into()]);
        cfg.ping_interval = Duration::from_millis(100);
        cfg.liveness_timeout = Duration::from_millis(300);
        cfg.backoff_base = Duration::from_secs(10);
        cfg.backoff_max = Duration::from_secs(10);
        let (mgr, mut handle) = StreamManager::new(cfg, tx, sd);
        let task = tokio::spawn(mgr.run());

        let reason = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let ConnectionState::Error(r) = &*handle.state.borrow_and_update() {
                    break r.clone();
                }
                handle.state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(reason.contains("no frames"), "{reason}");

        // still reported as failed while the reconnect waits
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(handle.current(), ConnectionState::Error(_)));

        trigger.trigger();
        task.await.unwrap();
        venue.abort();
    }

    #[tokio::test]
    async fn rejected_auth_never_subscribes() {
        let (url, venue) = fake_private_venue(false).await;
        let (tx, _rx) = mpsc::channel(8);
        let (trigger, sd) = shutdown::channel();
        let cfg = StreamCfg::private(&url, Credentials::new("key", "secret"));
        let (mgr, mut handle) = StreamManager::new(cfg, tx, sd);
        let task = tokio::spawn(mgr.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(*handle.state.borrow_and_update(), ConnectionState::Error(_)) {
                    break;
                }
                handle.state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        trigger.trigger();
        task.await.unwrap();
        let seen = venue.await.unwrap();
        assert_eq!(seen.len(), 1, "only the auth frame may be sent");
    }
}
