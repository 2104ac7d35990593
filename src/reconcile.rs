// ===============================
// src/reconcile.rs
// ===============================
//
// Reconciliation engine: merges private-stream pushes with periodic REST
// polls into the one `TradingState`.
//
// - push path   : order / execution / position events, applied as they come
// - heartbeat   : authoritative position list vs local net quantity
// - exec poll   : fill ledger since the watermark + open-order refresh
//
// Push and poll for one symbol are serialized by a per-symbol async mutex.
// REST fetches happen before the mutex is taken; a poll whose answer is older
// than the last local mutation for that symbol is not compared.
//
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{now_ms, Event, Execution, OrderRole, Side};
use crate::error::TransportError;
use crate::metrics::DIVERGENCES;
use crate::orders::{is_tighter, OrderManager};
use crate::rest::VenueApi;
use crate::shutdown::Shutdown;
use crate::state::{FillApplied, SharedState};
use crate::wire::StreamEvent;

/// Requests per execution poll spent reading a truncated window.
pub const EXEC_BACKFILL_ROUNDS: usize = 5;

/// Offset past entry for the breakeven stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakevenOffset {
    /// Percent of entry price (0.1 = 0.1%).
    Percent(Decimal),
    Absolute(Decimal),
}

impl BreakevenOffset {
    /// Stop price for a position entered at `entry`: above entry for longs,
    /// below for shorts.
    pub fn stop_for(&self, side: Side, entry: Decimal) -> Decimal {
        let off = match self {
            BreakevenOffset::Percent(p) => entry * *p / Decimal::ONE_HUNDRED,
            BreakevenOffset::Absolute(a) => *a,
        };
        entry + side.sign() * off
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileCfg {
    pub symbols: Vec<String>,
    pub heartbeat_interval: Duration,
    pub exec_poll_interval: Duration,
    /// Net quantity difference tolerated before a symbol is divergent.
    pub divergence_tolerance: Decimal,
    /// Consecutive divergent heartbeats (or failing polls) before escalation.
    pub escalate_after: u32,
    pub breakeven: BreakevenOffset,
    /// Only executions whose link id carries `link_prefix` count as ours.
    pub filter_by_prefix: bool,
    pub link_prefix: String,
    /// First execution poll looks back this far.
    pub exec_lookback: Duration,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            exec_poll_interval: Duration::from_secs(5),
            divergence_tolerance: Decimal::ZERO,
            escalate_after: 3,
            breakeven: BreakevenOffset::Percent(Decimal::new(1, 1)),
            filter_by_prefix: true,
            link_prefix: "wgx".into(),
            exec_lookback: Duration::from_secs(300),
        }
    }
}

/// Conditions the process cannot trade through.
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    Auth { endpoint: String, msg: String },
    CircuitOpen { endpoint: String, attempts: u32 },
    Irreconcilable { symbol: String, cycles: u32, local_qty: Decimal, venue_qty: Decimal },
}

pub struct Reconciler {
    cfg: ReconcileCfg,
    api: Arc<dyn VenueApi>,
    state: SharedState,
    orders: OrderManager,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    journal: Option<mpsc::Sender<Event>>,
    escalations: mpsc::Sender<Escalation>,
    /// consecutive poll failures by kind, for escalation
    poll_failures: StdMutex<HashMap<&'static str, u32>>,
}

impl Reconciler {
    pub fn new(
        cfg: ReconcileCfg,
        api: Arc<dyn VenueApi>,
        state: SharedState,
        orders: OrderManager,
        journal: Option<mpsc::Sender<Event>>,
        escalations: mpsc::Sender<Escalation>,
    ) -> Self {
        Self {
            cfg,
            api,
            state,
            orders,
            locks: StdMutex::new(HashMap::new()),
            journal,
            escalations,
            poll_failures: StdMutex::new(HashMap::new()),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(symbol.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn record(&self, events: Vec<Event>) {
        let Some(tx) = &self.journal else { return };
        for ev in events {
            // journal is best effort; never stall reconciliation on it
            let _ = tx.try_send(ev);
        }
    }

    fn escalate(&self, e: Escalation) {
        error!(?e, "escalating");
        let _ = self.escalations.try_send(e);
    }

    pub fn is_ours(&self, link_id: &str) -> bool {
        !self.cfg.filter_by_prefix || link_id.starts_with(&format!("{}_", self.cfg.link_prefix))
    }

    // ---- push path ----

    /// One private-stream event. Market-data and wallet events are not ours.
    pub async fn on_event(&self, ev: StreamEvent) {
        let mut fills = Vec::new();
        match ev {
            StreamEvent::Order(list) => {
                for u in list {
                    let lock = self.symbol_lock(&u.symbol);
                    let _g = lock.lock().await;
                    let (fill, events) = self.state.write().apply_order_update(&u, "push");
                    self.record(events);
                    fills.extend(fill);
                }
            }
            StreamEvent::Execution(list) => {
                for e in list {
                    let lock = self.symbol_lock(&e.symbol);
                    let _g = lock.lock().await;
                    let (fill, events) = self.state.write().apply_execution(&e, "push");
                    self.record(events);
                    fills.extend(fill);
                }
            }
            StreamEvent::Position(list) => {
                for v in list {
                    let lock = self.symbol_lock(&v.symbol);
                    let _g = lock.lock().await;
                    self.state.write().refresh_from_venue(&v);
                }
            }
            other => debug!(kind = other.kind(), "not a reconciliation event"),
        }
        for f in fills {
            self.follow_up(&f).await;
        }
    }

    /// Actions a fill implies: protect a new position, keep the take-profit
    /// ladder sized to what has been filled so far, promote the stop on the
    /// first target fill, clean up once flat.
    async fn follow_up(&self, f: &FillApplied) {
        if f.opened && f.role == OrderRole::Entry {
            let stop = self.state.read().position(&f.symbol).and_then(|p| p.stop_loss);
            if let Some(stop) = stop {
                if let Err(e) = self.orders.move_stop(&f.symbol, stop, false).await {
                    warn!(symbol = %f.symbol, err = %e, "attaching entry stop failed");
                }
            }
        }
        if matches!(f.role, OrderRole::Entry | OrderRole::Add(_)) && !f.closed {
            if let Err(e) = self.orders.place_targets(&f.symbol).await {
                warn!(symbol = %f.symbol, err = %e, "placing targets failed");
            }
        }
        if let OrderRole::TakeProfit(n) = f.role {
            self.state.write().mark_target_filled(&f.symbol, &f.link_id);
            if !f.closed {
                debug!(symbol = %f.symbol, target = n, "target fill, checking breakeven");
                self.breakeven(&f.symbol).await;
            }
        }
        if f.closed {
            let n = self.orders.cancel_reduce_only(&f.symbol).await;
            if n > 0 {
                info!(symbol = %f.symbol, cancelled = n, "leftover reduce-only orders cancelled");
            }
        }
    }

    /// Move the stop to entry +/- offset once per position, and only when
    /// that tightens the current stop.
    pub async fn breakeven(&self, symbol: &str) {
        let claimed = {
            let mut st = self.state.write();
            let Some(pos) = st.position(symbol).cloned() else { return };
            if pos.breakeven_applied {
                return;
            }
            let raw = self.cfg.breakeven.stop_for(pos.side, pos.avg_entry_price);
            let be = st.instrument(symbol).map(|i| i.round_price(raw)).unwrap_or(raw);
            if !is_tighter(pos.side, be, pos.stop_loss) {
                debug!(symbol, %be, current = ?pos.stop_loss, "breakeven stop not better than current, kept");
                return;
            }
            st.claim_breakeven(symbol).map(|p| (p, be))
        };
        let Some((prev, be)) = claimed else { return };
        match self.orders.move_stop(symbol, be, false).await {
            Ok(stop) => {
                info!(symbol, %stop, "stop promoted to breakeven");
                self.record(vec![Event::Note(format!("{symbol} breakeven stop {stop}"))]);
            }
            Err(e) => {
                warn!(symbol, err = %e, "breakeven promotion failed, will retry on next target fill");
                self.state.write().release_breakeven(symbol, prev);
            }
        }
    }

    // ---- pull paths ----

    /// Compare local net quantity against the venue's position list.
    pub async fn heartbeat(&self, symbol: &str) -> Result<(), TransportError> {
        let started = now_ms();
        let venue = self.api.positions(symbol).await?;
        let v = venue.into_iter().find(|p| p.symbol == symbol && !p.net_qty().is_zero());

        let lock = self.symbol_lock(symbol);
        let _g = lock.lock().await;
        let mut closed = false;
        let mut events = Vec::new();
        {
            let mut st = self.state.write();
            if st.last_touched(symbol) > started {
                debug!(symbol, "local state moved during poll, comparison skipped");
                return Ok(());
            }
            let local = st.position(symbol).cloned();
            let now = now_ms();
            match (local, v) {
                (None, None) => {
                    if st.clear_divergent(symbol) {
                        info!(symbol, "divergence cleared");
                    }
                }
                (Some(l), None) => {
                    warn!(symbol, local_qty = %l.net_qty(), "venue flat, closing local position");
                    st.close_local(symbol, now);
                    st.clear_divergent(symbol);
                    events.push(Event::PositionClosed { symbol: symbol.to_string(), realized_pnl: l.realized_pnl, ts_ms: now });
                    closed = true;
                }
                (None, Some(v)) => {
                    warn!(symbol, venue_qty = %v.net_qty(), avg = %v.avg_price, "venue position missing locally (missed push), synthesizing");
                    DIVERGENCES.with_label_values(&[symbol, "synthesized"]).inc();
                    st.synthesize(&v, now);
                    st.clear_divergent(symbol);
                    events.push(Event::Note(format!("{symbol} position synthesized from venue")));
                }
                (Some(l), Some(v)) => {
                    let (lq, vq) = (l.net_qty(), v.net_qty());
                    if (lq - vq).abs() <= self.cfg.divergence_tolerance {
                        st.refresh_from_venue(&v);
                        if st.clear_divergent(symbol) {
                            info!(symbol, qty = %vq, "divergence cleared");
                        }
                    } else {
                        let cycles = st.mark_divergent(symbol);
                        DIVERGENCES.with_label_values(&[symbol, "qty"]).inc();
                        warn!(symbol, local_qty = %lq, venue_qty = %vq, cycles, "position divergence");
                        events.push(Event::Divergence { symbol: symbol.to_string(), local_qty: lq, venue_qty: vq, ts_ms: now });
                        if cycles >= self.cfg.escalate_after {
                            self.escalate(Escalation::Irreconcilable { symbol: symbol.to_string(), cycles, local_qty: lq, venue_qty: vq });
                        }
                    }
                }
            }
        }
        self.record(events);
        drop(_g);
        if closed {
            self.orders.cancel_reduce_only(symbol).await;
        }
        Ok(())
    }

    /// Fill ledger since the watermark, then the open-order list.
    pub async fn poll_executions(&self, symbol: &str) -> Result<usize, TransportError> {
        let started = now_ms();
        let since = self
            .state
            .read()
            .exec_watermark(symbol)
            .unwrap_or(started - self.cfg.exec_lookback.as_millis() as i64);
        let (execs, complete) = self.fetch_executions(symbol, since).await?;
        let open = self.api.open_orders(symbol).await?;

        let lock = self.symbol_lock(symbol);
        let _g = lock.lock().await;
        let mut fills = Vec::new();
        let mut events = Vec::new();
        {
            let mut st = self.state.write();
            let mut high = since;
            for e in &execs {
                high = high.max(e.exec_time_ms);
                if !self.is_ours(&e.link_id) {
                    debug!(symbol, exec_id = %e.exec_id, link_id = %e.link_id, "foreign execution skipped");
                    continue;
                }
                let (f, ev) = st.apply_execution(e, "poll");
                fills.extend(f);
                events.extend(ev);
            }
            if complete {
                st.advance_watermark(symbol, high);
            } else {
                warn!(symbol, since, fetched = execs.len(), "execution window still truncated, watermark held");
            }
            let (f, ev) = st.apply_open_orders(symbol, &open, started);
            fills.extend(f);
            events.extend(ev);
        }
        drop(_g);
        self.record(events);
        let n = fills.len();
        if n > 0 {
            info!(symbol, fills = n, "execution poll applied missed fills");
        }
        for f in &fills {
            self.follow_up(f).await;
        }
        Ok(n)
    }

    /// Everything in `[since, now]`. A truncated answer is missing its oldest
    /// rows, so the window is re-read ending at the oldest row fetched until
    /// it comes back whole. `false` means the window was still incomplete
    /// after EXEC_BACKFILL_ROUNDS requests.
    async fn fetch_executions(&self, symbol: &str, since: i64) -> Result<(Vec<Execution>, bool), TransportError> {
        let mut out: Vec<Execution> = Vec::new();
        let mut end = None;
        for _ in 0..EXEC_BACKFILL_ROUNDS {
            let h = self.api.executions_between(symbol, since, end).await?;
            let oldest = h.executions.iter().map(|e| e.exec_time_ms).min();
            out.extend(h.executions);
            if !h.truncated {
                out.sort_by_key(|e| e.exec_time_ms);
                return Ok((out, true));
            }
            match oldest {
                // the boundary row is fetched again; exec ids dedupe it
                Some(t) if t > since && Some(t) != end => end = Some(t),
                _ => break,
            }
            debug!(symbol, since, ?end, "execution window truncated, reading older rows");
        }
        out.sort_by_key(|e| e.exec_time_ms);
        Ok((out, false))
    }

    fn note_poll(&self, kind: &'static str, res: Result<(), TransportError>) {
        let mut failures = self.poll_failures.lock().unwrap_or_else(|e| e.into_inner());
        match res {
            Ok(()) => {
                failures.remove(kind);
            }
            Err(TransportError::Auth(msg)) => {
                drop(failures);
                self.escalate(Escalation::Auth { endpoint: kind.to_string(), msg });
            }
            Err(TransportError::Cancelled) => {}
            Err(TransportError::CircuitOpen { endpoint, remaining }) => {
                let n = failures.entry(kind).or_insert(0);
                *n += 1;
                let attempts = *n;
                drop(failures);
                warn!(kind, %endpoint, ?remaining, attempts, "poll blocked by open circuit");
                if attempts >= self.cfg.escalate_after {
                    self.escalate(Escalation::CircuitOpen { endpoint, attempts });
                }
            }
            Err(e) => warn!(kind, err = %e, "poll failed"),
        }
    }

    // ---- task loops ----

    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut tick = interval(self.cfg.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    for s in &self.cfg.symbols {
                        let res = self.heartbeat(s).await;
                        self.note_poll("heartbeat", res);
                    }
                }
            }
        }
        info!("heartbeat stopped");
    }

    pub async fn run_exec_poll(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut tick = interval(self.cfg.exec_poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    for s in &self.cfg.symbols {
                        let res = self.poll_executions(s).await.map(|_| ());
                        self.note_poll("exec_poll", res);
                    }
                }
            }
        }
        info!("execution poll stopped");
    }
}
