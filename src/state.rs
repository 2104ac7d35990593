// ===============================
// src/state.rs
// ===============================
//
// Local mirror of the account: orders, positions, instrument filters and the
// fill-accounting bookkeeping that keeps push and poll paths idempotent.
//
// Fill accounting is driven by cumulative filled quantity per order, never by
// counting events: an update whose cumulative quantity is not above the
// recorded one contributes nothing. Executions carry orderQty/leavesQty, so
// the stream order topic, the stream execution topic and the REST execution
// ledger all resolve to the same cumulative number and a fill can only be
// applied once whichever path reports it first.
//
// Mutated only by the reconciler (and by the order manager for locally
// created `Submitted` orders); everything else reads.
//
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    link_prefix_of, Execution, Instrument, Order, OrderRole, OrderStatus, OrderType, OrderUpdate, Position, Event,
    TimeInForce, VenuePosition,
};
use crate::metrics::{FILLS_APPLIED, OPEN_ORDERS, POSITION_QTY_MICRO};

/// Remembered exec ids (for dedupe of executions that carry no order qty).
const EXEC_ID_MEMORY: usize = 4096;
/// Terminal orders kept around for late fills.
const RETIRED_MEMORY: usize = 1024;
/// Consecutive open-order polls an order may be missing before it is
/// considered cancelled.
pub const MISSING_POLLS_CANCEL: u32 = 2;

/// What a fill did, for the reconciler's follow-up actions.
#[derive(Debug, Clone, PartialEq)]
pub struct FillApplied {
    pub symbol: String,
    pub link_id: String,
    pub role: OrderRole,
    pub qty: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    /// Signed net quantity after the fill.
    pub net_after: Decimal,
    /// Position went from flat to open.
    pub opened: bool,
    /// Position went back to flat.
    pub closed: bool,
}

/// Persisted subset; see persist.rs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub exec_watermarks: Vec<(String, i64)>,
    pub saved_ms: i64,
}

/// Lock around the one `TradingState`. Guards are never held across an
/// `.await`.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<RwLock<TradingState>>);

impl SharedState {
    pub fn new(state: TradingState) -> Self {
        SharedState(Arc::new(RwLock::new(state)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TradingState> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TradingState> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Default)]
pub struct TradingState {
    orders: HashMap<String, Order>,
    by_order_id: HashMap<String, String>,
    retired: HashMap<String, Order>,
    retired_order: VecDeque<String>,
    positions: HashMap<String, Position>,
    instruments: HashMap<String, Instrument>,
    seen_execs: HashSet<String>,
    seen_order: VecDeque<String>,
    exec_watermark: HashMap<String, i64>,
    /// symbol -> wall-clock ms of the last local mutation
    touched: HashMap<String, i64>,
    /// symbol -> consecutive divergent heartbeat cycles
    divergent: HashMap<String, u32>,
}

impl TradingState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- reads ----

    pub fn instrument(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    pub fn set_instrument(&mut self, ins: Instrument) {
        self.instruments.insert(ins.symbol.clone(), ins);
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.positions.values().cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }

    pub fn order(&self, link_id: &str) -> Option<&Order> {
        self.orders.get(link_id).or_else(|| self.retired.get(link_id))
    }

    /// Non-terminal orders, oldest first.
    pub fn open_orders(&self) -> Vec<Order> {
        let mut v: Vec<Order> = self.orders.values().cloned().collect();
        v.sort_by_key(|o| o.created_ms);
        v
    }

    pub fn open_orders_for(&self, symbol: &str) -> Vec<Order> {
        self.open_orders().into_iter().filter(|o| o.symbol == symbol).collect()
    }

    pub fn exec_watermark(&self, symbol: &str) -> Option<i64> {
        self.exec_watermark.get(symbol).copied()
    }

    /// Advance only; never moves back.
    pub fn advance_watermark(&mut self, symbol: &str, ts_ms: i64) {
        let w = self.exec_watermark.entry(symbol.to_string()).or_insert(ts_ms);
        *w = (*w).max(ts_ms);
    }

    pub fn last_touched(&self, symbol: &str) -> i64 {
        self.touched.get(symbol).copied().unwrap_or(0)
    }

    pub fn is_divergent(&self, symbol: &str) -> bool {
        self.divergent.get(symbol).copied().unwrap_or(0) > 0
    }

    pub fn divergent_cycles(&self, symbol: &str) -> u32 {
        self.divergent.get(symbol).copied().unwrap_or(0)
    }

    /// Returns the new consecutive count.
    pub fn mark_divergent(&mut self, symbol: &str) -> u32 {
        let c = self.divergent.entry(symbol.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    pub fn clear_divergent(&mut self, symbol: &str) -> bool {
        self.divergent.remove(symbol).is_some()
    }

    fn touch(&mut self, symbol: &str, now_ms: i64) {
        let t = self.touched.entry(symbol.to_string()).or_insert(now_ms);
        *t = (*t).max(now_ms);
    }

    fn publish_gauges(&self, symbol: &str) {
        let net = self.positions.get(symbol).map(|p| p.net_qty()).unwrap_or(Decimal::ZERO);
        let micro = (net * Decimal::from(1_000_000)).trunc();
        POSITION_QTY_MICRO.with_label_values(&[symbol]).set(micro.try_into().unwrap_or(0));
        OPEN_ORDERS.set(self.orders.len() as i64);
    }

    // ---- order bookkeeping ----

    /// Locally created order awaiting venue acknowledgement.
    pub fn insert_submitted(&mut self, order: Order) {
        debug!(link_id = %order.link_id, symbol = %order.symbol, qty = %order.qty, "order submitted");
        self.orders.insert(order.link_id.clone(), order);
        OPEN_ORDERS.set(self.orders.len() as i64);
    }

    /// REST acknowledgement: record the venue id; status still moves only on
    /// venue-reported updates.
    pub fn record_ack(&mut self, link_id: &str, order_id: &str) {
        if let Some(o) = self.orders.get_mut(link_id) {
            if o.order_id.is_none() && !order_id.is_empty() {
                o.order_id = Some(order_id.to_string());
                self.by_order_id.insert(order_id.to_string(), link_id.to_string());
            }
        }
    }

    /// Synchronous venue rejection of a submission.
    pub fn reject_submitted(&mut self, link_id: &str, now_ms: i64) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(o) = self.orders.get_mut(link_id) {
            if o.status == OrderStatus::Submitted {
                events.push(transition(o, OrderStatus::Rejected, now_ms));
                o.status = OrderStatus::Rejected;
            }
        }
        self.retire_if_terminal(link_id);
        events
    }

    fn key_for(&self, link_id: &str, order_id: &str) -> Option<String> {
        if !link_id.is_empty() && (self.orders.contains_key(link_id) || self.retired.contains_key(link_id)) {
            return Some(link_id.to_string());
        }
        self.by_order_id.get(order_id).cloned()
    }

    fn order_mut(&mut self, key: &str) -> Option<&mut Order> {
        if self.orders.contains_key(key) {
            self.orders.get_mut(key)
        } else {
            self.retired.get_mut(key)
        }
    }

    fn adopt(&mut self, u: &OrderUpdate, now_ms: i64) -> String {
        // external orders may come without a link id; key them by venue id
        let key = if u.link_id.is_empty() { format!("venue:{}", u.order_id) } else { u.link_id.clone() };
        let role = OrderRole::from_link_id(&u.link_id);
        warn!(link_id = %key, order_id = %u.order_id, symbol = %u.symbol, ?role, "adopting order not created here");
        let order = Order {
            link_id: key.clone(),
            order_id: Some(u.order_id.clone()),
            symbol: u.symbol.clone(),
            side: u.side,
            qty: u.qty,
            price: u.price,
            order_type: u.order_type,
            tif: TimeInForce::GoodTillCancel,
            reduce_only: u.reduce_only,
            role,
            status: OrderStatus::New,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            plan: None,
            created_ms: now_ms,
            updated_ms: now_ms,
            missing_polls: 0,
        };
        self.by_order_id.insert(u.order_id.clone(), key.clone());
        self.orders.insert(key.clone(), order);
        key
    }

    fn retire_if_terminal(&mut self, key: &str) {
        let terminal = self.orders.get(key).map(|o| o.status.is_terminal()).unwrap_or(false);
        if !terminal {
            return;
        }
        if let Some(o) = self.orders.remove(key) {
            if matches!(o.role, OrderRole::TakeProfit(_)) && matches!(o.status, OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired) {
                self.release_target_leg(&o);
            }
            debug!(link_id = %key, status = ?o.status, "order retired");
            self.retired.insert(key.to_string(), o);
            self.retired_order.push_back(key.to_string());
            while self.retired_order.len() > RETIRED_MEMORY {
                if let Some(old) = self.retired_order.pop_front() {
                    if let Some(gone) = self.retired.remove(&old) {
                        if let Some(id) = gone.order_id {
                            self.by_order_id.remove(&id);
                        }
                    }
                }
            }
        }
    }

    // ---- fill accounting ----

    /// Raise the order's cumulative fill to `cum` and apply the increment to
    /// the position. `avg` is the order's new average price when known;
    /// `fallback_px` prices the increment otherwise.
    fn apply_cum_fill(&mut self, key: &str, cum: Decimal, avg: Option<Decimal>, fallback_px: Decimal, ts_ms: i64, path: &str) -> Option<FillApplied> {
        let (symbol, side, role, link_id, plan, delta, px) = {
            let o = self.order_mut(key)?;
            let delta = cum - o.filled_qty;
            if delta <= Decimal::ZERO {
                return None;
            }
            // price of the increment from the change in average price
            let px = match avg {
                Some(a) if a > Decimal::ZERO && o.filled_qty > Decimal::ZERO && o.avg_fill_price > Decimal::ZERO => {
                    let inc = (a * cum - o.avg_fill_price * o.filled_qty) / delta;
                    if inc > Decimal::ZERO {
                        inc
                    } else {
                        fallback_px
                    }
                }
                Some(a) if a > Decimal::ZERO && o.filled_qty.is_zero() => a,
                _ => fallback_px,
            };
            let new_avg = if o.filled_qty.is_zero() {
                px
            } else {
                (o.avg_fill_price * o.filled_qty + px * delta) / cum
            };
            o.filled_qty = cum;
            o.avg_fill_price = avg.filter(|a| *a > Decimal::ZERO).unwrap_or(new_avg);
            o.updated_ms = o.updated_ms.max(ts_ms);
            (o.symbol.clone(), o.side, o.role, o.link_id.clone(), o.plan.clone(), delta, px)
        };

        let was_open = self.positions.get(&symbol).map(|p| !p.is_flat()).unwrap_or(false);
        let pos = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::open(&symbol, side, Decimal::ZERO, px, ts_ms));
        let pnl = pos.apply_fill(side, delta, px, ts_ms);
        let opened = !was_open && !pos.is_flat();
        if opened {
            pos.opened_ms = ts_ms;
            if role == OrderRole::Entry {
                pos.link_prefix = Some(link_prefix_of(&link_id).to_string());
                if let Some(plan) = plan {
                    pos.stop_loss = plan.stop_loss;
                    pos.targets = plan.targets;
                }
            }
        }
        // pyramid adds count once, on their first fill
        if matches!(role, OrderRole::Add(_)) && delta == cum {
            pos.add_count += 1;
        }
        if matches!(role, OrderRole::Entry | OrderRole::Add(_)) && side == pos.side {
            pos.ladder_basis += delta;
        }
        if let OrderRole::TakeProfit(n) = role {
            if let Some(t) = pos.targets.get_mut(usize::from(n.saturating_sub(1))) {
                if !t.owns(&link_id) {
                    t.legs.push(link_id.clone());
                }
            }
        }
        let net_after = pos.net_qty();
        let closed = was_open && pos.is_flat();
        if pos.is_flat() {
            info!(%symbol, realized = %pos.realized_pnl, "position flat");
            self.positions.remove(&symbol);
        }
        FILLS_APPLIED.with_label_values(&[&symbol, path]).inc();
        info!(%symbol, link_id = %link_id, ?side, qty = %delta, price = %px, pnl = %pnl, net = %net_after, path, "fill applied");
        self.touch(&symbol, crate::domain::now_ms());
        self.publish_gauges(&symbol);
        Some(FillApplied { symbol, link_id, role, qty: delta, price: px, realized_pnl: pnl, net_after, opened, closed })
    }

    fn fill_events(&self, f: &FillApplied, side: crate::domain::Side, ts_ms: i64) -> Vec<Event> {
        let mut ev = vec![Event::Fill {
            link_id: f.link_id.clone(),
            symbol: f.symbol.clone(),
            side,
            qty: f.qty,
            price: f.price,
            realized_pnl: f.realized_pnl,
            ts_ms,
        }];
        if f.closed {
            ev.push(Event::PositionClosed { symbol: f.symbol.clone(), realized_pnl: f.realized_pnl, ts_ms });
        }
        ev
    }

    /// Venue order update (stream push or open-order poll).
    pub fn apply_order_update(&mut self, u: &OrderUpdate, path: &str) -> (Option<FillApplied>, Vec<Event>) {
        let now = crate::domain::now_ms();
        let key = match self.key_for(&u.link_id, &u.order_id) {
            Some(k) => k,
            None => self.adopt(u, now),
        };
        let mut events = Vec::new();
        if let Some(o) = self.order_mut(&key) {
            if o.order_id.is_none() && !u.order_id.is_empty() {
                o.order_id = Some(u.order_id.clone());
            }
            o.missing_polls = 0;
        }
        if !u.order_id.is_empty() {
            self.by_order_id.insert(u.order_id.clone(), key.clone());
        }

        let fill = self.apply_cum_fill(&key, u.cum_filled, Some(u.avg_price), u.avg_price, u.updated_ms, path);
        if let Some(f) = &fill {
            events.extend(self.fill_events(f, u.side, u.updated_ms));
        }

        if let Some(o) = self.order_mut(&key) {
            let next = u.status;
            if o.status != next {
                if o.status.can_transition_to(next) {
                    events.push(transition(o, next, u.updated_ms));
                    o.status = next;
                    o.updated_ms = o.updated_ms.max(u.updated_ms);
                } else {
                    debug!(link_id = %key, from = ?o.status, to = ?next, "out-of-order status ignored");
                }
            }
        }
        self.retire_if_terminal(&key);
        if let Some(o) = self.orders.get(&key) {
            let sym = o.symbol.clone();
            self.publish_gauges(&sym);
        }
        (fill, events)
    }

    /// One fill from the stream or the REST ledger.
    pub fn apply_execution(&mut self, e: &Execution, path: &str) -> (Option<FillApplied>, Vec<Event>) {
        let dedupe = e.dedupe_key();
        if self.seen_execs.contains(&dedupe) {
            return (None, Vec::new());
        }
        let key = match self.key_for(&e.link_id, &e.order_id) {
            Some(k) => k,
            None => {
                let synthetic = OrderUpdate {
                    order_id: e.order_id.clone(),
                    link_id: e.link_id.clone(),
                    symbol: e.symbol.clone(),
                    side: e.side,
                    status: OrderStatus::New,
                    order_type: OrderType::Market,
                    qty: if e.order_qty > Decimal::ZERO { e.order_qty } else { e.qty },
                    price: None,
                    cum_filled: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                    reduce_only: false,
                    updated_ms: e.exec_time_ms,
                };
                self.adopt(&synthetic, crate::domain::now_ms())
            }
        };
        self.remember_exec(&dedupe);
        let cum = match (e.implied_cum_filled(), self.order(&key)) {
            (Some(c), _) => c,
            (None, Some(o)) => o.filled_qty + e.qty,
            (None, None) => return (None, Vec::new()),
        };
        let fill = self.apply_cum_fill(&key, cum, None, e.price, e.exec_time_ms, path);
        let mut events = Vec::new();
        if let Some(f) = &fill {
            events.extend(self.fill_events(f, e.side, e.exec_time_ms));
        }
        // executions also move the lifecycle forward
        if let Some(o) = self.order_mut(&key) {
            let next = if o.filled_qty >= o.qty { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            if o.filled_qty > Decimal::ZERO && o.status != next && o.status.can_transition_to(next) {
                events.push(transition(o, next, e.exec_time_ms));
                o.status = next;
            }
        }
        self.retire_if_terminal(&key);
        (fill, events)
    }

    fn remember_exec(&mut self, exec_id: &str) {
        if exec_id.is_empty() || !self.seen_execs.insert(exec_id.to_string()) {
            return;
        }
        self.seen_order.push_back(exec_id.to_string());
        while self.seen_order.len() > EXEC_ID_MEMORY {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_execs.remove(&old);
            }
        }
    }

    /// Open-order poll: apply every reported order, then count polls that
    /// miss a local live order. Orders created after `poll_started_ms` are
    /// not judged by this poll.
    pub fn apply_open_orders(&mut self, symbol: &str, list: &[OrderUpdate], poll_started_ms: i64) -> (Vec<FillApplied>, Vec<Event>) {
        let mut fills = Vec::new();
        let mut events = Vec::new();
        let mut reported: HashSet<String> = HashSet::new();
        for u in list.iter().filter(|u| u.symbol == symbol) {
            reported.insert(u.order_id.clone());
            if !u.link_id.is_empty() {
                reported.insert(u.link_id.clone());
            }
            let (f, ev) = self.apply_order_update(u, "poll");
            fills.extend(f);
            events.extend(ev);
        }
        let candidates: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.created_ms < poll_started_ms)
            .filter(|o| !reported.contains(&o.link_id) && !o.order_id.as_ref().map(|id| reported.contains(id)).unwrap_or(false))
            .map(|o| o.link_id.clone())
            .collect();
        for key in candidates {
            if let Some(o) = self.orders.get_mut(&key) {
                o.missing_polls += 1;
                if o.missing_polls >= MISSING_POLLS_CANCEL && o.filled_qty.is_zero() && o.status.can_transition_to(OrderStatus::Cancelled) {
                    warn!(link_id = %key, symbol, polls = o.missing_polls, "order missing from venue, marking cancelled");
                    events.push(transition(o, OrderStatus::Cancelled, poll_started_ms));
                    o.status = OrderStatus::Cancelled;
                }
            }
            self.retire_if_terminal(&key);
        }
        self.publish_gauges(symbol);
        (fills, events)
    }

    // ---- position mutations driven by the reconciler ----

    /// Venue says flat; drop the local position.
    pub fn close_local(&mut self, symbol: &str, now_ms: i64) -> Option<Position> {
        let p = self.positions.remove(symbol);
        if p.is_some() {
            self.touch(symbol, now_ms);
            self.publish_gauges(symbol);
        }
        p
    }

    /// Venue shows a position with no local counterpart.
    pub fn synthesize(&mut self, v: &VenuePosition, now_ms: i64) -> Option<&Position> {
        let side = v.side?;
        if v.size <= Decimal::ZERO {
            return None;
        }
        let mut p = Position::open(&v.symbol, side, v.size, v.avg_price, now_ms);
        p.stop_loss = v.stop_loss;
        p.unrealized_pnl = v.unrealized_pnl;
        self.positions.insert(v.symbol.clone(), p);
        self.touch(&v.symbol, now_ms);
        self.publish_gauges(&v.symbol);
        self.positions.get(&v.symbol)
    }

    /// Stream position push: refresh venue-owned fields. Quantity is left to
    /// fills and the heartbeat.
    pub fn refresh_from_venue(&mut self, v: &VenuePosition) {
        if let Some(p) = self.positions.get_mut(&v.symbol) {
            if v.net_qty() == p.net_qty() {
                p.unrealized_pnl = v.unrealized_pnl;
                if v.avg_price > Decimal::ZERO {
                    p.avg_entry_price = v.avg_price;
                }
            }
            if v.stop_loss.is_some() {
                p.stop_loss = v.stop_loss;
            }
        }
    }

    pub fn set_stop(&mut self, symbol: &str, stop: Decimal) -> bool {
        match self.positions.get_mut(symbol) {
            Some(p) => {
                p.stop_loss = Some(stop);
                true
            }
            None => false,
        }
    }

    /// Claim the one breakeven promotion of the open position. Returns the
    /// previous stop so a failed promotion can be reverted.
    pub fn claim_breakeven(&mut self, symbol: &str) -> Option<Option<Decimal>> {
        let p = self.positions.get_mut(symbol)?;
        if p.breakeven_applied {
            return None;
        }
        p.breakeven_applied = true;
        Some(p.stop_loss)
    }

    pub fn release_breakeven(&mut self, symbol: &str, previous_stop: Option<Decimal>) {
        if let Some(p) = self.positions.get_mut(symbol) {
            p.breakeven_applied = false;
            p.stop_loss = previous_stop;
        }
    }

    /// A take-profit leg about to be sent for target `index`.
    pub fn record_target_leg(&mut self, symbol: &str, index: usize, link_id: &str, qty: Decimal) {
        if let Some(t) = self.positions.get_mut(symbol).and_then(|p| p.targets.get_mut(index)) {
            t.legs.push(link_id.to_string());
            t.placed_qty += qty;
        }
    }

    /// A leg that died unfilled (or partly filled) no longer covers its
    /// remainder; the next ladder top-up may place it again.
    fn release_target_leg(&mut self, o: &Order) {
        let Some(p) = self.positions.get_mut(&o.symbol) else { return };
        if let Some(t) = p.targets.iter_mut().find(|t| t.owns(&o.link_id)) {
            let unfilled = (o.qty - o.filled_qty).max(Decimal::ZERO);
            t.placed_qty = (t.placed_qty - unfilled).max(Decimal::ZERO);
            debug!(link_id = %o.link_id, %unfilled, placed = %t.placed_qty, "target leg released");
        }
    }

    pub fn mark_target_filled(&mut self, symbol: &str, link_id: &str) {
        if let Some(p) = self.positions.get_mut(symbol) {
            for t in p.targets.iter_mut().filter(|t| t.owns(link_id)) {
                t.filled = true;
            }
        }
    }

    // ---- persistence ----

    pub fn snapshot(&self, now_ms: i64) -> StateSnapshot {
        let mut wm: Vec<(String, i64)> = self.exec_watermark.iter().map(|(k, v)| (k.clone(), *v)).collect();
        wm.sort();
        StateSnapshot { orders: self.open_orders(), positions: self.positions(), exec_watermarks: wm, saved_ms: now_ms }
    }

    pub fn restore(&mut self, snap: StateSnapshot) {
        for o in snap.orders {
            if let Some(id) = &o.order_id {
                self.by_order_id.insert(id.clone(), o.link_id.clone());
            }
            self.orders.insert(o.link_id.clone(), o);
        }
        for p in snap.positions {
            self.positions.insert(p.symbol.clone(), p);
        }
        for (s, w) in snap.exec_watermarks {
            self.advance_watermark(&s, w);
        }
        info!(orders = self.orders.len(), positions = self.positions.len(), "state restored");
    }
}

fn transition(o: &Order, to: OrderStatus, ts_ms: i64) -> Event {
    info!(link_id = %o.link_id, symbol = %o.symbol, from = ?o.status, to = ?to, "order transition");
    Event::Transition { link_id: o.link_id.clone(), symbol: o.symbol.clone(), from: o.status, to, ts_ms }
}
