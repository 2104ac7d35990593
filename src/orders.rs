// ===============================
// src/orders.rs
// ===============================
//
// Order/position mutators: open, close, pyramid_add, trail_stop, plus the
// take-profit ladder and stop moves the reconciler triggers.
//
// Each mutator runs local checks first (rounding to tick/step, venue minimum,
// divergence gate), records the order as `Submitted` and sends it. Nothing
// beyond `Submitted` is set here; the reconciler moves orders and positions
// from venue reports.
//
use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{
    now_ms, EntryPlan, Event, Instrument, Order, OrderRole, OrderStatus, OrderType, Position, Side, TakeProfitTarget,
    TimeInForce,
};
use crate::error::{StateError, TransportError};
use crate::rest::{OrderRequest, VenueApi};
use crate::state::SharedState;

#[derive(Debug, Clone)]
pub struct OrderCfg {
    /// Leading part of every link id this process creates.
    pub link_prefix: String,
    pub max_pyramid_adds: u32,
    /// Log intents, touch nothing at the venue.
    pub dry_run: bool,
}

impl Default for OrderCfg {
    fn default() -> Self {
        Self { link_prefix: "wgx".into(), max_pyramid_adds: 3, dry_run: false }
    }
}

/// `<prefix>_<ms>_<4 hex>`
pub fn new_link_prefix(prefix: &str) -> String {
    let salt: u16 = rand::thread_rng().gen();
    format!("{}_{}_{:04x}", prefix, now_ms(), salt)
}

pub fn link_id(group: &str, role: OrderRole) -> String {
    format!("{}_{}", group, role.suffix())
}

/// Rounded quantity, or why it cannot be sent.
fn sized(ins: &Instrument, qty: Decimal) -> Result<Decimal, StateError> {
    let mut q = ins.round_qty(qty);
    if ins.max_qty > Decimal::ZERO && q > ins.max_qty {
        warn!(symbol = %ins.symbol, requested = %qty, max = %ins.max_qty, "quantity clamped to venue maximum");
        q = ins.round_qty(ins.max_qty);
    }
    if q <= Decimal::ZERO || q < ins.min_qty {
        return Err(StateError::InvalidParameter(format!("{} quantity {} below venue minimum {}", ins.symbol, q, ins.min_qty)));
    }
    Ok(q)
}

/// A stop is tighter when it moves toward (or past) the market in the
/// position's favour: up for longs, down for shorts.
pub fn is_tighter(side: Side, new: Decimal, current: Option<Decimal>) -> bool {
    match (side, current) {
        (_, None) => true,
        (Side::Buy, Some(c)) => new > c,
        (Side::Sell, Some(c)) => new < c,
    }
}

/// Take-profit legs still missing from a position's ladder: for every
/// unfilled target, its fraction of the ladder basis minus what is already
/// working, rounded down to the step. The first leg of target N is
/// `<group>_tpN`, top-ups are `<group>-<k>_tpN`. Shortfalls below the venue
/// minimum wait for the basis to grow.
pub fn target_legs(ins: &Instrument, pos: &Position, group: &str) -> Vec<(usize, OrderRequest)> {
    pos.targets
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.filled)
        .filter_map(|(i, t)| {
            let want = ins.round_qty(pos.ladder_basis * t.fraction);
            let qty = ins.round_qty(want - t.placed_qty);
            if qty <= Decimal::ZERO || qty < ins.min_qty {
                if t.legs.is_empty() && want > Decimal::ZERO {
                    debug!(symbol = %pos.symbol, target = i + 1, %qty, "target leg below minimum, waiting");
                }
                return None;
            }
            let n = (i + 1) as u8;
            let link = if t.legs.is_empty() {
                link_id(group, OrderRole::TakeProfit(n))
            } else {
                link_id(&format!("{}-{}", group, t.legs.len() + 1), OrderRole::TakeProfit(n))
            };
            Some((
                i,
                OrderRequest {
                    symbol: pos.symbol.clone(),
                    side: pos.side.opposite(),
                    order_type: OrderType::Limit,
                    qty,
                    price: Some(ins.round_price(t.price)),
                    tif: TimeInForce::GoodTillCancel,
                    reduce_only: true,
                    link_id: link,
                },
            ))
        })
        .collect()
}

fn local_order(req: &OrderRequest, role: OrderRole, plan: Option<EntryPlan>) -> Order {
    let now = now_ms();
    Order {
        link_id: req.link_id.clone(),
        order_id: None,
        symbol: req.symbol.clone(),
        side: req.side,
        qty: req.qty,
        price: req.price,
        order_type: req.order_type,
        tif: req.tif,
        reduce_only: req.reduce_only,
        role,
        status: OrderStatus::Submitted,
        filled_qty: Decimal::ZERO,
        avg_fill_price: Decimal::ZERO,
        plan,
        created_ms: now,
        updated_ms: now,
        missing_polls: 0,
    }
}

#[derive(Clone)]
pub struct OrderManager {
    cfg: OrderCfg,
    api: Arc<dyn VenueApi>,
    state: SharedState,
    journal: Option<mpsc::Sender<Event>>,
}

impl OrderManager {
    pub fn new(cfg: OrderCfg, api: Arc<dyn VenueApi>, state: SharedState) -> Self {
        Self { cfg, api, state, journal: None }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    fn reject(&self, link_id: &str) {
        let events = self.state.write().reject_submitted(link_id, now_ms());
        if let Some(tx) = &self.journal {
            for ev in events {
                let _ = tx.try_send(ev);
            }
        }
    }

    pub fn cfg(&self) -> &OrderCfg {
        &self.cfg
    }

    fn instrument(&self, symbol: &str) -> Result<Instrument, StateError> {
        self.state.read().instrument(symbol).cloned().ok_or_else(|| StateError::UnknownInstrument(symbol.to_string()))
    }

    fn position(&self, symbol: &str) -> Result<Position, StateError> {
        self.state.read().position(symbol).cloned().ok_or_else(|| StateError::NoPosition(symbol.to_string()))
    }

    /// Record as Submitted, send, record the ack. A venue refusal rejects
    /// the local order; a transport failure leaves it Submitted for the
    /// open-order poll to settle, since the venue may have taken it.
    async fn submit(&self, req: OrderRequest, role: OrderRole, plan: Option<EntryPlan>) -> Result<Order, StateError> {
        let order = local_order(&req, role, plan);
        self.state.write().insert_submitted(order.clone());
        if self.cfg.dry_run {
            info!(symbol = %req.symbol, link_id = %req.link_id, side = ?req.side, qty = %req.qty, "dry run: order not sent");
            return Ok(order);
        }
        match self.api.place_order(&req).await {
            Ok(ack) => {
                self.state.write().record_ack(&req.link_id, &ack.order_id);
                info!(symbol = %req.symbol, link_id = %req.link_id, order_id = %ack.order_id, ?role, "order accepted");
                Ok(self.state.read().order(&req.link_id).cloned().unwrap_or(order))
            }
            Err(e) => {
                if !e.is_transient() && !matches!(e, TransportError::Cancelled) {
                    self.reject(&req.link_id);
                }
                warn!(symbol = %req.symbol, link_id = %req.link_id, err = %e, "order submission failed");
                Err(e.into())
            }
        }
    }

    /// Market entry with an optional stop and take-profit ladder. The
    /// position itself appears when the venue reports the fill.
    pub async fn open(&self, symbol: &str, side: Side, qty: Decimal, stop: Option<Decimal>, targets: Vec<TakeProfitTarget>) -> Result<Order, StateError> {
        {
            let st = self.state.read();
            if st.is_divergent(symbol) {
                return Err(StateError::Divergent(symbol.to_string()));
            }
            if st.position(symbol).is_some() {
                return Err(StateError::PositionOpen(symbol.to_string()));
            }
        }
        let ins = self.instrument(symbol)?;
        let qty = sized(&ins, qty)?;
        let plan = EntryPlan {
            stop_loss: stop.map(|p| ins.round_price(p)),
            targets: targets.into_iter().map(|t| TakeProfitTarget::new(ins.round_price(t.price), t.fraction)).collect(),
        };
        let group = new_link_prefix(&self.cfg.link_prefix);
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            tif: TimeInForce::ImmediateOrCancel,
            reduce_only: false,
            link_id: link_id(&group, OrderRole::Entry),
        };
        self.submit(req, OrderRole::Entry, Some(plan)).await
    }

    /// Reduce-only market exit of the whole position.
    pub async fn close(&self, symbol: &str) -> Result<Order, StateError> {
        let pos = self.position(symbol)?;
        let ins = self.instrument(symbol)?;
        let group = pos.link_prefix.clone().unwrap_or_else(|| new_link_prefix(&self.cfg.link_prefix));
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side: pos.side.opposite(),
            order_type: OrderType::Market,
            qty: ins.round_qty(pos.qty).max(ins.min_qty),
            price: None,
            tif: TimeInForce::ImmediateOrCancel,
            reduce_only: true,
            link_id: link_id(&group, OrderRole::Exit),
        };
        self.submit(req, OrderRole::Exit, None).await
    }

    pub async fn pyramid_add(&self, symbol: &str, qty: Decimal) -> Result<Order, StateError> {
        let pos = self.position(symbol)?;
        let (divergent, pending_adds) = {
            let st = self.state.read();
            let pending = st.open_orders_for(symbol).iter().filter(|o| matches!(o.role, OrderRole::Add(_))).count() as u32;
            (st.is_divergent(symbol), pending)
        };
        if divergent {
            return Err(StateError::Divergent(symbol.to_string()));
        }
        let n = pos.add_count + pending_adds;
        if n >= self.cfg.max_pyramid_adds {
            return Err(StateError::PyramidLimit(self.cfg.max_pyramid_adds));
        }
        let ins = self.instrument(symbol)?;
        let qty = sized(&ins, qty)?;
        let group = pos.link_prefix.clone().unwrap_or_else(|| new_link_prefix(&self.cfg.link_prefix));
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side: pos.side,
            order_type: OrderType::Market,
            qty,
            price: None,
            tif: TimeInForce::ImmediateOrCancel,
            reduce_only: false,
            link_id: link_id(&group, OrderRole::Add(n + 1)),
        };
        self.submit(req, OrderRole::Add(n + 1), None).await
    }

    /// Move the position stop; only tightening moves are accepted.
    pub async fn trail_stop(&self, symbol: &str, new_stop: Decimal) -> Result<Decimal, StateError> {
        self.move_stop(symbol, new_stop, true).await
    }

    /// Send a stop to the venue's position-level stop. Returns the rounded
    /// stop that was applied.
    pub async fn move_stop(&self, symbol: &str, stop: Decimal, require_tighter: bool) -> Result<Decimal, StateError> {
        let pos = self.position(symbol)?;
        let ins = self.instrument(symbol)?;
        let stop = ins.round_price(stop);
        if require_tighter && !is_tighter(pos.side, stop, pos.stop_loss) {
            return Err(StateError::StopNotTighter { new: stop, current: pos.stop_loss });
        }
        if self.cfg.dry_run {
            info!(symbol, %stop, "dry run: stop not sent");
        } else {
            self.api.set_trading_stop(symbol, stop).await?;
            info!(symbol, %stop, previous = ?pos.stop_loss, "position stop moved");
        }
        self.state.write().set_stop(symbol, stop);
        Ok(stop)
    }

    /// Bring the take-profit ladder up to the position's current basis in
    /// one batch. Legs are computed and booked under one state lock so two
    /// fills racing here cannot both place the same shortfall. Returns how
    /// many legs the venue accepted.
    pub async fn place_targets(&self, symbol: &str) -> Result<usize, StateError> {
        let ins = self.instrument(symbol)?;
        let legs = {
            let mut st = self.state.write();
            let pos = st.position(symbol).cloned().ok_or_else(|| StateError::NoPosition(symbol.to_string()))?;
            let group = pos.link_prefix.clone().unwrap_or_else(|| new_link_prefix(&self.cfg.link_prefix));
            let legs = target_legs(&ins, &pos, &group);
            for (i, req) in &legs {
                st.insert_submitted(local_order(req, OrderRole::TakeProfit((*i + 1) as u8), None));
                st.record_target_leg(symbol, *i, &req.link_id, req.qty);
            }
            legs
        };
        if legs.is_empty() {
            return Ok(0);
        }
        if self.cfg.dry_run {
            info!(symbol, legs = legs.len(), "dry run: targets not sent");
            return Ok(legs.len());
        }
        let reqs: Vec<OrderRequest> = legs.iter().map(|(_, r)| r.clone()).collect();
        let results = match self.api.place_batch(&reqs).await {
            Ok(r) => r,
            Err(e) => {
                warn!(symbol, err = %e, "target batch failed");
                if !e.is_transient() && !matches!(e, TransportError::Cancelled) {
                    for r in &reqs {
                        self.reject(&r.link_id);
                    }
                }
                return Err(e.into());
            }
        };
        let mut accepted = 0;
        for (req, res) in reqs.iter().zip(results) {
            match res {
                Ok(ack) => {
                    self.state.write().record_ack(&req.link_id, &ack.order_id);
                    accepted += 1;
                }
                Err(e) => {
                    warn!(symbol, link_id = %req.link_id, err = %e, "target leg rejected");
                    self.reject(&req.link_id);
                }
            }
        }
        info!(symbol, accepted, total = reqs.len(), "take-profit ladder placed");
        Ok(accepted)
    }

    /// Cancel every live reduce-only order on a symbol (position gone).
    pub async fn cancel_reduce_only(&self, symbol: &str) -> usize {
        let live: Vec<String> = self
            .state
            .read()
            .open_orders_for(symbol)
            .into_iter()
            .filter(|o| o.reduce_only && !o.status.is_terminal())
            .map(|o| o.link_id)
            .collect();
        if self.cfg.dry_run {
            return live.len();
        }
        let mut n = 0;
        for link in live {
            match self.api.cancel_order(symbol, &link).await {
                Ok(()) => n += 1,
                // already gone at the venue; the order poll settles it
                Err(e) => warn!(symbol, link_id = %link, err = %e, "cancel failed"),
            }
        }
        n
    }
}
