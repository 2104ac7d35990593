// ===============================
// tests/common/mod.rs
// ===============================
//
// Scripted in-memory venue for integration scenarios.
//
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use perp_sync::domain::{
    BookFrame, Execution, Instrument, Kline, OrderStatus, OrderType, OrderUpdate, Side, Ticker, VenuePosition, WalletBalance,
};
use perp_sync::error::TransportError;
use perp_sync::orders::{OrderCfg, OrderManager};
use perp_sync::reconcile::{Escalation, ReconcileCfg, Reconciler};
use perp_sync::rest::{ExecutionHistory, OrderAck, OrderRequest, VenueApi};
use perp_sync::state::{SharedState, TradingState};

pub const SYMBOL: &str = "BTCUSDT";

#[derive(Default)]
pub struct Book {
    pub positions: Vec<VenuePosition>,
    pub executions: Vec<Execution>,
    pub open_orders: Vec<OrderUpdate>,
    pub placed: Vec<OrderRequest>,
    pub batches: Vec<Vec<OrderRequest>>,
    pub stops: Vec<(String, Decimal)>,
    pub cancels: Vec<String>,
    /// Returned (once) by the next place_order.
    pub reject_next: Option<TransportError>,
    pub position_polls: u32,
    /// Rows per execution request; newer rows win when the cap bites.
    pub exec_cap: Option<usize>,
    pub exec_requests: u32,
}

#[derive(Clone, Default)]
pub struct FakeVenue {
    pub inner: Arc<Mutex<Book>>,
}

impl FakeVenue {
    pub fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.inner.lock().unwrap()
    }

    pub fn set_position(&self, side: Option<Side>, size: Decimal, avg: Decimal) {
        self.book().positions = vec![VenuePosition {
            symbol: SYMBOL.into(),
            side,
            size,
            avg_price: avg,
            stop_loss: None,
            unrealized_pnl: Decimal::ZERO,
            updated_ms: 1,
        }];
    }
}

pub fn instrument() -> Instrument {
    Instrument { symbol: SYMBOL.into(), tick_size: dec!(0.1), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: dec!(100) }
}

#[async_trait]
impl VenueApi for FakeVenue {
    async fn instrument(&self, _symbol: &str) -> Result<Instrument, TransportError> {
        Ok(instrument())
    }

    async fn orderbook(&self, symbol: &str, _depth: u32) -> Result<BookFrame, TransportError> {
        Ok(BookFrame {
            symbol: symbol.into(),
            bids: vec![(dec!(100), dec!(1))],
            asks: vec![(dec!(100.5), dec!(1))],
            sequence: 1,
            ts_ms: 1,
        })
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, TransportError> {
        Ok(Ticker { symbol: symbol.into(), last_price: Some(dec!(100.2)), ts_ms: 1, ..Default::default() })
    }

    async fn klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Kline>, TransportError> {
        Ok(Vec::new())
    }

    async fn wallet_balance(&self) -> Result<Vec<WalletBalance>, TransportError> {
        Ok(vec![WalletBalance { coin: "USDT".into(), equity: dec!(1000), available: dec!(1000) }])
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, TransportError> {
        let mut b = self.book();
        b.position_polls += 1;
        Ok(b.positions.iter().filter(|p| p.symbol == symbol).cloned().collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, TransportError> {
        let mut b = self.book();
        if let Some(e) = b.reject_next.take() {
            return Err(e);
        }
        b.placed.push(req.clone());
        Ok(OrderAck { order_id: format!("o{}", b.placed.len()), order_link_id: req.link_id.clone() })
    }

    async fn place_batch(&self, reqs: &[OrderRequest]) -> Result<Vec<Result<OrderAck, TransportError>>, TransportError> {
        let mut b = self.book();
        b.batches.push(reqs.to_vec());
        let n = b.batches.len();
        Ok(reqs
            .iter()
            .enumerate()
            .map(|(i, r)| Ok(OrderAck { order_id: format!("b{n}-{i}"), order_link_id: r.link_id.clone() }))
            .collect())
    }

    async fn cancel_order(&self, _symbol: &str, link_id: &str) -> Result<(), TransportError> {
        self.book().cancels.push(link_id.to_string());
        Ok(())
    }

    async fn set_trading_stop(&self, symbol: &str, stop_loss: Decimal) -> Result<(), TransportError> {
        self.book().stops.push((symbol.to_string(), stop_loss));
        Ok(())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, TransportError> {
        Ok(self.book().open_orders.iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn executions_between(&self, symbol: &str, start_ms: i64, end_ms: Option<i64>) -> Result<ExecutionHistory, TransportError> {
        let mut b = self.book();
        b.exec_requests += 1;
        let mut rows: Vec<Execution> = b
            .executions
            .iter()
            .filter(|e| e.symbol == symbol && e.exec_time_ms >= start_ms && end_ms.map_or(true, |end| e.exec_time_ms <= end))
            .cloned()
            .collect();
        rows.sort_by_key(|e| std::cmp::Reverse(e.exec_time_ms));
        let truncated = matches!(b.exec_cap, Some(cap) if rows.len() > cap);
        if let Some(cap) = b.exec_cap {
            rows.truncate(cap);
        }
        rows.reverse();
        Ok(ExecutionHistory { executions: rows, truncated })
    }
}

pub struct Harness {
    pub venue: FakeVenue,
    pub state: SharedState,
    pub orders: OrderManager,
    pub reconciler: Reconciler,
    pub escalations: mpsc::Receiver<Escalation>,
}

pub fn harness() -> Harness {
    harness_with(ReconcileCfg { symbols: vec![SYMBOL.into()], ..ReconcileCfg::default() })
}

pub fn harness_with(cfg: ReconcileCfg) -> Harness {
    let venue = FakeVenue::default();
    let api: Arc<dyn VenueApi> = Arc::new(venue.clone());
    let mut st = TradingState::new();
    st.set_instrument(instrument());
    let state = SharedState::new(st);
    let orders = OrderManager::new(OrderCfg::default(), api.clone(), state.clone());
    let (tx, escalations) = mpsc::channel(16);
    let reconciler = Reconciler::new(cfg, api, state.clone(), orders.clone(), None, tx);
    Harness { venue, state, orders, reconciler, escalations }
}

pub fn exec(id: &str, order_id: &str, link_id: &str, side: Side, qty: Decimal, price: Decimal, order_qty: Decimal, leaves: Decimal, ts: i64) -> Execution {
    Execution {
        exec_id: id.into(),
        order_id: order_id.into(),
        link_id: link_id.into(),
        symbol: SYMBOL.into(),
        side,
        price,
        qty,
        order_qty,
        leaves_qty: leaves,
        fee: Decimal::ZERO,
        exec_time_ms: ts,
    }
}

pub fn update(order_id: &str, link_id: &str, side: Side, status: OrderStatus, qty: Decimal, cum: Decimal, avg: Decimal, ts: i64) -> OrderUpdate {
    OrderUpdate {
        order_id: order_id.into(),
        link_id: link_id.into(),
        symbol: SYMBOL.into(),
        side,
        status,
        order_type: OrderType::Market,
        qty,
        price: None,
        cum_filled: cum,
        avg_price: avg,
        reduce_only: false,
        updated_ms: ts,
    }
}
