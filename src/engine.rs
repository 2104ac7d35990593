// ===============================
// src/engine.rs
// ===============================
//
// Startup wiring and the collaborator surface.
//
//   public ws  --StreamEvent--> market fan-out --> BookWriter / caches
//   private ws --StreamEvent--> private fan-out --> Reconciler (+ wallet cache)
//   heartbeat / exec poll  --> Reconciler
//   OrderManager           --> SignedTransport (via VenueApi)
//
// Trading logic talks to `Engine` only; it never sees venue payloads.
//
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Args;
use crate::domain::{Event, Kline, MdTick, Order, Position, Side, TakeProfitTarget, WalletBalance};
use crate::error::{EngineError, StateError};
use crate::market::{self, MarketView};
use crate::orderbook::{BookDepth, BookWriter};
use crate::orders::OrderManager;
use crate::persist;
use crate::rate_limiter::RateLimiter;
use crate::reconcile::{Escalation, Reconciler};
use crate::rest::{BybitRest, VenueApi};
use crate::shutdown::{Shutdown, ShutdownTrigger};
use crate::state::{SharedState, TradingState};
use crate::stream::{ConnectionState, StreamManager};
use crate::transport::{ReqwestDispatch, SignedTransport};
use crate::wire::StreamEvent;

/// Handle given to trading logic. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    state: SharedState,
    market: MarketView,
    orders: OrderManager,
    md_tx: broadcast::Sender<MdTick>,
    public_state: watch::Receiver<ConnectionState>,
    private_state: Option<watch::Receiver<ConnectionState>>,
}

/// Everything main needs to supervise a running engine.
pub struct Running {
    pub engine: Engine,
    pub escalations: mpsc::Receiver<Escalation>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the REST stack from config and start.
    pub async fn start(args: &Args, trigger: &ShutdownTrigger, journal: Option<mpsc::Sender<Event>>) -> Result<Running, EngineError> {
        let limiter = Arc::new(RateLimiter::new(args.rate_limit_cfg()));
        let dispatch = ReqwestDispatch::new(&args.rest_url(), args.http_timeout())?;
        let transport = Arc::new(SignedTransport::new(args.transport_cfg(), dispatch, limiter, trigger.subscribe()));
        let api: Arc<dyn VenueApi> = Arc::new(BybitRest::new(transport, &args.category));
        Self::start_with(args, api, trigger, journal).await
    }

    /// Start against any venue implementation. Persisted state and
    /// instrument filters are loaded before a single task is spawned.
    pub async fn start_with(
        args: &Args,
        api: Arc<dyn VenueApi>,
        trigger: &ShutdownTrigger,
        journal: Option<mpsc::Sender<Event>>,
    ) -> Result<Running, EngineError> {
        if args.symbols.is_empty() {
            return Err(EngineError::Config("no symbols configured".into()));
        }
        let private = args.has_credentials();
        let mut order_cfg = args.order_cfg();
        if !private && !order_cfg.dry_run {
            warn!("no API credentials: market data only, order placement disabled");
            order_cfg.dry_run = true;
        }

        // ---- state: restore, then instrument filters ----
        let state = SharedState::new(TradingState::new());
        persist::restore_into(&args.state_file, &state).await?;
        for s in &args.symbols {
            let ins = api.instrument(s).await?;
            info!(symbol = %s, tick = %ins.tick_size, step = %ins.qty_step, min = %ins.min_qty, "instrument loaded");
            state.write().set_instrument(ins);
        }

        // ---- market view, seeded from REST ----
        let market = MarketView::new(&args.symbols, true);
        for s in &args.symbols {
            match api.klines(s, &args.kline_interval, 1).await {
                Ok(k) => {
                    if let Some(last) = k.into_iter().last() {
                        market.on_kline(last);
                    }
                }
                Err(e) => warn!(symbol = %s, err = %e, "kline seed failed"),
            }
            match api.ticker(s).await {
                Ok(t) => market.on_ticker(t),
                Err(e) => warn!(symbol = %s, err = %e, "ticker seed failed"),
            }
        }
        if private {
            match api.wallet_balance().await {
                Ok(w) => market.on_wallet(w),
                Err(e) => warn!(err = %e, "wallet seed failed"),
            }
        }

        let mut orders = OrderManager::new(order_cfg, api.clone(), state.clone());
        if let Some(tx) = &journal {
            orders = orders.with_journal(tx.clone());
        }

        let mut tasks = Vec::new();
        let (md_tx, _) = broadcast::channel::<MdTick>(4096);

        // ---- public stream + book writer ----
        let (pub_tx, pub_rx) = mpsc::channel::<StreamEvent>(8192);
        let (public_mgr, public_handle) = StreamManager::new(args.public_stream_cfg(), pub_tx, trigger.subscribe());
        tasks.push(tokio::spawn(public_mgr.run()));
        let writer = BookWriter::new(market.books(), args.orderbook_depth, md_tx.clone(), public_handle.commands.clone());
        tasks.push(tokio::spawn(market::run_public(
            market.clone(),
            writer,
            api.clone(),
            args.orderbook_depth,
            Duration::from_secs(args.book_seed_secs),
            pub_rx,
            trigger.subscribe(),
        )));

        // ---- private stream + reconciliation ----
        let (esc_tx, esc_rx) = mpsc::channel::<Escalation>(64);
        let mut private_state = None;
        if private {
            let reconciler =
                Arc::new(Reconciler::new(args.reconcile_cfg(), api.clone(), state.clone(), orders.clone(), journal.clone(), esc_tx));
            let (priv_tx, priv_rx) = mpsc::channel::<StreamEvent>(4096);
            let (private_mgr, private_handle) = StreamManager::new(args.private_stream_cfg(), priv_tx, trigger.subscribe());
            private_state = Some(private_handle.state.clone());
            tasks.push(tokio::spawn(private_mgr.run()));
            tasks.push(tokio::spawn(run_private(reconciler.clone(), market.clone(), priv_rx, trigger.subscribe())));
            tasks.push(tokio::spawn(reconciler.clone().run_heartbeat(trigger.subscribe())));
            tasks.push(tokio::spawn(reconciler.run_exec_poll(trigger.subscribe())));
        }

        // ---- persistence ----
        tasks.push(tokio::spawn(persist::run(
            state.clone(),
            args.state_file.clone(),
            Duration::from_secs(args.state_save_secs.max(1)),
            trigger.subscribe(),
        )));

        info!(symbols = ?args.symbols, private, dry_run = orders.cfg().dry_run, "engine started");
        let engine = Engine { state, market, orders, md_tx, public_state: public_handle.state, private_state };
        Ok(Running { engine, escalations: esc_rx, tasks })
    }

    // ---- collaborator surface ----

    pub fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.market.current_price(symbol)
    }

    pub fn book_depth(&self, symbol: &str, n: usize) -> Option<BookDepth> {
        self.market.book_depth(symbol, n)
    }

    pub fn latest_kline(&self, symbol: &str) -> Option<Kline> {
        self.market.latest_kline(symbol)
    }

    pub fn wallet(&self) -> Vec<WalletBalance> {
        self.market.wallet()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.state.read().positions()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state.read().open_orders()
    }

    /// Top-of-book after every applied book frame.
    pub fn market_data(&self) -> broadcast::Receiver<MdTick> {
        self.md_tx.subscribe()
    }

    pub fn stream_states(&self) -> (ConnectionState, Option<ConnectionState>) {
        (self.public_state.borrow().clone(), self.private_state.as_ref().map(|s| s.borrow().clone()))
    }

    /// Market entry; `qty_hint` is rounded down to the venue step.
    pub async fn submit_entry(
        &self,
        symbol: &str,
        side: Side,
        qty_hint: Decimal,
        stop: Option<Decimal>,
        targets: Vec<TakeProfitTarget>,
    ) -> Result<Order, StateError> {
        self.orders.open(symbol, side, qty_hint, stop, targets).await
    }

    pub async fn submit_exit(&self, symbol: &str) -> Result<Order, StateError> {
        self.orders.close(symbol).await
    }

    pub async fn pyramid_add(&self, symbol: &str, qty: Decimal) -> Result<Order, StateError> {
        self.orders.pyramid_add(symbol, qty).await
    }

    pub async fn trail_stop(&self, symbol: &str, new_stop: Decimal) -> Result<Decimal, StateError> {
        self.orders.trail_stop(symbol, new_stop).await
    }
}

/// Private stream consumer: wallet into the cache, the rest to the
/// reconciler, in arrival order.
async fn run_private(reconciler: Arc<Reconciler>, market: MarketView, mut rx: mpsc::Receiver<StreamEvent>, mut shutdown: Shutdown) {
    info!("private fan-out started");
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            ev = rx.recv() => match ev {
                Some(StreamEvent::Wallet(w)) => market.on_wallet(w),
                Some(ev) => reconciler.on_event(ev).await,
                None => break,
            },
        }
    }
    info!("private fan-out stopped");
}
