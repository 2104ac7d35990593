// ===============================
// src/main.rs
// ===============================
/*
 # metrics
 curl -s localhost:9898/metrics | egrep '^(ws_state|circuit_state|position_qty_micro)'

 # dry run against testnet, two symbols
 DRY_RUN=true SYMBOLS=BTCUSDT,ETHUSDT cargo run --release
*/
use tokio::{
    select,
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_sync::domain::Event;
use perp_sync::{config, engine::Engine, metrics, recorder, shutdown};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = config::load();
    info!(
        venue_mode = args.venue_mode.label(),
        symbols = ?args.symbols,
        category = %args.category,
        rest = %args.rest_url(),
        ws_public = %args.ws_public_url(),
        ws_private = %args.ws_private_url(),
        dry_run = args.dry_run,
        "startup config"
    );

    let (trigger, sd) = shutdown::channel();

    // ---- Metrics ----
    let refused = metrics::init();
    if refused > 0 {
        warn!(refused, "some metrics failed to register and will not be exported");
    }
    let metrics_task = tokio::spawn(metrics::serve_metrics(args.metrics_port, sd.clone()));

    // ---- Journal (optional) ----
    let (journal, journal_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path, sd.clone()))))
        }
        None => (None, None),
    };

    // ---- Engine ----
    let running = match Engine::start(&args, &trigger, journal).await {
        Ok(r) => r,
        Err(e) => {
            error!(err = %e, "startup failed");
            trigger.trigger();
            let _ = metrics_task.await;
            std::process::exit(1);
        }
    };
    let engine = running.engine;
    let mut escalations = running.escalations;
    let mut escalations_open = true;

    // ---- Status loop until ctrl-c or escalation ----
    let mut status = interval(Duration::from_secs(30));
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exit_code = 0;
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
            esc = escalations.recv(), if escalations_open => match esc {
                Some(e) => {
                    error!(?e, "unrecoverable condition, shutting down");
                    exit_code = 2;
                    break;
                }
                None => escalations_open = false,
            },
            _ = status.tick() => {
                let (public, private) = engine.stream_states();
                let positions = engine.open_positions();
                for p in &positions {
                    let px = engine.current_price(&p.symbol);
                    info!(symbol = %p.symbol, side = ?p.side, qty = %p.qty, entry = %p.avg_entry_price, price = ?px, stop = ?p.stop_loss, "position");
                }
                info!(?public, ?private, positions = positions.len(), orders = engine.open_orders().len(), "status");
            }
        }
    }

    // ---- Shutdown: every task observes the signal; persist writes last ----
    trigger.trigger();
    for t in running.tasks {
        if let Err(e) = t.await {
            warn!(err = %e, "task ended abnormally");
        }
    }
    drop(engine);
    if let Some(t) = journal_task {
        let _ = t.await;
    }
    let _ = metrics_task.await;
    info!("stopped");
    std::process::exit(exit_code);
}
