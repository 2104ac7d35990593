// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{core::Collector, Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::shutdown::Shutdown;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- REST transport --------
pub static REST_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rest_calls_total", "signed REST calls (labels: endpoint, outcome)"),
        &["endpoint", "outcome"],
    )
    .unwrap()
});

pub static REST_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rest_retries_total", "REST retries after transient failures"), &["endpoint"]).unwrap()
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rate_limit_waits_total", "calls held back by the limiter"), &["prefix"]).unwrap()
});

// 0 closed, 1 half-open, 2 open
pub static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("circuit_state", "breaker state per endpoint"), &["endpoint"]).unwrap()
});

// -------- Streams --------
// 0 disconnected, 1 connecting, 2 connected, 3 authenticated, -1 error
pub static WS_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("ws_state", "stream connection state"), &["stream"]).unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_reconnects_total", "stream reconnect attempts"), &["stream"]).unwrap()
});

pub static WS_LAST_FRAME_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("ws_last_frame_ts", "unix seconds of the last inbound frame"), &["stream"]).unwrap()
});

pub static FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_frames_total", "decoded stream frames by kind"), &["kind"]).unwrap()
});

pub static DECODE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_decode_errors_total", "frames that failed to decode"), &["stream"]).unwrap()
});

// -------- Book / state --------
pub static BOOK_RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("book_resyncs_total", "sequence gaps that forced a resnapshot"), &["symbol"]).unwrap()
});

pub static FILLS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_applied_total", "fills applied to local state by path"), &["symbol", "path"])
        .unwrap()
});

pub static DIVERGENCES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("divergences_total", "reconciliation disagreements"), &["symbol", "kind"]).unwrap()
});

// position size in qty steps would need per-symbol scaling; micro-units are enough for dashboards
pub static POSITION_QTY_MICRO: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("position_qty_micro", "signed local position size x1e6"), &["symbol"]).unwrap()
});

pub static OPEN_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_orders", "locally tracked non-terminal orders").unwrap());

/// Register one collector. A repeat registration of the same collector is
/// fine (init can run more than once in tests); any other refusal is logged
/// and reported.
fn register(reg: &Registry, c: Box<dyn Collector>) -> bool {
    match reg.register(c) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => true,
        Err(e) => {
            error!(error = %e, "metric registration failed");
            false
        }
    }
}

/// Register all metrics to the custom registry. Returns how many were
/// refused.
pub fn init() -> usize {
    let all: Vec<Box<dyn Collector>> = vec![
        Box::new(REST_CALLS.clone()),
        Box::new(REST_RETRIES.clone()),
        Box::new(RATE_LIMIT_WAITS.clone()),
        Box::new(CIRCUIT_STATE.clone()),
        Box::new(WS_STATE.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(WS_LAST_FRAME_TS.clone()),
        Box::new(FRAMES.clone()),
        Box::new(DECODE_ERRORS.clone()),
        Box::new(BOOK_RESYNCS.clone()),
        Box::new(FILLS_APPLIED.clone()),
        Box::new(DIVERGENCES.clone()),
        Box::new(POSITION_QTY_MICRO.clone()),
        Box::new(OPEN_ORDERS.clone()),
    ];
    all.into_iter().map(|c| register(&REGISTRY, c)).filter(|ok| !ok).count()
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until shutdown. Bind failures are logged, not fatal.
pub async fn serve_metrics(port: u16, mut shutdown: Shutdown) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(%addr, error = %e, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/metrics");
    if let Err(e) = server.with_graceful_shutdown(async move { shutdown.wait().await }).await {
        error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        assert_eq!(init(), 0, "repeat init is not a failure");
        REST_CALLS.with_label_values(&["/v5/order/create", "ok"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("rest_calls_total"));
    }

    #[test]
    fn conflicting_registration_is_reported() {
        let reg = Registry::new();
        let c = IntGauge::new("dup_metric", "first").unwrap();
        assert!(register(&reg, Box::new(c.clone())));
        assert!(register(&reg, Box::new(c)));
        let other = IntGauge::new("dup_metric", "second").unwrap();
        assert!(!register(&reg, Box::new(other)));
    }
}
