// ===============================
// src/transport.rs
// ===============================
//
// Signed REST transport.
//
// call() = breaker admission -> rate-limit admission -> sign -> dispatch ->
// classify. Transport failures (timeout, connection, 5xx) are retried with
// exponential backoff up to `max_attempts`; throttling is absorbed by waiting;
// venue business errors are returned as-is and never retried.
//
// The HTTP hop sits behind `Dispatch` so everything above it can be driven by
// a scripted fake in tests.
//
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::circuit_breaker::{BreakerCfg, CircuitBreaker};
use crate::error::TransportError;
use crate::metrics::{REST_CALLS, REST_RETRIES};
use crate::rate_limiter::RateLimiter;
use crate::shutdown::Shutdown;
use crate::signing::{encode_query, rest_payload, sign, timestamp_ms, Credentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Request parameters: query pairs for GET, compact JSON body for POST.
#[derive(Debug, Clone)]
pub enum Params {
    Query(Vec<(String, String)>),
    Body(Value),
}

/// A fully signed request ready for the wire.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub endpoint: String,
    pub query: String,
    pub body: String,
    pub headers: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, req: &SignedRequest) -> Result<HttpReply, TransportError>;
}

/// reqwest-backed dispatcher.
pub struct ReqwestDispatch {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestDispatch {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl Dispatch for ReqwestDispatch {
    async fn dispatch(&self, req: &SignedRequest) -> Result<HttpReply, TransportError> {
        let url = if req.query.is_empty() {
            format!("{}{}", self.base_url, req.endpoint)
        } else {
            format!("{}{}?{}", self.base_url, req.endpoint, req.query)
        };
        let mut builder = match req.method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url).header("Content-Type", "application/json").body(req.body.clone()),
        };
        for (k, v) in &req.headers {
            builder = builder.header(*k, v);
        }
        let rsp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;
        let status = rsp.status().as_u16();
        let body = rsp.text().await.map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct TransportCfg {
    pub credentials: Credentials,
    pub recv_window_ms: u64,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Throttle responses absorbed per call before giving up.
    pub max_throttle_waits: u32,
    pub breaker: BreakerCfg,
}

/// Venue response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Value,
    #[serde(rename = "retExtInfo", default)]
    pub ret_ext_info: Value,
}

const RET_RATE_LIMITED: i64 = 10006;
const RET_INVALID_PARAM: i64 = 10001;
const RET_AUTH: [i64; 5] = [10003, 10004, 10005, 10007, 33004];

/// Map an HTTP reply onto the taxonomy.
pub fn classify(endpoint: &str, reply: &HttpReply) -> Result<Envelope, TransportError> {
    match reply.status {
        401 | 403 => return Err(TransportError::Auth(format!("http {} on {}", reply.status, endpoint))),
        429 => return Err(TransportError::RateLimited(endpoint.to_string())),
        s if s >= 500 => return Err(TransportError::Http { status: s }),
        _ => {}
    }
    let env: Envelope = serde_json::from_str(&reply.body).map_err(|e| {
        if reply.status >= 400 {
            TransportError::Http { status: reply.status }
        } else {
            TransportError::Decode(e.to_string())
        }
    })?;
    match env.ret_code {
        0 => Ok(env),
        RET_RATE_LIMITED => Err(TransportError::RateLimited(endpoint.to_string())),
        RET_INVALID_PARAM => Err(TransportError::InvalidParameter(env.ret_msg)),
        c if RET_AUTH.contains(&c) => Err(TransportError::Auth(env.ret_msg)),
        code => Err(TransportError::Venue { code, msg: env.ret_msg }),
    }
}

pub struct SignedTransport<D: Dispatch = ReqwestDispatch> {
    cfg: TransportCfg,
    dispatch: D,
    limiter: Arc<RateLimiter>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    shutdown: Shutdown,
}

impl<D: Dispatch> SignedTransport<D> {
    pub fn new(cfg: TransportCfg, dispatch: D, limiter: Arc<RateLimiter>, shutdown: Shutdown) -> Self {
        Self { cfg, dispatch, limiter, breakers: Mutex::new(HashMap::new()), shutdown }
    }

    pub fn api_key(&self) -> &str {
        &self.cfg.credentials.api_key
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> &D {
        &self.dispatch
    }

    /// Breaker guarding `endpoint`; one per endpoint path.
    pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.cfg.breaker.clone())))
            .clone()
    }

    fn sign_request(&self, method: Method, endpoint: &str, params: &Params) -> Result<SignedRequest, TransportError> {
        let ts = timestamp_ms();
        let (query, body) = match (method, params) {
            (Method::Get, Params::Query(q)) => (encode_query(q), String::new()),
            (Method::Post, Params::Body(b)) => {
                (String::new(), serde_json::to_string(b).map_err(|e| TransportError::InvalidParameter(e.to_string()))?)
            }
            (Method::Get, Params::Body(_)) | (Method::Post, Params::Query(_)) => {
                return Err(TransportError::InvalidParameter(format!("params do not fit {method:?} {endpoint}")))
            }
        };
        let creds = &self.cfg.credentials;
        let signed = if method == Method::Get { &query } else { &body };
        let payload = rest_payload(ts, &creds.api_key, self.cfg.recv_window_ms, signed);
        let signature = sign(&creds.api_secret, &payload);
        Ok(SignedRequest {
            method,
            endpoint: endpoint.to_string(),
            query,
            body,
            headers: vec![
                ("X-BAPI-API-KEY", creds.api_key.clone()),
                ("X-BAPI-TIMESTAMP", ts.to_string()),
                ("X-BAPI-RECV-WINDOW", self.cfg.recv_window_ms.to_string()),
                ("X-BAPI-SIGN", signature),
            ],
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.cfg.backoff_base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=50));
        exp.min(self.cfg.backoff_max) + jitter
    }

    /// Signed call returning the envelope's `result`.
    pub async fn call(&self, method: Method, endpoint: &str, params: Params) -> Result<Envelope, TransportError> {
        let breaker = self.breaker(endpoint);
        let mut attempt: u32 = 0;
        let mut throttled: u32 = 0;
        loop {
            if self.shutdown.is_triggered() {
                return Err(TransportError::Cancelled);
            }
            breaker.try_acquire().inspect_err(|_| {
                REST_CALLS.with_label_values(&[endpoint, "circuit_open"]).inc();
            })?;
            self.limiter.acquire(endpoint).await;
            attempt += 1;

            let req = self.sign_request(method, endpoint, &params)?;
            let outcome = match self.dispatch.dispatch(&req).await {
                Ok(reply) => classify(endpoint, &reply),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(env) => {
                    breaker.record_success();
                    self.limiter.record_success(endpoint).await;
                    REST_CALLS.with_label_values(&[endpoint, "ok"]).inc();
                    return Ok(env);
                }
                Err(TransportError::RateLimited(_)) => {
                    breaker.release_probe();
                    self.limiter.record_throttled(endpoint).await;
                    REST_CALLS.with_label_values(&[endpoint, "throttled"]).inc();
                    throttled += 1;
                    attempt -= 1;
                    if throttled > self.cfg.max_throttle_waits {
                        error!(endpoint, throttled, "throttled beyond wait budget");
                        return Err(TransportError::RateLimited(endpoint.to_string()));
                    }
                    debug!(endpoint, throttled, "throttled by venue, waiting");
                    if !self.shutdown.sleep(self.backoff(throttled)).await {
                        return Err(TransportError::Cancelled);
                    }
                }
                Err(e) if e.is_transient() => {
                    breaker.record_failure();
                    self.limiter.record_failure(endpoint).await;
                    REST_CALLS.with_label_values(&[endpoint, "transient"]).inc();
                    if attempt >= self.cfg.max_attempts {
                        error!(endpoint, attempt, err = %e, "transport retries exhausted");
                        return Err(e);
                    }
                    REST_RETRIES.with_label_values(&[endpoint]).inc();
                    let wait = self.backoff(attempt);
                    warn!(endpoint, attempt, err = %e, wait_ms = wait.as_millis() as u64, "transient failure, retrying");
                    if !self.shutdown.sleep(wait).await {
                        return Err(TransportError::Cancelled);
                    }
                }
                Err(e) => {
                    // the venue answered, so the path is healthy
                    breaker.record_success();
                    self.limiter.record_success(endpoint).await;
                    let label = if matches!(e, TransportError::Auth(_)) { "auth" } else { "rejected" };
                    REST_CALLS.with_label_values(&[endpoint, label]).inc();
                    if label == "auth" {
                        error!(endpoint, err = %e, "authentication rejected");
                    } else {
                        warn!(endpoint, err = %e, "venue rejected request");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `call` + typed decode of `result`.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: Params,
    ) -> Result<T, TransportError> {
        let env = self.call(method, endpoint, params).await?;
        serde_json::from_value(env.result).map_err(|e| TransportError::Decode(format!("{endpoint}: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rate_limiter::RateLimitCfg;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted replies; repeats the last one when the script runs out.
    pub(crate) struct Scripted {
        pub replies: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
        pub last: Result<HttpReply, TransportError>,
        pub calls: AtomicU32,
        pub seen: Mutex<Vec<SignedRequest>>,
    }

    impl Scripted {
        pub(crate) fn new(script: Vec<Result<HttpReply, TransportError>>, last: Result<HttpReply, TransportError>) -> Self {
            Self { replies: Mutex::new(script.into()), last, calls: AtomicU32::new(0), seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Dispatch for Scripted {
        async fn dispatch(&self, req: &SignedRequest) -> Result<HttpReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(req.clone());
            self.replies.lock().unwrap().pop_front().unwrap_or_else(|| self.last.clone())
        }
    }

    pub(crate) fn ok(body: &str) -> Result<HttpReply, TransportError> {
        Ok(HttpReply { status: 200, body: body.to_string() })
    }

    pub(crate) fn cfg(max_attempts: u32) -> TransportCfg {
        TransportCfg {
            credentials: Credentials { api_key: "key".into(), api_secret: "secret".into() },
            recv_window_ms: 5000,
            max_attempts,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            max_throttle_waits: 3,
            breaker: BreakerCfg::default(),
        }
    }

    fn transport(d: Scripted, max_attempts: u32) -> SignedTransport<Scripted> {
        let limiter = Arc::new(RateLimiter::new(RateLimitCfg::default()));
        SignedTransport::new(cfg(max_attempts), d, limiter, Shutdown::never())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let d = Scripted::new(
            vec![Err(TransportError::Timeout), Ok(HttpReply { status: 502, body: String::new() })],
            ok(r#"{"retCode":0,"retMsg":"OK","result":{"x":1}}"#),
        );
        let t = transport(d, 3);
        let env = t.call(Method::Get, "/v5/position/list", Params::Query(vec![])).await.unwrap();
        assert_eq!(env.result["x"], 1);
        assert_eq!(t.dispatch.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn venue_error_is_not_retried() {
        let d = Scripted::new(vec![], ok(r#"{"retCode":110007,"retMsg":"insufficient balance","result":{}}"#));
        let t = transport(d, 5);
        let err = t.call(Method::Post, "/v5/order/create", Params::Body(serde_json::json!({}))).await.unwrap_err();
        assert_eq!(err, TransportError::Venue { code: 110007, msg: "insufficient balance".into() });
        assert_eq!(t.dispatch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_error_surfaces_immediately() {
        let d = Scripted::new(vec![], ok(r#"{"retCode":10003,"retMsg":"API key is invalid.","result":{}}"#));
        let t = transport(d, 5);
        let err = t.call(Method::Get, "/v5/account/wallet-balance", Params::Query(vec![])).await.unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
        assert_eq!(t.dispatch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_is_absorbed() {
        let d = Scripted::new(
            vec![ok(r#"{"retCode":10006,"retMsg":"Too many visits!","result":{}}"#)],
            ok(r#"{"retCode":0,"retMsg":"OK","result":{}}"#),
        );
        let t = transport(d, 1);
        assert!(t.call(Method::Get, "/v5/order/realtime", Params::Query(vec![])).await.is_ok());
        assert!(t.limiter.factor("/v5/order/realtime").await.unwrap() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_open_the_circuit_without_network() {
        let d = Scripted::new(vec![], Err(TransportError::Connection("refused".into())));
        let t = transport(d, 1);
        for _ in 0..5 {
            let err = t.call(Method::Post, "/v5/order/create", Params::Body(serde_json::json!({}))).await.unwrap_err();
            assert!(matches!(err, TransportError::Connection(_)));
        }
        let err = t.call(Method::Post, "/v5/order/create", Params::Body(serde_json::json!({}))).await.unwrap_err();
        match err {
            TransportError::CircuitOpen { remaining, .. } => assert!(remaining > Duration::ZERO),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(t.dispatch.calls.load(Ordering::SeqCst), 5);
        // other endpoints have their own breaker
        let _ = t.call(Method::Get, "/v5/position/list", Params::Query(vec![])).await;
        assert_eq!(t.dispatch.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn get_signs_query_and_post_signs_body() {
        let d = Scripted::new(vec![], ok(r#"{"retCode":0,"retMsg":"OK","result":{}}"#));
        let t = transport(d, 1);
        let q = vec![("category".to_string(), "linear".to_string()), ("symbol".to_string(), "BTCUSDT".to_string())];
        t.call(Method::Get, "/v5/position/list", Params::Query(q)).await.unwrap();
        let body = serde_json::json!({"category":"linear","symbol":"BTCUSDT"});
        t.call(Method::Post, "/v5/order/cancel", Params::Body(body)).await.unwrap();

        let seen = t.dispatch.seen.lock().unwrap().clone();
        let header = |r: &SignedRequest, k: &str| r.headers.iter().find(|(h, _)| *h == k).map(|(_, v)| v.clone()).unwrap();
        let get = &seen[0];
        assert_eq!(get.query, "category=linear&symbol=BTCUSDT");
        let ts: i64 = header(get, "X-BAPI-TIMESTAMP").parse().unwrap();
        let expect = sign("secret", &rest_payload(ts, "key", 5000, &get.query));
        assert_eq!(header(get, "X-BAPI-SIGN"), expect);

        let post = &seen[1];
        assert_eq!(post.body, r#"{"category":"linear","symbol":"BTCUSDT"}"#);
        let ts: i64 = header(post, "X-BAPI-TIMESTAMP").parse().unwrap();
        let expect = sign("secret", &rest_payload(ts, "key", 5000, &post.body));
        assert_eq!(header(post, "X-BAPI-SIGN"), expect);
    }
}
