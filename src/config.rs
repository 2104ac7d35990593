// ===============================
// src/config.rs
// ===============================
//
// Flags with environment fallbacks (`.env` is loaded first). `Args` is built
// once in main and handed out as typed sub-configs; nothing reads the
// environment after startup.
//
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;

use crate::circuit_breaker::BreakerCfg;
use crate::orderbook::book_topic;
use crate::orders::OrderCfg;
use crate::rate_limiter::{RateLimitCfg, RateRule};
use crate::reconcile::{BreakevenOffset, ReconcileCfg};
use crate::signing::Credentials;
use crate::stream::StreamCfg;
use crate::transport::TransportCfg;

/// Which venue environment the default URLs point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum VenueMode {
    Mainnet,
    Testnet,
}

impl VenueMode {
    pub fn label(&self) -> &'static str {
        match self {
            VenueMode::Mainnet => "mainnet",
            VenueMode::Testnet => "testnet",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::Mainnet => "https://api.bybit.com",
            VenueMode::Testnet => "https://api-testnet.bybit.com",
        }
    }

    pub fn default_ws_public(&self, category: &str) -> String {
        match self {
            VenueMode::Mainnet => format!("wss://stream.bybit.com/v5/public/{category}"),
            VenueMode::Testnet => format!("wss://stream-testnet.bybit.com/v5/public/{category}"),
        }
    }

    pub fn default_ws_private(&self) -> &'static str {
        match self {
            VenueMode::Mainnet => "wss://stream.bybit.com/v5/private",
            VenueMode::Testnet => "wss://stream-testnet.bybit.com/v5/private",
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "perp_sync_rust", about = "Venue connectivity and position reconciliation engine")]
pub struct Args {
    #[arg(long, env = "VENUE_MODE", value_enum, default_value = "testnet")]
    pub venue_mode: VenueMode,

    #[arg(long, env = "BYBIT_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,
    #[arg(long, env = "BYBIT_API_SECRET", default_value = "", hide_env_values = true)]
    pub api_secret: String,

    #[arg(long, env = "REST_URL")]
    pub rest_url: Option<String>,
    #[arg(long, env = "WS_PUBLIC_URL")]
    pub ws_public_url: Option<String>,
    #[arg(long, env = "WS_PRIVATE_URL")]
    pub ws_private_url: Option<String>,

    /// SYMBOLS=BTCUSDT,ETHUSDT
    #[arg(long, env = "SYMBOLS", value_delimiter = ',', default_value = "BTCUSDT")]
    pub symbols: Vec<String>,
    #[arg(long, env = "CATEGORY", default_value = "linear")]
    pub category: String,

    // ---- transport ----
    #[arg(long, env = "RECV_WINDOW_MS", default_value_t = 5000)]
    pub recv_window_ms: u64,
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 10_000)]
    pub http_timeout_ms: u64,
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, env = "RETRY_BASE_MS", default_value_t = 200)]
    pub retry_base_ms: u64,
    #[arg(long, env = "RETRY_MAX_MS", default_value_t = 5_000)]
    pub retry_max_ms: u64,
    #[arg(long, env = "MAX_THROTTLE_WAITS", default_value_t = 5)]
    pub max_throttle_waits: u32,

    // ---- circuit breaker ----
    #[arg(long, env = "BREAKER_THRESHOLD", default_value_t = 5)]
    pub breaker_threshold: u32,
    #[arg(long, env = "BREAKER_BASE_SECS", default_value_t = 5)]
    pub breaker_base_secs: u64,
    #[arg(long, env = "BREAKER_MAX_SECS", default_value_t = 300)]
    pub breaker_max_secs: u64,

    // ---- rate limits (calls per second per endpoint prefix) ----
    #[arg(long, env = "RL_ORDER_PER_SEC", default_value_t = 10)]
    pub rl_order: u32,
    #[arg(long, env = "RL_POSITION_PER_SEC", default_value_t = 10)]
    pub rl_position: u32,
    #[arg(long, env = "RL_EXECUTION_PER_SEC", default_value_t = 10)]
    pub rl_execution: u32,
    #[arg(long, env = "RL_MARKET_PER_SEC", default_value_t = 50)]
    pub rl_market: u32,
    #[arg(long, env = "RL_ACCOUNT_PER_SEC", default_value_t = 5)]
    pub rl_account: u32,

    // ---- streams ----
    #[arg(long, env = "ORDERBOOK_DEPTH", default_value_t = 50)]
    pub orderbook_depth: u32,
    #[arg(long, env = "KLINE_INTERVAL", default_value = "1")]
    pub kline_interval: String,
    #[arg(long, env = "WS_PING_SECS", default_value_t = 20)]
    pub ws_ping_secs: u64,
    #[arg(long, env = "WS_LIVENESS_SECS", default_value_t = 60)]
    pub ws_liveness_secs: u64,
    /// Seed books from REST if no stream snapshot arrived by then.
    #[arg(long, env = "BOOK_SEED_SECS", default_value_t = 10)]
    pub book_seed_secs: u64,

    // ---- reconciliation ----
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 10)]
    pub heartbeat_secs: u64,
    #[arg(long, env = "EXEC_POLL_SECS", default_value_t = 5)]
    pub exec_poll_secs: u64,
    #[arg(long, env = "DIVERGENCE_TOLERANCE", default_value = "0")]
    pub divergence_tolerance: Decimal,
    #[arg(long, env = "ESCALATE_AFTER", default_value_t = 3)]
    pub escalate_after: u32,
    /// Breakeven offset in percent of entry (0.1 = 0.1%).
    #[arg(long, env = "BREAKEVEN_OFFSET_PCT", default_value = "0.1")]
    pub breakeven_offset_pct: Decimal,
    /// Absolute breakeven offset; overrides the percent form when set.
    #[arg(long, env = "BREAKEVEN_OFFSET_ABS")]
    pub breakeven_offset_abs: Option<Decimal>,
    #[arg(long, env = "LINK_PREFIX", default_value = "wgx")]
    pub link_prefix: String,
    #[arg(long, env = "FILTER_BY_LINK_PREFIX", default_value_t = true, action = clap::ArgAction::Set)]
    pub filter_by_link_prefix: bool,
    #[arg(long, env = "MAX_PYRAMID_ADDS", default_value_t = 3)]
    pub max_pyramid_adds: u32,
    #[arg(long, env = "DRY_RUN", default_value_t = false, action = clap::ArgAction::Set)]
    pub dry_run: bool,

    // ---- files / metrics ----
    #[arg(long, env = "STATE_FILE", default_value = "state/perp_sync.json")]
    pub state_file: PathBuf,
    #[arg(long, env = "STATE_SAVE_SECS", default_value_t = 15)]
    pub state_save_secs: u64,
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

pub fn load() -> Args {
    let _ = dotenv();
    let mut args = Args::parse();
    args.normalize();
    args
}

impl Args {
    fn normalize(&mut self) {
        self.symbols = self
            .symbols
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        self.symbols.dedup();
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.api_key, &self.api_secret)
    }

    pub fn rest_url(&self) -> String {
        self.rest_url.clone().unwrap_or_else(|| self.venue_mode.default_rest_url().to_string())
    }

    pub fn ws_public_url(&self) -> String {
        self.ws_public_url.clone().unwrap_or_else(|| self.venue_mode.default_ws_public(&self.category))
    }

    pub fn ws_private_url(&self) -> String {
        self.ws_private_url.clone().unwrap_or_else(|| self.venue_mode.default_ws_private().to_string())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn breaker_cfg(&self) -> BreakerCfg {
        BreakerCfg {
            failure_threshold: self.breaker_threshold,
            base_timeout: Duration::from_secs(self.breaker_base_secs),
            max_timeout: Duration::from_secs(self.breaker_max_secs),
            ..BreakerCfg::default()
        }
    }

    pub fn transport_cfg(&self) -> TransportCfg {
        TransportCfg {
            credentials: self.credentials(),
            recv_window_ms: self.recv_window_ms,
            max_attempts: self.max_retries.max(1),
            backoff_base: Duration::from_millis(self.retry_base_ms),
            backoff_max: Duration::from_millis(self.retry_max_ms),
            max_throttle_waits: self.max_throttle_waits,
            breaker: self.breaker_cfg(),
        }
    }

    pub fn rate_limit_cfg(&self) -> RateLimitCfg {
        let s = Duration::from_secs(1);
        RateLimitCfg {
            rules: vec![
                RateRule::new("/v5/order", self.rl_order, s),
                RateRule::new("/v5/position", self.rl_position, s),
                RateRule::new("/v5/execution", self.rl_execution, s),
                RateRule::new("/v5/account", self.rl_account, s),
                RateRule::new("/v5/market", self.rl_market, s),
                RateRule::new("/", 20, s),
            ],
            ..RateLimitCfg::default()
        }
    }

    /// Public topics: book, kline and ticker per symbol.
    pub fn public_topics(&self) -> Vec<String> {
        self.symbols
            .iter()
            .flat_map(|s| {
                [
                    book_topic(self.orderbook_depth, s),
                    format!("kline.{}.{}", self.kline_interval, s),
                    format!("tickers.{s}"),
                ]
            })
            .collect()
    }

    fn with_timers(&self, mut cfg: StreamCfg) -> StreamCfg {
        cfg.ping_interval = Duration::from_secs(self.ws_ping_secs);
        cfg.liveness_timeout = Duration::from_secs(self.ws_liveness_secs);
        cfg
    }

    pub fn public_stream_cfg(&self) -> StreamCfg {
        self.with_timers(StreamCfg::public(&self.ws_public_url(), self.public_topics()))
    }

    pub fn private_stream_cfg(&self) -> StreamCfg {
        self.with_timers(StreamCfg::private(&self.ws_private_url(), self.credentials()))
    }

    pub fn order_cfg(&self) -> OrderCfg {
        OrderCfg { link_prefix: self.link_prefix.clone(), max_pyramid_adds: self.max_pyramid_adds, dry_run: self.dry_run }
    }

    pub fn reconcile_cfg(&self) -> ReconcileCfg {
        ReconcileCfg {
            symbols: self.symbols.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            exec_poll_interval: Duration::from_secs(self.exec_poll_secs.max(1)),
            divergence_tolerance: self.divergence_tolerance,
            escalate_after: self.escalate_after.max(1),
            breakeven: match self.breakeven_offset_abs {
                Some(a) => BreakevenOffset::Absolute(a),
                None => BreakevenOffset::Percent(self.breakeven_offset_pct),
            },
            filter_by_prefix: self.filter_by_link_prefix,
            link_prefix: self.link_prefix.clone(),
            ..ReconcileCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["perp_sync_rust"];
        argv.extend_from_slice(extra);
        let mut a = Args::try_parse_from(argv).unwrap();
        a.normalize();
        a
    }

    #[test]
    fn symbols_are_split_and_uppercased() {
        let a = parse(&["--symbols", "btcusdt, ethusdt,,"]);
        assert_eq!(a.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        let topics = a.public_topics();
        assert!(topics.contains(&"orderbook.50.ETHUSDT".to_string()));
        assert!(topics.contains(&"tickers.BTCUSDT".to_string()));
    }

    #[test]
    fn urls_follow_mode_unless_overridden() {
        let a = parse(&["--venue-mode", "mainnet"]);
        assert_eq!(a.rest_url(), "https://api.bybit.com");
        assert_eq!(a.ws_public_url(), "wss://stream.bybit.com/v5/public/linear");
        let b = parse(&["--rest-url", "http://127.0.0.1:1"]);
        assert_eq!(b.rest_url(), "http://127.0.0.1:1");
    }

    #[test]
    fn absolute_breakeven_overrides_percent() {
        let a = parse(&["--breakeven-offset-abs", "2.5"]);
        assert_eq!(a.reconcile_cfg().breakeven, BreakevenOffset::Absolute(dec!(2.5)));
        let b = parse(&[]);
        assert_eq!(b.reconcile_cfg().breakeven, BreakevenOffset::Percent(dec!(0.1)));
    }
}
