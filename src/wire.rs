// ===============================
// src/wire.rs
// ===============================
//
// Stream frame decoding.
//
// Every inbound text frame is decoded once into a typed `Inbound`. Topic
// frames are routed through a table keyed by the topic head (the part before
// the first '.'), so supporting a new topic means adding one table entry.
//
// Example payloads:
//   {"topic":"orderbook.50.BTCUSDT","type":"delta","ts":1,"data":{"s":"BTCUSDT","b":[["100.0","0"]],"a":[],"u":11,"seq":7}}
//   {"topic":"order","data":[{"orderId":"..","orderLinkId":"..","orderStatus":"Filled",...}]}
//   {"op":"auth","success":true,"ret_msg":""}
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    BookFrame, Execution, Kline, OrderStatus, OrderType, OrderUpdate, Side, Ticker, VenuePosition, WalletBalance,
};

/// Typed events published by the stream manager.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Kline(Kline),
    BookSnapshot(BookFrame),
    BookDelta(BookFrame),
    Ticker(Ticker),
    Order(Vec<OrderUpdate>),
    Position(Vec<VenuePosition>),
    Execution(Vec<Execution>),
    Wallet(Vec<WalletBalance>),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Kline(_) => "kline",
            StreamEvent::BookSnapshot(_) => "orderbook_snapshot",
            StreamEvent::BookDelta(_) => "orderbook_delta",
            StreamEvent::Ticker(_) => "ticker",
            StreamEvent::Order(_) => "order",
            StreamEvent::Position(_) => "position",
            StreamEvent::Execution(_) => "execution",
            StreamEvent::Wallet(_) => "wallet",
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(
            self,
            StreamEvent::Order(_) | StreamEvent::Position(_) | StreamEvent::Execution(_) | StreamEvent::Wallet(_)
        )
    }
}

/// Command acknowledgements (auth, subscribe, pong).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub op: String,
    pub success: bool,
    pub ret_msg: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(Control),
    Events(Vec<StreamEvent>),
    Ignored,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unroutable topic {0}")]
    UnknownTopic(String),
    #[error("malformed {topic}: {why}")]
    Malformed { topic: String, why: String },
}

/// Raw topic frame envelope.
#[derive(Debug, Deserialize)]
pub struct Frame {
    pub topic: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default, rename = "creationTime")]
    pub creation_time: Option<i64>,
    pub data: Value,
}

impl Frame {
    fn timestamp(&self) -> i64 {
        self.ts.or(self.creation_time).unwrap_or_else(crate::domain::now_ms)
    }

    fn symbol_from_topic(&self) -> String {
        self.topic.rsplit('.').next().unwrap_or_default().to_string()
    }

    fn malformed(&self, why: impl ToString) -> WireError {
        WireError::Malformed { topic: self.topic.clone(), why: why.to_string() }
    }
}

type Decoder = fn(&Frame) -> Result<Vec<StreamEvent>, WireError>;

/// topic head -> decoder
pub struct TopicRouter {
    routes: HashMap<&'static str, Decoder>,
}

impl TopicRouter {
    pub fn new() -> Self {
        let table: [(&'static str, Decoder); 7] = [
            ("orderbook", decode_orderbook),
            ("kline", decode_kline),
            ("tickers", decode_ticker),
            ("order", decode_orders),
            ("position", decode_positions),
            ("execution", decode_executions),
            ("wallet", decode_wallet),
        ];
        Self { routes: table.into_iter().collect() }
    }

    pub fn route(&self, text: &str) -> Result<Inbound, WireError> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("topic").is_some() {
            let frame: Frame = serde_json::from_value(value)?;
            let head = frame.topic.split('.').next().unwrap_or_default();
            let decoder = self.routes.get(head).ok_or_else(|| WireError::UnknownTopic(frame.topic.clone()))?;
            return decoder(&frame).map(Inbound::Events);
        }
        if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
            let ret_msg = value.get("ret_msg").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
            return Ok(Inbound::Control(Control { op: op.to_string(), success, ret_msg }));
        }
        // public pong arrives as {"success":true,"ret_msg":"pong",...} without op on some channels
        if value.get("ret_msg").and_then(|v| v.as_str()) == Some("pong") {
            return Ok(Inbound::Control(Control { op: "pong".into(), success: true, ret_msg: "pong".into() }));
        }
        Ok(Inbound::Ignored)
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---- lenient number parsing ----

/// Venue numbers arrive as strings, sometimes empty.
pub(crate) mod num {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer};
    use std::str::FromStr;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    fn parse(raw: Option<Raw>) -> Option<Decimal> {
        match raw? {
            Raw::Str(s) if s.trim().is_empty() => None,
            Raw::Str(s) => Decimal::from_str(s.trim()).ok().or_else(|| Decimal::from_scientific(s.trim()).ok()),
            Raw::Num(n) => Decimal::from_str(&n.to_string()).ok(),
        }
    }

    pub fn dec<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        Ok(parse(Option::<Raw>::deserialize(d)?).unwrap_or(Decimal::ZERO))
    }

    pub fn opt_dec<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
        Ok(parse(Option::<Raw>::deserialize(d)?).filter(|v| !v.is_zero()))
    }

    pub fn ms<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            Some(Raw::Str(s)) => Ok(s.parse().unwrap_or(0)),
            Some(Raw::Num(n)) => Ok(n.as_i64().unwrap_or(0)),
            None => Ok(0),
        }
    }
}

// ---- wire models shared by stream and REST ----

#[derive(Debug, Deserialize)]
pub struct WireBook {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", default)]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    pub asks: Vec<[String; 2]>,
    #[serde(rename = "u", default)]
    pub update_id: u64,
    #[serde(default)]
    pub ts: Option<i64>,
}

impl WireBook {
    fn levels(raw: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>, String> {
        raw.iter()
            .map(|[p, q]| Ok((p.parse::<Decimal>().map_err(|e| e.to_string())?, q.parse::<Decimal>().map_err(|e| e.to_string())?)))
            .collect()
    }

    pub fn into_frame(self, ts_ms: i64) -> Result<BookFrame, String> {
        Ok(BookFrame {
            bids: Self::levels(&self.bids)?,
            asks: Self::levels(&self.asks)?,
            symbol: self.symbol,
            sequence: self.update_id,
            ts_ms: self.ts.unwrap_or(ts_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    pub order_status: String,
    #[serde(deserialize_with = "num::dec", default)]
    pub qty: Decimal,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub price: Option<Decimal>,
    #[serde(deserialize_with = "num::dec", default)]
    pub cum_exec_qty: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(deserialize_with = "num::ms", default)]
    pub updated_time: i64,
}

impl WireOrder {
    pub fn into_update(self) -> Option<OrderUpdate> {
        Some(OrderUpdate {
            side: Side::from_venue(&self.side)?,
            status: OrderStatus::from_venue(&self.order_status)?,
            order_type: if self.order_type == "Market" { OrderType::Market } else { OrderType::Limit },
            order_id: self.order_id,
            link_id: self.order_link_id,
            symbol: self.symbol,
            qty: self.qty,
            price: self.price,
            cum_filled: self.cum_exec_qty,
            avg_price: self.avg_price,
            reduce_only: self.reduce_only,
            updated_ms: self.updated_time,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(deserialize_with = "num::dec", default)]
    pub size: Decimal,
    #[serde(deserialize_with = "num::dec", default, alias = "avgPrice")]
    pub entry_price: Decimal,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub stop_loss: Option<Decimal>,
    #[serde(deserialize_with = "num::dec", default)]
    pub unrealised_pnl: Decimal,
    #[serde(deserialize_with = "num::ms", default)]
    pub updated_time: i64,
}

impl WirePosition {
    pub fn into_position(self) -> VenuePosition {
        VenuePosition {
            side: Side::from_venue(&self.side).filter(|_| self.size > Decimal::ZERO),
            symbol: self.symbol,
            size: self.size,
            avg_price: self.entry_price,
            stop_loss: self.stop_loss,
            unrealized_pnl: self.unrealised_pnl,
            updated_ms: self.updated_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireExecution {
    pub exec_id: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(deserialize_with = "num::dec", default)]
    pub exec_price: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    pub exec_qty: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    pub order_qty: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    pub leaves_qty: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    pub exec_fee: Decimal,
    #[serde(deserialize_with = "num::ms", default)]
    pub exec_time: i64,
    #[serde(default)]
    pub exec_type: Option<String>,
}

impl WireExecution {
    /// Funding and settlement rows are not fills.
    pub fn into_execution(self) -> Option<Execution> {
        if let Some(t) = &self.exec_type {
            if t != "Trade" {
                return None;
            }
        }
        Some(Execution {
            side: Side::from_venue(&self.side)?,
            exec_id: self.exec_id,
            order_id: self.order_id,
            link_id: self.order_link_id,
            symbol: self.symbol,
            price: self.exec_price,
            qty: self.exec_qty,
            order_qty: self.order_qty,
            leaves_qty: self.leaves_qty,
            fee: self.exec_fee,
            exec_time_ms: self.exec_time,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireWalletCoin {
    pub coin: String,
    #[serde(deserialize_with = "num::dec", default)]
    pub equity: Decimal,
    #[serde(deserialize_with = "num::dec", default, alias = "availableToWithdraw")]
    pub wallet_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct WireWallet {
    #[serde(default)]
    pub coin: Vec<WireWalletCoin>,
}

impl WireWallet {
    pub fn into_balances(self) -> Vec<WalletBalance> {
        self.coin
            .into_iter()
            .map(|c| WalletBalance { coin: c.coin, equity: c.equity, available: c.wallet_balance })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTicker {
    pub symbol: String,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub last_price: Option<Decimal>,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub mark_price: Option<Decimal>,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub bid1_price: Option<Decimal>,
    #[serde(deserialize_with = "num::opt_dec", default)]
    pub ask1_price: Option<Decimal>,
}

impl WireTicker {
    pub fn into_ticker(self, ts_ms: i64) -> Ticker {
        Ticker {
            symbol: self.symbol,
            last_price: self.last_price,
            mark_price: self.mark_price,
            bid1: self.bid1_price,
            ask1: self.ask1_price,
            ts_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireKline {
    start: i64,
    interval: String,
    #[serde(deserialize_with = "num::dec")]
    open: Decimal,
    #[serde(deserialize_with = "num::dec")]
    high: Decimal,
    #[serde(deserialize_with = "num::dec")]
    low: Decimal,
    #[serde(deserialize_with = "num::dec")]
    close: Decimal,
    #[serde(deserialize_with = "num::dec")]
    volume: Decimal,
    #[serde(default)]
    confirm: bool,
}

// ---- decoders ----

fn rows<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<Vec<T>, WireError> {
    serde_json::from_value(frame.data.clone()).map_err(|e| frame.malformed(e))
}

fn decode_orderbook(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let book: WireBook = serde_json::from_value(frame.data.clone()).map_err(|e| frame.malformed(e))?;
    let bf = book.into_frame(frame.timestamp()).map_err(|e| frame.malformed(e))?;
    match frame.kind.as_deref() {
        Some("snapshot") => Ok(vec![StreamEvent::BookSnapshot(bf)]),
        Some("delta") => Ok(vec![StreamEvent::BookDelta(bf)]),
        other => Err(frame.malformed(format!("book frame type {other:?}"))),
    }
}

fn decode_kline(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let symbol = frame.symbol_from_topic();
    Ok(rows::<WireKline>(frame)?
        .into_iter()
        .map(|k| {
            StreamEvent::Kline(Kline {
                symbol: symbol.clone(),
                interval: k.interval,
                start_ms: k.start,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                confirmed: k.confirm,
            })
        })
        .collect())
}

fn decode_ticker(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let t: WireTicker = serde_json::from_value(frame.data.clone()).map_err(|e| frame.malformed(e))?;
    Ok(vec![StreamEvent::Ticker(t.into_ticker(frame.timestamp()))])
}

fn decode_orders(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let updates: Vec<OrderUpdate> = rows::<WireOrder>(frame)?.into_iter().filter_map(WireOrder::into_update).collect();
    Ok(vec![StreamEvent::Order(updates)])
}

fn decode_positions(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let ps = rows::<WirePosition>(frame)?.into_iter().map(WirePosition::into_position).collect();
    Ok(vec![StreamEvent::Position(ps)])
}

fn decode_executions(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let ex = rows::<WireExecution>(frame)?.into_iter().filter_map(WireExecution::into_execution).collect();
    Ok(vec![StreamEvent::Execution(ex)])
}

fn decode_wallet(frame: &Frame) -> Result<Vec<StreamEvent>, WireError> {
    let w = rows::<WireWallet>(frame)?.into_iter().flat_map(WireWallet::into_balances).collect();
    Ok(vec![StreamEvent::Wallet(w)])
}
