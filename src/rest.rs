// ===============================
// src/rest.rs
// ===============================
//
// Typed venue REST surface.
//
// `VenueApi` is the seam the reconciler and order manager talk to; the
// production implementation maps each call onto a `/v5/...` endpoint through
// `SignedTransport`, tests plug in an in-memory venue.
//
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::{
    BookFrame, Execution, Instrument, Kline, OrderType, OrderUpdate, Side, Ticker, TimeInForce, VenuePosition,
    WalletBalance,
};
use crate::error::TransportError;
use crate::transport::{Dispatch, Method, Params, ReqwestDispatch, SignedTransport};
use crate::wire::{num, WireBook, WireExecution, WireOrder, WirePosition, WireTicker, WireWallet};

/// Pages fetched per history call before giving up on the cursor.
const MAX_PAGES: usize = 10;

/// One order as sent to the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub link_id: String,
}

impl OrderRequest {
    fn body(&self, category: &str) -> Value {
        let mut b = json!({
            "category": category,
            "symbol": self.symbol,
            "side": self.side.as_venue(),
            "orderType": self.order_type.as_venue(),
            "qty": self.qty.to_string(),
            "timeInForce": self.tif.as_venue(),
            "reduceOnly": self.reduce_only,
            "orderLinkId": self.link_id,
        });
        if let (Some(px), OrderType::Limit) = (self.price, self.order_type) {
            b["price"] = Value::String(px.to_string());
        }
        b
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// Fill ledger rows for one request window, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionHistory {
    pub executions: Vec<Execution>,
    /// The page cap was hit: rows older than the first one returned may
    /// exist inside the window and were not fetched.
    pub truncated: bool,
}

#[async_trait]
pub trait VenueApi: Send + Sync {
    async fn instrument(&self, symbol: &str) -> Result<Instrument, TransportError>;
    async fn orderbook(&self, symbol: &str, depth: u32) -> Result<BookFrame, TransportError>;
    async fn ticker(&self, symbol: &str) -> Result<Ticker, TransportError>;
    /// Oldest first.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, TransportError>;
    async fn wallet_balance(&self) -> Result<Vec<WalletBalance>, TransportError>;
    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, TransportError>;
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, TransportError>;
    /// Per-item outcome, in request order.
    async fn place_batch(&self, reqs: &[OrderRequest]) -> Result<Vec<Result<OrderAck, TransportError>>, TransportError>;
    async fn cancel_order(&self, symbol: &str, link_id: &str) -> Result<(), TransportError>;
    /// Attach or move the position-level stop.
    async fn set_trading_stop(&self, symbol: &str, stop_loss: Decimal) -> Result<(), TransportError>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, TransportError>;
    /// Fills with exec time >= `start_ms`, oldest first.
    /// Executions in `[start_ms, end_ms]`; no `end_ms` means up to now. The
    /// venue pages newest first, so a truncated answer is missing the oldest
    /// rows of the window.
    async fn executions_between(&self, symbol: &str, start_ms: i64, end_ms: Option<i64>) -> Result<ExecutionHistory, TransportError>;
}

#[derive(Debug, Deserialize)]
struct Listed<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstrument {
    symbol: String,
    price_filter: WirePriceFilter,
    lot_size_filter: WireLotFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePriceFilter {
    #[serde(deserialize_with = "num::dec")]
    tick_size: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLotFilter {
    #[serde(deserialize_with = "num::dec", default)]
    qty_step: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    min_order_qty: Decimal,
    #[serde(deserialize_with = "num::dec", default)]
    max_order_qty: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireKlines {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct BatchCode {
    code: i64,
    #[serde(default)]
    msg: String,
}

pub struct BybitRest<D: Dispatch = ReqwestDispatch> {
    transport: Arc<SignedTransport<D>>,
    category: String,
}

impl<D: Dispatch> BybitRest<D> {
    pub fn new(transport: Arc<SignedTransport<D>>, category: &str) -> Self {
        Self { transport, category: category.to_string() }
    }

    fn query(&self, extra: &[(&str, String)]) -> Params {
        let mut q = vec![("category".to_string(), self.category.clone())];
        q.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        Params::Query(q)
    }

    async fn get_list<T: for<'de> Deserialize<'de>>(&self, endpoint: &str, params: Params) -> Result<Listed<T>, TransportError> {
        self.transport.call_json(Method::Get, endpoint, params).await
    }

    /// Follow `nextPageCursor` up to MAX_PAGES. The flag is set when the cap
    /// cut the listing short.
    async fn get_paged<T: for<'de> Deserialize<'de>>(&self, endpoint: &str, base: Vec<(&str, String)>) -> Result<(Vec<T>, bool), TransportError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        for page in 0..MAX_PAGES {
            let mut q = base.clone();
            if let Some(c) = &cursor {
                q.push(("cursor", c.clone()));
            }
            let listed: Listed<T> = self.get_list(endpoint, self.query(&q)).await?;
            out.extend(listed.list);
            match listed.next_page_cursor.filter(|c| !c.is_empty()) {
                Some(c) if cursor.as_deref() != Some(c.as_str()) => cursor = Some(c),
                _ => return Ok((out, false)),
            }
            debug!(endpoint, page, "following page cursor");
        }
        warn!(endpoint, pages = MAX_PAGES, "page cap reached, listing truncated");
        Ok((out, true))
    }
}

fn decode_err(endpoint: &str, why: impl std::fmt::Display) -> TransportError {
    TransportError::Decode(format!("{endpoint}: {why}"))
}

#[async_trait]
impl<D: Dispatch + 'static> VenueApi for BybitRest<D> {
    async fn instrument(&self, symbol: &str) -> Result<Instrument, TransportError> {
        const EP: &str = "/v5/market/instruments-info";
        let listed: Listed<WireInstrument> = self.get_list(EP, self.query(&[("symbol", symbol.to_string())])).await?;
        let w = listed.list.into_iter().find(|i| i.symbol == symbol).ok_or_else(|| decode_err(EP, format!("{symbol} not listed")))?;
        Ok(Instrument {
            symbol: w.symbol,
            tick_size: w.price_filter.tick_size,
            qty_step: w.lot_size_filter.qty_step,
            min_qty: w.lot_size_filter.min_order_qty,
            max_qty: w.lot_size_filter.max_order_qty,
        })
    }

    async fn orderbook(&self, symbol: &str, depth: u32) -> Result<BookFrame, TransportError> {
        const EP: &str = "/v5/market/orderbook";
        let q = self.query(&[("symbol", symbol.to_string()), ("limit", depth.to_string())]);
        let book: WireBook = self.transport.call_json(Method::Get, EP, q).await?;
        book.into_frame(crate::domain::now_ms()).map_err(|e| decode_err(EP, e))
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, TransportError> {
        const EP: &str = "/v5/market/tickers";
        let listed: Listed<WireTicker> = self.get_list(EP, self.query(&[("symbol", symbol.to_string())])).await?;
        let t = listed.list.into_iter().next().ok_or_else(|| decode_err(EP, "empty ticker list"))?;
        Ok(t.into_ticker(crate::domain::now_ms()))
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, TransportError> {
        const EP: &str = "/v5/market/kline";
        let q = self.query(&[("symbol", symbol.to_string()), ("interval", interval.to_string()), ("limit", limit.to_string())]);
        let raw: WireKlines = self.transport.call_json(Method::Get, EP, q).await?;
        let sym = if raw.symbol.is_empty() { symbol.to_string() } else { raw.symbol };
        let mut out = Vec::with_capacity(raw.list.len());
        // rows: [start, open, high, low, close, volume, turnover], newest first
        for row in raw.list.iter().rev() {
            if row.len() < 6 {
                return Err(decode_err(EP, "short kline row"));
            }
            let d = |i: usize| row[i].parse::<Decimal>().map_err(|e| decode_err(EP, e));
            out.push(Kline {
                symbol: sym.clone(),
                interval: interval.to_string(),
                start_ms: row[0].parse().map_err(|e| decode_err(EP, e))?,
                open: d(1)?,
                high: d(2)?,
                low: d(3)?,
                close: d(4)?,
                volume: d(5)?,
                confirmed: true,
            });
        }
        // the newest row is the bar still forming
        if let Some(last) = out.last_mut() {
            last.confirmed = false;
        }
        Ok(out)
    }

    async fn wallet_balance(&self) -> Result<Vec<WalletBalance>, TransportError> {
        const EP: &str = "/v5/account/wallet-balance";
        let q = Params::Query(vec![("accountType".into(), "UNIFIED".into())]);
        let listed: Listed<WireWallet> = self.transport.call_json(Method::Get, EP, q).await?;
        Ok(listed.list.into_iter().flat_map(WireWallet::into_balances).collect())
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, TransportError> {
        let listed: Listed<WirePosition> = self.get_list("/v5/position/list", self.query(&[("symbol", symbol.to_string())])).await?;
        Ok(listed.list.into_iter().map(WirePosition::into_position).collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, TransportError> {
        self.transport.call_json(Method::Post, "/v5/order/create", Params::Body(req.body(&self.category))).await
    }

    async fn place_batch(&self, reqs: &[OrderRequest]) -> Result<Vec<Result<OrderAck, TransportError>>, TransportError> {
        const EP: &str = "/v5/order/create-batch";
        let items: Vec<Value> = reqs
            .iter()
            .map(|r| {
                let mut b = r.body(&self.category);
                if let Some(o) = b.as_object_mut() {
                    o.remove("category");
                }
                b
            })
            .collect();
        let env = self.transport.call(Method::Post, EP, Params::Body(json!({"category": self.category, "request": items}))).await?;
        let acks: Listed<OrderAck> = serde_json::from_value(env.result).map_err(|e| decode_err(EP, e))?;
        let codes: Vec<BatchCode> = env
            .ret_ext_info
            .get("list")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_err(EP, e))?
            .unwrap_or_default();
        let mut acks = acks.list.into_iter();
        let out = reqs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let ack = acks.next();
                match codes.get(i) {
                    Some(c) if c.code != 0 => Err(TransportError::Venue { code: c.code, msg: c.msg.clone() }),
                    _ => ack.filter(|a| !a.order_id.is_empty()).ok_or_else(|| decode_err(EP, format!("no ack for item {i}"))),
                }
            })
            .collect();
        Ok(out)
    }

    async fn cancel_order(&self, symbol: &str, link_id: &str) -> Result<(), TransportError> {
        let body = json!({"category": self.category, "symbol": symbol, "orderLinkId": link_id});
        self.transport.call(Method::Post, "/v5/order/cancel", Params::Body(body)).await.map(|_| ())
    }

    async fn set_trading_stop(&self, symbol: &str, stop_loss: Decimal) -> Result<(), TransportError> {
        let body = json!({
            "category": self.category,
            "symbol": symbol,
            "stopLoss": stop_loss.to_string(),
            "tpslMode": "Full",
            "positionIdx": 0,
        });
        self.transport.call(Method::Post, "/v5/position/trading-stop", Params::Body(body)).await.map(|_| ())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, TransportError> {
        let (rows, _): (Vec<WireOrder>, bool) =
            self.get_paged("/v5/order/realtime", vec![("symbol", symbol.to_string()), ("openOnly", "0".into()), ("limit", "50".into())]).await?;
        Ok(rows.into_iter().filter_map(WireOrder::into_update).collect())
    }

    async fn executions_between(&self, symbol: &str, start_ms: i64, end_ms: Option<i64>) -> Result<ExecutionHistory, TransportError> {
        let mut q = vec![("symbol", symbol.to_string()), ("startTime", start_ms.to_string())];
        if let Some(end) = end_ms {
            q.push(("endTime", end.to_string()));
        }
        q.push(("limit", "100".into()));
        let (rows, truncated): (Vec<WireExecution>, bool) = self.get_paged("/v5/execution/list", q).await?;
        let mut executions: Vec<Execution> = rows.into_iter().filter_map(WireExecution::into_execution).collect();
        executions.sort_by_key(|e| e.exec_time_ms);
        Ok(ExecutionHistory { executions, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{RateLimitCfg, RateLimiter};
    use crate::shutdown::Shutdown;
    use crate::transport::tests::{cfg, ok, Scripted};
    use rust_decimal_macros::dec;

    fn rest(script: Vec<&str>) -> BybitRest<Scripted> {
        let replies = script.into_iter().map(ok).collect();
        let d = Scripted::new(replies, ok(r#"{"retCode":0,"retMsg":"OK","result":{}}"#));
        let limiter = Arc::new(RateLimiter::new(RateLimitCfg::default()));
        BybitRest::new(Arc::new(SignedTransport::new(cfg(1), d, limiter, Shutdown::never())), "linear")
    }

    #[tokio::test]
    async fn instrument_filters() {
        let r = rest(vec![
            r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[{"symbol":"BTCUSDT","priceFilter":{"minPrice":"0.10","maxPrice":"199999.80","tickSize":"0.10"},"lotSizeFilter":{"maxOrderQty":"100.000","minOrderQty":"0.001","qtyStep":"0.001"}}]}}"#,
        ]);
        let ins = r.instrument("BTCUSDT").await.unwrap();
        assert_eq!(ins.tick_size, dec!(0.10));
        assert_eq!(ins.qty_step, dec!(0.001));
        assert_eq!(ins.min_qty, dec!(0.001));
        assert_eq!(ins.max_qty, dec!(100));
    }

    #[tokio::test]
    async fn batch_maps_per_item_codes() {
        let r = rest(vec![
            r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"category":"linear","symbol":"BTCUSDT","orderId":"a1","orderLinkId":"p_tp1"},{"category":"linear","symbol":"BTCUSDT","orderId":"","orderLinkId":"p_tp2"}]},"retExtInfo":{"list":[{"code":0,"msg":"OK"},{"code":10001,"msg":"qty invalid"}]}}"#,
        ]);
        let leg = |link: &str| OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            qty: dec!(0.5),
            price: Some(dec!(110)),
            tif: TimeInForce::GoodTillCancel,
            reduce_only: true,
            link_id: link.into(),
        };
        let out = r.place_batch(&[leg("p_tp1"), leg("p_tp2")]).await.unwrap();
        assert_eq!(out[0].as_ref().unwrap().order_id, "a1");
        assert!(matches!(out[1], Err(TransportError::Venue { code: 10001, .. })));

        let sent = r.transport.dispatcher().seen.lock().unwrap()[0].body.clone();
        let v: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(v["request"][0]["price"], "110");
        assert_eq!(v["request"][0]["reduceOnly"], true);
        assert!(v["request"][0].get("category").is_none());
    }

    #[tokio::test]
    async fn executions_follow_cursor_and_sort_oldest_first() {
        let r = rest(vec![
            r#"{"retCode":0,"retMsg":"OK","result":{"nextPageCursor":"c2","list":[{"execId":"e3","orderId":"o","orderLinkId":"l","symbol":"BTCUSDT","side":"Buy","execPrice":"100","execQty":"0.1","orderQty":"1","leavesQty":"0.7","execFee":"0","execTime":"30","execType":"Trade"}]}}"#,
            r#"{"retCode":0,"retMsg":"OK","result":{"nextPageCursor":"","list":[{"execId":"e1","orderId":"o","orderLinkId":"l","symbol":"BTCUSDT","side":"Buy","execPrice":"100","execQty":"0.2","orderQty":"1","leavesQty":"0.8","execFee":"0","execTime":"10","execType":"Trade"}]}}"#,
        ]);
        let h = r.executions_between("BTCUSDT", 5, None).await.unwrap();
        assert!(!h.truncated);
        let ex = h.executions;
        assert_eq!(ex.iter().map(|e| e.exec_id.as_str()).collect::<Vec<_>>(), vec!["e1", "e3"]);
        let seen = r.transport.dispatcher().seen.lock().unwrap().clone();
        assert!(seen[0].query.contains("startTime=5"));
        assert!(seen[1].query.ends_with("cursor=c2"));
    }

    #[tokio::test]
    async fn execution_listing_flags_the_page_cap() {
        let pages: Vec<String> = (0..MAX_PAGES)
            .map(|i| {
                format!(
                    r#"{{"retCode":0,"retMsg":"OK","result":{{"nextPageCursor":"c{}","list":[{{"execId":"e{i}","orderId":"o","orderLinkId":"l","symbol":"BTCUSDT","side":"Buy","execPrice":"100","execQty":"0.1","orderQty":"1","leavesQty":"0","execFee":"0","execTime":"{}","execType":"Trade"}}]}}}}"#,
                    i + 1,
                    100 - i
                )
            })
            .collect();
        let r = rest(pages.iter().map(|s| s.as_str()).collect());
        let h = r.executions_between("BTCUSDT", 5, Some(200)).await.unwrap();
        assert!(h.truncated);
        assert_eq!(h.executions.len(), MAX_PAGES);
        assert_eq!(h.executions[0].exec_time_ms, 91);
        let seen = r.transport.dispatcher().seen.lock().unwrap().clone();
        assert!(seen[0].query.contains("endTime=200"));
    }

    #[tokio::test]
    async fn klines_oldest_first_last_unconfirmed() {
        let r = rest(vec![
            r#"{"retCode":0,"retMsg":"OK","result":{"symbol":"BTCUSDT","category":"linear","list":[["2000","3","4","2","3.5","10","35"],["1000","1","3","1","3","5","15"]]}}"#,
        ]);
        let k = r.klines("BTCUSDT", "1", 2).await.unwrap();
        assert_eq!(k[0].start_ms, 1000);
        assert!(k[0].confirmed);
        assert_eq!(k[1].close, dec!(3.5));
        assert!(!k[1].confirmed);
    }
}
