// ===============================
// src/domain.rs
// ===============================
//
// Shared value types: orders, positions, book levels, instrument filters and
// the typed payloads the stream/REST layers decode into.
//
// Prices and quantities are `Decimal` so tick/step rounding and fill sums are
// exact (0.4 + 0.6 == 1.0).
//
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_venue(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn from_venue(s: &str) -> Option<Side> {
        match s {
            "Buy" | "BUY" | "buy" => Some(Side::Buy),
            "Sell" | "SELL" | "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_venue(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
    FillOrKill,
    PostOnly,
}

impl TimeInForce {
    pub fn as_venue(&self) -> &'static str {
        match self {
            TimeInForce::GoodTillCancel => "GTC",
            TimeInForce::ImmediateOrCancel => "IOC",
            TimeInForce::FillOrKill => "FOK",
            TimeInForce::PostOnly => "PostOnly",
        }
    }
}

/// Order lifecycle. `Submitted` is the local pre-ack state; everything after
/// it is only ever reached through venue confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Allowed edges of the lifecycle graph. Self-edges are accepted so a
    /// duplicate event is a no-op rather than an error.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Submitted => next != Submitted,
            New => matches!(next, PartiallyFilled | Filled | Cancelled | Rejected | Expired),
            PartiallyFilled => matches!(next, Filled | Cancelled),
            Filled | Cancelled | Rejected | Expired => false,
        }
    }

    pub fn from_venue(s: &str) -> Option<OrderStatus> {
        match s {
            "Created" | "New" | "Untriggered" | "Triggered" | "Active" => Some(OrderStatus::New),
            "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
            "Filled" => Some(OrderStatus::Filled),
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Some(OrderStatus::Cancelled),
            "Rejected" => Some(OrderStatus::Rejected),
            "Expired" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// What an order is for, parsed back from its link id suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit(u8),
    Add(u32),
    Exit,
    External,
}

impl OrderRole {
    pub fn suffix(&self) -> String {
        match self {
            OrderRole::Entry => "entry".into(),
            OrderRole::StopLoss => "sl".into(),
            OrderRole::TakeProfit(n) => format!("tp{n}"),
            OrderRole::Add(n) => format!("add{n}"),
            OrderRole::Exit => "exit".into(),
            OrderRole::External => "ext".into(),
        }
    }

    /// `wgx_1700000000000_8f3a_tp2` -> TakeProfit(2). Ids without a known
    /// suffix are treated as external activity.
    pub fn from_link_id(link_id: &str) -> OrderRole {
        let tail = link_id.rsplit('_').next().unwrap_or_default();
        match tail {
            "entry" => OrderRole::Entry,
            "sl" | "be" => OrderRole::StopLoss,
            "exit" => OrderRole::Exit,
            t if t.starts_with("tp") => t[2..].parse().map(OrderRole::TakeProfit).unwrap_or(OrderRole::External),
            t if t.starts_with("add") => t[3..].parse().map(OrderRole::Add).unwrap_or(OrderRole::External),
            _ => OrderRole::External,
        }
    }
}

/// `<prefix>_<ms>_<rand>`: everything before the role suffix.
pub fn link_prefix_of(link_id: &str) -> &str {
    match link_id.rfind('_') {
        Some(i) => &link_id[..i],
        None => link_id,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: Decimal,
    /// Share of the position's ladder basis closed at this target (0..=1).
    pub fraction: Decimal,
    /// Link ids of the reduce-only legs placed for this target; a later entry
    /// or add fill tops the target up with another leg.
    #[serde(default)]
    pub legs: Vec<String>,
    /// Quantity working or filled across `legs`.
    #[serde(default)]
    pub placed_qty: Decimal,
    pub filled: bool,
}

impl TakeProfitTarget {
    pub fn new(price: Decimal, fraction: Decimal) -> Self {
        Self { price, fraction, legs: Vec::new(), placed_qty: Decimal::ZERO, filled: false }
    }

    pub fn owns(&self, link_id: &str) -> bool {
        self.legs.iter().any(|l| l == link_id)
    }
}

/// Stop/targets requested with an entry; copied onto the position when the
/// entry fill creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPlan {
    pub stop_loss: Option<Decimal>,
    pub targets: Vec<TakeProfitTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub link_id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub role: OrderRole,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub plan: Option<EntryPlan>,
    pub created_ms: i64,
    pub updated_ms: i64,
    /// Consecutive open-order polls this order was missing from.
    #[serde(default)]
    pub missing_polls: u32,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub targets: Vec<TakeProfitTarget>,
    pub add_count: u32,
    /// Quantity opened by entry and add fills; take-profit legs are sized
    /// against it.
    #[serde(default)]
    pub ladder_basis: Decimal,
    pub breakeven_applied: bool,
    pub link_prefix: Option<String>,
    pub opened_ms: i64,
    pub updated_ms: i64,
}

impl Position {
    pub fn open(symbol: &str, side: Side, qty: Decimal, price: Decimal, ts_ms: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            avg_entry_price: price,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            stop_loss: None,
            targets: Vec::new(),
            add_count: 0,
            ladder_basis: Decimal::ZERO,
            breakeven_applied: false,
            link_prefix: None,
            opened_ms: ts_ms,
            updated_ms: ts_ms,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty.is_zero()
    }

    /// Signed net quantity (long positive).
    pub fn net_qty(&self) -> Decimal {
        self.side.sign() * self.qty
    }

    /// Apply a fill and return the PnL it realized. Same-side fills average
    /// the entry; opposite fills reduce and may flip the position.
    pub fn apply_fill(&mut self, side: Side, qty: Decimal, price: Decimal, ts_ms: i64) -> Decimal {
        self.updated_ms = ts_ms;
        if self.is_flat() {
            self.side = side;
            self.qty = qty;
            self.avg_entry_price = price;
            return Decimal::ZERO;
        }
        if side == self.side {
            let notional = self.avg_entry_price * self.qty + price * qty;
            self.qty += qty;
            self.avg_entry_price = notional / self.qty;
            return Decimal::ZERO;
        }
        let closed = qty.min(self.qty);
        let pnl = (price - self.avg_entry_price) * closed * self.side.sign();
        self.realized_pnl += pnl;
        self.qty -= closed;
        let flip = qty - closed;
        if flip > Decimal::ZERO {
            self.side = side;
            self.qty = flip;
            self.avg_entry_price = price;
            self.breakeven_applied = false;
            self.ladder_basis = Decimal::ZERO;
            self.targets.clear();
        }
        pnl
    }

    pub fn mark(&mut self, price: Decimal) {
        self.unrealized_pnl = (price - self.avg_entry_price) * self.qty * self.side.sign();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
    pub updated_ms: i64,
}

/// Venue trading filters for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
}

impl Instrument {
    /// Nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }

    /// Quantities round down so a rounded order never exceeds the intent.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.qty_step.is_zero() {
            return qty;
        }
        ((qty / self.qty_step).floor() * self.qty_step).normalize()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub confirmed: bool,
}

/// Ticker frames are partial on delta; absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub bid1: Option<Decimal>,
    pub ask1: Option<Decimal>,
    pub ts_ms: i64,
}

impl Ticker {
    pub fn merge(&mut self, delta: &Ticker) {
        if delta.last_price.is_some() {
            self.last_price = delta.last_price;
        }
        if delta.mark_price.is_some() {
            self.mark_price = delta.mark_price;
        }
        if delta.bid1.is_some() {
            self.bid1 = delta.bid1;
        }
        if delta.ask1.is_some() {
            self.ask1 = delta.ask1;
        }
        self.ts_ms = self.ts_ms.max(delta.ts_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub coin: String,
    pub equity: Decimal,
    pub available: Decimal,
}

/// One book frame from stream or REST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookFrame {
    pub symbol: String,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub sequence: u64,
    pub ts_ms: i64,
}

/// Order state as reported by the venue (push or open-order poll).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub link_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub cum_filled: Decimal,
    pub avg_price: Decimal,
    pub reduce_only: bool,
    pub updated_ms: i64,
}

/// One fill from the venue ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub exec_id: String,
    pub order_id: String,
    pub link_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    /// Order quantity and what is left after this fill; together they give
    /// the cumulative filled quantity the fill implies.
    pub order_qty: Decimal,
    pub leaves_qty: Decimal,
    pub fee: Decimal,
    pub exec_time_ms: i64,
}

impl Execution {
    /// Identity for replay detection: the venue exec id, or the order id,
    /// time, size and price when the venue sent none.
    pub fn dedupe_key(&self) -> String {
        if self.exec_id.is_empty() {
            format!("{}:{}:{}@{}", self.order_id, self.exec_time_ms, self.qty.normalize(), self.price.normalize())
        } else {
            self.exec_id.clone()
        }
    }

    pub fn implied_cum_filled(&self) -> Option<Decimal> {
        if self.order_qty > Decimal::ZERO {
            Some(self.order_qty - self.leaves_qty)
        } else {
            None
        }
    }
}

/// Authoritative position row (stream push or REST poll).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    /// `None` when flat.
    pub side: Option<Side>,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub updated_ms: i64,
}

impl VenuePosition {
    pub fn net_qty(&self) -> Decimal {
        match self.side {
            Some(s) if self.size > Decimal::ZERO => s.sign() * self.size,
            _ => Decimal::ZERO,
        }
    }
}

/// Top of book published after every applied book frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdTick {
    pub ts_ms: i64,
    pub symbol: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

/// Journal records (see recorder.rs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Transition { link_id: String, symbol: String, from: OrderStatus, to: OrderStatus, ts_ms: i64 },
    Fill { link_id: String, symbol: String, side: Side, qty: Decimal, price: Decimal, realized_pnl: Decimal, ts_ms: i64 },
    PositionClosed { symbol: String, realized_pnl: Decimal, ts_ms: i64 },
    Divergence { symbol: String, local_qty: Decimal, venue_qty: Decimal, ts_ms: i64 },
    Note(String),
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn lifecycle_edges() {
        use OrderStatus::*;
        assert!(Submitted.can_transition_to(New));
        assert!(Submitted.can_transition_to(Filled));
        assert!(New.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
        assert!(!PartiallyFilled.can_transition_to(Rejected));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(Filled.can_transition_to(Filled));
        assert!(!New.can_transition_to(Submitted));
    }

    #[test]
    fn role_from_link_id() {
        assert_eq!(OrderRole::from_link_id("wgx_1_ab_entry"), OrderRole::Entry);
        assert_eq!(OrderRole::from_link_id("wgx_1_ab_tp2"), OrderRole::TakeProfit(2));
        assert_eq!(OrderRole::from_link_id("wgx_1_ab_add3"), OrderRole::Add(3));
        assert_eq!(OrderRole::from_link_id("manual-order"), OrderRole::External);
        assert_eq!(link_prefix_of("wgx_1_ab_tp2"), "wgx_1_ab");
    }

    #[test]
    fn instrument_rounding() {
        let ins = Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.5),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(100),
        };
        assert_eq!(ins.round_price(dec!(100.26)), dec!(100.5));
        assert_eq!(ins.round_price(dec!(100.24)), dec!(100));
        assert_eq!(ins.round_qty(dec!(0.0129)), dec!(0.012));
    }

    #[test]
    fn position_fill_math() {
        let mut p = Position::open("BTCUSDT", Side::Buy, dec!(1), dec!(100), 0);
        assert_eq!(p.apply_fill(Side::Buy, dec!(1), dec!(110), 1), Decimal::ZERO);
        assert_eq!(p.avg_entry_price, dec!(105));
        let pnl = p.apply_fill(Side::Sell, dec!(0.5), dec!(115), 2);
        assert_eq!(pnl, dec!(5));
        assert_eq!(p.qty, dec!(1.5));
        let pnl = p.apply_fill(Side::Sell, dec!(2), dec!(100), 3);
        assert_eq!(pnl, dec!(-7.5));
        assert_eq!(p.side, Side::Sell);
        assert_eq!(p.qty, dec!(0.5));
        assert_eq!(p.avg_entry_price, dec!(100));
    }
}
