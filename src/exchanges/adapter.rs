use serde_json::Value;

use crate::error::Result;
use crate::instrument::Instrument;
use crate::market_data::Trade;

/// Transport flavor a venue requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Persistent WebSocket stream.
    Websocket,
    /// Periodic REST polling of depth and trades endpoints.
    RestPoll,
}

/// What one wire item turned out to be.
pub enum Classified<'a> {
    /// Depth payload for the instrument's order-book channel.
    OrderBook(&'a Value),
    /// Trade payload for the instrument's trades channel.
    Trades(&'a Value),
    /// Heartbeat, subscribe acknowledgement or other control traffic.
    Control,
    /// Well-formed but not for this instrument's channels.
    Irrelevant,
}

/// VenueApi is the abstraction layer between the generic gateway
/// runtime and venue-specific wire formats.
///
/// Each venue implementation:
/// - builds the subscribe frames for its two channels
/// - classifies incoming items against the instrument's channel ids
/// - parses depth and trade payloads into normalized values
///
/// Parsing rules every venue follows:
/// - depth is clamped to `min(N, len)`; untouched slots stay zero
/// - timestamps are normalized to the UTC column format
/// - unknown side codes map to `TradeSide::Unknown`, never an error
/// - a parse error is returned (not panicked) only when the top-level
///   keys identifying the message are absent; the gateway logs the
///   payload and keeps the connection up
///
/// Implementations are stateless and shared across tasks; all mutable
/// state lives on the instrument owned by the calling worker.
pub trait VenueApi: Send + Sync {
    /// Canonical venue name as it appears in subscription files.
    fn exchange_name(&self) -> &'static str;

    fn transport(&self) -> Transport {
        Transport::Websocket
    }

    /// WebSocket endpoint for streaming venues.
    fn link(&self, _instmt: &Instrument) -> String {
        String::new()
    }

    /// Assign venue channel identifiers before subscribing.
    fn assign_channels(&self, _instmt: &mut Instrument) {}

    /// Subscribe frame for the order-book channel; empty when the venue
    /// has none.
    fn order_book_subscription_string(&self, _instmt: &Instrument) -> String {
        String::new()
    }

    /// Subscribe frame for the trades channel; empty when the venue has
    /// none.
    fn trades_subscription_string(&self, _instmt: &Instrument) -> String {
        String::new()
    }

    /// Split a raw frame into per-channel items. Most venues deliver one
    /// item per frame; envelope venues override this.
    fn envelope<'a>(&self, raw: &'a Value) -> Vec<&'a Value> {
        vec![raw]
    }

    /// Route one item against the instrument's channels.
    fn classify<'a>(&self, raw: &'a Value, instmt: &mut Instrument) -> Classified<'a>;

    /// Parse a depth payload into `instmt.l2_depth`.
    fn parse_l2_depth(&self, instmt: &mut Instrument, raw: &Value) -> Result<()>;

    /// Parse a trade payload into zero or more normalized trades.
    fn parse_trade(&self, instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>>;

    /// Depth endpoint for polling venues.
    fn depth_link(&self, _instmt: &Instrument) -> String {
        String::new()
    }

    /// Trades endpoint for polling venues; built from the instrument's
    /// paging cursor.
    fn trades_link(&self, _instmt: &Instrument) -> String {
        String::new()
    }

    /// Next paging cursor carried in a trades response.
    fn rest_cursor(&self, _raw: &Value) -> Option<String> {
        None
    }
}
