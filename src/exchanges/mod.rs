//! Venue registry and factory.
//!
//! All venue-specific logic lives in the adapter modules; the rest of
//! the application resolves venues exclusively through `get_venue` and
//! talks to them through the `VenueApi` trait.

pub mod adapter;
pub mod bitfinex;
pub mod bitstamp;
pub mod coinbase;
pub mod kraken;
pub mod okx;

use std::sync::Arc;

use adapter::VenueApi;

/// Resolve a venue implementation by its subscription-file name.
///
/// Names are matched case-insensitively and must stay stable; `None`
/// means the venue is not supported.
pub fn get_venue(name: &str) -> Option<Arc<dyn VenueApi>> {
    match name.to_lowercase().as_str() {
        "okx" => Some(Arc::new(okx::OkxVenue)),
        "bitfinex" => Some(Arc::new(bitfinex::BitfinexVenue)),
        "bitstamp" => Some(Arc::new(bitstamp::BitstampVenue)),
        "coinbase" => Some(Arc::new(coinbase::CoinbaseVenue)),
        "kraken" => Some(Arc::new(kraken::KrakenVenue)),
        _ => None,
    }
}
