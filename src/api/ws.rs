//! WebSocket plumbing for streaming venues.
//!
//! Connection setup, reconnect pacing and frame decoding live here; the
//! subscribe/dispatch lifecycle is driven by the gateway loop.

use std::io::Read;

use flate2::read::DeflateDecoder;
use rand::random_range;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{FeedError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(url: &str) -> Result<WsStream> {
    let (stream, _) = connect_async(url).await?;
    Ok(stream)
}

/// Backoff between reconnect attempts, jittered so a venue outage does
/// not line every worker up on the same retry tick.
pub fn reconnect_delay() -> Duration {
    Duration::from_millis(5_000 + random_range(0..1_000))
}

/// Decode a binary frame into message text.
///
/// Some venues ship raw-deflate compressed frames; plain UTF-8 binary
/// frames pass through unchanged.
pub fn decode_binary(data: &[u8]) -> Result<String> {
    let mut inflated = String::new();
    let mut decoder = DeflateDecoder::new(data);
    if decoder.read_to_string(&mut inflated).is_ok() {
        return Ok(inflated);
    }
    String::from_utf8(data.to_vec())
        .map_err(|_| FeedError::Parse("binary frame is neither deflate nor utf-8".to_string()))
}
