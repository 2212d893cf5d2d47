//! Transport flavors shared by the venue gateways: a blocking-style
//! REST client for long-poll venues and a WebSocket layer for
//! streaming venues.

pub mod rest;
pub mod ws;
