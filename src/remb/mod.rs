//! Receiver estimated maximum bitrate, both directions.
//!
//! The server side estimates downlink bandwidth from abs-send-time
//! inter-arrival deltas and emits REMB toward the sending peer. The
//! client side consumes REMB from consuming peers and turns it into
//! bitrate (re)allocation events.

mod server;
pub use server::RembServer;

mod client;
pub use client::{RembClient, RembClientEvent};
