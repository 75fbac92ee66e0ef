//! Transport-wide congestion control plumbing.
//!
//! The server side runs on the ingress path: it collects (wide seq,
//! arrival time) pairs into feedback packets and emits them every 100 ms
//! or when a packet fills up. The client side runs on the egress path:
//! it assigns wide sequence numbers, paces outgoing packets, digests
//! feedback and REMB into an available-bitrate signal.

mod server;
pub use server::TccServer;

mod client;
pub use client::TccClient;

mod pacer;
pub use pacer::Pacer;
