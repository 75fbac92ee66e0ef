//! Sans-IO core of a Selective Forwarding Unit (SFU) for real time media.
//!
//! The crate routes RTP packets from producing peers to consuming peers
//! within a [`Transport`], rewrites per-consumer headers, adapts simulcast
//! layer selection to congestion feedback and participates in the RTCP
//! feedback loop (SR/RR, PLI/FIR, NACK, REMB, transport-wide CC).
//!
//! There are no sockets, threads or timers in here. The embedding worker
//! event loop feeds decrypted RTP/RTCP via [`Transport::handle_rtp`] and
//! [`Transport::handle_rtcp`], drains outgoing packets and notifications
//! via [`Transport::poll_output`], and drives time by calling
//! [`Transport::handle_timeout`] whenever the deadline returned by
//! [`Transport::poll_timeout`] passes.
//!
//! The DTLS/ICE/SRTP layer, SCTP data channels and the worker process
//! lifecycle are external collaborators and not part of this crate.

#[macro_use]
extern crate tracing;

use thiserror::Error;

mod util;

pub mod rtp;

pub mod rate;

mod streams;
pub use streams::{RtpStreamRecv, RtpStreamSend, SeqManager};

mod listener;
pub use listener::RtpListener;

mod producer;
pub use producer::{CodecKind, MediaKind, Producer, ProducerOptions, RtpEncoding};
pub use producer::{EncodingDump, ProducerDump, ProducerStat};

mod consumer;
pub use consumer::{Consumer, ConsumerDump, ConsumerOptions, ConsumerStat, ConsumerType};

mod keyframe;
pub use keyframe::KeyFrameRequestManager;

pub mod remb;

pub mod cc;

mod transport;
pub use transport::{Event, Output, Transport, TransportStats};

pub mod channel;

pub mod config;

/// Errors surfaced on the control path.
///
/// The data path (per-packet parsing and routing) never returns errors
/// upward. Malformed packets and routing misses are logged and dropped.
#[derive(Debug, Error)]
pub enum SfuError {
    /// A producer/consumer creation request carried bad or missing fields.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An SSRC, MID or RID is already claimed within the transport.
    #[error("conflicting identifier: {0}")]
    Conflict(String),

    /// The request referenced an entity this transport does not own.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request method is not recognized.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
}
