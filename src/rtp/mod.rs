//! RTP and RTCP wire formats.

mod id;
pub use id::{Mid, Pt, Rid, SeqNo, Ssrc};

mod ext;
pub use ext::{Extension, ExtensionMap, ExtensionValues, MAX_ID};

mod header;
pub use header::{extend_u16, RtpHeader};

mod packet;
pub use packet::RtpPacket;

mod rtcp;
pub use rtcp::*;

use thiserror::Error;

/// Errors arising when interpreting RTP wire data.
///
/// These never leave the data path. The transport logs and drops.
/// RTCP sub-packet parse failures stay `&'static str` internal to the
/// compound reader, which skips and logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    /// The RTP header could not be parsed.
    #[error("failed to parse RTP header")]
    ParseHeader,
}
