//! Per-SSRC stream state for both directions.

mod register;

mod rtx_cache;

mod seq_manager;
pub use seq_manager::SeqManager;

mod receive;
pub use receive::RtpStreamRecv;

mod send;
pub use send::RtpStreamSend;
