//! TCP transport for the transfer RPCs.
//!
//! `frame` moves `wire` frames over any async byte stream; `server` accepts
//! connections and hands decoded requests to a `TransferService`.

pub mod frame;
pub mod server;

pub use frame::{read_frame, write_frame, FrameError, RawFrame};
