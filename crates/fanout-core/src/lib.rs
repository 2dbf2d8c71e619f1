//! fanout-core: shared types, wire format, hashing, and configuration.
//! All other fanout crates depend on this one.

pub mod chunk;
pub mod config;
pub mod crypto;
pub mod retry;
pub mod wire;

pub use chunk::{Chunk, TransferManifest};
pub use retry::{AttemptOutcome, DeliveryMachine, DeliveryState, RetryPolicy, Transition};
