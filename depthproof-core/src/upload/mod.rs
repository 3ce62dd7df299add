//! Network-gated, retrying upload of processed captures.
//!
//! ## Item lifecycle
//!
//! ```text
//! Pending -> Uploading -> Completed
//!               |  \
//!               |   +-> Processing -> Completed   (backend post-processing)
//!               v
//!             Failed --(due, retryable)--> Pending
//!               |
//!               +--(non-retryable or attempts exhausted)--> PermanentlyFailed
//! ```
//!
//! `PermanentlyFailed` items are left alone until an explicit
//! [`UploadQueue::retry`].

mod client;
mod mock;
mod network;
mod policy;
mod queue;
mod store;

#[cfg(feature = "http")]
pub use client::HttpUploadClient;
pub use client::{RemoteStatus, UploadClient, UploadProgress, UploadReceipt};
pub use mock::ScriptedUploadClient;
pub use network::{ConnectionType, NetworkMonitor, NetworkStatus};
pub use policy::RetryPolicy;
pub use queue::{ProcessSummary, QueueEvent, QueueStats, QueuedCapture, UploadQueue, UploadStatus};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore};
