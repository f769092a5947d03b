//! Remote and local I/O used by the materializer.
//!
//! Ownership model:
//! - `RemoteStore` is the only seam to the network. One instance is shared
//!   read-only by every partition worker, so implementations must be safe for
//!   concurrent use and hold no per-call mutable state.
//! - `fs` owns the local dataset tree helpers; workers only ever touch their
//!   own partition directory.

use std::fmt;
use std::io::Write;

/// Local dataset tree helpers.
pub mod fs;
/// `ureq`-backed HTTP remote.
pub mod http;

pub use http::HttpRemote;

/// Result of a lightweight existence check on one remote batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The remote serves this batch.
    Exists,
    /// The remote does not have this batch; discovery stops here.
    NotFound,
}

/// Transfer failure classified by whether repeating the call can help.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferError {
    /// Connection reset, timeout, truncated body, or an overloaded server.
    Transient(String),
    /// Permanent rejection or malformed request.
    Permanent(String),
}

impl TransferError {
    /// True when the same call may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }

    /// Human-readable failure reason.
    pub fn reason(&self) -> &str {
        match self {
            TransferError::Transient(reason) | TransferError::Permanent(reason) => reason,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Transient(reason) => write!(f, "transient: {reason}"),
            TransferError::Permanent(reason) => write!(f, "permanent: {reason}"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Network-facing source of batch files.
///
/// For a fixed remote state, `probe` and `fetch` must be deterministic so that
/// re-runs reproduce identical local artifacts.
pub trait RemoteStore: Send + Sync {
    /// Check whether `url` exists without transferring its body.
    fn probe(&self, url: &str) -> Result<ProbeOutcome, TransferError>;

    /// Stream the body of `url` into `sink`, returning the byte count.
    ///
    /// On error, `sink` may have received a prefix of the body; the caller
    /// owns discarding it.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransferError>;
}
