//! Error types for the EC aggregation engine

use thiserror::Error;

use crate::types::{Extent, ObjectId};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during EC aggregation.
///
/// Variants fall into four severity classes consumed by the stripe driver:
/// invalid input, transient (abandon the stripe, keep iterating), fatal
/// (abort the current object; the first fatal error is reported once every
/// object has been attempted), and consistency violations (abort the object
/// with a diagnostic).
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed argument or configuration
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// This target is not the leader parity shard for the object
    #[error("target is not the leader for object {oid}")]
    NotLeader { oid: ObjectId },

    /// Local or remote fetch failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Local store mutation (update / range delete) failed
    #[error("store update failed: {0}")]
    Store(String),

    /// Peer parity target RPC failed or returned a bad status
    #[error("peer rpc failed: {0}")]
    PeerRpc(String),

    /// Working buffer allocation failed
    #[error("allocation of {size} bytes failed")]
    Alloc { size: usize },

    /// Codec table construction failed
    #[error("codec init failed: {0}")]
    CodecInit(String),

    /// A parity-flagged extent surfaced where data extents were expected
    #[error("parity-flagged extent {recx:?} surfaced in data index space")]
    ConsistencyViolated { recx: Extent },

    /// Parity counts beyond the supported range
    #[error("unsupported parity cell count p={p}")]
    Unsupported { p: u16 },

    /// Offloaded worker task died before reporting a result
    #[error("worker task failed: {0}")]
    Worker(String),

    /// The outer supervisor cancelled the iteration
    #[error("aggregation cancelled")]
    Cancelled,
}

impl Error {
    /// True for errors that abort the whole run's status (reported by
    /// `aggregate` once all objects have been attempted).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Alloc { .. } | Error::CodecInit(_))
    }

    /// True for errors that stop iteration of the current object instead of
    /// merely abandoning the current stripe.
    pub fn aborts_object(&self) -> bool {
        self.is_fatal() || matches!(self, Error::ConsistencyViolated { .. } | Error::Cancelled)
    }
}
