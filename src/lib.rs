//! ecagg - Erasure-Coded Object Aggregation Engine
//!
//! Background aggregation for EC-coded objects in a distributed object
//! store. For every object whose leader parity shard is the local target,
//! the engine scans the local versioned object store within a bounded
//! epoch window, rebuilds per-stripe views from the visible replica and
//! parity extents, and transforms each stripe: encoding parity from
//! freshly full stripes, folding partial replicas into existing parity,
//! recalculating parity after bulk rewrites, and re-replicating around
//! holes, then retiring the consumed replicas. The peer parity shard is
//! kept in lockstep over RPC and acks before any local mutation commits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Aggregator                            │
//! │  object → dkey → akey → extent walk, stripe boundary flush   │
//! ├──────────────┬──────────────────────┬────────────────────────┤
//! │ Mode Select  │  Transform Paths     │  Peer Coordination     │
//! │ parity probe │  encode / partial /  │  EC_AGGREGATE          │
//! │ vs stripe    │  recalc / hole-repair│  EC_REPLICATE          │
//! ├──────────────┴──────────────────────┴────────────────────────┤
//! │   Codec (GF tables)   │   StripeBuffers   │   StripeState    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  VosStore  │  RemoteObjects  │  IdentityService  │ PeerClient│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`engine`] - Iteration driver, mode selection, commit protocol
//! - `paths` - Encode, partial-update/recalc, and hole-repair paths
//! - [`stripe`] - Per-stripe state and boundary bookkeeping
//! - [`codec`] - Galois-field encode / incremental update / recovery
//! - [`bufpool`] - Aligned, reusable working buffers
//! - [`vos`] - Versioned object store port
//! - [`vos_mem`] - In-memory reference store
//! - [`remote`] - Remote object read capability
//! - [`identity`] - Pool/container identity and leader checks
//! - [`rpc`] - Peer wire types, client port, receive-side installers
//! - [`testkit`] - Loopback wiring for end-to-end tests

pub mod bufpool;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
mod paths;
pub mod remote;
pub mod rpc;
pub mod stripe;
pub mod testkit;
pub mod types;
pub mod vos;
pub mod vos_mem;

// Re-export commonly used types
pub use config::AggConfig;
pub use engine::{AggSummary, Aggregator, CancelHandle};
pub use error::{Error, Result};
pub use types::{ClassAttr, Epoch, EpochRange, Extent, ExtentRec, Key, ObjectId, PARITY_FLAG};
pub use vos::{ParityProbe, VosStore};
