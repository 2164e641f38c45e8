//! Versioned object store port
//!
//! The engine consumes the local store through this trait: nested listing
//! (object, dkey, akey), visibility-filtered extent iteration bounded by an
//! epoch window, a parity range probe, and the three mutations the commit
//! paths need (fetch, update, range remove). The storage engine itself is
//! an external collaborator; [`crate::vos_mem::MemVos`] is the in-tree
//! reference backend used by the test suites.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Epoch, EpochRange, Extent, ExtentRec, Key, ObjectId, ObjectMeta, EPOCH_MAX};

// =============================================================================
// Probe Result
// =============================================================================

/// Result of the parity range probe for one stripe. Absence is encoded as
/// `epoch == EPOCH_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityProbe {
    pub epoch: Epoch,
    pub recx: Extent,
}

impl ParityProbe {
    pub fn absent() -> Self {
        Self {
            epoch: EPOCH_MAX,
            recx: Extent::new(0, 0),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.epoch == EPOCH_MAX
    }
}

/// Visible data extents of one (dkey, akey) array, index-ordered, plus the
/// array's record size.
#[derive(Debug, Clone)]
pub struct RecxList {
    pub rsize: u64,
    pub extents: Vec<ExtentRec>,
}

// =============================================================================
// Store Port
// =============================================================================

/// Local versioned object store operations used by aggregation.
#[async_trait]
pub trait VosStore: Send + Sync {
    /// Objects with any record visible in the epoch window.
    async fn list_objects(&self, epr: EpochRange) -> Result<Vec<ObjectMeta>>;

    /// Dkeys of an object with records in the window.
    async fn list_dkeys(&self, oid: ObjectId, epr: EpochRange) -> Result<Vec<Key>>;

    /// Akeys of a dkey with records in the window.
    async fn list_akeys(&self, oid: ObjectId, dkey: &Key, epr: EpochRange) -> Result<Vec<Key>>;

    /// Visible data extents of an array within the window. Shadowed spans
    /// are already resolved away; parity-namespace extents are never
    /// returned here.
    async fn list_recx(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        epr: EpochRange,
    ) -> Result<RecxList>;

    /// Visibility-filtered probe of the parity namespace range `recx`
    /// (flag bit set). At most one extent matches.
    async fn probe_parity(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<ParityProbe>;

    /// Read the listed extents as of `epoch` into `out`, one
    /// `count * rsize` span per extent in order. Uncovered or punched
    /// records read as zeros.
    async fn fetch(
        &self,
        oid: ObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        out: &mut [u8],
    ) -> Result<()>;

    /// Write the listed extents at `epoch`, consuming `data` in order.
    async fn update(
        &self,
        oid: ObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        data: &[u8],
    ) -> Result<()>;

    /// Remove all record data inside `recx` written within the epoch
    /// window.
    async fn array_remove(
        &self,
        oid: ObjectId,
        epr: EpochRange,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<()>;
}
