//! Remote object I/O capability
//!
//! Old cell data lives on the data shards and the second parity cell on the
//! peer shard, so the partial and hole-repair paths read through the
//! object-remote path rather than local VOS. The capability is deliberately
//! narrow: a handle exposes `fetch` and `layout`, nothing else. The handle
//! is opened lazily per object and reused across stripes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{Epoch, Extent, Key, ObjectId, TargetId};

/// Placement of every shard of an object, in shard order (data cells first,
/// then parity cells; the leader parity shard is last).
#[derive(Debug, Clone)]
pub struct ObjectLayout {
    pub shards: Vec<TargetId>,
}

#[async_trait]
pub trait RemoteObjects: Send + Sync {
    /// Open the object for remote reads via the container handle.
    async fn open(&self, oid: ObjectId) -> Result<Arc<dyn RemoteObjectHandle>>;
}

#[async_trait]
pub trait RemoteObjectHandle: Send + Sync {
    /// Read the listed extents as of `epoch` into `out`, one
    /// `count * rsize` span per extent. `shard` pins the read to a specific
    /// shard (used to reach the peer's parity cell); `None` routes by
    /// layout.
    async fn fetch(
        &self,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        out: &mut [u8],
        shard: Option<u32>,
    ) -> Result<()>;

    /// The object's shard placement.
    async fn layout(&self) -> Result<ObjectLayout>;
}

/// Locate the peer parity target: the shard listed immediately before this
/// target's own entry in the layout walk.
pub fn peer_parity_target(layout: &ObjectLayout, my_rank: u32) -> Result<TargetId> {
    let mut prev: Option<TargetId> = None;
    let mut peer: Option<TargetId> = None;
    for shard in &layout.shards {
        if shard.rank == my_rank {
            peer = prev;
        } else {
            prev = Some(*shard);
        }
    }
    peer.ok_or_else(|| {
        Error::InvalidInput(format!("rank {my_rank} has no predecessor in layout"))
    })
}
