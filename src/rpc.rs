//! Peer parity coordination RPCs
//!
//! Two opcodes close the two-party commit: `EC_AGGREGATE` ships an updated
//! parity cell to the peer parity shard, and `EC_REPLICATE` ships replica
//! ranges when a hole downgrades a stripe. The leader awaits the reply
//! before mutating its own store, so the peer's install is ordered strictly
//! before the local commit.
//!
//! The receive side is expressed as the two installer functions; a server
//! binds them to its transport, and the loopback client in
//! [`crate::testkit`] binds them directly to a second in-memory store.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ClassAttr, Epoch, EpochRange, Extent, Key, ObjectId, TargetId};
use crate::vos::VosStore;

/// RPC endpoint of the peer parity target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub rank: u32,
    pub tag: u32,
}

impl Endpoint {
    /// Peer service threads are addressed one past the target index.
    pub fn for_peer(peer: TargetId) -> Self {
        Self {
            rank: peer.rank,
            tag: peer.tgt_idx + 1,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// `EC_AGGREGATE`: install one parity cell and retire the stripe's replicas
/// on the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcAggregateReq {
    pub pool_uuid: Uuid,
    pub pool_hdl_uuid: Uuid,
    pub cont_uuid: Uuid,
    pub cont_hdl_uuid: Uuid,
    /// Object addressed at the peer's shard
    pub oid: ObjectId,
    pub dkey: Key,
    pub akey: Key,
    pub rsize: u64,
    pub epoch: Epoch,
    pub stripenum: u64,
    pub map_version: u32,
    /// Carried-in head records widening the delete range backwards
    pub prior_len: u64,
    /// Boundary-crossing records retained past the delete range
    pub after_len: u64,
    /// The peer's parity cell (`len * rsize` bytes)
    pub parity: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EcAggregateResp {
    pub status: i32,
}

/// Array I/O descriptor carried by `EC_REPLICATE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoDesc {
    pub akey: Key,
    pub rsize: u64,
    pub recxs: Vec<Extent>,
}

impl IoDesc {
    pub fn total_bytes(&self) -> usize {
        self.recxs
            .iter()
            .map(|r| (r.count * self.rsize) as usize)
            .sum()
    }
}

/// `EC_REPLICATE`: install replica ranges and drop the stripe's parity on
/// the peer (hole repair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcReplicateReq {
    pub pool_uuid: Uuid,
    pub pool_hdl_uuid: Uuid,
    pub cont_uuid: Uuid,
    pub cont_hdl_uuid: Uuid,
    /// Object addressed at the peer's shard
    pub oid: ObjectId,
    pub dkey: Key,
    pub iod: IoDesc,
    pub stripenum: u64,
    pub epoch: Epoch,
    pub map_version: u32,
    /// Replica data, one span per recx in `iod`
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EcReplicateResp {
    pub status: i32,
}

// =============================================================================
// Client Port
// =============================================================================

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn ec_aggregate(&self, ep: Endpoint, req: EcAggregateReq) -> Result<EcAggregateResp>;

    async fn ec_replicate(&self, ep: Endpoint, req: EcReplicateReq) -> Result<EcReplicateResp>;
}

// =============================================================================
// Receive-Side Installers
// =============================================================================

/// Peer handler for `EC_AGGREGATE`: write the received parity cell at the
/// request epoch and remove the stripe's replicas over `[0, epoch]`, using
/// the same widened range the leader deletes.
pub async fn install_parity_update(
    vos: &dyn VosStore,
    attr: &ClassAttr,
    req: &EcAggregateReq,
) -> Result<()> {
    let expected = attr.cell_bytes(req.rsize);
    if req.parity.len() != expected {
        return Err(Error::InvalidInput(format!(
            "parity bulk is {} bytes, cell is {expected}",
            req.parity.len()
        )));
    }
    let start = attr
        .stripe_start(req.stripenum)
        .checked_sub(req.prior_len)
        .ok_or_else(|| Error::InvalidInput("prior_len precedes the array".into()))?;
    let count = attr.stripe_recs() + req.prior_len - req.after_len;
    vos.array_remove(
        req.oid,
        EpochRange::up_to(req.epoch),
        &req.dkey,
        &req.akey,
        Extent::new(start, count),
    )
    .await?;
    vos.update(
        req.oid,
        req.epoch,
        &req.dkey,
        &req.akey,
        &[attr.parity_recx(req.stripenum)],
        req.rsize,
        &req.parity,
    )
    .await
}

/// Peer handler for `EC_REPLICATE`: write the shipped replica ranges at the
/// request epoch, then drop the stripe's parity cell over `[0, epoch]`.
pub async fn install_replicate(
    vos: &dyn VosStore,
    attr: &ClassAttr,
    req: &EcReplicateReq,
) -> Result<()> {
    let expected = req.iod.total_bytes();
    if req.data.len() != expected {
        return Err(Error::InvalidInput(format!(
            "replicate bulk is {} bytes, iod covers {expected}",
            req.data.len()
        )));
    }
    if !req.iod.recxs.is_empty() {
        vos.update(
            req.oid,
            req.epoch,
            &req.dkey,
            &req.iod.akey,
            &req.iod.recxs,
            req.iod.rsize,
            &req.data,
        )
        .await?;
    }
    vos.array_remove(
        req.oid,
        EpochRange::up_to(req.epoch),
        &req.dkey,
        &req.iod.akey,
        attr.parity_recx(req.stripenum),
    )
    .await
}
