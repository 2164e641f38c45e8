//! Loopback wiring of the collaborator ports
//!
//! Binds the remote-object and peer-RPC ports to in-memory stores so the
//! whole two-party protocol runs in-process. The integration suites build a
//! leader store, a peer store, and a cluster-wide data view, then drive the
//! engine end to end against them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::remote::{ObjectLayout, RemoteObjectHandle, RemoteObjects};
use crate::rpc::{
    install_parity_update, install_replicate, EcAggregateReq, EcAggregateResp, EcReplicateReq,
    EcReplicateResp, Endpoint, PeerClient,
};
use crate::types::{Epoch, Extent, Key, ObjectId};
use crate::vos::VosStore;
use crate::vos_mem::MemVos;

// =============================================================================
// Remote Objects over MemVos
// =============================================================================

/// [`RemoteObjects`] backed by in-memory stores: un-pinned fetches read the
/// cluster data view, shard-pinned fetches read that shard's own store
/// under the shard's oid.
pub struct MemRemote {
    data_view: Arc<MemVos>,
    shard_stores: HashMap<u32, Arc<MemVos>>,
    layout: ObjectLayout,
}

impl MemRemote {
    pub fn new(data_view: Arc<MemVos>, layout: ObjectLayout) -> Self {
        Self {
            data_view,
            shard_stores: HashMap::new(),
            layout,
        }
    }

    pub fn with_shard_store(mut self, shard: u32, store: Arc<MemVos>) -> Self {
        self.shard_stores.insert(shard, store);
        self
    }
}

#[async_trait]
impl RemoteObjects for MemRemote {
    async fn open(&self, oid: ObjectId) -> Result<Arc<dyn RemoteObjectHandle>> {
        Ok(Arc::new(MemRemoteHandle {
            oid,
            data_view: self.data_view.clone(),
            shard_stores: self.shard_stores.clone(),
            layout: self.layout.clone(),
        }))
    }
}

struct MemRemoteHandle {
    oid: ObjectId,
    data_view: Arc<MemVos>,
    shard_stores: HashMap<u32, Arc<MemVos>>,
    layout: ObjectLayout,
}

#[async_trait]
impl RemoteObjectHandle for MemRemoteHandle {
    async fn fetch(
        &self,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        out: &mut [u8],
        shard: Option<u32>,
    ) -> Result<()> {
        match shard {
            Some(s) => {
                let store = self
                    .shard_stores
                    .get(&s)
                    .ok_or_else(|| Error::Fetch(format!("no store for shard {s}")))?;
                store
                    .fetch(self.oid.with_shard(s), epoch, dkey, akey, recxs, rsize, out)
                    .await
            }
            None => {
                self.data_view
                    .fetch(self.oid, epoch, dkey, akey, recxs, rsize, out)
                    .await
            }
        }
    }

    async fn layout(&self) -> Result<ObjectLayout> {
        Ok(self.layout.clone())
    }
}

// =============================================================================
// Loopback Peer
// =============================================================================

/// [`PeerClient`] that runs the receive-side installers directly against
/// the peer's store, recording every request for assertions. `fail_next`
/// makes the following call return a transport error without touching the
/// store.
pub struct LoopbackPeer {
    vos: Arc<MemVos>,
    fail_next: AtomicBool,
    aggregates: Mutex<Vec<(Endpoint, EcAggregateReq)>>,
    replicates: Mutex<Vec<(Endpoint, EcReplicateReq)>>,
}

impl LoopbackPeer {
    pub fn new(vos: Arc<MemVos>) -> Self {
        Self {
            vos,
            fail_next: AtomicBool::new(false),
            aggregates: Mutex::new(Vec::new()),
            replicates: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn aggregate_reqs(&self) -> Vec<(Endpoint, EcAggregateReq)> {
        self.aggregates.lock().clone()
    }

    pub fn replicate_reqs(&self) -> Vec<(Endpoint, EcReplicateReq)> {
        self.replicates.lock().clone()
    }
}

#[async_trait]
impl PeerClient for LoopbackPeer {
    async fn ec_aggregate(&self, ep: Endpoint, req: EcAggregateReq) -> Result<EcAggregateResp> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::PeerRpc("injected transport failure".into()));
        }
        let attr = self
            .vos
            .object_class(req.oid)
            .ok_or_else(|| Error::PeerRpc(format!("peer has no object {}", req.oid)))?;
        install_parity_update(self.vos.as_ref(), &attr, &req).await?;
        self.aggregates.lock().push((ep, req));
        Ok(EcAggregateResp { status: 0 })
    }

    async fn ec_replicate(&self, ep: Endpoint, req: EcReplicateReq) -> Result<EcReplicateResp> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::PeerRpc("injected transport failure".into()));
        }
        let attr = self
            .vos
            .object_class(req.oid)
            .ok_or_else(|| Error::PeerRpc(format!("peer has no object {}", req.oid)))?;
        install_replicate(self.vos.as_ref(), &attr, &req).await?;
        self.replicates.lock().push((ep, req));
        Ok(EcReplicateResp { status: 0 })
    }
}
