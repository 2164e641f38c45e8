//! Shared harness for the end-to-end aggregation suites.
#![allow(dead_code)]
//!
//! Wires a leader store, a peer store, and a cluster-wide data view
//! through the loopback ports, so the two-party commit protocol runs
//! entirely in-process.

use std::sync::Arc;

use uuid::Uuid;

use ecagg::codec::Codec;
use ecagg::identity::StaticIdentity;
use ecagg::remote::ObjectLayout;
use ecagg::testkit::{LoopbackPeer, MemRemote};
use ecagg::types::{ClassAttr, Epoch, ObjectId, TargetId};
use ecagg::vos::VosStore;
use ecagg::vos_mem::MemVos;
use ecagg::{AggConfig, Aggregator, EpochRange, Extent, Key};

pub const MAP_VERSION: u32 = 7;

pub struct Cluster {
    pub leader: Arc<MemVos>,
    pub peer_store: Arc<MemVos>,
    pub data_view: Arc<MemVos>,
    pub peer_client: Arc<LoopbackPeer>,
    pub agg: Aggregator,
    pub attr: ClassAttr,
    pub oid: ObjectId,
    pub peer_oid: ObjectId,
    pub dkey: Key,
    pub akey: Key,
}

impl Cluster {
    /// Build a cluster for one EC class with `rsize == 1`. The leader is
    /// the last parity shard; the peer is the shard before it; ranks equal
    /// shard numbers.
    pub fn new(k: u16, p: u16, len: u32) -> Cluster {
        Self::build(k, p, len, true)
    }

    /// Cluster whose identity service denies leadership for every object.
    pub fn new_non_leader(k: u16, p: u16, len: u32) -> Cluster {
        Self::build(k, p, len, false)
    }

    fn build(k: u16, p: u16, len: u32, is_leader: bool) -> Cluster {
        let attr = ClassAttr::new(17, k, p, len);
        let total = (k + p) as u32;
        let leader_shard = total - 1;
        let oid = ObjectId::new(0xec0b, 0x1, leader_shard);
        let peer_oid = oid.with_shard(leader_shard - 1);

        let leader = Arc::new(MemVos::new());
        let peer_store = Arc::new(MemVos::new());
        let data_view = Arc::new(MemVos::new());
        leader.create_object(oid, Some(attr));
        peer_store.create_object(peer_oid, Some(attr));
        data_view.create_object(oid, Some(attr));

        let layout = ObjectLayout {
            shards: (0..total)
                .map(|shard| TargetId {
                    rank: shard,
                    tgt_idx: shard,
                })
                .collect(),
        };
        let remote = MemRemote::new(data_view.clone(), layout)
            .with_shard_store(leader_shard - 1, peer_store.clone());
        let mut identity = StaticIdentity::new(Uuid::new_v4(), Uuid::new_v4(), MAP_VERSION);
        if !is_leader {
            identity = identity.with_leaders([]);
        }
        let peer_client = Arc::new(LoopbackPeer::new(peer_store.clone()));

        let agg = Aggregator::new(
            leader.clone(),
            Arc::new(remote),
            Arc::new(identity),
            peer_client.clone(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            leader_shard,
            AggConfig::default(),
        )
        .unwrap();

        Cluster {
            leader,
            peer_store,
            data_view,
            peer_client,
            agg,
            attr,
            oid,
            peer_oid,
            dkey: Key::from("dkey0"),
            akey: Key::from("akey0"),
        }
    }

    pub fn write_leader(&self, epoch: Epoch, recx: Extent, data: &[u8]) {
        self.leader
            .write(self.oid, &self.dkey, &self.akey, epoch, recx, 1, data)
            .unwrap();
    }

    pub fn punch_leader(&self, epoch: Epoch, recx: Extent) {
        self.leader
            .punch(self.oid, &self.dkey, &self.akey, epoch, recx, 1)
            .unwrap();
    }

    pub fn write_data_view(&self, epoch: Epoch, recx: Extent, data: &[u8]) {
        self.data_view
            .write(self.oid, &self.dkey, &self.akey, epoch, recx, 1, data)
            .unwrap();
    }

    pub fn write_leader_parity(&self, epoch: Epoch, stripenum: u64, cell: &[u8]) {
        self.leader
            .write(
                self.oid,
                &self.dkey,
                &self.akey,
                epoch,
                self.attr.parity_recx(stripenum),
                1,
                cell,
            )
            .unwrap();
    }

    pub fn write_peer_parity(&self, epoch: Epoch, stripenum: u64, cell: &[u8]) {
        self.peer_store
            .write(
                self.peer_oid,
                &self.dkey,
                &self.akey,
                epoch,
                self.attr.parity_recx(stripenum),
                1,
                cell,
            )
            .unwrap();
    }

    /// Visible data extents on the leader as (index, count, epoch, hole).
    pub async fn leader_extents(&self) -> Vec<(u64, u64, Epoch, bool)> {
        self.leader
            .list_recx(
                self.oid,
                &self.dkey,
                &self.akey,
                EpochRange::new(0, Epoch::MAX),
            )
            .await
            .unwrap()
            .extents
            .iter()
            .map(|e| (e.recx.index, e.recx.count, e.epoch, e.is_hole))
            .collect()
    }

    pub async fn leader_parity_probe(&self, stripenum: u64) -> ecagg::ParityProbe {
        self.leader
            .probe_parity(
                self.oid,
                &self.dkey,
                &self.akey,
                self.attr.parity_recx(stripenum),
            )
            .await
            .unwrap()
    }

    pub async fn leader_parity_cell(&self, epoch: Epoch, stripenum: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.attr.cell_bytes(1)];
        self.leader
            .fetch(
                self.oid,
                epoch,
                &self.dkey,
                &self.akey,
                &[self.attr.parity_recx(stripenum)],
                1,
                &mut out,
            )
            .await
            .unwrap();
        out
    }

    pub async fn peer_parity_cell(&self, epoch: Epoch, stripenum: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.attr.cell_bytes(1)];
        self.peer_store
            .fetch(
                self.peer_oid,
                epoch,
                &self.dkey,
                &self.akey,
                &[self.attr.parity_recx(stripenum)],
                1,
                &mut out,
            )
            .await
            .unwrap();
        out
    }

    /// Parity rows over explicit cell contents, via the same codec tables
    /// the engine uses.
    pub fn expected_parity(&self, cells: &[&[u8]]) -> Vec<u8> {
        let codec = Codec::new(self.attr).unwrap();
        let cell_bytes = self.attr.cell_bytes(1);
        let mut parity = vec![0u8; cell_bytes * self.attr.p as usize];
        codec.encode(cell_bytes, cells, &mut parity).unwrap();
        parity
    }
}
