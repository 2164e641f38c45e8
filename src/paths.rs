//! Stripe transform paths: encode, partial update / recalc, hole repair
//!
//! Each path fills the object context's working buffers with cooperative
//! I/O (local VOS reads, remote object reads), then offloads the
//! Galois-field arithmetic to a blocking worker. The buffers travel into
//! the worker by value and come back with its result, so the join is the
//! one-shot completion handle and nothing else can touch them mid-flight.

use bytes::Bytes;
use tokio::task;

use crate::codec::xor_diff;
use crate::engine::{buffers_busy, peer_shard_oid, Aggregator, ObjectCtx, RunCtx};
use crate::error::{Error, Result};
use crate::rpc::{EcReplicateReq, Endpoint, IoDesc};
use crate::stripe::CellBitmap;
use crate::types::{Epoch, EpochRange, Extent};

impl Aggregator {
    // =========================================================================
    // Encode Path
    // =========================================================================

    /// Full-stripe encode: fetch the whole stripe of replicas locally and
    /// compute all parity cells from scratch.
    pub(crate) async fn encode_path(&self, ctx: &mut ObjectCtx) -> Result<()> {
        let attr = ctx.attr;
        let rsize = ctx.rsize;
        let stripenum = ctx.stripe.stripenum;
        let hi_epoch = ctx.stripe.hi_epoch;
        let stripe_bytes = attr.stripe_bytes(rsize);

        {
            let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
            bufs.ensure(&attr, rsize)?;
            self.vos
                .fetch(
                    ctx.oid,
                    hi_epoch,
                    &ctx.dkey,
                    &ctx.akey,
                    &[Extent::new(attr.stripe_start(stripenum), attr.stripe_recs())],
                    rsize,
                    &mut bufs.data[..stripe_bytes],
                )
                .await?;
        }

        let codec = ctx.codec.clone();
        let cell_bytes = attr.cell_bytes(rsize);
        let k = attr.k as usize;
        let p = attr.p as usize;
        let mut bufs = ctx.bufs.take().ok_or_else(buffers_busy)?;
        let (bufs, res) = task::spawn_blocking(move || {
            let res = {
                let data = bufs.data.as_slice();
                let cells: Vec<&[u8]> = data[..k * cell_bytes].chunks_exact(cell_bytes).collect();
                codec.encode(cell_bytes, &cells, &mut bufs.parity[..p * cell_bytes])
            };
            (bufs, res)
        })
        .await
        .map_err(|e| Error::Worker(format!("encode offload died: {e}")))?;
        ctx.bufs = Some(bufs);
        res
    }

    // =========================================================================
    // Partial-Update Path
    // =========================================================================

    /// Partial stripe transform. Classifies the stripe's cells, then either
    /// folds per-cell XOR diffs into the existing parity or re-encodes it
    /// entirely when most cells are fully replicated. Returns true when the
    /// recalc branch ran.
    pub(crate) async fn partial_path(&self, ctx: &mut ObjectCtx) -> Result<bool> {
        let attr = ctx.attr;
        if attr.p > 2 {
            return Err(Error::Unsupported { p: attr.p });
        }
        let rsize = ctx.rsize;
        let hi_epoch = ctx.stripe.hi_epoch;
        let parity_epoch = ctx.probe.epoch;
        let k = attr.k as usize;

        let (full_map, full_cnt) = ctx.stripe.full_cell_bitmap(&attr);
        let recalc = full_cnt > k / 2;
        let (local_map, local_cnt, remote_map, remote_cnt, remote_epoch) = if recalc {
            // Re-encode: fully replicated cells come from local VOS, the
            // rest from the data shards, all at the stripe high-water.
            let missing = full_map.inverted(k);
            (full_map, full_cnt, missing, k - full_cnt, hi_epoch)
        } else {
            // Incremental: pre-parity state of every touched cell comes
            // from the data shards at the parity epoch.
            let (overlap_map, overlap_cnt) = ctx.stripe.overlap_cell_bitmap(&attr);
            (overlap_map, overlap_cnt, overlap_map, overlap_cnt, parity_epoch)
        };

        {
            let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
            bufs.ensure(&attr, rsize)?;
        }
        self.fetch_local_cells(ctx, &local_map, local_cnt).await?;
        if !recalc {
            self.fetch_local_parity(ctx).await?;
        }
        self.fetch_remote_cells(ctx, &remote_map, remote_cnt, remote_epoch)
            .await?;
        if attr.p == 2 {
            // Carry the peer's cell in memory so the update can be shipped
            // back after the fold; the recalc branch overwrites it.
            self.fetch_peer_parity(ctx).await?;
        }

        let codec = ctx.codec.clone();
        let cell_bytes = attr.cell_bytes(rsize);
        let p = attr.p as usize;
        let mut bufs = ctx.bufs.take().ok_or_else(buffers_busy)?;
        let (bufs, res) = task::spawn_blocking(move || {
            let res = (|| -> Result<()> {
                if recalc {
                    let local = bufs.data.as_slice();
                    let remote = bufs.old_data.as_slice();
                    let mut cells: Vec<&[u8]> = Vec::with_capacity(k);
                    let (mut l, mut r) = (0usize, 0usize);
                    for cell in 0..k {
                        if local_map.get(cell) {
                            cells.push(&local[l * cell_bytes..(l + 1) * cell_bytes]);
                            l += 1;
                        } else {
                            cells.push(&remote[r * cell_bytes..(r + 1) * cell_bytes]);
                            r += 1;
                        }
                    }
                    codec.encode(cell_bytes, &cells, &mut bufs.parity[..p * cell_bytes])
                } else {
                    let mut slot = 0usize;
                    for cell in 0..k {
                        if !local_map.get(cell) {
                            continue;
                        }
                        xor_diff(
                            &bufs.old_data[slot * cell_bytes..(slot + 1) * cell_bytes],
                            &bufs.data[slot * cell_bytes..(slot + 1) * cell_bytes],
                            &mut bufs.diff[..cell_bytes],
                        );
                        codec.encode_update(
                            cell_bytes,
                            cell,
                            &bufs.diff[..cell_bytes],
                            &mut bufs.parity[..p * cell_bytes],
                        )?;
                        slot += 1;
                    }
                    Ok(())
                }
            })();
            (bufs, res)
        })
        .await
        .map_err(|e| Error::Worker(format!("partial-update offload died: {e}")))?;
        ctx.bufs = Some(bufs);
        res?;
        Ok(recalc)
    }

    /// Fetch the bitmap's cells from local VOS at the stripe high-water,
    /// packed tightly into the data buffer. Records no replica covers read
    /// as zeros.
    async fn fetch_local_cells(
        &self,
        ctx: &mut ObjectCtx,
        map: &CellBitmap,
        count: usize,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let attr = ctx.attr;
        let recxs = cell_recxs(ctx, map);
        let need = count * attr.cell_bytes(ctx.rsize);
        let hi_epoch = ctx.stripe.hi_epoch;
        let oid = ctx.oid;
        let rsize = ctx.rsize;
        let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
        self.vos
            .fetch(
                oid,
                hi_epoch,
                &ctx.dkey,
                &ctx.akey,
                &recxs,
                rsize,
                &mut bufs.data[..need],
            )
            .await
    }

    /// Fetch the leader's current parity cell into parity row 0 for the
    /// incremental fold.
    async fn fetch_local_parity(&self, ctx: &mut ObjectCtx) -> Result<()> {
        let attr = ctx.attr;
        let recx = attr.parity_recx(ctx.stripe.stripenum);
        let cell_bytes = attr.cell_bytes(ctx.rsize);
        let hi_epoch = ctx.stripe.hi_epoch;
        let oid = ctx.oid;
        let rsize = ctx.rsize;
        let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
        self.vos
            .fetch(
                oid,
                hi_epoch,
                &ctx.dkey,
                &ctx.akey,
                &[recx],
                rsize,
                &mut bufs.parity[..cell_bytes],
            )
            .await
    }

    /// Fetch the bitmap's cells through the object-remote path at `epoch`,
    /// packed tightly into the old-data buffer.
    async fn fetch_remote_cells(
        &self,
        ctx: &mut ObjectCtx,
        map: &CellBitmap,
        count: usize,
        epoch: Epoch,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.ensure_handle(ctx).await?;
        let attr = ctx.attr;
        let recxs = cell_recxs(ctx, map);
        let need = count * attr.cell_bytes(ctx.rsize);
        let rsize = ctx.rsize;
        let handle = ctx
            .handle
            .clone()
            .ok_or_else(|| Error::InvalidInput("remote handle unresolved".into()))?;
        let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
        handle
            .fetch(
                epoch,
                &ctx.dkey,
                &ctx.akey,
                &recxs,
                rsize,
                &mut bufs.old_data[..need],
                None,
            )
            .await
    }

    /// Fetch the peer's parity cell (p == 2) into parity row 1 at the
    /// parity extent's epoch, pinned to the peer parity shard.
    async fn fetch_peer_parity(&self, ctx: &mut ObjectCtx) -> Result<()> {
        self.ensure_handle(ctx).await?;
        let attr = ctx.attr;
        let pshard = peer_shard_oid(ctx.oid)?.shard;
        if pshard < attr.k as u32 {
            return Err(Error::InvalidInput(format!(
                "shard {pshard} is not a parity shard"
            )));
        }
        let recx = attr.parity_recx(ctx.stripe.stripenum);
        let cell_bytes = attr.cell_bytes(ctx.rsize);
        let parity_epoch = ctx.probe.epoch;
        let rsize = ctx.rsize;
        let handle = ctx
            .handle
            .clone()
            .ok_or_else(|| Error::InvalidInput("remote handle unresolved".into()))?;
        let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
        handle
            .fetch(
                parity_epoch,
                &ctx.dkey,
                &ctx.akey,
                &[recx],
                rsize,
                &mut bufs.parity[cell_bytes..2 * cell_bytes],
                Some(pshard),
            )
            .await
    }

    // =========================================================================
    // Hole-Repair Path
    // =========================================================================

    /// Downgrade a holed stripe from parity-coded to replicated: gather the
    /// non-hole replica ranges, ship them to the peer, install them locally,
    /// and drop the parity on both sides.
    pub(crate) async fn hole_repair_path(&self, run: &RunCtx, ctx: &mut ObjectCtx) -> Result<()> {
        let attr = ctx.attr;
        let rsize = ctx.rsize;
        let stripenum = ctx.stripe.stripenum;
        let hi_epoch = ctx.stripe.hi_epoch;
        self.ensure_handle(ctx).await?;
        let peer = ctx
            .peer
            .ok_or_else(|| Error::InvalidInput("peer target unresolved".into()))?;

        let ranges = ctx.stripe.nonhole_ranges(&attr);
        let total: usize = ranges.iter().map(|r| (r.count * rsize) as usize).sum();

        if !ranges.is_empty() {
            let handle = ctx
                .handle
                .clone()
                .ok_or_else(|| Error::InvalidInput("remote handle unresolved".into()))?;
            let bufs = ctx.bufs.as_mut().ok_or_else(buffers_busy)?;
            bufs.ensure(&attr, rsize)?;
            handle
                .fetch(
                    hi_epoch,
                    &ctx.dkey,
                    &ctx.akey,
                    &ranges,
                    rsize,
                    &mut bufs.data[..total],
                    None,
                )
                .await?;
        }

        let data = {
            let bufs = ctx.bufs.as_ref().ok_or_else(buffers_busy)?;
            Bytes::copy_from_slice(&bufs.data[..total])
        };
        let req = EcReplicateReq {
            pool_uuid: self.pool_uuid,
            pool_hdl_uuid: run.pool_hdl,
            cont_uuid: self.cont_uuid,
            cont_hdl_uuid: run.cont_hdl,
            oid: peer_shard_oid(ctx.oid)?,
            dkey: ctx.dkey.clone(),
            iod: IoDesc {
                akey: ctx.akey.clone(),
                rsize,
                recxs: ranges.clone(),
            },
            stripenum,
            epoch: hi_epoch,
            map_version: run.map_version,
            data,
        };
        let resp = self.peer.ec_replicate(Endpoint::for_peer(peer), req).await?;
        if resp.status != 0 {
            return Err(Error::PeerRpc(format!(
                "peer replicate returned status {}",
                resp.status
            )));
        }

        if !ranges.is_empty() {
            let bufs = ctx.bufs.as_ref().ok_or_else(buffers_busy)?;
            self.vos
                .update(
                    ctx.oid,
                    hi_epoch,
                    &ctx.dkey,
                    &ctx.akey,
                    &ranges,
                    rsize,
                    &bufs.data[..total],
                )
                .await?;
        }
        self.vos
            .array_remove(
                ctx.oid,
                EpochRange::up_to(hi_epoch),
                &ctx.dkey,
                &ctx.akey,
                attr.parity_recx(stripenum),
            )
            .await
    }
}

/// Absolute cell extents for the bitmap's set cells, in cell order.
fn cell_recxs(ctx: &ObjectCtx, map: &CellBitmap) -> Vec<Extent> {
    let attr = &ctx.attr;
    let stripenum = ctx.stripe.stripenum;
    map.iter_set(attr.k as usize)
        .map(|cell| Extent::new(attr.cell_start(stripenum, cell as u16), attr.cell_recs()))
        .collect()
}
