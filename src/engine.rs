//! Aggregation engine
//!
//! Walks every EC object this target leads through the nested
//! object → dkey → akey → extent iteration, buckets extents into stripes,
//! and on each stripe boundary probes the parity namespace, selects a
//! transform, runs it, and commits peer-then-local. Stripe failures are
//! logged and abandoned; object failures move on to the next object; the
//! first fatal error is reported once every object has been attempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::bufpool::StripeBuffers;
use crate::codec::{Codec, CodecRegistry};
use crate::config::AggConfig;
use crate::error::{Error, Result};
use crate::identity::{IdentityService, LeaderCheck};
use crate::remote::{peer_parity_target, RemoteObjectHandle, RemoteObjects};
use crate::rpc::{Endpoint, PeerClient};
use crate::stripe::{StripeState, STRIPE_NONE};
use crate::types::{ClassAttr, EpochRange, Extent, Key, ObjectId, TargetId};
use crate::vos::{ParityProbe, VosStore};

// =============================================================================
// Run Summary
// =============================================================================

/// Counters reported by one aggregation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggSummary {
    pub objects_seen: u64,
    pub objects_aggregated: u64,
    pub stripes_examined: u64,
    pub stripes_encoded: u64,
    pub stripes_updated: u64,
    pub stripes_recalced: u64,
    pub stripes_repaired: u64,
    pub stripes_skipped: u64,
    pub stripes_failed: u64,
}

/// What one stripe's processing did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StripeOutcome {
    Skipped,
    Encoded,
    Updated,
    Recalced,
    Repaired,
}

// =============================================================================
// Cancellation
// =============================================================================

/// Handle the outer supervisor uses to stop a run: the iterator observes
/// the flag at its next callback and surfaces a cancellation error.
/// In-flight peer RPCs and worker tasks finish; their results are
/// discarded.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Contexts
// =============================================================================

/// Handle uuids and map version captured once per run from the IV service.
pub(crate) struct RunCtx {
    pub pool_hdl: Uuid,
    pub cont_hdl: Uuid,
    pub map_version: u32,
}

/// Aggregation state for the object currently under iteration. Created
/// when the outer iterator admits an EC object this target leads, destroyed
/// when it leaves; the buffer set and remote handle are reused across the
/// object's stripes.
pub(crate) struct ObjectCtx {
    pub oid: ObjectId,
    pub attr: ClassAttr,
    pub codec: Arc<Codec>,
    pub rsize: u64,
    pub dkey: Key,
    pub akey: Key,
    pub stripe: StripeState,
    pub probe: ParityProbe,
    /// Taken while an offloaded worker owns the buffers
    pub bufs: Option<StripeBuffers>,
    pub handle: Option<Arc<dyn RemoteObjectHandle>>,
    pub peer: Option<TargetId>,
}

impl ObjectCtx {
    fn new(oid: ObjectId, attr: ClassAttr, codec: Arc<Codec>, align: usize) -> Result<Self> {
        Ok(Self {
            oid,
            attr,
            codec,
            rsize: 0,
            dkey: Key::default(),
            akey: Key::default(),
            stripe: StripeState::new(),
            probe: ParityProbe::absent(),
            bufs: Some(StripeBuffers::new(align)?),
            handle: None,
            peer: None,
        })
    }

    fn begin_akey(&mut self, akey: Key, rsize: u64) {
        self.akey = akey;
        self.rsize = rsize;
        self.stripe = StripeState::new();
    }
}

pub(crate) fn buffers_busy() -> Error {
    Error::Worker("stripe buffers still owned by a worker".into())
}

// =============================================================================
// Mode Selection
// =============================================================================

/// Transform chosen for a flushed stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StripeAction {
    Skip,
    Encode,
    Partial,
    HoleRepair,
}

/// Decide what to do with a flushed stripe given the parity probe result.
pub(crate) fn select_mode(
    stripe: &StripeState,
    probe: &ParityProbe,
    attr: &ClassAttr,
) -> StripeAction {
    let present = !probe.is_absent();
    if present && probe.epoch >= stripe.hi_epoch {
        // Parity already covers every held write; carry-over trimming is
        // skipped along with the commit.
        return StripeAction::Skip;
    }
    let filled = stripe.is_filled(attr);
    if (!present && filled && !stripe.has_holes)
        || (present && filled && stripe.all_newer_than(probe.epoch))
    {
        return StripeAction::Encode;
    }
    if !present {
        // Not enough replicas to form parity; the extents stay for a later
        // scan.
        return StripeAction::Skip;
    }
    if stripe.has_holes {
        return StripeAction::HoleRepair;
    }
    StripeAction::Partial
}

// =============================================================================
// Aggregator
// =============================================================================

/// Background EC aggregation engine for one container on one target.
pub struct Aggregator {
    pub(crate) vos: Arc<dyn VosStore>,
    pub(crate) remote: Arc<dyn RemoteObjects>,
    identity: Arc<dyn IdentityService>,
    pub(crate) peer: Arc<dyn PeerClient>,
    codecs: CodecRegistry,
    pub(crate) config: AggConfig,
    pub(crate) pool_uuid: Uuid,
    pub(crate) cont_uuid: Uuid,
    my_rank: u32,
    cancel: Arc<AtomicBool>,
}

impl Aggregator {
    pub fn new(
        vos: Arc<dyn VosStore>,
        remote: Arc<dyn RemoteObjects>,
        identity: Arc<dyn IdentityService>,
        peer: Arc<dyn PeerClient>,
        pool_uuid: Uuid,
        cont_uuid: Uuid,
        my_rank: u32,
        config: AggConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            vos,
            remote,
            identity,
            peer,
            codecs: CodecRegistry::new(),
            config,
            pool_uuid,
            cont_uuid,
            my_rank,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Aggregate every eligible stripe visible in the epoch window.
    ///
    /// Walks all EC objects this target leads; per-stripe and per-object
    /// failures are logged and skipped. Returns the first fatal error only
    /// after every object has been attempted.
    #[instrument(skip(self), fields(pool = %self.pool_uuid, cont = %self.cont_uuid))]
    pub async fn aggregate(&self, epr: EpochRange) -> Result<AggSummary> {
        if epr.lo > epr.hi {
            return Err(Error::InvalidInput(format!(
                "epoch range [{}, {}] is inverted",
                epr.lo, epr.hi
            )));
        }
        let handles = self.identity.srv_handles().await?;
        let run = RunCtx {
            pool_hdl: handles.pool_hdl,
            cont_hdl: handles.cont_hdl,
            map_version: self.identity.map_version(),
        };

        let mut summary = AggSummary::default();
        let mut first_fatal: Option<Error> = None;
        let mut credits: u32 = 0;

        for meta in self.vos.list_objects(epr).await? {
            self.check_cancel()?;
            summary.objects_seen += 1;
            let Some(attr) = meta.ec else {
                continue;
            };
            match self.identity.check_leader(meta.oid, run.map_version).await {
                Ok(LeaderCheck::Leader) => {}
                Ok(LeaderCheck::NotLeader) => continue,
                Err(e) => {
                    warn!(oid = %meta.oid, error = %e, "leader check failed");
                    continue;
                }
            }
            if attr.p > 2 {
                warn!(oid = %meta.oid, p = attr.p, "skipping object with unsupported parity count");
                continue;
            }
            let codec = match self.codecs.get(attr) {
                Ok(codec) => codec,
                Err(e) => {
                    error!(oid = %meta.oid, error = %e, "codec init failed");
                    if e.is_fatal() && first_fatal.is_none() {
                        first_fatal = Some(e);
                    }
                    continue;
                }
            };
            let mut ctx = match ObjectCtx::new(meta.oid, attr, codec, self.config.buffer_align) {
                Ok(ctx) => ctx,
                Err(e) => {
                    if first_fatal.is_none() {
                        first_fatal = Some(e);
                    }
                    continue;
                }
            };
            match self
                .aggregate_object(&run, &mut ctx, epr, &mut summary, &mut credits)
                .await
            {
                Ok(()) => summary.objects_aggregated += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!(oid = %meta.oid, error = %e, "object aggregation aborted");
                    if e.is_fatal() && first_fatal.is_none() {
                        first_fatal = Some(e);
                    }
                }
            }
        }

        match first_fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Nested dkey / akey / extent walk for one admitted object.
    async fn aggregate_object(
        &self,
        run: &RunCtx,
        ctx: &mut ObjectCtx,
        epr: EpochRange,
        summary: &mut AggSummary,
        credits: &mut u32,
    ) -> Result<()> {
        for dkey in self.vos.list_dkeys(ctx.oid, epr).await? {
            ctx.dkey = dkey.clone();
            for akey in self.vos.list_akeys(ctx.oid, &dkey, epr).await? {
                self.check_cancel()?;
                let list = self.vos.list_recx(ctx.oid, &dkey, &akey, epr).await?;
                if list.extents.is_empty() {
                    continue;
                }
                ctx.begin_akey(akey, list.rsize);

                for rec in list.extents {
                    self.check_cancel()?;
                    if rec.recx.is_parity() {
                        return Err(Error::ConsistencyViolated { recx: rec.recx });
                    }
                    let stripenum = ctx.attr.stripenum(rec.recx.index);
                    while !ctx.stripe.is_empty() && ctx.stripe.stripenum != stripenum {
                        self.flush_stripe(run, ctx, summary).await?;
                        *credits += 1;
                        if *credits >= self.config.credits_max {
                            tokio::task::yield_now().await;
                            *credits = 0;
                        }
                    }
                    if ctx.stripe.stripenum == STRIPE_NONE {
                        ctx.stripe.stripenum = stripenum;
                    }
                    ctx.stripe.push(&ctx.attr, rec);
                }

                if !ctx.stripe.is_empty() {
                    self.flush_stripe(run, ctx, summary).await?;
                }
                // A tail carried past the akey's last stripe stays behind
                // as a replica for a later scan.
                ctx.stripe = StripeState::new();
            }
        }
        Ok(())
    }

    /// Process the gathered stripe and fold the result into the summary.
    /// Transient errors abandon the stripe; object-level errors propagate.
    async fn flush_stripe(
        &self,
        run: &RunCtx,
        ctx: &mut ObjectCtx,
        summary: &mut AggSummary,
    ) -> Result<()> {
        summary.stripes_examined += 1;
        match self.process_stripe(run, ctx).await {
            Ok(StripeOutcome::Skipped) => summary.stripes_skipped += 1,
            Ok(StripeOutcome::Encoded) => summary.stripes_encoded += 1,
            Ok(StripeOutcome::Updated) => summary.stripes_updated += 1,
            Ok(StripeOutcome::Recalced) => summary.stripes_recalced += 1,
            Ok(StripeOutcome::Repaired) => summary.stripes_repaired += 1,
            Err(e) if e.aborts_object() => return Err(e),
            Err(e) => {
                warn!(
                    oid = %ctx.oid,
                    stripe = ctx.stripe.stripenum,
                    error = %e,
                    "abandoning stripe"
                );
                summary.stripes_failed += 1;
            }
        }
        ctx.stripe.close(&ctx.attr);
        Ok(())
    }

    /// Probe parity, choose a transform, run it, and commit.
    async fn process_stripe(&self, run: &RunCtx, ctx: &mut ObjectCtx) -> Result<StripeOutcome> {
        let stripenum = ctx.stripe.stripenum;
        let probe = self
            .vos
            .probe_parity(ctx.oid, &ctx.dkey, &ctx.akey, ctx.attr.parity_recx(stripenum))
            .await?;
        ctx.probe = probe;
        debug!(
            oid = %ctx.oid,
            stripe = stripenum,
            parity_epoch = probe.epoch,
            hi_epoch = ctx.stripe.hi_epoch,
            fill = ctx.stripe.fill,
            "stripe flush"
        );

        match select_mode(&ctx.stripe, &probe, &ctx.attr) {
            StripeAction::Skip => Ok(StripeOutcome::Skipped),
            StripeAction::Encode => {
                self.encode_path(ctx).await?;
                self.commit_stripe(run, ctx).await?;
                Ok(StripeOutcome::Encoded)
            }
            StripeAction::Partial => {
                let recalc = self.partial_path(ctx).await?;
                self.commit_stripe(run, ctx).await?;
                Ok(if recalc {
                    StripeOutcome::Recalced
                } else {
                    StripeOutcome::Updated
                })
            }
            StripeAction::HoleRepair => {
                self.hole_repair_path(run, ctx).await?;
                Ok(StripeOutcome::Repaired)
            }
        }
    }

    /// Peer-then-local commit for the encode and partial paths. The peer's
    /// ack gates every local mutation.
    async fn commit_stripe(&self, run: &RunCtx, ctx: &mut ObjectCtx) -> Result<()> {
        ctx.stripe.suffix_ext = ctx.stripe.carry_under(&ctx.attr);
        if ctx.attr.p > 1 {
            self.peer_update(run, ctx).await?;
        }
        self.commit_local(ctx).await
    }

    /// Ship the peer's parity cell with the stripe coordinates.
    async fn peer_update(&self, run: &RunCtx, ctx: &mut ObjectCtx) -> Result<()> {
        self.ensure_handle(ctx).await?;
        let peer = ctx
            .peer
            .ok_or_else(|| Error::InvalidInput("peer target unresolved".into()))?;
        let cell_bytes = ctx.attr.cell_bytes(ctx.rsize);
        let bufs = ctx.bufs.as_ref().ok_or_else(buffers_busy)?;
        let req = crate::rpc::EcAggregateReq {
            pool_uuid: self.pool_uuid,
            pool_hdl_uuid: run.pool_hdl,
            cont_uuid: self.cont_uuid,
            cont_hdl_uuid: run.cont_hdl,
            oid: peer_shard_oid(ctx.oid)?,
            dkey: ctx.dkey.clone(),
            akey: ctx.akey.clone(),
            rsize: ctx.rsize,
            epoch: ctx.stripe.hi_epoch,
            stripenum: ctx.stripe.stripenum,
            map_version: run.map_version,
            prior_len: ctx.stripe.prefix_ext,
            after_len: ctx.stripe.suffix_ext,
            parity: bytes::Bytes::copy_from_slice(&bufs.parity[cell_bytes..2 * cell_bytes]),
        };
        let resp = self.peer.ec_aggregate(Endpoint::for_peer(peer), req).await?;
        if resp.status != 0 {
            return Err(Error::PeerRpc(format!(
                "peer aggregate returned status {}",
                resp.status
            )));
        }
        Ok(())
    }

    /// Local commit: retire the stripe's replicas and write the leader
    /// parity cell, both under the stripe's epoch high-water.
    async fn commit_local(&self, ctx: &mut ObjectCtx) -> Result<()> {
        let attr = ctx.attr;
        let stripe = &ctx.stripe;
        let start = attr
            .stripe_start(stripe.stripenum)
            .checked_sub(stripe.prefix_ext)
            .ok_or_else(|| Error::InvalidInput("prefix extends before the array".into()))?;
        let count = attr.stripe_recs() + stripe.prefix_ext - stripe.suffix_ext;
        self.vos
            .array_remove(
                ctx.oid,
                EpochRange::up_to(stripe.hi_epoch),
                &ctx.dkey,
                &ctx.akey,
                Extent::new(start, count),
            )
            .await?;
        let cell_bytes = attr.cell_bytes(ctx.rsize);
        let bufs = ctx.bufs.as_ref().ok_or_else(buffers_busy)?;
        self.vos
            .update(
                ctx.oid,
                stripe.hi_epoch,
                &ctx.dkey,
                &ctx.akey,
                &[attr.parity_recx(stripe.stripenum)],
                ctx.rsize,
                &bufs.parity[..cell_bytes],
            )
            .await
    }

    /// Lazily open the remote handle and derive the peer parity target from
    /// the object layout.
    pub(crate) async fn ensure_handle(&self, ctx: &mut ObjectCtx) -> Result<()> {
        if ctx.handle.is_some() {
            return Ok(());
        }
        let handle = self.remote.open(ctx.oid).await?;
        let layout = handle.layout().await?;
        ctx.peer = Some(peer_parity_target(&layout, self.my_rank)?);
        ctx.handle = Some(handle);
        Ok(())
    }
}

/// The peer parity shard addresses the object one shard below the leader.
pub(crate) fn peer_shard_oid(oid: ObjectId) -> Result<ObjectId> {
    oid.shard
        .checked_sub(1)
        .map(|shard| oid.with_shard(shard))
        .ok_or_else(|| Error::InvalidInput(format!("leader shard 0 of {oid} has no peer")))
}

// =============================================================================
// Tests
// =============================================================================
