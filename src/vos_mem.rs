//! In-memory versioned object store
//!
//! Reference [`VosStore`] backend: an epoch-ordered write log per
//! (object, dkey, akey) array with overlay resolution at read time. Newer
//! writes shadow older ones record by record; the visible-extent iterator
//! and both fetch paths read through the same resolution, so the engine
//! sees exactly the semantics the production store provides. Used by the
//! unit and integration suites, and suitable for embedding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{
    ClassAttr, Epoch, EpochRange, Extent, ExtentRec, Key, ObjectId, ObjectMeta, EPOCH_MAX,
};
use crate::vos::{ParityProbe, RecxList, VosStore};

// =============================================================================
// Write Log
// =============================================================================

#[derive(Debug, Clone)]
struct WriteRec {
    recx: Extent,
    epoch: Epoch,
    hole: bool,
    /// `count * rsize` bytes; empty for holes
    data: Vec<u8>,
    /// Tie-break between writes at the same epoch: later wins
    seq: u64,
}

#[derive(Debug, Default)]
struct ArrayRec {
    rsize: u64,
    writes: Vec<WriteRec>,
}

#[derive(Debug)]
struct ObjectRec {
    ec: Option<ClassAttr>,
    arrays: BTreeMap<Key, BTreeMap<Key, ArrayRec>>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectId, ObjectRec>,
    next_seq: u64,
}

/// A resolved visible span backed by one winning write.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    index: u64,
    count: u64,
    epoch: Epoch,
    hole: bool,
    /// Raw start index of the winning write, for byte offsets
    src_index: u64,
    src_pos: usize,
}

/// Record-by-record overlay resolution over one namespace of the write log.
/// Returns index-ordered fragments; adjacent spans from the same write are
/// merged back together.
fn resolve(writes: &[WriteRec], epr: EpochRange, parity_ns: bool) -> Vec<Fragment> {
    let live: Vec<(usize, &WriteRec)> = writes
        .iter()
        .enumerate()
        .filter(|(_, w)| w.recx.is_parity() == parity_ns && epr.contains(w.epoch))
        .collect();
    if live.is_empty() {
        return Vec::new();
    }

    let mut bounds: Vec<u64> = live
        .iter()
        .flat_map(|(_, w)| [w.recx.index, w.recx.end()])
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    let mut frags: Vec<Fragment> = Vec::new();
    for pair in bounds.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        let winner = live
            .iter()
            .filter(|(_, w)| w.recx.index <= lo && lo < w.recx.end())
            .max_by_key(|(pos, w)| (w.epoch, w.seq, *pos));
        let Some(&(pos, w)) = winner else { continue };
        match frags.last_mut() {
            Some(last) if last.src_pos == pos && last.index + last.count == lo => {
                last.count += hi - lo;
            }
            _ => frags.push(Fragment {
                index: lo,
                count: hi - lo,
                epoch: w.epoch,
                hole: w.hole,
                src_index: w.recx.index,
                src_pos: pos,
            }),
        }
    }
    frags
}

// =============================================================================
// MemVos
// =============================================================================

/// In-memory [`VosStore`] implementation.
#[derive(Debug, Default)]
pub struct MemVos {
    state: RwLock<State>,
}

impl MemVos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object, optionally EC-coded.
    pub fn create_object(&self, oid: ObjectId, ec: Option<ClassAttr>) {
        let mut state = self.state.write();
        state.objects.entry(oid).or_insert(ObjectRec {
            ec,
            arrays: BTreeMap::new(),
        });
    }

    fn append(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        epoch: Epoch,
        recx: Extent,
        rsize: u64,
        hole: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        let object = state
            .objects
            .get_mut(&oid)
            .ok_or_else(|| Error::Store(format!("unknown object {oid}")))?;
        let array = object
            .arrays
            .entry(dkey.clone())
            .or_default()
            .entry(akey.clone())
            .or_default();
        if array.rsize == 0 {
            array.rsize = rsize;
        } else if array.rsize != rsize {
            return Err(Error::Store(format!(
                "record size mismatch: array has {}, write has {rsize}",
                array.rsize
            )));
        }
        array.writes.push(WriteRec {
            recx,
            epoch,
            hole,
            data,
            seq,
        });
        Ok(())
    }

    /// EC class an object was registered with, if any.
    pub fn object_class(&self, oid: ObjectId) -> Option<ClassAttr> {
        self.state.read().objects.get(&oid).and_then(|o| o.ec)
    }

    /// Seed one replica or parity extent (test/builder API).
    pub fn write(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        epoch: Epoch,
        recx: Extent,
        rsize: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 != recx.count * rsize {
            return Err(Error::Store(format!(
                "write of {} bytes does not match {} records of {} bytes",
                data.len(),
                recx.count,
                rsize
            )));
        }
        self.append(oid, dkey, akey, epoch, recx, rsize, false, data.to_vec())
    }

    /// Punch a record range (test/builder API).
    pub fn punch(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        epoch: Epoch,
        recx: Extent,
        rsize: u64,
    ) -> Result<()> {
        self.append(oid, dkey, akey, epoch, recx, rsize, true, Vec::new())
    }

    fn with_array<T>(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        f: impl FnOnce(&ArrayRec) -> T,
    ) -> Result<T> {
        let state = self.state.read();
        let array = state
            .objects
            .get(&oid)
            .and_then(|o| o.arrays.get(dkey))
            .and_then(|d| d.get(akey))
            .ok_or_else(|| Error::Fetch(format!("no array for {oid}")))?;
        Ok(f(array))
    }

    /// Like `with_array`, but an array that was never written resolves to
    /// the default instead of an error.
    fn with_array_or<T>(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        default: T,
        f: impl FnOnce(&ArrayRec) -> T,
    ) -> T {
        let state = self.state.read();
        match state
            .objects
            .get(&oid)
            .and_then(|o| o.arrays.get(dkey))
            .and_then(|d| d.get(akey))
        {
            Some(array) => f(array),
            None => default,
        }
    }

    fn array_has_data_in(array: &ArrayRec, epr: EpochRange) -> bool {
        array
            .writes
            .iter()
            .any(|w| !w.recx.is_parity() && epr.contains(w.epoch))
    }
}

#[async_trait]
impl VosStore for MemVos {
    async fn list_objects(&self, epr: EpochRange) -> Result<Vec<ObjectMeta>> {
        let state = self.state.read();
        Ok(state
            .objects
            .iter()
            .filter(|(_, o)| {
                o.arrays
                    .values()
                    .flat_map(|d| d.values())
                    .any(|a| Self::array_has_data_in(a, epr))
            })
            .map(|(&oid, o)| ObjectMeta { oid, ec: o.ec })
            .collect())
    }

    async fn list_dkeys(&self, oid: ObjectId, epr: EpochRange) -> Result<Vec<Key>> {
        let state = self.state.read();
        let object = state
            .objects
            .get(&oid)
            .ok_or_else(|| Error::Fetch(format!("unknown object {oid}")))?;
        Ok(object
            .arrays
            .iter()
            .filter(|(_, akeys)| akeys.values().any(|a| Self::array_has_data_in(a, epr)))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn list_akeys(&self, oid: ObjectId, dkey: &Key, epr: EpochRange) -> Result<Vec<Key>> {
        let state = self.state.read();
        let object = state
            .objects
            .get(&oid)
            .ok_or_else(|| Error::Fetch(format!("unknown object {oid}")))?;
        Ok(object
            .arrays
            .get(dkey)
            .map(|akeys| {
                akeys
                    .iter()
                    .filter(|(_, a)| Self::array_has_data_in(a, epr))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_recx(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        epr: EpochRange,
    ) -> Result<RecxList> {
        Ok(self.with_array_or(
            oid,
            dkey,
            akey,
            RecxList {
                rsize: 0,
                extents: Vec::new(),
            },
            |array| RecxList {
                rsize: array.rsize,
                extents: resolve(&array.writes, epr, false)
                    .into_iter()
                    .map(|f| ExtentRec {
                        recx: Extent::new(f.index, f.count),
                        epoch: f.epoch,
                        is_hole: f.hole,
                    })
                    .collect(),
            },
        ))
    }

    async fn probe_parity(
        &self,
        oid: ObjectId,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<ParityProbe> {
        Ok(self.with_array_or(oid, dkey, akey, ParityProbe::absent(), |array| {
            let frags = resolve(&array.writes, EpochRange::up_to(EPOCH_MAX), true);
            for f in frags {
                let frag = Extent::new(f.index, f.count);
                if frag.overlaps(&recx) {
                    return ParityProbe {
                        epoch: f.epoch,
                        recx: Extent::new(f.src_index, array.writes[f.src_pos].recx.count),
                    };
                }
            }
            ParityProbe::absent()
        }))
    }

    async fn fetch(
        &self,
        oid: ObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        out: &mut [u8],
    ) -> Result<()> {
        self.with_array(oid, dkey, akey, |array| {
            let mut off = 0usize;
            for recx in recxs {
                let span = (recx.count * rsize) as usize;
                let dst = &mut out[off..off + span];
                dst.fill(0);
                let frags = resolve(
                    &array.writes,
                    EpochRange::up_to(epoch),
                    recx.is_parity(),
                );
                for f in frags {
                    if f.hole {
                        continue;
                    }
                    let lo = f.index.max(recx.index);
                    let hi = (f.index + f.count).min(recx.end());
                    if lo >= hi {
                        continue;
                    }
                    let src = &array.writes[f.src_pos].data;
                    let src_off = ((lo - f.src_index) * rsize) as usize;
                    let dst_off = ((lo - recx.index) * rsize) as usize;
                    let bytes = ((hi - lo) * rsize) as usize;
                    dst[dst_off..dst_off + bytes]
                        .copy_from_slice(&src[src_off..src_off + bytes]);
                }
                off += span;
            }
        })
    }

    async fn update(
        &self,
        oid: ObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        rsize: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut off = 0usize;
        for recx in recxs {
            let span = (recx.count * rsize) as usize;
            if off + span > data.len() {
                return Err(Error::Store("update data shorter than extents".into()));
            }
            self.append(
                oid,
                dkey,
                akey,
                epoch,
                *recx,
                rsize,
                false,
                data[off..off + span].to_vec(),
            )?;
            off += span;
        }
        Ok(())
    }

    async fn array_remove(
        &self,
        oid: ObjectId,
        epr: EpochRange,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<()> {
        let mut state = self.state.write();
        // Removing from an array that was never written is a no-op.
        let Some(array) = state
            .objects
            .get_mut(&oid)
            .and_then(|o| o.arrays.get_mut(dkey))
            .and_then(|d| d.get_mut(akey))
        else {
            return Ok(());
        };
        let rsize = array.rsize;
        let mut kept: Vec<WriteRec> = Vec::with_capacity(array.writes.len());
        for w in array.writes.drain(..) {
            let same_ns = w.recx.is_parity() == recx.is_parity();
            if !same_ns || !epr.contains(w.epoch) || !w.recx.overlaps(&recx) {
                kept.push(w);
                continue;
            }
            // Left remainder before the removed range.
            if w.recx.index < recx.index {
                let count = recx.index - w.recx.index;
                let bytes = (count * rsize) as usize;
                kept.push(WriteRec {
                    recx: Extent::new(w.recx.index, count),
                    epoch: w.epoch,
                    hole: w.hole,
                    data: if w.hole {
                        Vec::new()
                    } else {
                        w.data[..bytes].to_vec()
                    },
                    seq: w.seq,
                });
            }
            // Right remainder after the removed range.
            if w.recx.end() > recx.end() {
                let count = w.recx.end() - recx.end();
                let skip = ((recx.end() - w.recx.index) * rsize) as usize;
                kept.push(WriteRec {
                    recx: Extent::new(recx.end(), count),
                    epoch: w.epoch,
                    hole: w.hole,
                    data: if w.hole {
                        Vec::new()
                    } else {
                        w.data[skip..].to_vec()
                    },
                    seq: w.seq,
                });
            }
        }
        array.writes = kept;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
