//! EC math adapter
//!
//! Thin arithmetic layer over the `reed-solomon-erasure` GF(2^8) field
//! primitives. Parity is generated against a precomputed Cauchy generator
//! matrix so that incremental updates are possible: folding
//! `gen[row][cell] * (old XOR new)` into an existing parity cell yields the
//! same bytes as re-encoding the stripe from scratch.
//!
//! A read-mostly registry materializes the tables per object class on first
//! use; the aggregation context caches its own `Arc` for the object's
//! lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use reed_solomon_erasure::{galois_8, Field};

use crate::error::{Error, Result};
use crate::types::ClassAttr;

// =============================================================================
// Generator Tables
// =============================================================================

/// Precomputed GF(2^8) generator coefficients: `p` rows by `k` columns.
///
/// Row `j`, column `i` holds `1 / ((k + j) ^ i)`, the classic Cauchy
/// construction; any square submatrix is invertible, so any `k` surviving
/// cells recover the stripe.
#[derive(Debug)]
struct GfTables {
    k: usize,
    p: usize,
    coef: Vec<u8>,
}

impl GfTables {
    fn build(k: usize, p: usize) -> Result<Self> {
        if k == 0 || p == 0 || k + p > 255 {
            return Err(Error::CodecInit(format!(
                "unsupportable geometry k={k} p={p}"
            )));
        }
        let mut coef = vec![0u8; p * k];
        for j in 0..p {
            for i in 0..k {
                let x = ((k + j) as u8) ^ (i as u8);
                coef[j * k + i] = galois_8::Field::div(galois_8::Field::one(), x);
            }
        }
        Ok(Self { k, p, coef })
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> u8 {
        self.coef[row * self.k + col]
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encoder for one object class.
#[derive(Debug)]
pub struct Codec {
    attr: ClassAttr,
    tables: GfTables,
}

impl Codec {
    pub fn new(attr: ClassAttr) -> Result<Self> {
        attr.validate()?;
        let tables = GfTables::build(attr.k as usize, attr.p as usize)?;
        Ok(Self { attr, tables })
    }

    pub fn attr(&self) -> &ClassAttr {
        &self.attr
    }

    /// Encode `p` parity cells from `k` data cells.
    ///
    /// `data` holds the `k` cell slices in cell order; `parity` is a single
    /// buffer of `p * cell_bytes` bytes, row 0 first.
    pub fn encode(&self, cell_bytes: usize, data: &[&[u8]], parity: &mut [u8]) -> Result<()> {
        let k = self.tables.k;
        let p = self.tables.p;
        if data.len() != k {
            return Err(Error::InvalidInput(format!(
                "encode expects {k} data cells, got {}",
                data.len()
            )));
        }
        if parity.len() < p * cell_bytes {
            return Err(Error::InvalidInput("parity buffer too small".into()));
        }
        for (j, row) in parity[..p * cell_bytes].chunks_exact_mut(cell_bytes).enumerate() {
            galois_8::Field::mul_slice(self.tables.at(j, 0), &data[0][..cell_bytes], row);
            for (i, cell) in data.iter().enumerate().skip(1) {
                galois_8::Field::mul_slice_add(self.tables.at(j, i), &cell[..cell_bytes], row);
            }
        }
        Ok(())
    }

    /// Fold a single cell's XOR diff into every parity row in place.
    pub fn encode_update(
        &self,
        cell_bytes: usize,
        cell: usize,
        diff: &[u8],
        parity: &mut [u8],
    ) -> Result<()> {
        let p = self.tables.p;
        if cell >= self.tables.k {
            return Err(Error::InvalidInput(format!(
                "cell {cell} out of range (k={})",
                self.tables.k
            )));
        }
        if parity.len() < p * cell_bytes {
            return Err(Error::InvalidInput("parity buffer too small".into()));
        }
        for (j, row) in parity[..p * cell_bytes].chunks_exact_mut(cell_bytes).enumerate() {
            galois_8::Field::mul_slice_add(self.tables.at(j, cell), &diff[..cell_bytes], row);
        }
        Ok(())
    }

    /// Recover one missing data cell from the other `k - 1` cells and one
    /// parity row. `data[missing]` is ignored; every other slot must be
    /// `Some`.
    pub fn recover(
        &self,
        cell_bytes: usize,
        missing: usize,
        data: &[Option<&[u8]>],
        parity_row: usize,
        parity: &[u8],
        out: &mut [u8],
    ) -> Result<()> {
        let k = self.tables.k;
        if missing >= k || data.len() != k || parity_row >= self.tables.p {
            return Err(Error::InvalidInput("recover arguments out of range".into()));
        }
        out[..cell_bytes].copy_from_slice(&parity[..cell_bytes]);
        for (i, cell) in data.iter().enumerate() {
            if i == missing {
                continue;
            }
            let cell = cell
                .ok_or_else(|| Error::InvalidInput(format!("recover missing cell {i} input")))?;
            galois_8::Field::mul_slice_add(
                self.tables.at(parity_row, i),
                &cell[..cell_bytes],
                &mut out[..cell_bytes],
            );
        }
        let inv = galois_8::Field::div(galois_8::Field::one(), self.tables.at(parity_row, missing));
        for b in out[..cell_bytes].iter_mut() {
            *b = galois_8::Field::mul(inv, *b);
        }
        Ok(())
    }
}

/// `diff = old XOR new`, element-wise.
pub fn xor_diff(old: &[u8], new: &[u8], diff: &mut [u8]) {
    for ((d, o), n) in diff.iter_mut().zip(old).zip(new) {
        *d = o ^ n;
    }
}

/// `dst ^= src`, element-wise.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Read-mostly codec table registry keyed by object class id.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: DashMap<u32, Arc<Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize (or reuse) the codec for an object class.
    pub fn get(&self, attr: ClassAttr) -> Result<Arc<Codec>> {
        if let Some(codec) = self.codecs.get(&attr.id.0) {
            return Ok(codec.clone());
        }
        let codec = Arc::new(Codec::new(attr)?);
        self.codecs.insert(attr.id.0, codec.clone());
        Ok(codec)
    }
}

// =============================================================================
// Tests
// =============================================================================
