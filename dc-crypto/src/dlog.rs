//! Bounded discrete log for decoding `m·g` back to `m`.
//!
//! Baby-step/giant-step: a table of `j·g` for `j < DLOG_BABY_STEPS` is built once per process;
//! a lookup walks `M − i·(BABY·g)` for increasing `i`, trying `M` and `−M` on every step so small
//! magnitudes of either sign resolve immediately.

use crate::codec::POINT_BYTES;
use crate::constants::{DLOG_BABY_STEPS, DLOG_GIANT_STEPS};
use crate::elgamal::{generator, CryptoError, Point};
use ark_bn254::G1Affine;
use ark_ec::CurveGroup;
use ark_ff::Zero;
use ark_serialize::CanonicalSerialize;
use std::collections::HashMap;
use std::sync::OnceLock;

struct BabySteps {
    table: HashMap<[u8; POINT_BYTES], u64>,
    giant: Point,
}

fn affine_key(p: &G1Affine) -> [u8; POINT_BYTES] {
    let mut buf = [0u8; POINT_BYTES];
    p.serialize_compressed(&mut buf[..])
        .expect("in-memory serialization");
    buf
}

fn baby_steps() -> &'static BabySteps {
    static TABLE: OnceLock<BabySteps> = OnceLock::new();

    TABLE.get_or_init(|| {
        let g = generator();
        let mut points = Vec::with_capacity(DLOG_BABY_STEPS as usize);
        let mut acc = Point::zero();
        for _ in 0..DLOG_BABY_STEPS {
            points.push(acc);
            acc += g;
        }

        let table = Point::normalize_batch(&points)
            .iter()
            .enumerate()
            .map(|(j, p)| (affine_key(p), j as u64))
            .collect();

        // `acc` now equals BABY·g.
        BabySteps { table, giant: acc }
    })
}

/// Recover `m` from `m·g` for `|m| <= DLOG_MAX_ABS`.
pub fn solve(m_point: &Point) -> Result<i64, CryptoError> {
    let steps = baby_steps();

    let mut pos = *m_point;
    let mut neg = -*m_point;

    for i in 0..DLOG_GIANT_STEPS {
        if let Some(j) = steps.table.get(&affine_key(&pos.into_affine())) {
            return Ok((i * DLOG_BABY_STEPS + j) as i64);
        }
        if let Some(j) = steps.table.get(&affine_key(&neg.into_affine())) {
            return Ok(-((i * DLOG_BABY_STEPS + j) as i64));
        }
        pos -= steps.giant;
        neg -= steps.giant;
    }

    Err(CryptoError::DlogOutOfRange)
}
