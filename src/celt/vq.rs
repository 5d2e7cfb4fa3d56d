//! Pyramid vector dequantization
//!
//! The decoded pulses are scaled to unit norm and then spread by a set of
//! Givens rotations to avoid tonal artifacts at low rates.

use crate::entropy::RangeDecoder;
use crate::maths::*;

use super::cwrs::decode_pulses;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spread {
    None = 0,
    Light = 1,
    Normal = 2,
    Aggressive = 3,
}

impl Default for Spread {
    fn default() -> Self {
        Spread::Normal
    }
}

impl From<usize> for Spread {
    fn from(v: usize) -> Self {
        match v {
            0 => Spread::None,
            1 => Spread::Light,
            2 => Spread::Normal,
            _ => Spread::Aggressive,
        }
    }
}

impl Spread {
    fn factor(self) -> i32 {
        match self {
            Spread::None => 0,
            Spread::Light => 15,
            Spread::Normal => 10,
            Spread::Aggressive => 5,
        }
    }
}

fn exp_rotation1(x: &mut [i32], stride: usize, c: i32, s: i32) {
    let len = x.len();
    let ms = -s;

    let rotate = |x: &mut [i32], i: usize| {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = extract16(pshr32(mac16_16(mult16_16(c, x2), s, x1), 15));
        x[i] = extract16(pshr32(mac16_16(mult16_16(c, x1), ms, x2), 15));
    };

    if len <= stride {
        return;
    }

    for i in 0..len - stride {
        rotate(x, i);
    }

    if len >= 2 * stride + 1 {
        for i in (0..=len - 2 * stride - 1).rev() {
            rotate(x, i);
        }
    }
}

/// Spread (`dir > 0`) or collapse (`dir < 0`) the energy of `x` split in
/// `stride` interleaved blocks.
pub fn exp_rotation(x: &mut [i32], dir: i32, stride: usize, k: usize, spread: Spread) {
    let len = x.len();

    if 2 * k >= len || spread == Spread::None {
        return;
    }

    let factor = spread.factor();
    let gain = celt_div(
        mult16_16(Q15_ONE, len as i32),
        len as i32 + factor * k as i32,
    );
    let theta = mult16_16_q15(gain, gain) >> 1;

    let c = celt_cos_norm(theta);
    let s = celt_cos_norm(Q15_ONE - theta);

    let mut stride2 = 0;
    if len >= 8 * stride {
        stride2 = 1;
        // equivalent to stride2 = sqrt(len / stride), rounded
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let sub = len / stride;
    for block in x.chunks_exact_mut(sub).take(stride) {
        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, c);
            }
            exp_rotation1(block, 1, c, s);
        } else {
            exp_rotation1(block, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, -c);
            }
        }
    }
}

fn normalise_residual(iy: &[i32], x: &mut [i32], ryy: i32, gain: i32) {
    let k = celt_ilog2(ryy) >> 1;
    let t = vshr32(ryy, 2 * (k - 7));
    let g = mult16_16_p15(celt_rsqrt_norm(t), gain);

    for (x, &y) in x.iter_mut().zip(iy.iter()) {
        *x = extract16(pshr32(mult16_16(g, y), (k + 1) as u32));
    }
}

/// Which of the `b` interleaved blocks received at least a pulse.
fn extract_collapse_mask(iy: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }

    let n0 = iy.len() / b;

    iy.chunks_exact(n0)
        .take(b)
        .enumerate()
        .fold(0, |mask, (i, block)| {
            let any = block.iter().any(|&v| v != 0);
            mask | (any as u32) << i
        })
}

/// Decode `k` pulses into `x` scaled to `gain`, returns the collapse mask.
pub fn alg_unquant(
    x: &mut [i32],
    k: usize,
    spread: Spread,
    b: usize,
    rd: &mut RangeDecoder,
    gain: i32,
) -> u32 {
    debug_assert!(k > 0, "at least one pulse");
    debug_assert!(x.len() > 1, "at least two dimensions");

    let mut iy = vec![0; x.len()];
    let ryy = decode_pulses(&mut iy, k, rd);

    normalise_residual(&iy, x, ryy, gain);
    exp_rotation(x, -1, b, k, spread);

    extract_collapse_mask(&iy, b)
}

/// Scale `x` to the norm `gain`.
pub fn renormalise_vector(x: &mut [i32], gain: i32) {
    let e = EPSILON + celt_inner_prod(x, x);
    let k = celt_ilog2(e) >> 1;
    let t = vshr32(e, 2 * (k - 7));
    let g = mult16_16_p15(celt_rsqrt_norm(t), gain);

    for v in x.iter_mut() {
        *v = extract16(pshr32(mult16_16(g, *v), (k + 1) as u32));
    }
}
