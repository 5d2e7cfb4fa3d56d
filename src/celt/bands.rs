//! Band shape decoding
//!
//! Each band is coded as a unit norm vector. Bands with enough bits are
//! split recursively in halves, the split angle coded first, until the
//! halves are small enough to be coded as PVQ codewords. Bands with no
//! bits are filled by folding the lower part of the spectrum.

use crate::entropy::{CeltOnly, RangeDecoder};
use crate::maths::*;

use super::bitexact::{bitexact_cos, bitexact_log2tan};
use super::mode::*;
use super::quant_bands::DB_SHIFT;
use super::rate::{bits2pulses, pulses2bits, Allocation};
use super::vq::{alg_unquant, renormalise_vector, Spread};

const BITRES: i32 = crate::entropy::BITRES as i32;

/// Unit norm in Q14.
const NORM_SCALING: i32 = 16384;

const EXP2_TABLE8: [i32; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];

const BIT_INTERLEAVE_TABLE: [u32; 16] = [0, 1, 1, 1, 2, 3, 3, 3, 2, 3, 3, 3, 2, 3, 3, 3];

const BIT_DEINTERLEAVE_TABLE: [u32; 16] = [
    0x00, 0x03, 0x0C, 0x0F, 0x30, 0x33, 0x3C, 0x3F, 0xC0, 0xC3, 0xCC, 0xCF, 0xF0, 0xF3, 0xFC, 0xFF,
];

/// Hadamard ordering for 2, 4, 8 and 16 blocks, indexed from `stride - 2`.
#[rustfmt::skip]
const ORDERY_TABLE: [usize; 30] = [
    1, 0,
    3, 0, 2, 1,
    7, 0, 4, 3, 6, 1, 5, 2,
    15, 0, 8, 7, 12, 3, 11, 4, 14, 1, 9, 6, 13, 2, 10, 5,
];

/// Orthonormal butterfly between neighbouring pairs of the `stride`
/// interleaved blocks.
fn haar1(x: &mut [i32], n0: usize, stride: usize) {
    const INV_SQRT2: i32 = 23170;

    for i in 0..stride {
        for j in 0..n0 >> 1 {
            let a = 2 * stride * j + i;
            let b = stride * (2 * j + 1) + i;
            let tmp1 = mult16_16(INV_SQRT2, x[a]);
            let tmp2 = mult16_16(INV_SQRT2, x[b]);
            x[a] = extract16(pshr32(tmp1 + tmp2, 15));
            x[b] = extract16(pshr32(tmp1 - tmp2, 15));
        }
    }
}

fn deinterleave_hadamard(x: &mut [i32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0; n];

    for i in 0..stride {
        let row = if hadamard {
            ORDERY_TABLE[stride - 2 + i]
        } else {
            i
        };
        for j in 0..n0 {
            tmp[row * n0 + j] = x[j * stride + i];
        }
    }

    x[..n].copy_from_slice(&tmp);
}

fn interleave_hadamard(x: &mut [i32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0; n];

    for i in 0..stride {
        let row = if hadamard {
            ORDERY_TABLE[stride - 2 + i]
        } else {
            i
        };
        for j in 0..n0 {
            tmp[j * stride + i] = x[row * n0 + j];
        }
    }

    x[..n].copy_from_slice(&tmp);
}

/// Number of levels for the split angle.
fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    let mut n2 = 2 * n as i32 - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }

    // keep enough bits for a pulse in the side when itheta is 16384
    let qb = (b - pulse_cap - (4 << BITRES)).min((b + n2 * offset) / n2);
    let qb = qb.min(8 << BITRES);

    if qb < (1 << BITRES >> 1) {
        1
    } else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        (qn + 1) >> 1 << 1
    }
}

/// Outcome of a split angle decode.
#[derive(Debug, Clone, Copy)]
struct Split {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

struct BandCtx<'a, 'b> {
    mode: &'a Mode,
    rd: &'a mut RangeDecoder<'b>,
    band: usize,
    intensity: usize,
    spread: Spread,
    tf_change: i32,
    remaining_bits: i32,
    seed: u32,
}

impl<'a, 'b> BandCtx<'a, 'b> {
    #[allow(clippy::too_many_arguments)]
    fn compute_theta(
        &mut self,
        n: usize,
        b: &mut i32,
        blocks: usize,
        blocks0: usize,
        lm: i32,
        stereo: bool,
        fill: &mut u32,
    ) -> Split {
        let pulse_cap = self.mode.log_n[self.band] as i32 + lm * (1 << BITRES);
        let offset = (pulse_cap >> 1)
            - if stereo && n == 2 {
                QTHETA_OFFSET_TWOPHASE
            } else {
                QTHETA_OFFSET
            };

        let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
        if stereo && self.band >= self.intensity {
            qn = 1;
        }

        let tell = self.rd.tell_frac() as i32;
        let mut itheta = 0;
        let mut inv = false;

        if qn != 1 {
            if stereo && n > 2 {
                // step pdf, three times more likely up to the middle
                let p0 = 3;
                let x0 = qn / 2;
                let ft = p0 * (x0 + 1) + x0;
                let fs = self.rd.decode(ft as u32) as i32;
                let x = if fs < (x0 + 1) * p0 {
                    fs / p0
                } else {
                    x0 + 1 + (fs - (x0 + 1) * p0)
                };
                let (fl, fh) = if x <= x0 {
                    (p0 * x, p0 * (x + 1))
                } else {
                    ((x - 1 - x0) + (x0 + 1) * p0, (x - x0) + (x0 + 1) * p0)
                };
                self.rd.update(fl as u32, fh as u32, ft as u32);
                itheta = x;
            } else if blocks0 > 1 || stereo {
                itheta = self.rd.decode_uniform(qn as u32 + 1) as i32;
            } else {
                // triangular pdf
                let half = qn >> 1;
                let ft = (half + 1) * (half + 1);
                let fm = self.rd.decode(ft as u32) as i32;
                let (fl, fs);
                if fm < (half * (half + 1) >> 1) {
                    itheta = (isqrt32(8 * fm as u32 + 1) as i32 - 1) >> 1;
                    fs = itheta + 1;
                    fl = itheta * (itheta + 1) >> 1;
                } else {
                    itheta = (2 * (qn + 1) - isqrt32(8 * (ft - fm - 1) as u32 + 1) as i32) >> 1;
                    fs = qn + 1 - itheta;
                    fl = ft - ((qn + 1 - itheta) * (qn + 2 - itheta) >> 1);
                }
                self.rd.update(fl as u32, (fl + fs) as u32, ft as u32);
            }
            itheta = itheta * 16384 / qn;
        } else if stereo {
            if *b > 2 << BITRES && self.remaining_bits > 2 << BITRES {
                inv = self.rd.decode_logp(2);
            }
        }

        let qalloc = self.rd.tell_frac() as i32 - tell;
        *b -= qalloc;

        let (imid, iside, delta) = match itheta {
            0 => {
                *fill &= (1 << blocks) - 1;
                (32767, 0, -16384)
            }
            16384 => {
                *fill &= ((1 << blocks) - 1) << blocks;
                (0, 32767, 16384)
            }
            _ => {
                let imid = bitexact_cos(itheta);
                let iside = bitexact_cos(16384 - itheta);
                let delta = (16384
                    + ((((n as i32 - 1) << 7) as i16 as i32)
                        * (bitexact_log2tan(iside, imid) as i16 as i32)))
                    >> 15;
                (imid, iside, delta)
            }
        };

        Split {
            inv,
            imid,
            iside,
            delta,
            itheta,
            qalloc,
        }
    }

    fn quant_band_n1(
        &mut self,
        x: &mut [i32],
        y: Option<&mut [i32]>,
        lowband_out: Option<&mut [i32]>,
    ) -> u32 {
        let decode_sign = |ctx: &mut Self, v: &mut [i32]| {
            let mut sign = 0;
            if ctx.remaining_bits >= 1 << BITRES {
                sign = ctx.rd.rawbits(1);
                ctx.remaining_bits -= 1 << BITRES;
            }
            v[0] = if sign != 0 {
                -NORM_SCALING
            } else {
                NORM_SCALING
            };
        };

        decode_sign(self, x);
        if let Some(y) = y {
            decode_sign(self, y);
        }

        if let Some(out) = lowband_out {
            out[0] = x[0] >> 4;
        }

        1
    }

    #[allow(clippy::too_many_arguments)]
    fn quant_partition(
        &mut self,
        x: &mut [i32],
        mut b: i32,
        mut blocks: usize,
        lowband: Option<&[i32]>,
        mut lm: i32,
        gain: i32,
        mut fill: u32,
    ) -> u32 {
        let mut n = x.len();
        let blocks0 = blocks;
        let cache = self.mode.cache.band(self.band, lm);

        if lm != -1 && b > cache[cache[0] as usize] as i32 + 12 && n > 2 {
            n >>= 1;
            let (x, y) = x.split_at_mut(n);
            lm -= 1;
            if blocks == 1 {
                fill = (fill & 1) | (fill << 1);
            }
            blocks = (blocks + 1) >> 1;

            let split = self.compute_theta(n, &mut b, blocks, blocks0, lm, false, &mut fill);
            let Split {
                imid,
                iside,
                mut delta,
                itheta,
                qalloc,
                ..
            } = split;
            let (mid, side) = (imid, iside);

            // low-energy MDCTs get more bits than they would otherwise deserve
            if blocks0 > 1 && itheta & 0x3fff != 0 {
                if itheta > 8192 {
                    delta -= delta >> (4 - lm);
                } else {
                    delta = (delta + (((n as i32) << BITRES) >> (5 - lm))).min(0);
                }
            }
            let mut mbits = b.min((b - delta) / 2).max(0);
            let mut sbits = b - mbits;
            self.remaining_bits -= qalloc;

            let (lowband, next_lowband2) = match lowband {
                Some(l) => {
                    let (lo, hi) = l.split_at(n);
                    (Some(lo), Some(hi))
                }
                None => (None, None),
            };

            let mut rebalance = self.remaining_bits;
            let mut cm;
            if mbits >= sbits {
                cm = self.quant_partition(
                    x,
                    mbits,
                    blocks,
                    lowband,
                    lm,
                    mult16_16_p15(gain, mid),
                    fill,
                );
                rebalance = mbits - (rebalance - self.remaining_bits);
                if rebalance > 3 << BITRES && itheta != 0 {
                    sbits += rebalance - (3 << BITRES);
                }
                cm |= self.quant_partition(
                    y,
                    sbits,
                    blocks,
                    next_lowband2,
                    lm,
                    mult16_16_p15(gain, side),
                    fill >> blocks,
                ) << (blocks0 >> 1);
            } else {
                cm = self.quant_partition(
                    y,
                    sbits,
                    blocks,
                    next_lowband2,
                    lm,
                    mult16_16_p15(gain, side),
                    fill >> blocks,
                ) << (blocks0 >> 1);
                rebalance = sbits - (rebalance - self.remaining_bits);
                if rebalance > 3 << BITRES && itheta != 16384 {
                    mbits += rebalance - (3 << BITRES);
                }
                cm |= self.quant_partition(
                    x,
                    mbits,
                    blocks,
                    lowband,
                    lm,
                    mult16_16_p15(gain, mid),
                    fill,
                );
            }

            return cm;
        }

        let mut q = bits2pulses(self.mode, self.band, lm, b);
        let mut curr_bits = pulses2bits(self.mode, self.band, lm, q);
        self.remaining_bits -= curr_bits;

        while self.remaining_bits < 0 && q > 0 {
            self.remaining_bits += curr_bits;
            q -= 1;
            curr_bits = pulses2bits(self.mode, self.band, lm, q);
            self.remaining_bits -= curr_bits;
        }

        if q != 0 {
            let k = get_pulses(q as usize);
            return alg_unquant(x, k, self.spread, blocks, self.rd, gain);
        }

        let cm_mask = ((1u64 << blocks) - 1) as u32;
        fill &= cm_mask;
        if fill == 0 {
            x.iter_mut().for_each(|v| *v = 0);
            return 0;
        }

        let cm = match lowband {
            None => {
                for v in x.iter_mut() {
                    self.seed = celt_lcg_rand(self.seed);
                    *v = (self.seed as i32) >> 20;
                }
                cm_mask
            }
            Some(lowband) => {
                // about 48dB below the folded spectrum
                const FOLD_NOISE: i32 = 4;
                for (v, &l) in x.iter_mut().zip(lowband) {
                    self.seed = celt_lcg_rand(self.seed);
                    let tmp = if self.seed & 0x8000 != 0 {
                        FOLD_NOISE
                    } else {
                        -FOLD_NOISE
                    };
                    *v = l + tmp;
                }
                fill
            }
        };
        renormalise_vector(x, gain);

        cm
    }

    #[allow(clippy::too_many_arguments)]
    fn quant_band(
        &mut self,
        x: &mut [i32],
        b: i32,
        mut blocks: usize,
        lowband: Option<&[i32]>,
        lm: i32,
        lowband_out: Option<&mut [i32]>,
        gain: i32,
        mut fill: u32,
    ) -> u32 {
        let n0 = x.len();
        let mut n_b = n0;
        let long_blocks = blocks == 1;
        let mut tf_change = self.tf_change;
        let mut time_divide = 0;

        n_b /= blocks;

        if n0 == 1 {
            return self.quant_band_n1(x, None, lowband_out);
        }

        let recombine = tf_change.max(0) as usize;

        let mut lowband = lowband.map(|l| l[..n0].to_vec());

        for k in 0..recombine {
            if let Some(l) = lowband.as_deref_mut() {
                haar1(l, n0 >> k, 1 << k);
            }
            fill = BIT_INTERLEAVE_TABLE[(fill & 0xF) as usize]
                | BIT_INTERLEAVE_TABLE[(fill >> 4) as usize] << 2;
        }
        blocks >>= recombine;
        n_b <<= recombine;

        // increase the time resolution
        while n_b & 1 == 0 && tf_change < 0 {
            if let Some(l) = lowband.as_deref_mut() {
                haar1(l, n_b, blocks);
            }
            fill |= fill << blocks;
            blocks <<= 1;
            n_b >>= 1;
            time_divide += 1;
            tf_change += 1;
        }
        let blocks0 = blocks;
        let n_b0 = n_b;

        if blocks0 > 1 {
            if let Some(l) = lowband.as_deref_mut() {
                deinterleave_hadamard(l, n_b >> recombine, blocks0 << recombine, long_blocks);
            }
        }

        let mut cm = self.quant_partition(x, b, blocks, lowband.as_deref(), lm, gain, fill);

        if blocks0 > 1 {
            interleave_hadamard(x, n_b >> recombine, blocks0 << recombine, long_blocks);
        }

        n_b = n_b0;
        blocks = blocks0;
        for _ in 0..time_divide {
            blocks >>= 1;
            n_b <<= 1;
            cm |= cm >> blocks;
            haar1(x, n_b, blocks);
        }

        for k in 0..recombine {
            cm = BIT_DEINTERLEAVE_TABLE[cm as usize];
            haar1(x, n0 >> k, 1 << k);
        }
        blocks <<= recombine;

        // scaled for the later folding
        if let Some(out) = lowband_out {
            let n = celt_sqrt((n0 as i32) << 22);
            for (o, &v) in out.iter_mut().zip(x.iter()) {
                *o = mult16_16_q15(n, v);
            }
        }

        cm & ((1 << blocks) - 1)
    }

    #[allow(clippy::too_many_arguments)]
    fn quant_band_stereo(
        &mut self,
        x: &mut [i32],
        y: &mut [i32],
        mut b: i32,
        blocks: usize,
        lowband: Option<&[i32]>,
        lm: i32,
        lowband_out: Option<&mut [i32]>,
        mut fill: u32,
    ) -> u32 {
        let n = x.len();

        if n == 1 {
            return self.quant_band_n1(x, Some(y), lowband_out);
        }

        let orig_fill = fill;
        let split = self.compute_theta(n, &mut b, blocks, blocks, lm, true, &mut fill);
        let (mid, side) = (split.imid, split.iside);
        let itheta = split.itheta;

        let cm;
        if n == 2 {
            // the side is orthogonal to the mid, a single sign bit codes it
            let mut mbits = b;
            let sbits = if itheta != 0 && itheta != 16384 {
                1 << BITRES
            } else {
                0
            };
            mbits -= sbits;
            let swap = itheta > 8192;
            self.remaining_bits -= split.qalloc + sbits;

            let mut sign = 0;
            if sbits != 0 {
                sign = self.rd.rawbits(1) as i32;
            }
            let sign = 1 - 2 * sign;

            {
                let (x2, y2) = if swap {
                    (&mut *y, &mut *x)
                } else {
                    (&mut *x, &mut *y)
                };
                // orig_fill keeps the side folding when itheta is 16384
                cm = self.quant_band(
                    x2,
                    mbits,
                    blocks,
                    lowband,
                    lm,
                    lowband_out,
                    Q15_ONE,
                    orig_fill,
                );
                y2[0] = -sign * x2[1];
                y2[1] = sign * x2[0];
            }

            for i in 0..2 {
                let l = mult16_16_q15(mid, x[i]);
                let r = mult16_16_q15(side, y[i]);
                x[i] = l - r;
                y[i] = l + r;
            }
        } else {
            let mut mbits = b.min((b - split.delta) / 2).max(0);
            let mut sbits = b - mbits;
            self.remaining_bits -= split.qalloc;

            let mut rebalance = self.remaining_bits;
            // the mid stays unscaled since it is folded later, the side
            // never folds
            if mbits >= sbits {
                let mut c = self.quant_band(
                    x,
                    mbits,
                    blocks,
                    lowband,
                    lm,
                    lowband_out,
                    Q15_ONE,
                    fill,
                );
                rebalance = mbits - (rebalance - self.remaining_bits);
                if rebalance > 3 << BITRES && itheta != 0 {
                    sbits += rebalance - (3 << BITRES);
                }
                c |= self.quant_band(y, sbits, blocks, None, lm, None, side, fill >> blocks);
                cm = c;
            } else {
                let mut c = self.quant_band(y, sbits, blocks, None, lm, None, side, fill >> blocks);
                rebalance = sbits - (rebalance - self.remaining_bits);
                if rebalance > 3 << BITRES && itheta != 16384 {
                    mbits += rebalance - (3 << BITRES);
                }
                c |= self.quant_band(
                    x,
                    mbits,
                    blocks,
                    lowband,
                    lm,
                    lowband_out,
                    Q15_ONE,
                    fill,
                );
                cm = c;
            }
            stereo_merge(x, y, mid);
        }

        if split.inv {
            y.iter_mut().for_each(|v| *v = -*v);
        }

        cm
    }
}

/// Turn the decoded mid and side back into left and right.
fn stereo_merge(x: &mut [i32], y: &mut [i32], mid: i32) {
    const MIN_ENERGY: i32 = 161061;

    let xp = x.iter().zip(y.iter()).fold(0i32, |acc, (&a, &b)| mac16_16(acc, b, a));
    let side = celt_inner_prod(y, y);
    // compensate the mid normalization
    let xp = mult16_32_q15(mid, xp);
    // mid and side are Q15, x and y Q14
    let mid2 = mid >> 1;
    let el = mult16_16(mid2, mid2) + side - 2 * xp;
    let er = mult16_16(mid2, mid2) + side + 2 * xp;

    if er < MIN_ENERGY || el < MIN_ENERGY {
        y.copy_from_slice(x);
        return;
    }

    let kl = celt_ilog2(el) >> 1;
    let kr = celt_ilog2(er) >> 1;
    let lgain = celt_rsqrt_norm(vshr32(el, (kl - 7) << 1));
    let rgain = celt_rsqrt_norm(vshr32(er, (kr - 7) << 1));
    let kl = kl.max(7) as u32;
    let kr = kr.max(7) as u32;

    for (a, b) in x.iter_mut().zip(y.iter_mut()) {
        let l = mult16_16_p15(mid, *a);
        let r = *b;
        *a = extract16(pshr32(mult16_16(lgain, l - r), kl + 1));
        *b = extract16(pshr32(mult16_16(rgain, l + r), kr + 1));
    }
}

/// Decode the normalized shapes of the bands in `start..end`.
///
/// `x` and `y` hold the channel spectra, `collapse_masks` receives for
/// every band and channel which short blocks got some energy.
#[allow(clippy::too_many_arguments)]
pub fn quant_all_bands(
    mode: &Mode,
    start: usize,
    end: usize,
    x: &mut [i32],
    mut y: Option<&mut [i32]>,
    collapse_masks: &mut [u8],
    alloc: &Allocation,
    short_blocks: bool,
    spread: Spread,
    tf_res: &[i32],
    total_bits: i32,
    rd: &mut RangeDecoder,
    lm: usize,
    seed: &mut u32,
) {
    let eb = |i: usize| mode.ebands[i] as usize;
    let m = 1 << lm;
    let channels = if y.is_some() { 2 } else { 1 };
    let blocks = if short_blocks { m } else { 1 };
    let norm_offset = m * eb(start);
    // the last band never gets folded from
    let norm_len = m * eb(mode.nb_ebands - 1) - norm_offset;
    let mut norm = vec![0i32; channels * norm_len];

    let mut lowband_offset = 0;
    let mut update_lowband = true;
    let mut dual_stereo = alloc.dual_stereo;
    let mut balance = alloc.balance;
    let coded_bands = alloc.coded_bands;

    let mut ctx = BandCtx {
        mode,
        rd,
        band: start,
        intensity: alloc.intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        seed: *seed,
    };

    for i in start..end {
        ctx.band = i;
        let last = i == end - 1;
        let band_start = m * eb(i);
        let band_end = m * eb(i + 1);
        let n = band_end - band_start;

        let tell = ctx.rd.tell_frac() as i32;
        if i != start {
            balance -= tell;
        }
        let remaining_bits = total_bits - tell - 1;
        ctx.remaining_bits = remaining_bits;

        let b = if i < coded_bands {
            let curr_balance = balance / (coded_bands - i).min(3) as i32;
            (remaining_bits + 1)
                .min(alloc.pulses[i] + curr_balance)
                .min(16383)
                .max(0)
        } else {
            0
        };

        if band_start as i32 - n as i32 >= norm_offset as i32
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = i;
        }

        let tf_change = tf_res[i];
        ctx.tf_change = tf_change;

        let mut effective_lowband = None;
        let (mut x_cm, mut y_cm);
        if lowband_offset != 0 && (spread != Spread::Aggressive || blocks > 1 || tf_change < 0) {
            // never repeat spectral content within one band
            let eff = (m as i32 * eb(lowband_offset) as i32 - norm_offset as i32 - n as i32)
                .max(0) as usize;

            let mut fold_start = lowband_offset - 1;
            while m * eb(fold_start) > eff + norm_offset {
                fold_start -= 1;
            }
            let mut fold_end = lowband_offset;
            while m * eb(fold_end) < eff + norm_offset + n {
                fold_end += 1;
            }

            x_cm = 0u32;
            y_cm = 0u32;
            for fold_i in fold_start..fold_end.max(fold_start + 1) {
                x_cm |= collapse_masks[fold_i * channels] as u32;
                y_cm |= collapse_masks[fold_i * channels + channels - 1] as u32;
            }
            effective_lowband = Some(eff);
        } else {
            // the LCG folding almost never leaves a block empty
            x_cm = (1 << blocks) - 1;
            y_cm = x_cm;
        }

        if dual_stereo && i == alloc.intensity {
            dual_stereo = false;
            let (n1, n2) = norm.split_at_mut(norm_len);
            for (a, &b) in n1[..band_start - norm_offset].iter_mut().zip(n2.iter()) {
                *a = half32(*a + b);
            }
        }

        let out_at = band_start - norm_offset;
        let xb = &mut x[band_start..band_end];

        let lm = lm as i32;
        match y.as_deref_mut() {
            Some(y) if dual_stereo => {
                let yb = &mut y[band_start..band_end];
                let (n1, n2) = norm.split_at_mut(norm_len);
                let lb1 = effective_lowband.map(|e| n1[e..e + n].to_vec());
                let lb2 = effective_lowband.map(|e| n2[e..e + n].to_vec());
                let (out1, out2) = if last {
                    (None, None)
                } else {
                    (
                        Some(&mut n1[out_at..out_at + n]),
                        Some(&mut n2[out_at..out_at + n]),
                    )
                };
                x_cm = ctx.quant_band(xb, b / 2, blocks, lb1.as_deref(), lm, out1, Q15_ONE, x_cm);
                y_cm = ctx.quant_band(yb, b / 2, blocks, lb2.as_deref(), lm, out2, Q15_ONE, y_cm);
            }
            y => {
                let lb = effective_lowband.map(|e| norm[e..e + n].to_vec());
                let out = if last {
                    None
                } else {
                    Some(&mut norm[out_at..out_at + n])
                };
                x_cm = match y {
                    Some(y) => {
                        let yb = &mut y[band_start..band_end];
                        ctx.quant_band_stereo(xb, yb, b, blocks, lb.as_deref(), lm, out, x_cm | y_cm)
                    }
                    None => ctx.quant_band(xb, b, blocks, lb.as_deref(), lm, out, Q15_ONE, x_cm | y_cm),
                };
                y_cm = x_cm;
            }
        }

        collapse_masks[i * channels] = x_cm as u8;
        collapse_masks[i * channels + channels - 1] = y_cm as u8;
        balance += alloc.pulses[i] + tell;

        // fold from here on only while there is at least one bit per sample
        update_lowband = b > (n << BITRES) as i32;
    }

    *seed = ctx.seed;
}

/// Fill the short blocks that got no pulse with noise at the level of
/// the energy they lost.
#[allow(clippy::too_many_arguments)]
pub fn anti_collapse(
    mode: &Mode,
    x: &mut [i32],
    collapse_masks: &[u8],
    lm: usize,
    channels: usize,
    size: usize,
    start: usize,
    end: usize,
    log_e: &[i32],
    prev1_log_e: &[i32],
    prev2_log_e: &[i32],
    pulses: &[i32],
    mut seed: u32,
) {
    for i in start..end {
        let n0 = mode.width(i);
        // depth in 1/8 bits
        let depth = (1 + pulses[i]) / ((n0 as i32) << lm);

        let thresh32 = celt_exp2(-(depth << (10 - BITRES))) >> 1;
        let thresh = mult16_32_q15(16384, thresh32.min(32767));
        let (sqrt_1, shift) = {
            let t = (n0 << lm) as i32;
            let shift = celt_ilog2(t) >> 1;
            let t = t << ((7 - shift) << 1);
            (celt_rsqrt_norm(t), shift)
        };

        for c in 0..channels {
            let at = c * MAX_BANDS + i;
            let mut prev1 = prev1_log_e[at];
            let mut prev2 = prev2_log_e[at];
            if channels == 1 {
                prev1 = prev1.max(prev1_log_e[MAX_BANDS + i]);
                prev2 = prev2.max(prev2_log_e[MAX_BANDS + i]);
            }
            let ediff = (log_e[at] - prev1.min(prev2)).max(0);

            let mut r = if ediff < 16384 {
                let r32 = celt_exp2(-ediff) >> 1;
                2 * r32.min(16383)
            } else {
                0
            };
            if lm == 3 {
                r = mult16_16_q14(23170, r.min(23169));
            }
            r = thresh.min(r) >> 1;
            r = mult16_16_q15(sqrt_1, r) >> shift;

            let base = c * size + ((mode.ebands[i] as usize) << lm);
            let band = &mut x[base..base + (n0 << lm)];
            let mut renormalize = false;
            for k in 0..1 << lm {
                if collapse_masks[i * channels + c] & 1 << k == 0 {
                    for j in 0..n0 {
                        seed = celt_lcg_rand(seed);
                        band[(j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    }
                    renormalize = true;
                }
            }

            if renormalize {
                renormalise_vector(band, Q15_ONE);
            }
        }
    }
}

/// Scale the normalized spectrum of one channel by the band energies.
#[allow(clippy::too_many_arguments)]
pub fn denormalise_bands(
    mode: &Mode,
    x: &[i32],
    freq: &mut [i32],
    band_log_e: &[i32],
    mut start: usize,
    mut end: usize,
    m: usize,
    downsample: usize,
    silence: bool,
) {
    let eb = |i: usize| mode.ebands[i] as usize * m;
    let n = m * mode.short_mdct_size;
    let mut bound = eb(end);
    if downsample != 1 {
        bound = bound.min(n / downsample);
    }
    if silence {
        bound = 0;
        start = 0;
        end = 0;
    }

    freq[..eb(start)].iter_mut().for_each(|f| *f = 0);

    for i in start..end {
        let lg = band_log_e[i] + (E_MEANS[i] << 6);
        let mut shift = 16 - (lg >> DB_SHIFT);
        let mut g = if shift > 31 {
            shift = 0;
            0
        } else {
            celt_exp2_frac(lg & ((1 << DB_SHIFT) - 1))
        };

        let f = &mut freq[eb(i)..eb(i + 1)];
        let xs = &x[eb(i)..eb(i + 1)];
        if shift < 0 {
            // only a corrupted stream gets here
            if shift < -2 {
                g = 32767;
                shift = -2;
            }
            for (f, &v) in f.iter_mut().zip(xs) {
                *f = mult16_16(v, g) << -shift;
            }
        } else {
            for (f, &v) in f.iter_mut().zip(xs) {
                *f = mult16_16(v, g) >> shift;
            }
        }
    }

    freq[bound..n].iter_mut().for_each(|f| *f = 0);
}
