//! Bit allocation
//!
//! Splits the frame budget between the bands, first as PVQ bits and then
//! as fine energy bits. The split depends only on the mode, the
//! signalled trim and boosts, and a few symbols read along the way, so
//! the decoder reproduces exactly what the encoder chose.

use crate::entropy::*;

use super::mode::*;

const ALLOC_STEPS: i32 = 6;

/// ceil(log2(n) * 8) for n in 1..=24, the cost of an intensity index.
const LOG2_FRAC_TABLE: [u8; 24] = [
    0, 8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29, 30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];

const BITRES: i32 = crate::entropy::BITRES as i32;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub coded_bands: usize,
    pub intensity: usize,
    pub dual_stereo: bool,
    /// Bits left over by the last coded band, carried into the band coding.
    pub balance: i32,
    /// PVQ budget per band, in 1/8 bits.
    pub pulses: [i32; MAX_BANDS],
    pub fine_bits: [i32; MAX_BANDS],
    pub fine_priority: [i32; MAX_BANDS],
}

/// Pseudo-pulse count whose cost is the closest to `bits`.
pub fn bits2pulses(mode: &Mode, band: usize, lm: i32, bits: i32) -> i32 {
    let cache = mode.cache.band(band, lm);
    let mut lo = 0;
    let mut hi = cache[0] as i32;
    let bits = bits - 1;

    for _ in 0..LOG_MAX_PSEUDO {
        let mid = (lo + hi + 1) >> 1;
        if cache[mid as usize] as i32 >= bits {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    let below = if lo == 0 { -1 } else { cache[lo as usize] as i32 };
    if bits - below <= cache[hi as usize] as i32 - bits {
        lo
    } else {
        hi
    }
}

pub fn pulses2bits(mode: &Mode, band: usize, lm: i32, pulses: i32) -> i32 {
    if pulses == 0 {
        0
    } else {
        mode.cache.band(band, lm)[pulses as usize] as i32 + 1
    }
}

struct Budget<'a> {
    mode: &'a Mode,
    start: usize,
    end: usize,
    channels: i32,
    lm: i32,
}

impl<'a> Budget<'a> {
    #[inline(always)]
    fn width(&self, j: usize) -> i32 {
        self.mode.width(j) as i32
    }

    #[inline(always)]
    fn span(&self, from: usize, to: usize) -> i32 {
        (self.mode.ebands[to] - self.mode.ebands[from]) as i32
    }

    #[allow(clippy::too_many_arguments)]
    fn interpolate(
        &self,
        skip_start: usize,
        bits1: &[i32; MAX_BANDS],
        bits2: &[i32; MAX_BANDS],
        thresh: &[i32; MAX_BANDS],
        cap: &[i32],
        mut total: i32,
        skip_rsv: i32,
        mut intensity_rsv: i32,
        mut dual_stereo_rsv: i32,
        rd: &mut RangeDecoder,
    ) -> Allocation {
        let (start, end) = (self.start, self.end);
        let c = self.channels;
        let alloc_floor = c << BITRES;
        let stereo = (c > 1) as i32;
        let log_m = self.lm << BITRES;

        let mut alloc = Allocation::default();
        let bits = &mut alloc.pulses;

        let mut lo = 0;
        let mut hi = 1 << ALLOC_STEPS;
        for _ in 0..ALLOC_STEPS {
            let mid = (lo + hi) >> 1;
            let mut psum = 0;
            let mut done = false;
            for j in (start..end).rev() {
                let tmp = bits1[j] + (mid * bits2[j] >> ALLOC_STEPS);
                if tmp >= thresh[j] || done {
                    done = true;
                    psum += tmp.min(cap[j]);
                } else if tmp >= alloc_floor {
                    psum += alloc_floor;
                }
            }
            if psum > total {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let mut psum = 0;
        let mut done = false;
        for j in (start..end).rev() {
            let mut tmp = bits1[j] + (lo * bits2[j] >> ALLOC_STEPS);
            if tmp < thresh[j] && !done {
                tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
            } else {
                done = true;
            }
            tmp = tmp.min(cap[j]);
            bits[j] = tmp;
            psum += tmp;
        }

        // Drop bands from the top until the encoder signals to stop
        let mut coded_bands = end;
        loop {
            let j = coded_bands - 1;
            if j <= skip_start {
                total += skip_rsv;
                break;
            }

            let mut left = total - psum;
            let percoeff = left / self.span(start, coded_bands);
            left -= self.span(start, coded_bands) * percoeff;
            let rem = (left - self.span(start, j)).max(0);
            let band_width = self.span(j, coded_bands);
            let mut band_bits = bits[j] + percoeff * band_width + rem;

            if band_bits >= thresh[j].max(alloc_floor + (1 << BITRES)) {
                if rd.decode_logp(1) {
                    break;
                }
                psum += 1 << BITRES;
                band_bits -= 1 << BITRES;
            }

            psum -= bits[j] + intensity_rsv;
            if intensity_rsv > 0 {
                intensity_rsv = LOG2_FRAC_TABLE[j - start] as i32;
            }
            psum += intensity_rsv;
            if band_bits >= alloc_floor {
                psum += alloc_floor;
                bits[j] = alloc_floor;
            } else {
                bits[j] = 0;
            }

            coded_bands -= 1;
        }

        alloc.intensity = if intensity_rsv > 0 {
            start + rd.decode_uniform((coded_bands + 1 - start) as u32) as usize
        } else {
            0
        };

        if alloc.intensity <= start {
            total += dual_stereo_rsv;
            dual_stereo_rsv = 0;
        }
        alloc.dual_stereo = dual_stereo_rsv > 0 && rd.decode_logp(1);

        let mut left = total - psum;
        let percoeff = left / self.span(start, coded_bands);
        left -= self.span(start, coded_bands) * percoeff;
        for j in start..coded_bands {
            bits[j] += percoeff * self.width(j);
        }
        for j in start..coded_bands {
            let tmp = left.min(self.width(j));
            bits[j] += tmp;
            left -= tmp;
        }

        let ebits = &mut alloc.fine_bits;
        let fine_priority = &mut alloc.fine_priority;
        let mut balance = 0;

        for j in start..coded_bands {
            let n = self.width(j) << self.lm;
            let bit = bits[j] + balance;

            let mut excess;
            if n > 1 {
                excess = (bit - cap[j]).max(0);
                bits[j] = bit - excess;

                // one extra degree of freedom for the stereo split
                let den = c * n
                    + (c == 2 && n > 2 && !alloc.dual_stereo && j < alloc.intensity) as i32;
                let nclogn = den * (self.mode.log_n[j] as i32 + log_m);
                let mut offset = (nclogn >> 1) - den * FINE_OFFSET;

                if n == 2 {
                    offset += den << BITRES >> 2;
                }

                if bits[j] + offset < den * 2 << BITRES {
                    offset += nclogn >> 2;
                } else if bits[j] + offset < den * 3 << BITRES {
                    offset += nclogn >> 3;
                }

                ebits[j] = (bits[j] + offset + (den << (BITRES - 1))).max(0);
                ebits[j] = (ebits[j] / den) >> BITRES;

                if c * ebits[j] > (bits[j] >> BITRES) {
                    ebits[j] = bits[j] >> stereo >> BITRES;
                }

                ebits[j] = ebits[j].min(MAX_FINE_BITS);
                fine_priority[j] = (ebits[j] * (den << BITRES) >= bits[j] + offset) as i32;
                bits[j] -= c * ebits[j] << BITRES;
            } else {
                excess = (bit - (c << BITRES)).max(0);
                bits[j] = bit - excess;
                ebits[j] = 0;
                fine_priority[j] = 1;
            }

            if excess > 0 {
                let extra_fine = (excess >> (stereo + BITRES)).min(MAX_FINE_BITS - ebits[j]);
                ebits[j] += extra_fine;
                let extra_bits = extra_fine * c << BITRES;
                fine_priority[j] = (extra_bits >= excess - balance) as i32;
                excess -= extra_bits;
            }
            balance = excess;
        }
        alloc.balance = balance;

        for j in coded_bands..end {
            ebits[j] = bits[j] >> stereo >> BITRES;
            bits[j] = 0;
            fine_priority[j] = (ebits[j] < 1) as i32;
        }

        alloc.coded_bands = coded_bands;

        alloc
    }
}

/// Decode the allocation of a frame.
///
/// `offsets` are the dynamic boosts and `cap` the per band maxima, both in
/// 1/8 bits; `total` is the budget left for the bands.
#[allow(clippy::too_many_arguments)]
pub fn compute_allocation(
    mode: &Mode,
    start: usize,
    end: usize,
    offsets: &[i32],
    cap: &[i32],
    alloc_trim: i32,
    total: i32,
    channels: usize,
    lm: usize,
    rd: &mut RangeDecoder,
) -> Allocation {
    let c = channels as i32;
    let lm = lm as i32;
    let budget = Budget {
        mode,
        start,
        end,
        channels: c,
        lm,
    };

    let mut total = total.max(0);
    let mut skip_start = start;

    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;

    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if c == 2 {
        intensity_rsv = LOG2_FRAC_TABLE[end - start] as i32;
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let mut bits1 = [0i32; MAX_BANDS];
    let mut bits2 = [0i32; MAX_BANDS];
    let mut thresh = [0i32; MAX_BANDS];
    let mut trim_offset = [0i32; MAX_BANDS];

    for j in start..end {
        let n = budget.width(j);
        thresh[j] = (c << BITRES).max((3 * n << lm << BITRES) >> 4);
        trim_offset[j] =
            c * n * (alloc_trim - 5 - lm) * (end - j - 1) as i32 * (1 << (lm + BITRES)) >> 6;
        // single coefficient bands get less resolution
        if n << lm == 1 {
            trim_offset[j] -= c << BITRES;
        }
    }

    let alloc_bits = |q: usize, j: usize| {
        c * budget.width(j) * (mode.alloc_vectors[q][j] as i32) << lm >> 2
    };

    let mut lo = 1;
    let mut hi = mode.nb_alloc_vectors - 1;
    loop {
        let mut done = false;
        let mut psum = 0;
        let mid = (lo + hi) >> 1;
        for j in (start..end).rev() {
            let mut bitsj = alloc_bits(mid, j);
            if bitsj > 0 {
                bitsj = (bitsj + trim_offset[j]).max(0);
            }
            bitsj += offsets[j];
            if bitsj >= thresh[j] || done {
                done = true;
                psum += bitsj.min(cap[j]);
            } else if bitsj >= c << BITRES {
                psum += c << BITRES;
            }
        }
        if psum > total {
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
        if lo > hi {
            break;
        }
    }

    let hi = lo;
    let lo = lo - 1;
    for j in start..end {
        let mut bits1j = alloc_bits(lo, j);
        let mut bits2j = if hi >= mode.nb_alloc_vectors {
            cap[j]
        } else {
            alloc_bits(hi, j)
        };
        if bits1j > 0 {
            bits1j = (bits1j + trim_offset[j]).max(0);
        }
        if bits2j > 0 {
            bits2j = (bits2j + trim_offset[j]).max(0);
        }
        if lo > 0 {
            bits1j += offsets[j];
        }
        bits2j += offsets[j];
        if offsets[j] > 0 {
            skip_start = j;
        }
        bits1[j] = bits1j;
        bits2[j] = (bits2j - bits1j).max(0);
    }

    budget.interpolate(
        skip_start,
        &bits1,
        &bits2,
        &thresh,
        cap,
        total,
        skip_rsv,
        intensity_rsv,
        dual_stereo_rsv,
        rd,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::test_encoder::RangeEncoder;

    fn caps(mode: &Mode, lm: usize, channels: usize, end: usize) -> Vec<i32> {
        (0..end)
            .map(|i| {
                let n = (mode.width(i) << lm) as i32;
                (mode.caps(lm, channels)[i] as i32 + 64) * channels as i32 * n >> 2
            })
            .collect()
    }

    #[test]
    fn pulses_and_bits_agree() {
        let mode = Mode::get();
        for band in 0..MAX_BANDS {
            for lm in 0..=3 {
                let cache = mode.cache.band(band, lm);
                for k in 1..=cache[0] as i32 {
                    let bits = pulses2bits(&mode, band, lm, k);
                    let pulses = bits2pulses(&mode, band, lm, bits);
                    assert_eq!(pulses2bits(&mode, band, lm, pulses), bits);
                }
                assert_eq!(bits2pulses(&mode, band, lm, 0), 0);
            }
        }
    }

    #[test]
    fn empty_budget() {
        let mode = Mode::get();
        let cap = caps(&mode, 3, 1, MAX_BANDS);
        let offsets = [0; MAX_BANDS];
        let buf = [0u8; 4];
        let mut rd = RangeDecoder::new(&buf);

        let alloc = compute_allocation(&mode, 0, MAX_BANDS, &offsets, &cap, 5, 0, 1, 3, &mut rd);

        assert!(alloc.pulses.iter().all(|&b| b == 0));
        assert!(alloc.fine_bits.iter().all(|&b| b == 0));
        assert_eq!(alloc.intensity, 0);
        assert!(!alloc.dual_stereo);
    }

    #[test]
    fn budget_is_not_exceeded() {
        let mode = Mode::get();
        let offsets = [0; MAX_BANDS];

        for &(channels, lm, total) in &[(1, 3, 8 * 8 * 160), (2, 3, 8 * 8 * 160), (1, 0, 8 * 400)] {
            let cap = caps(&mode, lm, channels, MAX_BANDS);
            // stop at the first skip decision, every band stays coded
            let mut enc = RangeEncoder::new(64);
            for _ in 0..MAX_BANDS {
                enc.encode_logp(true, 1);
            }
            let buf = enc.done();
            let mut rd = RangeDecoder::new(&buf);

            let alloc = compute_allocation(
                &mode, 0, MAX_BANDS, &offsets, &cap, 5, total, channels, lm, &mut rd,
            );

            let used: i32 = (0..MAX_BANDS)
                .map(|j| alloc.pulses[j] + ((channels as i32 * alloc.fine_bits[j]) << 3))
                .sum();
            assert!(used <= total, "{} > {}", used, total);
            assert!(alloc.coded_bands > 0 && alloc.coded_bands <= MAX_BANDS);
            assert!(alloc.fine_bits.iter().all(|&b| (0..=MAX_FINE_BITS).contains(&b)));
            if channels == 1 {
                assert_eq!(alloc.intensity, 0);
            } else {
                assert!(alloc.intensity <= alloc.coded_bands);
            }
        }
    }
}
