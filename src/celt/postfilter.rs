//! Pitch post-filter
//!
//! A three taps comb filter around the signalled period, cross-faded from
//! the parameters of the previous frame over the window overlap.

use crate::entropy::*;
use crate::maths::*;

pub const COMBFILTER_MINPERIOD: usize = 15;
pub const COMBFILTER_MAXPERIOD: usize = 1024;

const TAPSET: &ICDFContext = &ICDFContext {
    ftb: 2,
    dist: &[2, 1, 0],
};

/// Filter taps per tapset, Q15.
const GAINS: [[i32; 3]; 3] = [[10048, 7112, 4248], [15200, 8784, 0], [26208, 3280, 0]];

/// Post-filter parameters, a zero gain disables it.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PostFilter {
    pub period: usize,
    /// Q15
    pub gain: i32,
    pub tapset: usize,
}

impl PostFilter {
    /// Read the parameters after the post-filter flag.
    ///
    /// `total_bits` is the frame budget, the tapset is only coded if it fits.
    pub fn parse(rd: &mut RangeDecoder, total_bits: usize) -> Self {
        if !rd.decode_logp(1) {
            return Self::default();
        }

        let octave = rd.decode_uniform(6) as usize;
        let period = (16 << octave) + rd.rawbits(4 + octave) as usize - 1;
        let qg = rd.rawbits(3) as i32;
        let tapset = if rd.tell() + 2 <= total_bits {
            rd.decode_icdf(TAPSET)
        } else {
            0
        };
        let gain = 3072 * (qg + 1);

        trace!("postfilter: period {}, gain {}, tapset {}", period, gain, tapset);

        PostFilter {
            period,
            gain,
            tapset,
        }
    }
}

/// Run the comb filter over `n` samples of `y` starting at `pos`.
///
/// With `x` the input is read from `(buffer, position)` and the filter is
/// a FIR, otherwise it runs in place over `y` and the taps see the filtered
/// history. Either input needs `old.period.max(new.period) + 2` samples of
/// history before the position.
#[allow(clippy::too_many_arguments)]
pub fn comb_filter(
    y: &mut [i32],
    pos: usize,
    x: Option<(&[i32], usize)>,
    n: usize,
    old: &PostFilter,
    new: &PostFilter,
    window: &[i32],
    overlap: usize,
) {
    let read = move |y: &[i32], k: isize| -> i32 {
        match x {
            Some((x, p)) => x[(p as isize + k) as usize],
            None => y[(pos as isize + k) as usize],
        }
    };

    if old.gain == 0 && new.gain == 0 {
        if let Some((x, p)) = x {
            y[pos..pos + n].copy_from_slice(&x[p..p + n]);
        }
        return;
    }

    let t0 = old.period as isize;
    let t1 = new.period as isize;
    let g0: Vec<i32> = GAINS[old.tapset]
        .iter()
        .map(|&g| mult16_16_p15(old.gain, g))
        .collect();
    let g1: Vec<i32> = GAINS[new.tapset]
        .iter()
        .map(|&g| mult16_16_p15(new.gain, g))
        .collect();

    let mut x1 = read(y, -t1 + 1);
    let mut x2 = read(y, -t1);
    let mut x3 = read(y, -t1 - 1);
    let mut x4 = read(y, -t1 - 2);

    let overlap = if old == new { 0 } else { overlap.min(n) };

    for i in 0..overlap {
        let k = i as isize;
        let x0 = read(y, k - t1 + 2);
        let f = mult16_16_q15(window[i], window[i]);
        let nf = Q15_ONE - f;

        let v = read(y, k)
            .wrapping_add(mult16_32_q15(mult16_16_q15(nf, g0[0]), read(y, k - t0)))
            .wrapping_add(mult16_32_q15(
                mult16_16_q15(nf, g0[1]),
                read(y, k - t0 + 1).wrapping_add(read(y, k - t0 - 1)),
            ))
            .wrapping_add(mult16_32_q15(
                mult16_16_q15(nf, g0[2]),
                read(y, k - t0 + 2).wrapping_add(read(y, k - t0 - 2)),
            ))
            .wrapping_add(mult16_32_q15(mult16_16_q15(f, g1[0]), x2))
            .wrapping_add(mult16_32_q15(mult16_16_q15(f, g1[1]), x1.wrapping_add(x3)))
            .wrapping_add(mult16_32_q15(mult16_16_q15(f, g1[2]), x0.wrapping_add(x4)));
        y[pos + i] = v;

        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    }

    if new.gain == 0 {
        if let Some((x, p)) = x {
            y[pos + overlap..pos + n].copy_from_slice(&x[p + overlap..p + n]);
        }
        return;
    }

    for i in overlap..n {
        let k = i as isize;
        let x0 = read(y, k - t1 + 2);
        let v = read(y, k)
            .wrapping_add(mult16_32_q15(g1[0], x2))
            .wrapping_add(mult16_32_q15(g1[1], x1.wrapping_add(x3)))
            .wrapping_add(mult16_32_q15(g1[2], x0.wrapping_add(x4)));
        y[pos + i] = v;

        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::test_encoder::RangeEncoder;

    const PF: PostFilter = PostFilter {
        period: 20,
        gain: 16384,
        tapset: 0,
    };

    fn impulse() -> (Vec<i32>, usize) {
        let pos = 24;
        let mut buf = vec![0; pos + 40];
        buf[pos] = 1 << 20;
        (buf, pos)
    }

    #[test]
    fn disabled_is_identity() {
        let (mut buf, pos) = impulse();
        let orig = buf.clone();
        let off = PostFilter::default();
        comb_filter(&mut buf, pos, None, 40, &off, &off, &[], 0);
        assert_eq!(buf, orig);

        let mut out = vec![7; 40];
        comb_filter(&mut out, 0, Some((&orig, pos)), 40, &off, &off, &[], 0);
        assert_eq!(&out[..], &orig[pos..]);
    }

    #[test]
    fn impulse_response() {
        let (mut buf, pos) = impulse();
        comb_filter(&mut buf, pos, None, 40, &PF, &PF, &[], 0);

        let y = &buf[pos..];
        assert_eq!(y[0], 1 << 20);
        assert_eq!(&y[18..23], &[67968, 113792, 160768, 113792, 67968]);
        assert!(y[1..18].iter().all(|&v| v == 0));
        // in place the echo is filtered again
        assert!(y[38] != 0);
    }

    #[test]
    fn separate_output_is_fir() {
        let (x, pos) = impulse();
        let mut y = vec![0; 40];
        comb_filter(&mut y, 0, Some((&x, pos)), 40, &PF, &PF, &[], 0);

        assert_eq!(&y[18..23], &[67968, 113792, 160768, 113792, 67968]);
        assert_eq!(y[38], 0);
    }

    #[test]
    fn cross_fade_starts_from_old() {
        let (mut buf, pos) = impulse();
        let window = vec![0; 40];
        let off = PostFilter::default();
        // a null window keeps the old, disabled, filter over the overlap
        comb_filter(&mut buf, pos, None, 40, &off, &PF, &window, 30);

        assert!(buf[pos + 1..pos + 30].iter().all(|&v| v == 0));
    }

    #[test]
    fn parse() {
        let mut enc = RangeEncoder::new(16);
        enc.encode_logp(true, 1);
        enc.encode_uniform(1, 6);
        enc.rawbits(5, 5);
        enc.rawbits(3, 3);
        enc.encode_icdf(2, TAPSET);
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);
        let pf = PostFilter::parse(&mut rd, buf.len() * 8);
        assert_eq!(
            pf,
            PostFilter {
                period: 36,
                gain: 12288,
                tapset: 2
            }
        );
    }
}
