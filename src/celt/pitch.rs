//! Pitch estimation over the decoded history
//!
//! The history is low-passed and decimated by 2, then searched at 4x
//! decimation and refined around the two best candidates.

use crate::maths::*;

use super::lpc::{autocorr, lpc, SIG_SHIFT};

/// Low-pass, decimate by 2 and whiten the channels of `x`, summing them.
pub fn pitch_downsample(x: &[&[i32]], x_lp: &mut [i32]) {
    let len = x_lp.len() * 2;

    let maxabs = x.iter().map(|c| celt_maxabs32(&c[..len])).max().unwrap_or(0).max(1);
    let mut shift = (celt_ilog2(maxabs) - 10).max(0) as u32;
    if x.len() == 2 {
        shift += 1;
    }

    for (c, ch) in x.iter().enumerate() {
        let mut add = |i: usize, v: i32| {
            let v = v >> shift;
            x_lp[i] = if c == 0 { v } else { x_lp[i].wrapping_add(v) };
        };
        add(0, half32(half32(ch[1]).wrapping_add(ch[0])));
        for i in 1..len >> 1 {
            add(
                i,
                half32(half32(ch[2 * i - 1].wrapping_add(ch[2 * i + 1])).wrapping_add(ch[2 * i])),
            );
        }
    }
    for v in x_lp.iter_mut() {
        *v = extract16(*v);
    }

    let mut ac = [0; 5];
    autocorr(x_lp, &mut ac, &[], 0);

    // noise floor at -40dB
    ac[0] += ac[0] >> 13;
    // lag windowing
    for (i, a) in ac.iter_mut().enumerate().skip(1) {
        *a -= mult16_32_q15((2 * i * i) as i32, *a);
    }

    let mut coef = [0; 4];
    lpc(&mut coef, &ac);

    let mut tmp = Q15_ONE;
    for c in coef.iter_mut() {
        tmp = mult16_16_q15(29491, tmp);
        *c = mult16_16_q15(*c, tmp);
    }

    // add a zero
    const C1: i32 = 26214;
    let num = [
        coef[0] + 3277,
        coef[1] + mult16_16_q15(C1, coef[0]),
        coef[2] + mult16_16_q15(C1, coef[1]),
        coef[3] + mult16_16_q15(C1, coef[2]),
        mult16_16_q15(C1, coef[3]),
    ];
    fir5(x_lp, &num);
}

fn fir5(x: &mut [i32], num: &[i32; 5]) {
    let mut mem = [0i32; 5];

    for v in x.iter_mut() {
        let sum = num
            .iter()
            .zip(mem.iter())
            .fold(*v << SIG_SHIFT, |s, (&n, &m)| mac16_16(s, n, m));
        mem.rotate_right(1);
        mem[0] = *v;
        *v = round16(sum, SIG_SHIFT);
    }
}

/// Cross-correlation of `x` with `y` at the lags `0..xcorr.len()`,
/// returns the largest value, at least 1.
fn pitch_xcorr(x: &[i32], y: &[i32], xcorr: &mut [i32]) -> i32 {
    let len = x.len();

    xcorr.iter_mut().enumerate().fold(1, |maxcorr, (i, xc)| {
        *xc = x
            .iter()
            .zip(&y[i..i + len])
            .fold(0i32, |s, (&a, &b)| mac16_16(s, a, b));
        maxcorr.max(*xc)
    })
}

fn find_best_pitch(
    xcorr: &[i32],
    y: &[i32],
    len: usize,
    yshift: u32,
    maxcorr: i32,
) -> [usize; 2] {
    let xshift = celt_ilog2(maxcorr) - 14;
    let mut best_num = [-1i32; 2];
    let mut best_den = [0i32; 2];
    let mut best_pitch = [0, 1];

    let mut syy = y[..len]
        .iter()
        .fold(1i32, |s, &v| s.wrapping_add(mult16_16(v, v) >> yshift));

    for (i, &xc) in xcorr.iter().enumerate() {
        if xc > 0 {
            let xcorr16 = extract16(vshr32(xc, xshift));
            let num = mult16_16_q15(xcorr16, xcorr16);
            if mult16_32_q15(num, best_den[1]) > mult16_32_q15(best_num[1], syy) {
                if mult16_32_q15(num, best_den[0]) > mult16_32_q15(best_num[0], syy) {
                    best_num[1] = best_num[0];
                    best_den[1] = best_den[0];
                    best_pitch[1] = best_pitch[0];
                    best_num[0] = num;
                    best_den[0] = syy;
                    best_pitch[0] = i;
                } else {
                    best_num[1] = num;
                    best_den[1] = syy;
                    best_pitch[1] = i;
                }
            }
        }
        syy += (mult16_16(y[i + len], y[i + len]) >> yshift) - (mult16_16(y[i], y[i]) >> yshift);
        syy = syy.max(1);
    }

    best_pitch
}

/// Best lag of `x_lp` within `y` over `0..max_pitch`.
///
/// Both signals are decimated by 2, `len` and the result count full rate
/// samples.
pub fn pitch_search(x_lp: &[i32], y: &[i32], len: usize, max_pitch: usize) -> usize {
    let lag = len + max_pitch;

    let mut x_lp4: Vec<i32> = x_lp.iter().step_by(2).take(len >> 2).cloned().collect();
    let mut y_lp4: Vec<i32> = y.iter().step_by(2).take(lag >> 2).cloned().collect();

    let xmax = celt_maxabs16(&x_lp4);
    let ymax = celt_maxabs16(&y_lp4);
    let mut shift = celt_ilog2(xmax.max(ymax).max(1)) - 11;
    if shift > 0 {
        x_lp4.iter_mut().for_each(|v| *v >>= shift);
        y_lp4.iter_mut().for_each(|v| *v >>= shift);
        // doubled for a MAC
        shift *= 2;
    } else {
        shift = 0;
    }
    let shift = shift as u32;

    let mut xcorr = vec![0; max_pitch >> 1];
    let maxcorr = pitch_xcorr(&x_lp4, &y_lp4, &mut xcorr[..max_pitch >> 2]);
    let best_pitch = find_best_pitch(&xcorr[..max_pitch >> 2], &y_lp4, len >> 2, 0, maxcorr);

    // finer search around the coarse candidates
    let mut maxcorr = 1;
    for (i, xc) in xcorr.iter_mut().enumerate() {
        *xc = 0;
        let near = |p: usize| (i as isize - 2 * p as isize).abs() <= 2;
        if !near(best_pitch[0]) && !near(best_pitch[1]) {
            continue;
        }
        let sum = x_lp[..len >> 1]
            .iter()
            .zip(&y[i..])
            .fold(0i32, |s, (&a, &b)| s.wrapping_add(mult16_16(a, b) >> shift));
        *xc = sum.max(-1);
        maxcorr = maxcorr.max(sum);
    }
    let best_pitch = find_best_pitch(&xcorr, y, len >> 1, shift + 1, maxcorr);

    // pseudo-interpolation
    let offset = if best_pitch[0] > 0 && best_pitch[0] < (max_pitch >> 1) - 1 {
        let a = xcorr[best_pitch[0] - 1];
        let b = xcorr[best_pitch[0]];
        let c = xcorr[best_pitch[0] + 1];
        if c - a > mult16_32_q15(22938, b - a) {
            1
        } else if a - c > mult16_32_q15(22938, b - c) {
            -1
        } else {
            0
        }
    } else {
        0
    };

    (2 * best_pitch[0] as isize - offset) as usize
}
