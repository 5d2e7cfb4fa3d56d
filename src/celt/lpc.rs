//! Linear prediction for the pitch based concealment

use crate::maths::*;

pub const LPC_ORDER: usize = 24;
/// Extra headroom bits of the synthesis signal over 16-bit PCM.
pub const SIG_SHIFT: u32 = 12;

/// Autocorrelation of `x` for lags `0..ac.len()`, `window` tapers `overlap`
/// samples on both ends. Returns the scale applied to `ac`.
pub fn autocorr(x: &[i32], ac: &mut [i32], window: &[i32], overlap: usize) -> i32 {
    let n = x.len();
    let lag = ac.len() - 1;

    let mut xx = x.to_vec();
    for i in 0..overlap {
        xx[i] = mult16_16_q15(x[i], window[i]);
        xx[n - i - 1] = mult16_16_q15(x[n - i - 1], window[i]);
    }

    let mut ac0 = 1 + ((n as i32) << 7);
    for &v in xx.iter() {
        ac0 = ac0.wrapping_add(mult16_16(v, v) >> 9);
    }

    let mut shift = (celt_ilog2(ac0) - 30 + 10) / 2;
    if shift > 0 {
        for v in xx.iter_mut() {
            *v = pshr32(*v, shift as u32);
        }
    } else {
        shift = 0;
    }

    for (k, a) in ac.iter_mut().enumerate() {
        *a = (k..n).fold(0i32, |d, i| d.wrapping_add(mult16_16(xx[i], xx[i - k])));
    }

    let mut shift = 2 * shift;
    if shift <= 0 {
        ac[0] += 1 << -shift;
    }
    if ac[0] < 268435456 {
        let shift2 = 29 - ac[0].ec_ilog() as i32;
        for a in ac.iter_mut().take(lag + 1) {
            *a <<= shift2;
        }
        shift -= shift2;
    } else if ac[0] >= 536870912 {
        let shift2 = if ac[0] >= 1073741824 { 2 } else { 1 };
        for a in ac.iter_mut().take(lag + 1) {
            *a >>= shift2;
        }
        shift += shift2;
    }

    shift
}

/// Levinson-Durbin recursion, `lpc` gets `ac.len() - 1` Q12 coefficients.
pub fn lpc(lpc: &mut [i32], ac: &[i32]) {
    let p = lpc.len();
    let mut acc = [0i32; LPC_ORDER];
    let mut error = ac[0];

    if ac[0] != 0 {
        for i in 0..p {
            let mut rr = 0i32;
            for j in 0..i {
                rr = rr.wrapping_add(mult32_32_q31(acc[j], ac[i - j]));
            }
            rr = rr.wrapping_add(ac[i + 1] >> 3);
            let r = -frac_div32(rr << 3, error);
            acc[i] = r >> 3;

            for j in 0..(i + 1) >> 1 {
                let tmp1 = acc[j];
                let tmp2 = acc[i - 1 - j];
                acc[j] = tmp1.wrapping_add(mult32_32_q31(r, tmp2));
                acc[i - 1 - j] = tmp2.wrapping_add(mult32_32_q31(r, tmp1));
            }

            error -= mult32_32_q31(mult32_32_q31(r, r), error);
            // 30dB of prediction gain is enough
            if error < ac[0] >> 10 {
                break;
            }
        }
    }

    for (l, &a) in lpc.iter_mut().zip(acc.iter()) {
        *l = round16(a, 16);
    }
}

/// Analysis filter, in place. `mem` holds the previous inputs, the most
/// recent first.
pub fn fir(x: &mut [i32], num: &[i32], mem: &[i32]) {
    let ord = num.len();
    let n = x.len();

    let mut hist = Vec::with_capacity(n + ord);
    hist.extend(mem[..ord].iter().rev());
    hist.extend_from_slice(x);

    for i in 0..n {
        let sum = num
            .iter()
            .enumerate()
            .fold(0i32, |s, (k, &c)| mac16_16(s, c, hist[i + ord - 1 - k]));
        x[i] = saturate16(hist[i + ord] + pshr32(sum, SIG_SHIFT));
    }
}

/// Synthesis filter, in place over the 32-bit signal. The recursion runs on
/// the 16-bit rounded outputs, `mem` seeds it the same way as in `fir`.
pub fn iir(x: &mut [i32], den: &[i32], mem: &[i32]) {
    let ord = den.len();
    let n = x.len();

    // negated, like the delay line of the reference filter
    let mut y = vec![0i32; n + ord];
    for i in 0..ord {
        y[i] = -mem[ord - i - 1];
    }

    for i in 0..n {
        let mut sum = x[i];
        for (k, &d) in den.iter().enumerate() {
            sum = mac16_16(sum, d, y[i + ord - 1 - k]);
        }
        y[i + ord] = extract16(-round16(sum, SIG_SHIFT));
        x[i] = sum;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decaying_signal() {
        let x: Vec<i32> = (0..256).map(|i| (10000.0 * 0.9f64.powi(i)) as i32).collect();
        let mut ac = [0; 2];
        autocorr(&x, &mut ac, &[], 0);
        assert!(ac[0] >= 1 << 28 && ac[0] < 1 << 29);

        let mut a = [0; 1];
        lpc(&mut a, &ac);
        // Q12 predictor, x[n] + a x[n - 1] cancels
        assert!((a[0] + 3686).abs() < 40, "{}", a[0]);
    }

    #[test]
    fn silent_history() {
        let x = vec![0; 128];
        let mut ac = [0; LPC_ORDER + 1];
        autocorr(&x, &mut ac, &[], 0);
        let mut a = [7; LPC_ORDER];
        lpc(&mut a, &ac);
        assert!(a.iter().all(|&v| v == 0));
    }

    #[test]
    fn synthesis_inverts_analysis() {
        let mut seed = 3u32;
        let mut x: Vec<i32> = Vec::new();
        let mut prev = 0;
        for _ in 0..480 {
            seed = celt_lcg_rand(seed);
            prev = (prev * 3) / 4 + ((seed as i32) >> 22);
            x.push(prev);
        }

        let mut ac = [0; LPC_ORDER + 1];
        autocorr(&x, &mut ac, &[], 0);
        let mut a = [0; LPC_ORDER];
        lpc(&mut a, &ac);

        let mem = [0; LPC_ORDER];
        let mut exc = x.clone();
        fir(&mut exc, &a, &mem);

        let mut sig: Vec<i32> = exc.iter().map(|&e| e << SIG_SHIFT).collect();
        iir(&mut sig, &a, &mem);

        for (&s, &v) in sig.iter().zip(x.iter()) {
            assert!((round16(s, SIG_SHIFT) - v).abs() <= 8, "{} {}", s, v);
        }
    }
}
