//! Inverse MDCT
//!
//! A single lookup serves every frame size: the `shift` argument halves the
//! transform length, so the 1920 point transform covers the 2.5ms short
//! blocks at shift 3.

use crate::complex::Complex;
use crate::maths::*;

use super::fft::KissFft;

#[derive(Debug)]
pub struct MdctLookup {
    n: usize,
    trig: Vec<Vec<i32>>,
    fft: Vec<KissFft>,
}

impl MdctLookup {
    pub fn new(n: usize, max_shift: usize) -> Self {
        let mut trig = Vec::with_capacity(max_shift + 1);
        let mut fft = Vec::with_capacity(max_shift + 1);

        for shift in 0..=max_shift {
            let len = n >> shift;
            let n2 = len >> 1;
            let t = (0..n2)
                .map(|i| celt_cos_norm((((i as i32) << 17) + n2 as i32 + 16384) / len as i32))
                .collect();
            trig.push(t);
            fft.push(KissFft::new(len >> 2));
        }

        MdctLookup { n, trig, fft }
    }

    /// Compute the inverse transform of `input`, read with the given stride,
    /// into `out` and mix the first `overlap` samples with what `out`
    /// already holds.
    ///
    /// `out` must span at least `overlap / 2 + n / 2` samples.
    pub fn backward(
        &self,
        input: &[i32],
        out: &mut [i32],
        window: &[i32],
        overlap: usize,
        shift: usize,
        stride: usize,
    ) {
        let n = self.n >> shift;
        let n2 = n >> 1;
        let n4 = n >> 2;
        let trig = &self.trig[shift];
        let fft = &self.fft[shift];
        let half = overlap >> 1;

        let mut f = vec![Complex::new(0, 0); n4];

        for i in 0..n4 {
            let x1 = input[2 * stride * i];
            let x2 = input[stride * (n2 - 1) - 2 * stride * i];
            let yr = mult16_32_q15(trig[i], x2).wrapping_add(mult16_32_q15(trig[n4 + i], x1));
            let yi = mult16_32_q15(trig[i], x1).wrapping_sub(mult16_32_q15(trig[n4 + i], x2));
            // real and imaginary swapped, the forward transform does the inverse
            f[fft.bitrev[i]] = Complex::new(yi, yr);
        }

        fft.process(&mut f);

        {
            let y = &mut out[half..half + n2];
            for (pair, v) in y.chunks_exact_mut(2).zip(f.iter()) {
                pair[0] = v.re;
                pair[1] = v.im;
            }

            let mut p0 = 0;
            let mut p1 = n2 - 2;
            for i in 0..(n4 + 1) >> 1 {
                let re = y[p0 + 1];
                let im = y[p0];
                let (t0, t1) = (trig[i], trig[n4 + i]);
                let yr = mult16_32_q15(t0, re).wrapping_add(mult16_32_q15(t1, im));
                let yi = mult16_32_q15(t1, re).wrapping_sub(mult16_32_q15(t0, im));

                let re = y[p1 + 1];
                let im = y[p1];
                y[p0] = yr;
                y[p1 + 1] = yi;

                let (t0, t1) = (trig[n4 - i - 1], trig[n2 - i - 1]);
                let yr = mult16_32_q15(t0, re).wrapping_add(mult16_32_q15(t1, im));
                let yi = mult16_32_q15(t1, re).wrapping_sub(mult16_32_q15(t0, im));
                y[p1] = yr;
                y[p0 + 1] = yi;

                p0 += 2;
                p1 = p1.wrapping_sub(2);
            }
        }

        for i in 0..half {
            let x1 = out[overlap - 1 - i];
            let x2 = out[i];
            let (w1, w2) = (window[i], window[overlap - 1 - i]);
            out[i] = mult16_32_q15(w2, x2).wrapping_sub(mult16_32_q15(w1, x1));
            out[overlap - 1 - i] = mult16_32_q15(w1, x2).wrapping_add(mult16_32_q15(w2, x1));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flat_window(overlap: usize) -> Vec<i32> {
        vec![Q15_ONE; overlap]
    }

    #[test]
    fn silence_stays_silent() {
        let mdct = MdctLookup::new(1920, 3);
        let input = vec![0; 960];
        let mut out = vec![0; 1080];
        mdct.backward(&input, &mut out, &flat_window(120), 120, 0, 1);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn linear_and_bounded() {
        let mdct = MdctLookup::new(1920, 3);
        let n2 = 240;
        let mut seed = 7u32;
        let input: Vec<i32> = (0..n2)
            .map(|_| {
                seed = celt_lcg_rand(seed);
                (seed as i32) >> 12
            })
            .collect();
        let doubled: Vec<i32> = input.iter().map(|v| v * 2).collect();

        let mut a = vec![0; n2 + 60 + 16];
        let mut b = vec![0; n2 + 60 + 16];
        mdct.backward(&input, &mut a, &flat_window(120), 120, 2, 1);
        mdct.backward(&doubled, &mut b, &flat_window(120), 120, 2, 1);

        for (x, y) in a.iter().zip(b.iter()) {
            assert!((2 * x - y).abs() <= 256, "{} {}", x, y);
        }
        assert!(a[..n2 + 60].iter().any(|&v| v != 0));
        assert!(a[n2 + 60..].iter().all(|&v| v == 0));
    }

    #[test]
    fn trig_table_sizes() {
        let mdct = MdctLookup::new(1920, 3);
        assert_eq!(mdct.trig[0].len(), 960);
        assert_eq!(mdct.trig[3].len(), 120);
        assert_eq!(mdct.fft[0].nfft, 480);
        assert_eq!(mdct.fft[3].nfft, 60);
    }
}
