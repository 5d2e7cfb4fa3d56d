//! Fixed-point mixed radix FFT
//!
//! Forward transform only, without any scaling: the inverse MDCT provides
//! the headroom it needs.

use crate::complex::Complex;
use crate::maths::*;

type Cpx = Complex<i32>;

#[derive(Debug)]
pub struct KissFft {
    pub nfft: usize,
    factors: Vec<(usize, usize)>,
    pub bitrev: Vec<usize>,
    twiddles: Vec<Cpx>,
}

#[inline(always)]
fn s_mul(a: i32, b: i32) -> i32 {
    mult16_32_q15(b, a)
}

#[inline(always)]
fn c_add(a: Cpx, b: Cpx) -> Cpx {
    Cpx::new(a.re.wrapping_add(b.re), a.im.wrapping_add(b.im))
}

#[inline(always)]
fn c_sub(a: Cpx, b: Cpx) -> Cpx {
    Cpx::new(a.re.wrapping_sub(b.re), a.im.wrapping_sub(b.im))
}

#[inline(always)]
fn c_mul(a: Cpx, b: Cpx) -> Cpx {
    Cpx::new(
        s_mul(a.re, b.re).wrapping_sub(s_mul(a.im, b.im)),
        s_mul(a.re, b.im).wrapping_add(s_mul(a.im, b.re)),
    )
}

#[inline(always)]
fn c_scale(a: Cpx, s: i32) -> Cpx {
    Cpx::new(s_mul(a.re, s), s_mul(a.im, s))
}

/// Radix 4 first, then 2, then the odd factors, output in the reverse order.
fn factor(mut n: usize) -> Vec<(usize, usize)> {
    let mut radix = Vec::new();
    let mut p = 4;

    loop {
        while n % p != 0 {
            p = match p {
                4 => 2,
                2 => 3,
                _ => p + 2,
            };
            if p * p > n {
                p = n;
            }
        }
        n /= p;
        debug_assert!(p <= 5, "unsupported radix {}", p);
        if p == 2 && radix.len() > 1 {
            radix.push(4);
            radix[1] = 2;
        } else {
            radix.push(p);
        }
        if n <= 1 {
            break;
        }
    }

    radix.reverse();

    let mut m = radix.iter().product::<usize>();
    radix
        .into_iter()
        .map(|p| {
            m /= p;
            (p, m)
        })
        .collect()
}

fn bitrev_table(fout: usize, table: &mut [usize], fstride: usize, factors: &[(usize, usize)]) {
    let (p, m) = factors[0];

    if m == 1 {
        for j in 0..p {
            table[j * fstride] = fout + j;
        }
    } else {
        for j in 0..p {
            bitrev_table(fout + j * m, &mut table[j * fstride..], fstride * p, &factors[1..]);
        }
    }
}

impl KissFft {
    pub fn new(nfft: usize) -> Self {
        let factors = factor(nfft);
        let mut bitrev = vec![0; nfft];
        bitrev_table(0, &mut bitrev, 1, &factors);

        let twiddles = (0..nfft)
            .map(|i| {
                let phase = (-(i as i32) << 17) / nfft as i32;
                Cpx::new(celt_cos_norm(phase), celt_cos_norm(phase - 32768))
            })
            .collect();

        KissFft {
            nfft,
            factors,
            bitrev,
            twiddles,
        }
    }

    fn bfly2(&self, fout: &mut [Cpx], m: usize, n: usize) {
        debug_assert_eq!(m, 4);
        let tw = qconst16(0.7071067812, 15);

        for f in fout.chunks_exact_mut(8).take(n) {
            let t = f[4];
            f[4] = c_sub(f[0], t);
            f[0] = c_add(f[0], t);

            let t = Cpx::new(
                s_mul(f[5].re.wrapping_add(f[5].im), tw),
                s_mul(f[5].im.wrapping_sub(f[5].re), tw),
            );
            f[5] = c_sub(f[1], t);
            f[1] = c_add(f[1], t);

            let t = Cpx::new(f[6].im, f[6].re.wrapping_neg());
            f[6] = c_sub(f[2], t);
            f[2] = c_add(f[2], t);

            let t = Cpx::new(
                s_mul(f[7].im.wrapping_sub(f[7].re), tw),
                s_mul(f[7].im.wrapping_add(f[7].re).wrapping_neg(), tw),
            );
            f[7] = c_sub(f[3], t);
            f[3] = c_add(f[3], t);
        }
    }

    fn bfly3(&self, fout: &mut [Cpx], fstride: usize, m: usize, n: usize, mm: usize) {
        let m2 = 2 * m;
        let epi3 = -28378;

        for i in 0..n {
            let f = &mut fout[i * mm..];
            for k in 0..m {
                let s1 = c_mul(f[m + k], self.twiddles[k * fstride]);
                let s2 = c_mul(f[m2 + k], self.twiddles[2 * k * fstride]);
                let s3 = c_add(s1, s2);
                let s0 = c_scale(c_sub(s1, s2), epi3);

                let fm = Cpx::new(
                    f[k].re.wrapping_sub(half32(s3.re)),
                    f[k].im.wrapping_sub(half32(s3.im)),
                );
                f[k] = c_add(f[k], s3);

                f[m2 + k] = Cpx::new(fm.re.wrapping_add(s0.im), fm.im.wrapping_sub(s0.re));
                f[m + k] = Cpx::new(fm.re.wrapping_sub(s0.im), fm.im.wrapping_add(s0.re));
            }
        }
    }

    fn bfly4(&self, fout: &mut [Cpx], fstride: usize, m: usize, n: usize, mm: usize) {
        if m == 1 {
            for i in 0..n {
                let f = &mut fout[i * mm..];
                let s0 = c_sub(f[0], f[2]);
                let f0 = c_add(f[0], f[2]);
                let s1 = c_add(f[1], f[3]);
                f[2] = c_sub(f0, s1);
                f[0] = c_add(f0, s1);
                let s1 = c_sub(f[1], f[3]);

                f[1] = Cpx::new(s0.re.wrapping_add(s1.im), s0.im.wrapping_sub(s1.re));
                f[3] = Cpx::new(s0.re.wrapping_sub(s1.im), s0.im.wrapping_add(s1.re));
            }
        } else {
            let m2 = 2 * m;
            let m3 = 3 * m;
            for i in 0..n {
                let f = &mut fout[i * mm..];
                for j in 0..m {
                    let s0 = c_mul(f[j + m], self.twiddles[j * fstride]);
                    let s1 = c_mul(f[j + m2], self.twiddles[2 * j * fstride]);
                    let s2 = c_mul(f[j + m3], self.twiddles[3 * j * fstride]);

                    let s5 = c_sub(f[j], s1);
                    let f0 = c_add(f[j], s1);
                    let s3 = c_add(s0, s2);
                    let s4 = c_sub(s0, s2);
                    f[j + m2] = c_sub(f0, s3);
                    f[j] = c_add(f0, s3);

                    f[j + m] = Cpx::new(s5.re.wrapping_add(s4.im), s5.im.wrapping_sub(s4.re));
                    f[j + m3] = Cpx::new(s5.re.wrapping_sub(s4.im), s5.im.wrapping_add(s4.re));
                }
            }
        }
    }

    fn bfly5(&self, fout: &mut [Cpx], fstride: usize, m: usize, n: usize, mm: usize) {
        let ya = Cpx::new(10126, -31164);
        let yb = Cpx::new(-26510, -19261);

        for i in 0..n {
            let f = &mut fout[i * mm..];
            for u in 0..m {
                let s0 = f[u];
                let s1 = c_mul(f[m + u], self.twiddles[u * fstride]);
                let s2 = c_mul(f[2 * m + u], self.twiddles[2 * u * fstride]);
                let s3 = c_mul(f[3 * m + u], self.twiddles[3 * u * fstride]);
                let s4 = c_mul(f[4 * m + u], self.twiddles[4 * u * fstride]);

                let s7 = c_add(s1, s4);
                let s10 = c_sub(s1, s4);
                let s8 = c_add(s2, s3);
                let s9 = c_sub(s2, s3);

                f[u] = c_add(s0, c_add(s7, s8));

                let s5 = Cpx::new(
                    s0.re
                        .wrapping_add(s_mul(s7.re, ya.re).wrapping_add(s_mul(s8.re, yb.re))),
                    s0.im
                        .wrapping_add(s_mul(s7.im, ya.re).wrapping_add(s_mul(s8.im, yb.re))),
                );
                let s6 = Cpx::new(
                    s_mul(s10.im, ya.im).wrapping_add(s_mul(s9.im, yb.im)),
                    s_mul(s10.re, ya.im)
                        .wrapping_neg()
                        .wrapping_sub(s_mul(s9.re, yb.im)),
                );
                f[m + u] = c_sub(s5, s6);
                f[4 * m + u] = c_add(s5, s6);

                let s11 = Cpx::new(
                    s0.re
                        .wrapping_add(s_mul(s7.re, yb.re))
                        .wrapping_add(s_mul(s8.re, ya.re)),
                    s0.im
                        .wrapping_add(s_mul(s7.im, yb.re))
                        .wrapping_add(s_mul(s8.im, ya.re)),
                );
                let s12 = Cpx::new(
                    s_mul(s9.im, ya.im).wrapping_sub(s_mul(s10.im, yb.im)),
                    s_mul(s10.re, yb.im).wrapping_sub(s_mul(s9.re, ya.im)),
                );
                f[2 * m + u] = c_add(s11, s12);
                f[3 * m + u] = c_sub(s11, s12);
            }
        }
    }

    /// In-place transform of data already stored in bit-reversed order.
    pub fn process(&self, fout: &mut [Cpx]) {
        let stages = self.factors.len();
        let mut fstride = vec![1; stages + 1];

        for (l, &(p, _)) in self.factors.iter().enumerate() {
            fstride[l + 1] = fstride[l] * p;
        }

        let mut m = self.factors[stages - 1].1;
        for i in (0..stages).rev() {
            let m2 = if i != 0 { self.factors[i - 1].1 } else { 1 };
            match self.factors[i].0 {
                2 => self.bfly2(fout, m, fstride[i]),
                3 => self.bfly3(fout, fstride[i], m, fstride[i], m2),
                4 => self.bfly4(fout, fstride[i], m, fstride[i], m2),
                _ => self.bfly5(fout, fstride[i], m, fstride[i], m2),
            }
            m = m2;
        }
    }

    /// Out-of-place transform in natural order.
    pub fn fft(&self, input: &[Cpx], output: &mut [Cpx]) {
        for (&rev, &v) in self.bitrev.iter().zip(input.iter()) {
            output[rev] = v;
        }
        self.process(output);
    }
}
