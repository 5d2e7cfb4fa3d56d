//! Enumeration of the PVQ codebook
//!
//! A codeword is a vector of `n` integers whose absolute values sum to `k`.
//! The index of a codeword is computed with the `U(n, k)` recurrence of the
//! unsigned combinations, one row at a time.

use crate::entropy::*;
use crate::maths::*;

/// Largest pulse count a band can hold, as used by the pulse cache.
pub const MAX_PULSES: usize = 128;

/// log2(val) in `frac` fractional bits, rounded up.
pub fn log2_frac(val: u32, frac: usize) -> i32 {
    let mut l = val.ec_ilog() as i32;

    if val & val.wrapping_sub(1) != 0 {
        let mut val = if l > 16 {
            ((val - 1) >> (l - 16)) + 1
        } else {
            val << (16 - l)
        };
        l = (l - 1) << frac;

        let mut f = frac;
        loop {
            let b = val >> 16;
            l += (b << f) as i32;
            val = (val + b) >> b;
            val = val.wrapping_mul(val).wrapping_add(0x7fff) >> 15;
            if f == 0 {
                break;
            }
            f -= 1;
        }

        l + (val > 0x8000) as i32
    } else {
        (l - 1) << frac
    }
}

/// Whether V(n, k) fits in 32 bits.
pub fn fits_in32(n: usize, k: usize) -> bool {
    const MAX_N: [usize; 15] = [
        32767, 32767, 32767, 1476, 283, 109, 60, 40, 29, 24, 20, 18, 16, 14, 13,
    ];
    const MAX_K: [usize; 15] = [
        32767, 32767, 32767, 32767, 1172, 238, 95, 53, 36, 27, 22, 18, 16, 15, 13,
    ];

    if n >= 14 {
        if k >= 14 {
            false
        } else {
            n <= MAX_N[k]
        }
    } else {
        k <= MAX_K[n]
    }
}

/// Advance a row of U by one dimension.
fn unext(u: &mut [u32], len: usize, mut u0: u32) {
    for j in 1..len {
        let u1 = u[j].wrapping_add(u[j - 1]).wrapping_add(u0);
        u[j - 1] = u0;
        u0 = u1;
    }
    u[len - 1] = u0;
}

/// Step a row of U back by one dimension.
fn uprev(u: &mut [u32], len: usize, mut u0: u32) {
    for j in 1..len {
        let u1 = u[j].wrapping_sub(u[j - 1]).wrapping_sub(u0);
        u[j - 1] = u0;
        u0 = u1;
    }
    u[len - 1] = u0;
}

/// Fill `u` with U(n, 0..=k+1) and return V(n, k).
fn ncwrs_urow(n: usize, k: usize, u: &mut [u32]) -> u32 {
    debug_assert!(n >= 2 && k > 0);
    let len = k + 2;

    u[0] = 0;
    u[1] = 1;
    for j in 2..len {
        u[j] = ((j as u32) << 1) - 1;
    }
    for _ in 2..n {
        unext(&mut u[1..], k + 1, 1);
    }

    u[k].wrapping_add(u[k + 1])
}

/// Index to codeword, returns the squared norm of `y`.
fn cwrsi(mut k: usize, mut i: u32, y: &mut [i32], u: &mut [u32]) -> i32 {
    let mut yy = 0;

    for v in y.iter_mut() {
        let p = u[k + 1];
        let s = if i >= p { -1 } else { 0 };
        i -= p & (s as u32);

        let yj = k as i32;
        let mut p = u[k];
        while p > i {
            k -= 1;
            p = u[k];
        }
        i -= p;

        let val = ((yj - k as i32) + s) ^ s;
        *v = val;
        yy = mac16_16(yy, val, val);

        uprev(u, k + 2, 0);
    }

    yy
}

/// Read the codeword of `k` pulses over `y.len()` dimensions.
pub fn decode_pulses(y: &mut [i32], k: usize, rd: &mut RangeDecoder) -> i32 {
    let n = y.len();
    let mut u = vec![0u32; k + 2];
    let total = ncwrs_urow(n, k, &mut u);
    let i = rd.decode_uniform(total);

    cwrsi(k, i, y, &mut u)
}

/// Bit cost in `frac` fractional bits of every pulse count up to `max_k`.
pub fn get_required_bits(bits: &mut [i16], n: usize, max_k: usize, frac: usize) {
    debug_assert!(max_k > 0);
    bits[0] = 0;

    if n == 1 {
        for b in bits[1..=max_k].iter_mut() {
            *b = 1 << frac;
        }
    } else {
        let mut u = vec![0u32; max_k + 2];
        ncwrs_urow(n, max_k, &mut u);
        for k in 1..=max_k {
            bits[k] = log2_frac(u[k].wrapping_add(u[k + 1]), frac) as i16;
        }
    }
}

/// Codeword to index, the inverse of `cwrsi`.
#[cfg(test)]
pub fn icwrs(y: &[i32]) -> (u32, u32) {
    let n = y.len();
    let k = y.iter().map(|v| v.unsigned_abs() as usize).sum::<usize>();
    let mut u = vec![0u32; k + 2];

    for j in 1..k + 2 {
        u[j] = ((j as u32) << 1) - 1;
    }

    let mut kk = y[n - 1].unsigned_abs() as usize;
    let mut i = (y[n - 1] < 0) as u32;
    let mut j = n - 2;

    i += u[kk];
    kk += y[j].unsigned_abs() as usize;
    if y[j] < 0 {
        i += u[kk + 1];
    }

    while j > 0 {
        j -= 1;
        unext(&mut u, k + 2, 0);
        i += u[kk];
        kk += y[j].unsigned_abs() as usize;
        if y[j] < 0 {
            i += u[kk + 1];
        }
    }

    (i, u[kk] + u[kk + 1])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::test_encoder::RangeEncoder;
    use interpolate_name::interpolate_test;

    fn v(n: usize, k: usize) -> u32 {
        let mut u = vec![0u32; k + 2];
        ncwrs_urow(n, k, &mut u)
    }

    #[test]
    fn codebook_sizes() {
        // V(2, k) = 4k, V(3, k) = 4k^2 + 2
        assert_eq!(v(2, 1), 4);
        assert_eq!(v(2, 5), 20);
        assert_eq!(v(3, 1), 6);
        assert_eq!(v(3, 3), 38);
        assert_eq!(v(4, 2), 32);
        assert_eq!(v(8, 1), 16);
    }

    #[test]
    fn log2() {
        assert_eq!(log2_frac(512, 3), 72);
        assert_eq!(log2_frac(1, 3), 0);
        assert_eq!(log2_frac(3, 3), 13);
        assert_eq!(log2_frac(6, 3), 21);
        assert_eq!(log2_frac(20, 3), 35);
    }

    #[test]
    fn limits() {
        assert!(fits_in32(2, 32767));
        assert!(fits_in32(1476, 3));
        assert!(!fits_in32(1477, 3));
        assert!(!fits_in32(14, 14));
        assert!(fits_in32(5, 238));
        assert!(!fits_in32(5, 239));
    }

    fn enumerate(n: usize, k: usize) {
        let total = v(n, k);
        let mut y = vec![0; n];

        for i in 0..total {
            let mut u = vec![0u32; k + 2];
            ncwrs_urow(n, k, &mut u);
            let yy = cwrsi(k, i, &mut y, &mut u);

            assert_eq!(y.iter().map(|v| v.abs() as usize).sum::<usize>(), k);
            assert_eq!(yy, y.iter().map(|v| v * v).sum::<i32>());
            assert_eq!(icwrs(&y), (i, total));
        }
    }

    #[interpolate_test(n2_k1, 2, 1)]
    #[interpolate_test(n2_k7, 2, 7)]
    #[interpolate_test(n3_k4, 3, 4)]
    #[interpolate_test(n5_k3, 5, 3)]
    #[interpolate_test(n8_k2, 8, 2)]
    fn enumeration(n: usize, k: usize) {
        enumerate(n, k);
    }

    #[test]
    fn through_range_coder() {
        let vectors: &[&[i32]] = &[
            &[3, -1, 0, 0, 2, 0, 0, -1],
            &[0, 0, 0, 0, 0, 0, 0, -7],
            &[-2, 1],
            &[1, 1, 1, 1, -1, -1, -1, -1, 0, 0, 0, 0, 1, 0, 0, 0],
        ];
        let mut enc = RangeEncoder::new(64);
        for y in vectors {
            let (i, total) = icwrs(y);
            enc.encode_uniform(i, total);
        }
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);
        for y in vectors {
            let k = y.iter().map(|v| v.abs() as usize).sum();
            let mut out = vec![0; y.len()];
            let yy = decode_pulses(&mut out, k, &mut rd);
            assert_eq!(&out[..], &y[..]);
            assert_eq!(yy, y.iter().map(|v| v * v).sum::<i32>());
        }
        assert!(!rd.error());
    }
}
