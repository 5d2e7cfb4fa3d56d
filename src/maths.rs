//! Fixed-point arithmetic
//!
//! All the signal values are carried in `i32`. The names follow the width
//! and Q format of the operands: `mult16_32_q15` multiplies a 16-bit value by
//! a 32-bit one and drops 15 fractional bits.

use std::mem::size_of;

use integer_sqrt::IntegerSquareRoot;

pub const Q15_ONE: i32 = 32767;
pub const EPSILON: i32 = 1;

pub trait ILog {
    /// Number of bits needed to represent the value, 0 for 0.
    fn ec_ilog(&self) -> u32;
}

impl ILog for u32 {
    fn ec_ilog(&self) -> u32 {
        (size_of::<u32>() * 8) as u32 - self.leading_zeros()
    }
}

impl ILog for usize {
    fn ec_ilog(&self) -> u32 {
        (size_of::<usize>() * 8) as u32 - self.leading_zeros()
    }
}

impl ILog for i32 {
    fn ec_ilog(&self) -> u32 {
        (*self as u32).ec_ilog()
    }
}

/// Integer log2, the argument must be strictly positive.
#[inline(always)]
pub fn celt_ilog2(x: i32) -> i32 {
    debug_assert!(x > 0);
    x.ec_ilog() as i32 - 1
}

#[inline(always)]
pub fn celt_zlog2(x: i32) -> i32 {
    if x <= 0 {
        0
    } else {
        celt_ilog2(x)
    }
}

#[inline(always)]
pub fn qconst16(x: f64, bits: u32) -> i32 {
    (0.5 + x * (1i64 << bits) as f64) as i32
}

#[inline(always)]
pub fn mult16_16(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b)
}

#[inline(always)]
pub fn mac16_16(c: i32, a: i32, b: i32) -> i32 {
    c.wrapping_add(a.wrapping_mul(b))
}

#[inline(always)]
pub fn mult16_16_q15(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b) >> 15
}

#[inline(always)]
pub fn mult16_16_q14(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b) >> 14
}

#[inline(always)]
pub fn mult16_16_p15(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b).wrapping_add(16384) >> 15
}

#[inline(always)]
pub fn mult16_32_q15(a: i32, b: i32) -> i32 {
    ((a as i64 * b as i64) >> 15) as i32
}

#[inline(always)]
pub fn mult16_32_q16(a: i32, b: i32) -> i32 {
    ((a as i64 * b as i64) >> 16) as i32
}

#[inline(always)]
pub fn mult32_32_q31(a: i32, b: i32) -> i32 {
    ((a as i64 * b as i64) >> 31) as i32
}

/// Arithmetic shift right with rounding.
#[inline(always)]
pub fn pshr32(a: i32, shift: u32) -> i32 {
    if shift == 0 {
        a
    } else {
        a.wrapping_add(1 << (shift - 1)) >> shift
    }
}

/// Rounding shift truncated to 16 bits.
#[inline(always)]
pub fn round16(a: i32, shift: u32) -> i32 {
    extract16(pshr32(a, shift))
}

/// Shift right for positive `shift`, left otherwise.
#[inline(always)]
pub fn vshr32(a: i32, shift: i32) -> i32 {
    if shift > 0 {
        a >> shift
    } else {
        a.wrapping_shl((-shift) as u32)
    }
}

#[inline(always)]
pub fn shl32(a: i32, shift: u32) -> i32 {
    a.wrapping_shl(shift)
}

#[inline(always)]
pub fn half32(a: i32) -> i32 {
    a >> 1
}

#[inline(always)]
pub fn saturate16(a: i32) -> i32 {
    a.max(-32768).min(32767)
}

/// Keep the low 16 bits, sign extended.
#[inline(always)]
pub fn extract16(a: i32) -> i32 {
    a as i16 as i32
}

#[inline(always)]
pub fn sig2word16(a: i32, shift: u32) -> i16 {
    saturate16(pshr32(a, shift)) as i16
}

pub fn celt_maxabs16(x: &[i32]) -> i32 {
    let (max, min) = x
        .iter()
        .fold((0, 0), |(max, min), &v| (max.max(v), min.min(v)));

    max.max(-min)
}

pub fn celt_maxabs32(x: &[i32]) -> i32 {
    celt_maxabs16(x)
}

pub fn celt_inner_prod(x: &[i32], y: &[i32]) -> i32 {
    x.iter()
        .zip(y.iter())
        .fold(0, |acc, (&a, &b)| mac16_16(acc, a, b))
}

/// Reciprocal square root of a Q16 value in [0.25, 1), result in Q14.
pub fn celt_rsqrt_norm(x: i32) -> i32 {
    let n = x - 32768;
    let r = 23557 + mult16_16_q15(n, -13490 + mult16_16_q15(n, 6713));
    let r2 = mult16_16_q15(r, r);
    let y = (mult16_16_q15(r2, n) + r2 - 16384) << 1;

    r + mult16_16_q15(r, mult16_16_q15(y, mult16_16_q15(y, 12288) - 16384))
}

/// Square root of a QX value, result in QX/2.
pub fn celt_sqrt(x: i32) -> i32 {
    const C: [i32; 5] = [23175, 11561, -3011, 1699, -664];

    if x == 0 {
        return 0;
    } else if x >= 1073741824 {
        return 32767;
    }

    let k = (celt_ilog2(x) >> 1) - 7;
    let x = vshr32(x, 2 * k);
    let n = x - 32768;
    let rt = C[0]
        + mult16_16_q15(
            n,
            C[1] + mult16_16_q15(n, C[2] + mult16_16_q15(n, C[3] + mult16_16_q15(n, C[4]))),
        );

    vshr32(rt, 7 - k)
}

pub fn celt_rcp(x: i32) -> i32 {
    debug_assert!(x > 0);
    let i = celt_ilog2(x);
    let n = vshr32(x, i - 15) - 32768;
    let r = 30840 + mult16_16_q15(-15420, n);
    let r = r - mult16_16_q15(r, mult16_16_q15(r, n) + r - 32768);
    let r = r - (1 + mult16_16_q15(r, mult16_16_q15(r, n) + r - 32768));

    vshr32(r, i - 16)
}

#[inline(always)]
pub fn celt_div(a: i32, b: i32) -> i32 {
    mult32_32_q31(a, celt_rcp(b))
}

/// Q32 division saturated to the Q31 range.
pub fn frac_div32(a: i32, b: i32) -> i32 {
    let shift = celt_ilog2(b) - 29;
    let a = vshr32(a, shift);
    let b = vshr32(b, shift);
    let rcp = round16(celt_rcp(round16(b, 16)), 3);
    let result = mult16_32_q15(rcp, a);
    let rem = pshr32(a, 2).wrapping_sub(mult32_32_q31(result, b));
    let result = result.wrapping_add(shl32(mult16_32_q15(rcp, rem), 2));

    if result >= 536870912 {
        2147483647
    } else if result <= -536870912 {
        -2147483647
    } else {
        shl32(result, 2)
    }
}

fn celt_cos_pi_2(x: i32) -> i32 {
    let x2 = mult16_16_p15(x, x);
    let v = 32767 - x2 + mult16_16_p15(x2, -7651 + mult16_16_p15(x2, 8277 + mult16_16_p15(-626, x2)));

    1 + v.min(32766)
}

/// Cosine of `x * pi / 2^16`, in Q15.
pub fn celt_cos_norm(x: i32) -> i32 {
    let mut x = x & 0x0001ffff;
    if x > (1 << 16) {
        x = (1 << 17) - x;
    }

    if x & 0x00007fff != 0 {
        if x < (1 << 15) {
            celt_cos_pi_2(x)
        } else {
            -celt_cos_pi_2(65536 - x)
        }
    } else if x & 0x0000ffff != 0 {
        0
    } else if x & 0x0001ffff != 0 {
        -32767
    } else {
        32767
    }
}

/// 2^x for x in [0, 1) (Q10), result in Q14.
pub fn celt_exp2_frac(x: i32) -> i32 {
    const D0: i32 = 16383;
    const D1: i32 = 22804;
    const D2: i32 = 14819;
    const D3: i32 = 10204;

    let frac = x << 4;

    D0 + mult16_16_q15(frac, D1 + mult16_16_q15(frac, D2 + mult16_16_q15(D3, frac)))
}

/// 2^x for x in Q10, result in Q16.
pub fn celt_exp2(x: i32) -> i32 {
    let integer = x >> 10;

    if integer > 14 {
        0x7f000000
    } else if integer < -15 {
        0
    } else {
        let frac = celt_exp2_frac(x - (integer << 10));
        vshr32(frac, -integer - 2)
    }
}

/// Integer square root, rounded down.
#[inline(always)]
pub fn isqrt32(x: u32) -> u32 {
    x.integer_sqrt()
}

/// Linear congruential generator shared by the folding and the concealment.
#[inline(always)]
pub fn celt_lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ilog() {
        assert_eq!(0u32.ec_ilog(), 0);
        assert_eq!(1u32.ec_ilog(), 1);
        assert_eq!(255u32.ec_ilog(), 8);
        assert_eq!(256usize.ec_ilog(), 9);
        assert_eq!(celt_ilog2(1 << 20), 20);
        assert_eq!(celt_zlog2(-4), 0);
    }

    #[test]
    fn rounding_shifts() {
        assert_eq!(pshr32(5, 1), 3);
        assert_eq!(pshr32(-5, 1), -2);
        assert_eq!(vshr32(1 << 10, -2), 1 << 12);
        assert_eq!(vshr32(-1 << 10, 2), -1 << 8);
        assert_eq!(saturate16(40000), 32767);
        assert_eq!(sig2word16(-1 << 28, 12), -32768);
    }

    #[test]
    fn cos_norm() {
        assert_eq!(celt_cos_norm(0), 32767);
        assert_eq!(celt_cos_norm(1 << 15), 0);
        assert_eq!(celt_cos_norm(1 << 16), -32767);
        assert_eq!(celt_cos_norm(1 << 17), 32767);
        assert_eq!(celt_cos_norm(-(1 << 15)), 0);
        for x in (0..(1 << 17)).step_by(997) {
            let v = celt_cos_norm(x);
            let r = (x as f64 * std::f64::consts::PI / (1 << 16) as f64).cos() * 32768.0;
            assert!((v as f64 - r).abs() < 10.0, "{} {} {}", x, v, r);
        }
    }

    #[test]
    fn sqrt() {
        assert_eq!(celt_sqrt(0), 0);
        assert_eq!(celt_sqrt(1 << 30), 32767);
        for &x in &[1 << 14, 1 << 16, 12345678, 999, 1 << 28] {
            let r = (x as f64).sqrt();
            let v = celt_sqrt(x) as f64;
            assert!((v - r).abs() <= r * 0.001 + 1.0, "{} {} {}", x, v, r);
        }
    }

    #[test]
    fn division() {
        for &(a, b) in &[(1 << 20, 1 << 21), (3, 7), (1000, 1001), (5 << 24, 9 << 24)] {
            let v = frac_div32(a, b) as f64 / (1u64 << 31) as f64;
            let r = a as f64 / b as f64;
            assert!((v - r).abs() < 1e-4, "{} / {}: {} {}", a, b, v, r);
        }

        for x in (1 << 15)..(1 << 16) {
            let r = celt_rcp(x) as f64 / (1u64 << 31) as f64 * x as f64;
            assert!((r - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn rsqrt_norm() {
        for x in (16384..65536).step_by(17) {
            let v = celt_rsqrt_norm(x) as f64 / 16384.0;
            let r = 1.0 / (x as f64 / 65536.0).sqrt();
            assert!((v - r).abs() < 1e-3, "{} {} {}", x, v, r);
        }
    }

    #[test]
    fn integer_sqrt() {
        assert_eq!(isqrt32(0), 0);
        assert_eq!(isqrt32(8), 2);
        assert_eq!(isqrt32(9), 3);
        assert_eq!(isqrt32(8 * 255 + 1), 45);
    }

    #[test]
    fn exp2() {
        assert_eq!(celt_exp2_frac(0), 16383);
        assert_eq!(celt_exp2(1 << 10), 131064);
        assert_eq!(celt_exp2(15 << 10), 0x7f000000);
        assert_eq!(celt_exp2(-16 << 10), 0);
        let v = celt_exp2(-512) as f64 / 65536.0;
        assert!((v - 0.5f64.sqrt()).abs() < 1e-3);
    }
}
