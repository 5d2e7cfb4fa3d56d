//! Integer approximations that every decoder has to reproduce exactly,
//! since their results drive the bit allocation.

use crate::maths::ILog;

#[inline(always)]
fn frac_mul16(a: i32, b: i32) -> i32 {
    (16384 + (a as i16 as i32) * (b as i16 as i32)) >> 15
}

/// Cosine of `x * pi / 32768` for `x` in `0..=16384`, in Q15.
pub fn bitexact_cos(x: i32) -> i32 {
    let tmp = (4096 + x * x) >> 13;
    debug_assert!(tmp <= 32767);
    let x2 = tmp;
    let x2 = (32767 - x2) + frac_mul16(x2, -7651 + frac_mul16(x2, 8277 + frac_mul16(-626, x2)));
    debug_assert!(x2 <= 32766);

    1 + x2
}

/// `log2(isin / icos)` in Q11.
pub fn bitexact_log2tan(isin: i32, icos: i32) -> i32 {
    let lc = icos.ec_ilog() as i32;
    let ls = isin.ec_ilog() as i32;
    let icos = icos << (15 - lc);
    let isin = isin << (15 - ls);

    (ls - lc) * (1 << 11) + frac_mul16(isin, frac_mul16(isin, -2597) + 7932)
        - frac_mul16(icos, frac_mul16(icos, -2597) + 7932)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cos_endpoints() {
        // the angle is at least 64 once quantized
        assert_eq!(bitexact_cos(64), 32767);
        assert!(bitexact_cos(16320) < 256);
        assert!((bitexact_cos(8192) - 23170).abs() < 16);
    }

    #[test]
    fn cos_is_decreasing() {
        let mut prev = bitexact_cos(64);
        for x in (128..16384).step_by(64) {
            let v = bitexact_cos(x);
            assert!(v <= prev, "{}", x);
            prev = v;
        }
    }

    #[test]
    fn log2tan() {
        assert_eq!(bitexact_log2tan(23170, 23170), 0);

        let s = bitexact_cos(16384 - 4096);
        let c = bitexact_cos(4096);
        let v = bitexact_log2tan(s, c);
        let r = ((std::f64::consts::PI / 8.0).tan()).log2() * 2048.0;
        assert!((v as f64 - r).abs() < 16.0, "{} {}", v, r);
        assert_eq!(bitexact_log2tan(c, s), -v);
    }
}
