//! Band energy decoding
//!
//! Energies are in Q10 base-2 log units (`DB_SHIFT`), coded in three
//! passes: a Laplace coded coarse value with inter-frame and inter-band
//! prediction, raw fine bits, and a last refinement using the bits the
//! band coding left over.

use crate::entropy::*;

use super::mode::{MAX_BANDS, MAX_FINE_BITS};

pub const DB_SHIFT: u32 = 10;

/// Inter-frame prediction per LM, Q15.
const PRED_COEF: [i32; 4] = [29440, 26112, 21248, 16384];
/// Inter-band prediction per LM, Q15.
const BETA_COEF: [i32; 4] = [30147, 22282, 12124, 6554];
const BETA_INTRA: i32 = 4915;

// Laplace parameters per band, (probability of zero, decay) pairs
#[rustfmt::skip]
const COARSE_ENERGY_INTRA: [[u8; 42]; 4] = [
    // 120-samples
    [ 24, 179,  48, 138,  54, 135,  54, 132,  53, 134,  56, 133,  55, 132,
      55, 132,  61, 114,  70,  96,  74,  88,  75,  88,  87,  74,  89,  66,
      91,  67, 100,  59, 108,  50, 120,  40, 122,  37,  97,  43,  78,  50 ],
    // 240-samples
    [ 23, 178,  54, 115,  63, 102,  66,  98,  69,  99,  74,  89,  71,  91,
      73,  91,  78,  89,  86,  80,  92,  66,  93,  64, 102,  59, 103,  60,
     104,  60, 117,  52, 123,  44, 138,  35, 133,  31,  97,  38,  77,  45 ],
    // 480-samples
    [ 21, 178,  59, 110,  71,  86,  75,  85,  84,  83,  91,  66,  88,  73,
      87,  72,  92,  75,  98,  72, 105,  58, 107,  54, 115,  52, 114,  55,
     112,  56, 129,  51, 132,  40, 150,  33, 140,  29,  98,  35,  77,  42 ],
    // 960-samples
    [ 22, 178,  63, 114,  74,  82,  84,  83,  92,  82, 103,  62,  96,  72,
      96,  67, 101,  73, 107,  72, 113,  55, 118,  52, 125,  52, 118,  52,
     117,  55, 135,  49, 137,  39, 157,  32, 145,  29,  97,  33,  77,  40 ],
];

#[rustfmt::skip]
const COARSE_ENERGY_INTER: [[u8; 42]; 4] = [
    // 120-samples
    [ 72, 127,  65, 129,  66, 128,  65, 128,  64, 128,  62, 128,  64, 128,
      64, 128,  92,  78,  92,  79,  92,  78,  90,  79, 116,  41, 115,  40,
     114,  40, 132,  26, 132,  26, 145,  17, 161,  12, 176,  10, 177,  11 ],
    // 240-samples
    [ 83,  78,  84,  81,  88,  75,  86,  74,  87,  71,  90,  73,  93,  74,
      93,  74, 109,  40, 114,  36, 117,  34, 117,  34, 143,  17, 145,  18,
     146,  19, 162,  12, 165,  10, 178,   7, 189,   6, 190,   8, 177,   9 ],
    // 480-samples
    [ 61,  90,  93,  60, 105,  42, 107,  41, 110,  45, 116,  38, 113,  38,
     112,  38, 124,  26, 132,  27, 136,  19, 140,  20, 155,  14, 159,  16,
     158,  18, 170,  13, 177,  10, 187,   8, 192,   6, 175,   9, 159,  10 ],
    // 960-samples
    [ 42, 121,  96,  66, 108,  43, 111,  40, 117,  44, 123,  32, 120,  36,
     119,  33, 127,  33, 134,  34, 139,  21, 147,  23, 152,  20, 158,  25,
     154,  26, 166,  21, 173,  16, 184,  13, 184,  10, 150,  13, 139,  15 ],
];

const MODEL_ENERGY_SMALL: &ICDFContext = &ICDFContext {
    ftb: 2,
    dist: &[2, 1, 0],
};

/// Decode the coarse energy of the bands in `start..end`.
///
/// `old` holds the previous frame energies, `MAX_BANDS` per channel, and is
/// updated in place.
pub fn unquant_coarse_energy(
    rd: &mut RangeDecoder,
    old: &mut [i32],
    start: usize,
    end: usize,
    intra: bool,
    channels: usize,
    lm: usize,
) {
    let (coef, beta, model) = if intra {
        (0, BETA_INTRA, &COARSE_ENERGY_INTRA[lm])
    } else {
        (PRED_COEF[lm], BETA_COEF[lm], &COARSE_ENERGY_INTER[lm])
    };

    let budget = rd.len() * 8;
    let mut prev = [0i32; 2];

    for i in start..end {
        for c in 0..channels {
            let available = budget.saturating_sub(rd.tell());
            let qi = if available >= 15 {
                let k = i.min(20) << 1;
                rd.decode_laplace((model[k] as u32) << 7, (model[k + 1] as u32) << 6)
            } else if available >= 2 {
                let v = rd.decode_icdf(MODEL_ENERGY_SMALL) as i32;
                (v >> 1) ^ -(v & 1)
            } else if available >= 1 {
                -(rd.decode_logp(1) as i32)
            } else {
                -1
            };
            let q = qi << DB_SHIFT;

            let e = &mut old[i + c * MAX_BANDS];
            *e = (*e).max(-(9 << DB_SHIFT));
            let tmp = pshr(coef * *e, 8) + prev[c] + (q << 7);
            let tmp = tmp.max(-(28 << (DB_SHIFT + 7)));
            *e = pshr(tmp, 7);
            prev[c] = prev[c] + (q << 7) - beta * pshr(q, 8);
        }
    }
}

#[inline(always)]
fn pshr(a: i32, shift: u32) -> i32 {
    crate::maths::pshr32(a, shift)
}

/// Read the fine energy refinement, `fine_bits[i]` raw bits per channel.
pub fn unquant_fine_energy(
    rd: &mut RangeDecoder,
    old: &mut [i32],
    start: usize,
    end: usize,
    fine_bits: &[i32],
    channels: usize,
) {
    for i in start..end {
        let bits = fine_bits[i];
        if bits <= 0 {
            continue;
        }
        for c in 0..channels {
            let q2 = rd.rawbits(bits as usize) as i32;
            let offset = (((q2 << DB_SHIFT) + 512) >> bits) - 512;
            old[i + c * MAX_BANDS] += offset;
        }
    }
}

/// Spend the last `bits_left` raw bits on one more bit of resolution,
/// the bands flagged by `fine_priority` going last.
#[allow(clippy::too_many_arguments)]
pub fn unquant_energy_finalise(
    rd: &mut RangeDecoder,
    old: &mut [i32],
    start: usize,
    end: usize,
    fine_bits: &[i32],
    fine_priority: &[i32],
    mut bits_left: i32,
    channels: usize,
) {
    let c_count = channels as i32;

    for prio in 0..2 {
        for i in start..end {
            if bits_left < c_count {
                break;
            }
            if fine_bits[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                continue;
            }
            for c in 0..channels {
                let q2 = rd.rawbits(1) as i32;
                let offset = ((q2 << DB_SHIFT) - 512) >> (fine_bits[i] + 1);
                old[i + c * MAX_BANDS] += offset;
                bits_left -= 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::test_encoder::RangeEncoder;

    #[test]
    fn coarse_intra() {
        let deltas = [3, -1, 0, 0, 2, -4, 1, 0, 0, -1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let model = &COARSE_ENERGY_INTRA[3];
        let mut enc = RangeEncoder::new(128);
        for (i, &d) in deltas.iter().enumerate() {
            let k = i.min(20) << 1;
            enc.encode_laplace(d, (model[k] as u32) << 7, (model[k + 1] as u32) << 6);
        }
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);
        let mut old = [0i32; 2 * MAX_BANDS];
        unquant_coarse_energy(&mut rd, &mut old, 0, MAX_BANDS, true, 1, 3);

        // intra frames only predict across bands
        let mut prev = 0;
        for (i, &d) in deltas.iter().enumerate() {
            let q = d << DB_SHIFT;
            let expected = pshr((prev + (q << 7)).max(-(28 << 17)), 7);
            assert_eq!(old[i], expected, "band {}", i);
            prev = prev + (q << 7) - BETA_INTRA * pshr(q, 8);
        }
        assert!(!rd.error());
    }

    #[test]
    fn coarse_out_of_bits() {
        let buf = [];
        let mut rd = RangeDecoder::new(&buf);
        let mut old = [0i32; 2 * MAX_BANDS];
        unquant_coarse_energy(&mut rd, &mut old, 0, 4, false, 2, 0);

        // every band decreases by one step
        assert!(old[..4].iter().all(|&e| e < 0));
        assert!(old[MAX_BANDS..MAX_BANDS + 4].iter().all(|&e| e < 0));
        assert!(old[4..MAX_BANDS].iter().all(|&e| e == 0));
    }

    #[test]
    fn fine_and_finalise() {
        let mut enc = RangeEncoder::new(16);
        enc.rawbits(3, 2);
        enc.rawbits(0, 2);
        enc.rawbits(1, 1);
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);
        let mut old = [0i32; 2 * MAX_BANDS];
        let mut fine = [0i32; MAX_BANDS];
        let priority = [0i32; MAX_BANDS];
        fine[1] = 2;
        fine[2] = 2;

        unquant_fine_energy(&mut rd, &mut old, 0, 3, &fine, 1);
        assert_eq!(&old[..3], &[0, 384, -384]);

        unquant_energy_finalise(&mut rd, &mut old, 0, 3, &fine, &priority, 1, 1);
        // band 0 has no fine bits and gets the single bit left
        assert_eq!(old[0], 256);
        assert_eq!(&old[1..3], &[384, -384]);
    }
}
