//! The 48kHz, 20ms CELT mode
//!
//! Every frame size and sampling rate the decoder supports is served by the
//! same mode, built once and shared.

use std::sync::{Arc, OnceLock};

use crate::entropy::BITRES;

use super::cwrs::{fits_in32, get_required_bits, log2_frac, MAX_PULSES};
use super::mdct::MdctLookup;

pub const MAX_BANDS: usize = 21;
pub const OVERLAP: usize = 120;
pub const SHORT_MDCT_SIZE: usize = 120;
pub const MAX_LM: usize = 3;
pub const MAX_FRAME_SIZE: usize = SHORT_MDCT_SIZE << MAX_LM;

pub const MAX_FINE_BITS: i32 = 8;
pub const FINE_OFFSET: i32 = 21;
pub const QTHETA_OFFSET: i32 = 4;
pub const QTHETA_OFFSET_TWOPHASE: i32 = 16;

const MAX_PSEUDO: usize = 40;
pub const LOG_MAX_PSEUDO: usize = 6;

/// Band edges in units of 2.5ms bins.
pub const E_BANDS: [i16; MAX_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// Mean band energy in Q4 (dB/6).
pub const E_MEANS: [i32; 25] = [
    103, 100, 92, 85, 81, 77, 72, 70, 78, 75, 73, 71, 78, 74, 69, 72, 70, 74, 76, 71, 60, 60, 60,
    60, 60,
];

/// Pre-emphasis coefficient, its inverse and the matching gain.
pub const PREEMPH: [i32; 4] = [27853, 0, 4096, 16384];

pub const NB_ALLOC_VECTORS: usize = 11;

/// Static bit allocation in 1/32 bit per sample, one row per quality.
#[rustfmt::skip]
pub const BAND_ALLOCATION: [[u8; MAX_BANDS]; NB_ALLOC_VECTORS] = [
    [  0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0],
    [ 90,  80,  75,  69,  63,  56,  49,  40,  34,  29,  20,  18,  10,   0,   0,   0,   0,   0,   0,   0,   0],
    [110, 100,  90,  84,  78,  71,  65,  58,  51,  45,  39,  32,  26,  20,  12,   0,   0,   0,   0,   0,   0],
    [118, 110, 103,  93,  86,  80,  75,  70,  65,  59,  53,  47,  40,  31,  23,  15,   4,   0,   0,   0,   0],
    [126, 119, 112, 104,  95,  89,  83,  78,  72,  66,  60,  54,  47,  39,  32,  25,  17,  12,   1,   0,   0],
    [134, 127, 120, 114, 103,  97,  91,  85,  78,  72,  66,  60,  54,  47,  41,  35,  29,  23,  16,  10,   1],
    [144, 137, 130, 124, 113, 107, 101,  95,  88,  82,  76,  70,  64,  57,  51,  45,  39,  33,  26,  15,   1],
    [152, 145, 138, 132, 123, 117, 111, 105,  98,  92,  86,  80,  74,  67,  61,  55,  49,  43,  36,  20,   1],
    [162, 155, 148, 142, 133, 127, 121, 115, 108, 102,  96,  90,  84,  77,  71,  65,  59,  53,  46,  30,   1],
    [172, 165, 158, 152, 143, 137, 131, 125, 118, 112, 106, 100,  94,  87,  81,  75,  69,  63,  56,  45,  20],
    [200, 200, 200, 200, 200, 200, 200, 200, 198, 193, 188, 183, 178, 173, 168, 163, 158, 153, 148, 129, 104],
];

/// Pulse count for a pseudo-pulse index.
#[inline(always)]
pub fn get_pulses(i: usize) -> usize {
    if i < 8 {
        i
    } else {
        (8 + (i & 7)) << ((i >> 3) - 1)
    }
}

/// Bit cost tables for every band size the mode can produce.
#[derive(Debug)]
pub struct PulseCache {
    /// Offset in `bits` for a (LM + 1, band) pair, -1 for empty bands.
    pub index: Vec<i16>,
    /// Per entry: the pseudo-pulse count followed by the cost minus one of
    /// each, in 1/8 bits.
    pub bits: Vec<u8>,
    /// Maximum allocation per (LM, channels, band).
    pub caps: Vec<u8>,
}

impl PulseCache {
    fn new(log_n: &[i16], lm: usize) -> Self {
        let nb = MAX_BANDS;
        let width = |j: usize| (E_BANDS[j + 1] - E_BANDS[j]) as usize;

        let mut index = vec![-1i16; nb * (lm + 2)];
        let mut entries = Vec::new();
        let mut curr = 0usize;

        for i in 0..=lm + 1 {
            for j in 0..nb {
                let n = width(j) << i >> 1;
                'search: for k in 0..=i {
                    for m in 0..nb {
                        if k == i && m >= j {
                            break;
                        }
                        if n == width(m) << k >> 1 {
                            index[i * nb + j] = index[k * nb + m];
                            break 'search;
                        }
                    }
                }

                if index[i * nb + j] == -1 && n != 0 {
                    let mut k = 0;
                    while fits_in32(n, get_pulses(k + 1)) && k < MAX_PSEUDO {
                        k += 1;
                    }
                    entries.push((n, k, curr));
                    index[i * nb + j] = curr as i16;
                    curr += k + 1;
                }
            }
        }

        let mut bits = vec![0u8; curr];
        let mut tmp = [0i16; MAX_PULSES + 1];
        for &(n, k, offset) in entries.iter() {
            get_required_bits(&mut tmp, n, get_pulses(k), BITRES);
            let ptr = &mut bits[offset..=offset + k];
            for j in 1..=k {
                ptr[j] = (tmp[get_pulses(j)] - 1) as u8;
            }
            ptr[0] = k as u8;
        }

        let mut cache = PulseCache {
            index,
            bits,
            caps: Vec::with_capacity((lm + 1) * 2 * nb),
        };

        for i in 0..=lm {
            for c in 1..=2 {
                for j in 0..nb {
                    let cap = cache.max_bits(log_n, i, c, j);
                    cache.caps.push(cap as u8);
                }
            }
        }

        cache
    }

    /// Highest rate at which a band reliably uses all the bits it is given.
    fn max_bits(&self, log_n: &[i16], i: usize, c: i32, j: usize) -> i32 {
        let nb = MAX_BANDS;
        let width = (E_BANDS[j + 1] - E_BANDS[j]) as i32;
        let log_n = log_n[j] as i32;
        let bitres = BITRES as i32;
        let i32_lm = i as i32;

        let max_bits = if width << i == 1 {
            c * (1 + MAX_FINE_BITS) << bitres
        } else {
            let mut n0 = width;
            let mut lm0 = 0i32;
            if n0 > 2 {
                n0 >>= 1;
                lm0 -= 1;
            } else if n0 <= 1 {
                lm0 = i32_lm.min(1);
                n0 <<= lm0;
            }

            // cost of the lowest level PVQ of a fully split band
            let pcache = &self.bits[self.index[(lm0 + 1) as usize * nb + j] as usize..];
            let mut max_bits = pcache[pcache[0] as usize] as i32 + 1;

            let mut n = n0;
            for k in 0..i32_lm - lm0 {
                max_bits <<= 1;
                let offset = ((log_n + ((lm0 + k) << bitres)) >> 1) - QTHETA_OFFSET;
                let num = 459 * ((2 * n - 1) * offset + max_bits);
                let den = ((2 * n - 1) << 9) - 459;
                let qb = ((num + (den >> 1)) / den).min(57);
                max_bits += qb;
                n <<= 1;
            }

            if c == 2 {
                max_bits <<= 1;
                let two_phase = n == 2;
                let offset = ((log_n + (i32_lm << bitres)) >> 1)
                    - if two_phase {
                        QTHETA_OFFSET_TWOPHASE
                    } else {
                        QTHETA_OFFSET
                    };
                let ndof = 2 * n - 1 - two_phase as i32;
                let scale = if two_phase { 512 } else { 487 };
                let num = scale * (max_bits + ndof * offset);
                let den = (ndof << 9) - scale;
                let qb = ((num + (den >> 1)) / den).min(if two_phase { 64 } else { 61 });
                max_bits += qb;
            }

            let ndof = c * n + (c == 2 && n > 2) as i32;
            let mut offset = ((log_n + (i32_lm << bitres)) >> 1) - FINE_OFFSET;
            if n == 2 {
                offset += 1 << bitres >> 2;
            }
            let num = max_bits + ndof * offset;
            let den = (ndof - 1) << bitres;
            let qb = ((num + (den >> 1)) / den).min(MAX_FINE_BITS);
            max_bits + (c * qb << bitres)
        };

        4 * max_bits / (c * (width << i)) - 64
    }

    /// Cost table for a band at a given LM, which may be -1 for split bands.
    #[inline(always)]
    pub fn band(&self, band: usize, lm: i32) -> &[u8] {
        let idx = self.index[(lm + 1) as usize * MAX_BANDS + band];
        &self.bits[idx as usize..]
    }
}

#[derive(Debug)]
pub struct Mode {
    pub fs: i32,
    pub overlap: usize,
    pub nb_ebands: usize,
    pub eff_ebands: usize,
    pub preemph: [i32; 4],
    pub ebands: &'static [i16],
    pub max_lm: usize,
    pub nb_short_mdcts: usize,
    pub short_mdct_size: usize,
    pub nb_alloc_vectors: usize,
    pub alloc_vectors: &'static [[u8; MAX_BANDS]],
    pub log_n: Vec<i16>,
    pub window: Vec<i32>,
    pub mdct: MdctLookup,
    pub cache: PulseCache,
}

static MODE: OnceLock<Arc<Mode>> = OnceLock::new();

fn compute_window(overlap: usize) -> Vec<i32> {
    use std::f64::consts::PI;

    (0..overlap)
        .map(|i| {
            let s = (0.5 * PI * (i as f64 + 0.5) / overlap as f64).sin();
            let v = (0.5 + 32768.0 * (0.5 * PI * s * s).sin()).floor();
            v.min(32767.0) as i32
        })
        .collect()
}

impl Mode {
    fn new() -> Self {
        let log_n: Vec<i16> = E_BANDS
            .windows(2)
            .map(|w| log2_frac((w[1] - w[0]) as u32, BITRES) as i16)
            .collect();
        let cache = PulseCache::new(&log_n, MAX_LM);

        debug!("CELT mode ready, {} cached pulse entries", cache.bits.len());

        Mode {
            fs: 48000,
            overlap: OVERLAP,
            nb_ebands: MAX_BANDS,
            eff_ebands: MAX_BANDS,
            preemph: PREEMPH,
            ebands: &E_BANDS,
            max_lm: MAX_LM,
            nb_short_mdcts: 1 << MAX_LM,
            short_mdct_size: SHORT_MDCT_SIZE,
            nb_alloc_vectors: NB_ALLOC_VECTORS,
            alloc_vectors: &BAND_ALLOCATION,
            log_n,
            window: compute_window(OVERLAP),
            mdct: MdctLookup::new(2 * MAX_FRAME_SIZE, MAX_LM),
            cache,
        }
    }

    /// The shared mode instance.
    pub fn get() -> Arc<Mode> {
        MODE.get_or_init(|| Arc::new(Mode::new())).clone()
    }

    /// Band width in bins at the 2.5ms resolution.
    #[inline(always)]
    pub fn width(&self, band: usize) -> usize {
        (self.ebands[band + 1] - self.ebands[band]) as usize
    }

    /// Cap row for a given LM and channel count.
    pub fn caps(&self, lm: usize, channels: usize) -> &[u8] {
        let start = self.nb_ebands * (2 * lm + channels - 1);
        &self.cache.caps[start..start + self.nb_ebands]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_n() {
        let mode = Mode::get();
        assert_eq!(
            &mode.log_n[..],
            &[0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 16, 16, 16, 21, 21, 24, 29, 34, 36]
        );
    }

    #[test]
    fn window() {
        let mode = Mode::get();
        assert_eq!(mode.window.len(), OVERLAP);
        assert_eq!(&mode.window[..3], &[2, 20, 55]);
        assert_eq!(mode.window[OVERLAP - 1], 32767);
        assert!(mode.window.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn caps() {
        let mode = Mode::get();
        assert_eq!(
            mode.caps(0, 1),
            &[
                224, 224, 224, 224, 224, 224, 224, 224, 160, 160, 160, 160, 185, 185, 185, 178,
                178, 168, 134, 61, 37
            ]
        );
    }

    #[test]
    fn pulse_cache() {
        let mode = Mode::get();
        for lm in -1..=MAX_LM as i32 {
            for band in 0..MAX_BANDS {
                let n = mode.width(band) << (lm + 1) as usize >> 1;
                if n == 0 {
                    continue;
                }
                let cache = mode.cache.band(band, lm);
                let k = cache[0] as usize;
                assert!(k > 0 && k <= MAX_PSEUDO);
                // costs never decrease with the pulse count
                assert!(cache[1..=k].windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }

    #[test]
    fn pulses() {
        assert_eq!(get_pulses(7), 7);
        assert_eq!(get_pulses(8), 8);
        assert_eq!(get_pulses(15), 15);
        assert_eq!(get_pulses(16), 16);
        assert_eq!(get_pulses(17), 18);
        assert_eq!(get_pulses(40), 128);
    }

    #[test]
    fn shared() {
        let a = Mode::get();
        let b = Mode::get();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
