use std::sync::Arc;

use crate::entropy::*;
use crate::error::*;
use crate::maths::*;

use super::bands::{anti_collapse, denormalise_bands, quant_all_bands};
use super::lpc::{autocorr, fir, iir, lpc, LPC_ORDER, SIG_SHIFT};
use super::mode::*;
use super::pitch::{pitch_downsample, pitch_search};
use super::postfilter::{comb_filter, PostFilter, COMBFILTER_MAXPERIOD, COMBFILTER_MINPERIOD};
use super::quant_bands::*;
use super::rate::{compute_allocation, Allocation};
use super::vq::{renormalise_vector, Spread};

pub const DECODE_BUFFER_SIZE: usize = 2048;
const MAX_PERIOD: usize = COMBFILTER_MAXPERIOD;
const PLC_PITCH_LAG_MAX: usize = 720;
const PLC_PITCH_LAG_MIN: usize = 100;
/// Bytes in the largest frame.
pub const MAX_PACKET_SIZE: usize = 1275;

/// Energy of a band with nothing in it.
const SILENT_LOG_E: i32 = -(28 << DB_SHIFT);

const SPREAD_ICDF: &ICDFContext = &ICDFContext {
    ftb: 5,
    dist: &[25, 23, 2, 0],
};

const TRIM_ICDF: &ICDFContext = &ICDFContext {
    ftb: 7,
    dist: &[126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0],
};

// tf resolution change, [LM][transient * 4 + tf_select * 2 + tf_res]
#[rustfmt::skip]
const TF_SELECT_TABLE: [[i32; 8]; 4] = [
    [0, -1, 0, -1,    0, -1, 0, -1],
    [0, -1, 0, -2,    1,  0, 1, -1],
    [0, -2, 0, -3,    2,  0, 1, -1],
    [0, -2, 0, -3,    3,  0, 1, -1],
];

/// Integer factor from 48kHz to the output rate.
fn resampling_factor(rate: usize) -> Option<usize> {
    match rate {
        48000 => Some(1),
        24000 => Some(2),
        16000 => Some(3),
        12000 => Some(4),
        8000 => Some(6),
        _ => None,
    }
}

/// History kept per output channel.
#[derive(Debug, Clone)]
struct ChannelHistory {
    /// Synthesized signal, `DECODE_BUFFER_SIZE` samples plus the overlap.
    decode_mem: Vec<i32>,
    lpc: [i32; LPC_ORDER],
    preemph_mem: i32,
}

impl ChannelHistory {
    fn new(overlap: usize) -> Self {
        ChannelHistory {
            decode_mem: vec![0; DECODE_BUFFER_SIZE + overlap],
            lpc: [0; LPC_ORDER],
            preemph_mem: 0,
        }
    }

    /// Drop the oldest `n` samples, keeping the pending half overlap.
    fn shift(&mut self, n: usize, overlap: usize) {
        self.decode_mem.copy_within(n..DECODE_BUFFER_SIZE + overlap / 2, 0);
    }
}

/// Everything read from the bitstream for the frame being decoded.
struct Frame<'a> {
    rd: RangeDecoder<'a>,
    len: usize,
    lm: usize,
    n: usize,
    channels: usize,

    silence: bool,
    postfilter: PostFilter,
    transient: bool,
    intra: bool,
    tf_res: [i32; MAX_BANDS],
    spread: Spread,
    anti_collapse_rsv: i32,
    alloc: Allocation,

    /// Normalized spectrum, `n` coefficients per channel.
    x: Vec<i32>,
    collapse_masks: [u8; 2 * MAX_BANDS],
}

impl<'a> Frame<'a> {
    fn new(data: &'a [u8], lm: usize, channels: usize) -> Self {
        let n = SHORT_MDCT_SIZE << lm;
        Frame {
            rd: RangeDecoder::new(data),
            len: data.len(),
            lm,
            n,
            channels,
            silence: false,
            postfilter: PostFilter::default(),
            transient: false,
            intra: false,
            tf_res: [0; MAX_BANDS],
            spread: Spread::Normal,
            anti_collapse_rsv: 0,
            alloc: Allocation::default(),
            x: vec![0; channels * n],
            collapse_masks: [0; 2 * MAX_BANDS],
        }
    }

    fn total_bits(&self) -> usize {
        self.len * 8
    }
}

/// CELT frame decoder
///
/// Decodes one frame per call into 16-bit interleaved PCM and conceals the
/// frames that are missing.
#[derive(Debug, Clone)]
pub struct CeltDecoder {
    mode: Arc<Mode>,
    overlap: usize,
    channels: usize,
    stream_channels: usize,
    downsample: usize,
    start: usize,
    end: usize,
    signalling: bool,

    rng: u32,
    error: bool,
    last_pitch_index: usize,
    loss_count: usize,
    postfilter_old: PostFilter,
    postfilter: PostFilter,

    history: Vec<ChannelHistory>,
    old_band_e: [i32; 2 * MAX_BANDS],
    old_log_e: [i32; 2 * MAX_BANDS],
    old_log_e2: [i32; 2 * MAX_BANDS],
    background_log_e: [i32; 2 * MAX_BANDS],
}

impl CeltDecoder {
    /// Decoder producing `channels` channels at `sample_rate`, one of 8, 12,
    /// 16, 24 or 48kHz.
    pub fn new(sample_rate: usize, channels: usize) -> Result<Self> {
        if channels < 1 || channels > 2 {
            return Err(Error::InvalidArgument("channels must be 1 or 2"));
        }
        let downsample =
            resampling_factor(sample_rate).ok_or(Error::InvalidArgument("unsupported sample rate"))?;
        let mode = Mode::get();
        let overlap = mode.overlap;
        let end = mode.eff_ebands;

        let mut dec = CeltDecoder {
            mode,
            overlap,
            channels,
            stream_channels: channels,
            downsample,
            start: 0,
            end,
            signalling: true,
            rng: 0,
            error: false,
            last_pitch_index: 0,
            loss_count: 0,
            postfilter_old: PostFilter::default(),
            postfilter: PostFilter::default(),
            history: Vec::new(),
            old_band_e: [0; 2 * MAX_BANDS],
            old_log_e: [0; 2 * MAX_BANDS],
            old_log_e2: [0; 2 * MAX_BANDS],
            background_log_e: [0; 2 * MAX_BANDS],
        };
        dec.reset();

        Ok(dec)
    }

    /// Forget everything about the previous frames.
    pub fn reset(&mut self) {
        self.rng = 0;
        self.error = false;
        self.last_pitch_index = 0;
        self.loss_count = 0;
        self.postfilter_old = PostFilter::default();
        self.postfilter = PostFilter::default();
        self.history = vec![ChannelHistory::new(self.overlap); self.channels];
        self.old_band_e = [0; 2 * MAX_BANDS];
        self.old_log_e = [SILENT_LOG_E; 2 * MAX_BANDS];
        self.old_log_e2 = [SILENT_LOG_E; 2 * MAX_BANDS];
        self.background_log_e = [0; 2 * MAX_BANDS];
    }

    /// The first coded band, below the end band.
    pub fn set_start_band(&mut self, start: usize) -> Result<()> {
        if start >= self.mode.nb_ebands || start >= self.end {
            return Err(Error::InvalidArgument("start band out of range"));
        }
        self.start = start;
        Ok(())
    }

    pub fn set_end_band(&mut self, end: usize) -> Result<()> {
        if end < 1 || end > self.mode.nb_ebands || end <= self.start {
            return Err(Error::InvalidArgument("end band out of range"));
        }
        self.end = end;
        Ok(())
    }

    /// Channels coded in the stream, they are mixed to the output ones.
    pub fn set_stream_channels(&mut self, channels: usize) -> Result<()> {
        if channels < 1 || channels > 2 {
            return Err(Error::InvalidArgument("stream channels must be 1 or 2"));
        }
        self.stream_channels = channels;
        Ok(())
    }

    pub fn set_signalling(&mut self, signalling: bool) {
        self.signalling = signalling;
    }

    pub fn signalling(&self) -> bool {
        self.signalling
    }

    /// Whether a frame ran out of bits since the last call.
    pub fn get_and_clear_error(&mut self) -> bool {
        std::mem::replace(&mut self.error, false)
    }

    /// Output samples of delay per channel.
    pub fn lookahead(&self) -> usize {
        self.overlap / self.downsample
    }

    /// Post-filter period of the last frame.
    pub fn pitch(&self) -> usize {
        self.postfilter.period
    }

    /// Range coder state at the end of the last frame.
    pub fn final_range(&self) -> u32 {
        self.rng
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn downsample(&self) -> usize {
        self.downsample
    }

    /// Decode a frame of `frame_size` samples per channel into `pcm`,
    /// interleaved. A missing or single byte `data` is concealed.
    ///
    /// Returns the samples per channel written. On
    /// `Error::InternalInconsistency` the output is complete nonetheless.
    pub fn decode(&mut self, data: Option<&[u8]>, pcm: &mut [i16], frame_size: usize) -> Result<usize> {
        let frame_size = frame_size * self.downsample;
        let lm = (0..=self.mode.max_lm)
            .find(|&lm| self.mode.short_mdct_size << lm == frame_size)
            .ok_or(Error::InvalidArgument("unsupported frame size"))?;

        let n = SHORT_MDCT_SIZE << lm;
        let needed = n / self.downsample * self.channels;
        if pcm.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: pcm.len(),
            });
        }

        let data = match data {
            Some(data) if data.len() > MAX_PACKET_SIZE => {
                return Err(Error::InvalidArgument("frame larger than 1275 bytes"));
            }
            Some(data) if data.len() > 1 => data,
            _ => {
                self.decode_lost(n, lm);
                self.deemphasis(pcm, n);
                return Ok(frame_size / self.downsample);
            }
        };

        let mut f = Frame::new(data, lm, self.stream_channels);

        if f.channels == 1 {
            for i in 0..MAX_BANDS {
                self.old_band_e[i] = self.old_band_e[i].max(self.old_band_e[MAX_BANDS + i]);
            }
        }

        self.read_flags(&mut f);
        self.decode_coarse(&mut f);
        self.decode_allocation(&mut f);
        for h in self.history.iter_mut() {
            h.shift(n, self.overlap);
        }
        self.decode_bands(&mut f);

        debug!(
            "frame: lm {}, {} bytes, silence {}, transient {}",
            lm, f.len, f.silence, f.transient
        );

        let eff_end = self.end.min(self.mode.eff_ebands);
        self.synthesis(&f.x, f.channels, self.start, eff_end, lm, f.transient, f.silence);
        self.apply_postfilter(&f);
        self.update_energy_history(&f);

        self.rng = f.rd.range();
        self.deemphasis(pcm, n);
        self.loss_count = 0;

        self.check_budget(f.rd.tell(), f.total_bits(), f.rd.error())?;

        Ok(frame_size / self.downsample)
    }

    /// The range decoder fault is recorded for overrunning frames as well.
    fn check_budget(&mut self, consumed: usize, available: usize, fault: bool) -> Result<()> {
        if fault {
            self.error = true;
        }
        if consumed > available {
            warn!("frame overrun: {} bits of {}", consumed, available);
            return Err(Error::InternalInconsistency { consumed, available });
        }
        Ok(())
    }

    /// Silence, post-filter, transient and intra flags.
    fn read_flags(&self, f: &mut Frame) {
        let total_bits = f.total_bits();
        let rd = &mut f.rd;

        let tell = rd.tell();
        f.silence = if tell >= total_bits {
            true
        } else if tell == 1 {
            rd.decode_logp(15)
        } else {
            false
        };
        if f.silence {
            // pretend all the bits got used
            rd.to_end();
        }

        if self.start == 0 && rd.tell() + 16 <= total_bits {
            f.postfilter = PostFilter::parse(rd, total_bits);
        }

        f.transient = if f.lm > 0 && rd.tell() + 3 <= total_bits {
            rd.decode_logp(3)
        } else {
            false
        };

        f.intra = if rd.tell() + 3 <= total_bits {
            rd.decode_logp(3)
        } else {
            false
        };

        trace!(
            "flags: silence {}, transient {}, intra {}",
            f.silence,
            f.transient,
            f.intra
        );
    }

    /// Coarse energy, time-frequency resolution and spreading.
    fn decode_coarse(&mut self, f: &mut Frame) {
        unquant_coarse_energy(
            &mut f.rd,
            &mut self.old_band_e,
            self.start,
            self.end,
            f.intra,
            f.channels,
            f.lm,
        );

        tf_decode(&mut f.rd, self.start, self.end, f.transient, &mut f.tf_res, f.lm);

        if f.rd.tell() + 4 <= f.total_bits() {
            f.spread = Spread::from(f.rd.decode_icdf(SPREAD_ICDF));
        }
    }

    /// Dynamic allocation boosts, trim and the band allocation, then the
    /// fine energy it implies.
    fn decode_allocation(&mut self, f: &mut Frame) {
        let mode = &*self.mode;
        let (start, end, lm, c) = (self.start, self.end, f.lm, f.channels);
        let rd = &mut f.rd;

        let cap = init_caps(mode, lm, c);
        let mut offsets = [0i32; MAX_BANDS];
        let mut dynalloc_logp = 6;
        let mut total_bits = (f.len * 8) as i32 * (1 << BITRES);
        let mut tell = rd.tell_frac() as i32;

        for i in start..end {
            let width = (c * mode.width(i) << lm) as i32;
            // quanta is 6 bits, but no more than 1 bit/sample and no less than 1/8 bit/sample
            let quanta = (width << BITRES).min((6 << BITRES).max(width));
            let mut loop_logp = dynalloc_logp;
            let mut boost = 0;
            while tell + (loop_logp << BITRES) < total_bits && boost < cap[i] {
                let flag = rd.decode_logp(loop_logp as usize);
                tell = rd.tell_frac() as i32;
                if !flag {
                    break;
                }
                boost += quanta;
                total_bits -= quanta;
                loop_logp = 1;
            }
            offsets[i] = boost;
            if boost > 0 {
                dynalloc_logp = (dynalloc_logp - 1).max(2);
            }
        }

        let alloc_trim = if tell + (6 << BITRES) <= total_bits {
            rd.decode_icdf(TRIM_ICDF) as i32
        } else {
            5
        };

        let mut bits = ((f.len * 8) << BITRES) as i32 - rd.tell_frac() as i32 - 1;
        f.anti_collapse_rsv = if f.transient && lm >= 2 && bits >= ((lm as i32 + 2) << BITRES) {
            1 << BITRES
        } else {
            0
        };
        bits -= f.anti_collapse_rsv;

        f.alloc = compute_allocation(mode, start, end, &offsets, &cap, alloc_trim, bits, c, lm, rd);

        trace!(
            "allocation: trim {}, coded bands {}, intensity {}, dual stereo {}",
            alloc_trim,
            f.alloc.coded_bands,
            f.alloc.intensity,
            f.alloc.dual_stereo
        );

        unquant_fine_energy(rd, &mut self.old_band_e, start, end, &f.alloc.fine_bits, c);
    }

    /// Band shapes, the last energy refinement and anti-collapse.
    fn decode_bands(&mut self, f: &mut Frame) {
        let mode = &*self.mode;
        let (start, end, lm, c, n) = (self.start, self.end, f.lm, f.channels, f.n);
        let total = (f.len * (8 << BITRES)) as i32 - f.anti_collapse_rsv;

        {
            let (x, y) = f.x.split_at_mut(n);
            let y = if c == 2 { Some(y) } else { None };
            quant_all_bands(
                mode,
                start,
                end,
                x,
                y,
                &mut f.collapse_masks[..c * MAX_BANDS],
                &f.alloc,
                f.transient,
                f.spread,
                &f.tf_res,
                total,
                &mut f.rd,
                lm,
                &mut self.rng,
            );
        }

        let anti_collapse_on = f.anti_collapse_rsv > 0 && f.rd.rawbits(1) != 0;

        let bits_left = (f.len * 8) as i32 - f.rd.tell() as i32;
        unquant_energy_finalise(
            &mut f.rd,
            &mut self.old_band_e,
            start,
            end,
            &f.alloc.fine_bits,
            &f.alloc.fine_priority,
            bits_left,
            c,
        );

        if anti_collapse_on {
            anti_collapse(
                mode,
                &mut f.x,
                &f.collapse_masks,
                lm,
                c,
                n,
                start,
                end,
                &self.old_band_e,
                &self.old_log_e,
                &self.old_log_e2,
                &f.alloc.pulses,
                self.rng,
            );
        }

        if f.silence {
            self.old_band_e = [SILENT_LOG_E; 2 * MAX_BANDS];
        }
    }

    /// Denormalize `x`, coded with `c` channels, and run the inverse MDCT
    /// into the tail of the decode memory.
    #[allow(clippy::too_many_arguments)]
    fn synthesis(&mut self, x: &[i32], c: usize, start: usize, end: usize, lm: usize, transient: bool, silence: bool) {
        let mode = &*self.mode;
        let n = mode.short_mdct_size << lm;
        let m = 1 << lm;
        let (blocks, nb, shift) = if transient {
            (m, mode.short_mdct_size, mode.max_lm)
        } else {
            (1, n, mode.max_lm - lm)
        };
        let overlap = self.overlap;
        let downsample = self.downsample;
        let old_band_e = &self.old_band_e;

        let imdct = |freq: &[i32], out: &mut [i32]| {
            for b in 0..blocks {
                let at = DECODE_BUFFER_SIZE - n + nb * b;
                mode.mdct
                    .backward(&freq[b..], &mut out[at..], &mode.window, overlap, shift, blocks);
            }
        };
        let denormalise = |ch: usize, freq: &mut [i32]| {
            denormalise_bands(
                mode,
                &x[ch * n..(ch + 1) * n],
                freq,
                &old_band_e[ch * MAX_BANDS..],
                start,
                end,
                m,
                downsample,
                silence,
            );
        };

        let mut freq = vec![0i32; n];
        match (self.history.len(), c) {
            (2, 1) => {
                denormalise(0, &mut freq);
                for h in self.history.iter_mut() {
                    imdct(&freq, &mut h.decode_mem);
                }
            }
            (1, 2) => {
                let mut freq2 = vec![0i32; n];
                denormalise(0, &mut freq);
                denormalise(1, &mut freq2);
                for (a, &b) in freq.iter_mut().zip(freq2.iter()) {
                    *a = half32(a.wrapping_add(b));
                }
                imdct(&freq, &mut self.history[0].decode_mem);
            }
            _ => {
                for ch in 0..self.history.len() {
                    denormalise(ch, &mut freq);
                    imdct(&freq, &mut self.history[ch].decode_mem);
                }
            }
        }
    }

    /// Cross-fade from the previous post-filter to the one of this frame.
    fn apply_postfilter(&mut self, f: &Frame) {
        let mode = &*self.mode;
        let n = f.n;
        let at = DECODE_BUFFER_SIZE - n;
        let short = mode.short_mdct_size;

        self.postfilter.period = self.postfilter.period.max(COMBFILTER_MINPERIOD);
        self.postfilter_old.period = self.postfilter_old.period.max(COMBFILTER_MINPERIOD);

        for h in self.history.iter_mut() {
            let mem = &mut h.decode_mem;
            comb_filter(
                mem,
                at,
                None,
                short,
                &self.postfilter_old,
                &self.postfilter,
                &mode.window,
                self.overlap,
            );
            if f.lm != 0 {
                comb_filter(
                    mem,
                    at + short,
                    None,
                    n - short,
                    &self.postfilter,
                    &f.postfilter,
                    &mode.window,
                    self.overlap,
                );
            }
        }

        self.postfilter_old = self.postfilter;
        self.postfilter = f.postfilter;
        if f.lm != 0 {
            self.postfilter_old = self.postfilter;
        }
    }

    fn update_energy_history(&mut self, f: &Frame) {
        if f.channels == 1 {
            self.old_band_e.copy_within(..MAX_BANDS, MAX_BANDS);
        }

        if !f.transient {
            self.old_log_e2 = self.old_log_e;
            self.old_log_e = self.old_band_e;
            // 1 dB/s unless the signal came back after a long loss
            let max_increase = if self.loss_count < 10 {
                (1 << f.lm) as i32
            } else {
                1 << DB_SHIFT
            };
            for (b, &e) in self.background_log_e.iter_mut().zip(self.old_band_e.iter()) {
                *b = (*b + max_increase).min(e);
            }
        } else {
            for (l, &e) in self.old_log_e.iter_mut().zip(self.old_band_e.iter()) {
                *l = (*l).min(e);
            }
        }

        for c in 0..2 {
            let unused = (0..self.start).chain(self.end..MAX_BANDS);
            for i in unused {
                let at = c * MAX_BANDS + i;
                self.old_band_e[at] = 0;
                self.old_log_e[at] = SILENT_LOG_E;
                self.old_log_e2[at] = SILENT_LOG_E;
            }
        }
    }

    /// Remove the pre-emphasis from the last `n` synthesized samples.
    fn deemphasis(&mut self, pcm: &mut [i16], n: usize) {
        let coef = self.mode.preemph[0];
        let cc = self.history.len();
        let downsample = self.downsample;
        let mut scratch = vec![0i32; n];

        for (c, h) in self.history.iter_mut().enumerate() {
            let mut m = h.preemph_mem;
            for (s, &x) in scratch
                .iter_mut()
                .zip(&h.decode_mem[DECODE_BUFFER_SIZE - n..DECODE_BUFFER_SIZE])
            {
                let tmp = x.wrapping_add(m);
                m = mult16_32_q15(coef, tmp);
                *s = tmp;
            }
            h.preemph_mem = m;

            for (j, &s) in scratch.iter().step_by(downsample).enumerate() {
                pcm[j * cc + c] = sig2word16(s, SIG_SHIFT);
            }
        }
    }

    /// Conceal a missing frame of `n` samples.
    fn decode_lost(&mut self, n: usize, lm: usize) {
        let start = self.start;
        let end = self.end;
        let eff_end = start.max(end.min(self.mode.eff_ebands));

        if self.loss_count >= 5 || start != 0 {
            debug!("concealing with noise, loss {}", self.loss_count);
            self.conceal_noise(n, lm, start, end, eff_end);
        } else {
            debug!("concealing with pitch, loss {}", self.loss_count);
            self.conceal_pitch(n);
        }

        self.loss_count += 1;
    }

    /// Noise at an energy decaying towards the background.
    fn conceal_noise(&mut self, n: usize, lm: usize, start: usize, end: usize, eff_end: usize) {
        let c = self.channels;
        let decay = if self.loss_count == 0 {
            3 << (DB_SHIFT - 1)
        } else {
            1 << (DB_SHIFT - 1)
        };

        for ch in 0..c {
            for i in start..end {
                let at = ch * MAX_BANDS + i;
                self.old_band_e[at] = self.background_log_e[at].max(self.old_band_e[at] - decay);
            }
        }

        let mut x = vec![0i32; c * n];
        let mut seed = self.rng;
        for ch in 0..c {
            for i in start..eff_end {
                let off = ch * n + ((self.mode.ebands[i] as usize) << lm);
                let len = self.mode.width(i) << lm;
                let band = &mut x[off..off + len];
                for v in band.iter_mut() {
                    seed = celt_lcg_rand(seed);
                    *v = (seed as i32) >> 20;
                }
                renormalise_vector(band, Q15_ONE);
            }
        }
        self.rng = seed;

        for h in self.history.iter_mut() {
            h.shift(n, self.overlap);
        }

        self.synthesis(&x, c, start, eff_end, lm, false, false);
    }

    /// Repeat the last pitch period through the LPC filter of the history.
    fn conceal_pitch(&mut self, n: usize) {
        let overlap = self.overlap;
        let window = &self.mode.window;

        let (pitch, fade) = if self.loss_count == 0 {
            let pitch = plc_pitch_search(&self.history);
            self.last_pitch_index = pitch;
            (pitch, Q15_ONE)
        } else {
            (self.last_pitch_index, 26214)
        };
        let first_loss = self.loss_count == 0;

        let pf = PostFilter {
            gain: -self.postfilter.gain,
            ..self.postfilter
        };

        for h in self.history.iter_mut() {
            let buf = &mut h.decode_mem;
            let mut exc: Vec<i32> = buf[DECODE_BUFFER_SIZE - MAX_PERIOD..DECODE_BUFFER_SIZE]
                .iter()
                .map(|&v| round16(v, SIG_SHIFT))
                .collect();

            if first_loss {
                let mut ac = [0i32; LPC_ORDER + 1];
                autocorr(&exc, &mut ac, window, overlap);
                // noise floor at -40 dB
                ac[0] += ac[0] >> 13;
                // lag windowing
                for (i, a) in ac.iter_mut().enumerate().skip(1) {
                    *a -= mult16_32_q15((2 * i * i) as i32, *a);
                }
                lpc(&mut h.lpc, &ac);
            }

            let exc_length = (2 * pitch).min(MAX_PERIOD);
            let mut lpc_mem = [0i32; LPC_ORDER];
            for (i, m) in lpc_mem.iter_mut().enumerate() {
                *m = round16(buf[DECODE_BUFFER_SIZE - exc_length - 1 - i], SIG_SHIFT);
            }
            fir(&mut exc[MAX_PERIOD - exc_length..], &h.lpc, &lpc_mem);

            // the decay of the excitation over its last two half periods
            let decay = {
                let tail = &exc[MAX_PERIOD - exc_length..];
                let shift = (2 * celt_zlog2(celt_maxabs16(tail)) - 20).max(0) as u32;
                let decay_length = exc_length >> 1;
                let mut e1 = 1i32;
                let mut e2 = 1i32;
                for i in 0..decay_length {
                    let e = exc[MAX_PERIOD - decay_length + i];
                    e1 += mult16_16(e, e) >> shift;
                    let e = exc[MAX_PERIOD - 2 * decay_length + i];
                    e2 += mult16_16(e, e) >> shift;
                }
                let e1 = e1.min(e2);
                celt_sqrt(frac_div32(e1 >> 1, e2))
            };

            buf.copy_within(n..DECODE_BUFFER_SIZE, 0);

            let offset = MAX_PERIOD - pitch;
            let len = n + overlap;
            let mut attenuation = mult16_16_q15(fade, decay);
            let mut s1 = 0i32;
            let mut j = 0;
            for i in 0..len {
                if j >= pitch {
                    j -= pitch;
                    attenuation = mult16_16_q15(attenuation, decay);
                }
                buf[DECODE_BUFFER_SIZE - n + i] = mult16_16_q15(attenuation, exc[offset + j]) << SIG_SHIFT;
                let tmp = round16(buf[DECODE_BUFFER_SIZE - MAX_PERIOD - n + offset + j], SIG_SHIFT);
                s1 = s1.wrapping_add(mult16_16(tmp, tmp) >> 8);
                j += 1;
            }

            let mut lpc_mem = [0i32; LPC_ORDER];
            for (i, m) in lpc_mem.iter_mut().enumerate() {
                *m = round16(buf[DECODE_BUFFER_SIZE - n - 1 - i], SIG_SHIFT);
            }
            let region = &mut buf[DECODE_BUFFER_SIZE - n..DECODE_BUFFER_SIZE - n + len];
            iir(region, &h.lpc, &lpc_mem);

            // never let the synthesis be louder than the history
            let s2 = region.iter().fold(0i32, |s, &v| {
                let tmp = round16(v, SIG_SHIFT);
                s.wrapping_add(mult16_16(tmp, tmp) >> 8)
            });
            if s1 <= s2 >> 2 {
                region.iter_mut().for_each(|v| *v = 0);
            } else if s1 < s2 {
                let ratio = celt_sqrt(frac_div32((s1 >> 1) + 1, s2 + 1));
                for (i, v) in region.iter_mut().enumerate() {
                    let g = if i < overlap {
                        Q15_ONE - mult16_16_q15(window[i], Q15_ONE - ratio)
                    } else {
                        ratio
                    };
                    *v = mult16_32_q15(g, *v);
                }
            }

            // undo the post-filter on the overlap to fold it back in
            let mut etmp = vec![0i32; overlap];
            comb_filter(&mut etmp, 0, Some((&buf[..], DECODE_BUFFER_SIZE)), overlap, &pf, &pf, &[], 0);
            for i in 0..overlap / 2 {
                buf[DECODE_BUFFER_SIZE + i] = mult16_32_q15(window[i], etmp[overlap - 1 - i])
                    .wrapping_add(mult16_32_q15(window[overlap - i - 1], etmp[i]));
            }
        }
    }
}

/// Pitch of the decode history, in full rate samples.
fn plc_pitch_search(history: &[ChannelHistory]) -> usize {
    let mem: Vec<&[i32]> = history.iter().map(|h| &h.decode_mem[..]).collect();
    let mut lp = vec![0i32; DECODE_BUFFER_SIZE >> 1];
    pitch_downsample(&mem, &mut lp);

    let pitch = pitch_search(
        &lp[PLC_PITCH_LAG_MAX >> 1..],
        &lp,
        DECODE_BUFFER_SIZE - PLC_PITCH_LAG_MAX,
        PLC_PITCH_LAG_MAX - PLC_PITCH_LAG_MIN,
    );

    PLC_PITCH_LAG_MAX - pitch
}

/// Per band maximum allocation, in 1/8 bits.
fn init_caps(mode: &Mode, lm: usize, channels: usize) -> [i32; MAX_BANDS] {
    let mut cap = [0i32; MAX_BANDS];
    for (i, (c, &v)) in cap.iter_mut().zip(mode.caps(lm, channels)).enumerate() {
        let n = (mode.width(i) << lm) as i32;
        *c = (v as i32 + 64) * channels as i32 * n >> 2;
    }
    cap
}

/// Time-frequency resolution changes of the bands in `start..end`.
fn tf_decode(rd: &mut RangeDecoder, start: usize, end: usize, transient: bool, tf_res: &mut [i32], lm: usize) {
    let mut budget = rd.len() * 8;
    let mut tell = rd.tell();
    let mut logp = if transient { 2 } else { 4 };
    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    if tf_select_rsv {
        budget -= 1;
    }

    let mut changed = 0;
    let mut curr = 0;
    for r in tf_res[start..end].iter_mut() {
        if tell + logp <= budget {
            curr ^= rd.decode_logp(logp) as usize;
            tell = rd.tell();
            changed |= curr;
        }
        *r = curr as i32;
        logp = if transient { 4 } else { 5 };
    }

    let row = &TF_SELECT_TABLE[lm];
    let base = 4 * transient as usize;
    let tf_select = if tf_select_rsv && row[base + changed] != row[base + 2 + changed] {
        rd.decode_logp(1) as usize
    } else {
        0
    };

    for r in tf_res[start..end].iter_mut() {
        *r = row[base + 2 * tf_select + *r as usize];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::test_encoder::RangeEncoder;
    use interpolate_name::interpolate_test;

    fn silent_frame(len: usize) -> Vec<u8> {
        let mut enc = RangeEncoder::new(len);
        enc.encode_logp(true, 15);
        let mut buf = enc.done();
        buf.resize(len, 0);
        buf
    }

    fn noise(seed: &mut u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|_| {
                *seed = celt_lcg_rand(*seed);
                (*seed >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn bad_arguments() {
        assert!(CeltDecoder::new(44100, 2).is_err());
        assert!(CeltDecoder::new(48000, 3).is_err());

        let mut dec = CeltDecoder::new(48000, 1).unwrap();
        let mut pcm = vec![0i16; 960];
        assert_eq!(
            dec.decode(None, &mut pcm, 100),
            Err(Error::InvalidArgument("unsupported frame size"))
        );
        assert!(dec.decode(None, &mut pcm[..100], 960).is_err());
        assert!(dec.set_start_band(21).is_err());
        assert!(dec.set_end_band(0).is_err());
        assert!(dec.set_end_band(22).is_err());
        assert!(dec.set_stream_channels(0).is_err());
        assert!(dec.set_end_band(17).is_ok());
    }

    #[test]
    fn empty_band_range() {
        let mut dec = CeltDecoder::new(48000, 1).unwrap();
        dec.set_end_band(13).unwrap();
        assert_eq!(
            dec.set_start_band(17),
            Err(Error::InvalidArgument("start band out of range"))
        );
        assert!(dec.set_start_band(13).is_err());
        dec.set_start_band(12).unwrap();
        assert_eq!(
            dec.set_end_band(12),
            Err(Error::InvalidArgument("end band out of range"))
        );
        assert!(dec.set_end_band(5).is_err());

        let mut pcm = vec![0i16; 960];
        let res = dec.decode(Some(&[0x5a; 60]), &mut pcm, 960);
        assert!(res.is_ok() || matches!(res, Err(Error::InternalInconsistency { .. })));
    }

    #[test]
    fn silence() {
        let mut dec = CeltDecoder::new(48000, 2).unwrap();
        let frame = silent_frame(10);
        let mut pcm = vec![1i16; 2 * 960];

        for _ in 0..10 {
            assert_eq!(dec.decode(Some(&frame), &mut pcm, 960), Ok(960));
        }

        assert!(pcm.iter().all(|&s| s == 0));
        assert_eq!(&dec.old_band_e[..], &[SILENT_LOG_E; 2 * MAX_BANDS][..]);
        assert!(dec.background_log_e.iter().all(|&e| e <= SILENT_LOG_E));
        assert!(!dec.get_and_clear_error());
    }

    #[test]
    fn loss_from_scratch() {
        let mut dec = CeltDecoder::new(48000, 1).unwrap();
        let mut pcm = vec![1i16; 960];

        for i in 0..8 {
            assert_eq!(dec.decode(None, &mut pcm, 960), Ok(960));
            assert_eq!(dec.loss_count, i + 1);
            if i < 5 {
                // nothing to extrapolate from
                assert!(pcm.iter().all(|&s| s == 0));
            }
        }

        let frame = silent_frame(4);
        dec.decode(Some(&frame), &mut pcm, 960).unwrap();
        assert_eq!(dec.loss_count, 0);

        // a single byte is a loss too
        dec.decode(Some(&frame[..1]), &mut pcm, 960).unwrap();
        assert_eq!(dec.loss_count, 1);
    }

    fn rms(pcm: &[i16]) -> f64 {
        (pcm.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / pcm.len() as f64).sqrt()
    }

    #[test]
    fn loss_run_fades() {
        let mut dec = CeltDecoder::new(48000, 1).unwrap();
        let mut pcm = vec![0i16; 960];
        let mut seed = 7;

        // silence first, to keep the background energy far below the signal
        for _ in 0..2 {
            dec.decode(Some(&silent_frame(10)), &mut pcm, 960).unwrap();
        }
        for _ in 0..10 {
            let frame = noise(&mut seed, 120);
            match dec.decode(Some(&frame), &mut pcm, 960) {
                Ok(_) | Err(Error::InternalInconsistency { .. }) => {}
                Err(e) => panic!("{}", e),
            }
        }

        let mut levels = Vec::new();
        for i in 0..8 {
            assert_eq!(dec.decode(None, &mut pcm, 960), Ok(960));
            levels.push(rms(&pcm));
            for (e, bg) in dec.old_band_e[..MAX_BANDS].iter().zip(&dec.background_log_e[..MAX_BANDS]) {
                assert!(e >= bg, "loss {}: {} < {}", i, e, bg);
            }
        }

        assert!(levels[5] > 0.0, "{:?}", levels);
        for w in levels[5..].windows(2) {
            assert!(w[1] <= w[0] * 1.05, "{:?}", levels);
        }
    }

    #[interpolate_test(lm0_mono, 0, 1)]
    #[interpolate_test(lm1_stereo, 1, 2)]
    #[interpolate_test(lm2_mono, 2, 1)]
    #[interpolate_test(lm3_stereo, 3, 2)]
    fn silence_final_range(lm: usize, channels: usize) {
        let frame_size = SHORT_MDCT_SIZE << lm;
        let mut dec = CeltDecoder::new(48000, channels).unwrap();
        let mut pcm = vec![1i16; channels * frame_size];

        for len in &[4, 10, 100] {
            assert_eq!(dec.decode(Some(&silent_frame(*len)), &mut pcm, frame_size), Ok(frame_size));
            // a single symbol of probability 2^-15 taken from the initial
            // 2^31 range, renormalised once
            assert_eq!(dec.final_range(), 1 << 24);
            assert!(pcm.iter().all(|&s| s == 0));
        }
    }

    #[test]
    fn overrun_records_fault() {
        let mut dec = CeltDecoder::new(48000, 1).unwrap();
        assert_eq!(dec.check_budget(80, 80, false), Ok(()));
        assert!(!dec.get_and_clear_error());

        assert_eq!(
            dec.check_budget(90, 80, true),
            Err(Error::InternalInconsistency {
                consumed: 90,
                available: 80
            })
        );
        assert!(dec.get_and_clear_error());
        assert!(!dec.get_and_clear_error());
    }

    #[test]
    fn downsampled_output() {
        let mut dec = CeltDecoder::new(16000, 2).unwrap();
        let mut pcm = vec![0i16; 2 * 320];
        assert_eq!(dec.decode(None, &mut pcm, 320), Ok(320));
        assert_eq!(dec.lookahead(), 40);
    }

    #[interpolate_test(lm0, 0)]
    #[interpolate_test(lm1, 1)]
    #[interpolate_test(lm2, 2)]
    #[interpolate_test(lm3, 3)]
    fn garbage_is_decoded(lm: usize) {
        let _ = pretty_env_logger::try_init();
        let frame_size = SHORT_MDCT_SIZE << lm;
        let mut seed = 42 + lm as u32;

        for &(channels, stream_channels) in &[(1, 1), (2, 2), (2, 1), (1, 2)] {
            let mut dec = CeltDecoder::new(48000, channels).unwrap();
            dec.set_stream_channels(stream_channels).unwrap();
            let mut pcm = vec![0i16; channels * frame_size];

            for len in (2..300).step_by(37) {
                let frame = noise(&mut seed, len);
                match dec.decode(Some(&frame), &mut pcm, frame_size) {
                    Ok(n) => assert_eq!(n, frame_size),
                    Err(Error::InternalInconsistency { .. }) => {}
                    Err(e) => panic!("{}", e),
                }
            }

            // conceal after real frames, through both branches
            for _ in 0..7 {
                assert_eq!(dec.decode(None, &mut pcm, frame_size), Ok(frame_size));
            }
            dec.reset();
            assert_eq!(dec.loss_count, 0);
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut dec = CeltDecoder::new(48000, 2).unwrap();
        let mut pcm = vec![0i16; 2 * 960];
        let mut seed = 7;
        let frame = noise(&mut seed, 120);
        let _ = dec.decode(Some(&frame), &mut pcm, 960);
        dec.reset();

        let fresh = CeltDecoder::new(48000, 2).unwrap();
        assert_eq!(dec.old_log_e, fresh.old_log_e);
        assert_eq!(dec.old_band_e, fresh.old_band_e);
        assert_eq!(dec.final_range(), 0);
        assert_eq!(dec.pitch(), 0);
    }

    #[test]
    fn tf_defaults() {
        let buf = [];
        let mut rd = RangeDecoder::new(&buf);
        let mut tf_res = [7; MAX_BANDS];
        tf_decode(&mut rd, 0, MAX_BANDS, true, &mut tf_res, 3);
        // no bits, no change from the transient default
        assert!(tf_res.iter().all(|&r| r == 3));
    }
}
