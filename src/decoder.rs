//! Opus packet decoding
//!
//! Only CELT-only packets are supported, multistream mapping is left to the
//! caller.

use crate::celt::CeltDecoder;
use crate::error::*;
use crate::maths::*;
use crate::packet::*;

const OPUS_HEAD_SIZE: usize = 19;

/// Decoder settings, usually derived from the `OpusHead` identification
/// header with [`DecoderConfig::from_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Output sample rate.
    pub sample_rate: usize,
    pub channels: usize,
    /// Output gain in dB, Q8.
    pub gain: i16,
    /// Samples per channel at 48kHz to discard at the start of the stream.
    pub pre_skip: u16,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            sample_rate: 48000,
            channels: 2,
            gain: 0,
            pre_skip: 0,
        }
    }
}

impl DecoderConfig {
    /// Read an `OpusHead` header, the output rate stays at 48kHz.
    pub fn from_head(extradata: &[u8]) -> Result<Self> {
        if extradata.len() < OPUS_HEAD_SIZE || &extradata[..8] != b"OpusHead" {
            return Err(Error::InvalidArgument("not an OpusHead"));
        }
        if extradata[8] & 0xf0 != 0 {
            return Err(Error::InvalidArgument("unsupported OpusHead version"));
        }

        let channels = extradata[9] as usize;
        let pre_skip = u16::from_le_bytes([extradata[10], extradata[11]]);
        let input_rate = u32::from_le_bytes([extradata[12], extradata[13], extradata[14], extradata[15]]);
        let gain = i16::from_le_bytes([extradata[16], extradata[17]]);
        let mapping = extradata[18];

        if mapping != 0 || channels > 2 {
            return Err(Error::InvalidArgument("channel mapping not supported"));
        }

        debug!(
            "OpusHead: {} channels, pre-skip {}, input rate {}, gain {}",
            channels, pre_skip, input_rate, gain
        );

        let config = DecoderConfig {
            channels,
            gain,
            pre_skip,
            ..Default::default()
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.sample_rate {
            8000 | 12000 | 16000 | 24000 | 48000 => {}
            _ => return Err(Error::InvalidArgument("unsupported sample rate")),
        }
        if self.channels < 1 || self.channels > 2 {
            return Err(Error::InvalidArgument("channels must be 1 or 2"));
        }
        Ok(())
    }

    /// Output gain as a linear factor, Q16.
    fn linear_gain(&self) -> i32 {
        celt_exp2(mult16_16_p15(qconst16(6.48814081e-4, 25), self.gain as i32))
    }
}

/// Packet decoder
///
/// Splits the packet in frames and feeds them to a [`CeltDecoder`].
#[derive(Debug, Clone)]
pub struct Decoder {
    config: DecoderConfig,
    celt: CeltDecoder,
    gain: i32,
    /// Samples per channel of the frames of the last packet.
    last_frame_size: usize,
    last_nb_frames: usize,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Result<Self> {
        config.validate()?;
        let celt = CeltDecoder::new(config.sample_rate, config.channels)?;

        Ok(Decoder {
            config,
            celt,
            gain: config.linear_gain(),
            last_frame_size: FrameDuration::Standard.samples(config.sample_rate),
            last_nb_frames: 1,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The frame decoder, for the runtime controls.
    pub fn celt(&mut self) -> &mut CeltDecoder {
        &mut self.celt
    }

    pub fn reset(&mut self) {
        self.celt.reset();
        self.last_frame_size = FrameDuration::Standard.samples(self.config.sample_rate);
        self.last_nb_frames = 1;
    }

    /// Decode a packet into interleaved `pcm`, returns the samples per
    /// channel written.
    ///
    /// A missing or empty packet conceals as many samples as the previous
    /// packet carried.
    pub fn decode(&mut self, packet: Option<&[u8]>, pcm: &mut [i16]) -> Result<usize> {
        let channels = self.config.channels;

        let packet = match packet {
            Some(data) if !data.is_empty() => Packet::from_slice(data)?,
            _ => {
                let frame_size = self.last_frame_size;
                let needed = frame_size * self.last_nb_frames * channels;
                check_len(pcm, needed)?;
                debug!("concealing {} frames of {}", self.last_nb_frames, frame_size);
                let celt = &mut self.celt;
                let overrun = decode_frames(
                    std::iter::repeat(None).take(self.last_nb_frames),
                    &mut pcm[..needed],
                    frame_size * channels,
                    |frame, out| celt.decode(frame, out, frame_size),
                )?;
                self.apply_gain(&mut pcm[..needed]);
                return overrun.map_or(Ok(frame_size * self.last_nb_frames), Err);
            }
        };

        if packet.mode != Mode::CELT {
            return Err(Error::InvalidPacket("only CELT-only packets are supported"));
        }

        let frame_size = packet.frame_duration.samples(self.config.sample_rate);
        let nb_frames = packet.frames.len();
        let needed = frame_size * nb_frames * channels;
        check_len(pcm, needed)?;

        trace!(
            "packet: {:?} {:?}, {} frames, stereo {}",
            packet.bandwidth,
            packet.frame_duration,
            nb_frames,
            packet.stereo
        );

        self.celt.set_end_band(packet.bandwidth.celt_band())?;
        self.celt
            .set_stream_channels(if packet.stereo { 2 } else { 1 })?;

        let celt = &mut self.celt;
        let overrun = decode_frames(
            packet.frames.iter().map(|&frame| Some(frame)),
            &mut pcm[..needed],
            frame_size * channels,
            |frame, out| celt.decode(frame, out, frame_size),
        )?;
        self.apply_gain(&mut pcm[..needed]);

        self.last_frame_size = frame_size;
        self.last_nb_frames = nb_frames;

        overrun.map_or(Ok(frame_size * nb_frames), Err)
    }

    fn apply_gain(&self, pcm: &mut [i16]) {
        if self.config.gain == 0 {
            return;
        }
        for s in pcm.iter_mut() {
            let v = (*s as i64 * self.gain as i64 + 32768) >> 16;
            *s = saturate16(v.max(i32::MIN as i64).min(i32::MAX as i64) as i32) as i16;
        }
    }
}

/// Decode each frame into its `stride` long slot of `pcm`.
///
/// An overrun still fills its slot, the following frames are decoded and
/// the first overrun is returned.
fn decode_frames<'a, I, F>(frames: I, pcm: &mut [i16], stride: usize, mut decode: F) -> Result<Option<Error>>
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
    F: FnMut(Option<&'a [u8]>, &mut [i16]) -> Result<usize>,
{
    let mut overrun = None;
    for (frame, out) in frames.into_iter().zip(pcm.chunks_mut(stride)) {
        match decode(frame, out) {
            Ok(_) => {}
            Err(e @ Error::InternalInconsistency { .. }) => {
                warn!("{}", e);
                overrun.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(overrun)
}

fn check_len(pcm: &[i16], needed: usize) -> Result<()> {
    if pcm.len() < needed {
        Err(Error::BufferTooSmall {
            needed,
            available: pcm.len(),
        })
    } else {
        Ok(())
    }
}
