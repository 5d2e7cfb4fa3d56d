//! Opus Packet parsing
//!
//! See [section-3](https://tools.ietf.org/html/rfc6716#section-3)

use crate::error::*;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Code {
    Single,
    DoubleEqual,
    DoubleVary,
    Multiple,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Mode {
    SILK,
    CELT,
    HYBRID,
}

/// Bandwidth
///
/// See [section-2.1.3](https://tools.ietf.org/html/rfc6716#section-2.1.3)
#[derive(Debug, PartialEq, PartialOrd, Eq, Ord, Clone, Copy)]
pub enum Bandwidth {
    Narrow = 8000,
    Medium = 12000,
    Wide = 16000,
    SuperWide = 24000,
    Full = 48000,
}

impl Bandwidth {
    /// Last coded CELT band, exclusive.
    pub fn celt_band(&self) -> usize {
        use self::Bandwidth::*;
        match self {
            Narrow => 13,
            Medium => 17,
            Wide => 17,
            SuperWide => 19,
            Full => 21,
        }
    }
}

/// Frame Duration
///
/// See [section-2.1.4](https://tools.ietf.org/html/rfc6716#section-2.1.4)
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FrameDuration {
    /// 2.5ms
    VeryShort = 120,
    /// 5ms
    Short = 240,
    /// 10ms
    Medium = 480,
    /// 20ms
    Standard = 960,
    /// 40ms,
    Long = 1920,
    /// 60ms
    VeryLong = 2880,
}

impl FrameDuration {
    /// Samples per channel at `sample_rate`.
    pub fn samples(self, sample_rate: usize) -> usize {
        self as usize * sample_rate / 48000
    }
}

/// Coding mode, bandwidth and duration of a TOC configuration.
pub fn config(toc: u8) -> (Mode, Bandwidth, FrameDuration) {
    use self::Bandwidth::*;
    use self::FrameDuration::*;

    let c = toc >> 3;
    match c {
        0..=11 => {
            let bandwidth = match c {
                0..=3 => Narrow,
                4..=7 => Bandwidth::Medium,
                _ => Wide,
            };
            let duration = match c & 0b11 {
                0 => FrameDuration::Medium,
                1 => Standard,
                2 => Long,
                _ => VeryLong,
            };
            (Mode::SILK, bandwidth, duration)
        }
        12..=15 => {
            let bandwidth = if c < 14 { SuperWide } else { Full };
            let duration = if c & 0b1 == 0 { FrameDuration::Medium } else { Standard };
            (Mode::HYBRID, bandwidth, duration)
        }
        _ => {
            let bandwidth = match c {
                16..=19 => Narrow,
                20..=23 => Wide,
                24..=27 => SuperWide,
                _ => Full,
            };
            let duration = match c & 0b11 {
                0 => VeryShort,
                1 => Short,
                2 => FrameDuration::Medium,
                _ => Standard,
            };
            (Mode::CELT, bandwidth, duration)
        }
    }
}

/// Samples per channel in each frame of a packet starting with `toc`.
pub fn samples_per_frame(toc: u8, sample_rate: usize) -> usize {
    config(toc).2.samples(sample_rate)
}

/// Frames in `buf` according to its framing code.
pub fn nb_frames(buf: &[u8]) -> Result<usize> {
    match buf {
        [] => Err(Error::InvalidArgument("empty packet")),
        [toc, ..] if toc & 0x3 == 0 => Ok(1),
        [toc, ..] if toc & 0x3 != 3 => Ok(2),
        [_] => Err(Error::InvalidPacket("missing frame count")),
        [_, count, ..] => Ok((count & 0x3f) as usize),
    }
}

/// Write the length of a frame, one or two bytes.
pub fn encode_size(size: usize, buf: &mut [u8]) -> usize {
    if size < 252 {
        buf[0] = size as u8;
        1
    } else {
        buf[0] = (252 + (size & 0x3)) as u8;
        buf[1] = ((size - buf[0] as usize) >> 2) as u8;
        2
    }
}

fn xiph_lacing_u16(buf: &[u8]) -> Result<(usize, usize)> {
    match buf {
        [] => Err(Error::InvalidPacket("missing frame length")),
        [v, ..] if *v < 252 => Ok((1, *v as usize)),
        [_] => Err(Error::InvalidPacket("truncated frame length")),
        [v, w, ..] => Ok((2, *v as usize + 4 * *w as usize)),
    }
}

/// Padding length, 255 means 254 bytes and more to follow.
fn xiph_lacing_u32(buf: &[u8]) -> Result<(usize, usize)> {
    let mut v = 0;
    let mut o = 0;

    loop {
        let b = *buf.get(o).ok_or(Error::InvalidPacket("truncated padding"))? as usize;
        o += 1;
        if b == 255 {
            v += 254;
        } else {
            v += b;
            break;
        }
    }
    Ok((o, v))
}

pub const MAX_FRAME_SIZE: usize = 1275;
pub const MAX_FRAMES: usize = 48;
/// 120ms at 48kHz
pub const MAX_PACKET_DUR: usize = 5760;

#[derive(Debug, PartialEq, Clone)]
pub struct Packet<'a> {
    pub code: Code,
    pub vbr: bool,
    pub toc: u8,
    pub stereo: bool,
    pub padding: usize,
    pub mode: Mode,
    pub bandwidth: Bandwidth,
    pub frame_duration: FrameDuration,
    pub frames: Vec<&'a [u8]>,
    /// Offset of the first frame.
    pub payload_offset: usize,
    /// Bytes taken by the packet, padding included.
    pub len: usize,
}

impl<'a> Packet<'a> {
    /// Parse a packet taking the whole of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Result<Self> {
        Self::parse(buf, false)
    }

    /// Parse a self-delimited packet at the start of `buf`, as found in
    /// multistream packets. `len` tells where the next one starts.
    pub fn parse_self_delimited(buf: &'a [u8]) -> Result<Self> {
        Self::parse(buf, true)
    }

    fn parse(data: &'a [u8], self_delimited: bool) -> Result<Self> {
        let (&toc, mut buf) = data
            .split_first()
            .ok_or(Error::InvalidPacket("empty packet"))?;
        let (mode, bandwidth, frame_duration) = config(toc);
        let framesize = frame_duration as usize;

        let mut sizes = Vec::with_capacity(2);
        let mut padding = 0;
        let mut vbr = false;
        let mut cbr_count = 0;

        let (code, count) = match toc & 0x3 {
            0 => (Code::Single, 1),
            1 => {
                if !self_delimited {
                    if buf.len() & 1 != 0 {
                        return Err(Error::InvalidPacket("odd length for two CBR frames"));
                    }
                    sizes.push(buf.len() / 2);
                }
                cbr_count = 2;
                (Code::DoubleEqual, 2)
            }
            2 => {
                let (off, len) = xiph_lacing_u16(buf)?;
                buf = &buf[off..];
                if len > buf.len() {
                    return Err(Error::InvalidPacket("frame longer than the packet"));
                }
                sizes.push(len);
                vbr = true;
                (Code::DoubleVary, 2)
            }
            _ => {
                let (&ch, rest) = buf
                    .split_first()
                    .ok_or(Error::InvalidPacket("missing frame count"))?;
                buf = rest;
                let count = (ch & 0x3f) as usize;
                if count == 0 || framesize * count > MAX_PACKET_DUR {
                    return Err(Error::InvalidPacket("bad frame count"));
                }

                if ch & 0x40 != 0 {
                    let (off, pad) = xiph_lacing_u32(buf)?;
                    if off + pad > buf.len() {
                        return Err(Error::InvalidPacket("padding longer than the packet"));
                    }
                    padding = pad;
                    buf = &buf[off..buf.len() - pad];
                }

                vbr = ch & 0x80 != 0;
                if vbr {
                    let mut used = 0;
                    for _ in 0..count - 1 {
                        let (off, len) = xiph_lacing_u16(buf)?;
                        buf = &buf[off..];
                        if len > buf.len() {
                            return Err(Error::InvalidPacket("frame longer than the packet"));
                        }
                        used += len;
                        sizes.push(len);
                    }
                    if used > buf.len() {
                        return Err(Error::InvalidPacket("frames longer than the packet"));
                    }
                } else if !self_delimited {
                    let len = buf.len() / count;
                    if len * count != buf.len() {
                        return Err(Error::InvalidPacket("uneven CBR frames"));
                    }
                    sizes.resize(count - 1, len);
                } else {
                    cbr_count = count;
                }
                (Code::Multiple, count)
            }
        };

        if self_delimited {
            let (off, len) = xiph_lacing_u16(buf)?;
            buf = &buf[off..];
            if len > buf.len() {
                return Err(Error::InvalidPacket("frame longer than the packet"));
            }
            if cbr_count > 0 {
                if len * cbr_count > buf.len() {
                    return Err(Error::InvalidPacket("frames longer than the packet"));
                }
                sizes.resize(cbr_count, len);
            } else {
                let used: usize = sizes.iter().sum();
                if used + len > buf.len() {
                    return Err(Error::InvalidPacket("frames longer than the packet"));
                }
                sizes.push(len);
            }
        } else {
            let used: usize = sizes.iter().sum();
            let last = buf.len() - used;
            if last > MAX_FRAME_SIZE {
                return Err(Error::InvalidPacket("frame larger than 1275 bytes"));
            }
            sizes.push(last);
        }

        let payload_offset = data.len() - padding - buf.len();
        let mut frames = Vec::with_capacity(count);
        for len in sizes {
            let (frame, rest) = buf.split_at(len);
            frames.push(frame);
            buf = rest;
        }
        let end = data.len() - padding - buf.len();

        trace!(
            "packet: toc {:#04x}, {} frames, padding {}",
            toc,
            frames.len(),
            padding
        );

        Ok(Packet {
            code,
            vbr,
            toc,
            stereo: (toc >> 2) & 0x01 == 1,
            padding,
            mode,
            bandwidth,
            frame_duration,
            frames,
            payload_offset,
            len: end + padding,
        })
    }

    pub fn samples_per_channel(&self, sample_rate: usize) -> usize {
        self.frame_duration.samples(sample_rate) * self.frames.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use interpolate_name::interpolate_test;

    #[interpolate_test(silk_nb_10ms, 0, 80)]
    #[interpolate_test(silk_wb_60ms, 11, 480)]
    #[interpolate_test(hybrid_swb_10ms, 12, 80)]
    #[interpolate_test(hybrid_fb_20ms, 15, 160)]
    #[interpolate_test(celt_nb_2_5ms, 16, 20)]
    #[interpolate_test(celt_fb_20ms, 31, 160)]
    fn samples_at_8khz(config: u8, samples: usize) {
        assert_eq!(samples_per_frame(config << 3, 8000), samples);
    }

    #[test]
    fn bandwidths() {
        assert_eq!(config(16 << 3), (Mode::CELT, Bandwidth::Narrow, FrameDuration::VeryShort));
        assert_eq!(config(22 << 3), (Mode::CELT, Bandwidth::Wide, FrameDuration::Medium));
        assert_eq!(config(13 << 3), (Mode::HYBRID, Bandwidth::SuperWide, FrameDuration::Standard));
        assert_eq!(config(6 << 3), (Mode::SILK, Bandwidth::Medium, FrameDuration::Long));
    }

    #[test]
    fn size_coding() {
        let mut buf = [0u8; 2];
        for &size in &[0, 1, 251, 252, 253, 1000, 1275] {
            let n = encode_size(size, &mut buf);
            assert_eq!(xiph_lacing_u16(&buf[..n]), Ok((n, size)));
        }
    }

    #[test]
    fn single_frame() {
        let buf = [0xf8, 1, 2, 3];
        let p = Packet::from_slice(&buf).unwrap();
        assert_eq!(p.code, Code::Single);
        assert_eq!(p.mode, Mode::CELT);
        assert_eq!(p.bandwidth, Bandwidth::Full);
        assert_eq!(p.frames, vec![&buf[1..]]);
        assert_eq!(p.len, 4);
    }

    #[test]
    fn two_frames() {
        let buf = [0xf9, 1, 2, 3, 4];
        let p = Packet::from_slice(&buf).unwrap();
        assert_eq!(p.frames, vec![&buf[1..3], &buf[3..5]]);
        assert!(Packet::from_slice(&buf[..4]).is_err());

        let buf = [0xfa, 1, 9, 8, 7];
        let p = Packet::from_slice(&buf).unwrap();
        assert_eq!(p.frames, vec![&buf[2..3], &buf[3..5]]);
        assert!(Packet::from_slice(&[0xfa, 5, 1]).is_err());
    }

    #[test]
    fn multiple_frames() {
        // vbr, padded with 256 bytes
        let mut buf = vec![0xfb, 0xc3, 255, 2, 1, 2, 10, 20, 20, 30, 30, 30];
        buf.resize(buf.len() + 256, 0);
        let p = Packet::from_slice(&buf).unwrap();
        assert_eq!(p.padding, 256);
        assert!(p.vbr);
        assert_eq!(p.payload_offset, 6);
        assert_eq!(p.frames, vec![&[10u8][..], &[20, 20][..], &[30, 30, 30][..]]);
        assert_eq!(p.samples_per_channel(48000), 3 * 960);

        // cbr
        let buf = [0xfb, 0x03, 1, 1, 2, 2, 3, 3];
        let p = Packet::from_slice(&buf).unwrap();
        assert!(!p.vbr);
        assert_eq!(p.frames.len(), 3);
        assert_eq!(p.frames[2], &[3u8, 3][..]);
        assert_eq!(nb_frames(&buf), Ok(3));
    }

    #[test]
    fn bad_frame_count() {
        assert!(Packet::from_slice(&[0xfb, 0x00]).is_err());
        // 7 frames of 20ms are more than 120ms
        assert!(Packet::from_slice(&[0xfb, 0x07, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(Packet::from_slice(&[0xfb]).is_err());
        assert!(Packet::from_slice(&[]).is_err());
        assert!(nb_frames(&[0xfb]).is_err());
    }

    #[test]
    fn self_delimited() {
        // code 0 with an explicit length, followed by another packet
        let buf = [0xf8, 2, 5, 6, 0xf8, 7];
        let p = Packet::parse_self_delimited(&buf).unwrap();
        assert_eq!(p.frames, vec![&buf[2..4]]);
        assert_eq!(p.len, 4);

        // cbr code 1, the size is given once
        let buf = [0xf9, 1, 5, 6, 0xff];
        let p = Packet::parse_self_delimited(&buf).unwrap();
        assert_eq!(p.frames, vec![&buf[2..3], &buf[3..4]]);
        assert_eq!(p.len, 4);

        assert!(Packet::parse_self_delimited(&[0xf8, 3, 1]).is_err());
    }
}
