//! Opus Repacketizer
//!
//! Merges the frames of packets sharing a configuration into one packet,
//! splits them back, and adds or strips padding. The frames themselves are
//! copied untouched.

use crate::error::*;
use crate::packet::*;

/// 120ms at 8kHz
const MAX_DURATION_8K: usize = 960;

/// Collects the frames of compatible packets, borrowing them.
#[derive(Debug, Default, Clone)]
pub struct Repacketizer<'a> {
    toc: u8,
    frames: Vec<&'a [u8]>,
    framesize: usize,
}

impl<'a> Repacketizer<'a> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Drop the pending frames.
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn nb_frames(&self) -> usize {
        self.frames.len()
    }

    /// Add the frames of `data`.
    ///
    /// The packet must have the same top 6 TOC bits of the ones already
    /// added and the total may not exceed 120ms, otherwise nothing is added.
    pub fn cat(&mut self, data: &'a [u8]) -> Result<()> {
        self.cat_impl(data, false)
    }

    fn cat_impl(&mut self, data: &'a [u8], self_delimited: bool) -> Result<()> {
        let toc = *data.first().ok_or(Error::InvalidPacket("empty packet"))?;

        let framesize = if self.frames.is_empty() {
            samples_per_frame(toc, 8000)
        } else if self.toc & 0xfc != toc & 0xfc {
            return Err(Error::InvalidPacket("configuration mismatch"));
        } else {
            self.framesize
        };

        let count = nb_frames(data)?;
        if count < 1 {
            return Err(Error::InvalidPacket("no frames"));
        }
        if (count + self.frames.len()) * framesize > MAX_DURATION_8K {
            return Err(Error::InvalidPacket("more than 120ms"));
        }

        let packet = if self_delimited {
            Packet::parse_self_delimited(data)?
        } else {
            Packet::from_slice(data)?
        };

        if self.frames.is_empty() {
            self.toc = toc;
            self.framesize = framesize;
        }
        self.frames.extend(packet.frames);

        trace!("repacketizer: {} frames pending", self.frames.len());

        Ok(())
    }

    /// Write the frames in `begin..end` as a single packet in `out`,
    /// returns its length.
    pub fn out_range(&self, begin: usize, end: usize, out: &mut [u8]) -> Result<usize> {
        self.out_range_impl(begin, end, out, false, false)
    }

    /// Write all the frames as a single packet.
    pub fn out(&self, out: &mut [u8]) -> Result<usize> {
        self.out_range_impl(0, self.frames.len(), out, false, false)
    }

    /// With `pad` the packet takes the whole of `out`.
    fn out_range_impl(
        &self,
        begin: usize,
        end: usize,
        out: &mut [u8],
        self_delimited: bool,
        pad: bool,
    ) -> Result<usize> {
        if begin >= end || end > self.frames.len() {
            return Err(Error::InvalidArgument("bad frame range"));
        }
        let frames = &self.frames[begin..end];
        let count = frames.len();
        let maxlen = out.len();
        let last = frames[count - 1].len();
        let size_len = |len: usize| if len >= 252 { 2 } else { 1 };
        let too_small = |needed: usize| Error::BufferTooSmall {
            needed,
            available: maxlen,
        };

        let sd_size = if self_delimited { size_len(last) } else { 0 };
        let toc = self.toc & 0xfc;
        let mut tot_size = sd_size;
        let mut ptr = 0;

        if count == 1 {
            tot_size += frames[0].len() + 1;
            if tot_size > maxlen {
                return Err(too_small(tot_size));
            }
            out[0] = toc;
            ptr = 1;
        } else if count == 2 {
            if frames[0].len() == frames[1].len() {
                tot_size += 2 * frames[0].len() + 1;
                if tot_size > maxlen {
                    return Err(too_small(tot_size));
                }
                out[0] = toc | 0x1;
                ptr = 1;
            } else {
                tot_size += frames[0].len() + frames[1].len() + 1 + size_len(frames[0].len());
                if tot_size > maxlen {
                    return Err(too_small(tot_size));
                }
                out[0] = toc | 0x2;
                ptr = 1 + encode_size(frames[0].len(), &mut out[1..]);
            }
        }

        if count > 2 || (pad && tot_size < maxlen) {
            // restart as code 3
            let vbr = frames.iter().any(|f| f.len() != frames[0].len());
            tot_size = sd_size + 2;
            if vbr {
                tot_size += frames[..count - 1]
                    .iter()
                    .map(|f| size_len(f.len()) + f.len())
                    .sum::<usize>();
                tot_size += last;
            } else {
                tot_size += count * frames[0].len();
            }
            if tot_size > maxlen {
                return Err(too_small(tot_size));
            }

            out[0] = toc | 0x3;
            out[1] = count as u8 | if vbr { 0x80 } else { 0 };
            ptr = 2;

            let pad_amount = if pad { maxlen - tot_size } else { 0 };
            if pad_amount != 0 {
                out[1] |= 0x40;
                let nb_255s = (pad_amount - 1) / 255;
                for b in out[ptr..ptr + nb_255s].iter_mut() {
                    *b = 255;
                }
                ptr += nb_255s;
                out[ptr] = (pad_amount - 255 * nb_255s - 1) as u8;
                ptr += 1;
                tot_size += pad_amount;
            }

            if vbr {
                for f in &frames[..count - 1] {
                    ptr += encode_size(f.len(), &mut out[ptr..]);
                }
            }
        }

        if self_delimited {
            ptr += encode_size(last, &mut out[ptr..]);
        }

        for f in frames {
            out[ptr..ptr + f.len()].copy_from_slice(f);
            ptr += f.len();
        }

        if pad {
            for b in out[ptr..].iter_mut() {
                *b = 0;
            }
        }

        Ok(tot_size)
    }
}

/// Pad the packet in `data[..len]` to `new_len` bytes, in place.
pub fn pad_packet(data: &mut [u8], len: usize, new_len: usize) -> Result<()> {
    if len < 1 {
        return Err(Error::InvalidArgument("empty packet"));
    }
    if len == new_len {
        return Ok(());
    } else if len > new_len {
        return Err(Error::InvalidArgument("cannot shrink a packet"));
    }
    if data.len() < new_len {
        return Err(Error::BufferTooSmall {
            needed: new_len,
            available: data.len(),
        });
    }

    let copy = data[..len].to_vec();
    let mut rp = Repacketizer::new();
    rp.cat(&copy)?;
    rp.out_range_impl(0, rp.nb_frames(), &mut data[..new_len], false, true)?;

    Ok(())
}

/// Strip the padding of the packet in `data[..len]` and use the smallest
/// framing, returns the new length.
pub fn unpad_packet(data: &mut [u8], len: usize) -> Result<usize> {
    if len < 1 {
        return Err(Error::InvalidArgument("empty packet"));
    }

    let copy = data[..len].to_vec();
    let mut rp = Repacketizer::new();
    rp.cat(&copy)?;
    let ret = rp.out_range_impl(0, rp.nb_frames(), &mut data[..len], false, false)?;
    debug_assert!(ret > 0 && ret <= len);

    Ok(ret)
}

/// Pad a multistream packet to `new_len` bytes, the padding goes to the
/// last stream.
pub fn pad_multistream_packet(
    data: &mut [u8],
    len: usize,
    new_len: usize,
    nb_streams: usize,
) -> Result<()> {
    if len < 1 {
        return Err(Error::InvalidArgument("empty packet"));
    }
    if len == new_len {
        return Ok(());
    } else if len > new_len {
        return Err(Error::InvalidArgument("cannot shrink a packet"));
    }
    let amount = new_len - len;

    let mut offset = 0;
    let mut len = len;
    for _ in 0..nb_streams.saturating_sub(1) {
        if len == 0 {
            return Err(Error::InvalidPacket("missing stream"));
        }
        let packet = Packet::parse_self_delimited(&data[offset..offset + len])?;
        offset += packet.len;
        len -= packet.len;
    }

    pad_packet(&mut data[offset..], len, len + amount)
}

/// Strip the padding of every stream of a multistream packet, returns the
/// new length.
///
/// Every stream but the last is self-delimited. On error the streams
/// before the failing one are already rewritten.
pub fn unpad_multistream_packet(data: &mut [u8], len: usize, nb_streams: usize) -> Result<usize> {
    if len < 1 {
        return Err(Error::InvalidArgument("empty packet"));
    }

    let mut src = 0;
    let mut dst = 0;
    let mut len = len;
    for s in 0..nb_streams {
        let self_delimited = s != nb_streams - 1;
        if len == 0 {
            return Err(Error::InvalidPacket("missing stream"));
        }

        let copy = data[src..src + len].to_vec();
        let packet = if self_delimited {
            Packet::parse_self_delimited(&copy)?
        } else {
            Packet::from_slice(&copy)?
        };
        let packet_len = packet.len;

        let mut rp = Repacketizer::new();
        rp.cat_impl(&copy[..packet_len], self_delimited)?;
        let ret = rp.out_range_impl(0, rp.nb_frames(), &mut data[dst..dst + len], self_delimited, false)?;

        dst += ret;
        src += packet_len;
        len -= packet_len;
    }

    Ok(dst)
}
