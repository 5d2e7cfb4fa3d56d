use crate::maths::*;

/// Opus Range Decoder
///
/// See [rfc6716 section 4.1](https://tools.ietf.org/html/rfc6716#section-4.1)
///
/// Range coded symbols are read from the front of the buffer, raw bits
/// from the back. Running out of input never fails: missing bytes read as
/// zero and the first inconsistency raises a sticky error flag.
#[derive(Debug)]
pub struct RangeDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
    end_offset: usize,
    end_window: u32,
    end_bits: usize,
    rem: u32,
    range: u32,
    value: u32,
    scale: u32,
    total: usize,
    error: bool,

    size_in_bits: usize,
}

/// Inverse cumulative distribution, `dist` decreasing down to 0 with a
/// total of `1 << ftb`.
#[derive(Debug)]
pub struct ICDFContext {
    pub ftb: usize,
    pub dist: &'static [u8],
}

pub const BITRES: usize = 3;

const SYM_BITS: usize = 8;
const SYM_MAX: u32 = (1 << SYM_BITS) - 1;

const CODE_BITS: usize = 32;
const CODE_TOP: u32 = 1 << (CODE_BITS - 1);
const CODE_BOT: u32 = CODE_TOP >> SYM_BITS;
const CODE_EXTRA: usize = (CODE_BITS - 2) % SYM_BITS + 1;

const UNI_BITS: usize = 8;
const WINDOW_SIZE: usize = 32;

impl<'a> RangeDecoder<'a> {
    fn read_byte(&mut self) -> u32 {
        if self.offset < self.buf.len() {
            let b = self.buf[self.offset];
            self.offset += 1;
            b as u32
        } else {
            0
        }
    }

    fn read_byte_from_end(&mut self) -> u32 {
        if self.end_offset < self.buf.len() {
            self.end_offset += 1;
            self.buf[self.buf.len() - self.end_offset] as u32
        } else {
            0
        }
    }

    fn normalize(&mut self) {
        while self.range <= CODE_BOT {
            self.total += SYM_BITS;
            self.range <<= SYM_BITS;
            let sym = self.rem;
            self.rem = self.read_byte();
            let sym = (sym << SYM_BITS | self.rem) >> (SYM_BITS - CODE_EXTRA);
            self.value = ((self.value << SYM_BITS) + (SYM_MAX & !sym)) & (CODE_TOP - 1);
        }
    }

    pub fn new(buf: &'a [u8]) -> Self {
        let mut r = RangeDecoder {
            buf,
            offset: 0,
            end_offset: 0,
            end_window: 0,
            end_bits: 0,
            rem: 0,
            range: 1 << CODE_EXTRA,
            value: 0,
            scale: 0,
            total: CODE_BITS + 1 - ((CODE_BITS - CODE_EXTRA) / SYM_BITS) * SYM_BITS,
            error: false,
            size_in_bits: buf.len() * 8,
        };

        r.rem = r.read_byte();
        r.value = r.range - 1 - (r.rem >> (SYM_BITS - CODE_EXTRA));
        r.normalize();

        r
    }

    pub fn decode(&mut self, total: u32) -> u32 {
        self.scale = self.range / total;
        let s = self.value / self.scale;

        total - (s + 1).min(total)
    }

    pub fn update(&mut self, low: u32, high: u32, total: u32) {
        let s = self.scale * (total - high);
        self.value -= s;
        self.range = if low > 0 {
            self.scale * (high - low)
        } else {
            self.range - s
        };

        self.normalize();
    }

    pub fn decode_logp(&mut self, logp: usize) -> bool {
        let scale = self.range >> logp;

        let k = if self.value < scale {
            self.range = scale;
            true
        } else {
            self.value -= scale;
            self.range -= scale;
            false
        };

        self.normalize();

        k
    }

    pub fn decode_icdf(&mut self, icdf: &ICDFContext) -> usize {
        let r = self.range >> icdf.ftb;
        let mut high = self.range;
        let mut k = 0;
        let mut low = r * icdf.dist[0] as u32;

        while self.value < low {
            k += 1;
            high = low;
            low = r * icdf.dist[k] as u32;
        }

        self.value -= low;
        self.range = high - low;
        self.normalize();

        k
    }

    #[inline(always)]
    pub fn tell(&self) -> usize {
        self.total - self.range.ec_ilog() as usize
    }

    /// Bits consumed so far in 1/8 bit units, rounded up.
    #[inline(always)]
    pub fn tell_frac(&self) -> usize {
        let mut lg = self.range.ec_ilog();
        let mut r = self.range >> (lg - 16);

        for _ in 0..BITRES {
            r = (r * r) >> 15;
            let lastbit = r >> 16;
            lg = lg << 1 | lastbit;
            r >>= lastbit;
        }

        (self.total << BITRES) - lg as usize
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.size_in_bits.saturating_sub(self.tell())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn error(&self) -> bool {
        self.error
    }

    /// Final range, used by callers to verify the decoding integrity.
    pub fn range(&self) -> u32 {
        self.range
    }
}

pub trait CeltOnly {
    fn rawbits(&mut self, len: usize) -> u32;
    fn decode_uniform(&mut self, len: u32) -> u32;
    fn decode_laplace(&mut self, symbol: u32, decay: u32) -> i32;
    fn to_end(&mut self);
}

const LAPLACE_MINP: u32 = 1;
const LAPLACE_NMIN: u32 = 16;

impl<'a> CeltOnly for RangeDecoder<'a> {
    fn rawbits(&mut self, len: usize) -> u32 {
        let mut window = self.end_window;
        let mut available = self.end_bits;

        if available < len {
            loop {
                window |= self.read_byte_from_end() << available;
                available += SYM_BITS;
                if available > WINDOW_SIZE - SYM_BITS {
                    break;
                }
            }
        }

        let v = if len == 32 {
            window
        } else {
            let v = window & ((1 << len) - 1);
            window >>= len;
            v
        };

        self.end_window = window;
        self.end_bits = available - len;
        self.total += len;

        v
    }

    fn decode_uniform(&mut self, len: u32) -> u32 {
        let ft = len - 1;
        let bits = ft.ec_ilog() as usize;

        if bits > UNI_BITS {
            let shift = bits - UNI_BITS;
            let total = (ft >> shift) + 1;
            let k = self.decode(total);
            self.update(k, k + 1, total);

            let v = k << shift | self.rawbits(shift);
            if v <= ft {
                v
            } else {
                self.error = true;
                ft
            }
        } else {
            let k = self.decode(len);
            self.update(k, k + 1, len);
            k
        }
    }

    fn decode_laplace(&mut self, mut symbol: u32, decay: u32) -> i32 {
        self.scale = self.range >> 15;
        let center = self.value / self.scale + 1;
        let center = (1 << 15) - center.min(1 << 15);

        let mut value = 0i32;
        let mut low = 0;

        if center >= symbol {
            value += 1;
            low = symbol;
            symbol = laplace_freq1(symbol, decay) + LAPLACE_MINP;

            while symbol > LAPLACE_MINP && center >= low + 2 * symbol {
                symbol *= 2;
                low += symbol;
                symbol = (((symbol - 2 * LAPLACE_MINP) * decay) >> 15) + LAPLACE_MINP;
                value += 1;
            }

            if symbol <= LAPLACE_MINP {
                let dist = (center - low) >> 1;
                value += dist as i32;
                low += 2 * dist * LAPLACE_MINP;
            }

            if center < low + symbol {
                value = -value;
            } else {
                low += symbol;
            }
        }

        self.update(low, 32768.min(low + symbol), 32768);

        value
    }

    fn to_end(&mut self) {
        self.total += self.size_in_bits.saturating_sub(self.tell());
    }
}

fn laplace_freq1(fs0: u32, decay: u32) -> u32 {
    let ft = 32768 - LAPLACE_MINP * (2 * LAPLACE_NMIN) - fs0;

    (ft * (16384 - decay)) >> 15
}

/// Range encoder mirroring the decoder, used to produce test bitstreams.
#[cfg(test)]
pub mod test_encoder {
    use super::*;

    const CODE_SHIFT: usize = CODE_BITS - SYM_BITS - 1;

    pub struct RangeEncoder {
        buf: Vec<u8>,
        offset: usize,
        end_offset: usize,
        end_window: u32,
        end_bits: usize,
        rem: i32,
        ext: usize,
        range: u32,
        value: u32,
        total: usize,
        error: bool,
    }

    impl RangeEncoder {
        pub fn new(size: usize) -> Self {
            RangeEncoder {
                buf: vec![0; size],
                offset: 0,
                end_offset: 0,
                end_window: 0,
                end_bits: 0,
                rem: -1,
                ext: 0,
                range: CODE_TOP,
                value: 0,
                total: CODE_BITS + 1,
                error: false,
            }
        }

        fn write_byte(&mut self, v: u32) {
            if self.offset + self.end_offset >= self.buf.len() {
                self.error = true;
            } else {
                self.buf[self.offset] = v as u8;
                self.offset += 1;
            }
        }

        fn write_byte_at_end(&mut self, v: u32) {
            if self.offset + self.end_offset >= self.buf.len() {
                self.error = true;
            } else {
                self.end_offset += 1;
                let len = self.buf.len();
                self.buf[len - self.end_offset] = v as u8;
            }
        }

        fn carry_out(&mut self, c: u32) {
            if c != SYM_MAX {
                let carry = c >> SYM_BITS;
                if self.rem >= 0 {
                    self.write_byte(self.rem as u32 + carry);
                }
                while self.ext > 0 {
                    self.write_byte((SYM_MAX + carry) & SYM_MAX);
                    self.ext -= 1;
                }
                self.rem = (c & SYM_MAX) as i32;
            } else {
                self.ext += 1;
            }
        }

        fn normalize(&mut self) {
            while self.range <= CODE_BOT {
                self.carry_out(self.value >> CODE_SHIFT);
                self.value = (self.value << SYM_BITS) & (CODE_TOP - 1);
                self.range <<= SYM_BITS;
                self.total += SYM_BITS;
            }
        }

        pub fn encode(&mut self, low: u32, high: u32, total: u32) {
            let r = self.range / total;
            if low > 0 {
                self.value += self.range - r * (total - low);
                self.range = r * (high - low);
            } else {
                self.range -= r * (total - high);
            }
            self.normalize();
        }

        fn encode_bin(&mut self, low: u32, high: u32, bits: usize) {
            let r = self.range >> bits;
            if low > 0 {
                self.value += self.range - r * ((1 << bits) - low);
                self.range = r * (high - low);
            } else {
                self.range -= r * ((1 << bits) - high);
            }
            self.normalize();
        }

        pub fn encode_logp(&mut self, val: bool, logp: usize) {
            let s = self.range >> logp;
            let r = self.range - s;
            if val {
                self.value += r;
                self.range = s;
            } else {
                self.range = r;
            }
            self.normalize();
        }

        pub fn encode_icdf(&mut self, s: usize, icdf: &ICDFContext) {
            let r = self.range >> icdf.ftb;
            if s > 0 {
                self.value += self.range - r * icdf.dist[s - 1] as u32;
                self.range = r * (icdf.dist[s - 1] - icdf.dist[s]) as u32;
            } else {
                self.range -= r * icdf.dist[s] as u32;
            }
            self.normalize();
        }

        pub fn encode_uniform(&mut self, v: u32, len: u32) {
            let ft = len - 1;
            let bits = ft.ec_ilog() as usize;
            if bits > UNI_BITS {
                let shift = bits - UNI_BITS;
                let total = (ft >> shift) + 1;
                let low = v >> shift;
                self.encode(low, low + 1, total);
                self.rawbits(v & ((1 << shift) - 1), shift);
            } else {
                self.encode(v, v + 1, len);
            }
        }

        pub fn rawbits(&mut self, v: u32, bits: usize) {
            let mut window = self.end_window;
            let mut used = self.end_bits;
            if used + bits > WINDOW_SIZE {
                while used >= SYM_BITS {
                    self.write_byte_at_end(window & SYM_MAX);
                    window >>= SYM_BITS;
                    used -= SYM_BITS;
                }
            }
            window |= v << used;
            used += bits;
            self.end_window = window;
            self.end_bits = used;
            self.total += bits;
        }

        pub fn encode_laplace(&mut self, value: i32, mut fs: u32, decay: u32) {
            let mut low = 0;
            if value != 0 {
                let val = value.unsigned_abs();
                low = fs;
                fs = laplace_freq1(fs, decay);
                let mut i = 1;
                while fs > 0 && i < val {
                    fs *= 2;
                    low += fs + 2 * LAPLACE_MINP;
                    fs = (fs * decay) >> 15;
                    i += 1;
                }
                debug_assert!(fs > 0, "value outside of the test encoder range");
                fs += LAPLACE_MINP;
                if value > 0 {
                    low += fs;
                }
            }
            self.encode_bin(low, low + fs, 15);
        }

        pub fn tell(&self) -> usize {
            self.total - self.range.ec_ilog() as usize
        }

        pub fn range(&self) -> u32 {
            self.range
        }

        pub fn done(mut self) -> Vec<u8> {
            let mut l = CODE_BITS as i32 - self.range.ec_ilog() as i32;
            let mut mask = (CODE_TOP - 1) >> l;
            let mut end = self.value.wrapping_add(mask) & !mask;
            if (end | mask) >= self.value.wrapping_add(self.range) {
                l += 1;
                mask >>= 1;
                end = self.value.wrapping_add(mask) & !mask;
            }
            while l > 0 {
                self.carry_out(end >> CODE_SHIFT);
                end = (end << SYM_BITS) & (CODE_TOP - 1);
                l -= SYM_BITS as i32;
            }
            if self.rem >= 0 || self.ext > 0 {
                self.carry_out(0);
            }

            let mut window = self.end_window;
            let mut used = self.end_bits;
            while used >= SYM_BITS {
                self.write_byte_at_end(window & SYM_MAX);
                window >>= SYM_BITS;
                used -= SYM_BITS;
            }

            assert!(!self.error, "test encoder buffer overflow");
            let len = self.buf.len();
            for b in self.buf[self.offset..len - self.end_offset].iter_mut() {
                *b = 0;
            }
            if used > 0 {
                assert!(self.offset + self.end_offset < len || (-l) as usize >= used);
                self.buf[len - self.end_offset - 1] |= window as u8;
            }

            self.buf
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_encoder::RangeEncoder;
    use super::*;

    const TAPSET: &ICDFContext = &ICDFContext {
        ftb: 2,
        dist: &[2, 1, 0],
    };

    #[test]
    fn empty_buffer() {
        let mut rd = RangeDecoder::new(&[]);

        assert_eq!(rd.tell(), 1);
        assert!(!rd.decode_logp(15));
        assert_eq!(rd.rawbits(8), 0);
        assert!(!rd.error());
    }

    #[test]
    fn silence_bit_on_ones() {
        let buf = [0xffu8; 8];
        let mut rd = RangeDecoder::new(&buf);

        assert!(rd.decode_logp(15));
        rd.to_end();
        assert_eq!(rd.tell(), 64);
        assert_eq!(rd.available(), 0);
    }

    #[test]
    fn symbols() {
        let mut enc = RangeEncoder::new(64);

        enc.encode_logp(true, 15);
        enc.encode_logp(false, 1);
        enc.encode_icdf(2, TAPSET);
        enc.encode_uniform(5, 6);
        enc.encode_uniform(1000, 1201);
        enc.rawbits(0x2d, 6);
        enc.encode_laplace(-3, 72 << 7, 127 << 6);
        enc.encode_laplace(0, 72 << 7, 127 << 6);
        enc.encode_laplace(4, 72 << 7, 127 << 6);
        enc.rawbits(1, 1);
        let bits = enc.tell();
        let rng = enc.range();
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);

        assert_eq!(rd.decode_logp(15), true);
        assert_eq!(rd.decode_logp(1), false);
        assert_eq!(rd.decode_icdf(TAPSET), 2);
        assert_eq!(rd.decode_uniform(6), 5);
        assert_eq!(rd.decode_uniform(1201), 1000);
        assert_eq!(rd.rawbits(6), 0x2d);
        assert_eq!(rd.decode_laplace(72 << 7, 127 << 6), -3);
        assert_eq!(rd.decode_laplace(72 << 7, 127 << 6), 0);
        assert_eq!(rd.decode_laplace(72 << 7, 127 << 6), 4);
        assert_eq!(rd.rawbits(1), 1);
        assert_eq!(rd.tell(), bits);
        assert_eq!(rd.range(), rng);
        assert!(!rd.error());
    }

    #[test]
    fn tell_frac_bounds_tell() {
        let mut enc = RangeEncoder::new(32);
        for i in 0..40 {
            enc.encode_logp(i % 3 == 0, 2);
        }
        let buf = enc.done();

        let mut rd = RangeDecoder::new(&buf);
        for i in 0..40 {
            assert_eq!(rd.decode_logp(2), i % 3 == 0);
            let frac = rd.tell_frac();
            assert!(frac <= rd.tell() * 8);
            assert!(frac > (rd.tell() - 1) * 8);
        }
    }
}
