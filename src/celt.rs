//!
//! Celt Decoding
//!
//! See [section-4.3](https://tools.ietf.org/html/rfc6716#section-4.3)
//!
//! Fixed point, bit-exact with the reference decoder.
//!

mod bands;
mod bitexact;
mod cwrs;
mod decoder;
mod fft;
mod lpc;
mod mdct;
mod mode;
mod pitch;
mod postfilter;
mod quant_bands;
mod rate;
mod vq;

pub use self::decoder::{CeltDecoder, DECODE_BUFFER_SIZE, MAX_PACKET_SIZE};
pub use self::mode::{Mode, MAX_BANDS, SHORT_MDCT_SIZE};
