#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[cfg(test)]
extern crate interpolate_name;

extern crate num_complex as complex;

#[macro_use]
extern crate log;

extern crate integer_sqrt;

mod entropy;
mod maths;

pub mod celt;
pub mod decoder;
pub mod error;
pub mod packet;
pub mod repacketizer;

pub use crate::celt::{CeltDecoder, Mode};
pub use crate::decoder::{Decoder, DecoderConfig};
pub use crate::error::{Error, Result};
pub use crate::repacketizer::{
    pad_multistream_packet, pad_packet, unpad_multistream_packet, unpad_packet, Repacketizer,
};
