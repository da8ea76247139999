//! Wire codec for bottle records and dot-terminated blocks.

mod bottle;
mod dot;

pub use bottle::{
    BodyWriter, BottleInfo, DATA_MARKER, FLAG_8BITMIME, FROM_PREFIX, RCPT_TO_PREFIX, encode,
    read_info, write_info,
};
pub use dot::{DotReader, DotWriter};
