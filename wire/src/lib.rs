//! The CMB protocol wire codec (§4.1): seven packet kinds, big-endian,
//! byte-packed, no padding.

mod int;
mod packet;

pub use int::{read_u24, read_u48, timestamp_diff, write_u24, write_u48, TIMESTAMP_MODULUS};
pub use packet::{AckBlock, Data, Error, ErrorCode, Feedback, NackBlock, Packet, RequestResource, ShrinkRange, DATA_HEADER_LEN};
