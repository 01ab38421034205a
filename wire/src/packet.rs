use log::warn;
use utils::error::Result;

use crate::int::{read_u24, read_u48, write_u24, write_u48};

const MAGIC_REQUEST_RESOURCE: u16 = 0xcb00;
const MAGIC_DATA: u16 = 0xcb01;
const MAGIC_ACK_BLOCK: u16 = 0xcb02;
const MAGIC_NACK_BLOCK: u16 = 0xcb03;
const MAGIC_SHRINK_RANGE: u16 = 0xcb04;
const MAGIC_ERROR: u16 = 0xcb05;
const MAGIC_FEEDBACK: u16 = 0xcb06;

const REQUEST_RESOURCE_LEN: usize = 46;
/// Bytes of Data framing before the symbol payload begins; exposed so
/// callers can size their MTU budget (§4.1, §6).
pub const DATA_HEADER_LEN: usize = 16;
const ACK_BLOCK_LEN: usize = 8;
const NACK_BLOCK_LEN: usize = 12;
const SHRINK_RANGE_LEN: usize = 14;
const ERROR_LEN: usize = 4;
const FEEDBACK_LEN: usize = 15;

const FLAG_REVERSE: u8 = 1 << 0;

/// Reasons a sender or receiver reports over an Error packet (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
	UnknownResource,
	MalformedFrame,
	ProtocolViolation,
	InactivityTimeout,
}

impl ErrorCode {
	fn from_u16(code: u16) -> Option<Self> {
		Some(match code {
			1 => Self::UnknownResource,
			2 => Self::MalformedFrame,
			3 => Self::ProtocolViolation,
			4 => Self::InactivityTimeout,
			_ => return None,
		})
	}

	fn to_u16(self) -> u16 {
		match self {
			Self::UnknownResource => 1,
			Self::MalformedFrame => 2,
			Self::ProtocolViolation => 3,
			Self::InactivityTimeout => 4,
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestResource {
	pub reverse: bool,
	pub timestamp: u32,
	pub sending_rate_bps: u32,
	pub block_range_start: u64,
	pub block_range_end: u64,
	pub resource_hash: u128,
	pub resource_length: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Data {
	pub block_id: u64,
	pub timestamp: u32,
	pub delay: u16,
	pub sequence_number: u32,
	pub symbol: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AckBlock {
	pub block_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NackBlock {
	pub block_id: u64,
	pub received_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShrinkRange {
	pub range_start: u64,
	pub range_end: u64,
}

impl ShrinkRange {
	/// An Opposite-Range-ACK is the degenerate, empty-range case of Shrink Range (§4.6).
	pub fn opposite_range_ack(boundary: u64) -> Self {
		Self { range_start: boundary, range_end: boundary }
	}

	pub fn is_opposite_range_ack(&self) -> bool {
		self.range_end == self.range_start
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Error {
	pub code: ErrorCode,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feedback {
	pub timestamp: u32,
	pub delay: u16,
	pub receive_rate_pps: u32,
	pub loss_event_rate: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
	RequestResource(RequestResource),
	Data(Data),
	AckBlock(AckBlock),
	NackBlock(NackBlock),
	ShrinkRange(ShrinkRange),
	Error(Error),
	Feedback(Feedback),
}

impl Packet {
	pub fn encode(&self) -> Vec<u8> {
		match self {
			Packet::RequestResource(p) => {
				let mut buf = Vec::with_capacity(REQUEST_RESOURCE_LEN);
				buf.extend_from_slice(&MAGIC_REQUEST_RESOURCE.to_be_bytes());
				buf.push(if p.reverse { FLAG_REVERSE } else { 0 });
				buf.extend_from_slice(&write_u24(p.timestamp));
				buf.extend_from_slice(&p.sending_rate_bps.to_be_bytes());
				buf.extend_from_slice(&write_u48(p.block_range_start));
				buf.extend_from_slice(&write_u48(p.block_range_end));
				buf.extend_from_slice(&p.resource_hash.to_be_bytes());
				buf.extend_from_slice(&p.resource_length.to_be_bytes());
				buf
			}
			Packet::Data(p) => {
				let mut buf = Vec::with_capacity(DATA_HEADER_LEN + p.symbol.len());
				buf.extend_from_slice(&MAGIC_DATA.to_be_bytes());
				buf.extend_from_slice(&write_u48(p.block_id));
				buf.extend_from_slice(&write_u24(p.timestamp));
				buf.extend_from_slice(&p.delay.to_be_bytes());
				buf.extend_from_slice(&write_u24(p.sequence_number));
				buf.extend_from_slice(&p.symbol);
				buf
			}
			Packet::AckBlock(p) => {
				let mut buf = Vec::with_capacity(ACK_BLOCK_LEN);
				buf.extend_from_slice(&MAGIC_ACK_BLOCK.to_be_bytes());
				buf.extend_from_slice(&write_u48(p.block_id));
				buf
			}
			Packet::NackBlock(p) => {
				let mut buf = Vec::with_capacity(NACK_BLOCK_LEN);
				buf.extend_from_slice(&MAGIC_NACK_BLOCK.to_be_bytes());
				buf.extend_from_slice(&write_u48(p.block_id));
				buf.extend_from_slice(&p.received_count.to_be_bytes());
				buf
			}
			Packet::ShrinkRange(p) => {
				let mut buf = Vec::with_capacity(SHRINK_RANGE_LEN);
				buf.extend_from_slice(&MAGIC_SHRINK_RANGE.to_be_bytes());
				buf.extend_from_slice(&write_u48(p.range_start));
				buf.extend_from_slice(&write_u48(p.range_end));
				buf
			}
			Packet::Error(p) => {
				let mut buf = Vec::with_capacity(ERROR_LEN);
				buf.extend_from_slice(&MAGIC_ERROR.to_be_bytes());
				buf.extend_from_slice(&p.code.to_u16().to_be_bytes());
				buf
			}
			Packet::Feedback(p) => {
				let mut buf = Vec::with_capacity(FEEDBACK_LEN);
				buf.extend_from_slice(&MAGIC_FEEDBACK.to_be_bytes());
				buf.extend_from_slice(&write_u24(p.timestamp));
				buf.extend_from_slice(&p.delay.to_be_bytes());
				buf.extend_from_slice(&p.receive_rate_pps.to_be_bytes());
				buf.extend_from_slice(&p.loss_event_rate.to_be_bytes());
				buf
			}
		}
	}

	/// Parse a datagram. Any inconsistency (unknown magic, short frame,
	/// malformed range) is reported via `log::warn!` and dropped silently,
	/// per §7: "Malformed frame — dropped silently; counter incremented."
	pub fn decode(buf: &[u8]) -> Result<Packet> {
		if buf.len() < 2 {
			warn!("Dropping datagram shorter than a magic: {} bytes", buf.len());
			return Err(());
		}

		let magic = u16::from_be_bytes([buf[0], buf[1]]);

		match magic {
			MAGIC_REQUEST_RESOURCE => decode_request_resource(buf),
			MAGIC_DATA => decode_data(buf),
			MAGIC_ACK_BLOCK => decode_ack_block(buf),
			MAGIC_NACK_BLOCK => decode_nack_block(buf),
			MAGIC_SHRINK_RANGE => decode_shrink_range(buf),
			MAGIC_ERROR => decode_error(buf),
			MAGIC_FEEDBACK => decode_feedback(buf),
			_ => {
				warn!("Dropping datagram with unknown magic {magic:#06x}");
				Err(())
			}
		}
	}
}

fn too_short(kind: &str, want: usize, got: usize) -> Result<Packet> {
	warn!("Dropping malformed {kind}: expected at least {want} bytes, got {got}");
	Err(())
}

fn decode_request_resource(buf: &[u8]) -> Result<Packet> {
	if buf.len() != REQUEST_RESOURCE_LEN {
		return too_short("Request Resource", REQUEST_RESOURCE_LEN, buf.len());
	}

	let block_range_start = read_u48(buf[10..16].try_into().unwrap());
	let block_range_end = read_u48(buf[16..22].try_into().unwrap());

	if block_range_start > block_range_end {
		warn!("Dropping Request Resource with inverted range [{block_range_start}, {block_range_end})");
		return Err(());
	}

	Ok(Packet::RequestResource(RequestResource {
		reverse: buf[2] & FLAG_REVERSE != 0,
		timestamp: read_u24(buf[3..6].try_into().unwrap()),
		sending_rate_bps: u32::from_be_bytes(buf[6..10].try_into().unwrap()),
		block_range_start,
		block_range_end,
		resource_hash: u128::from_be_bytes(buf[22..38].try_into().unwrap()),
		resource_length: u64::from_be_bytes(buf[38..46].try_into().unwrap()),
	}))
}

fn decode_data(buf: &[u8]) -> Result<Packet> {
	if buf.len() < DATA_HEADER_LEN {
		return too_short("Data", DATA_HEADER_LEN, buf.len());
	}

	Ok(Packet::Data(Data {
		block_id: read_u48(buf[2..8].try_into().unwrap()),
		timestamp: read_u24(buf[8..11].try_into().unwrap()),
		delay: u16::from_be_bytes(buf[11..13].try_into().unwrap()),
		sequence_number: read_u24(buf[13..16].try_into().unwrap()),
		symbol: buf[16..].to_vec(),
	}))
}

fn decode_ack_block(buf: &[u8]) -> Result<Packet> {
	if buf.len() != ACK_BLOCK_LEN {
		return too_short("Ack Block", ACK_BLOCK_LEN, buf.len());
	}

	Ok(Packet::AckBlock(AckBlock { block_id: read_u48(buf[2..8].try_into().unwrap()) }))
}

fn decode_nack_block(buf: &[u8]) -> Result<Packet> {
	if buf.len() != NACK_BLOCK_LEN {
		return too_short("Nack Block", NACK_BLOCK_LEN, buf.len());
	}

	Ok(Packet::NackBlock(NackBlock {
		block_id: read_u48(buf[2..8].try_into().unwrap()),
		received_count: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
	}))
}

fn decode_shrink_range(buf: &[u8]) -> Result<Packet> {
	if buf.len() != SHRINK_RANGE_LEN {
		return too_short("Shrink Range", SHRINK_RANGE_LEN, buf.len());
	}

	let range_start = read_u48(buf[2..8].try_into().unwrap());
	let range_end = read_u48(buf[8..14].try_into().unwrap());

	if range_start > range_end {
		warn!("Dropping Shrink Range with inverted range [{range_start}, {range_end})");
		return Err(());
	}

	Ok(Packet::ShrinkRange(ShrinkRange { range_start, range_end }))
}

fn decode_error(buf: &[u8]) -> Result<Packet> {
	if buf.len() != ERROR_LEN {
		return too_short("Error", ERROR_LEN, buf.len());
	}

	let raw = u16::from_be_bytes(buf[2..4].try_into().unwrap());
	let Some(code) = ErrorCode::from_u16(raw) else {
		warn!("Dropping Error packet with unknown code {raw}");
		return Err(());
	};

	Ok(Packet::Error(Error { code }))
}

fn decode_feedback(buf: &[u8]) -> Result<Packet> {
	if buf.len() != FEEDBACK_LEN {
		return too_short("Feedback", FEEDBACK_LEN, buf.len());
	}

	Ok(Packet::Feedback(Feedback {
		timestamp: read_u24(buf[2..5].try_into().unwrap()),
		delay: u16::from_be_bytes(buf[5..7].try_into().unwrap()),
		receive_rate_pps: u32::from_be_bytes(buf[7..11].try_into().unwrap()),
		loss_event_rate: f32::from_be_bytes(buf[11..15].try_into().unwrap()),
	}))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(p: Packet) {
		let encoded = p.encode();
		let decoded = Packet::decode(&encoded).expect("valid packet should decode");
		assert_eq!(decoded, p);
	}

	#[test]
	fn request_resource_round_trip() {
		round_trip(Packet::RequestResource(RequestResource {
			reverse: true,
			timestamp: 0xabcdef,
			sending_rate_bps: 2_000_000,
			block_range_start: 0,
			block_range_end: 100,
			resource_hash: 0x0102030405060708090a0b0c0d0e0f10,
			resource_length: 123_456,
		}));
	}

	#[test]
	fn data_round_trip() {
		round_trip(Packet::Data(Data {
			block_id: 42,
			timestamp: 1000,
			delay: 15,
			sequence_number: 7,
			symbol: vec![1, 2, 3, 4, 5],
		}));
	}

	#[test]
	fn data_with_empty_symbol_round_trips() {
		round_trip(Packet::Data(Data { block_id: 0, timestamp: 0, delay: 0, sequence_number: 0, symbol: vec![] }));
	}

	#[test]
	fn ack_block_round_trip() {
		round_trip(Packet::AckBlock(AckBlock { block_id: 0xffffffffffff }));
	}

	#[test]
	fn nack_block_round_trip() {
		round_trip(Packet::NackBlock(NackBlock { block_id: 9, received_count: 50 }));
	}

	#[test]
	fn shrink_range_round_trip() {
		round_trip(Packet::ShrinkRange(ShrinkRange { range_start: 10, range_end: 20 }));
	}

	#[test]
	fn opposite_range_ack_is_empty_range() {
		let ack = ShrinkRange::opposite_range_ack(55);
		assert!(ack.is_opposite_range_ack());
		round_trip(Packet::ShrinkRange(ack));
	}

	#[test]
	fn error_round_trip() {
		round_trip(Packet::Error(Error { code: ErrorCode::InactivityTimeout }));
	}

	#[test]
	fn feedback_round_trip() {
		round_trip(Packet::Feedback(Feedback { timestamp: 500, delay: 20, receive_rate_pps: 300, loss_event_rate: 0.05 }));
	}

	#[test]
	fn rejects_unknown_magic() {
		assert_eq!(Packet::decode(&[0xff, 0xff, 0, 0]), Err(()));
	}

	#[test]
	fn rejects_truncated_frame() {
		assert_eq!(Packet::decode(&MAGIC_ACK_BLOCK.to_be_bytes()), Err(()));
	}

	#[test]
	fn rejects_inverted_range() {
		let mut buf = vec![];
		buf.extend_from_slice(&MAGIC_SHRINK_RANGE.to_be_bytes());
		buf.extend_from_slice(&write_u48(20));
		buf.extend_from_slice(&write_u48(10));
		assert_eq!(Packet::decode(&buf), Err(()));
	}

	#[test]
	fn rejects_unknown_error_code() {
		let mut buf = vec![];
		buf.extend_from_slice(&MAGIC_ERROR.to_be_bytes());
		buf.extend_from_slice(&99u16.to_be_bytes());
		assert_eq!(Packet::decode(&buf), Err(()));
	}
}
