//! RaptorQ (RFC 6330) block encoding and decoding (§4.2).
//!
//! Each block is encoded independently: `Encoder` owns one
//! `raptorq::SourceBlockEncoder` and hands out symbols by sequence number,
//! serving source symbols directly and generating repair symbols lazily.
//! `Decoder` owns one `raptorq::SourceBlockDecoder` and accumulates fed
//! symbols until the block decodes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use raptorq::{EncodingPacket, ObjectTransmissionInformation, PayloadId, SourceBlockDecoder, SourceBlockEncoder, SourceBlockEncodingPlan};

/// Symbols are encoded/decoded in chunks of this many bytes (§0.1: 1,388 bytes,
/// chosen to fit a Data packet within a conventional internet MTU after headers).
pub const SYMBOL_SIZE: u16 = 1388;

/// Source symbols per block (§0.1): fixes `BlockSize` at `SYMBOL_SIZE * SOURCE_SYMBOLS_PER_BLOCK`.
pub const SOURCE_SYMBOLS_PER_BLOCK: u32 = 32;

/// The fixed size, in bytes, of every block except possibly the last (§4.3).
pub const BLOCK_SIZE: u64 = SYMBOL_SIZE as u64 * SOURCE_SYMBOLS_PER_BLOCK as u64;

fn padded_len(len: usize, symbol_size: u16) -> usize {
	let symbol_size = symbol_size as usize;
	let remainder = len % symbol_size;

	if len == 0 {
		symbol_size
	} else if remainder == 0 {
		len
	} else {
		len + (symbol_size - remainder)
	}
}

/// Encodes one fixed-size source block, serving symbols by sequence number.
pub struct Encoder {
	source_symbols: u32,
	encoder: SourceBlockEncoder,
	cache: RefCell<HashMap<u32, Rc<[u8]>>>,
}

impl Encoder {
	/// `data` need not be a multiple of the symbol size; it is zero-padded
	/// internally, mirroring how the sender pads the resource's final block
	/// (§4.3) before handing it to the encoder.
	pub fn new(data: &[u8]) -> Self {
		Self::with_symbol_size(data, SYMBOL_SIZE)
	}

	pub fn with_symbol_size(data: &[u8], symbol_size: u16) -> Self {
		let mut padded = data.to_vec();
		padded.resize(padded_len(padded.len(), symbol_size), 0);

		let source_symbols = (padded.len() / symbol_size as usize) as u32;
		let plan = SourceBlockEncodingPlan::generate(source_symbols as u16);
		let config = ObjectTransmissionInformation::with_defaults(padded.len() as u64, symbol_size);
		let encoder = SourceBlockEncoder::with_encoding_plan(0, &config, &padded, &plan);

		Self { source_symbols, encoder, cache: RefCell::new(HashMap::new()) }
	}

	/// Number of source symbols `K` in this block; sequence numbers below
	/// this are source symbols, at or above it are repair symbols.
	pub fn source_symbol_count(&self) -> u32 {
		self.source_symbols
	}

	/// Deterministically produce the symbol for `seq`. Repeated calls for
	/// the same `seq` are served from cache and return identical bytes.
	pub fn symbol(&self, seq: u32) -> Vec<u8> {
		if let Some(cached) = self.cache.borrow().get(&seq) {
			return cached.to_vec();
		}

		if seq < self.source_symbols {
			let mut cache = self.cache.borrow_mut();
			for (idx, packet) in self.encoder.source_packets().into_iter().enumerate() {
				cache.entry(idx as u32).or_insert_with(|| Rc::from(packet.data().as_slice()));
			}
			return cache.get(&seq).expect("source symbol index within source_symbol_count").to_vec();
		}

		let repair_index = seq - self.source_symbols;
		let packet = self.encoder.repair_packets(repair_index, 1).remove(0);
		let bytes: Rc<[u8]> = Rc::from(packet.data().as_slice());
		self.cache.borrow_mut().insert(seq, bytes.clone());
		bytes.to_vec()
	}
}

/// Decodes one fixed-size source block from symbols fed in any order, with
/// duplicates tolerated (§4.2).
pub struct Decoder {
	block_length: u64,
	decoder: SourceBlockDecoder,
}

impl Decoder {
	pub fn new(num_source_symbols: u32, block_length: u64) -> Self {
		Self::with_symbol_size(num_source_symbols, block_length, SYMBOL_SIZE)
	}

	pub fn with_symbol_size(num_source_symbols: u32, block_length: u64, symbol_size: u16) -> Self {
		let padded = padded_len(block_length as usize, symbol_size) as u64;
		let config = ObjectTransmissionInformation::with_defaults(padded, symbol_size);
		let _ = num_source_symbols;
		Self { block_length, decoder: SourceBlockDecoder::new(0, &config, padded) }
	}

	/// Feed one symbol. Returns the reconstructed block, truncated to the
	/// original (unpadded) length, once enough symbols have arrived.
	pub fn feed(&mut self, seq: u32, bytes: Vec<u8>) -> Option<Vec<u8>> {
		let packet = EncodingPacket::new(PayloadId::new(0, seq), bytes);
		let mut decoded = self.decoder.decode(vec![packet])?;
		decoded.truncate(self.block_length as usize);
		Some(decoded)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(data: &[u8]) {
		let encoder = Encoder::new(data);
		let mut decoder = Decoder::new(encoder.source_symbol_count(), data.len() as u64);

		let mut seq = 0;
		let result = loop {
			let symbol = encoder.symbol(seq);
			if let Some(decoded) = decoder.feed(seq, symbol) {
				break decoded;
			}
			seq += 1;
			assert!(seq < 10_000, "decoding should converge well before this many symbols");
		};

		assert_eq!(result, data);
	}

	#[test]
	fn empty_block_round_trips() {
		round_trip(&[]);
	}

	#[test]
	fn single_byte_round_trips() {
		round_trip(&[42]);
	}

	#[test]
	fn single_symbol_round_trips() {
		round_trip(&vec![7u8; SYMBOL_SIZE as usize]);
	}

	#[test]
	fn multi_symbol_unaligned_round_trips() {
		let data: Vec<u8> = (0..(SYMBOL_SIZE as usize * 3 + 17)).map(|i| (i % 251) as u8).collect();
		round_trip(&data);
	}

	#[test]
	fn repeated_sequence_numbers_are_deterministic() {
		let encoder = Encoder::new(&vec![9u8; SYMBOL_SIZE as usize * 2]);
		assert_eq!(encoder.symbol(0), encoder.symbol(0));
		assert_eq!(encoder.symbol(40), encoder.symbol(40));
	}

	#[test]
	fn decoder_tolerates_duplicate_feeds() {
		let data = vec![3u8; SYMBOL_SIZE as usize * 4];
		let encoder = Encoder::new(&data);
		let mut decoder = Decoder::new(encoder.source_symbol_count(), data.len() as u64);

		decoder.feed(0, encoder.symbol(0));
		decoder.feed(0, encoder.symbol(0));

		let mut seq = 1;
		let result = loop {
			if let Some(decoded) = decoder.feed(seq, encoder.symbol(seq)) {
				break decoded;
			}
			seq += 1;
		};

		assert_eq!(result, data);
	}
}
