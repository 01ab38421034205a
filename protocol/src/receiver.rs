//! The receiver's connection state machine (§4.5): one [`ReceiverConn`] per
//! bound server endpoint, each owning its own connected UDP socket and FEC
//! decoder set. Plain structs rather than sub-actors, owned and driven by
//! the [`crate::partitioner::Partitioner`] actor — the same shape the
//! teacher uses for `Peer` inside `Wireguard`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{trace, warn};
use runtime::Socket;
use wire::{Data, Feedback, Packet, RequestResource};

use crate::rate::{LossEstimator, RttEstimator};

/// Nominal source symbols for a block of `len` bytes, rounded up.
fn nominal_k(len: u64) -> u32 {
	len.div_ceil(fec::SYMBOL_SIZE as u64) as u32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
	Requesting,
	Established,
	Completing,
	Closed,
	/// Gave up during `Requesting` after the backoff budget was exhausted (§4.8, §7).
	Failed,
}

/// A decoded block ready for the partitioner to write out and acknowledge.
pub struct Decoded {
	pub block_id: u64,
	pub bytes: Vec<u8>,
}

pub struct ReceiverConn {
	pub socket: Socket,
	pub epoch: Instant,
	pub reverse: bool,
	pub range_start: u64,
	pub range_end: u64,
	pub state: ConnState,
	pub rtt: RttEstimator,
	loss: LossEstimator,
	decoders: HashMap<u64, fec::Decoder>,
	received_seqs: HashMap<u64, HashSet<u32>>,
	max_seq_seen: HashMap<u64, u32>,
	last_nacked_at: HashMap<u64, u32>,
	last_data_ts: u32,
	last_data_received: Instant,
	data_since_feedback: u32,
	pub last_activity: Instant,
	resource_hash: u128,
	resource_length: u64,
	request_rate_bps: u32,
	last_request_sent_at: Instant,
}

impl ReceiverConn {
	pub fn new(now: Instant, socket: Socket, reverse: bool, range: (u64, u64), resource_hash: u128, resource_length: u64, request_rate_bps: u32) -> Self {
		Self {
			socket,
			epoch: now,
			reverse,
			range_start: range.0,
			range_end: range.1,
			state: ConnState::Requesting,
			rtt: RttEstimator::default(),
			loss: LossEstimator::default(),
			decoders: HashMap::new(),
			received_seqs: HashMap::new(),
			max_seq_seen: HashMap::new(),
			last_nacked_at: HashMap::new(),
			last_data_ts: 0,
			last_data_received: now,
			data_since_feedback: 0,
			last_activity: now,
			resource_hash,
			resource_length,
			request_rate_bps,
			last_request_sent_at: now,
		}
	}

	pub fn is_empty_range(&self) -> bool {
		self.range_start >= self.range_end
	}

	fn timestamp(&self, now: Instant) -> u32 {
		(now.saturating_duration_since(self.epoch).as_millis() as u32) % wire::TIMESTAMP_MODULUS
	}

	/// Send (or re-send, as a keepalive/RTT probe — §4.5, §4.8) the Request
	/// packet, recording when it went out so a later Data's `delay` field
	/// can be turned into an RTT sample (see [`Self::on_data`]).
	pub fn send_request(&mut self, now: Instant) {
		let packet = Packet::RequestResource(RequestResource {
			reverse: self.reverse,
			timestamp: self.timestamp(now),
			sending_rate_bps: self.request_rate_bps,
			block_range_start: self.range_start,
			block_range_end: self.range_end,
			resource_hash: self.resource_hash,
			resource_length: self.resource_length,
		})
		.encode();

		self.last_request_sent_at = now;
		self.socket.send(&packet);
	}

	/// Shrink the working range and, if the connection has already
	/// established, tell the sender about it (§4.6, §4.4).
	pub fn shrink_to(&mut self, now: Instant, start: u64, end: u64) {
		self.range_start = self.range_start.max(start);
		self.range_end = self.range_end.min(end);
		if self.range_end < self.range_start {
			self.range_end = self.range_start;
		}

		if self.state == ConnState::Established {
			self.socket.send(&Packet::ShrinkRange(wire::ShrinkRange { range_start: self.range_start, range_end: self.range_end }).encode());
		}
	}

	/// Tell the sender to stop entirely and move to `Completing` (§4.5, §4.6).
	pub fn retire(&mut self) {
		if matches!(self.state, ConnState::Closed | ConnState::Failed) {
			return;
		}
		let boundary = if self.reverse { self.range_end } else { self.range_start };
		self.socket.send(&Packet::ShrinkRange(wire::ShrinkRange::opposite_range_ack(boundary)).encode());
		self.state = ConnState::Completing;
	}

	/// Feed one Data packet. Returns `Some` if this completed a block's decode (§4.2, §4.5).
	pub fn on_data(&mut self, now: Instant, data: Data) -> Option<Decoded> {
		self.last_activity = now;

		if self.state == ConnState::Requesting {
			self.state = ConnState::Established;
		}

		if !(self.range_start..self.range_end).contains(&data.block_id) {
			trace!("Dropping Data for block {} outside current range", data.block_id);
			return None;
		}

		self.last_data_ts = data.timestamp;
		self.last_data_received = now;
		self.data_since_feedback += 1;

		// RTT sample (§4.8): the sender stamped this Data with `delay`, the
		// time it sat between receiving our last Request and emitting this
		// packet. `(now - last_request_sent_at) - delay` cancels that out,
		// leaving the round trip.
		let since_request = now.saturating_duration_since(self.last_request_sent_at);
		let sample = since_request.saturating_sub(Duration::from_millis(data.delay as u64));
		if sample > Duration::ZERO {
			self.rtt.sample(sample);
		}

		let max_seen = self.max_seq_seen.entry(data.block_id).or_insert(0);
		if data.sequence_number >= *max_seen {
			let gap = data.sequence_number - *max_seen;
			if gap > 0 {
				self.loss.observe_gap(gap as u64, 1);
			}
			*max_seen = data.sequence_number;
		}

		let seen = self.received_seqs.entry(data.block_id).or_default();
		let first_time = seen.insert(data.sequence_number);

		if !self.decoders.contains_key(&data.block_id) {
			let block_len = (self.resource_length - data.block_id * fec::BLOCK_SIZE).min(fec::BLOCK_SIZE);
			self.decoders.insert(data.block_id, fec::Decoder::new(fec::SOURCE_SYMBOLS_PER_BLOCK, block_len));
		}

		let decoded = self.decoders.get_mut(&data.block_id).and_then(|d| d.feed(data.sequence_number, data.symbol));

		if let Some(bytes) = decoded {
			self.decoders.remove(&data.block_id);
			self.received_seqs.remove(&data.block_id);
			self.max_seq_seen.remove(&data.block_id);
			self.last_nacked_at.remove(&data.block_id);
			self.socket.send(&Packet::AckBlock(wire::AckBlock { block_id: data.block_id }).encode());
			return Some(Decoded { block_id: data.block_id, bytes });
		}

		if first_time {
			let block_len = (self.resource_length - data.block_id * fec::BLOCK_SIZE).min(fec::BLOCK_SIZE);
			let k = nominal_k(block_len);
			let received = self.received_seqs[&data.block_id].len() as u32;
			let last_nacked = *self.last_nacked_at.get(&data.block_id).unwrap_or(&0);

			if received >= k && received > last_nacked {
				self.socket.send(&Packet::NackBlock(wire::NackBlock { block_id: data.block_id, received_count: received }).encode());
				self.last_nacked_at.insert(data.block_id, received);
			}
		}

		None
	}

	/// Build and send a Feedback packet, resetting the windowed counters (§4.5, §4.8).
	pub fn send_feedback(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_data_received);
		let delay = elapsed.as_millis().min(u16::MAX as u128) as u16;

		let window = self.rtt.get().unwrap_or(Duration::from_millis(250)).max(Duration::from_millis(1));
		let receive_rate_pps = (self.data_since_feedback as f64 / window.as_secs_f64()).round() as u32;
		self.data_since_feedback = 0;

		let packet = Packet::Feedback(Feedback {
			timestamp: self.last_data_ts,
			delay,
			receive_rate_pps,
			loss_event_rate: self.loss.get(),
		})
		.encode();

		self.socket.send(&packet);
	}

	pub fn on_error(&mut self, code: wire::ErrorCode) {
		warn!("Sender reported error: {code:?}");
		if code == wire::ErrorCode::UnknownResource {
			self.state = ConnState::Failed;
		}
	}
}
