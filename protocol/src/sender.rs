//! The sender's connection state machine and rate-governed emission loop
//! (§4.4, §4.7). One [`Sender`] actor serves a single resource over one or
//! more bound endpoints, exactly as the teacher's `Wireguard` actor serves
//! one interface over one socket and dispatches inbound packets into
//! per-peer state it owns directly (`peers: Map<Peer, 1>`) rather than into
//! sub-actors.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use runtime::Listener;
use stakker::{Fwd, CX};
use wire::{AckBlock, Error, ErrorCode, Feedback, NackBlock, Packet, RequestResource, ShrinkRange};

use crate::backoff::INACTIVITY_TIMEOUT;
use crate::rate::{self, LossEstimator, Pacer, RttEstimator};
use crate::store::SenderStore;

/// Minimum nominal repair budget in the absence of any Feedback sample (§4.4:
/// "under uncertainty emit one full block-worth of repair").
const UNCERTAIN_SLACK: u32 = fec::SOURCE_SYMBOLS_PER_BLOCK;

/// §4.4 names a `Draining` state between `Active` and `Closed` to "finish
/// emitting any in-flight symbols" once the range empties. Every send here is
/// a synchronous, non-blocking `UdpSocket::send_to` issued directly from
/// `select_symbol`/`tick` — there is no outstanding queue of symbols to
/// drain once the range is empty, so that transition collapses to going
/// straight to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
	Active,
	Closed,
}

/// Per (local endpoint, remote endpoint) connection state (§3, §4.4).
struct SenderConn {
	state: ConnState,
	epoch: Instant,
	remote: SocketAddr,
	listener_idx: usize,
	reverse: bool,
	range_start: u64,
	range_end: u64,
	acked: BTreeSet<u64>,
	encoders: HashMap<u64, Rc<fec::Encoder>>,
	next_seq: HashMap<u64, u32>,
	budget: HashMap<u64, u32>,
	rtt: RttEstimator,
	loss: LossEstimator,
	have_feedback: bool,
	last_feedback_ts: Option<u32>,
	pacer: Pacer,
	requested_rate_bps: u32,
	last_activity: Instant,
	/// Sender-local timestamp (this connection's own epoch) at which the
	/// last Request was received, so `delay` (§4.4: "now − last Request
	/// receive time") is a hold duration in one clock, not a diff across
	/// the sender's and receiver's independent epochs.
	last_request_received_at: u32,
}

impl SenderConn {
	fn new(now: Instant, listener_idx: usize, remote: SocketAddr, req: &RequestResource) -> Self {
		Self {
			state: ConnState::Active,
			epoch: now,
			remote,
			listener_idx,
			reverse: req.reverse,
			range_start: req.block_range_start,
			range_end: req.block_range_end,
			acked: BTreeSet::new(),
			encoders: HashMap::new(),
			next_seq: HashMap::new(),
			budget: HashMap::new(),
			rtt: RttEstimator::default(),
			loss: LossEstimator::default(),
			have_feedback: false,
			last_feedback_ts: None,
			pacer: Pacer::new(now, req.sending_rate_bps.max(1)),
			requested_rate_bps: req.sending_rate_bps.max(1),
			last_activity: now,
			// `epoch` is `now`, so the sender-local clock reads 0 at this instant.
			last_request_received_at: 0,
		}
	}

	fn timestamp(&self, now: Instant) -> u32 {
		(now.saturating_duration_since(self.epoch).as_millis() as u32) % wire::TIMESTAMP_MODULUS
	}

	/// Clip the working range to `[start, end)`; ranges only ever shrink (§8: Shrink monotonicity).
	fn shrink_to(&mut self, start: u64, end: u64) {
		self.range_start = self.range_start.max(start);
		self.range_end = self.range_end.min(end);
		if self.range_end < self.range_start {
			self.range_end = self.range_start;
		}
	}

	fn is_empty_range(&self) -> bool {
		self.range_start >= self.range_end
	}

	/// Advance the boundary past any already-acked ids (§4.4: "if bid equals
	/// range start (or end−1 under REVERSE) advance the range boundary").
	fn settle_boundary(&mut self) {
		if self.reverse {
			while self.range_end > self.range_start && self.acked.contains(&(self.range_end - 1)) {
				self.range_end -= 1;
			}
		} else {
			while self.range_start < self.range_end && self.acked.contains(&self.range_start) {
				self.range_start += 1;
			}
		}
	}

	/// Pick the next (block id, sequence number, encoded bytes) to emit, or
	/// `None` if every block in range has exhausted its budget.
	fn select_symbol(&mut self, store: &SenderStore) -> Option<(u64, u32, Vec<u8>)> {
		if self.is_empty_range() {
			return None;
		}

		let ids: Box<dyn Iterator<Item = u64>> =
			if self.reverse { Box::new((self.range_start..self.range_end).rev()) } else { Box::new(self.range_start..self.range_end) };

		for bid in ids {
			if self.acked.contains(&bid) {
				continue;
			}

			let sent = *self.next_seq.get(&bid).unwrap_or(&0);
			let budget = *self.budget.entry(bid).or_insert_with(|| fec::SOURCE_SYMBOLS_PER_BLOCK);

			if sent >= budget {
				continue;
			}

			let encoder = self.encoders.entry(bid).or_insert_with(|| {
				let bytes = store.block(bid).expect("block id within connection range must exist in store");
				Rc::new(fec::Encoder::new(bytes))
			});

			let symbol = encoder.symbol(sent);
			self.next_seq.insert(bid, sent + 1);
			return Some((bid, sent, symbol));
		}

		None
	}

	fn on_ack(&mut self, bid: u64) {
		self.acked.insert(bid);
		self.encoders.remove(&bid);
		self.next_seq.remove(&bid);
		self.budget.remove(&bid);
		self.settle_boundary();
	}

	fn on_nack(&mut self, bid: u64, received_count: u32) {
		let extra = if self.have_feedback { rate::nack_slack(received_count, self.loss.get()) } else { UNCERTAIN_SLACK };
		let sent = *self.next_seq.get(&bid).unwrap_or(&0);
		let new_budget = sent + extra;
		let entry = self.budget.entry(bid).or_insert(fec::SOURCE_SYMBOLS_PER_BLOCK);
		*entry = (*entry).max(new_budget);
	}

	fn on_feedback(&mut self, now: Instant, fb: &Feedback) {
		if let Some(last) = self.last_feedback_ts {
			if wire::timestamp_diff(fb.timestamp, last) < 0 {
				debug!("Ignoring stale Feedback from {}", self.remote);
				return;
			}
		}
		self.last_feedback_ts = Some(fb.timestamp);

		let elapsed = wire::timestamp_diff(self.timestamp(now), fb.timestamp).max(0) as u64;
		let sample = Duration::from_millis(elapsed).saturating_sub(Duration::from_millis(fb.delay as u64));
		self.rtt.sample(sample);
		self.loss.update(fb.loss_event_rate);
		self.have_feedback = true;

		let allowed = rate::allowed_rate_bps(self.requested_rate_bps, fec::SYMBOL_SIZE as usize + wire::DATA_HEADER_LEN, self.rtt.get(), self.loss.get());
		self.pacer.set_rate(now, allowed);
	}
}

/// Serves one resource over one or more bound endpoints (§1, §4.4).
pub struct Sender {
	store: SenderStore,
	resource_hash: u128,
	listeners: Vec<Listener>,
	connections: HashMap<(usize, SocketAddr), SenderConn>,
}

impl Sender {
	pub fn init(cx: CX![], resource_hash: u128, store: SenderStore, binds: Vec<SocketAddr>) -> Option<Self> {
		let actor = cx.access_actor().clone();
		let mut listeners = Vec::with_capacity(binds.len());

		for (idx, addr) in binds.into_iter().enumerate() {
			let a1 = actor.clone();
			let fwd: Fwd<(SocketAddr, Vec<u8>)> = Fwd::new(move |(from, buf)| {
				let a2 = a1.clone();
				a1.defer(move |s| a2.apply(s, move |this, cx| this.on_datagram(cx, idx, from, buf)));
			});

			match Listener::bind(addr, fwd) {
				Ok(l) => {
					info!("Listening on {addr}");
					listeners.push(l);
				}
				Err(err) => {
					warn!("Failed to bind {addr}: {err}");
					return None;
				}
			}
		}

		Some(Self { store, resource_hash, listeners, connections: HashMap::new() })
	}

	fn on_datagram(&mut self, cx: CX![], listener_idx: usize, from: SocketAddr, buf: Vec<u8>) {
		let Ok(packet) = Packet::decode(&buf) else { return };

		match packet {
			Packet::RequestResource(req) => self.on_request(cx, listener_idx, from, req),
			Packet::AckBlock(ack) => self.on_ack(cx, listener_idx, from, ack),
			Packet::NackBlock(nack) => self.on_nack(listener_idx, from, nack),
			Packet::ShrinkRange(shrink) => self.on_shrink(cx, listener_idx, from, shrink),
			Packet::Feedback(fb) => self.on_feedback(listener_idx, from, fb),
			Packet::Data(_) => trace!("Ignoring stray Data packet from {from} (sender does not receive Data)"),
			Packet::Error(err) => debug!("Peer {from} reported error: {:?}", err.code),
		}
	}

	fn send_error(&self, listener_idx: usize, to: SocketAddr, code: ErrorCode) {
		self.listeners[listener_idx].send_to(&Packet::Error(Error { code }).encode(), to);
	}

	fn on_request(&mut self, cx: CX![], listener_idx: usize, from: SocketAddr, req: RequestResource) {
		if req.resource_hash != self.resource_hash || req.resource_length != self.store.len() {
			warn!("Request for unknown resource from {from}");
			self.send_error(listener_idx, from, ErrorCode::UnknownResource);
			return;
		}

		let n = self.store.block_count();
		if req.block_range_start > req.block_range_end || req.block_range_end > n {
			warn!("Request from {from} has out-of-bounds block range [{}, {})", req.block_range_start, req.block_range_end);
			self.send_error(listener_idx, from, ErrorCode::ProtocolViolation);
			return;
		}

		let key = (listener_idx, from);
		let now = Instant::now();

		match self.connections.get_mut(&key) {
			Some(conn) => {
				conn.requested_rate_bps = req.sending_rate_bps.max(1);
				conn.reverse = req.reverse;
				conn.shrink_to(req.block_range_start, req.block_range_end);
				conn.last_request_received_at = conn.timestamp(now);
				conn.last_activity = now;
				debug!("Refreshed connection from {from}: range [{}, {})", conn.range_start, conn.range_end);
			}
			None => {
				info!("New connection from {from}: range [{}, {}), reverse={}", req.block_range_start, req.block_range_end, req.reverse);
				let conn = SenderConn::new(now, listener_idx, from, &req);

				if conn.is_empty_range() {
					// Nothing to send (e.g. the empty-resource case, §8 scenario 1); don't bother scheduling.
					debug!("Connection from {from} opened with an empty range, nothing to send");
					return;
				}

				self.connections.insert(key, conn);
				self.schedule_tick(cx, key, Duration::ZERO);
				self.schedule_inactivity_check(cx, key);
			}
		}
	}

	fn on_ack(&mut self, _cx: CX![], listener_idx: usize, from: SocketAddr, ack: AckBlock) {
		let key = (listener_idx, from);
		let Some(conn) = self.connections.get_mut(&key) else { return };

		// Idempotent: a block already acked may be re-acked harmlessly (§8).
		// Anything else must currently be in range, or it's a protocol violation (§7).
		let in_range = (conn.range_start..conn.range_end).contains(&ack.block_id);
		if !conn.acked.contains(&ack.block_id) && !in_range {
			self.send_error(listener_idx, from, ErrorCode::ProtocolViolation);
			return;
		}

		conn.last_activity = Instant::now();
		conn.on_ack(ack.block_id);

		if conn.is_empty_range() && conn.state == ConnState::Active {
			info!("Connection to {from} drained its range, closing");
			conn.state = ConnState::Closed;
			self.connections.remove(&key);
		}
	}

	fn on_nack(&mut self, listener_idx: usize, from: SocketAddr, nack: NackBlock) {
		let key = (listener_idx, from);
		let Some(conn) = self.connections.get_mut(&key) else { return };

		if !(conn.range_start..conn.range_end).contains(&nack.block_id) {
			self.send_error(listener_idx, from, ErrorCode::ProtocolViolation);
			return;
		}

		conn.last_activity = Instant::now();
		conn.on_nack(nack.block_id, nack.received_count);
	}

	fn on_shrink(&mut self, _cx: CX![], listener_idx: usize, from: SocketAddr, shrink: ShrinkRange) {
		let key = (listener_idx, from);
		let Some(conn) = self.connections.get_mut(&key) else { return };

		conn.last_activity = Instant::now();
		conn.shrink_to(shrink.range_start, shrink.range_end);

		if conn.is_empty_range() {
			info!("Connection to {from} shrunk to empty, closing");
			conn.state = ConnState::Closed;
			self.connections.remove(&key);
		}
	}

	fn on_feedback(&mut self, listener_idx: usize, from: SocketAddr, fb: Feedback) {
		let key = (listener_idx, from);
		let Some(conn) = self.connections.get_mut(&key) else { return };
		conn.last_activity = Instant::now();
		conn.on_feedback(Instant::now(), &fb);
	}

	/// One rate-paced emission tick for a single connection (§4.7): wait
	/// until `next_send_time`, send one symbol, advance the pacer by
	/// exactly the time that packet cost, then schedule the next tick.
	fn tick(&mut self, cx: CX![], key: (usize, SocketAddr)) {
		let Some(conn) = self.connections.get_mut(&key) else { return };
		if conn.state != ConnState::Active {
			return;
		}

		let now = Instant::now();

		let Some((bid, seq, symbol)) = conn.select_symbol(&self.store) else {
			// Nothing eligible to send right now (range empty, or every
			// in-range block has exhausted its budget); poll again shortly.
			self.schedule_tick(cx, key, Duration::from_millis(50));
			return;
		};

		let packet = Packet::Data(wire::Data {
			block_id: bid,
			timestamp: conn.timestamp(now),
			delay: wire::timestamp_diff(conn.timestamp(now), conn.last_request_received_at).clamp(0, u16::MAX as i32) as u16,
			sequence_number: seq,
			symbol,
		})
		.encode();

		let packet_len = packet.len();
		self.listeners[conn.listener_idx].send_to(&packet, conn.remote);

		conn.pacer.advance(now, packet_len);
		let wait = conn.pacer.next_send_time().saturating_duration_since(now);
		self.schedule_tick(cx, key, wait);
	}

	fn schedule_tick(&self, cx: CX![], key: (usize, SocketAddr), after: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(after, move |s| actor.apply(s, move |this, cx| this.tick(cx, key)));
	}

	fn check_inactivity(&mut self, cx: CX![], key: (usize, SocketAddr)) {
		if let Some(conn) = self.connections.get(&key) {
			if conn.last_activity.elapsed() >= INACTIVITY_TIMEOUT {
				info!("Connection to {} timed out, dropping silently (§7)", conn.remote);
				self.connections.remove(&key);
				return;
			}
			self.schedule_inactivity_check(cx, key);
		}
	}

	fn schedule_inactivity_check(&self, cx: CX![], key: (usize, SocketAddr)) {
		let actor = cx.access_actor().clone();
		cx.after(INACTIVITY_TIMEOUT, move |s| actor.apply(s, move |this, cx| this.check_inactivity(cx, key)));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(range: (u64, u64), reverse: bool) -> RequestResource {
		RequestResource {
			reverse,
			timestamp: 0,
			sending_rate_bps: 1_000_000,
			block_range_start: range.0,
			block_range_end: range.1,
			resource_hash: 0,
			resource_length: range.1 * fec::BLOCK_SIZE,
		}
	}

	fn remote() -> SocketAddr {
		"127.0.0.1:1".parse().unwrap()
	}

	fn store(blocks: u64) -> SenderStore {
		SenderStore::new(vec![0xabu8; (blocks * fec::BLOCK_SIZE) as usize])
	}

	#[test]
	fn select_symbol_goes_low_to_high_when_forward() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), false));
		let store = store(3);

		let (bid, seq, _) = conn.select_symbol(&store).expect("a block should be selectable");
		assert_eq!(bid, 0);
		assert_eq!(seq, 0);
	}

	#[test]
	fn select_symbol_goes_high_to_low_when_reverse() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), true));
		let store = store(3);

		let (bid, _, _) = conn.select_symbol(&store).expect("a block should be selectable");
		assert_eq!(bid, 2);
	}

	#[test]
	fn select_symbol_skips_acked_blocks() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), false));
		let store = store(3);

		conn.on_ack(0);
		let (bid, _, _) = conn.select_symbol(&store).expect("block 1 should be selectable once 0 is acked");
		assert_eq!(bid, 1);
	}

	#[test]
	fn select_symbol_advances_sequence_number_per_call() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 1), false));
		let store = store(1);

		let (_, seq0, _) = conn.select_symbol(&store).unwrap();
		let (_, seq1, _) = conn.select_symbol(&store).unwrap();
		assert_eq!((seq0, seq1), (0, 1));
	}

	#[test]
	fn on_ack_at_range_start_advances_the_boundary_forward() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), false));

		conn.on_ack(0);
		assert_eq!((conn.range_start, conn.range_end), (1, 3));
	}

	#[test]
	fn on_ack_at_range_end_advances_the_boundary_under_reverse() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), true));

		conn.on_ack(2);
		assert_eq!((conn.range_start, conn.range_end), (0, 2));
	}

	#[test]
	fn on_ack_in_the_middle_does_not_move_either_boundary() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), false));

		conn.on_ack(1);
		assert_eq!((conn.range_start, conn.range_end), (0, 3));
		assert!(conn.acked.contains(&1));
	}

	#[test]
	fn repeated_ack_is_idempotent() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 3), false));

		conn.on_ack(0);
		conn.on_ack(0);
		assert_eq!(conn.range_start, 1);
	}

	#[test]
	fn on_nack_raises_the_budget_past_what_was_already_sent() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 1), false));
		conn.next_seq.insert(0, 20);

		conn.on_nack(0, 20);

		let budget = *conn.budget.get(&0).unwrap();
		assert!(budget > 20, "budget should grow past the 20 symbols already sent");
	}

	#[test]
	fn shrink_to_never_lets_start_pass_end() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 10), false));

		conn.shrink_to(6, 4);

		assert_eq!((conn.range_start, conn.range_end), (6, 6));
		assert!(conn.is_empty_range());
	}

	#[test]
	fn select_symbol_returns_none_once_range_is_fully_acked() {
		let now = Instant::now();
		let mut conn = SenderConn::new(now, 0, remote(), &request((0, 2), false));
		let store = store(2);

		conn.on_ack(0);
		conn.on_ack(1);

		assert!(conn.is_empty_range());
		assert!(conn.select_symbol(&store).is_none());
	}
}
