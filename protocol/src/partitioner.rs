//! The receiver side's top-level actor (§4.6): owns one or two
//! [`ReceiverConn`]s converging on the same resource, mirrors how
//! [`crate::sender::Sender`] owns one or more `SenderConn`s over its bound
//! endpoints — the same "one actor per side" shape the teacher uses for
//! `Wireguard`.
//!
//! There is no explicit shutdown call: once every connection is retired its
//! socket is dropped, `runtime::io::is_io()` goes false, and with no timers
//! left pending `runtime::exec`'s loop exits on its own.

use std::cell::Cell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use runtime::Socket;
use stakker::{Fwd, CX};
use wire::Packet;

use crate::backoff::{Backoff, INACTIVITY_TIMEOUT};
use crate::rate::MIN_FEEDBACK_PERIOD;
use crate::receiver::{ConnState, ReceiverConn};
use crate::store::ReceiverSink;

/// One connection's local/remote endpoint pair, as chosen on the command line (§6).
/// Each endpoint carries its own requested sending rate: `-r` binds to the
/// preceding `-a`/`-p` pair, so a two-endpoint session may request different
/// rates per connection (§8 scenario 4: "Asymmetric rates").
pub struct Endpoint {
	pub local: SocketAddr,
	pub remote: SocketAddr,
	pub requested_rate_bps: u32,
}

/// The fatal outcomes a transfer can end in (§7); everything else (loss,
/// decode stalls, stray packets) is recovered locally without surfacing here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionError {
	ResourceNotFound,
	HandshakeTimeout,
	InactivityTimeout,
	OutputWriteFailed,
}

impl std::fmt::Display for SessionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let msg = match self {
			SessionError::ResourceNotFound => "sender reported the resource was not found",
			SessionError::HandshakeTimeout => "no reply from the sender within the handshake backoff budget",
			SessionError::InactivityTimeout => "connection went quiet mid-transfer",
			SessionError::OutputWriteFailed => "failed to write a decoded block to the output",
		};
		f.write_str(msg)
	}
}

impl std::error::Error for SessionError {}

/// Per-connection bookkeeping that isn't part of the wire-facing state
/// carried by [`ReceiverConn`] itself.
struct ConnExtra {
	backoff: Backoff,
}

/// Drives between one and two [`ReceiverConn`]s to completion, writing
/// decoded blocks to a [`ReceiverSink`] as they arrive (§4.3, §4.6).
pub struct Partitioner {
	sink: ReceiverSink,
	block_count: u64,
	conns: Vec<ReceiverConn>,
	extra: Vec<ConnExtra>,
	acked: HashSet<u64>,
	/// Lowest block id not yet acked by either connection.
	frontier_lo: u64,
	/// One past the highest block id not yet acked by either connection.
	frontier_hi: u64,
	/// Set once, just before the last socket is dropped, so `main` can read
	/// the outcome back out after `runtime::exec` returns.
	outcome: Rc<Cell<Option<Result<(), SessionError>>>>,
}

impl Partitioner {
	/// `endpoints` has one or two entries (§4.6: "at most two concurrent
	/// connections, one FORWARD and one REVERSE"). With two, the first runs
	/// forward and the second reverse.
	#[allow(clippy::too_many_arguments)]
	pub fn init(
		cx: CX![],
		endpoints: Vec<Endpoint>,
		resource_hash: u128,
		resource_length: u64,
		sink: ReceiverSink,
		outcome: Rc<Cell<Option<Result<(), SessionError>>>>,
	) -> Option<Self> {
		let block_count = resource_length.div_ceil(fec::BLOCK_SIZE);
		let now = Instant::now();
		let actor = cx.access_actor().clone();

		let mut conns = Vec::with_capacity(endpoints.len());
		for (idx, ep) in endpoints.into_iter().enumerate() {
			let reverse = idx == 1;
			let a1 = actor.clone();
			let fwd: Fwd<Vec<u8>> = Fwd::new(move |buf| {
				let a2 = a1.clone();
				a1.defer(move |s| a2.apply(s, move |this, cx| this.on_datagram(cx, idx, buf)));
			});

			let socket = match Socket::connect(ep.local, ep.remote, fwd) {
				Ok(s) => s,
				Err(err) => {
					warn!("Failed to bind {}: {err}", ep.local);
					return None;
				}
			};

			conns.push(ReceiverConn::new(now, socket, reverse, (0, block_count), resource_hash, resource_length, ep.requested_rate_bps));
		}

		let extra = (0..conns.len()).map(|_| ConnExtra { backoff: Backoff::default() }).collect();

		let mut this = Self { sink, block_count, conns, extra, acked: HashSet::new(), frontier_lo: 0, frontier_hi: block_count, outcome };

		for idx in 0..this.conns.len() {
			this.conns[idx].send_request(now);
			this.schedule_retry(cx, idx, Duration::from_millis(200));
			this.schedule_inactivity_check(cx, idx);
		}

		if block_count == 0 {
			info!("Resource is empty, nothing to transfer");
			for conn in &mut this.conns {
				conn.retire();
			}
			this.finish(Ok(()));
		}

		Some(this)
	}

	fn on_datagram(&mut self, cx: CX![], idx: usize, buf: Vec<u8>) {
		if idx >= self.conns.len() {
			// Already finished; the connection's socket is gone but a
			// straggling datagram can still be in flight.
			return;
		}

		let Ok(packet) = Packet::decode(&buf) else { return };

		match packet {
			Packet::Data(data) => self.on_data(cx, idx, data),
			Packet::Error(err) => self.on_error(cx, idx, err.code),
			Packet::RequestResource(_) | Packet::AckBlock(_) | Packet::NackBlock(_) | Packet::Feedback(_) | Packet::ShrinkRange(_) => {
				trace!("Ignoring stray sender-bound packet on connection {idx}");
			}
		}
	}

	fn on_data(&mut self, cx: CX![], idx: usize, data: wire::Data) {
		let newly_established = self.conns[idx].state == ConnState::Requesting;

		let Some(decoded) = self.conns[idx].on_data(Instant::now(), data) else {
			if newly_established {
				debug!("Connection {idx} established");
				self.schedule_feedback(cx, idx, MIN_FEEDBACK_PERIOD);
				self.schedule_keepalive(cx, idx, MIN_FEEDBACK_PERIOD);
			}
			return;
		};

		if newly_established {
			debug!("Connection {idx} established");
			self.schedule_feedback(cx, idx, MIN_FEEDBACK_PERIOD);
			self.schedule_keepalive(cx, idx, MIN_FEEDBACK_PERIOD);
		}

		if self.sink.write_block(decoded.block_id, &decoded.bytes).is_err() {
			// The store already logged the cause; there's nowhere further to
			// retry a write to, so give up the whole transfer.
			self.finish(Err(SessionError::OutputWriteFailed));
			return;
		}

		self.acked.insert(decoded.block_id);

		if self.conns.len() == 2 {
			self.converge(Instant::now());
		}

		if self.acked.len() as u64 >= self.block_count {
			info!("All {} blocks received", self.block_count);
			for conn in &mut self.conns {
				conn.retire();
			}
			self.finish(Ok(()));
		}
	}

	/// Narrow each connection's range to stop just short of what the other
	/// has already covered (§4.6: convergence via Shrink Range).
	fn converge(&mut self, now: Instant) {
		while self.frontier_lo < self.frontier_hi && self.acked.contains(&self.frontier_lo) {
			self.frontier_lo += 1;
		}
		while self.frontier_hi > self.frontier_lo && self.acked.contains(&(self.frontier_hi - 1)) {
			self.frontier_hi -= 1;
		}

		let (lo, hi) = (self.frontier_lo, self.frontier_hi);
		self.conns[0].shrink_to(now, lo, hi);
		self.conns[1].shrink_to(now, lo, hi);
	}

	fn on_error(&mut self, _cx: CX![], idx: usize, code: wire::ErrorCode) {
		self.conns[idx].on_error(code);
		if self.conns[idx].state == ConnState::Failed && self.all_done() {
			let err = if code == wire::ErrorCode::UnknownResource { SessionError::ResourceNotFound } else { SessionError::InactivityTimeout };
			self.finish(Err(err));
		}
	}

	fn all_done(&self) -> bool {
		self.conns.iter().all(|c| matches!(c.state, ConnState::Closed | ConnState::Failed | ConnState::Completing))
	}

	/// Resend the handshake Request on the doubling backoff schedule while
	/// `Requesting` (§4.8); give up once the budget is exhausted.
	fn schedule_retry(&self, cx: CX![], idx: usize, after: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(after, move |s| actor.apply(s, move |this, cx| this.retry(cx, idx)));
	}

	fn retry(&mut self, cx: CX![], idx: usize) {
		if idx >= self.conns.len() || self.conns[idx].state != ConnState::Requesting {
			return;
		}

		match self.extra[idx].backoff.advance() {
			Some(wait) => {
				self.conns[idx].send_request(Instant::now());
				self.schedule_retry(cx, idx, wait);
			}
			None => {
				warn!("Connection {idx} gave up waiting for a reply after the backoff budget was exhausted");
				self.conns[idx].state = ConnState::Failed;
				if self.all_done() {
					self.finish(Err(SessionError::HandshakeTimeout));
				}
			}
		}
	}

	fn schedule_inactivity_check(&self, cx: CX![], idx: usize) {
		let actor = cx.access_actor().clone();
		cx.after(INACTIVITY_TIMEOUT, move |s| actor.apply(s, move |this, cx| this.check_inactivity(cx, idx)));
	}

	fn check_inactivity(&mut self, cx: CX![], idx: usize) {
		if idx >= self.conns.len() || matches!(self.conns[idx].state, ConnState::Closed | ConnState::Failed) {
			return;
		}

		if self.conns[idx].last_activity.elapsed() >= INACTIVITY_TIMEOUT {
			info!("Connection {idx} timed out, closing (§7)");
			self.conns[idx].state = ConnState::Closed;
			if self.all_done() {
				let result = if self.acked.len() as u64 >= self.block_count { Ok(()) } else { Err(SessionError::InactivityTimeout) };
				self.finish(result);
			}
			return;
		}

		self.schedule_inactivity_check(cx, idx);
	}

	/// Periodic Feedback send while established, paced at `max(250ms, srtt)` (§4.8).
	fn schedule_feedback(&self, cx: CX![], idx: usize, after: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(after, move |s| actor.apply(s, move |this, cx| this.feedback_tick(cx, idx)));
	}

	fn feedback_tick(&mut self, cx: CX![], idx: usize) {
		if idx >= self.conns.len() || !matches!(self.conns[idx].state, ConnState::Established | ConnState::Completing) {
			return;
		}

		self.conns[idx].send_feedback(Instant::now());
		let period = self.conns[idx].rtt.feedback_period();
		self.schedule_feedback(cx, idx, period);
	}

	/// Re-send Request at period ≈ RTT while established, refreshing the
	/// sender's RTT estimate and keeping its connection state alive (§4.5).
	fn schedule_keepalive(&self, cx: CX![], idx: usize, after: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(after, move |s| actor.apply(s, move |this, cx| this.keepalive_tick(cx, idx)));
	}

	fn keepalive_tick(&mut self, cx: CX![], idx: usize) {
		if idx >= self.conns.len() || self.conns[idx].state != ConnState::Established {
			return;
		}

		self.conns[idx].send_request(Instant::now());
		let period = self.conns[idx].rtt.feedback_period();
		self.schedule_keepalive(cx, idx, period);
	}

	/// Idempotent: drops every connection's socket, which lets
	/// `runtime::exec`'s loop notice there's no more I/O or timers pending
	/// and exit on its own.
	fn finish(&mut self, result: Result<(), SessionError>) {
		if self.outcome.get().is_some() {
			return;
		}
		self.outcome.set(Some(result));
		self.conns.clear();
	}
}
