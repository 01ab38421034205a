//! Integration tests driving [`protocol::receiver::ReceiverConn`] over real
//! loopback UDP sockets, with blocks produced by the actual RaptorQ encoder
//! (§8). `ReceiverConn`'s methods take plain `&self`/`&mut self`/`Instant`
//! arguments with no `CX![]`, so it can be exercised directly without a
//! running `Stakker` core — unlike `SenderConn`, which is private to the
//! sender actor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use stakker::Fwd;

use protocol::receiver::{ConnState, ReceiverConn};

const RESOURCE_HASH: u128 = 0xdead_beef_cafe_babe_0011_2233_4455_6677;

type Inbox = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// A bare loopback socket standing in for the sender, used only to observe
/// what `ReceiverConn` puts on the wire and to hand it `Data` packets.
struct FakeSender {
	sock: UdpSocket,
}

impl FakeSender {
	fn new() -> Self {
		let sock = UdpSocket::bind("127.0.0.1:0").expect("bind fake sender");
		sock.set_nonblocking(true).unwrap();
		Self { sock }
	}

	fn addr(&self) -> SocketAddr {
		self.sock.local_addr().unwrap()
	}

	/// Receive and decode every packet the connection has sent so far.
	fn drain(&self) -> Vec<wire::Packet> {
		let mut buf = [0u8; 2048];
		let mut out = Vec::new();
		loop {
			match self.sock.recv(&mut buf) {
				Ok(n) => out.push(wire::Packet::decode(&buf[..n]).expect("valid packet")),
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(e) => panic!("recv failed: {e}"),
			}
		}
		out
	}

	fn send_data(&self, to: SocketAddr, block_id: u64, sequence_number: u32, symbol: Vec<u8>) {
		let packet = wire::Packet::Data(wire::Data { block_id, timestamp: 0, delay: 0, sequence_number, symbol }).encode();
		self.sock.send_to(&packet, to).expect("send data");
	}
}

/// Builds a `ReceiverConn` connected to `peer`, requesting `range` over a
/// resource of `resource_length` bytes. Returns the connection, its own
/// ephemeral socket address (so a `FakeSender` can address it), and the
/// inbox that `runtime::poll` fills with whatever datagrams arrive for it.
fn new_conn(peer: SocketAddr, range: (u64, u64), resource_length: u64) -> (ReceiverConn, SocketAddr, Inbox) {
	let unspecified = "127.0.0.1:0".parse().unwrap();
	let inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));
	let sink = inbox.clone();
	let fwd: Fwd<Vec<u8>> = Fwd::new(move |buf| sink.borrow_mut().push_back(buf));
	let socket = runtime::Socket::connect(unspecified, peer, fwd).expect("connect");
	let local = socket.local_addr().expect("local addr");
	let conn = ReceiverConn::new(Instant::now(), socket, false, range, RESOURCE_HASH, resource_length, 1_000_000);
	(conn, local, inbox)
}

/// Polls the thread's registered sockets once, pulling any datagrams
/// already queued for `conn` into its inbox, then decodes and feeds each
/// one to `conn.on_data` in arrival order. Returns the last `Decoded`, if
/// any symbol completed a block.
fn pump_data(conn: &mut ReceiverConn, inbox: &Inbox) -> Option<protocol::receiver::Decoded> {
	runtime::poll(Some(Duration::from_millis(200))).expect("poll");

	let mut last = None;
	while let Some(buf) = inbox.borrow_mut().pop_front() {
		let wire::Packet::Data(data) = wire::Packet::decode(&buf).expect("valid packet") else { panic!("expected Data") };
		if let Some(decoded) = conn.on_data(Instant::now(), data) {
			last = Some(decoded);
		}
	}
	last
}

#[test]
fn send_request_carries_the_requested_range() {
	let sender = FakeSender::new();
	let (mut conn, _local, _inbox) = new_conn(sender.addr(), (0, 4), 4 * fec::BLOCK_SIZE);

	conn.send_request(Instant::now());

	let packets = sender.drain();
	assert_eq!(packets.len(), 1);
	match &packets[0] {
		wire::Packet::RequestResource(req) => {
			assert_eq!(req.resource_hash, RESOURCE_HASH);
			assert_eq!(req.block_range_start, 0);
			assert_eq!(req.block_range_end, 4);
			assert!(!req.reverse);
		}
		other => panic!("expected RequestResource, got {other:?}"),
	}
}

#[test]
fn full_block_decodes_and_acks() {
	let sender = FakeSender::new();
	let data = vec![0x42u8; fec::BLOCK_SIZE as usize];
	let (mut conn, local, inbox) = new_conn(sender.addr(), (0, 1), data.len() as u64);

	let encoder = fec::Encoder::new(&data);
	for seq in 0..encoder.source_symbol_count() {
		sender.send_data(local, 0, seq, encoder.symbol(seq));
	}

	let decoded = pump_data(&mut conn, &inbox).expect("block should have decoded from a full set of source symbols");
	assert_eq!(decoded.block_id, 0);
	assert_eq!(decoded.bytes, data);
	assert_eq!(conn.state, ConnState::Established);

	let packets = sender.drain();
	assert!(matches!(packets.last(), Some(wire::Packet::AckBlock(a)) if a.block_id == 0));
}

#[test]
fn repeated_symbol_is_tolerated_without_acking_early() {
	let sender = FakeSender::new();
	let data = vec![0x7u8; fec::BLOCK_SIZE as usize];
	let (mut conn, local, inbox) = new_conn(sender.addr(), (0, 1), data.len() as u64);

	let encoder = fec::Encoder::new(&data);
	sender.send_data(local, 0, 0, encoder.symbol(0));
	sender.send_data(local, 0, 0, encoder.symbol(0));

	let decoded = pump_data(&mut conn, &inbox);
	assert!(decoded.is_none(), "a single distinct symbol repeated should never complete a 32-symbol block");
	assert!(sender.drain().iter().all(|p| !matches!(p, wire::Packet::AckBlock(_))));
}

#[test]
fn out_of_range_block_is_dropped() {
	let sender = FakeSender::new();
	let data = vec![1u8; fec::BLOCK_SIZE as usize];
	let (mut conn, local, inbox) = new_conn(sender.addr(), (5, 10), 10 * fec::BLOCK_SIZE);

	let encoder = fec::Encoder::new(&data);
	sender.send_data(local, 0, 0, encoder.symbol(0));

	let decoded = pump_data(&mut conn, &inbox);
	assert!(decoded.is_none());
	assert!(sender.drain().is_empty(), "a block outside the current range must not be acked or nacked");
}

#[test]
fn shrink_to_never_lets_start_pass_end() {
	let sender = FakeSender::new();
	let (mut conn, _local, _inbox) = new_conn(sender.addr(), (0, 10), 10 * fec::BLOCK_SIZE);

	conn.shrink_to(Instant::now(), 6, 4);

	assert!(conn.range_start <= conn.range_end);
	assert_eq!(conn.range_start, 6);
	assert_eq!(conn.range_end, 6);
}

#[test]
fn shrink_to_notifies_the_sender_once_established() {
	let sender = FakeSender::new();
	let data = vec![9u8; fec::BLOCK_SIZE as usize];
	let (mut conn, local, inbox) = new_conn(sender.addr(), (0, 10), 10 * fec::BLOCK_SIZE);

	// Establish the connection with one Data packet before shrinking.
	let encoder = fec::Encoder::new(&data);
	sender.send_data(local, 0, 0, encoder.symbol(0));
	pump_data(&mut conn, &inbox);
	assert_eq!(conn.state, ConnState::Established);
	sender.drain();

	conn.shrink_to(Instant::now(), 2, 8);

	let packets = sender.drain();
	match packets.last() {
		Some(wire::Packet::ShrinkRange(s)) => assert_eq!((s.range_start, s.range_end), (2, 8)),
		other => panic!("expected ShrinkRange, got {other:?}"),
	}
}

#[test]
fn retire_sends_opposite_range_ack_and_moves_to_completing() {
	let sender = FakeSender::new();
	let (mut conn, _local, _inbox) = new_conn(sender.addr(), (0, 4), 4 * fec::BLOCK_SIZE);
	conn.send_request(Instant::now());
	sender.drain();

	conn.retire();

	assert_eq!(conn.state, ConnState::Completing);
	let packets = sender.drain();
	match packets.last() {
		Some(wire::Packet::ShrinkRange(s)) => assert_eq!(s.range_start, s.range_end),
		other => panic!("expected a degenerate ShrinkRange, got {other:?}"),
	}

	// Retiring twice must not send a second packet (idempotent per §4.6).
	conn.retire();
	assert!(sender.drain().is_empty());
}

#[test]
fn on_error_unknown_resource_fails_the_connection() {
	let sender = FakeSender::new();
	let (mut conn, _local, _inbox) = new_conn(sender.addr(), (0, 4), 4 * fec::BLOCK_SIZE);

	conn.on_error(wire::ErrorCode::UnknownResource);

	assert_eq!(conn.state, ConnState::Failed);
}

#[test]
fn data_delay_produces_an_rtt_sample() {
	let sender = FakeSender::new();
	let data = vec![5u8; fec::BLOCK_SIZE as usize];
	let (mut conn, local, inbox) = new_conn(sender.addr(), (0, 1), data.len() as u64);

	conn.send_request(Instant::now());
	std::thread::sleep(Duration::from_millis(30));

	// The sender reports it sat on this Data for 5ms after receiving our
	// Request; the remainder of the ~30ms elapsed since we sent it is RTT.
	let encoder = fec::Encoder::new(&data);
	let packet = wire::Packet::Data(wire::Data { block_id: 0, timestamp: 0, delay: 5, sequence_number: 0, symbol: encoder.symbol(0) }).encode();
	sender.sock.send_to(&packet, local).expect("send data");

	pump_data(&mut conn, &inbox);

	let sample = conn.rtt.get().expect("a Data packet with a delay field should produce an RTT sample");
	assert!(sample >= Duration::from_millis(15) && sample <= Duration::from_millis(40), "unexpected RTT sample {sample:?}");
}
