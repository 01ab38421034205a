//! The UDP socket multiplexer: bind, send, recv.
//!
//! This is the collaborator the protocol specification calls out of scope
//! and describes only as "the UDP socket multiplexer (bind, send, recv)".
//! It is implemented here in full, just not specified in depth: a single
//! `libc::poll` (or `WSAPoll` on Windows) call per runtime iteration
//! multiplexes every bound socket, exactly as `runtime::exec` multiplexes
//! it together with the `stakker` timer queue.
//!
//! Two socket shapes are exposed, matching the two ways the protocol binds
//! UDP ports (§5, §4.6):
//!
//! - [`Socket`]: a connected socket for one receiver-side connection to one
//!   server endpoint. The kernel already filters by peer address.
//! - [`Listener`]: an unconnected, bound socket for the sender, which must
//!   demultiplex inbound datagrams from many receivers by their source
//!   address.

use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use log::{error, warn};
use stakker::Fwd;
use utils::error::*;

/// Large enough for any datagram this protocol sends (§6: payload capped at
/// roughly 1,400 bytes); rounded up to a conventional read-buffer size.
const MAX_DATAGRAM: usize = 2048;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}

	pub fn new_poll(fd: RawFd) -> Poll {
		Poll { fd, events: POLLIN, revents: 0 }
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}

	pub fn new_poll(fd: RawFd) -> Poll {
		Poll { fd, events: POLLIN as _, revents: 0 }
	}
}

pub use sys::AsRawFd;
use sys::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

enum Entry {
	/// A connected socket serving one outbound receiver connection.
	Connected { sock: Rc<UdpSocket>, fwd: Fwd<Vec<u8>> },
	/// An unconnected, bound socket serving any number of remote peers.
	Listening { sock: Rc<UdpSocket>, fwd: Fwd<(SocketAddr, Vec<u8>)> },
}

impl Entry {
	fn raw(&self) -> RawFd {
		match self {
			Entry::Connected { sock, .. } => as_raw(sock.as_ref()),
			Entry::Listening { sock, .. } => as_raw(sock.as_ref()),
		}
	}

	/// Drain every pending datagram on this socket, dispatching each to its forward target.
	fn flush(&self) {
		let mut buf = [0u8; MAX_DATAGRAM];

		loop {
			match self {
				Entry::Connected { sock, fwd } => match sock.recv(&mut buf) {
					Ok(n) => fwd.fwd(buf[..n].to_vec()),
					Err(e) if e.kind() == ErrorKind::WouldBlock => break,
					Err(e) => {
						error!("Socket recv failed: {e}");
						break;
					}
				},
				Entry::Listening { sock, fwd } => match sock.recv_from(&mut buf) {
					Ok((n, addr)) => fwd.fwd((addr, buf[..n].to_vec())),
					Err(e) if e.kind() == ErrorKind::WouldBlock => break,
					Err(e) => {
						error!("Listener recv_from failed: {e}");
						break;
					}
				},
			}
		}
	}
}

#[derive(Default)]
struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

thread_local! {
	static GLOBAL: RefCell<State> = RefCell::new(State::default());
}

impl State {
	fn register(&mut self, entry: Entry) {
		self.fds.push(new_poll(entry.raw()));
		self.entries.push(entry);
	}

	fn deregister(&mut self, fd: RawFd) {
		if let Some(idx) = self.fds.iter().position(|p| p.fd == fd) {
			self.fds.swap_remove(idx);
			self.entries.swap_remove(idx);
		}
	}

	/// Returns whether any sockets are registered.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll every registered socket once. Returns whether any were ready.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		if self.fds.is_empty() {
			return Ok(false);
		}

		let ret = unsafe { poll(self.fds.as_mut_ptr(), self.fds.len() as _, as_timeout(timeout)) };

		if ret < 0 {
			error!("poll() failed: {}", std::io::Error::last_os_error());
			return Err(());
		}

		let mut pending = ret;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0..self.fds.len() {
			let revents = self.fds[idx].revents;

			if revents == 0 {
				continue;
			}

			if revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
				warn!("Socket at index {idx} reported an error condition; dropping its queued reads");
			} else if revents & POLLIN != 0 {
				self.entries[idx].flush();
			}

			self.fds[idx].revents = 0;

			pending -= 1;
			if pending <= 0 {
				break;
			}
		}

		Ok(true)
	}
}

/// Returns whether the multiplexer currently has any registered sockets.
pub fn is_io() -> bool {
	GLOBAL.with(|g| g.borrow().is_io())
}

/// Poll every registered socket once, dispatching ready reads. Called once
/// per `runtime::exec` loop iteration (see `runtime::rt`).
pub fn poll(timeout: Option<Duration>) -> Result<bool> {
	GLOBAL.with(|g| g.borrow_mut().poll(timeout))
}

/// A connected UDP socket: one receiver-side connection to one server endpoint (§4.5).
pub struct Socket {
	sock: Rc<UdpSocket>,
}

impl Socket {
	/// Bind an ephemeral local socket and connect it to `peer`. Inbound datagrams
	/// are forwarded to `on_recv` as they arrive.
	pub fn connect(local: SocketAddr, peer: SocketAddr, on_recv: Fwd<Vec<u8>>) -> std::io::Result<Self> {
		let udp = UdpSocket::bind(local)?;
		udp.set_nonblocking(true)?;
		udp.connect(peer)?;

		let sock = Rc::new(udp);

		GLOBAL.with(|g| {
			g.borrow_mut().register(Entry::Connected { sock: sock.clone(), fwd: on_recv });
		});

		Ok(Self { sock })
	}

	pub fn send(&self, buf: &[u8]) {
		if let Err(e) = self.sock.send(buf) {
			if e.kind() != ErrorKind::WouldBlock {
				warn!("Failed to send datagram: {e}");
			}
		}
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.sock.local_addr()
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		let fd = as_raw(self.sock.as_ref());
		GLOBAL.with(|g| g.borrow_mut().deregister(fd));
	}
}

/// An unconnected, bound UDP socket serving an arbitrary number of remote peers (§4.4, §4.6).
pub struct Listener {
	sock: Rc<UdpSocket>,
}

impl Listener {
	/// Bind to `addr`. Inbound datagrams are forwarded to `on_recv` tagged with their source address.
	pub fn bind(addr: SocketAddr, on_recv: Fwd<(SocketAddr, Vec<u8>)>) -> std::io::Result<Self> {
		let udp = UdpSocket::bind(addr)?;
		udp.set_nonblocking(true)?;

		let sock = Rc::new(udp);

		GLOBAL.with(|g| {
			g.borrow_mut().register(Entry::Listening { sock: sock.clone(), fwd: on_recv });
		});

		Ok(Self { sock })
	}

	pub fn send_to(&self, buf: &[u8], addr: SocketAddr) {
		if let Err(e) = self.sock.send_to(buf, addr) {
			if e.kind() != ErrorKind::WouldBlock {
				warn!("Failed to send datagram to {addr}: {e}");
			}
		}
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.sock.local_addr()
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		let fd = as_raw(self.sock.as_ref());
		GLOBAL.with(|g| g.borrow_mut().deregister(fd));
	}
}
