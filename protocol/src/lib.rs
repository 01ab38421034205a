//! The CMB protocol engine: connection state machines, the rate governor,
//! and the resource store, independent of how a binary wires up sockets or
//! parses its command line (§3, §4).

pub mod backoff;
pub mod partitioner;
pub mod rate;
pub mod receiver;
pub mod sender;
pub mod store;

pub use partitioner::{Endpoint, Partitioner, SessionError};
pub use sender::Sender;
pub use store::{ReceiverSink, SenderStore};
