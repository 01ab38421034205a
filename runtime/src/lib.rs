mod io;
mod rt;

pub mod logger;

pub use io::{is_io, poll, AsRawFd, Listener, Socket};
pub use rt::{exec, init};
