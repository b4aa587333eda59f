//! Connection objects owned by a shard.

pub mod tcp;
pub mod udp;

pub use tcp::{TcpConn, TcpState};
pub use udp::UdpConn;

/// Index of a connection in its shard's slab.
pub type Token = usize;

/// Queue membership and readiness-wait state. The flags make enqueueing
/// idempotent: a connection sits in at most one read queue, one write
/// queue, and one release queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
	pub in_read_q: bool,
	pub in_write_q: bool,
	pub in_release_q: bool,
	/// Set when the last read drained to EAGAIN; the next readable edge
	/// re-queues the connection.
	pub waiting_read: bool,
	pub waiting_write: bool,
}

/// Result of one non-blocking socket operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOutcome {
	/// Items (datagrams, bytes) moved.
	Progress(usize),
	/// EAGAIN: wait for the next readiness edge.
	WouldBlock,
	/// Orderly close by the peer.
	Closed,
	/// A real socket error, already logged.
	Failed,
}

/// A TCP listener: owns its socket; accepts produce established
/// connections.
pub struct TcpListenerConn {
	pub sock: socket2::Socket,
	pub local: std::net::SocketAddr,
	pub flags: Flags,
}

/// One connection slot in the shard's table.
pub enum Conn {
	UdpListener(UdpConn),
	TcpListener(TcpListenerConn),
	Tcp(TcpConn),
}

impl Conn {
	pub fn flags_mut(&mut self) -> &mut Flags {
		match self {
			Conn::UdpListener(c) => &mut c.flags,
			Conn::TcpListener(c) => &mut c.flags,
			Conn::Tcp(c) => &mut c.flags,
		}
	}

	#[must_use]
	pub fn flags(&self) -> &Flags {
		match self {
			Conn::UdpListener(c) => &c.flags,
			Conn::TcpListener(c) => &c.flags,
			Conn::Tcp(c) => &c.flags,
		}
	}
}
