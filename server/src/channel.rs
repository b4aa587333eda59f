//! Inter-thread message kinds and channel wiring.
//!
//! A control conversation is strictly request/response, so each direction
//! is a bounded SPSC ring of capacity 2. The application-log path is
//! one-way with a deep ring; a full ring drops the record.

use std::sync::Arc;

use collections::spsc::{self, Receiver, Sender};
use runtime::logger::LogMsg;

use crate::resource::Resources;

/// Control messages between a shard and its workers. Ownership of any
/// payload moves to the receiver.
pub enum Ctrl {
	/// A freshly loaded artifact for the shard to switch to.
	Resource(Arc<Resources>),
	/// The shard switched and dropped its old reference.
	ResourceAck,
	/// Flip request; carries the drained spare slab that becomes the
	/// shard's next active buffer.
	LogFlip(Vec<u8>),
	/// The surrendered slab, with its written length.
	LogBuf(Vec<u8>),
}

/// One side of a bidirectional control channel.
pub struct Endpoint {
	pub tx: Sender<Ctrl>,
	pub rx: Receiver<Ctrl>,
}

/// Build both ends of a control channel.
#[must_use]
pub fn pair() -> (Endpoint, Endpoint) {
	let (a_tx, a_rx) = spsc::channel(2);
	let (b_tx, b_rx) = spsc::channel(2);

	(Endpoint { tx: a_tx, rx: b_rx }, Endpoint { tx: b_tx, rx: a_rx })
}

/// Application-log channel depth.
pub const APP_LOG_DEPTH: usize = 1024;

/// Everything a shard needs to talk to the three workers. The
/// application-log producer is taken by the shard thread at startup and
/// installed as its logger sink.
pub struct ShardChannels {
	pub resource: Endpoint,
	pub querylog: Endpoint,
	pub applog: Option<Sender<LogMsg>>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let (shard, worker) = pair();

		assert!(worker.tx.send(Ctrl::LogFlip(Vec::new())).is_ok());

		match shard.rx.try_recv() {
			Some(Ctrl::LogFlip(buf)) => assert!(buf.is_empty()),
			_ => panic!("expected flip"),
		}

		assert!(shard.tx.send(Ctrl::LogBuf(vec![1, 2, 3])).is_ok());

		match worker.rx.try_recv() {
			Some(Ctrl::LogBuf(buf)) => assert_eq!(buf, [1, 2, 3]),
			_ => panic!("expected buffer"),
		}
	}

	#[test]
	fn one_outstanding_transaction_fits() {
		let (_shard, worker) = pair();

		assert!(worker.tx.send(Ctrl::LogFlip(Vec::new())).is_ok());
		assert!(worker.tx.send(Ctrl::LogFlip(Vec::new())).is_ok());
		// The ring holds the request/response window; a third is refused.
		assert!(worker.tx.send(Ctrl::LogFlip(Vec::new())).is_err());
	}
}
