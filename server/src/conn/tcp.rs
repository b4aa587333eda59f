//! Established TCP connection: length-prefixed framing and the
//! wait/read/write state machine.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::SystemTime;

use utils::endian::get16;

use crate::query::{Query, Transport};

use super::{Flags, IoOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
	/// A frame has started (or just been accepted); the rest should arrive
	/// within the receive timeout.
	WaitForQueryData,
	/// Idle between queries; the keepalive clock runs.
	WaitForQuery,
	/// Responses not fully flushed; the send-timeout clock runs.
	WaitForWrite,

	// Terminal states; the connection is released.
	ClosedForRead,
	ClosedForWrite,
	ReadErr,
	WriteErr,
	AssignConnIdErr,
	QuerySizeTooLarge,
}

impl TcpState {
	#[must_use]
	pub fn terminal(self) -> bool {
		!matches!(self, TcpState::WaitForQueryData | TcpState::WaitForQuery | TcpState::WaitForWrite)
	}
}

/// Outcome of flushing the staged responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
	/// Every response fully written.
	AllDone,
	/// Positive but short write; stay in the write queue.
	Partial,
	WouldBlock,
	Closed,
	Failed,
}

pub struct TcpConn {
	pub sock: socket2::Socket,
	pub peer: SocketAddr,
	pub local: SocketAddr,
	pub flags: Flags,

	/// Shard-unique connection id, the LRU key.
	pub id: u64,
	pub state: TcpState,
	/// Deadline in loop-clock milliseconds; which clock it is depends on
	/// the state.
	pub timeout_at: u64,

	read_buf: Vec<u8>,
	read_len: usize,
	/// Bytes of `read_buf` claimed by the staged queries, compacted away
	/// once the round's writes finish.
	consumed: usize,

	pub queries: Box<[Query]>,
	/// Frames staged by the last segmentation pass.
	pub pending: usize,

	write_q: usize,
	write_off: usize,
}

impl TcpConn {
	#[must_use]
	pub fn new(sock: socket2::Socket, peer: SocketAddr, local: SocketAddr, simultaneous: usize) -> Self {
		assert!(simultaneous > 0);

		Self {
			sock,
			peer,
			local,
			flags: Flags::default(),
			id: 0,
			state: TcpState::WaitForQueryData,
			timeout_at: 0,
			read_buf: vec![0; simultaneous * (2 + wire::MAX_UDP_MSG)],
			read_len: 0,
			consumed: 0,
			queries: (0..simultaneous).map(|_| Query::new(Transport::Tcp)).collect(),
			pending: 0,
			write_q: 0,
			write_off: 0,
		}
	}

	#[must_use]
	pub fn buffered(&self) -> usize {
		self.read_len
	}

	/// One non-blocking read into the buffer.
	pub fn read_some(&mut self) -> IoOutcome {
		if self.read_len == self.read_buf.len() {
			// No room until staged frames drain.
			return IoOutcome::Progress(0);
		}

		let spare = &mut self.read_buf[self.read_len..];

		let n = unsafe { libc::read(self.sock.as_raw_fd(), spare.as_mut_ptr().cast(), spare.len()) };

		if n < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::WouldBlock {
				return IoOutcome::WouldBlock;
			}
			log::debug!("read from {}: {err}", self.peer);
			return IoOutcome::Failed;
		}

		if n == 0 {
			return IoOutcome::Closed;
		}

		self.read_len += n as usize;
		IoOutcome::Progress(n as usize)
	}

	/// Carve complete frames off the front of the buffer into query slots,
	/// up to the simultaneous-queries cap. Leftover bytes stay buffered for
	/// the next round. `Err` means a frame advertised more than 512 bytes.
	pub fn segment(&mut self) -> Result<usize, ()> {
		debug_assert_eq!(self.pending, 0);

		let mut off = 0;
		let mut frames = 0;
		let now = SystemTime::now();

		while frames < self.queries.len() && self.read_len - off >= 2 {
			let flen = get16(&self.read_buf, off) as usize;

			if flen > wire::MAX_UDP_MSG {
				return Err(());
			}

			if self.read_len - off < 2 + flen {
				break;
			}

			let q = &mut self.queries[frames];
			q.reset();
			q.req[..2 + flen].copy_from_slice(&self.read_buf[off..off + 2 + flen]);
			q.req_len = 2 + flen;
			q.recv_time = Some(now);
			q.client = self.peer;
			q.local = self.local;

			off += 2 + flen;
			frames += 1;
		}

		self.pending = frames;
		self.consumed = off;
		Ok(frames)
	}

	/// Flush staged responses in arrival order. Queries that produced no
	/// response contribute no bytes.
	pub fn write_responses(&mut self) -> WriteOutcome {
		while self.write_q < self.pending {
			let (ptr, remaining, resp_len) = {
				let q = &self.queries[self.write_q];
				if !q.end_code.responds() || q.resp_len == 0 {
					self.write_q += 1;
					continue;
				}
				(unsafe { q.resp.as_ptr().add(self.write_off) }, q.resp_len - self.write_off, q.resp_len)
			};

			let n = unsafe { libc::write(self.sock.as_raw_fd(), ptr.cast(), remaining) };

			if n < 0 {
				let err = io::Error::last_os_error();
				if err.kind() == io::ErrorKind::WouldBlock {
					return WriteOutcome::WouldBlock;
				}
				log::debug!("write to {}: {err}", self.peer);
				return WriteOutcome::Failed;
			}

			if n == 0 {
				return WriteOutcome::Closed;
			}

			self.write_off += n as usize;

			if self.write_off == resp_len {
				self.queries[self.write_q].send_time = Some(SystemTime::now());
				self.write_q += 1;
				self.write_off = 0;
			} else {
				return WriteOutcome::Partial;
			}
		}

		WriteOutcome::AllDone
	}

	/// After the round's writes complete: compact leftover bytes to the
	/// front and pick the next wait state. The staged queries stay visible
	/// for the query-log stage.
	pub fn finish_round(&mut self, now_ms: u64, keepalive_ms: u64, recv_timeout_ms: u64) {
		if self.consumed < self.read_len {
			self.read_buf.copy_within(self.consumed..self.read_len, 0);
		}
		self.read_len -= self.consumed;
		self.consumed = 0;
		self.write_q = 0;
		self.write_off = 0;

		if self.read_len > 0 {
			self.state = TcpState::WaitForQueryData;
			self.timeout_at = now_ms + recv_timeout_ms;
		} else {
			self.state = TcpState::WaitForQuery;
			self.timeout_at = now_ms + keepalive_ms;
		}
	}

	/// Hand the round's query count to the log stage and close the round.
	pub fn take_pending(&mut self) -> usize {
		let n = self.pending;
		self.pending = 0;
		n
	}
}
