//! Edge-triggered readiness set over epoll.
//!
//! Every registration is `EPOLLIN | EPOLLOUT | EPOLLET` with the caller's
//! token in the event user data; the consumer is expected to drain a socket
//! to `EAGAIN` before it re-arms. `poll` always uses a zero timeout, so a
//! vectorloop iteration never parks inside the kernel.

use std::io;
use std::os::fd::RawFd;

use utils::error::Result;

/// One readiness edge. Error/hangup conditions surface as both directions
/// ready so the owning stage discovers the failure on the next syscall.
#[derive(Clone, Copy, Debug)]
pub struct Ready {
	pub token: u64,
	pub readable: bool,
	pub writable: bool,
}

pub struct Epoll {
	fd: RawFd,
	events: Box<[libc::epoll_event]>,
	ready: usize,
}

impl Epoll {
	/// Create a set that reports at most `max_events` edges per poll.
	pub fn new(max_events: usize) -> Result<Self> {
		assert!(max_events > 0);

		let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

		if fd < 0 {
			log::error!("epoll_create1 failed: {}", io::Error::last_os_error());
			return Err(());
		}

		let events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events].into_boxed_slice();

		Ok(Self { fd, events, ready: 0 })
	}

	pub fn register(&self, fd: RawFd, token: u64) -> Result {
		let mut ev = libc::epoll_event {
			events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
			u64: token,
		};

		let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };

		if rc < 0 {
			log::error!("epoll_ctl(ADD) failed: {}", io::Error::last_os_error());
			return Err(());
		}

		Ok(())
	}

	pub fn deregister(&self, fd: RawFd) -> Result {
		let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, core::ptr::null_mut()) };

		if rc < 0 {
			log::error!("epoll_ctl(DEL) failed: {}", io::Error::last_os_error());
			return Err(());
		}

		Ok(())
	}

	/// Non-blocking drain of pending edges. Returns how many are buffered;
	/// read them with [`Self::ready`].
	pub fn poll(&mut self) -> Result<usize> {
		let rc = unsafe { libc::epoll_wait(self.fd, self.events.as_mut_ptr(), self.events.len() as i32, 0) };

		if rc < 0 {
			let err = io::Error::last_os_error();

			// A signal landing mid-wait is not a failure.
			if err.kind() == io::ErrorKind::Interrupted {
				self.ready = 0;
				return Ok(0);
			}

			log::error!("epoll_wait failed: {err}");
			return Err(());
		}

		self.ready = rc as usize;
		Ok(self.ready)
	}

	pub fn ready(&self) -> impl Iterator<Item = Ready> + '_ {
		self.events[..self.ready].iter().map(|ev| {
			let bits = ev.events as i32;
			let failed = bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0;

			Ready {
				token: ev.u64,
				readable: failed || bits & libc::EPOLLIN != 0,
				writable: failed || bits & libc::EPOLLOUT != 0,
			}
		})
	}
}

impl Drop for Epoll {
	fn drop(&mut self) {
		unsafe { libc::close(self.fd) };
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::fd::AsRawFd;

	#[test]
	fn edge_reports_on_arrival() {
		let listener = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		listener.set_nonblocking(true).unwrap();

		let mut ep = Epoll::new(8).unwrap();
		ep.register(listener.as_raw_fd(), 7).unwrap();

		// Nothing pending yet; a fresh socket reports only writability.
		ep.poll().unwrap();
		assert!(ep.ready().all(|r| r.token == 7 && !r.readable));

		let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		sender.send_to(b"x", listener.local_addr().unwrap()).unwrap();

		// Give the loopback a moment.
		std::thread::sleep(std::time::Duration::from_millis(20));

		ep.poll().unwrap();
		let edge = ep.ready().find(|r| r.readable).expect("readable edge");
		assert_eq!(edge.token, 7);

		ep.deregister(listener.as_raw_fd()).unwrap();
	}

	#[test]
	fn deregistered_fd_reports_nothing() {
		let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

		let mut ep = Epoll::new(4).unwrap();
		ep.register(sock.as_raw_fd(), 1).unwrap();
		ep.deregister(sock.as_raw_fd()).unwrap();

		let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		sender.send_to(b"x", sock.local_addr().unwrap()).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));

		ep.poll().unwrap();
		assert_eq!(ep.ready().count(), 0);
	}
}
