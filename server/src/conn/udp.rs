//! UDP listener connection: vectored datagram I/O.
//!
//! One recvmmsg/sendmmsg vector per listener. The read and write vectors
//! share the per-slot source-address and ancillary-data storage, so a reply
//! is addressed (and sourced, via the echoed PKTINFO) exactly as the
//! request arrived. All referenced storage is heap-allocated and pinned by
//! the boxed slices, so the connection itself may move freely.

use std::io;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::SystemTime;

use crate::query::{EndCode, Query, Transport};

use super::{Flags, IoOutcome};

/// Room for one PKTINFO control block of either family.
const CONTROL_LEN: usize = 64;

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct ControlBuf([u8; CONTROL_LEN]);

pub struct UdpConn {
	pub sock: socket2::Socket,
	pub local: SocketAddr,
	pub flags: Flags,

	vec_len: usize,

	// Per-slot storage shared between the read and write vectors.
	names: Box<[libc::sockaddr_storage]>,
	controls: Box<[ControlBuf]>,

	read_iovecs: Box<[libc::iovec]>,
	read_msgs: Box<[libc::mmsghdr]>,
	write_iovecs: Box<[libc::iovec]>,
	write_msgs: Box<[libc::mmsghdr]>,
	/// Source query slot behind each staged write-vector entry.
	write_map: Box<[usize]>,

	pub queries: Box<[Query]>,

	/// Datagrams in the current batch.
	pub batch: usize,
	/// Staged and already-sent write-vector entries.
	write_count: usize,
	write_sent: usize,
}

// The vector headers hold raw pointers, but every one of them targets
// storage owned by this same struct; the whole object moves between
// threads only as a unit.
unsafe impl Send for UdpConn {}

impl UdpConn {
	#[must_use]
	pub fn new(sock: socket2::Socket, local: SocketAddr, vec_len: usize) -> Self {
		assert!(vec_len > 0);

		let mut queries: Box<[Query]> = (0..vec_len).map(|_| Query::new(Transport::Udp)).collect();

		let mut names = vec![unsafe { std::mem::zeroed::<libc::sockaddr_storage>() }; vec_len].into_boxed_slice();
		let mut controls = vec![ControlBuf([0; CONTROL_LEN]); vec_len].into_boxed_slice();

		let empty_iovec = libc::iovec {
			iov_base: std::ptr::null_mut(),
			iov_len: 0,
		};
		let mut read_iovecs = vec![empty_iovec; vec_len].into_boxed_slice();
		let write_iovecs = vec![empty_iovec; vec_len].into_boxed_slice();

		let mut read_msgs = vec![unsafe { std::mem::zeroed::<libc::mmsghdr>() }; vec_len].into_boxed_slice();
		let write_msgs = read_msgs.clone();
		let write_map = vec![0usize; vec_len].into_boxed_slice();

		for i in 0..vec_len {
			// One extra byte so a 513-byte read marks the datagram
			// oversized.
			read_iovecs[i].iov_base = queries[i].req.as_mut_ptr().cast();
			read_iovecs[i].iov_len = wire::MAX_UDP_MSG + 1;

			let hdr = &mut read_msgs[i].msg_hdr;
			hdr.msg_name = (&mut names[i] as *mut libc::sockaddr_storage).cast();
			hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
			hdr.msg_iov = &mut read_iovecs[i];
			hdr.msg_iovlen = 1;
			hdr.msg_control = controls[i].0.as_mut_ptr().cast();
			hdr.msg_controllen = CONTROL_LEN;
		}

		Self {
			sock,
			local,
			flags: Flags::default(),
			vec_len,
			names,
			controls,
			read_iovecs,
			read_msgs,
			write_iovecs,
			write_msgs,
			write_map,
			queries,
			batch: 0,
			write_count: 0,
			write_sent: 0,
		}
	}

	/// Receive up to the vector length of datagrams, resetting and filling
	/// one query slot per datagram.
	pub fn recv_batch(&mut self) -> IoOutcome {
		for msg in self.read_msgs.iter_mut() {
			msg.msg_hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
			msg.msg_hdr.msg_controllen = CONTROL_LEN;
			msg.msg_hdr.msg_flags = 0;
			msg.msg_len = 0;
		}

		let n = unsafe {
			libc::recvmmsg(
				self.sock.as_raw_fd(),
				self.read_msgs.as_mut_ptr(),
				self.vec_len as u32,
				0,
				std::ptr::null_mut(),
			)
		};

		if n < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::WouldBlock {
				return IoOutcome::WouldBlock;
			}
			log::warn!("recvmmsg on {}: {err}", self.local);
			return IoOutcome::Failed;
		}

		let n = n as usize;
		let now = SystemTime::now();

		for i in 0..n {
			let len = self.read_msgs[i].msg_len as usize;
			let client = sockaddr_to_std(&self.names[i]);

			let q = &mut self.queries[i];
			q.reset();
			q.req_len = len.min(q.req.len());
			q.recv_time = Some(now);
			q.client = client.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
			q.local = self.local;

			if len > wire::MAX_UDP_MSG {
				q.end_code = EndCode::TooLarge;
			}
		}

		self.batch = n;
		self.write_count = 0;
		self.write_sent = 0;

		IoOutcome::Progress(n)
	}

	/// Pull the destination address of datagram `i` out of its ancillary
	/// data and fix the control block up for the reply, so the response
	/// leaves from the address the request arrived on.
	pub fn reply_pktinfo(&mut self, i: usize) -> Option<IpAddr> {
		let hdr: *mut libc::msghdr = &mut self.read_msgs[i].msg_hdr;

		unsafe {
			let mut cmsg = libc::CMSG_FIRSTHDR(hdr);

			while !cmsg.is_null() {
				let c = &*cmsg;

				if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_PKTINFO {
					let pi = &mut *(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo);
					// The reply's source is taken from ipi_spec_dst.
					pi.ipi_spec_dst = pi.ipi_addr;
					return Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(pi.ipi_addr.s_addr))));
				}

				if c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_PKTINFO {
					let pi = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
					return Some(IpAddr::V6(Ipv6Addr::from(pi.ipi6_addr.s6_addr)));
				}

				cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
			}
		}

		None
	}

	/// Build the write vector from the batch's responding queries. Name and
	/// control storage is the read vector's, per slot.
	pub fn stage_writes(&mut self) -> usize {
		let mut staged = 0;

		for i in 0..self.batch {
			let (resp_ptr, resp_len) = {
				let q = &self.queries[i];
				if !q.end_code.responds() || q.resp_len == 0 {
					continue;
				}
				(q.resp.as_ptr() as *mut libc::c_void, q.resp_len)
			};

			self.write_iovecs[staged].iov_base = resp_ptr;
			self.write_iovecs[staged].iov_len = resp_len;

			let read_hdr = self.read_msgs[i].msg_hdr;
			let hdr = &mut self.write_msgs[staged].msg_hdr;
			hdr.msg_name = (&mut self.names[i] as *mut libc::sockaddr_storage).cast();
			hdr.msg_namelen = read_hdr.msg_namelen;
			hdr.msg_iov = &mut self.write_iovecs[staged];
			hdr.msg_iovlen = 1;
			hdr.msg_control = self.controls[i].0.as_mut_ptr().cast();
			hdr.msg_controllen = read_hdr.msg_controllen;
			hdr.msg_flags = 0;
			self.write_msgs[staged].msg_len = 0;

			self.write_map[staged] = i;
			staged += 1;
		}

		self.write_count = staged;
		self.write_sent = 0;
		staged
	}

	/// Send the staged vector from the current write index.
	pub fn send_batch(&mut self) -> IoOutcome {
		if self.send_done() {
			return IoOutcome::Progress(0);
		}

		let remaining = (self.write_count - self.write_sent) as u32;

		let n = unsafe {
			libc::sendmmsg(
				self.sock.as_raw_fd(),
				self.write_msgs[self.write_sent..].as_mut_ptr(),
				remaining,
				0,
			)
		};

		if n < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::WouldBlock {
				return IoOutcome::WouldBlock;
			}
			log::warn!("sendmmsg on {}: {err}", self.local);
			return IoOutcome::Failed;
		}

		let n = n as usize;
		let now = SystemTime::now();

		for slot in self.write_sent..self.write_sent + n {
			self.queries[self.write_map[slot]].send_time = Some(now);
		}

		self.write_sent += n;
		IoOutcome::Progress(n)
	}

	#[must_use]
	pub fn send_done(&self) -> bool {
		self.write_sent == self.write_count
	}

	/// Abandon whatever remains of the staged vector.
	pub fn abort_writes(&mut self) {
		self.write_sent = self.write_count;
	}
}

pub(crate) fn sockaddr_to_std(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
	match ss.ss_family as libc::c_int {
		libc::AF_INET => {
			let sin = unsafe { &*(ss as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
			let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
			Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
		}
		libc::AF_INET6 => {
			let sin6 = unsafe { &*(ss as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
			let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
			Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::listener;

	fn loopback_conn(vec_len: usize) -> UdpConn {
		let cfg = crate::config::Config {
			udp_listener_port: 0,
			..Default::default()
		};
		let (sock, local) = listener::udp(&cfg, false).unwrap();
		UdpConn::new(sock, local, vec_len)
	}

	#[test]
	fn empty_socket_would_block() {
		let mut conn = loopback_conn(4);
		assert_eq!(conn.recv_batch(), IoOutcome::WouldBlock);
	}

	fn loopback_of(conn: &UdpConn) -> std::net::SocketAddr {
		std::net::SocketAddr::from(([127, 0, 0, 1], conn.local.port()))
	}

	#[test]
	fn batch_receive_fills_slots_in_order() {
		let mut conn = loopback_conn(4);

		let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		client.send_to(b"first", loopback_of(&conn)).unwrap();
		client.send_to(b"second", loopback_of(&conn)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(30));

		assert_eq!(conn.recv_batch(), IoOutcome::Progress(2));
		assert_eq!(conn.batch, 2);
		assert_eq!(&conn.queries[0].req[..5], b"first");
		assert_eq!(conn.queries[0].req_len, 5);
		assert_eq!(&conn.queries[1].req[..6], b"second");
		assert_eq!(conn.queries[0].client, client.local_addr().unwrap());
		assert!(conn.queries[0].recv_time.is_some());
	}

	#[test]
	fn oversized_datagram_is_marked() {
		let mut conn = loopback_conn(2);

		let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		client.send_to(&[0u8; 513], loopback_of(&conn)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(30));

		assert_eq!(conn.recv_batch(), IoOutcome::Progress(1));
		assert_eq!(conn.queries[0].end_code, EndCode::TooLarge);
	}

	#[test]
	fn pktinfo_recovers_destination() {
		let mut conn = loopback_conn(1);

		let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		client.send_to(b"x", loopback_of(&conn)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(30));

		assert_eq!(conn.recv_batch(), IoOutcome::Progress(1));
		assert_eq!(conn.reply_pktinfo(0), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
	}

	#[test]
	fn replies_go_back_to_the_sender() {
		let mut conn = loopback_conn(2);

		let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		client.send_to(b"ping", loopback_of(&conn)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(30));

		assert_eq!(conn.recv_batch(), IoOutcome::Progress(1));
		let _ = conn.reply_pktinfo(0);

		{
			let q = &mut conn.queries[0];
			q.resp[..4].copy_from_slice(b"pong");
			q.resp_len = 4;
			q.end_code = EndCode::NoError;
		}

		assert_eq!(conn.stage_writes(), 1);
		assert_eq!(conn.send_batch(), IoOutcome::Progress(1));
		assert!(conn.send_done());
		assert!(conn.queries[0].send_time.is_some());

		client.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
		let mut buf = [0u8; 16];
		let (n, from) = client.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"pong");
		assert_eq!(from, loopback_of(&conn));
	}

	#[test]
	fn dropped_queries_are_not_staged() {
		let mut conn = loopback_conn(2);

		let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		client.send_to(&[0u8; 513], loopback_of(&conn)).unwrap();
		client.send_to(b"ok", loopback_of(&conn)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(30));

		assert_eq!(conn.recv_batch(), IoOutcome::Progress(2));

		{
			let q = &mut conn.queries[1];
			q.resp[..2].copy_from_slice(b"ok");
			q.resp_len = 2;
			q.end_code = EndCode::NoError;
		}

		// Slot 0 is oversized (no response); only slot 1 stages.
		assert_eq!(conn.stage_writes(), 1);
	}
}
