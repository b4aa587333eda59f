//! Listener socket provisioning.
//!
//! Every shard binds its own listeners with SO_REUSEPORT; the kernel
//! spreads flows across shards by tuple hash. UDP sockets additionally
//! enable PKTINFO delivery so replies can be sourced from the address the
//! request arrived on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use utils::error::{OrLog, Result};

use crate::config::Config;

pub fn udp(cfg: &Config, v6: bool) -> Result<(Socket, SocketAddr)> {
	let sock = open(Type::DGRAM, Protocol::UDP, v6)?;

	sock.set_recv_buffer_size(cfg.udp_socket_recvbuff_size)
		.or_log(|err| log::error!("SO_RCVBUF: {err}"))?;
	sock.set_send_buffer_size(cfg.udp_socket_sendbuff_size)
		.or_log(|err| log::error!("SO_SNDBUF: {err}"))?;

	if v6 {
		sockopt_on(&sock, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, "IPV6_RECVPKTINFO")?;
	} else {
		sockopt_on(&sock, libc::IPPROTO_IP, libc::IP_PKTINFO, "IP_PKTINFO")?;
	}

	bind(sock, cfg.udp_listener_port, v6)
}

pub fn tcp(cfg: &Config, v6: bool) -> Result<(Socket, SocketAddr)> {
	let sock = open(Type::STREAM, Protocol::TCP, v6)?;

	let (sock, local) = bind(sock, cfg.tcp_listener_port, v6)?;

	sock.listen(cfg.tcp_listener_pending_conns_max as i32)
		.or_log(|err| log::error!("listen on {local}: {err}"))?;

	Ok((sock, local))
}

/// Options applied to every accepted TCP socket.
pub fn configure_accepted(cfg: &Config, sock: &Socket) -> Result {
	sock.set_nonblocking(true).or_log(|err| log::error!("accepted O_NONBLOCK: {err}"))?;
	sock.set_recv_buffer_size(cfg.tcp_conn_socket_recvbuff_size)
		.or_log(|err| log::error!("accepted SO_RCVBUF: {err}"))?;
	sock.set_send_buffer_size(cfg.tcp_conn_socket_sendbuff_size)
		.or_log(|err| log::error!("accepted SO_SNDBUF: {err}"))?;
	Ok(())
}

fn open(ty: Type, proto: Protocol, v6: bool) -> Result<Socket> {
	let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };

	let sock = Socket::new(domain, ty, Some(proto)).or_log(|err| log::error!("socket: {err}"))?;

	sock.set_nonblocking(true).or_log(|err| log::error!("O_NONBLOCK: {err}"))?;
	sock.set_reuse_address(true).or_log(|err| log::error!("SO_REUSEADDR: {err}"))?;
	sock.set_reuse_port(true).or_log(|err| log::error!("SO_REUSEPORT: {err}"))?;

	if v6 {
		sock.set_only_v6(true).or_log(|err| log::error!("IPV6_V6ONLY: {err}"))?;
	}

	Ok(sock)
}

fn bind(sock: Socket, port: u16, v6: bool) -> Result<(Socket, SocketAddr)> {
	let ip = if v6 {
		IpAddr::V6(Ipv6Addr::UNSPECIFIED)
	} else {
		IpAddr::V4(Ipv4Addr::UNSPECIFIED)
	};
	let addr = SocketAddr::new(ip, port);

	sock.bind(&addr.into()).or_log(|err| log::error!("bind {addr}: {err}"))?;

	let local = sock
		.local_addr()
		.or_log(|err| log::error!("local_addr: {err}"))?
		.as_socket()
		.ok_or(())?;

	Ok((sock, local))
}

fn sockopt_on(sock: &Socket, level: libc::c_int, opt: libc::c_int, what: &str) -> Result {
	let on: libc::c_int = 1;

	let rc = unsafe {
		libc::setsockopt(
			sock.as_raw_fd(),
			level,
			opt,
			(&on as *const libc::c_int).cast(),
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	};

	if rc != 0 {
		log::error!("{what}: {}", std::io::Error::last_os_error());
		return Err(());
	}

	Ok(())
}
