//! End-to-end scenarios against a live shard on loopback ports.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use server::channel::{self, ShardChannels};
use server::config::Config;
use server::metrics::metrics;
use server::resolve::StaticResolver;
use server::resource::Resources;
use server::vectorloop::Shard;
use utils::endian::get16;
use wire::header;

struct TestShard {
	udp: SocketAddr,
	tcp: SocketAddr,
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
	_worker_ends: (channel::Endpoint, channel::Endpoint),
}

impl TestShard {
	fn start(mut cfg: Config) -> Self {
		cfg.udp_listener_port = 0;
		cfg.tcp_listener_port = 0;

		let (shard_res, worker_res) = channel::pair();
		let (shard_qlog, worker_qlog) = channel::pair();
		let (app_tx, app_rx) = collections::spsc::channel(channel::APP_LOG_DEPTH);

		let chans = ShardChannels {
			resource: shard_res,
			querylog: shard_qlog,
			applog: Some(app_tx),
		};

		let stop = Arc::new(AtomicBool::new(false));

		let shard = Shard::new(
			0,
			Arc::new(cfg),
			Arc::new(StaticResolver),
			Arc::new(Resources::builtin()),
			chans,
			stop.clone(),
		)
		.expect("shard construction");

		// Listeners bind the wildcard; aim the clients at loopback.
		let udp = SocketAddr::from(([127, 0, 0, 1], shard.udp_addr().expect("udp listener").port()));
		let tcp = SocketAddr::from(([127, 0, 0, 1], shard.tcp_addr().expect("tcp listener").port()));

		let handle = std::thread::spawn(move || {
			let _keep = app_rx;
			shard.run();
		});

		Self {
			udp,
			tcp,
			stop,
			handle: Some(handle),
			_worker_ends: (worker_res, worker_qlog),
		}
	}
}

impl Drop for TestShard {
	fn drop(&mut self) {
		self.stop.store(true, Ordering::Relaxed);
		if let Some(h) = self.handle.take() {
			let _ = h.join();
		}
	}
}

fn udp_client() -> UdpSocket {
	let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
	sock.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
	sock
}

/// A IN www.example.com, rd set, id 0x1ff9.
const WWW_QUERY: &[u8] = &[
	0x1f, 0xf9, 0x01, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w', b'w', 0x07, b'e',
	b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
];

/// A IN ., rd set, id 0x43cf.
const ROOT_QUERY: &[u8] = &[
	0x43, 0xcf, 0x01, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01,
];

#[test]
fn udp_a_query() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();

	client.send_to(WWW_QUERY, shard.udp).unwrap();

	let mut buf = [0u8; 512];
	let (n, from) = client.recv_from(&mut buf).unwrap();
	let resp = &buf[..n];

	assert_eq!(from, shard.udp);
	assert_eq!(header::id(resp), 0x1ff9);
	assert!(header::qr(resp) && header::aa(resp) && header::rd(resp));
	assert!(!header::tc(resp));
	assert_eq!(header::opcode(resp), 0);
	assert_eq!(header::rcode(resp), 0);
	assert_eq!(header::qdcount(resp), 1);
	assert_eq!(header::ancount(resp), 1);
	assert_eq!(header::nscount(resp), 1);
	assert_eq!(header::arcount(resp), 2);

	// Question echoed verbatim.
	assert_eq!(&resp[12..33], &WWW_QUERY[12..33]);

	// Answer: owner compressed to the question name, A rdata 127.0.0.1.
	assert_eq!(get16(resp, 33), 0xc00c);
	assert_eq!(get16(resp, 35), 1);
	assert_eq!(get16(resp, 43), 4);
	assert_eq!(&resp[45..49], &[127, 0, 0, 1]);
}

#[test]
fn udp_root_query() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();

	client.send_to(ROOT_QUERY, shard.udp).unwrap();

	let mut buf = [0u8; 512];
	let (n, _) = client.recv_from(&mut buf).unwrap();
	let resp = &buf[..n];

	assert_eq!(header::id(resp), 0x43cf);
	assert_eq!(header::rcode(resp), 0);
	assert_eq!(header::ancount(resp), 1);

	// Root question: one zero octet, then type/class.
	assert_eq!(resp[12], 0);
	assert_eq!(get16(resp, 13), 1);

	// Answer owner is the root, rdata 127.0.0.1.
	assert_eq!(resp[17], 0);
	assert_eq!(&resp[28..32], &[127, 0, 0, 1]);
}

#[test]
fn udp_oversized_datagram_is_dropped() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();
	client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

	let before = metrics().queries_rcode_toolarge.get();

	// A would-be-valid header followed by padding to 513 bytes.
	let mut oversize = WWW_QUERY.to_vec();
	oversize.resize(513, 0);
	client.send_to(&oversize, shard.udp).unwrap();

	let mut buf = [0u8; 512];
	assert!(client.recv_from(&mut buf).is_err());

	// Give the shard time to log the drop.
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	while metrics().queries_rcode_toolarge.get() == before && std::time::Instant::now() < deadline {
		std::thread::sleep(Duration::from_millis(10));
	}
	assert!(metrics().queries_rcode_toolarge.get() > before);
}

#[test]
fn udp_edns_badvers() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();

	// The A query plus an OPT of version 1 advertising 4096.
	let mut query = WWW_QUERY.to_vec();
	query[11] = 1;
	query.extend_from_slice(&[0, 0, 41, 0x10, 0, 0, 1, 0, 0, 0, 0]);

	client.send_to(&query, shard.udp).unwrap();

	let mut buf = [0u8; 512];
	let (n, _) = client.recv_from(&mut buf).unwrap();
	let resp = &buf[..n];

	// BADVERS: header nibble 0, extended rcode 1 in the OPT, size forced
	// to 512, no answers.
	assert_eq!(header::rcode(resp), 0);
	assert_eq!(header::ancount(resp), 0);
	assert_eq!(header::arcount(resp), 1);

	let opt_at = n - 11;
	assert_eq!(resp[opt_at], 0);
	assert_eq!(get16(resp, opt_at + 1), 41);
	assert_eq!(get16(resp, opt_at + 3), 512);
	assert_eq!(resp[opt_at + 5], 1);
}

fn frame(msg: &[u8]) -> Vec<u8> {
	let mut out = (msg.len() as u16).to_be_bytes().to_vec();
	out.extend_from_slice(msg);
	out
}

fn read_response(stream: &mut TcpStream) -> Vec<u8> {
	let mut len = [0u8; 2];
	stream.read_exact(&mut len).unwrap();

	let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
	stream.read_exact(&mut body).unwrap();
	body
}

#[test]
fn tcp_pipelined_queries_answer_in_order() {
	let shard = TestShard::start(Config::default());

	let mut stream = TcpStream::connect(shard.tcp).unwrap();
	stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();

	// Two length-prefixed queries for different names in one segment.
	let mut second = WWW_QUERY.to_vec();
	second[0] = 0x2a;
	second[1] = 0x01;
	second[13..16].copy_from_slice(b"ns1");

	let mut bytes = frame(WWW_QUERY);
	bytes.extend_from_slice(&frame(&second));
	stream.write_all(&bytes).unwrap();

	let first_resp = read_response(&mut stream);
	let second_resp = read_response(&mut stream);

	assert_eq!(header::id(&first_resp), 0x1ff9);
	assert_eq!(header::id(&second_resp), 0x2a01);
	assert_eq!(header::ancount(&first_resp), 1);
	assert_eq!(header::ancount(&second_resp), 1);

	// The connection stays open for more queries.
	stream.write_all(&frame(ROOT_QUERY)).unwrap();
	let third = read_response(&mut stream);
	assert_eq!(header::id(&third), 0x43cf);
}

#[test]
fn tcp_partial_frame_times_out() {
	let mut cfg = Config::default();
	cfg.tcp_query_recv_timeout = 200;
	cfg.tcp_keepalive = 10_000;

	let shard = TestShard::start(cfg);
	let before = metrics().query_recv_timeout.get();

	let mut stream = TcpStream::connect(shard.tcp).unwrap();
	stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	// Announce 30 bytes, deliver 10, go silent.
	let mut partial = 30u16.to_be_bytes().to_vec();
	partial.extend_from_slice(&[0u8; 10]);
	stream.write_all(&partial).unwrap();

	// The shard releases the connection on expiry; the client sees EOF.
	let mut buf = [0u8; 16];
	let n = stream.read(&mut buf).unwrap();
	assert_eq!(n, 0);

	assert!(metrics().query_recv_timeout.get() > before);
}

#[test]
fn tcp_oversize_frame_closes_the_connection() {
	let shard = TestShard::start(Config::default());
	let before = metrics().tcp_query_size_toolarge.get();

	let mut stream = TcpStream::connect(shard.tcp).unwrap();
	stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	stream.write_all(&513u16.to_be_bytes()).unwrap();
	stream.write_all(&[0u8; 32]).unwrap();

	let mut buf = [0u8; 16];
	let n = stream.read(&mut buf).unwrap();
	assert_eq!(n, 0);

	assert!(metrics().tcp_query_size_toolarge.get() > before);
}

#[test]
fn resource_swap_is_acknowledged_and_served() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();

	// Publish a replacement artifact over the shard's resource channel.
	let mut next = Resources::builtin();
	next.answer = Arc::new(wire::rr::Record::a("", 60, [192, 0, 2, 99]));

	let res_end = &shard._worker_ends.0;
	res_end.tx.send(channel::Ctrl::Resource(Arc::new(next))).map_err(|_| ()).unwrap();

	// Barrier: the shard acknowledges after switching.
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	loop {
		match res_end.rx.try_recv() {
			Some(channel::Ctrl::ResourceAck) => break,
			Some(_) => panic!("unexpected reply"),
			None if std::time::Instant::now() > deadline => panic!("no ack"),
			None => std::thread::sleep(Duration::from_micros(50)),
		}
	}

	client.send_to(WWW_QUERY, shard.udp).unwrap();

	let mut buf = [0u8; 512];
	let (n, _) = client.recv_from(&mut buf).unwrap();
	let resp = &buf[..n];

	assert_eq!(&resp[45..49], &[192, 0, 2, 99]);
}

#[test]
fn query_log_flip_returns_lines() {
	let shard = TestShard::start(Config::default());
	let client = udp_client();

	client.send_to(WWW_QUERY, shard.udp).unwrap();
	let mut buf = [0u8; 512];
	client.recv_from(&mut buf).unwrap();

	// Flip: hand in a spare, get back the slab holding the logged line.
	let qlog_end = &shard._worker_ends.1;
	let spare = Vec::with_capacity(1 << 20);
	qlog_end.tx.send(channel::Ctrl::LogFlip(spare)).map_err(|_| ()).unwrap();

	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	let slab = loop {
		match qlog_end.rx.try_recv() {
			Some(channel::Ctrl::LogBuf(buf)) => break buf,
			Some(_) => panic!("unexpected reply"),
			None if std::time::Instant::now() > deadline => panic!("no flip reply"),
			None => std::thread::sleep(Duration::from_millis(1)),
		}
	};

	let text = String::from_utf8(slab).unwrap();
	let line = text.lines().find(|l| l.contains("www.example.com.")).expect("logged line");

	assert!(line.contains("\"q_type\":\"A\""));
	assert!(line.contains("\"response\""));
	assert!(line.ends_with("}"));
}
