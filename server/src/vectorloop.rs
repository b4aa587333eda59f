//! The per-shard vectorloop.
//!
//! One strictly serial sweep per iteration: control channels, readiness,
//! reads, accepts, parse, resolve, pack, writes, query log, timeout scan,
//! release. Stages hand connections to each other through per-shard FIFO
//! queues of slab tokens; nothing in here blocks, and the only sleep is
//! the idle back-off at the bottom of an empty iteration.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collections::lru::LruSet;
use runtime::epoll::{Epoll, Ready};
use slab::Slab;

use crate::channel::{Ctrl, ShardChannels};
use crate::config::Config;
use crate::conn::tcp::WriteOutcome;
use crate::conn::{Conn, IoOutcome, TcpConn, TcpListenerConn, TcpState, Token, UdpConn};
use crate::metrics::metrics;
use crate::query::{EndCode, Query, Transport};
use crate::resolve::Resolver;
use crate::resource::Resources;
use crate::{listener, pack, parse, querylog};

pub struct Shard {
	id: usize,
	cfg: Arc<Config>,
	resolver: Arc<dyn Resolver>,
	resources: Arc<Resources>,
	stop: Arc<AtomicBool>,

	ep_udp: Epoll,
	ep_tcp: Epoll,
	ready: Vec<Ready>,

	conns: Slab<Conn>,
	/// Established TCP connections by id, recency-ordered for the timeout
	/// scan.
	lru: LruSet<Token>,
	id_base: u64,
	tcp_active: usize,

	q_udp_read: VecDeque<Token>,
	q_udp_write: VecDeque<Token>,
	q_tcp_accept: VecDeque<Token>,
	q_tcp_read: VecDeque<Token>,
	q_tcp_write: VecDeque<Token>,
	q_parse: VecDeque<Token>,
	q_resolve: VecDeque<Token>,
	q_pack: VecDeque<Token>,
	q_log: VecDeque<Token>,
	q_release: VecDeque<Token>,

	/// Active query-log slab; its twin is with the query-log worker.
	log_buf: Vec<u8>,
	scratch: String,
	tmp: String,
	expired: Vec<Token>,

	chans: ShardChannels,

	udp_addrs: Vec<SocketAddr>,
	tcp_addrs: Vec<SocketAddr>,

	/// Monotonic milliseconds, snapshotted at the top of each iteration.
	loop_ms: u64,
	work: usize,
	idle: u32,
}

impl Shard {
	pub fn new(
		id: usize,
		cfg: Arc<Config>,
		resolver: Arc<dyn Resolver>,
		resources: Arc<Resources>,
		chans: ShardChannels,
		stop: Arc<AtomicBool>,
	) -> utils::error::Result<Self> {
		let ep_udp = Epoll::new(cfg.epoll_num_events_udp)?;
		let ep_tcp = Epoll::new(cfg.epoll_num_events_tcp)?;

		let log_buf = Vec::with_capacity(cfg.query_log_buffer_size);

		let mut shard = Self {
			id,
			resolver,
			resources,
			stop,
			ep_udp,
			ep_tcp,
			ready: Vec::with_capacity(cfg.epoll_num_events_udp.max(cfg.epoll_num_events_tcp)),
			conns: Slab::new(),
			lru: LruSet::default(),
			id_base: rand::random(),
			tcp_active: 0,
			q_udp_read: VecDeque::new(),
			q_udp_write: VecDeque::new(),
			q_tcp_accept: VecDeque::new(),
			q_tcp_read: VecDeque::new(),
			q_tcp_write: VecDeque::new(),
			q_parse: VecDeque::new(),
			q_resolve: VecDeque::new(),
			q_pack: VecDeque::new(),
			q_log: VecDeque::new(),
			q_release: VecDeque::new(),
			log_buf,
			scratch: String::with_capacity(1024),
			tmp: String::with_capacity(256),
			expired: Vec::new(),
			chans,
			udp_addrs: Vec::new(),
			tcp_addrs: Vec::new(),
			loop_ms: 0,
			work: 0,
			idle: 0,
			cfg,
		};

		shard.bind_listeners()?;
		Ok(shard)
	}

	fn bind_listeners(&mut self) -> utils::error::Result {
		let cfg = self.cfg.clone();

		if cfg.udp_enable {
			for v6 in [false, true] {
				let bound = listener::udp(&cfg, v6);

				// A host without IPv6 still serves v4.
				let (sock, local) = match (bound, v6) {
					(Ok(ok), _) => ok,
					(Err(()), true) => {
						log::warn!("shard {}: no IPv6 UDP listener", self.id);
						continue;
					}
					(Err(()), false) => return Err(()),
				};

				let conn = UdpConn::new(sock, local, cfg.udp_conn_vector_len);
				let tok = self.conns.insert(Conn::UdpListener(conn));

				let Conn::UdpListener(u) = &mut self.conns[tok] else { unreachable!() };
				u.flags.waiting_read = true;

				self.ep_udp.register(u.sock.as_raw_fd(), tok as u64)?;
				self.udp_addrs.push(local);
				log::info!("shard {}: udp listener on {local}", self.id);
			}
		}

		if cfg.tcp_enable {
			for v6 in [false, true] {
				let bound = listener::tcp(&cfg, v6);

				let (sock, local) = match (bound, v6) {
					(Ok(ok), _) => ok,
					(Err(()), true) => {
						log::warn!("shard {}: no IPv6 TCP listener", self.id);
						continue;
					}
					(Err(()), false) => return Err(()),
				};

				let tok = self.conns.insert(Conn::TcpListener(TcpListenerConn {
					sock,
					local,
					flags: Default::default(),
				}));

				let Conn::TcpListener(l) = &mut self.conns[tok] else { unreachable!() };
				l.flags.waiting_read = true;

				self.ep_tcp.register(l.sock.as_raw_fd(), tok as u64)?;
				self.tcp_addrs.push(local);
				log::info!("shard {}: tcp listener on {local}", self.id);
			}
		}

		Ok(())
	}

	/// First bound UDP listener address (v4 first), for tests and logs.
	#[must_use]
	pub fn udp_addr(&self) -> Option<SocketAddr> {
		self.udp_addrs.first().copied()
	}

	#[must_use]
	pub fn tcp_addr(&self) -> Option<SocketAddr> {
		self.tcp_addrs.first().copied()
	}

	pub fn run(mut self) {
		if let Some(tx) = self.chans.applog.take() {
			runtime::logger::bind_thread(tx);
		}

		log::info!("shard {} running", self.id);

		while !runtime::shutdown_requested() && !self.stop.load(Ordering::Relaxed) {
			self.iteration();
			self.backoff();
		}

		self.teardown();
	}

	/// One full pipeline sweep.
	pub fn iteration(&mut self) {
		self.loop_ms = runtime::time::now_ms();
		self.work = 0;

		self.stage_ctrl();
		self.stage_ready_udp();
		self.stage_ready_tcp();
		self.stage_udp_read();
		self.stage_tcp_accept();
		self.stage_tcp_read();
		self.stage_parse();
		self.stage_resolve();
		self.stage_pack();
		self.stage_udp_write();
		self.stage_tcp_write();
		self.stage_querylog();
		self.stage_timeouts();
		self.stage_release();
	}

	// Stage 1: resource swaps and query-log flips.
	fn stage_ctrl(&mut self) {
		while let Some(msg) = self.chans.resource.rx.try_recv() {
			match msg {
				Ctrl::Resource(arc) => {
					// The old clone drops here; after the ack this shard
					// holds no reference to the prior artifact.
					self.resources = arc;

					if self.chans.resource.tx.send(Ctrl::ResourceAck).is_err() {
						log::error!("shard {}: resource ack channel full", self.id);
					}
					self.work += 1;
				}
				_ => log::warn!("shard {}: unexpected resource-channel message", self.id),
			}
		}

		while let Some(msg) = self.chans.querylog.rx.try_recv() {
			match msg {
				Ctrl::LogFlip(mut spare) => {
					spare.clear();
					let active = std::mem::replace(&mut self.log_buf, spare);

					if self.chans.querylog.tx.send(Ctrl::LogBuf(active)).is_err() {
						log::error!("shard {}: query-log reply channel full", self.id);
					}
					self.work += 1;
				}
				_ => log::warn!("shard {}: unexpected query-log-channel message", self.id),
			}
		}
	}

	// Stages 2 and 3: drain both readiness sets into the stage queues.
	fn stage_ready_udp(&mut self) {
		if self.ep_udp.poll().is_err() {
			return;
		}

		self.ready.clear();
		self.ready.extend(self.ep_udp.ready());

		for i in 0..self.ready.len() {
			let ev = self.ready[i];
			let tok = ev.token as Token;

			if !self.conns.contains(tok) {
				continue;
			}

			self.work += 1;

			let flags = self.conns[tok].flags_mut();

			if ev.readable && flags.waiting_read {
				flags.waiting_read = false;
				enqueue(&mut self.q_udp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
			}

			let flags = self.conns[tok].flags_mut();
			if ev.writable && flags.waiting_write {
				flags.waiting_write = false;
				enqueue(&mut self.q_udp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
			}
		}
	}

	fn stage_ready_tcp(&mut self) {
		if self.ep_tcp.poll().is_err() {
			return;
		}

		self.ready.clear();
		self.ready.extend(self.ep_tcp.ready());

		for i in 0..self.ready.len() {
			let ev = self.ready[i];
			let tok = ev.token as Token;

			if !self.conns.contains(tok) {
				continue;
			}

			self.work += 1;

			let is_listener = matches!(self.conns[tok], Conn::TcpListener(_));

			if is_listener {
				let flags = self.conns[tok].flags_mut();
				if ev.readable && flags.waiting_read {
					flags.waiting_read = false;
					enqueue(&mut self.q_tcp_accept, &mut self.conns[tok].flags_mut().in_read_q, tok);
				}
				continue;
			}

			let flags = self.conns[tok].flags_mut();
			if ev.readable && flags.waiting_read {
				flags.waiting_read = false;
				enqueue(&mut self.q_tcp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
			}

			let flags = self.conns[tok].flags_mut();
			if ev.writable && flags.waiting_write {
				flags.waiting_write = false;
				enqueue(&mut self.q_tcp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
			}
		}
	}

	// Stage 4: batched datagram receive.
	fn stage_udp_read(&mut self) {
		for _ in 0..self.q_udp_read.len() {
			let Some(tok) = self.q_udp_read.pop_front() else { break };
			self.conns[tok].flags_mut().in_read_q = false;

			let Conn::UdpListener(u) = &mut self.conns[tok] else { continue };

			match u.recv_batch() {
				IoOutcome::Progress(n) => {
					metrics().conns_udp.inc();
					self.work += n;
					self.q_parse.push_back(tok);
				}
				IoOutcome::WouldBlock => u.flags.waiting_read = true,
				IoOutcome::Closed | IoOutcome::Failed => {
					// UDP failures are logged and the listener keeps
					// serving.
					enqueue(&mut self.q_udp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
				}
			}
		}
	}

	// Stage 5: accept new TCP connections.
	fn stage_tcp_accept(&mut self) {
		for _ in 0..self.q_tcp_accept.len() {
			let Some(tok) = self.q_tcp_accept.pop_front() else { break };
			self.conns[tok].flags_mut().in_read_q = false;

			let mut accepted = 0usize;

			loop {
				if accepted >= self.cfg.tcp_listener_max_accept_new_conn {
					// More may be pending; take another pass next
					// iteration.
					enqueue(&mut self.q_tcp_accept, &mut self.conns[tok].flags_mut().in_read_q, tok);
					break;
				}

				if self.tcp_active >= self.cfg.tcp_conns_per_vl_max {
					metrics().tcp_conns_limit.inc();
					enqueue(&mut self.q_tcp_accept, &mut self.conns[tok].flags_mut().in_read_q, tok);
					break;
				}

				let Conn::TcpListener(l) = &mut self.conns[tok] else { break };

				let (sock, peer) = match l.sock.accept() {
					Ok((sock, peer)) => match peer.as_socket() {
						Some(peer) => (sock, peer),
						None => continue,
					},
					Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
						l.flags.waiting_read = true;
						break;
					}
					Err(err) => {
						log::warn!("shard {}: accept: {err}", self.id);
						metrics().tcp_accept_err.inc();
						break;
					}
				};

				let local = l.local;

				if listener::configure_accepted(&self.cfg, &sock).is_err() {
					metrics().tcp_accept_err.inc();
					continue;
				}

				let mut conn = TcpConn::new(sock, peer, local, self.cfg.tcp_conn_simultaneous_queries_count);

				let Some(id) = self.assign_conn_id() else {
					metrics().tcp_assign_conn_id_err.inc();
					// Dropping the socket closes it.
					continue;
				};

				conn.id = id;
				conn.state = TcpState::WaitForQueryData;
				conn.timeout_at = self.loop_ms + self.cfg.tcp_query_recv_timeout;
				conn.flags.waiting_read = true;

				let new_tok = self.conns.insert(Conn::Tcp(conn));

				let Conn::Tcp(t) = &mut self.conns[new_tok] else { unreachable!() };
				if self.ep_tcp.register(t.sock.as_raw_fd(), new_tok as u64).is_err() {
					metrics().tcp_accept_err.inc();
					self.conns.remove(new_tok);
					continue;
				}

				self.lru.insert(id, new_tok);
				self.tcp_active += 1;
				metrics().conns_tcp.inc();

				accepted += 1;
				self.work += 1;

				log::debug!("shard {}: accepted {peer} as conn {id}", self.id);
			}
		}
	}

	/// Scan forward from the id base for a free connection id (§ the LRU
	/// is keyed by id).
	fn assign_conn_id(&mut self) -> Option<u64> {
		let start = self.id_base;
		let mut candidate = start.wrapping_add(1);

		while candidate != start {
			if !self.lru.contains(candidate) {
				self.id_base = candidate;
				return Some(candidate);
			}
			candidate = candidate.wrapping_add(1);
		}

		None
	}

	// Stage 6: read and segment TCP frames.
	fn stage_tcp_read(&mut self) {
		for _ in 0..self.q_tcp_read.len() {
			let Some(tok) = self.q_tcp_read.pop_front() else { break };
			self.conns[tok].flags_mut().in_read_q = false;

			let recv_timeout = self.cfg.tcp_query_recv_timeout;
			let keepalive = self.cfg.tcp_keepalive;
			let loop_ms = self.loop_ms;

			let Conn::Tcp(t) = &mut self.conns[tok] else { continue };

			if t.state.terminal() {
				continue;
			}

			// Edge-triggered: until a read reports EAGAIN the socket is
			// not re-armed, so an undrained connection must stay queued.
			let mut drained = false;

			match t.read_some() {
				IoOutcome::Progress(n) => self.work += usize::from(n > 0),
				IoOutcome::WouldBlock => {
					t.flags.waiting_read = true;
					drained = true;
				}
				IoOutcome::Closed => {
					t.state = TcpState::ClosedForRead;
					enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
					continue;
				}
				IoOutcome::Failed => {
					t.state = TcpState::ReadErr;
					enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
					continue;
				}
			}

			let Conn::Tcp(t) = &mut self.conns[tok] else { unreachable!() };

			if t.pending > 0 {
				// Mid-round; the log stage re-queues us when it finishes.
				continue;
			}

			match t.segment() {
				Err(()) => {
					t.state = TcpState::QuerySizeTooLarge;
					enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
				}
				Ok(0) => {
					if t.buffered() == 0 {
						t.state = TcpState::WaitForQuery;
						t.timeout_at = loop_ms + keepalive;
					} else {
						t.state = TcpState::WaitForQueryData;
						t.timeout_at = loop_ms + recv_timeout;
					}

					if !drained {
						enqueue(&mut self.q_tcp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
					}
				}
				Ok(frames) => {
					self.work += frames;
					let id = t.id;
					self.q_parse.push_back(tok);
					self.lru.get(id);
				}
			}
		}
	}

	// Stage 7: parse every staged query; UDP also recovers the
	// destination address from the ancillary data.
	fn stage_parse(&mut self) {
		while let Some(tok) = self.q_parse.pop_front() {
			match &mut self.conns[tok] {
				Conn::UdpListener(u) => {
					for i in 0..u.batch {
						if let Some(ip) = u.reply_pktinfo(i) {
							let port = u.local.port();
							u.queries[i].local = SocketAddr::new(ip, port);
						}
						parse::parse_request(&mut u.queries[i]);
					}
					self.work += u.batch;
				}
				Conn::Tcp(t) => {
					for i in 0..t.pending {
						parse::parse_request(&mut t.queries[i]);
					}
					self.work += t.pending;
				}
				Conn::TcpListener(_) => continue,
			}

			self.q_resolve.push_back(tok);
		}
	}

	// Stage 8: run the resolver for still-undecided queries.
	fn stage_resolve(&mut self) {
		while let Some(tok) = self.q_resolve.pop_front() {
			let Self { conns, resolver, resources, .. } = self;

			let queries: &mut [Query] = match &mut conns[tok] {
				Conn::UdpListener(u) => &mut u.queries[..u.batch],
				Conn::Tcp(t) => {
					let n = t.pending;
					&mut t.queries[..n]
				}
				Conn::TcpListener(_) => continue,
			};

			for q in queries {
				if q.end_code == EndCode::Unknown {
					resolver.resolve(q, resources);
					self.work += 1;
				}
			}

			self.q_pack.push_back(tok);
		}
	}

	// Stage 9: serialize responses and stage the write vectors.
	fn stage_pack(&mut self) {
		while let Some(tok) = self.q_pack.pop_front() {
			match &mut self.conns[tok] {
				Conn::UdpListener(u) => {
					for i in 0..u.batch {
						if u.queries[i].end_code.responds() {
							pack::pack_response(&mut u.queries[i]);
							self.work += 1;
						}
					}

					if u.stage_writes() > 0 {
						enqueue(&mut self.q_udp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
					} else {
						self.q_log.push_back(tok);
					}
				}
				Conn::Tcp(t) => {
					for i in 0..t.pending {
						if t.queries[i].end_code.responds() {
							pack::pack_response(&mut t.queries[i]);
							self.work += 1;
						}
					}

					t.state = TcpState::WaitForWrite;
					t.timeout_at = self.loop_ms + self.cfg.tcp_query_send_timeout;
					enqueue(&mut self.q_tcp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
				}
				Conn::TcpListener(_) => {}
			}
		}
	}

	// Stage 10: vectored datagram send.
	fn stage_udp_write(&mut self) {
		for _ in 0..self.q_udp_write.len() {
			let Some(tok) = self.q_udp_write.pop_front() else { break };
			self.conns[tok].flags_mut().in_write_q = false;

			let Conn::UdpListener(u) = &mut self.conns[tok] else { continue };

			match u.send_batch() {
				IoOutcome::Progress(n) => {
					self.work += n;

					if u.send_done() {
						self.q_log.push_back(tok);
					} else {
						enqueue(&mut self.q_udp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
					}
				}
				IoOutcome::WouldBlock => u.flags.waiting_write = true,
				IoOutcome::Closed | IoOutcome::Failed => {
					// Batch abandoned; the queries still get logged.
					u.abort_writes();
					self.q_log.push_back(tok);
				}
			}
		}
	}

	// Stage 11: flush TCP responses and advance the state machine.
	fn stage_tcp_write(&mut self) {
		for _ in 0..self.q_tcp_write.len() {
			let Some(tok) = self.q_tcp_write.pop_front() else { break };
			self.conns[tok].flags_mut().in_write_q = false;

			let keepalive = self.cfg.tcp_keepalive;
			let recv_timeout = self.cfg.tcp_query_recv_timeout;
			let loop_ms = self.loop_ms;

			let Conn::Tcp(t) = &mut self.conns[tok] else { continue };

			if t.state.terminal() {
				continue;
			}

			match t.write_responses() {
				WriteOutcome::AllDone => {
					t.finish_round(loop_ms, keepalive, recv_timeout);
					let id = t.id;
					self.work += 1;
					self.q_log.push_back(tok);
					self.lru.get(id);
				}
				WriteOutcome::Partial => {
					self.work += 1;
					enqueue(&mut self.q_tcp_write, &mut self.conns[tok].flags_mut().in_write_q, tok);
				}
				WriteOutcome::WouldBlock => t.flags.waiting_write = true,
				WriteOutcome::Closed => {
					mark_unsent(&mut t.queries[..t.pending], EndCode::TcpWriteClose);
					t.state = TcpState::ClosedForWrite;
					self.q_log.push_back(tok);
					enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
				}
				WriteOutcome::Failed => {
					mark_unsent(&mut t.queries[..t.pending], EndCode::TcpWriteErr);
					t.state = TcpState::WriteErr;
					self.q_log.push_back(tok);
					enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
				}
			}
		}
	}

	// Stage 12: append query-log lines, count, and hand connections back
	// to the read side.
	fn stage_querylog(&mut self) {
		while let Some(tok) = self.q_log.pop_front() {
			let Self { conns, log_buf, scratch, tmp, .. } = self;

			match &mut conns[tok] {
				Conn::UdpListener(u) => {
					for i in 0..u.batch {
						let q = &u.queries[i];
						count_query(q);

						if !querylog::append(log_buf, scratch, tmp, q) {
							metrics().query_log_buffer_overflow.inc();
						}
					}
					u.batch = 0;

					enqueue(&mut self.q_udp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
				}
				Conn::Tcp(t) => {
					let n = t.take_pending();

					for i in 0..n {
						let q = &t.queries[i];
						count_query(q);

						if !querylog::append(log_buf, scratch, tmp, q) {
							metrics().query_log_buffer_overflow.inc();
						}
					}

					if !t.state.terminal() {
						enqueue(&mut self.q_tcp_read, &mut self.conns[tok].flags_mut().in_read_q, tok);
					}
				}
				Conn::TcpListener(_) => {}
			}
		}
	}

	// Stage 13: walk the LRU set from the cold end for expired
	// connections.
	fn stage_timeouts(&mut self) {
		let mut expired = std::mem::take(&mut self.expired);
		expired.clear();

		for (_, &tok) in self.lru.iter_oldest() {
			let Conn::Tcp(t) = &self.conns[tok] else { continue };

			if t.flags.in_release_q {
				continue;
			}

			if t.timeout_at < self.loop_ms {
				expired.push(tok);
			} else {
				break;
			}
		}

		for &tok in &expired {
			let Conn::Tcp(t) = &self.conns[tok] else { continue };

			match t.state {
				TcpState::WaitForQuery => metrics().tcp_keepalive_timeout.inc(),
				TcpState::WaitForQueryData => metrics().query_recv_timeout.inc(),
				TcpState::WaitForWrite => metrics().query_send_timeout.inc(),
				_ => {}
			}

			log::debug!("shard {}: conn {} timed out in {:?}", self.id, t.id, t.state);
			enqueue(&mut self.q_release, &mut self.conns[tok].flags_mut().in_release_q, tok);
		}

		self.expired = expired;
	}

	// Stage 14: tear down released connections.
	fn stage_release(&mut self) {
		while let Some(tok) = self.q_release.pop_front() {
			let Conn::Tcp(t) = &mut self.conns[tok] else {
				self.conns[tok].flags_mut().in_release_q = false;
				continue;
			};

			match t.state {
				TcpState::ClosedForRead => metrics().tcp_closed_for_read.inc(),
				TcpState::ClosedForWrite => metrics().tcp_closed_for_write.inc(),
				TcpState::ReadErr => metrics().tcp_read_err.inc(),
				TcpState::WriteErr => metrics().tcp_write_err.inc(),
				TcpState::QuerySizeTooLarge => metrics().tcp_query_size_toolarge.inc(),
				TcpState::AssignConnIdErr => metrics().tcp_assign_conn_id_err.inc(),
				_ => {}
			}

			let id = t.id;
			let fd = t.sock.as_raw_fd();
			let in_read = t.flags.in_read_q;
			let in_write = t.flags.in_write_q;

			self.ep_tcp.deregister(fd).ok();

			if in_read {
				self.q_tcp_read.retain(|&x| x != tok);
			}
			if in_write {
				self.q_tcp_write.retain(|&x| x != tok);
			}

			self.lru.remove(id);
			self.tcp_active -= 1;
			// Dropping the connection closes the socket.
			self.conns.remove(tok);

			log::debug!("shard {}: released conn {id}", self.id);
		}
	}

	/// Bounded sleep after an iteration that moved nothing through stages
	/// 1–11.
	fn backoff(&mut self) {
		if self.work != 0 {
			self.idle = 0;
			return;
		}

		self.idle = self.idle.saturating_add(1);

		let us = match self.idle {
			1..=7 => self.cfg.loop_slowdown_one,
			8..=15 => self.cfg.loop_slowdown_two,
			_ => self.cfg.loop_slowdown_three,
		};

		std::thread::sleep(Duration::from_micros(us));
	}

	fn teardown(&mut self) {
		// Give the query-log worker a short window to collect the final
		// flip before the channels die.
		for _ in 0..50 {
			self.stage_ctrl();
			std::thread::sleep(Duration::from_millis(4));
		}

		let released = self.tcp_active;
		self.conns.clear();
		self.lru = LruSet::default();

		log::info!("shard {} stopped ({released} tcp conns dropped)", self.id);
	}
}

/// Enqueue unless the membership flag says it is already there.
fn enqueue(queue: &mut VecDeque<Token>, flag: &mut bool, tok: Token) {
	if !*flag {
		*flag = true;
		queue.push_back(tok);
	}
}

/// Queries whose response never made it out lose their positive end code.
fn mark_unsent(queries: &mut [Query], code: EndCode) {
	for q in queries {
		if q.end_code.responds() && q.send_time.is_none() {
			q.end_code = code;
		}
	}
}

fn count_query(q: &Query) {
	let m = metrics();

	match q.transport {
		Transport::Udp => m.queries_udp.inc(),
		Transport::Tcp => m.queries_tcp.inc(),
	}

	match q.end_code {
		EndCode::Unknown => {}
		EndCode::ShortHeader => m.queries_rcode_short_header.inc(),
		EndCode::TooLarge => m.queries_rcode_toolarge.inc(),
		EndCode::QueryTc => m.queries_rcode_query_tc.inc(),
		EndCode::TcpWriteErr | EndCode::TcpWriteClose => {}
		EndCode::NoError => m.queries_rcode_noerror.inc(),
		EndCode::FormErr => m.queries_rcode_formerr.inc(),
		EndCode::ServFail => m.queries_rcode_servfail.inc(),
		EndCode::NxDomain => m.queries_rcode_nxdomain.inc(),
		EndCode::NotImpl => m.queries_rcode_notimpl.inc(),
		EndCode::Refused => m.queries_rcode_refused.inc(),
		EndCode::BadVers => m.queries_rcode_badvers.inc(),
	}

	if q.has_question() {
		if q.q_type == wire::rr::rtype::A {
			m.queries_type_a.inc();
		} else {
			m.queries_type_other.inc();
		}
	}

	if q.edns.present {
		m.edns_present.inc();
	}
	if q.edns.valid {
		m.edns_valid.inc();
	}
	if q.edns.present && q.edns.dnssec_ok {
		m.edns_dnssec_ok.inc();
	}
	if q.edns.client_subnet.valid {
		m.edns_client_subnet.inc();
	}
}
