//! Runtime parameters.
//!
//! The value here is the contract: whoever builds a `Config` (defaults, a
//! file, flags) hands it over fully populated, and `validate` enforces the
//! documented ranges before anything binds a socket or spawns a thread.

use std::path::PathBuf;

use utils::error::Result;

#[derive(Clone, Debug)]
pub struct Config {
	pub udp_enable: bool,
	pub tcp_enable: bool,

	pub udp_listener_port: u16,
	pub tcp_listener_port: u16,

	/// UDP socket buffer sizes, bytes.
	pub udp_socket_recvbuff_size: usize,
	pub udp_socket_sendbuff_size: usize,

	/// Datagrams moved per recvmmsg/sendmmsg call.
	pub udp_conn_vector_len: usize,

	pub tcp_listener_pending_conns_max: u16,
	/// Accepts drained per loop iteration.
	pub tcp_listener_max_accept_new_conn: usize,

	pub tcp_conn_socket_recvbuff_size: usize,
	pub tcp_conn_socket_sendbuff_size: usize,

	/// Frames taken out of one TCP read pass.
	pub tcp_conn_simultaneous_queries_count: usize,

	/// Milliseconds.
	pub tcp_keepalive: u64,
	pub tcp_query_recv_timeout: u64,
	pub tcp_query_send_timeout: u64,

	/// Established connections per shard.
	pub tcp_conns_per_vl_max: usize,

	pub epoll_num_events_udp: usize,
	pub epoll_num_events_tcp: usize,

	/// Shard count.
	pub process_thread_count: usize,
	/// 1-based CPU id per shard; empty leaves shards unpinned.
	pub process_thread_masks: Vec<usize>,

	/// Idle back-off tiers, microseconds.
	pub loop_slowdown_one: u64,
	pub loop_slowdown_two: u64,
	pub loop_slowdown_three: u64,

	pub app_log_path: PathBuf,
	pub app_log_name: String,

	/// Bytes per query-log slab (each shard owns two).
	pub query_log_buffer_size: usize,
	pub query_log_path: PathBuf,
	pub query_log_base_name: String,
	pub query_log_rotate_size: u64,

	/// Records file; absent means the built-in set.
	pub resource_records_path: Option<PathBuf>,
	/// Seconds between resource change checks.
	pub resource_check_interval: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			udp_enable: true,
			tcp_enable: true,
			udp_listener_port: 53,
			tcp_listener_port: 53,
			udp_socket_recvbuff_size: 1 << 20,
			udp_socket_sendbuff_size: 1 << 20,
			udp_conn_vector_len: 8,
			tcp_listener_pending_conns_max: 1024,
			tcp_listener_max_accept_new_conn: 64,
			tcp_conn_socket_recvbuff_size: 64 << 10,
			tcp_conn_socket_sendbuff_size: 64 << 10,
			tcp_conn_simultaneous_queries_count: 10,
			tcp_keepalive: 60_000,
			tcp_query_recv_timeout: 5_000,
			tcp_query_send_timeout: 5_000,
			tcp_conns_per_vl_max: 4096,
			epoll_num_events_udp: 64,
			epoll_num_events_tcp: 64,
			process_thread_count: 2,
			process_thread_masks: Vec::new(),
			loop_slowdown_one: 10,
			loop_slowdown_two: 100,
			loop_slowdown_three: 500,
			app_log_path: PathBuf::from("."),
			app_log_name: "dnsd.log".into(),
			query_log_buffer_size: 1 << 20,
			query_log_path: PathBuf::from("."),
			query_log_base_name: "query.log".into(),
			query_log_rotate_size: 100 << 20,
			resource_records_path: None,
			resource_check_interval: 10,
		}
	}
}

impl Config {
	pub fn validate(&self) -> Result {
		let mut ok = true;

		let mut check = |cond: bool, what: &str| {
			if !cond {
				log::error!("config: {what}");
				ok = false;
			}
		};

		check(self.udp_enable || self.tcp_enable, "at least one listener family must be enabled");
		check(self.udp_listener_port >= 1, "udp_listener_port must be 1..=65535");
		check(self.tcp_listener_port >= 1, "tcp_listener_port must be 1..=65535");

		check(
			(518..=0xff_ffff).contains(&self.udp_socket_recvbuff_size),
			"udp_socket_recvbuff_size must be 518..=16777215",
		);
		check(
			(512..=0xff_ffff).contains(&self.udp_socket_sendbuff_size),
			"udp_socket_sendbuff_size must be 512..=16777215",
		);

		check((1..=65535).contains(&self.udp_conn_vector_len), "udp_conn_vector_len must be 1..=65535");
		check(self.tcp_listener_pending_conns_max >= 1, "tcp_listener_pending_conns_max must be 1..=65535");
		check(
			(1..=1024).contains(&self.tcp_listener_max_accept_new_conn),
			"tcp_listener_max_accept_new_conn must be 1..=1024",
		);
		check(
			(1..=255).contains(&self.tcp_conn_simultaneous_queries_count),
			"tcp_conn_simultaneous_queries_count must be 1..=255",
		);

		check((1_000..=600_000).contains(&self.tcp_keepalive), "tcp_keepalive must be 1000..=600000 ms");
		check(
			(1_000..=600_000).contains(&self.tcp_query_recv_timeout),
			"tcp_query_recv_timeout must be 1000..=600000 ms",
		);
		check(
			(1_000..=600_000).contains(&self.tcp_query_send_timeout),
			"tcp_query_send_timeout must be 1000..=600000 ms",
		);

		check(self.tcp_conns_per_vl_max >= 1, "tcp_conns_per_vl_max must be at least 1");

		check((3..=1024).contains(&self.epoll_num_events_udp), "epoll_num_events_udp must be 3..=1024");
		check((3..=1024).contains(&self.epoll_num_events_tcp), "epoll_num_events_tcp must be 3..=1024");

		check((1..=1024).contains(&self.process_thread_count), "process_thread_count must be 1..=1024");
		check(
			self.process_thread_masks.is_empty() || self.process_thread_masks.len() == self.process_thread_count,
			"process_thread_masks must list one CPU per shard",
		);
		check(
			self.process_thread_masks.iter().all(|&m| m >= 1),
			"process_thread_masks entries are 1-based CPU ids",
		);

		for (v, what) in [
			(self.loop_slowdown_one, "loop_slowdown_one"),
			(self.loop_slowdown_two, "loop_slowdown_two"),
			(self.loop_slowdown_three, "loop_slowdown_three"),
		] {
			check((1..=10_000).contains(&v), &format!("{what} must be 1..=10000 us"));
		}

		check(self.query_log_buffer_size >= 1024, "query_log_buffer_size must be at least 1024");
		check(self.query_log_rotate_size >= 1024, "query_log_rotate_size must be at least 1024");
		check(self.resource_check_interval >= 1, "resource_check_interval must be at least 1 s");

		if ok {
			Ok(())
		} else {
			Err(())
		}
	}
}
