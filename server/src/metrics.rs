//! Process-wide counters.
//!
//! Every field is an independent monotonic counter; updates are relaxed
//! atomic adds and no invariant ties one field to another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
	#[inline]
	pub fn inc(&self) {
		self.0.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::Relaxed);
	}

	#[must_use]
	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

macro_rules! metrics {
	($($name:ident),* $(,)?) => {
		#[derive(Default)]
		pub struct Metrics {
			$(pub $name: Counter,)*
		}

		impl Metrics {
			/// Name/value pairs for logging.
			pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
				vec![$((stringify!($name), self.$name.get()),)*]
			}
		}
	};
}

metrics! {
	// Transport totals.
	conns_udp,
	conns_tcp,
	queries_udp,
	queries_tcp,

	// Response codes.
	queries_rcode_noerror,
	queries_rcode_formerr,
	queries_rcode_servfail,
	queries_rcode_nxdomain,
	queries_rcode_notimpl,
	queries_rcode_refused,
	queries_rcode_badvers,
	queries_rcode_short_header,
	queries_rcode_toolarge,
	queries_rcode_query_tc,

	// Question types.
	queries_type_a,
	queries_type_other,

	// EDNS observations.
	edns_present,
	edns_valid,
	edns_dnssec_ok,
	edns_client_subnet,

	// TCP connection outcomes.
	tcp_accept_err,
	tcp_conns_limit,
	tcp_closed_for_read,
	tcp_closed_for_write,
	tcp_read_err,
	tcp_write_err,
	tcp_assign_conn_id_err,
	tcp_query_size_toolarge,
	tcp_keepalive_timeout,
	query_recv_timeout,
	query_send_timeout,

	// Offload workers.
	app_log_open_error,
	app_log_write_error,
	query_log_open_error,
	query_log_write_error,
	query_log_buffer_overflow,
	resource_reload_error,
}

/// The process metrics instance.
pub fn metrics() -> &'static Metrics {
	static METRICS: OnceLock<Metrics> = OnceLock::new();
	METRICS.get_or_init(Metrics::default)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_accumulate() {
		let m = Metrics::default();
		m.queries_udp.inc();
		m.queries_udp.add(2);
		assert_eq!(m.queries_udp.get(), 3);
		assert_eq!(m.queries_tcp.get(), 0);
	}

	#[test]
	fn snapshot_names_fields() {
		let m = Metrics::default();
		m.resource_reload_error.inc();

		let snap = m.snapshot();
		let entry = snap.iter().find(|(n, _)| *n == "resource_reload_error").unwrap();
		assert_eq!(entry.1, 1);
	}
}
