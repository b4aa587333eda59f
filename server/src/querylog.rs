//! Query-log line rendering and the per-shard slab.
//!
//! One JSON object per line, every value a string. Lines are composed into
//! a reusable scratch string and copied into the shard's active slab; a
//! line that would overflow the slab is dropped and counted. The slab never
//! grows; its capacity is the flip unit the worker writes to disk.

use core::fmt::Write as _;

use crate::query::{EndCode, Query};

/// Append one line for `q` into the active slab. Returns false when the
/// slab is out of room.
pub fn append(buf: &mut Vec<u8>, scratch: &mut String, tmp: &mut String, q: &Query) -> bool {
	scratch.clear();
	render(scratch, tmp, q);

	if buf.len() + scratch.len() > buf.capacity() {
		return false;
	}

	buf.extend_from_slice(scratch.as_bytes());
	true
}

fn render(out: &mut String, tmp: &mut String, q: &Query) {
	let _ = write!(
		out,
		"{{\"c_ip\":\"{}\",\"c_port\":\"{}\",\"l_ip\":\"{}\",\"l_port\":\"{}\"",
		q.client.ip(),
		q.client.port(),
		q.local.ip(),
		q.local.port()
	);

	if let Some(t) = q.recv_time {
		let _ = write!(out, ",\"recv_time\":\"{}\"", humantime::format_rfc3339_nanos(t));
	}

	if let Some(t) = q.send_time {
		let _ = write!(out, ",\"send_time\":\"{}\"", humantime::format_rfc3339_nanos(t));
	}

	// Early failures have no parsed question; the line ends at the
	// timestamps.
	if q.has_question() {
		let msg = q.request_msg();
		let _ = write!(
			out,
			",\"request\":{{\"rd\":\"{}\",\"tc\":\"{}\",\"opcode\":\"query\"",
			wire::header::rd(msg) as u8,
			wire::header::tc(msg) as u8
		);

		if q.edns.valid {
			let _ = write!(
				out,
				",\"edns\":{{\"resp_size\":\"{}\",\"ver\":\"{}\",\"do\":\"{}\"",
				q.edns.udp_size,
				q.edns.version,
				q.edns.dnssec_ok as u8
			);

			let cs = &q.edns.client_subnet;
			if cs.valid {
				out.push_str(",\"cs\":{\"ip\":\"");
				cs.ip_str(out);
				let _ = write!(out, "\",\"source\":\"{}\",\"scope\":\"{}\"}}", cs.source_mask, cs.scope_mask);
			}

			out.push('}');
		}

		out.push_str(",\"q_name\":\"");
		json_escape(out, &q.q_name);
		let _ = write!(
			out,
			"\",\"q_class\":\"{}\",\"q_type\":\"{}\"}}",
			wire::rr::class_str(q.q_class),
			wire::rr::type_str(q.q_type)
		);
	}

	if q.end_code == EndCode::NoError && !q.answers.is_empty() {
		out.push_str(",\"response\":{\"answer\":[");

		for (i, rec) in q.answers.iter().enumerate() {
			if i > 0 {
				out.push(',');
			}

			let owner = if rec.name.is_empty() { &q.q_name } else { &rec.name };

			out.push_str("{\"name\":\"");
			json_escape(out, owner);
			let _ = write!(
				out,
				"\",\"class\":\"{}\",\"type\":\"{}\",\"rdata\":\"",
				wire::rr::class_str(rec.class),
				wire::rr::type_str(rec.rtype)
			);

			tmp.clear();
			rec.rdata_str(tmp);
			json_escape(out, tmp);

			out.push_str("\"}");
		}

		out.push_str("]}");
	}

	out.push('}');
	out.push('\n');
}

fn json_escape(out: &mut String, s: &str) {
	for c in s.chars() {
		match c {
			'"' => out.push_str("\\\""),
			'\\' => out.push_str("\\\\"),
			c if (c as u32) < 0x20 => {
				let _ = write!(out, "\\u{:04x}", c as u32);
			}
			c => out.push(c),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::Transport;
	use crate::resolve::{Resolver, StaticResolver};
	use crate::resource::Resources;
	use std::time::SystemTime;

	fn line_for(q: &Query) -> String {
		let mut buf = Vec::with_capacity(4096);
		let mut scratch = String::new();
		let mut tmp = String::new();

		assert!(append(&mut buf, &mut scratch, &mut tmp, q));
		String::from_utf8(buf).unwrap()
	}

	fn parsed_query(extra: impl FnOnce(&mut Vec<u8>)) -> Query {
		let mut msg = vec![
			0x1f, 0xf9, 0x01, 0x20, 0, 1, 0, 0, 0, 0, 0, 0, 3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p',
			b'l', b'e', 3, b'c', b'o', b'm', 0, 0, 1, 0, 1,
		];
		extra(&mut msg);

		let mut q = Query::new(Transport::Udp);
		q.req[..msg.len()].copy_from_slice(&msg);
		q.req_len = msg.len();
		q.client = "192.0.2.9:1234".parse().unwrap();
		q.local = "127.0.0.1:53".parse().unwrap();
		q.recv_time = Some(SystemTime::UNIX_EPOCH);
		crate::parse::parse_request(&mut q);
		q
	}

	#[test]
	fn success_line_shape() {
		let mut q = parsed_query(|_| {});
		let rs = Resources::builtin();
		StaticResolver.resolve(&mut q, &rs);
		q.send_time = Some(SystemTime::UNIX_EPOCH);

		let line = line_for(&q);

		assert!(line.starts_with("{\"c_ip\":\"192.0.2.9\",\"c_port\":\"1234\",\"l_ip\":\"127.0.0.1\",\"l_port\":\"53\""));
		assert!(line.contains("\"recv_time\":\"1970-01-01T00:00:00.000000000Z\""));
		assert!(line.contains("\"send_time\":"));
		assert!(line.contains("\"request\":{\"rd\":\"1\",\"tc\":\"0\",\"opcode\":\"query\""));
		assert!(line.contains("\"q_name\":\"www.example.com.\",\"q_class\":\"IN\",\"q_type\":\"A\"}"));
		assert!(line.contains("\"response\":{\"answer\":[{\"name\":\"www.example.com.\""));
		assert!(line.contains("\"rdata\":\"127.0.0.1\""));
		assert!(line.ends_with("}\n"));
	}

	#[test]
	fn early_failure_line_is_bare() {
		let mut q = Query::new(Transport::Udp);
		q.client = "192.0.2.9:1234".parse().unwrap();
		q.local = "127.0.0.1:53".parse().unwrap();
		q.recv_time = Some(SystemTime::UNIX_EPOCH);
		q.req_len = 5;
		crate::parse::parse_request(&mut q);

		let line = line_for(&q);

		assert_eq!(q.end_code, EndCode::ShortHeader);
		assert!(!line.contains("\"request\""));
		assert!(!line.contains("\"response\""));
		assert!(!line.contains("\"send_time\""));
		assert!(line.ends_with("}\n"));
	}

	#[test]
	fn servfail_omits_response() {
		let mut q = parsed_query(|_| {});
		q.end_code = EndCode::ServFail;

		let line = line_for(&q);
		assert!(line.contains("\"request\""));
		assert!(!line.contains("\"response\""));
	}

	#[test]
	fn edns_and_subnet_render() {
		let ecs = [0u8, 8, 0, 7, 0, 1, 24, 0, 192, 0, 2];
		let mut q = parsed_query(|m| {
			m[11] = 1;
			m.push(0);
			m.extend_from_slice(&41u16.to_be_bytes());
			m.extend_from_slice(&1400u16.to_be_bytes());
			m.extend_from_slice(&[0, 0, 0x80, 0]);
			m.extend_from_slice(&(ecs.len() as u16).to_be_bytes());
			m.extend_from_slice(&ecs);
		});
		let rs = Resources::builtin();
		StaticResolver.resolve(&mut q, &rs);

		let line = line_for(&q);

		assert!(line.contains("\"edns\":{\"resp_size\":\"1400\",\"ver\":\"0\",\"do\":\"1\""));
		assert!(line.contains("\"cs\":{\"ip\":\"192.0.2.0\",\"source\":\"24\",\"scope\":\"0\"}"));
	}

	#[test]
	fn escaped_name_stays_valid_json() {
		let mut q = parsed_query(|_| {});
		q.q_name.clear();
		q.q_name.push_str("a\\.b.c.");

		let line = line_for(&q);
		assert!(line.contains("\"q_name\":\"a\\\\.b.c.\""));
	}

	#[test]
	fn overflowing_slab_drops_the_line() {
		let q = parsed_query(|_| {});

		let mut buf = Vec::with_capacity(16);
		let mut scratch = String::new();
		let mut tmp = String::new();

		assert!(!append(&mut buf, &mut scratch, &mut tmp, &q));
		assert!(buf.is_empty());
	}
}
