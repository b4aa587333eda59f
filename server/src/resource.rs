//! Read-only artifacts published to every shard.
//!
//! An artifact is immutable once built; shards hold it by `Arc` and swap
//! the reference at the control-channel barrier. The record file format is
//! deliberately small: one directive per line, `#` comments.
//!
//! ```text
//! answer-a 127.0.0.1
//! ns example.com. ns.example.com.
//! glue-a ns.example.com. 127.0.0.1
//! glue-aaaa ns.example.com. ::1
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use utils::error::{OrLog, Result};
use wire::rr::Record;

const DEFAULT_TTL: u32 = 60;

pub struct Resources {
	/// Template answer served for every supported question; the owner name
	/// written to the wire is always the question's.
	pub answer: Arc<Record>,
	/// The zone's nameserver record.
	pub authority: Arc<Record>,
	/// Address records for the nameserver.
	pub glue: Vec<Arc<Record>>,
}

impl Resources {
	/// The built-in record set: every query answers A 127.0.0.1 from
	/// ns.example.com.
	#[must_use]
	pub fn builtin() -> Self {
		Self {
			answer: Arc::new(Record::a("", DEFAULT_TTL, [127, 0, 0, 1])),
			authority: Arc::new(Record::ns("example.com.", DEFAULT_TTL, "ns.example.com.")),
			glue: vec![
				Arc::new(Record::a("ns.example.com.", DEFAULT_TTL, [127, 0, 0, 1])),
				Arc::new(Record::aaaa("ns.example.com.", DEFAULT_TTL, Ipv6Addr::LOCALHOST.octets())),
			],
		}
	}

	/// Load a record file, falling back to built-in fields it does not set.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).or_log(|err| log::error!("resource {}: {err}", path.display()))?;

		let mut rs = Self::builtin();
		rs.glue.clear();

		for (lineno, line) in text.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			parse_line(&mut rs, line).or_log(|()| {
				log::error!("resource {}: bad directive at line {}", path.display(), lineno + 1);
			})?;
		}

		if rs.glue.is_empty() {
			rs.glue = Self::builtin().glue;
		}

		Ok(rs)
	}
}

fn parse_line(rs: &mut Resources, line: &str) -> Result {
	let mut parts = line.split_ascii_whitespace();
	let directive = parts.next().ok_or(())?;

	match directive {
		"answer-a" => {
			let addr: Ipv4Addr = parts.next().ok_or(())?.parse().map_err(|_| ())?;
			rs.answer = Arc::new(Record::a("", DEFAULT_TTL, addr.octets()));
		}
		"ns" => {
			let zone = parts.next().ok_or(())?;
			let target = parts.next().ok_or(())?;
			if !zone.ends_with('.') || !target.ends_with('.') {
				return Err(());
			}
			rs.authority = Arc::new(Record::ns(zone, DEFAULT_TTL, target));
		}
		"glue-a" => {
			let name = parts.next().ok_or(())?;
			let addr: Ipv4Addr = parts.next().ok_or(())?.parse().map_err(|_| ())?;
			if !name.ends_with('.') {
				return Err(());
			}
			rs.glue.push(Arc::new(Record::a(name, DEFAULT_TTL, addr.octets())));
		}
		"glue-aaaa" => {
			let name = parts.next().ok_or(())?;
			let addr: Ipv6Addr = parts.next().ok_or(())?.parse().map_err(|_| ())?;
			if !name.ends_with('.') {
				return Err(());
			}
			rs.glue.push(Arc::new(Record::aaaa(name, DEFAULT_TTL, addr.octets())));
		}
		_ => return Err(()),
	}

	if parts.next().is_some() {
		return Err(());
	}

	Ok(())
}
