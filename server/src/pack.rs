//! Response serialization.
//!
//! The header is always finalized, even when a section runs out of room;
//! running out of room sets TC and stops section packing. Answer-section
//! owners are the question's name; authority and additional records carry
//! their own owners. The OPT pseudo-RR goes last.

use utils::endian::put16;
use wire::{edns, header, name, opcode, rr, Error};

use crate::query::{Query, Transport};

pub fn pack_response(q: &mut Query) {
	debug_assert!(q.end_code.responds());

	let base = q.transport.base();
	let rcode = q.end_code.rcode();

	// UDP replies honor the advertised (clamped) EDNS size, 512 without
	// EDNS; TCP replies use the whole response buffer.
	let limit = match q.transport {
		Transport::Udp if q.edns.valid => base + q.edns.udp_size as usize,
		Transport::Udp => base + wire::MAX_UDP_MSG,
		Transport::Tcp => q.resp.len(),
	};
	let limit = limit.min(q.resp.len());

	let req = q.request_msg();
	let req_id = header::id(req);
	let req_rd = header::rd(req);

	let buf = &mut q.resp[..limit];

	buf[base..base + wire::HEADER_LEN].fill(0);
	header::set_id(&mut buf[base..], req_id);
	header::set_qr(&mut buf[base..], true);
	header::set_aa(&mut buf[base..], true);
	header::set_opcode(&mut buf[base..], opcode::QUERY);
	header::set_rd(&mut buf[base..], req_rd);
	header::set_rcode(&mut buf[base..], (rcode & 0x0f) as u8);

	q.table.reset(base);

	let mut pos = base + wire::HEADER_LEN;
	let mut truncated = false;

	// Echo the question when one was parsed.
	let mut qdcount = 0u16;
	if !q.q_name.is_empty() {
		match name::pack(&q.q_name, buf, pos, &mut q.table) {
			Ok(n) if pos + n + 4 <= buf.len() => {
				pos += n;
				put16(buf, pos, q.q_type);
				put16(buf, pos + 2, q.q_class);
				pos += 4;
				qdcount = 1;
			}
			_ => truncated = true,
		}
	}

	let mut ancount = 0u16;
	let mut nscount = 0u16;
	let mut arcount = 0u16;

	if !truncated {
		ancount = pack_section(&q.answers, Some(&q.q_name), buf, &mut pos, &mut q.table, &mut truncated);
	}
	if !truncated {
		nscount = pack_section(&q.authority, None, buf, &mut pos, &mut q.table, &mut truncated);
	}
	if !truncated {
		arcount = pack_section(&q.additional, None, buf, &mut pos, &mut q.table, &mut truncated);
	}

	// The OPT record rides along even on a truncated response.
	if q.edns.valid {
		match edns::pack_opt(buf, pos, &q.edns, rcode) {
			Ok(n) => {
				pos += n;
				arcount += 1;
			}
			Err(_) => truncated = true,
		}
	}

	if truncated {
		header::set_tc(&mut buf[base..], true);
	}

	header::set_qdcount(&mut buf[base..], qdcount);
	header::set_ancount(&mut buf[base..], ancount);
	header::set_nscount(&mut buf[base..], nscount);
	header::set_arcount(&mut buf[base..], arcount);

	if q.transport == Transport::Tcp {
		put16(&mut q.resp, 0, (pos - 2) as u16);
	}

	q.resp_len = pos;
}

/// Write one section, rolling back the record that did not fit. Records
/// with an empty owner name (the resolver's "answers the question"
/// template) take `owner_override`.
fn pack_section(
	records: &[std::sync::Arc<rr::Record>],
	owner_override: Option<&str>,
	buf: &mut [u8],
	pos: &mut usize,
	table: &mut name::Table,
	truncated: &mut bool,
) -> u16 {
	let mut count = 0u16;

	for rec in records {
		let start = *pos;

		let owner = match (&rec.name, owner_override) {
			(n, Some(over)) if n.is_empty() => over,
			(n, _) => n.as_str(),
		};

		match pack_record(rec, owner, buf, pos, table) {
			Ok(()) => count += 1,
			Err(Error::Space) => {
				*pos = start;
				*truncated = true;
				break;
			}
			Err(Error::Format) => {
				// A record that cannot be encoded is a policy bug; leave it
				// out rather than corrupt the message.
				log::error!("record for {owner} failed to encode");
				*pos = start;
			}
		}
	}

	count
}

fn pack_record(rec: &rr::Record, owner: &str, buf: &mut [u8], pos: &mut usize, table: &mut name::Table) -> wire::Result {
	let mut at = *pos;

	at += name::pack(owner, buf, at, table)?;

	if at + 10 + rec.rdata.len() > buf.len() {
		return Err(Error::Space);
	}

	put16(buf, at, rec.rtype);
	put16(buf, at + 2, rec.class);
	utils::endian::put32(buf, at + 4, rec.ttl);
	put16(buf, at + 8, rec.rdata.len() as u16);
	at += 10;

	buf[at..at + rec.rdata.len()].copy_from_slice(&rec.rdata);
	at += rec.rdata.len();

	*pos = at;
	Ok(())
}
