//! Request parsing onto a Query.
//!
//! Parsing never returns an error to the pipeline; every outcome is an
//! `end_code`. Negative codes drop the request silently, codes at or above
//! zero are answered with that rcode, and `Unknown` survives only for
//! requests that are fully acceptable and go on to resolution.

use utils::endian::get16;
use wire::edns::OptStatus;
use wire::{edns, header, name, opcode, rr, HEADER_LEN};

use crate::query::{EndCode, Query};

/// Question types the reference policy serves.
const SUPPORTED_QTYPES: &[u16] = &[rr::rtype::A];
const SUPPORTED_QCLASSES: &[u16] = &[rr::class::IN];

pub fn parse_request(q: &mut Query) {
	if q.end_code != EndCode::Unknown {
		// Already decided at the transport layer (e.g. oversized datagram).
		return;
	}

	let mut qname = core::mem::take(&mut q.q_name);
	let mut ednstate = core::mem::take(&mut q.edns);

	let mut qtype = 0u16;
	let mut qclass = 0u16;

	let end = parse_msg(q.request_msg(), &mut qname, &mut qtype, &mut qclass, &mut ednstate);

	q.q_name = qname;
	q.q_type = qtype;
	q.q_class = qclass;
	q.edns = ednstate;

	// A clean parse leaves the query undecided for the resolver.
	if end != EndCode::NoError {
		q.end_code = end;
	}
}

fn parse_msg(msg: &[u8], qname: &mut String, qtype: &mut u16, qclass: &mut u16, ednstate: &mut edns::Edns) -> EndCode {
	if msg.len() < HEADER_LEN {
		return EndCode::ShortHeader;
	}

	if header::tc(msg) {
		return EndCode::QueryTc;
	}

	if header::qr(msg) {
		return EndCode::FormErr;
	}

	if header::opcode(msg) != opcode::QUERY {
		return EndCode::NotImpl;
	}

	if header::qdcount(msg) != 1 {
		return EndCode::NotImpl;
	}

	if header::ancount(msg) != 0 || header::nscount(msg) != 0 {
		return EndCode::FormErr;
	}

	// Question section.
	let mut pos = HEADER_LEN;

	match name::decode(msg, pos, qname) {
		Ok(used) => pos += used,
		Err(_) => {
			qname.clear();
			return EndCode::FormErr;
		}
	}

	if pos + 4 > msg.len() {
		qname.clear();
		return EndCode::FormErr;
	}

	*qtype = get16(msg, pos);
	*qclass = get16(msg, pos + 2);
	pos += 4;

	let mut end = EndCode::NoError;

	if !SUPPORTED_QTYPES.contains(qtype) || !SUPPORTED_QCLASSES.contains(qclass) {
		end = EndCode::NotImpl;
	}

	// Additional section: find the first OPT, count and skip everything
	// else.
	let arcount = header::arcount(msg);
	let mut seen_opt = false;
	let mut owner = String::new();

	for _ in 0..arcount {
		owner.clear();

		match name::decode(msg, pos, &mut owner) {
			Ok(used) => pos += used,
			Err(_) => return EndCode::FormErr,
		}

		if pos + 10 > msg.len() {
			return EndCode::FormErr;
		}

		if get16(msg, pos) == rr::rtype::OPT && !seen_opt {
			seen_opt = true;

			// RFC 6891: the OPT owner must be the root.
			if owner != "." {
				return EndCode::FormErr;
			}

			match edns::parse_opt(msg, pos, ednstate) {
				Ok((used, OptStatus::Ok)) => pos += used,
				Ok((used, OptStatus::BadVersion)) => {
					pos += used;
					end = EndCode::BadVers;
				}
				Ok((used, OptStatus::BadSubnet)) => {
					pos += used;
					if end == EndCode::NoError {
						end = EndCode::FormErr;
					}
				}
				Err(_) => return EndCode::FormErr,
			}
		} else {
			let rdlen = get16(msg, pos + 8) as usize;
			pos += 10;

			if pos + rdlen > msg.len() {
				return EndCode::FormErr;
			}
			pos += rdlen;
		}
	}

	if pos < msg.len() {
		log::debug!("request carries {} trailing bytes past the parsed region", msg.len() - pos);
	}

	end
}
