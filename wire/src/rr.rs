//! Resource records and the type/class tables.

use core::fmt::Write as _;

/// an unsigned 16 bit integer specifying one of the RR type codes.
pub mod rtype {
	pub const A: u16 = 1;
	pub const NS: u16 = 2;
	pub const CNAME: u16 = 5;
	pub const SOA: u16 = 6;
	pub const PTR: u16 = 12;
	pub const MX: u16 = 15;
	pub const TXT: u16 = 16;
	pub const AAAA: u16 = 28;
	pub const SRV: u16 = 33;
	/// EDNS(0) pseudo-RR, RFC 6891.
	pub const OPT: u16 = 41;
}

/// two octets which specify the class of the data in the RDATA field.
pub mod class {
	pub const IN: u16 = 1;
	pub const CH: u16 = 3;
	pub const HS: u16 = 4;
	pub const ANY: u16 = 255;
}

#[must_use]
pub fn type_str(t: u16) -> &'static str {
	match t {
		rtype::A => "A",
		rtype::NS => "NS",
		rtype::CNAME => "CNAME",
		rtype::SOA => "SOA",
		rtype::PTR => "PTR",
		rtype::MX => "MX",
		rtype::TXT => "TXT",
		rtype::AAAA => "AAAA",
		rtype::SRV => "SRV",
		rtype::OPT => "OPT",
		_ => "TYPE?",
	}
}

#[must_use]
pub fn class_str(c: u16) -> &'static str {
	match c {
		class::IN => "IN",
		class::CH => "CH",
		class::HS => "HS",
		class::ANY => "ANY",
		_ => "CLASS?",
	}
}

/// One record as the resolver serves it: owner name in presentation form,
/// rdata already in wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
	pub name: String,
	pub rtype: u16,
	pub class: u16,
	pub ttl: u32,
	pub rdata: Vec<u8>,
}

impl Record {
	#[must_use]
	pub fn a(name: &str, ttl: u32, addr: [u8; 4]) -> Self {
		Self {
			name: name.into(),
			rtype: rtype::A,
			class: class::IN,
			ttl,
			rdata: addr.to_vec(),
		}
	}

	#[must_use]
	pub fn aaaa(name: &str, ttl: u32, addr: [u8; 16]) -> Self {
		Self {
			name: name.into(),
			rtype: rtype::AAAA,
			class: class::IN,
			ttl,
			rdata: addr.to_vec(),
		}
	}

	/// `target` is stored as an uncompressed wire name.
	#[must_use]
	pub fn ns(name: &str, ttl: u32, target: &str) -> Self {
		let mut rdata = vec![0u8; crate::MAX_NAME_LEN + 1];
		let len = crate::name::encode(target, &mut rdata, 0).expect("valid nameserver name");
		rdata.truncate(len);

		Self {
			name: name.into(),
			rtype: rtype::NS,
			class: class::IN,
			ttl,
			rdata,
		}
	}

	/// Render rdata for the query log: dotted quad for A, colon groups for
	/// AAAA, a decoded name for NS/CNAME/PTR, hex otherwise.
	pub fn rdata_str(&self, out: &mut String) {
		match (self.rtype, self.rdata.as_slice()) {
			(rtype::A, [a, b, c, d]) => {
				let _ = write!(out, "{a}.{b}.{c}.{d}");
			}
			(rtype::AAAA, rd) if rd.len() == 16 => {
				let mut groups = [0u16; 8];
				for (i, g) in groups.iter_mut().enumerate() {
					*g = u16::from_be_bytes([rd[2 * i], rd[2 * i + 1]]);
				}
				let _ = write!(out, "{}", std::net::Ipv6Addr::from(groups));
			}
			(rtype::NS | rtype::CNAME | rtype::PTR, rd) => {
				if crate::name::decode(rd, 0, out).is_err() {
					out.push('?');
				}
			}
			(_, rd) => {
				for b in rd {
					let _ = write!(out, "{b:02x}");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rendered(rec: &Record) -> String {
		let mut s = String::new();
		rec.rdata_str(&mut s);
		s
	}

	#[test]
	fn renders_a() {
		assert_eq!(rendered(&Record::a("www.example.com.", 60, [127, 0, 0, 1])), "127.0.0.1");
	}

	#[test]
	fn renders_aaaa() {
		let mut addr = [0u8; 16];
		addr[15] = 1;
		assert_eq!(rendered(&Record::aaaa("ns.example.com.", 60, addr)), "::1");
	}

	#[test]
	fn renders_ns_target() {
		assert_eq!(rendered(&Record::ns("example.com.", 60, "ns.example.com.")), "ns.example.com.");
	}

	#[test]
	fn renders_unknown_as_hex() {
		let rec = Record {
			name: "x.".into(),
			rtype: rtype::TXT,
			class: class::IN,
			ttl: 0,
			rdata: vec![0xde, 0xad],
		};
		assert_eq!(rendered(&rec), "dead");
	}

	#[test]
	fn tables() {
		assert_eq!(type_str(rtype::A), "A");
		assert_eq!(type_str(999), "TYPE?");
		assert_eq!(class_str(class::IN), "IN");
		assert_eq!(class_str(77), "CLASS?");
	}
}
