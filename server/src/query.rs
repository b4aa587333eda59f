//! One in-flight DNS transaction.
//!
//! Queries are created once with their owning connection and reset between
//! uses; the request and response buffers never reallocate on the hot path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

use wire::edns::Edns;
use wire::name::Table;
use wire::rr::Record;

/// How far a query got, and what kind of response (if any) it earns.
/// Negative codes never produce a response; codes at or above zero map onto
/// DNS rcodes, with values past 15 carried in the EDNS extended-rcode octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum EndCode {
	Unknown = -1,
	ShortHeader = -2,
	TooLarge = -3,
	QueryTc = -4,
	TcpWriteErr = -6,
	TcpWriteClose = -7,
	NoError = 0,
	FormErr = 1,
	ServFail = 2,
	NxDomain = 3,
	NotImpl = 4,
	Refused = 5,
	BadVers = 16,
}

impl EndCode {
	/// Whether this outcome produces a response message.
	#[must_use]
	pub fn responds(self) -> bool {
		self as i32 >= 0
	}

	/// Full response code, including the extended range.
	#[must_use]
	pub fn rcode(self) -> u16 {
		debug_assert!(self.responds());
		self as i32 as u16
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
	Udp,
	Tcp,
}

impl Transport {
	/// Offset of the DNS header inside the request/response buffers: TCP
	/// frames carry a two-byte length prefix.
	#[must_use]
	pub fn base(self) -> usize {
		match self {
			Transport::Udp => 0,
			Transport::Tcp => 2,
		}
	}
}

/// Request buffer size: a TCP frame is at most 2 + 512 bytes, and a UDP
/// read of 513 bytes marks the datagram oversized.
pub const REQ_BUF_LEN: usize = 2 + wire::MAX_UDP_MSG;

/// Response buffer size: the largest advertised EDNS payload plus the TCP
/// prefix.
pub const RESP_BUF_LEN: usize = 2 + wire::edns::UDP_SIZE_MAX as usize;

pub struct Query {
	pub transport: Transport,
	pub client: SocketAddr,
	pub local: SocketAddr,

	/// Raw request bytes; over TCP the frame's length prefix is included.
	pub req: Vec<u8>,
	pub req_len: usize,

	/// Parsed question: presentation-form name (dot-terminated), empty
	/// until a question parses.
	pub q_name: String,
	pub q_type: u16,
	pub q_class: u16,

	pub edns: Edns,

	pub resp: Vec<u8>,
	pub resp_len: usize,

	/// Section contents as handed over by the resolver; valid for the rest
	/// of the loop iteration.
	pub answers: Vec<Arc<Record>>,
	pub authority: Vec<Arc<Record>>,
	pub additional: Vec<Arc<Record>>,

	/// Compression table for the response; entry 0 pins the header.
	pub table: Table,

	pub recv_time: Option<SystemTime>,
	pub send_time: Option<SystemTime>,

	pub end_code: EndCode,
}

impl Query {
	#[must_use]
	pub fn new(transport: Transport) -> Self {
		let unspec = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

		Self {
			transport,
			client: unspec,
			local: unspec,
			req: vec![0; REQ_BUF_LEN],
			req_len: 0,
			q_name: String::new(),
			q_type: 0,
			q_class: 0,
			edns: Edns::default(),
			resp: vec![0; RESP_BUF_LEN],
			resp_len: 0,
			answers: Vec::new(),
			authority: Vec::new(),
			additional: Vec::new(),
			table: Table::new(transport.base()),
			recv_time: None,
			send_time: None,
			end_code: EndCode::Unknown,
		}
	}

	/// Make the slot ready for its next request. Buffers keep their
	/// allocations; the compression table keeps its header entry.
	pub fn reset(&mut self) {
		self.req_len = 0;
		self.q_name.clear();
		self.q_type = 0;
		self.q_class = 0;
		self.edns.reset();
		self.resp_len = 0;
		self.answers.clear();
		self.authority.clear();
		self.additional.clear();
		self.table.reset(self.transport.base());
		self.recv_time = None;
		self.send_time = None;
		self.end_code = EndCode::Unknown;
	}

	/// The DNS message inside the request buffer.
	#[must_use]
	pub fn request_msg(&self) -> &[u8] {
		&self.req[self.transport.base()..self.req_len]
	}

	/// Whether a question was parsed out of the request.
	#[must_use]
	pub fn has_question(&self) -> bool {
		!self.q_name.is_empty()
	}
}
