use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

fn origin() -> Instant {
	static ORIGIN: OnceLock<Instant> = OnceLock::new();
	*ORIGIN.get_or_init(Instant::now)
}

/// Pin the monotonic origin. Optional; the first caller of [`now_ms`] pins
/// it otherwise.
pub fn init() {
	origin();
}

/// Monotonic milliseconds since process start. Cheap enough to snapshot once
/// per vectorloop iteration; all connection timeout stamps are in this
/// timebase.
pub fn now_ms() -> u64 {
	origin().elapsed().as_millis() as u64
}

/// RFC 3339 with nanoseconds, the timestamp format of both log surfaces.
pub fn rfc3339(t: SystemTime) -> humantime::Rfc3339Timestamp {
	humantime::format_rfc3339_nanos(t)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic() {
		let a = now_ms();
		std::thread::sleep(std::time::Duration::from_millis(5));
		let b = now_ms();
		assert!(b >= a + 4);
	}

	#[test]
	fn rfc3339_shape() {
		let s = rfc3339(SystemTime::UNIX_EPOCH).to_string();
		assert_eq!(s, "1970-01-01T00:00:00.000000000Z");
	}
}
