//! Log facade backend.
//!
//! Shard and worker threads register the producer half of their
//! application-log channel; records logged on those threads are formatted
//! and handed to the application-log worker, which timestamps and appends
//! them to the log file. Threads without a channel (startup, tests) write
//! colored lines to stderr instead. Records never block: a full channel
//! drops the record and counts it.

use core::cell::RefCell;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use collections::spsc;
use log::Level;
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

/// One application-log record in flight to the writer.
#[derive(Debug)]
pub struct LogMsg {
	/// The writer exits the process after writing a fatal record.
	pub fatal: bool,
	pub line: String,
}

static DROPPED: AtomicU64 = AtomicU64::new(0);

thread_local! {
	static CHANNEL: RefCell<Option<spsc::Sender<LogMsg>>> = const { RefCell::new(None) };
}

/// Records dropped because a channel was full.
pub fn dropped() -> u64 {
	DROPPED.load(Ordering::Relaxed)
}

/// Route this thread's records to `tx` instead of stderr.
pub fn bind_thread(tx: spsc::Sender<LogMsg>) {
	CHANNEL.with(|c| *c.borrow_mut() = Some(tx));
}

/// Install the global logger. Call once, before any thread logs.
pub fn install(level: log::LevelFilter) {
	if log::set_logger(&Logger).is_ok() {
		log::set_max_level(level);
	}
}

/// Emit a fatal record and request shutdown. On channeled threads the
/// application-log worker terminates the process after the write; elsewhere
/// the process exits here.
pub fn fatal(args: fmt::Arguments) {
	crate::request_shutdown();

	let line = format!("FATAL {args}");

	let sent = CHANNEL.with(|c| match &*c.borrow() {
		Some(tx) => tx.send(LogMsg { fatal: true, line: line.clone() }).is_ok(),
		None => false,
	});

	if !sent {
		eprintln!("{} {line}", humantime::format_rfc3339_nanos(SystemTime::now()));
		std::process::exit(1);
	}
}

pub struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let handled = CHANNEL.with(|c| match &*c.borrow() {
			Some(tx) => {
				let msg = LogMsg {
					fatal: false,
					line: format!("{:5} {}: {}", record.level(), record.target(), record.args()),
				};

				if tx.send(msg).is_err() {
					DROPPED.fetch_add(1, Ordering::Relaxed);
				}

				true
			}
			None => false,
		});

		if handled {
			return;
		}

		let time = humantime::format_rfc3339_nanos(SystemTime::now());
		let dim = Style::new().dimmed().prefix();

		let color = match record.level() {
			Level::Trace => Color::Purple,
			Level::Debug => Color::Blue,
			Level::Info => Color::Green,
			Level::Warn => Color::Yellow,
			Level::Error => Color::Red,
		};

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			color.bold().prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

/// `fatal!(...)` formats like `log::error!` and then takes the process down
/// through the application-log writer.
#[macro_export]
macro_rules! fatal {
	($($arg:tt)*) => {
		$crate::logger::fatal(core::format_args!($($arg)*))
	};
}
