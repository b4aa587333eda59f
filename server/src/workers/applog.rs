//! Application-log writer.
//!
//! Drains every thread's log channel in turn, prefixes each record with an
//! RFC 3339 Nano timestamp, and appends the batch with one vectored write.
//! While the file cannot be opened the records fall back to stderr; a
//! fatal record takes the process down after it is written.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use collections::spsc::Receiver;
use runtime::logger::LogMsg;

use crate::config::Config;
use crate::metrics::metrics;

const OPEN_RETRY: Duration = Duration::from_secs(5);

pub struct AppLogWorker {
	rxs: Vec<Receiver<LogMsg>>,
	path: PathBuf,
	file: Option<File>,
	last_open_attempt: Option<Instant>,
}

impl AppLogWorker {
	#[must_use]
	pub fn new(cfg: &Config, rxs: Vec<Receiver<LogMsg>>) -> Self {
		Self {
			rxs,
			path: cfg.app_log_path.join(&cfg.app_log_name),
			file: None,
			last_open_attempt: None,
		}
	}

	pub fn run(mut self) {
		let mut lines: Vec<String> = Vec::new();

		loop {
			lines.clear();
			let mut fatal = false;

			for rx in &self.rxs {
				while let Some(msg) = rx.try_recv() {
					fatal |= msg.fatal;
					lines.push(format!("{} - {}\n", runtime::time::rfc3339(SystemTime::now()), msg.line));
				}
			}

			if lines.is_empty() {
				if runtime::shutdown_requested() {
					break;
				}
				std::thread::sleep(Duration::from_millis(1));
				continue;
			}

			self.write_batch(&lines);

			if fatal {
				if let Some(f) = self.file.as_mut() {
					let _ = f.flush();
				}
				std::process::exit(1);
			}
		}
	}

	fn write_batch(&mut self, lines: &[String]) {
		let Some(file) = self.open_file() else {
			for line in lines {
				eprint!("{line}");
			}
			return;
		};

		// One writev per batch, advancing across partial writes.
		let mut idx = 0usize;
		let mut off = 0usize;

		while idx < lines.len() {
			let mut bufs: Vec<IoSlice> = Vec::with_capacity(lines.len() - idx);
			bufs.push(IoSlice::new(&lines[idx].as_bytes()[off..]));
			for line in &lines[idx + 1..] {
				bufs.push(IoSlice::new(line.as_bytes()));
			}

			let mut n = match file.write_vectored(&bufs) {
				Ok(0) => {
					metrics().app_log_write_error.inc();
					return;
				}
				Ok(n) => n,
				Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(err) => {
					metrics().app_log_write_error.inc();
					eprintln!("app log write failed: {err}");
					// Force a reopen on the next batch.
					self.file = None;
					return;
				}
			};

			while n > 0 && idx < lines.len() {
				let remaining = lines[idx].len() - off;

				if n >= remaining {
					n -= remaining;
					idx += 1;
					off = 0;
				} else {
					off += n;
					n = 0;
				}
			}
		}
	}

	fn open_file(&mut self) -> Option<&mut File> {
		if self.file.is_none() {
			let due = self.last_open_attempt.map_or(true, |t| t.elapsed() >= OPEN_RETRY);
			if !due {
				return None;
			}

			self.last_open_attempt = Some(Instant::now());

			match OpenOptions::new().create(true).append(true).open(&self.path) {
				Ok(f) => self.file = Some(f),
				Err(err) => {
					metrics().app_log_open_error.inc();
					eprintln!("cannot open {}: {err}", self.path.display());
				}
			}
		}

		self.file.as_mut()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use collections::spsc;

	#[test]
	fn timestamps_and_appends() {
		let dir = std::env::temp_dir().join(format!("applog-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();

		let cfg = Config {
			app_log_path: dir.clone(),
			app_log_name: "app.log".into(),
			..Default::default()
		};

		let (tx, rx) = spsc::channel(8);
		let mut worker = AppLogWorker::new(&cfg, vec![rx]);

		tx.send(LogMsg { fatal: false, line: "INFO test: hello".into() }).unwrap();
		tx.send(LogMsg { fatal: false, line: "WARN test: world".into() }).unwrap();

		// Drain one batch by hand.
		let mut lines = Vec::new();
		while let Some(msg) = worker.rxs[0].try_recv() {
			lines.push(format!("{} - {}\n", runtime::time::rfc3339(SystemTime::now()), msg.line));
		}
		worker.write_batch(&lines);

		let text = std::fs::read_to_string(dir.join("app.log")).unwrap();
		let mut it = text.lines();

		let first = it.next().unwrap();
		assert!(first.ends_with(" - INFO test: hello"));
		// RFC 3339 Nano: date, 'T', time with nine fractional digits, 'Z'.
		let ts = first.split(" - ").next().unwrap();
		assert_eq!(ts.len(), "1970-01-01T00:00:00.000000000Z".len());
		assert!(ts.ends_with('Z'));

		assert!(it.next().unwrap().ends_with(" - WARN test: world"));

		std::fs::remove_dir_all(&dir).unwrap();
	}
}
