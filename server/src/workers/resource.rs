//! Resource reloader.
//!
//! Watches the record file's change time; on change it loads a fresh
//! artifact, broadcasts it to every shard, and waits for every
//! acknowledgment before releasing the previous artifact. A shard that
//! does not acknowledge within ten seconds is a wedged pipeline and the
//! process goes down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::channel::{Ctrl, Endpoint};
use crate::config::Config;
use crate::metrics::metrics;
use crate::resource::Resources;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ResourceWorker {
	ctrls: Vec<Endpoint>,
	path: Option<PathBuf>,
	interval: Duration,
	/// The artifact currently published; the previous one is dropped only
	/// after the swap barrier completes.
	current: Arc<Resources>,
	mtime: Option<SystemTime>,
}

impl ResourceWorker {
	#[must_use]
	pub fn new(cfg: &Config, ctrls: Vec<Endpoint>, current: Arc<Resources>, mtime: Option<SystemTime>) -> Self {
		Self {
			ctrls,
			path: cfg.resource_records_path.clone(),
			interval: Duration::from_secs(cfg.resource_check_interval),
			current,
			mtime,
		}
	}

	pub fn run(mut self) {
		let Some(path) = self.path.clone() else {
			// Nothing to watch; hold the artifact until shutdown.
			while !runtime::shutdown_requested() {
				std::thread::sleep(Duration::from_millis(50));
			}
			return;
		};

		let mut last_check = Instant::now();

		while !runtime::shutdown_requested() {
			std::thread::sleep(Duration::from_millis(20));

			if last_check.elapsed() < self.interval {
				continue;
			}
			last_check = Instant::now();

			let mtime = match std::fs::metadata(&path) {
				Ok(meta) => meta.modified().ok(),
				Err(err) => {
					log::debug!("resource {}: {err}", path.display());
					continue;
				}
			};

			if mtime == self.mtime {
				continue;
			}

			match Resources::load(&path) {
				Err(()) => {
					// Already logged at the failure site; retry at the
					// next interval.
					metrics().resource_reload_error.inc();
				}
				Ok(rs) => {
					if self.publish(Arc::new(rs)) {
						self.mtime = mtime;
						log::info!("resources reloaded from {}", path.display());
					}
				}
			}
		}
	}

	/// Broadcast `next` and hold the barrier until every shard has
	/// acknowledged the swap.
	fn publish(&mut self, next: Arc<Resources>) -> bool {
		for (i, ctrl) in self.ctrls.iter().enumerate() {
			if ctrl.tx.send(Ctrl::Resource(next.clone())).is_err() {
				log::error!("resource channel to shard {i} full");
			}
		}

		let start = Instant::now();
		let mut acked = vec![false; self.ctrls.len()];

		while !acked.iter().all(|&a| a) {
			for (i, ctrl) in self.ctrls.iter().enumerate() {
				if acked[i] {
					continue;
				}

				match ctrl.rx.try_recv() {
					Some(Ctrl::ResourceAck) => acked[i] = true,
					Some(_) => log::warn!("unexpected message on resource channel {i}"),
					None => {}
				}
			}

			if runtime::shutdown_requested() {
				return false;
			}

			if start.elapsed() > ACK_TIMEOUT {
				runtime::fatal!("resource swap not acknowledged by all shards within {ACK_TIMEOUT:?}");
				return false;
			}

			std::thread::sleep(Duration::from_micros(1));
		}

		// Every shard switched; the old artifact's last reference dies
		// here.
		self.current = next;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::channel;

	#[test]
	fn publish_waits_for_every_ack() {
		let (shard_a, worker_a) = channel::pair();
		let (shard_b, worker_b) = channel::pair();

		let cfg = Config::default();
		let mut worker = ResourceWorker::new(&cfg, vec![worker_a, worker_b], Arc::new(Resources::builtin()), None);

		let next = Arc::new(Resources::builtin());

		std::thread::scope(|s| {
			let h = s.spawn(|| worker.publish(next.clone()));

			// Both shards see the new artifact and ack out of order.
			for shard in [&shard_b, &shard_a] {
				let msg = loop {
					if let Some(m) = shard.rx.try_recv() {
						break m;
					}
					std::thread::yield_now();
				};

				let Ctrl::Resource(arc) = msg else { panic!("expected resource") };
				drop(arc);
				shard.tx.send(Ctrl::ResourceAck).map_err(|_| ()).unwrap();
			}

			assert!(h.join().unwrap());
		});

		// The worker's published artifact is the one it broadcast.
		assert!(Arc::ptr_eq(&worker.current, &next));
	}
}
