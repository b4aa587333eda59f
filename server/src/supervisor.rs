//! Process bring-up and teardown.
//!
//! Builds the per-shard channel fabric, loads the initial artifact, spawns
//! the three workers and N pinned shard threads, and joins everything on
//! shutdown. Shards never share mutable state; everything they need is
//! handed to them here, once.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use collections::spsc;
use utils::error::Result;

use crate::channel::{self, ShardChannels, APP_LOG_DEPTH};
use crate::config::Config;
use crate::metrics::metrics;
use crate::resolve::Resolver;
use crate::resource::Resources;
use crate::vectorloop::Shard;
use crate::workers::applog::AppLogWorker;
use crate::workers::querylog::QueryLogWorker;
use crate::workers::resource::ResourceWorker;

pub fn run(cfg: Config, resolver: Arc<dyn Resolver>) -> Result {
	cfg.validate()?;
	let cfg = Arc::new(cfg);

	runtime::time::init();
	runtime::hook_signals()?;

	// Initial artifact, loaded before any shard starts.
	let resources = Arc::new(match &cfg.resource_records_path {
		Some(path) => Resources::load(path).unwrap_or_else(|()| {
			log::warn!("falling back to built-in records");
			Resources::builtin()
		}),
		None => Resources::builtin(),
	});

	let initial_mtime = cfg
		.resource_records_path
		.as_ref()
		.and_then(|p| std::fs::metadata(p).ok())
		.and_then(|m| m.modified().ok());

	let stop = Arc::new(AtomicBool::new(false));

	let mut applog_rxs = Vec::new();
	let mut resource_ends = Vec::new();
	let mut querylog_ends = Vec::new();
	let mut shards = Vec::new();

	for id in 0..cfg.process_thread_count {
		let (shard_res, worker_res) = channel::pair();
		let (shard_qlog, worker_qlog) = channel::pair();
		let (app_tx, app_rx) = spsc::channel(APP_LOG_DEPTH);

		resource_ends.push(worker_res);
		querylog_ends.push(worker_qlog);
		applog_rxs.push(app_rx);

		let chans = ShardChannels {
			resource: shard_res,
			querylog: shard_qlog,
			applog: Some(app_tx),
		};

		shards.push(Shard::new(id, cfg.clone(), resolver.clone(), resources.clone(), chans, stop.clone())?);
	}

	// The two non-log workers log through the same sink.
	let (res_app_tx, res_app_rx) = spsc::channel(APP_LOG_DEPTH);
	let (qlog_app_tx, qlog_app_rx) = spsc::channel(APP_LOG_DEPTH);
	applog_rxs.push(res_app_rx);
	applog_rxs.push(qlog_app_rx);

	let applog = AppLogWorker::new(&cfg, applog_rxs);
	let t_applog = runtime::thread::spawn("applog", None, move || applog.run());

	let resource_worker = ResourceWorker::new(&cfg, resource_ends, resources, initial_mtime);
	let t_resource = runtime::thread::spawn("resource", None, move || {
		runtime::logger::bind_thread(res_app_tx);
		resource_worker.run();
	});

	let querylog_worker = QueryLogWorker::new(&cfg, querylog_ends);
	let t_querylog = runtime::thread::spawn("querylog", None, move || {
		runtime::logger::bind_thread(qlog_app_tx);
		querylog_worker.run();
	});

	let mut shard_threads = Vec::new();
	for (id, shard) in shards.into_iter().enumerate() {
		let core = cfg.process_thread_masks.get(id).map(|&m| m - 1);
		shard_threads.push(runtime::thread::spawn(&format!("shard-{id}"), core, move || shard.run()));
	}

	log::info!(
		"serving on udp port {} / tcp port {} with {} shards",
		cfg.udp_listener_port,
		cfg.tcp_listener_port,
		cfg.process_thread_count
	);

	for t in shard_threads {
		let _ = t.join();
	}

	// Shards are down (signal or fatal); make sure the workers follow.
	runtime::request_shutdown();

	let _ = t_querylog.join();
	let _ = t_resource.join();
	let _ = t_applog.join();

	// Records dropped on full log channels count as write errors.
	metrics().app_log_write_error.add(runtime::logger::dropped());

	for (name, value) in metrics().snapshot() {
		if value > 0 {
			log::info!("{name}: {value}");
		}
	}

	Ok(())
}
