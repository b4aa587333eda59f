use std::sync::atomic::{AtomicBool, Ordering};

pub mod epoll;
pub mod logger;
pub mod thread;
pub mod time;

static EXIT: AtomicBool = AtomicBool::new(false);

/// Whether process shutdown has been requested. Checked once per vectorloop
/// iteration and once per worker wakeup.
pub fn shutdown_requested() -> bool {
	EXIT.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
	EXIT.store(true, Ordering::Relaxed);
}

/// Route SIGINT to the shutdown flag.
pub fn hook_signals() -> utils::error::Result {
	use utils::error::OrLog;

	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed)).or_log(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))
}
