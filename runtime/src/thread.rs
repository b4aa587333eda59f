use std::thread::JoinHandle;

/// Spawn a named thread, optionally pinned to a core (0-based id).
pub fn spawn<F>(name: &str, core: Option<usize>, f: F) -> JoinHandle<()>
where
	F: FnOnce() + Send + 'static,
{
	let label = name.to_owned();

	std::thread::Builder::new()
		.name(label.clone())
		.spawn(move || {
			if let Some(id) = core {
				pin(&label, id);
			}

			f()
		})
		.expect("thread spawn")
}

/// Bind the calling thread to one CPU. Failure is logged and the thread
/// runs unpinned.
fn pin(name: &str, cpu: usize) {
	unsafe {
		let mut set: libc::cpu_set_t = core::mem::zeroed();
		libc::CPU_ZERO(&mut set);
		libc::CPU_SET(cpu, &mut set);

		if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
			log::warn!("{name}: failed to pin to cpu {cpu}: {}", std::io::Error::last_os_error());
		} else {
			log::debug!("{name}: pinned to cpu {cpu}");
		}
	}
}
