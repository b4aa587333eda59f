use std::sync::Arc;

use server::config::Config;
use server::resolve::StaticResolver;

fn main() {
	runtime::logger::install(log::LevelFilter::Info);
	runtime::time::init();

	if server::supervisor::run(Config::default(), Arc::new(StaticResolver)).is_err() {
		std::process::exit(1);
	}
}
