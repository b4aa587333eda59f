//! Offload worker threads: application log, query log, resources.

pub mod applog;
pub mod querylog;
pub mod resource;
