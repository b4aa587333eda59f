//! Error-handling idiom for the workspace.
//!
//! Failures are logged where they are detected and propagated as a bare
//! `Err(())` with `?`; the caller decides whether the operation is fatal.
//! Hot-path per-query outcomes are not errors in this sense, they are
//! `end_code` values carried on the query itself.

use core::result;

pub type Result<T = (), E = ()> = result::Result<T, E>;

/// Log-and-discard adapter for `std::result::Result`.
pub trait OrLog<T, E> {
	/// Run `f` on the error (the logging site), converting to `Err(())`.
	fn or_log(self, f: impl FnOnce(E)) -> Result<T>;
}

impl<T, E> OrLog<T, E> for result::Result<T, E> {
	fn or_log(self, f: impl FnOnce(E)) -> Result<T> {
		self.map_err(|e| f(e))
	}
}

/// Log-and-discard adapter for `Option`.
pub trait OrLogNone<T> {
	/// Run `f` if the value is absent, converting to `Err(())`.
	fn or_log_none(self, f: impl FnOnce()) -> Result<T>;
}

impl<T> OrLogNone<T> for Option<T> {
	fn or_log_none(self, f: impl FnOnce()) -> Result<T> {
		self.ok_or_else(f)
	}
}
