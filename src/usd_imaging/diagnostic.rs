//! Diagnostics for invariant violations inside change processing.
//!
//! Neither macro aborts: the caller logs and continues with a safe default.

/// Report a coding error: an internal invariant that should never fail.
macro_rules! coding_error {
	($($arg:tt)+) => {
		log::error!(target: "usd_imaging::coding_error", $($arg)+)
	};
}

/// Soft assertion. Logs an error when `cond` is false and evaluates to `cond`.
macro_rules! verify {
	($cond:expr) => {{
		let ok: bool = $cond;
		if !ok {
			log::error!(target: "usd_imaging::verify", "Failed verification: `{}`", stringify!($cond));
		}
		ok
	}};
	($cond:expr, $($arg:tt)+) => {{
		let ok: bool = $cond;
		if !ok {
			log::error!(
				target: "usd_imaging::verify",
				"Failed verification: `{}`: {}",
				stringify!($cond),
				format_args!($($arg)+)
			);
		}
		ok
	}};
}

pub(crate) use coding_error;
pub(crate) use verify;
