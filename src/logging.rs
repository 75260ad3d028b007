//! Structured logging init: a `tracing_subscriber` `fmt` layer with an
//! `EnvFilter`, optionally emitting JSON.

use tracing_subscriber::EnvFilter;

// ==== Logging field-name constants ====
// Used consistently across `tracing::info_span!`/`#[instrument]` call sites
// so every log line can be filtered by the same keys regardless of which
// component emitted it.
pub const COMPONENT_KEY: &str = "component";
pub const CHAIN_KEY: &str = "chain";

/// Initializes the global tracing subscriber. `log_level` is used only as a
/// fallback default filter; `RUST_LOG` always takes precedence.
pub fn init(log_level: &str, json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

	let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

	let result = if json { subscriber.json().try_init() } else { subscriber.try_init() };

	if let Err(e) = result {
		eprintln!("failed to set global tracing subscriber: {e}");
	}
}

#[cfg(test)]
pub mod test_utils {
	use tracing_subscriber::EnvFilter;

	/// Installs a test-scoped subscriber. Safe to call from multiple tests;
	/// a failed `try_init` (subscriber already set) is ignored.
	pub fn init_test_logger() {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::new("debug"))
			.with_test_writer()
			.try_init();
	}
}
