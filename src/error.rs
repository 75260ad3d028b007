//! Engine-wide error taxonomy.
//!
//! RPC clients speak [`RpcError`]; the collector, sink and cursor store speak
//! [`EngineError`], which every `RpcError` folds into via `From`. Keeping the
//! two distinct lets an RPC client stay a thin, chain-specific wrapper while
//! the collector reasons about one uniform set of outcomes.

use thiserror::Error;

/// Error taxonomy surfaced by every RPC client method.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
	#[error("position beyond tip")]
	NotFound,
	/// Solana-only: no leader produced a block for this slot.
	#[error("slot skipped")]
	Skipped,
	#[error("rate limited")]
	RateLimited,
	#[error("transient error: {0}")]
	Transient(String),
	#[error("fatal error: {0}")]
	Fatal(String),
}

impl RpcError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, RpcError::RateLimited | RpcError::Transient(_))
	}

	pub fn triggers_backoff(&self) -> bool {
		matches!(self, RpcError::RateLimited | RpcError::Transient(_))
	}
}

/// Error taxonomy at the engine level.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("rate limited")]
	RateLimited,
	#[error("transient: {0}")]
	Transient(String),
	#[error("not found")]
	NotFound,
	#[error("skipped")]
	Skipped,
	#[error("validation: {0}")]
	Validation(String),
	#[error("sink unavailable: {0}")]
	SinkUnavailable(String),
	#[error("fatal: {0}")]
	Fatal(String),
}

impl EngineError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			EngineError::RateLimited => ErrorKind::RateLimited,
			EngineError::Transient(_) => ErrorKind::Transient,
			EngineError::NotFound => ErrorKind::NotFound,
			EngineError::Skipped => ErrorKind::Skipped,
			EngineError::Validation(_) => ErrorKind::Validation,
			EngineError::SinkUnavailable(_) => ErrorKind::SinkUnavailable,
			EngineError::Fatal(_) => ErrorKind::Fatal,
		}
	}

	/// Whether this error should transition the collector to the terminal
	/// `Fatal` state.
	pub fn is_fatal(&self) -> bool {
		matches!(self, EngineError::Fatal(_))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	RateLimited,
	Transient,
	NotFound,
	Skipped,
	Validation,
	SinkUnavailable,
	Fatal,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::RateLimited => "rate_limited",
			ErrorKind::Transient => "transient",
			ErrorKind::NotFound => "not_found",
			ErrorKind::Skipped => "skipped",
			ErrorKind::Validation => "validation",
			ErrorKind::SinkUnavailable => "sink_unavailable",
			ErrorKind::Fatal => "fatal",
		}
	}
}

impl From<RpcError> for EngineError {
	fn from(e: RpcError) -> Self {
		match e {
			RpcError::NotFound => EngineError::NotFound,
			RpcError::Skipped => EngineError::Skipped,
			RpcError::RateLimited => EngineError::RateLimited,
			RpcError::Transient(s) => EngineError::Transient(s),
			RpcError::Fatal(s) => EngineError::Fatal(s),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rpc_error_retry_classification() {
		assert!(RpcError::RateLimited.is_retryable());
		assert!(RpcError::Transient("timeout".into()).is_retryable());
		assert!(!RpcError::NotFound.is_retryable());
		assert!(!RpcError::Skipped.is_retryable());
		assert!(!RpcError::Fatal("bad auth".into()).is_retryable());
	}

	#[test]
	fn engine_error_fatal_classification() {
		assert!(EngineError::Fatal("auth".into()).is_fatal());
		assert!(!EngineError::Transient("timeout".into()).is_fatal());
	}

	#[test]
	fn rpc_error_converts_to_engine_error_kind() {
		let e: EngineError = RpcError::RateLimited.into();
		assert_eq!(e.kind(), ErrorKind::RateLimited);
	}
}
