//! Bitcoin local/public source failover policy.
//!
//! Owned exclusively by the Bitcoin collector — never shared across tasks —
//! so its mutable preference state needs no lock beyond what a single
//! `&mut self` already gives it.

use std::time::{Duration, Instant};

use crate::{error::RpcError, model::Source};

const COOLDOWN: Duration = Duration::from_secs(60);
const PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preferred {
	Local,
	Public,
}

/// Tracks which upstream the Bitcoin collector should try first.
pub struct SourceRouter {
	preferred: Preferred,
	cooldown_until: Option<Instant>,
	last_probe: Option<Instant>,
}

impl SourceRouter {
	/// `use_local_node == false` starts the router permanently preferring
	/// public (no local node configured, so there's nothing to probe).
	pub fn new(use_local_node: bool) -> Self {
		Self {
			preferred: if use_local_node { Preferred::Local } else { Preferred::Public },
			cooldown_until: None,
			last_probe: None,
		}
	}

	pub fn preferred(&self) -> Source {
		match self.preferred {
			Preferred::Local => Source::Local,
			Preferred::Public => Source::Public,
		}
	}

	/// Whether a local-node probe is due (only meaningful while `preferred ==
	/// Public`); advances `last_probe` as a side effect when it returns `true`
	/// so the caller doesn't need to track timing separately.
	pub fn probe_due(&mut self, now: Instant) -> bool {
		if self.preferred != Preferred::Public {
			return false;
		}
		let due = self.last_probe.map(|t| now.duration_since(t) >= PROBE_INTERVAL).unwrap_or(true);
		if due {
			self.last_probe = Some(now);
		}
		due
	}

	/// Called after a successful local probe while `preferred == Public`:
	/// resets preference back to `local`.
	pub fn probe_succeeded(&mut self) {
		self.preferred = Preferred::Local;
		self.cooldown_until = None;
	}

	/// Applies the outcome of a request against the currently preferred
	/// source. Rate limiting never flips preference — it is a property of
	/// the caller, not the upstream.
	pub fn record_outcome(&mut self, now: Instant, error: Option<&RpcError>) {
		match (self.preferred, error) {
			(Preferred::Local, Some(RpcError::Transient(_) | RpcError::Fatal(_))) => {
				self.preferred = Preferred::Public;
				self.cooldown_until = Some(now + COOLDOWN);
			},
			(Preferred::Public, Some(RpcError::RateLimited)) => {
				// Rate limiting on the public endpoint is not a reason to
				// flip back to local: the local node's absence (or failure)
				// is what caused the flip in the first place.
			},
			_ => {},
		}
	}

	/// Whether the router should try `local` again despite `preferred ==
	/// Public`, e.g. after the cooldown set by `record_outcome` elapses.
	pub fn local_in_cooldown(&self, now: Instant) -> bool {
		self.cooldown_until.map(|until| now < until).unwrap_or(false)
	}
}
