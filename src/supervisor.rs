//! Collection Supervisor: owns per-chain collector lifecycles, enforces
//! run-level safety budgets, and answers the control-plane's
//! Start/Stop/Status/Health/BackfillProgress queries.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
	collector::{Collector, CollectorConfig, CollectorSnapshot},
	config::Settings,
	model::{ChainId, CollectionMode, StopReason},
	rpc::{
		bitcoin_dual::BitcoinDualClient, bitcoin_rest::BitcoinRestClient, bitcoin_rpc::BitcoinRpcClient,
		solana_rpc::SolanaRpcClient, ChainRpcApi,
	},
	store::{CursorStore, Sink},
	task_scope::Scope,
};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
	Accepted,
	AlreadyRunning,
	Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	Stopped(StopReason),
	NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainHealth {
	Healthy,
	Degraded,
	Unhealthy,
}

pub struct PerChainStatus {
	pub position: Option<u64>,
	pub records: u64,
	pub rate_per_sec: f64,
	pub last_error: Option<String>,
}

pub struct StatusReport {
	pub is_running: bool,
	pub started_at: Option<DateTime<Utc>>,
	pub per_chain: HashMap<ChainId, PerChainStatus>,
}

pub struct PerChainHealth {
	pub health: ChainHealth,
	pub seconds_since_last_commit: Option<i64>,
	pub error_count_5m: u32,
}

pub struct HealthReport {
	pub overall: ChainHealth,
	pub per_chain: HashMap<ChainId, PerChainHealth>,
}

pub struct BackfillProgressEntry {
	pub start: Option<u64>,
	pub current: Option<u64>,
	pub target: Option<u64>,
	pub percent: Option<f64>,
}

struct CollectorHandle {
	snapshot_rx: watch::Receiver<CollectorSnapshot>,
	join_handle: JoinHandle<()>,
	mode: CollectionMode,
}

struct RunState {
	started_at: Option<DateTime<Utc>>,
	cancellation: Option<CancellationToken>,
	collectors: HashMap<ChainId, CollectorHandle>,
	stop_reason: Option<StopReason>,
}

impl RunState {
	fn idle() -> Self {
		Self { started_at: None, cancellation: None, collectors: HashMap::new(), stop_reason: None }
	}

	fn is_running(&self) -> bool {
		self.started_at.is_some()
	}
}

/// Owns the run's state across `Start`/`Stop` calls. `scope` is used only to
/// spawn collector tasks; a run's own cancellation is a dedicated token so a
/// `Stop` followed by a later `Start` doesn't need a fresh process scope.
pub struct Supervisor {
	settings: Settings,
	sink: Arc<dyn Sink>,
	cursor_store: Arc<dyn CursorStore>,
	scope: Scope<'static, anyhow::Error>,
	run: tokio::sync::Mutex<RunState>,
}

impl Supervisor {
	pub fn new(
		settings: Settings,
		sink: Arc<dyn Sink>,
		cursor_store: Arc<dyn CursorStore>,
		scope: Scope<'static, anyhow::Error>,
	) -> Self {
		Self { settings, sink, cursor_store, scope, run: tokio::sync::Mutex::new(RunState::idle()) }
	}

	/// Bitcoin always gets a [`BitcoinDualClient`], even with no local node
	/// configured — it then just always prefers public, so the collector
	/// has one uniform `ChainRpcApi` to drive regardless of topology.
	fn build_rpc_client(&self, chain: ChainId) -> anyhow::Result<Arc<dyn ChainRpcApi>> {
		match chain {
			ChainId::Bitcoin => {
				let public: Arc<dyn ChainRpcApi> =
					Arc::new(BitcoinRestClient::new(self.settings.bitcoin.public_rest_endpoint.clone())?);
				let local: Option<Arc<dyn ChainRpcApi>> = if self.settings.bitcoin.use_local_node {
					match (
						self.settings.bitcoin.local_rpc_endpoint.clone(),
						self.settings.bitcoin.local_rpc_user.clone(),
						self.settings.bitcoin.local_rpc_password.clone(),
					) {
						(Some(endpoint), Some(user), Some(password)) =>
							Some(Arc::new(BitcoinRpcClient::new(endpoint, user, password)?)),
						_ => None,
					}
				} else {
					None
				};
				Ok(Arc::new(BitcoinDualClient::new(local, public, self.settings.bitcoin.use_local_node)))
			},
			ChainId::Solana => Ok(Arc::new(SolanaRpcClient::new(self.settings.solana.rpc_endpoint.clone())?)),
		}
	}

	fn collector_config(&self, chain: ChainId) -> CollectorConfig {
		let cycle_interval = Duration::from_secs(self.settings.cycle_interval_seconds);
		match chain {
			ChainId::Bitcoin => CollectorConfig {
				chain,
				mode: match self.settings.bitcoin.mode {
					crate::config::CollectionModeSetting::Tip => CollectionMode::Tip,
					crate::config::CollectionModeSetting::Backfill => CollectionMode::Backfill,
				},
				start_position: start_position_from_setting(self.settings.bitcoin.start_position),
				parallelism: self.settings.bitcoin.parallelism,
				tx_limit: self.settings.bitcoin.tx_limit,
				cycle_interval,
			},
			ChainId::Solana => CollectorConfig {
				chain,
				mode: match self.settings.solana.mode {
					crate::config::CollectionModeSetting::Tip => CollectionMode::Tip,
					crate::config::CollectionModeSetting::Backfill => CollectionMode::Backfill,
				},
				start_position: start_position_from_setting(self.settings.solana.start_position),
				parallelism: self.settings.solana.parallelism,
				tx_limit: self.settings.solana.tx_limit,
				cycle_interval,
			},
		}
	}

	/// Spawns one collector per enabled chain. Idempotent: a second call
	/// while a run is already open just reports `AlreadyRunning`.
	pub async fn start(&self) -> StartOutcome {
		let mut run = self.run.lock().await;
		if run.is_running() {
			return StartOutcome::AlreadyRunning;
		}

		if let Err(e) = self.sink.storage_bytes().await {
			return StartOutcome::Rejected(format!("store unreachable: {e}"));
		}

		let enabled_chains: Vec<ChainId> =
			[(ChainId::Bitcoin, self.settings.bitcoin.enabled), (ChainId::Solana, self.settings.solana.enabled)]
				.into_iter()
				.filter_map(|(chain, enabled)| enabled.then_some(chain))
				.collect();

		let mut rpc_clients = HashMap::new();
		for chain in &enabled_chains {
			match self.build_rpc_client(*chain) {
				Ok(rpc) => {
					rpc_clients.insert(*chain, rpc);
				},
				Err(e) => return StartOutcome::Rejected(format!("{chain}: {e}")),
			}
		}

		let cancellation = CancellationToken::new();
		let mut collectors = HashMap::new();

		for chain in enabled_chains {
			let config = self.collector_config(chain);
			let mode = config.mode;
			let rpc = rpc_clients.remove(&chain).expect("built above for every enabled chain");

			let (collector, snapshot_rx) =
				Collector::new(config, rpc, self.sink.clone(), self.cursor_store.clone());
			let token = cancellation.clone();
			let join_handle = tokio::spawn(async move {
				if let Err(e) = collector.run(&token).await {
					tracing::error!(chain = %chain, "collector exited with error: {e}");
				}
			});

			collectors.insert(chain, CollectorHandle { snapshot_rx, join_handle, mode });
		}

		run.started_at = Some(Utc::now());
		run.cancellation = Some(cancellation);
		run.collectors = collectors;
		run.stop_reason = None;
		StartOutcome::Accepted
	}

	/// Cancels every collector, waits up to [`STOP_GRACE_PERIOD`] for them to
	/// drain a final commit, then closes the run.
	pub async fn stop(&self, reason: StopReason) -> StopOutcome {
		let mut run = self.run.lock().await;
		if !run.is_running() {
			return StopOutcome::NotRunning;
		}

		if let Some(token) = &run.cancellation {
			token.cancel();
		}

		let handles: Vec<_> = run.collectors.drain().map(|(_, handle)| handle.join_handle).collect();
		let _ = tokio::time::timeout(STOP_GRACE_PERIOD, futures::future::join_all(handles)).await;

		run.started_at = None;
		run.cancellation = None;
		run.stop_reason = Some(reason);
		tracing::info!(?reason, "collection run stopped");
		StopOutcome::Stopped(reason)
	}

	/// The reason the most recently closed run stopped, if any. `None` both
	/// before the first run and while a run is currently open.
	pub async fn last_stop_reason(&self) -> Option<StopReason> {
		self.run.lock().await.stop_reason
	}

	/// Checked once per cycle by the owner of the supervisor's run loop (see
	/// `control_plane`'s background ticker): stops the run if a run-level
	/// budget has tripped.
	pub async fn check_budgets(&self) -> Option<StopReason> {
		let run = self.run.lock().await;
		let started_at = run.started_at?;
		drop(run);

		if self.settings.max_duration_minutes > 0 {
			let elapsed = Utc::now().signed_duration_since(started_at);
			if elapsed.num_minutes() as u64 >= self.settings.max_duration_minutes {
				self.stop(StopReason::TimeBudget).await;
				return Some(StopReason::TimeBudget);
			}
		}

		if let Ok(storage_bytes) = self.sink.storage_bytes().await {
			let max_bytes = (self.settings.max_size_gb * 1_000_000_000.0) as u64;
			if max_bytes > 0 && storage_bytes >= max_bytes {
				self.stop(StopReason::SizeBudget).await;
				return Some(StopReason::SizeBudget);
			}
		}

		None
	}

	/// Starts a best-effort background ticker that calls [`Self::check_budgets`]
	/// every cycle interval, via the process-wide [`Scope`] this supervisor
	/// was built with. Its own failure (it never returns `Err`) does not
	/// bring the process down.
	pub fn spawn_budget_ticker(self: &Arc<Self>) {
		let supervisor = self.clone();
		let interval = Duration::from_secs(self.settings.cycle_interval_seconds.max(1));
		self.scope.spawn_weak(async move {
			loop {
				tokio::time::sleep(interval).await;
				supervisor.check_budgets().await;
			}
		});
	}

	pub async fn status(&self) -> StatusReport {
		let run = self.run.lock().await;
		let mut per_chain = HashMap::new();
		for (chain, handle) in &run.collectors {
			let snapshot = handle.snapshot_rx.borrow().clone();
			per_chain.insert(
				*chain,
				PerChainStatus {
					position: snapshot.cursor.map(|p| p.0),
					records: snapshot.records_committed_total,
					rate_per_sec: snapshot.rate_per_sec,
					last_error: snapshot.last_error,
				},
			);
		}
		StatusReport { is_running: run.is_running(), started_at: run.started_at, per_chain }
	}

	pub async fn health(&self) -> HealthReport {
		let run = self.run.lock().await;
		let now = Utc::now();
		let mut per_chain = HashMap::new();
		let mut overall = ChainHealth::Healthy;

		for (chain, handle) in &run.collectors {
			let snapshot = handle.snapshot_rx.borrow().clone();
			let seconds_since_last_commit =
				snapshot.last_commit_at.map(|t| now.signed_duration_since(t).num_seconds());

			let health = if snapshot.is_fatal {
				ChainHealth::Unhealthy
			} else {
				match seconds_since_last_commit {
					Some(s) if s < 60 && snapshot.error_count_recent < 5 => ChainHealth::Healthy,
					Some(s) if s < 300 => ChainHealth::Degraded,
					None if snapshot.error_count_recent < 5 => ChainHealth::Degraded,
					_ => ChainHealth::Unhealthy,
				}
			};

			if health == ChainHealth::Unhealthy {
				overall = ChainHealth::Unhealthy;
			} else if health == ChainHealth::Degraded && overall == ChainHealth::Healthy {
				overall = ChainHealth::Degraded;
			}

			per_chain.insert(
				*chain,
				PerChainHealth {
					health,
					seconds_since_last_commit,
					error_count_5m: snapshot.error_count_recent,
				},
			);
		}

		if run.collectors.is_empty() {
			overall = ChainHealth::Unhealthy;
		}

		HealthReport { overall, per_chain }
	}

	pub async fn backfill_progress(&self) -> HashMap<ChainId, BackfillProgressEntry> {
		let run = self.run.lock().await;
		let mut out = HashMap::new();
		for (chain, handle) in &run.collectors {
			if handle.mode != CollectionMode::Backfill {
				continue;
			}
			let snapshot = handle.snapshot_rx.borrow().clone();
			let percent = match (snapshot.backfill_start, snapshot.backfill_target, snapshot.cursor) {
				(Some(start), Some(target), Some(current)) if target.0 > start.0 => {
					Some(((current.0 - start.0) as f64 / (target.0 - start.0) as f64) * 100.0)
				},
				_ => None,
			};
			out.insert(
				*chain,
				BackfillProgressEntry {
					start: snapshot.backfill_start.map(|p| p.0),
					current: snapshot.cursor.map(|p| p.0),
					target: snapshot.backfill_target.map(|p| p.0),
					percent,
				},
			);
		}
		out
	}
}

fn start_position_from_setting(raw: i64) -> Option<crate::model::Position> {
	if raw >= 0 {
		Some(crate::model::Position(raw as u64))
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negative_start_position_means_unset() {
		assert!(start_position_from_setting(-1).is_none());
		assert_eq!(start_position_from_setting(0), Some(crate::model::Position(0)));
	}
}
