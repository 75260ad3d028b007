//! Per-chain collector: an explicit state machine driving
//! `discover -> plan -> fetch -> commit -> throttle`.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::Arc,
	time::{Duration, Instant},
};

use chrono::Utc;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
	error::{EngineError, RpcError},
	model::{
		Block, ChainId, CollectionMode, MetricSample, Position, QualityLevel, Transaction,
	},
	rpc::{ChainRpcApi, FetchedBlock},
	store::{
		sink::{QualityRecord, Sink, WriteBatchInput},
		CursorStore,
	},
	validator::{self, ChainRules, ValidationContext},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
const CYCLE_SOFT_CAP: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_SKIPPED: u32 = 10;
const ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Static configuration a collector runs with for its whole lifetime.
pub struct CollectorConfig {
	pub chain: ChainId,
	pub mode: CollectionMode,
	pub start_position: Option<Position>,
	pub parallelism: u32,
	pub tx_limit: u32,
	pub cycle_interval: Duration,
}

/// What the collector publishes for the supervisor to read. Collectors never
/// call back into the supervisor; they only publish into this channel.
#[derive(Debug, Clone)]
pub struct CollectorSnapshot {
	pub cursor: Option<Position>,
	pub backfill_start: Option<Position>,
	pub backfill_target: Option<Position>,
	pub last_commit_at: Option<chrono::DateTime<Utc>>,
	pub records_committed_total: u64,
	/// Sink errors inside the trailing `ERROR_WINDOW`, not a lifetime total.
	pub error_count_recent: u32,
	pub last_error: Option<String>,
	pub is_fatal: bool,
	pub rate_per_sec: f64,
}

impl Default for CollectorSnapshot {
	fn default() -> Self {
		Self {
			cursor: None,
			backfill_start: None,
			backfill_target: None,
			last_commit_at: None,
			records_committed_total: 0,
			error_count_recent: 0,
			last_error: None,
			is_fatal: false,
			rate_per_sec: 0.0,
		}
	}
}

enum CollectorState {
	Idle,
	Discovering,
	Planning { cursor: Position, tip: Position },
	Fetching { cursor: Position, target: Position },
	Committing { cursor: Position, blocks: Vec<Block>, txs: Vec<Transaction>, quality: Vec<QualityRecord>, highest_committable: Position, records_in: u64, rate_limited: bool },
	Throttling { rate_limited: bool },
	Stopped,
	Fatal(EngineError),
}

struct FetchOutcome {
	block: Option<FetchedBlock>,
	txs: Vec<Transaction>,
	error: Option<RpcError>,
}

pub struct Collector {
	config: CollectorConfig,
	rpc: Arc<dyn ChainRpcApi>,
	sink: Arc<dyn Sink>,
	cursor_store: Arc<dyn CursorStore>,
	rules: Box<dyn ChainRules>,
	backoff: Duration,
	records_committed_total: u64,
	recent_errors: VecDeque<Instant>,
	snapshot_tx: watch::Sender<CollectorSnapshot>,
	cycle_started_at: Instant,
}

impl Collector {
	pub fn new(
		config: CollectorConfig,
		rpc: Arc<dyn ChainRpcApi>,
		sink: Arc<dyn Sink>,
		cursor_store: Arc<dyn CursorStore>,
	) -> (Self, watch::Receiver<CollectorSnapshot>) {
		let (snapshot_tx, snapshot_rx) = watch::channel(CollectorSnapshot::default());
		let rules = validator::rules_for(config.chain);
		(
			Self {
				config,
				rpc,
				sink,
				cursor_store,
				rules,
				backoff: INITIAL_BACKOFF,
				records_committed_total: 0,
				recent_errors: VecDeque::new(),
				snapshot_tx,
				cycle_started_at: Instant::now(),
			},
			snapshot_rx,
		)
	}

	/// Records a sink error now and returns the count of errors still inside
	/// the trailing `ERROR_WINDOW` (including this one). Errors older than the
	/// window are dropped, so a chain that had a burst long ago and has since
	/// recovered is not stuck reporting it forever.
	fn record_error_and_window_count(&mut self) -> u32 {
		let now = Instant::now();
		self.recent_errors.push_back(now);
		while self.recent_errors.front().is_some_and(|&t| now.duration_since(t) > ERROR_WINDOW) {
			self.recent_errors.pop_front();
		}
		self.recent_errors.len() as u32
	}

	/// Drives the state machine until `cancellation` fires.
	pub async fn run(mut self, cancellation: &CancellationToken) -> Result<(), EngineError> {
		let mut state = CollectorState::Idle;
		loop {
			if cancellation.is_cancelled() {
				return Ok(());
			}
			state = match state {
				CollectorState::Idle => self.step_idle(cancellation).await,
				CollectorState::Discovering => self.step_discovering().await,
				CollectorState::Planning { cursor, tip } => self.step_planning(cursor, tip),
				CollectorState::Fetching { cursor, target } =>
					self.step_fetching(cancellation, cursor, target).await,
				CollectorState::Committing { cursor, blocks, txs, quality, highest_committable, records_in, rate_limited } =>
					self.step_committing(cancellation, cursor, blocks, txs, quality, highest_committable, records_in, rate_limited).await,
				CollectorState::Throttling { rate_limited } => self.step_throttling(cancellation, rate_limited).await,
				CollectorState::Stopped => return Ok(()),
				CollectorState::Fatal(e) => {
					self.publish_fatal(&e);
					return Err(e);
				},
			};
		}
	}

	async fn step_idle(&mut self, cancellation: &CancellationToken) -> CollectorState {
		if cancellation.is_cancelled() {
			CollectorState::Stopped
		} else {
			CollectorState::Discovering
		}
	}

	async fn step_discovering(&mut self) -> CollectorState {
		self.cycle_started_at = Instant::now();
		let tip = match self.rpc.get_tip_height().await {
			Ok(tip) => tip,
			Err(e) => return self.handle_rpc_error(e),
		};

		let cursor = match self.cursor_store.load(self.config.chain).await {
			Ok(Some(position)) => position,
			Ok(None) => match (self.config.mode, self.config.start_position) {
				(CollectionMode::Backfill, Some(start)) => {
					if start.0 == 0 {
						Position(0)
					} else {
						Position(start.0 - 1)
					}
				},
				(CollectionMode::Backfill, None) => Position(0),
				// Tip-follow with no cursor yet must still fetch the tip block
				// itself on the first cycle, so the synthetic starting cursor
				// sits one behind the tip rather than on it (same fencepost
				// convention as the backfill-from-zero arm above).
				(CollectionMode::Tip, _) => Position(tip.0.saturating_sub(1)),
			},
			Err(e) => return CollectorState::Fatal(e),
		};

		CollectorState::Planning { cursor, tip }
	}

	fn step_planning(&mut self, cursor: Position, tip: Position) -> CollectorState {
		if cursor >= tip {
			return CollectorState::Throttling { rate_limited: false };
		}
		// Reaching this point means cursor < tip, i.e. the collector is behind:
		// the window is always the configured parallelism, clamped to the tip
		// by the `min` below — a collector caught up within one position of
		// tip naturally gets a window of 1 out of that clamp, without needing
		// a separate branch on collection mode.
		let window = self.config.parallelism as u64;
		let target = Position(tip.0.min(cursor.0 + window));

		if matches!(self.config.mode, CollectionMode::Backfill) {
			self.snapshot_tx.send_modify(|s| {
				s.backfill_start.get_or_insert(cursor);
				s.backfill_target = Some(tip);
			});
		}

		CollectorState::Fetching { cursor, target }
	}

	async fn step_fetching(
		&mut self,
		cancellation: &CancellationToken,
		cursor: Position,
		target: Position,
	) -> CollectorState {
		if cancellation.is_cancelled() {
			return CollectorState::Stopped;
		}
		let positions: Vec<Position> = ((cursor.0 + 1)..=target.0).map(Position).collect();
		let mut results: BTreeMap<Position, FetchOutcome> = BTreeMap::new();

		let mut futures = FuturesUnordered::new();
		for position in positions {
			let rpc = self.rpc.clone();
			let tx_limit = self.config.tx_limit;
			futures.push(async move {
				let block = rpc.get_block(position).await;
				match block {
					Ok(block) => {
						let txs = rpc.get_block_transactions(position, tx_limit).await;
						match txs {
							Ok(txs) => (position, FetchOutcome { block: Some(block), txs, error: None }),
							Err(e) => (position, FetchOutcome { block: Some(block), txs: vec![], error: Some(e) }),
						}
					},
					Err(RpcError::Skipped) =>
						(position, FetchOutcome { block: None, txs: vec![], error: Some(RpcError::Skipped) }),
					Err(e) => (position, FetchOutcome { block: None, txs: vec![], error: Some(e) }),
				}
			});
		}

		let mut rate_limited = false;
		while let Some((position, outcome)) = futures.next().await {
			if matches!(outcome.error, Some(RpcError::RateLimited)) {
				rate_limited = true;
			}
			results.insert(position, outcome);
		}

		let mut blocks = Vec::new();
		let mut txs = Vec::new();
		let mut quality = Vec::new();
		let mut records_in = 0u64;
		let mut highest_committable = cursor;
		let mut previous_hash: Option<String> = None;
		let mut consecutive_skipped = 0u32;

		for (position, outcome) in results {
			match outcome.error {
				Some(RpcError::NotFound) => break,
				Some(RpcError::Skipped) => {
					consecutive_skipped += 1;
					if consecutive_skipped > MAX_CONSECUTIVE_SKIPPED {
						break;
					}
					highest_committable = position;
					continue;
				},
				Some(RpcError::RateLimited | RpcError::Transient(_)) => break,
				Some(RpcError::Fatal(msg)) => return CollectorState::Fatal(EngineError::Fatal(msg)),
				None => {},
			}
			consecutive_skipped = 0;

			let Some(fetched) = outcome.block else { break };
			records_in += 1;

			let block = Block {
				chain: self.config.chain,
				position: fetched.position,
				hash: fetched.hash.clone(),
				parent_hash: fetched.parent_hash.clone(),
				producer_timestamp: fetched.producer_timestamp,
				size_bytes: fetched.size_bytes,
				tx_count: fetched.tx_count,
				chain_specific: fetched.chain_specific,
				source: self.rpc.current_source(),
				ingested_at: Utc::now(),
			};

			let ctx = ValidationContext {
				now: Utc::now(),
				previous_committed_hash: previous_hash.as_deref(),
				is_tip_mode: matches!(self.config.mode, CollectionMode::Tip),
			};
			let verdict = validator::validate_block(&block, self.rules.as_ref(), &ctx);
			if verdict.level != QualityLevel::Ok {
				quality.push(QualityRecord { position, tx_id: None, verdict });
			}
			previous_hash = Some(block.hash.clone());

			for transaction in &outcome.txs {
				records_in += 1;
				let verdict = validator::validate_transaction(transaction, self.rules.as_ref());
				if verdict.level != QualityLevel::Ok {
					quality.push(QualityRecord {
						position,
						tx_id: Some(transaction.tx_id.clone()),
						verdict,
					});
				}
			}

			txs.extend(outcome.txs);
			highest_committable = position;
			blocks.push(block);
		}

		CollectorState::Committing {
			cursor,
			blocks,
			txs,
			quality,
			highest_committable,
			records_in,
			rate_limited,
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn step_committing(
		&mut self,
		cancellation: &CancellationToken,
		cursor: Position,
		blocks: Vec<Block>,
		txs: Vec<Transaction>,
		quality: Vec<QualityRecord>,
		highest_committable: Position,
		records_in: u64,
		rate_limited: bool,
	) -> CollectorState {
		if cancellation.is_cancelled() {
			return CollectorState::Stopped;
		}
		if highest_committable <= cursor {
			return CollectorState::Throttling { rate_limited };
		}

		let elapsed = self.cycle_started_at.elapsed();
		if elapsed > CYCLE_SOFT_CAP {
			tracing::warn!(chain = %self.config.chain, elapsed_ms = elapsed.as_millis(), "cycle exceeded soft time cap");
		}

		let metric = MetricSample {
			chain: self.config.chain,
			cycle_started_at: Utc::now(),
			duration_ms: elapsed.as_millis() as u64,
			records_in,
			records_out: blocks.len() as u64 + txs.len() as u64,
			error_count: 0,
			last_error: None,
		};

		let input = WriteBatchInput {
			chain: self.config.chain,
			blocks,
			txs,
			quality,
			metric: metric.clone(),
			cursor_candidate: highest_committable,
		};

		match self.sink.write_batch(input).await {
			Ok(outcome) => {
				self.records_committed_total += metric.records_out;
				crate::metrics::record_cycle(
					self.config.chain,
					records_in,
					metric.records_out,
					metric.duration_ms as i64,
					outcome.committed_through.0,
				);
				let rate_per_sec = if elapsed.as_secs_f64() > 0.0 {
					metric.records_out as f64 / elapsed.as_secs_f64()
				} else {
					0.0
				};
				self.snapshot_tx.send_modify(|s| {
					s.cursor = Some(outcome.committed_through);
					s.last_commit_at = Some(Utc::now());
					s.records_committed_total = self.records_committed_total;
					s.last_error = None;
					s.rate_per_sec = rate_per_sec;
					if matches!(self.config.mode, CollectionMode::Backfill)
						&& s.backfill_target.is_some_and(|t| outcome.committed_through >= t)
					{
						s.backfill_start = None;
						s.backfill_target = None;
					}
				});
				CollectorState::Throttling { rate_limited }
			},
			Err(e) => {
				crate::metrics::record_error(self.config.chain, e.kind().as_str());
				let error_count_recent = self.record_error_and_window_count();
				self.snapshot_tx.send_modify(|s| {
					s.error_count_recent = error_count_recent;
					s.last_error = Some(e.to_string());
				});
				if e.is_fatal() {
					CollectorState::Fatal(e)
				} else {
					CollectorState::Throttling { rate_limited }
				}
			},
		}
	}

	async fn step_throttling(&mut self, cancellation: &CancellationToken, rate_limited: bool) -> CollectorState {
		if rate_limited {
			self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
		} else {
			self.backoff = INITIAL_BACKOFF;
		}

		let sleep_for = if rate_limited { self.backoff } else { self.config.cycle_interval };

		tokio::select! {
			_ = cancellation.cancelled() => CollectorState::Stopped,
			_ = tokio::time::sleep(sleep_for) => CollectorState::Idle,
		}
	}

	fn handle_rpc_error(&mut self, e: RpcError) -> CollectorState {
		crate::metrics::record_error(self.config.chain, EngineError::from(e.clone()).kind().as_str());
		match e {
			RpcError::Fatal(msg) => CollectorState::Fatal(EngineError::Fatal(msg)),
			RpcError::RateLimited => CollectorState::Throttling { rate_limited: true },
			_ => CollectorState::Throttling { rate_limited: false },
		}
	}

	fn publish_fatal(&self, e: &EngineError) {
		self.snapshot_tx.send_modify(|s| {
			s.is_fatal = true;
			s.last_error = Some(e.to_string());
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::MockChainRpcApi;

	#[tokio::test]
	async fn fatal_tip_error_moves_collector_to_fatal_state() {
		let mut rpc = MockChainRpcApi::new();
		rpc.expect_get_tip_height().returning(|| Err(RpcError::Fatal("rpc down".into())));

		let store = Arc::new(crate::store::sqlite_store::SqliteStore::in_memory().await.unwrap());
		let config = CollectorConfig {
			chain: ChainId::Bitcoin,
			mode: CollectionMode::Tip,
			start_position: None,
			parallelism: 1,
			tx_limit: 0,
			cycle_interval: Duration::from_secs(5),
		};
		let (mut collector, _rx) = Collector::new(config, Arc::new(rpc), store.clone(), store);

		let state = collector.step_discovering().await;
		assert!(matches!(state, CollectorState::Fatal(EngineError::Fatal(_))));
	}

	#[tokio::test]
	async fn rate_limited_tip_error_throttles_instead_of_failing() {
		let mut rpc = MockChainRpcApi::new();
		rpc.expect_get_tip_height().returning(|| Err(RpcError::RateLimited));

		let store = Arc::new(crate::store::sqlite_store::SqliteStore::in_memory().await.unwrap());
		let config = CollectorConfig {
			chain: ChainId::Solana,
			mode: CollectionMode::Tip,
			start_position: None,
			parallelism: 1,
			tx_limit: 0,
			cycle_interval: Duration::from_secs(5),
		};
		let (mut collector, _rx) = Collector::new(config, Arc::new(rpc), store.clone(), store);

		let state = collector.step_discovering().await;
		assert!(matches!(state, CollectorState::Throttling { rate_limited: true }));
	}

	#[test]
	fn planning_caps_window_at_tip() {
		let config = CollectorConfig {
			chain: ChainId::Bitcoin,
			mode: CollectionMode::Backfill,
			start_position: Some(Position(0)),
			parallelism: 5,
			tx_limit: 0,
			cycle_interval: Duration::from_secs(5),
		};
		// window = min(tip, cursor + parallelism)
		let cursor = Position(0);
		let tip = Position(3);
		let window = config.parallelism as u64;
		let target = Position(tip.0.min(cursor.0 + window));
		assert_eq!(target, Position(3));
	}

	#[test]
	fn committing_is_skipped_when_nothing_new_was_fetched() {
		let cursor = Position(10);
		let highest_committable = Position(10);
		assert!(highest_committable <= cursor);
	}
}
