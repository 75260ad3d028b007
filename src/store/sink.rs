//! Batched, idempotent write path.
//!
//! `write_batch` is the only way the cursor advances: it writes blocks,
//! transactions, quality rows and a metric sample, then the cursor, in one
//! backing-store transaction. A partial failure never advances the cursor
//! past the contiguous prefix it actually managed to commit.

use async_trait::async_trait;

use crate::{
	error::EngineError,
	model::{Block, ChainId, MetricSample, Position, QualityVerdict, Transaction},
};

pub struct QualityRecord {
	pub position: Position,
	pub tx_id: Option<String>,
	pub verdict: QualityVerdict,
}

/// One cycle's worth of work offered to the sink. `blocks`/`txs` must
/// already be the longest contiguous prefix starting at `cursor + 1` — the
/// sink does not re-derive contiguity, it only enforces it can't commit past
/// a gap it discovers while writing (a poisoned row).
pub struct WriteBatchInput {
	pub chain: ChainId,
	pub blocks: Vec<Block>,
	pub txs: Vec<Transaction>,
	pub quality: Vec<QualityRecord>,
	pub metric: MetricSample,
	pub cursor_candidate: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
	/// The new cursor position after this batch. May be less than
	/// `cursor_candidate` if a poisoned row forced the batch to stop short.
	pub committed_through: Position,
}

#[async_trait]
pub trait Sink: Send + Sync {
	async fn write_batch(&self, input: WriteBatchInput) -> Result<WriteOutcome, EngineError>;

	/// Total size of the backing store, used by the supervisor's storage
	/// safety budget.
	async fn storage_bytes(&self) -> Result<u64, EngineError>;
}
