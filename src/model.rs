//! Core data-model entities shared across the RPC clients, collector, and
//! store.

use std::ops::Add;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
	Bitcoin,
	Solana,
}

impl ChainId {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChainId::Bitcoin => "bitcoin",
			ChainId::Solana => "solana",
		}
	}

	pub fn all() -> [ChainId; 2] {
		[ChainId::Bitcoin, ChainId::Solana]
	}
}

impl std::fmt::Display for ChainId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Engine-internal monotonic index of a block (Bitcoin height) or slot
/// (Solana slot). Newtyped so collector arithmetic (`cursor + window`) is
/// type-checked rather than raw `u64` juggling.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Position(pub u64);

impl Position {
	pub fn next(self) -> Position {
		Position(self.0 + 1)
	}

	pub fn saturating_add(self, n: u64) -> Position {
		Position(self.0.saturating_add(n))
	}
}

impl Add<u64> for Position {
	type Output = Position;

	fn add(self, rhs: u64) -> Position {
		Position(self.0 + rhs)
	}
}

impl std::fmt::Display for Position {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Natural key of a block: `(ChainId, position)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
	pub chain: ChainId,
	pub position: Position,
}

/// Chain-specific metadata carried alongside the common block fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainSpecificBlockData {
	Bitcoin { difficulty: f64, nonce: u32, merkle_root: String },
	Solana { parent_slot: u64 },
}

/// Which upstream supplied a record: distinguishes the local node from the
/// public API for Bitcoin, and is always `"public"` for Solana.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
	Local,
	Public,
}

impl Source {
	pub fn as_str(&self) -> &'static str {
		match self {
			Source::Local => "local",
			Source::Public => "public",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
	pub chain: ChainId,
	pub position: Position,
	pub hash: String,
	pub parent_hash: Option<String>,
	pub producer_timestamp: DateTime<Utc>,
	pub size_bytes: u64,
	pub tx_count: u32,
	pub chain_specific: ChainSpecificBlockData,
	pub source: Source,
	pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
	Success,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub chain: ChainId,
	pub tx_id: String,
	pub block_position: Position,
	pub index_in_block: u32,
	pub fee: u64,
	pub size_bytes: u64,
	/// `None` for Bitcoin (implicit success); `Some` for Solana.
	pub status: Option<TxStatus>,
	pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
	Tip,
	Backfill,
}

/// Per-chain resume pointer: the next position a collector should fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
	pub chain: ChainId,
	pub position: Position,
	pub started_at: DateTime<Utc>,
	pub mode: CollectionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	Manual,
	TimeBudget,
	SizeBudget,
	Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRun {
	pub is_running: bool,
	pub started_at: Option<DateTime<Utc>>,
	pub stopped_at: Option<DateTime<Utc>>,
	pub stop_reason: Option<StopReason>,
}

impl Default for CollectionRun {
	fn default() -> Self {
		Self { is_running: false, started_at: None, stopped_at: None, stop_reason: None }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
	Ok,
	Warn,
	Suspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueTag {
	MissingField,
	OutOfBounds,
	ParentHashMismatch,
	TimestampSkew,
	BadHashFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
	pub tag: IssueTag,
	pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
	pub level: QualityLevel,
	pub issues: Vec<QualityIssue>,
}

impl QualityVerdict {
	pub fn ok() -> Self {
		Self { level: QualityLevel::Ok, issues: Vec::new() }
	}

	pub fn downgrade(&mut self, level: QualityLevel, tag: IssueTag, detail: impl Into<String>) {
		if level > self.level {
			self.level = level;
		}
		self.issues.push(QualityIssue { tag, detail: detail.into() });
	}

	pub fn is_ok(&self) -> bool {
		self.level == QualityLevel::Ok
	}
}

/// Per-cycle telemetry sample handed to the metrics recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
	pub chain: ChainId,
	pub cycle_started_at: DateTime<Utc>,
	pub duration_ms: u64,
	pub records_in: u64,
	pub records_out: u64,
	pub error_count: u64,
	pub last_error: Option<String>,
}
