//! Concrete `AnalyticsStore` backing used by the binary and by tests: a
//! `sqlx`-driven SQLite pool. Schema DDL is intentionally minimal — table
//! shape, tiering and retention are an external concern; this module only
//! creates the tables the engine itself needs to function standalone.

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use super::{
	cursor::CursorStore,
	sink::{QualityRecord, Sink, WriteBatchInput, WriteOutcome},
};
use crate::{
	error::EngineError,
	model::{Block, ChainId, ChainSpecificBlockData, Position, Source, Transaction, TxStatus},
};

const LATEST_SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
	pool: SqlitePool,
	max_retries: u32,
	batch_size: usize,
}

impl SqliteStore {
	pub async fn connect(url: &str, max_retries: u32, batch_size: usize) -> anyhow::Result<Self> {
		let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
		let store = Self { pool, max_retries, batch_size: batch_size.max(1) };
		store.migrate().await?;
		Ok(store)
	}

	#[cfg(test)]
	pub async fn in_memory() -> anyhow::Result<Self> {
		Self::connect("sqlite::memory:", 3, 500).await
	}

	/// The underlying connection pool, exposed for integration tests that
	/// need to assert on raw row counts beyond the `Sink`/`CursorStore` traits.
	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	async fn migrate(&self) -> anyhow::Result<()> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS cursor (
				chain TEXT PRIMARY KEY,
				position INTEGER NOT NULL,
				started_at TEXT NOT NULL,
				mode TEXT NOT NULL,
				updated_at TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS blocks_btc (
				position INTEGER PRIMARY KEY,
				hash TEXT NOT NULL,
				parent_hash TEXT,
				producer_timestamp TEXT NOT NULL,
				size_bytes INTEGER NOT NULL,
				tx_count INTEGER NOT NULL,
				difficulty REAL NOT NULL,
				nonce INTEGER NOT NULL,
				merkle_root TEXT NOT NULL,
				source TEXT NOT NULL,
				ingested_at TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS blocks_sol (
				position INTEGER PRIMARY KEY,
				hash TEXT NOT NULL,
				parent_hash TEXT,
				producer_timestamp TEXT NOT NULL,
				size_bytes INTEGER NOT NULL,
				tx_count INTEGER NOT NULL,
				parent_slot INTEGER NOT NULL,
				source TEXT NOT NULL,
				ingested_at TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS txs_btc (
				tx_id TEXT PRIMARY KEY,
				block_position INTEGER NOT NULL,
				index_in_block INTEGER NOT NULL,
				fee INTEGER NOT NULL,
				size_bytes INTEGER NOT NULL,
				source TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS txs_sol (
				tx_id TEXT PRIMARY KEY,
				block_position INTEGER NOT NULL,
				index_in_block INTEGER NOT NULL,
				fee INTEGER NOT NULL,
				size_bytes INTEGER NOT NULL,
				status TEXT,
				source TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS quality (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				chain TEXT NOT NULL,
				position INTEGER NOT NULL,
				tx_id TEXT,
				level TEXT NOT NULL,
				issues TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS metrics (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				chain TEXT NOT NULL,
				cycle_started_at TEXT NOT NULL,
				duration_ms INTEGER NOT NULL,
				records_in INTEGER NOT NULL,
				records_out INTEGER NOT NULL,
				error_count INTEGER NOT NULL,
				last_error TEXT
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query("INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', ?)")
			.bind(LATEST_SCHEMA_VERSION)
			.execute(&self.pool)
			.await?;

		Ok(())
	}

}

async fn insert_block(
	conn: &mut sqlx::SqliteConnection,
	block: &Block,
) -> Result<(), sqlx::Error> {
	match &block.chain_specific {
		ChainSpecificBlockData::Bitcoin { difficulty, nonce, merkle_root } => {
			sqlx::query(
				"INSERT INTO blocks_btc
					(position, hash, parent_hash, producer_timestamp, size_bytes, tx_count, difficulty, nonce, merkle_root, source, ingested_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
				ON CONFLICT(position) DO UPDATE SET
					hash = excluded.hash, parent_hash = excluded.parent_hash,
					producer_timestamp = excluded.producer_timestamp, size_bytes = excluded.size_bytes,
					tx_count = excluded.tx_count, difficulty = excluded.difficulty,
					nonce = excluded.nonce, merkle_root = excluded.merkle_root,
					source = excluded.source, ingested_at = excluded.ingested_at",
			)
			.bind(block.position.0 as i64)
			.bind(&block.hash)
			.bind(&block.parent_hash)
			.bind(block.producer_timestamp.to_rfc3339())
			.bind(block.size_bytes as i64)
			.bind(block.tx_count as i64)
			.bind(difficulty)
			.bind(*nonce as i64)
			.bind(merkle_root)
			.bind(block.source.as_str())
			.bind(block.ingested_at.to_rfc3339())
			.execute(&mut *conn)
			.await?;
		},
		ChainSpecificBlockData::Solana { parent_slot } => {
			sqlx::query(
				"INSERT INTO blocks_sol
					(position, hash, parent_hash, producer_timestamp, size_bytes, tx_count, parent_slot, source, ingested_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
				ON CONFLICT(position) DO UPDATE SET
					hash = excluded.hash, parent_hash = excluded.parent_hash,
					producer_timestamp = excluded.producer_timestamp, size_bytes = excluded.size_bytes,
					tx_count = excluded.tx_count, parent_slot = excluded.parent_slot,
					source = excluded.source, ingested_at = excluded.ingested_at",
			)
			.bind(block.position.0 as i64)
			.bind(&block.hash)
			.bind(&block.parent_hash)
			.bind(block.producer_timestamp.to_rfc3339())
			.bind(block.size_bytes as i64)
			.bind(block.tx_count as i64)
			.bind(*parent_slot as i64)
			.bind(block.source.as_str())
			.bind(block.ingested_at.to_rfc3339())
			.execute(&mut *conn)
			.await?;
		},
	}
	Ok(())
}

async fn insert_transaction(
	conn: &mut sqlx::SqliteConnection,
	tx: &Transaction,
) -> Result<(), sqlx::Error> {
	match tx.chain {
		ChainId::Bitcoin => {
			sqlx::query(
				"INSERT INTO txs_btc (tx_id, block_position, index_in_block, fee, size_bytes, source)
				VALUES (?, ?, ?, ?, ?, ?)
				ON CONFLICT(tx_id) DO UPDATE SET
					block_position = excluded.block_position, index_in_block = excluded.index_in_block,
					fee = excluded.fee, size_bytes = excluded.size_bytes, source = excluded.source",
			)
			.bind(&tx.tx_id)
			.bind(tx.block_position.0 as i64)
			.bind(tx.index_in_block as i64)
			.bind(tx.fee as i64)
			.bind(tx.size_bytes as i64)
			.bind(tx.source.as_str())
			.execute(&mut *conn)
			.await?;
		},
		ChainId::Solana => {
			let status = tx.status.map(|s| match s {
				TxStatus::Success => "success",
				TxStatus::Failed => "failed",
			});
			sqlx::query(
				"INSERT INTO txs_sol (tx_id, block_position, index_in_block, fee, size_bytes, status, source)
				VALUES (?, ?, ?, ?, ?, ?, ?)
				ON CONFLICT(tx_id) DO UPDATE SET
					block_position = excluded.block_position, index_in_block = excluded.index_in_block,
					fee = excluded.fee, size_bytes = excluded.size_bytes, status = excluded.status,
					source = excluded.source",
			)
			.bind(&tx.tx_id)
			.bind(tx.block_position.0 as i64)
			.bind(tx.index_in_block as i64)
			.bind(tx.fee as i64)
			.bind(tx.size_bytes as i64)
			.bind(status)
			.bind(tx.source.as_str())
			.execute(&mut *conn)
			.await?;
		},
	}
	Ok(())
}

async fn insert_quality(
	conn: &mut sqlx::SqliteConnection,
	chain: ChainId,
	record: &QualityRecord,
) -> Result<(), sqlx::Error> {
	let issues = serde_json::to_string(&record.verdict.issues).unwrap_or_default();
	let level = match record.verdict.level {
		crate::model::QualityLevel::Ok => "ok",
		crate::model::QualityLevel::Warn => "warn",
		crate::model::QualityLevel::Suspect => "suspect",
	};
	sqlx::query("INSERT INTO quality (chain, position, tx_id, level, issues) VALUES (?, ?, ?, ?, ?)")
		.bind(chain.as_str())
		.bind(record.position.0 as i64)
		.bind(&record.tx_id)
		.bind(level)
		.bind(issues)
		.execute(&mut *conn)
		.await?;
	Ok(())
}

async fn upsert_cursor(
	conn: &mut sqlx::SqliteConnection,
	chain: ChainId,
	position: Position,
) -> Result<(), sqlx::Error> {
	sqlx::query(
		"INSERT INTO cursor (chain, position, started_at, mode, updated_at)
		VALUES (?, ?, datetime('now'), 'tip', datetime('now'))
		ON CONFLICT(chain) DO UPDATE SET position = excluded.position, updated_at = excluded.updated_at",
	)
	.bind(chain.as_str())
	.bind(position.0 as i64)
	.execute(&mut *conn)
	.await?;
	Ok(())
}

#[async_trait]
impl CursorStore for SqliteStore {
	async fn load(&self, chain: ChainId) -> Result<Option<Position>, EngineError> {
		let row = sqlx::query("SELECT position FROM cursor WHERE chain = ?")
			.bind(chain.as_str())
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;

		Ok(row.map(|r| Position(r.try_get::<i64, _>("position").unwrap_or(0) as u64)))
	}

	async fn reset(&self, chain: ChainId, position: Option<Position>) -> Result<(), EngineError> {
		let mut conn =
			self.pool.acquire().await.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;
		match position {
			Some(position) => upsert_cursor(&mut conn, chain, position)
				.await
				.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?,
			None => {
				sqlx::query("DELETE FROM cursor WHERE chain = ?")
					.bind(chain.as_str())
					.execute(&mut *conn)
					.await
					.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;
			},
		}
		Ok(())
	}
}

#[async_trait]
impl Sink for SqliteStore {
	/// Splits `input` into chunks of at most [`Self::batch_size`] positions —
	/// each chunk is one round trip per target table. Chunks commit in
	/// position order; the first chunk that doesn't fully succeed (even after
	/// retries and poison-isolation) stops the write there, so the cursor
	/// never advances past a gap.
	async fn write_batch(&self, input: WriteBatchInput) -> Result<WriteOutcome, EngineError> {
		if input.blocks.len() <= self.batch_size {
			return self.write_one_chunk(input).await;
		}

		let mut committed_through = None;
		for chunk in chunk_by_position(input, self.batch_size) {
			let chunk_cursor = chunk.cursor_candidate;
			let outcome = self.write_one_chunk(chunk).await?;
			committed_through = Some(outcome.committed_through);
			if outcome.committed_through < chunk_cursor {
				break;
			}
		}
		Ok(WriteOutcome { committed_through: committed_through.unwrap_or_default() })
	}

	/// Total size of the backing database file in bytes, used by the
	/// supervisor's storage safety budget.
	async fn storage_bytes(&self) -> Result<u64, EngineError> {
		let row = sqlx::query("SELECT page_count * page_size as bytes FROM pragma_page_count(), pragma_page_size()")
			.fetch_one(&self.pool)
			.await
			.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;
		let bytes: i64 = row.try_get("bytes").unwrap_or(0);
		Ok(bytes.max(0) as u64)
	}
}

impl SqliteStore {
	async fn write_one_chunk(&self, input: WriteBatchInput) -> Result<WriteOutcome, EngineError> {
		for attempt in 0..=self.max_retries {
			match self.try_write_whole_batch(&input).await {
				Ok(()) => {
					return Ok(WriteOutcome { committed_through: input.cursor_candidate });
				},
				Err(e) => {
					tracing::warn!(
						attempt,
						chain = %input.chain,
						"batch write failed, will retry: {e}"
					);
				},
			}
		}

		// Fall back to per-row inserts so one poisoned record doesn't stall
		// positions that would otherwise commit cleanly.
		self.write_rows_isolating_poison(&input).await
	}

	async fn try_write_whole_batch(&self, input: &WriteBatchInput) -> Result<(), sqlx::Error> {
		let mut tx = self.pool.begin().await?;

		for block in &input.blocks {
			insert_block(&mut tx, block).await?;
		}
		for transaction in &input.txs {
			insert_transaction(&mut tx, transaction).await?;
		}
		for quality in &input.quality {
			insert_quality(&mut tx, input.chain, quality).await?;
		}

		sqlx::query(
			"INSERT INTO metrics (chain, cycle_started_at, duration_ms, records_in, records_out, error_count, last_error)
			VALUES (?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(input.chain.as_str())
		.bind(input.metric.cycle_started_at.to_rfc3339())
		.bind(input.metric.duration_ms as i64)
		.bind(input.metric.records_in as i64)
		.bind(input.metric.records_out as i64)
		.bind(input.metric.error_count as i64)
		.bind(&input.metric.last_error)
		.execute(&mut *tx)
		.await?;

		upsert_cursor(&mut tx, input.chain, input.cursor_candidate).await?;

		tx.commit().await
	}

	async fn write_rows_isolating_poison(
		&self,
		input: &WriteBatchInput,
	) -> Result<WriteOutcome, EngineError> {
		let mut committed_through = match self.load(input.chain).await? {
			Some(position) => position,
			None => Position(0),
		};
		// Once a row poisons, the cursor must stop advancing at the gap it
		// leaves — but later rows still get a chance to land (isolating one
		// bad record must not also drop every block behind it in the batch).
		let mut gap_hit = false;

		for block in &input.blocks {
			let mut conn = self
				.pool
				.acquire()
				.await
				.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;
			match insert_block(&mut conn, block).await {
				Ok(()) => {
					if !gap_hit {
						committed_through = block.position;
					}
				},
				Err(e) => {
					tracing::error!(
						chain = %input.chain,
						position = %block.position,
						"poisoned block row, skipping: {e}"
					);
					gap_hit = true;
				},
			}
		}

		let mut conn =
			self.pool.acquire().await.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;
		for transaction in &input.txs {
			if transaction.block_position > committed_through {
				continue;
			}
			if let Err(e) = insert_transaction(&mut conn, transaction).await {
				tracing::error!(
					chain = %input.chain,
					tx_id = %transaction.tx_id,
					"poisoned transaction row, skipping: {e}"
				);
			}
		}

		upsert_cursor(&mut conn, input.chain, committed_through)
			.await
			.map_err(|e| EngineError::SinkUnavailable(e.to_string()))?;

		Ok(WriteOutcome { committed_through })
	}
}

/// Splits a batch whose block count exceeds `batch_size` into ordered
/// sub-batches, each owning the transactions and quality rows whose
/// position falls within its block range. The last chunk inherits the
/// original `cursor_candidate` (which may sit past its last block, e.g. a
/// run of skipped Solana slots with no block row); every earlier chunk's
/// candidate is its own last block's position.
fn chunk_by_position(input: WriteBatchInput, batch_size: usize) -> Vec<WriteBatchInput> {
	let WriteBatchInput { chain, blocks, mut txs, mut quality, metric, cursor_candidate } = input;
	let block_chunks: Vec<Vec<Block>> =
		blocks.chunks(batch_size).map(|c| c.to_vec()).collect();
	let last_chunk_index = block_chunks.len().saturating_sub(1);

	let mut out = Vec::with_capacity(block_chunks.len());
	for (i, chunk_blocks) in block_chunks.into_iter().enumerate() {
		let upper = chunk_blocks.last().map(|b| b.position);
		let chunk_cursor = if i == last_chunk_index {
			cursor_candidate
		} else {
			upper.unwrap_or(cursor_candidate)
		};

		let (chunk_txs, rest_txs): (Vec<_>, Vec<_>) = txs
			.into_iter()
			.partition(|t| upper.is_some_and(|u| t.block_position <= u));
		txs = rest_txs;

		let (chunk_quality, rest_quality): (Vec<_>, Vec<_>) = quality
			.into_iter()
			.partition(|q| upper.is_some_and(|u| q.position <= u));
		quality = rest_quality;

		out.push(WriteBatchInput {
			chain,
			blocks: chunk_blocks,
			txs: chunk_txs,
			quality: chunk_quality,
			metric: metric.clone(),
			cursor_candidate: chunk_cursor,
		});
	}
	out
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;
	use crate::model::{ChainSpecificBlockData, MetricSample};

	fn sample_block(position: u64) -> Block {
		Block {
			chain: ChainId::Bitcoin,
			position: Position(position),
			hash: format!("hash-{position}"),
			parent_hash: None,
			producer_timestamp: Utc::now(),
			size_bytes: 100,
			tx_count: 0,
			chain_specific: ChainSpecificBlockData::Bitcoin {
				difficulty: 1.0,
				nonce: 0,
				merkle_root: "m".to_string(),
			},
			source: Source::Public,
			ingested_at: Utc::now(),
		}
	}

	fn sample_metric(chain: ChainId) -> MetricSample {
		MetricSample {
			chain,
			cycle_started_at: Utc::now(),
			duration_ms: 10,
			records_in: 1,
			records_out: 1,
			error_count: 0,
			last_error: None,
		}
	}

	#[tokio::test]
	async fn write_batch_advances_cursor_and_is_idempotent() {
		let store = SqliteStore::in_memory().await.unwrap();

		let input = WriteBatchInput {
			chain: ChainId::Bitcoin,
			blocks: vec![sample_block(1), sample_block(2)],
			txs: vec![],
			quality: vec![],
			metric: sample_metric(ChainId::Bitcoin),
			cursor_candidate: Position(2),
		};

		let outcome = store.write_batch(input).await.unwrap();
		assert_eq!(outcome.committed_through, Position(2));
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(2)));

		// Re-inserting the same blocks must be a no-op, not an error.
		let input = WriteBatchInput {
			chain: ChainId::Bitcoin,
			blocks: vec![sample_block(1), sample_block(2)],
			txs: vec![],
			quality: vec![],
			metric: sample_metric(ChainId::Bitcoin),
			cursor_candidate: Position(2),
		};
		store.write_batch(input).await.unwrap();
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(2)));
	}

	#[tokio::test]
	async fn cursor_reset_clears_position() {
		let store = SqliteStore::in_memory().await.unwrap();
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), None);

		store.reset(ChainId::Bitcoin, Some(Position(5))).await.unwrap();
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(5)));

		store.reset(ChainId::Bitcoin, None).await.unwrap();
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), None);
	}

	#[tokio::test]
	async fn a_batch_larger_than_batch_size_commits_in_chunks_but_reaches_the_full_cursor() {
		let store = SqliteStore::connect("sqlite::memory:", 3, 2).await.unwrap();

		let blocks: Vec<Block> = (1..=5).map(sample_block).collect();
		let input = WriteBatchInput {
			chain: ChainId::Bitcoin,
			blocks,
			txs: vec![],
			quality: vec![],
			metric: sample_metric(ChainId::Bitcoin),
			cursor_candidate: Position(5),
		};

		let outcome = store.write_batch(input).await.unwrap();
		assert_eq!(outcome.committed_through, Position(5));
		assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(5)));
		for position in 1..=5 {
			let row = sqlx::query("SELECT position FROM blocks_btc WHERE position = ?")
				.bind(position)
				.fetch_optional(&store.pool)
				.await
				.unwrap();
			assert!(row.is_some(), "block {position} missing after chunked commit");
		}
	}

	#[test]
	fn chunk_by_position_assigns_txs_and_quality_to_the_chunk_covering_their_position() {
		let blocks = vec![sample_block(1), sample_block(2), sample_block(3)];
		let txs = vec![];
		let quality = vec![QualityRecord {
			position: Position(1),
			tx_id: None,
			verdict: crate::model::QualityVerdict::ok(),
		}];
		let input = WriteBatchInput {
			chain: ChainId::Bitcoin,
			blocks,
			txs,
			quality,
			metric: sample_metric(ChainId::Bitcoin),
			cursor_candidate: Position(3),
		};

		let chunks = chunk_by_position(input, 2);
		assert_eq!(chunks.len(), 2);
		assert_eq!(chunks[0].blocks.len(), 2);
		assert_eq!(chunks[0].cursor_candidate, Position(2));
		assert_eq!(chunks[0].quality.len(), 1);
		assert_eq!(chunks[1].blocks.len(), 1);
		assert_eq!(chunks[1].cursor_candidate, Position(3));
		assert_eq!(chunks[1].quality.len(), 0);
	}

	#[tokio::test]
	async fn reopening_a_file_backed_store_sees_the_previously_committed_cursor() {
		let dir = tempfile::tempdir().unwrap();
		let db_path = dir.path().join("chain-ingestor.db");
		let url = format!("sqlite://{}?mode=rwc", db_path.display());

		{
			let store = SqliteStore::connect(&url, 3, 500).await.unwrap();
			store.reset(ChainId::Solana, Some(Position(42))).await.unwrap();
		}

		let reopened = SqliteStore::connect(&url, 3, 500).await.unwrap();
		assert_eq!(reopened.load(ChainId::Solana).await.unwrap(), Some(Position(42)));
	}
}
