//! Replaying the same write batch (the situation a supervisor restart or a
//! retried commit produces) must never duplicate rows or regress the cursor.

use std::sync::Arc;

use chain_ingestor::{
	model::{Block, ChainId, ChainSpecificBlockData, MetricSample, Position, Source},
	store::{sink::WriteBatchInput, sqlite_store::SqliteStore, CursorStore, Sink},
};

fn sample_block(position: u64) -> Block {
	Block {
		chain: ChainId::Bitcoin,
		position: Position(position),
		hash: format!("{position:064x}"),
		parent_hash: (position > 0).then(|| format!("{:064x}", position - 1)),
		producer_timestamp: chrono::Utc::now(),
		size_bytes: 1024,
		tx_count: 0,
		chain_specific: ChainSpecificBlockData::Bitcoin { difficulty: 1.0, nonce: 0, merkle_root: format!("{position:064x}") },
		source: Source::Public,
		ingested_at: chrono::Utc::now(),
	}
}

fn sample_batch(positions: &[u64]) -> WriteBatchInput {
	let blocks: Vec<Block> = positions.iter().map(|p| sample_block(*p)).collect();
	let highest = Position(*positions.iter().max().unwrap());
	WriteBatchInput {
		chain: ChainId::Bitcoin,
		blocks,
		txs: vec![],
		quality: vec![],
		metric: MetricSample {
			chain: ChainId::Bitcoin,
			cycle_started_at: chrono::Utc::now(),
			duration_ms: 10,
			records_in: positions.len() as u64,
			records_out: positions.len() as u64,
			error_count: 0,
			last_error: None,
		},
		cursor_candidate: highest,
	}
}

#[tokio::test]
async fn replaying_the_same_batch_does_not_duplicate_rows_or_move_the_cursor_backwards() {
	let store = SqliteStore::connect("sqlite::memory:", 3, 500).await.unwrap();

	let first = store.write_batch(sample_batch(&[1, 2])).await.unwrap();
	assert_eq!(first.committed_through, Position(2));

	// Same batch replayed verbatim, as a retried commit would.
	let second = store.write_batch(sample_batch(&[1, 2])).await.unwrap();
	assert_eq!(second.committed_through, Position(2));

	let cursor = store.load(ChainId::Bitcoin).await.unwrap();
	assert_eq!(cursor, Some(Position(2)));
}

#[tokio::test]
async fn a_later_batch_advances_the_cursor_past_an_earlier_one() {
	let store = SqliteStore::connect("sqlite::memory:", 3, 500).await.unwrap();

	store.write_batch(sample_batch(&[1, 2])).await.unwrap();
	let second = store.write_batch(sample_batch(&[3, 4])).await.unwrap();

	assert_eq!(second.committed_through, Position(4));
	assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(4)));
}
