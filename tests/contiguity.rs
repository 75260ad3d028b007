//! A gap in the middle of a fetch window must never be skipped over: the
//! committed cursor only ever advances through the longest contiguous run
//! starting right after the previous cursor.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chain_ingestor::{
	collector::{Collector, CollectorConfig},
	error::RpcError,
	model::{ChainId, ChainSpecificBlockData, CollectionMode, Position, Transaction},
	rpc::{ChainRpcApi, FetchedBlock},
	store::{sqlite_store::SqliteStore, CursorStore},
};
use tokio_util::sync::CancellationToken;

struct GappyBitcoinRpc {
	tip: Position,
	missing: Position,
}

#[async_trait]
impl ChainRpcApi for GappyBitcoinRpc {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		Ok(self.tip)
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		if position == self.missing {
			return Err(RpcError::NotFound);
		}
		Ok(FetchedBlock {
			position,
			hash: format!("{:064x}", position.0),
			parent_hash: (position.0 > 0).then(|| format!("{:064x}", position.0 - 1)),
			producer_timestamp: chrono::Utc::now(),
			size_bytes: 1024,
			tx_count: 0,
			chain_specific: ChainSpecificBlockData::Bitcoin {
				difficulty: 1.0,
				nonce: 0,
				merkle_root: format!("{:064x}", position.0),
			},
		})
	}

	async fn get_block_transactions(
		&self,
		_position: Position,
		_limit: u32,
	) -> Result<Vec<Transaction>, RpcError> {
		Ok(vec![])
	}
}

#[tokio::test]
async fn commit_stops_at_first_gap_in_the_window() {
	let store = Arc::new(SqliteStore::connect("sqlite::memory:", 3, 500).await.unwrap());
	let rpc: Arc<dyn ChainRpcApi> = Arc::new(GappyBitcoinRpc { tip: Position(5), missing: Position(3) });

	let config = CollectorConfig {
		chain: ChainId::Bitcoin,
		mode: CollectionMode::Backfill,
		start_position: Some(Position(0)),
		parallelism: 5,
		tx_limit: 0,
		cycle_interval: Duration::from_millis(20),
	};

	let (collector, mut snapshot_rx) = Collector::new(config, rpc, store.clone(), store.clone());
	let token = CancellationToken::new();
	let run_token = token.clone();
	let handle = tokio::spawn(async move { collector.run(&run_token).await });

	// Wait for the first commit to land: positions 1 and 2 are fetchable, 3 is
	// missing, so the cycle must commit through 2 and go no further even
	// though 4 and 5 were also fetched successfully in the same window.
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if snapshot_rx.borrow().cursor == Some(Position(2)) {
				break;
			}
			snapshot_rx.changed().await.unwrap();
		}
	})
	.await
	.expect("collector never committed through position 2");

	token.cancel();
	handle.await.unwrap().unwrap();

	let cursor = store.load(ChainId::Bitcoin).await.unwrap();
	assert_eq!(cursor, Some(Position(2)));
}
