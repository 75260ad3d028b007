//! Tip-follow mode against a fresh store must commit the tip block itself on
//! the very first cycle, not wait one cycle behind it.

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

struct FixedTipBitcoinRpc {
	tip: Position,
}

#[async_trait]
impl ChainRpcApi for FixedTipBitcoinRpc {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		Ok(self.tip)
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		if position > self.tip {
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
async fn first_cycle_against_an_empty_store_commits_exactly_the_tip() {
	let store = Arc::new(SqliteStore::connect("sqlite::memory:", 3, 500).await.unwrap());
	let rpc: Arc<dyn ChainRpcApi> = Arc::new(FixedTipBitcoinRpc { tip: Position(800_000) });

	let config = CollectorConfig {
		chain: ChainId::Bitcoin,
		mode: CollectionMode::Tip,
		start_position: None,
		parallelism: 1,
		tx_limit: 0,
		cycle_interval: Duration::from_millis(20),
	};

	let (collector, mut snapshot_rx) = Collector::new(config, rpc, store.clone(), store.clone());
	let token = CancellationToken::new();
	let run_token = token.clone();
	let handle = tokio::spawn(async move { collector.run(&run_token).await });

	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if snapshot_rx.borrow().cursor == Some(Position(800_000)) {
				break;
			}
			snapshot_rx.changed().await.unwrap();
		}
	})
	.await
	.expect("collector never committed the tip block");

	token.cancel();
	handle.await.unwrap().unwrap();

	assert_eq!(store.load(ChainId::Bitcoin).await.unwrap(), Some(Position(800_000)));
	let count: i64 =
		sqlx::query_scalar("SELECT COUNT(*) FROM blocks_btc").fetch_one(store.pool()).await.unwrap();
	assert_eq!(count, 1);
}

#[tokio::test]
async fn tip_mode_collector_behind_by_more_than_one_catches_up_using_full_parallelism() {
	let store = Arc::new(SqliteStore::connect("sqlite::memory:", 3, 500).await.unwrap());
	store.reset(ChainId::Bitcoin, Some(Position(799_990))).await.unwrap();
	let rpc: Arc<dyn ChainRpcApi> = Arc::new(FixedTipBitcoinRpc { tip: Position(800_000) });

	// Mirrors config/default.toml's actual Bitcoin tip config: `mode = "tip"`
	// with `parallelism = 10`, so a restart that leaves the collector behind
	// tip must fetch a window wider than one position per cycle.
	let config = CollectorConfig {
		chain: ChainId::Bitcoin,
		mode: CollectionMode::Tip,
		start_position: None,
		parallelism: 10,
		tx_limit: 0,
		cycle_interval: Duration::from_millis(20),
	};

	let (collector, mut snapshot_rx) = Collector::new(config, rpc, store.clone(), store.clone());
	let token = CancellationToken::new();
	let run_token = token.clone();
	let handle = tokio::spawn(async move { collector.run(&run_token).await });

	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if snapshot_rx.borrow().cursor == Some(Position(800_000)) {
				break;
			}
			snapshot_rx.changed().await.unwrap();
		}
	})
	.await
	.expect("collector never caught up to tip");

	token.cancel();
	handle.await.unwrap().unwrap();

	let count: i64 =
		sqlx::query_scalar("SELECT COUNT(*) FROM blocks_btc").fetch_one(store.pool()).await.unwrap();
	assert!(count > 1, "a single-position fetch window never catches up from behind tip");
}
