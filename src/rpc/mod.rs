//! Upstream RPC clients.
//!
//! Every chain-specific client implements [`ChainRpcApi`], the capability
//! set the collector drives: discover the tip, fetch one block, fetch its
//! transactions, and classify a transport failure into [`crate::error::RpcError`].
//! There is no shared base client — a Bitcoin REST client, a Bitcoin JSON-RPC
//! client and a Solana JSON-RPC client each implement the trait directly, and
//! composition (not inheritance) is what lets the collector state machine
//! stay chain-agnostic.

pub mod bitcoin_dual;
pub mod bitcoin_rest;
pub mod bitcoin_rpc;
pub mod solana_rpc;

use async_trait::async_trait;

use crate::{
	error::RpcError,
	model::{Position, Source, Transaction},
};

/// One fetched block plus the metadata the collector needs to build a `Block` row.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
	pub position: Position,
	pub hash: String,
	pub parent_hash: Option<String>,
	pub producer_timestamp: chrono::DateTime<chrono::Utc>,
	pub size_bytes: u64,
	pub tx_count: u32,
	pub chain_specific: crate::model::ChainSpecificBlockData,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpcApi: Send + Sync {
	/// The chain's best-known position (Bitcoin height / Solana slot).
	async fn get_tip_height(&self) -> Result<Position, RpcError>;

	/// Fetches one block. `Skipped` is only ever returned by the Solana
	/// implementation (an empty slot); Bitcoin never returns it.
	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError>;

	/// Fetches the transactions of a block in on-chain order. `limit == 0`
	/// means unlimited.
	async fn get_block_transactions(
		&self,
		position: Position,
		limit: u32,
	) -> Result<Vec<Transaction>, RpcError>;

	/// Which upstream most recently answered a request through this client.
	/// Only [`bitcoin_dual::BitcoinDualClient`] and [`bitcoin_rpc::BitcoinRpcClient`]
	/// return anything other than the default.
	fn current_source(&self) -> Source {
		Source::Public
	}
}

/// Maps an HTTP status code to the subset of [`RpcError`] that's shared
/// between the Bitcoin REST, Bitcoin JSON-RPC, and Solana JSON-RPC clients.
pub(crate) fn classify_http_status(status: reqwest::StatusCode) -> Option<RpcError> {
	if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
		Some(RpcError::RateLimited)
	} else if status == reqwest::StatusCode::NOT_FOUND {
		Some(RpcError::NotFound)
	} else if status.is_server_error() {
		Some(RpcError::Transient(format!("upstream returned {status}")))
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_http_status_maps_known_codes() {
		assert_eq!(
			classify_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
			Some(RpcError::RateLimited)
		);
		assert_eq!(classify_http_status(reqwest::StatusCode::NOT_FOUND), Some(RpcError::NotFound));
		assert!(classify_http_status(reqwest::StatusCode::OK).is_none());
		assert!(matches!(
			classify_http_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
			Some(RpcError::Transient(_))
		));
	}
}
