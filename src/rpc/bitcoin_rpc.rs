//! Bitcoin local-node JSON-RPC client (HTTP basic auth).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChainRpcApi, FetchedBlock};
use crate::{
	error::RpcError,
	model::{ChainSpecificBlockData, Position, Source, Transaction},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BitcoinRpcClient {
	client: Client,
	endpoint: String,
	user: String,
	password: String,
}

impl BitcoinRpcClient {
	pub fn new(endpoint: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> anyhow::Result<Self> {
		let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
		Ok(Self { client, endpoint: endpoint.into(), user: user.into(), password: password.into() })
	}

	async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
		let body = json!({
			"jsonrpc": "1.0",
			"id": "chain-ingestor",
			"method": method,
			"params": params,
		});

		let response = self
			.client
			.post(&self.endpoint)
			.basic_auth(&self.user, Some(&self.password))
			.json(&body)
			.send()
			.await
			.map_err(classify_transport)?;

		if response.status() == reqwest::StatusCode::UNAUTHORIZED {
			return Err(RpcError::Fatal("bitcoin rpc authentication rejected".into()));
		}
		if let Some(err) = super::classify_http_status(response.status()) {
			return Err(err);
		}

		let envelope: RpcEnvelope =
			response.json().await.map_err(|e| RpcError::Fatal(format!("malformed rpc response: {e}")))?;

		if let Some(error) = envelope.error {
			return Err(classify_rpc_error(error));
		}

		envelope.result.ok_or_else(|| RpcError::Fatal("rpc response missing result".into()))
	}
}

fn classify_transport(e: reqwest::Error) -> RpcError {
	if e.is_timeout() || e.is_connect() {
		RpcError::Transient(e.to_string())
	} else {
		RpcError::Fatal(e.to_string())
	}
}

fn classify_rpc_error(error: RpcErrorObject) -> RpcError {
	match error.code {
		-28 => RpcError::Transient(error.message), // node still warming up
		-1 | -5 => RpcError::NotFound,
		_ => RpcError::Fatal(error.message),
	}
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
	result: Option<Value>,
	error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
	code: i64,
	message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
	hash: String,
	height: u64,
	time: i64,
	#[serde(default)]
	previousblockhash: Option<String>,
	size: u64,
	difficulty: f64,
	nonce: u32,
	merkleroot: String,
	tx: Vec<RpcTx>,
}

#[derive(Debug, Deserialize)]
struct RpcTx {
	txid: String,
	#[serde(default)]
	fee: f64,
	size: u64,
}

#[async_trait]
impl ChainRpcApi for BitcoinRpcClient {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		let height = self.call("getblockcount", json!([])).await?;
		let height: u64 =
			serde_json::from_value(height).map_err(|_| RpcError::Fatal("non-numeric block count".into()))?;
		Ok(Position(height))
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		let hash = self.call("getblockhash", json!([position.0])).await?;
		let hash: String =
			serde_json::from_value(hash).map_err(|_| RpcError::Fatal("non-string block hash".into()))?;

		let block = self.call("getblock", json!([hash, 2])).await?;
		let block: RpcBlock =
			serde_json::from_value(block).map_err(|e| RpcError::Fatal(format!("malformed block: {e}")))?;

		let producer_timestamp = Utc
			.timestamp_opt(block.time, 0)
			.single()
			.ok_or_else(|| RpcError::Fatal("block time out of range".into()))?;

		Ok(FetchedBlock {
			position: Position(block.height),
			hash: block.hash,
			parent_hash: block.previousblockhash,
			producer_timestamp,
			size_bytes: block.size,
			tx_count: block.tx.len() as u32,
			chain_specific: ChainSpecificBlockData::Bitcoin {
				difficulty: block.difficulty,
				nonce: block.nonce,
				merkle_root: block.merkleroot,
			},
		})
	}

	async fn get_block_transactions(
		&self,
		position: Position,
		limit: u32,
	) -> Result<Vec<Transaction>, RpcError> {
		let hash = self.call("getblockhash", json!([position.0])).await?;
		let hash: String =
			serde_json::from_value(hash).map_err(|_| RpcError::Fatal("non-string block hash".into()))?;

		let block = self.call("getblock", json!([hash, 2])).await?;
		let block: RpcBlock =
			serde_json::from_value(block).map_err(|e| RpcError::Fatal(format!("malformed block: {e}")))?;

		let txs = block.tx.into_iter().enumerate().map(|(i, tx)| Transaction {
			chain: crate::model::ChainId::Bitcoin,
			tx_id: tx.txid,
			block_position: position,
			index_in_block: i as u32,
			fee: (tx.fee.max(0.0) * 1e8) as u64,
			size_bytes: tx.size,
			status: None,
			source: Source::Local,
		});

		Ok(if limit == 0 { txs.collect() } else { txs.take(limit as usize).collect() })
	}

	fn current_source(&self) -> Source {
		Source::Local
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_rpc_error_maps_warming_up_to_transient() {
		assert!(matches!(
			classify_rpc_error(RpcErrorObject { code: -28, message: "warming up".into() }),
			RpcError::Transient(_)
		));
		assert_eq!(
			classify_rpc_error(RpcErrorObject { code: -5, message: "not found".into() }),
			RpcError::NotFound
		);
	}
}
