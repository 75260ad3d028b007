//! Solana JSON-RPC client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChainRpcApi, FetchedBlock};
use crate::{
	error::RpcError,
	model::{ChainSpecificBlockData, Position, Source, Transaction, TxStatus},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const SLOT_SKIPPED_ERROR_CODE: i64 = -32009;

pub struct SolanaRpcClient {
	client: Client,
	endpoint: String,
}

impl SolanaRpcClient {
	pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
		let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
		Ok(Self { client, endpoint: endpoint.into() })
	}

	async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
		let body = json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": method,
			"params": params,
		});

		let response =
			self.client.post(&self.endpoint).json(&body).send().await.map_err(classify_transport)?;

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
	if error.code == SLOT_SKIPPED_ERROR_CODE {
		RpcError::Skipped
	} else if error.code == 429 {
		RpcError::RateLimited
	} else {
		RpcError::Fatal(error.message)
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
struct SolBlock {
	blockhash: String,
	#[serde(rename = "previousBlockhash")]
	previous_blockhash: Option<String>,
	#[serde(rename = "parentSlot")]
	parent_slot: u64,
	#[serde(rename = "blockTime")]
	block_time: Option<i64>,
	transactions: Vec<SolTx>,
}

#[derive(Debug, Deserialize)]
struct SolTx {
	transaction: Value,
	meta: Option<SolTxMeta>,
}

#[derive(Debug, Deserialize)]
struct SolTxMeta {
	#[serde(default)]
	fee: u64,
	err: Option<Value>,
}

fn extract_signature(tx: &Value) -> Option<String> {
	tx.get("signatures")?.as_array()?.first()?.as_str().map(str::to_string)
}

#[async_trait]
impl ChainRpcApi for SolanaRpcClient {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		let slot = self.call("getSlot", json!([{"commitment": "finalized"}])).await?;
		let slot: u64 =
			serde_json::from_value(slot).map_err(|_| RpcError::Fatal("non-numeric slot".into()))?;
		Ok(Position(slot))
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		let params = json!([
			position.0,
			{
				"encoding": "json",
				"transactionDetails": "full",
				"rewards": false,
				"maxSupportedTransactionVersion": 0,
			}
		]);
		let block = self.call("getBlock", params).await?;
		let block: SolBlock =
			serde_json::from_value(block).map_err(|e| RpcError::Fatal(format!("malformed block: {e}")))?;

		let producer_timestamp = block
			.block_time
			.and_then(|t| Utc.timestamp_opt(t, 0).single())
			.ok_or_else(|| RpcError::Fatal("block missing blockTime".into()))?;

		Ok(FetchedBlock {
			position,
			hash: block.blockhash,
			parent_hash: block.previous_blockhash,
			producer_timestamp,
			size_bytes: 0,
			tx_count: block.transactions.len() as u32,
			chain_specific: ChainSpecificBlockData::Solana { parent_slot: block.parent_slot },
		})
	}

	async fn get_block_transactions(
		&self,
		position: Position,
		limit: u32,
	) -> Result<Vec<Transaction>, RpcError> {
		let params = json!([
			position.0,
			{
				"encoding": "json",
				"transactionDetails": "full",
				"rewards": false,
				"maxSupportedTransactionVersion": 0,
			}
		]);
		let block = self.call("getBlock", params).await?;
		let block: SolBlock =
			serde_json::from_value(block).map_err(|e| RpcError::Fatal(format!("malformed block: {e}")))?;

		let mut out = Vec::new();
		for (i, tx) in block.transactions.into_iter().enumerate() {
			let tx_id = extract_signature(&tx.transaction)
				.ok_or_else(|| RpcError::Fatal("transaction missing signature".into()))?;
			let meta = tx.meta.unwrap_or(SolTxMeta { fee: 0, err: None });
			out.push(Transaction {
				chain: crate::model::ChainId::Solana,
				tx_id,
				block_position: position,
				index_in_block: i as u32,
				fee: meta.fee,
				size_bytes: 0,
				status: Some(if meta.err.is_none() { TxStatus::Success } else { TxStatus::Failed }),
				source: Source::Public,
			});
			if limit != 0 && out.len() as u32 >= limit {
				break;
			}
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_rpc_error_maps_skipped_slot() {
		assert_eq!(
			classify_rpc_error(RpcErrorObject {
				code: SLOT_SKIPPED_ERROR_CODE,
				message: "slot skipped".into()
			}),
			RpcError::Skipped
		);
	}

	#[test]
	fn extract_signature_reads_first_signature() {
		let tx = json!({"signatures": ["abc123"], "message": {}});
		assert_eq!(extract_signature(&tx), Some("abc123".to_string()));
	}
}
