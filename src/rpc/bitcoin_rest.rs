//! Bitcoin public REST client (Esplora-style API).
//!
//! Thin wrapper around `reqwest`: no SDK, just typed responses for the
//! handful of endpoints the collector needs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::{classify_http_status, ChainRpcApi, FetchedBlock};
use crate::{
	error::RpcError,
	model::{ChainSpecificBlockData, Position, Source, Transaction},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BitcoinRestClient {
	client: Client,
	base_url: String,
}

impl BitcoinRestClient {
	pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
		let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
		Ok(Self { client, base_url: base_url.into() })
	}

	async fn get_text(&self, path: &str) -> Result<String, RpcError> {
		let url = format!("{}{path}", self.base_url);
		let response = self.client.get(&url).send().await.map_err(classify_transport)?;
		if let Some(err) = classify_http_status(response.status()) {
			return Err(err);
		}
		response.text().await.map_err(|e| RpcError::Transient(e.to_string()))
	}

	async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, RpcError> {
		let url = format!("{}{path}", self.base_url);
		let response = self.client.get(&url).send().await.map_err(classify_transport)?;
		if let Some(err) = classify_http_status(response.status()) {
			return Err(err);
		}
		response.json::<T>().await.map_err(|e| RpcError::Fatal(format!("malformed response: {e}")))
	}

	async fn hash_for_height(&self, position: Position) -> Result<String, RpcError> {
		self.get_text(&format!("/block-height/{}", position.0)).await.map(|s| s.trim().to_string())
	}
}

fn classify_transport(e: reqwest::Error) -> RpcError {
	if e.is_timeout() || e.is_connect() {
		RpcError::Transient(e.to_string())
	} else {
		RpcError::Fatal(e.to_string())
	}
}

#[derive(Debug, Deserialize)]
struct RestBlock {
	id: String,
	height: u64,
	timestamp: i64,
	#[serde(default)]
	previousblockhash: Option<String>,
	size: u64,
	tx_count: u32,
	difficulty: f64,
	nonce: u32,
	merkle_root: String,
}

#[derive(Debug, Deserialize)]
struct RestTx {
	txid: String,
	#[serde(default)]
	fee: u64,
	size: u64,
}

#[async_trait]
impl ChainRpcApi for BitcoinRestClient {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		let text = self.get_text("/blocks/tip/height").await?;
		let height: u64 =
			text.trim().parse().map_err(|_| RpcError::Fatal("non-numeric tip height".into()))?;
		Ok(Position(height))
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		let hash = self.hash_for_height(position).await?;
		let block: RestBlock = self.get_json(&format!("/block/{hash}")).await?;

		let producer_timestamp = Utc
			.timestamp_opt(block.timestamp, 0)
			.single()
			.ok_or_else(|| RpcError::Fatal("block timestamp out of range".into()))?;

		Ok(FetchedBlock {
			position: Position(block.height),
			hash: block.id,
			parent_hash: block.previousblockhash,
			producer_timestamp,
			size_bytes: block.size,
			tx_count: block.tx_count,
			chain_specific: ChainSpecificBlockData::Bitcoin {
				difficulty: block.difficulty,
				nonce: block.nonce,
				merkle_root: block.merkle_root,
			},
		})
	}

	async fn get_block_transactions(
		&self,
		position: Position,
		limit: u32,
	) -> Result<Vec<Transaction>, RpcError> {
		let hash = self.hash_for_height(position).await?;

		let mut out = Vec::new();
		let mut start_index = 0u32;
		loop {
			let path = if start_index == 0 {
				format!("/block/{hash}/txs")
			} else {
				format!("/block/{hash}/txs/{start_index}")
			};
			let page: Vec<RestTx> = self.get_json(&path).await?;
			if page.is_empty() {
				break;
			}
			let page_len = page.len() as u32;
			for (i, tx) in page.into_iter().enumerate() {
				out.push(Transaction {
					chain: crate::model::ChainId::Bitcoin,
					tx_id: tx.txid,
					block_position: position,
					index_in_block: start_index + i as u32,
					fee: tx.fee,
					size_bytes: tx.size,
					status: None,
					source: Source::Public,
				});
				if limit != 0 && out.len() as u32 >= limit {
					return Ok(out);
				}
			}
			start_index += page_len;
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_transport_distinguishes_timeout_from_malformed() {
		// Construction-only check: a real transport failure can't be produced
		// without a live connection, so we only assert client construction
		// succeeds against an arbitrary base URL.
		assert!(BitcoinRestClient::new("http://127.0.0.1:3000").is_ok());
	}
}
