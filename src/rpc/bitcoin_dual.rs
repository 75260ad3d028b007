//! Bitcoin dual-source client: wraps a local full node and the public REST
//! API behind one [`ChainRpcApi`], applying the [`SourceRouter`] sticky
//! preference policy per call. The collector only ever talks to this type
//! for Bitcoin; it never sees the two underlying clients directly.

use std::{
	sync::{Arc, Mutex},
	time::Instant,
};

use async_trait::async_trait;

use super::{ChainRpcApi, FetchedBlock};
use crate::{
	error::RpcError,
	model::{Position, Source, Transaction},
	source_router::SourceRouter,
};

pub struct BitcoinDualClient {
	local: Option<Arc<dyn ChainRpcApi>>,
	public: Arc<dyn ChainRpcApi>,
	router: Mutex<SourceRouter>,
}

impl BitcoinDualClient {
	pub fn new(
		local: Option<Arc<dyn ChainRpcApi>>,
		public: Arc<dyn ChainRpcApi>,
		use_local_node: bool,
	) -> Self {
		let router = SourceRouter::new(use_local_node && local.is_some());
		Self { local, public, router: Mutex::new(router) }
	}

	/// Runs the local-node probe if one is due; on success flips preference
	/// back to local. A no-op when no local client is configured.
	async fn probe_local_if_due(&self) {
		let Some(local) = &self.local else { return };
		let now = Instant::now();
		if self.router.lock().unwrap().local_in_cooldown(now) {
			return;
		}
		let due = self.router.lock().unwrap().probe_due(now);
		if !due {
			return;
		}
		if local.get_tip_height().await.is_ok() {
			self.router.lock().unwrap().probe_succeeded();
		}
	}

	fn preferred(&self) -> Source {
		self.router.lock().unwrap().preferred()
	}

	fn record_outcome(&self, error: &RpcError) {
		self.router.lock().unwrap().record_outcome(Instant::now(), Some(error));
	}

	/// Flips only on `Transient`/`Fatal`, per the router's policy of never
	/// flipping on rate limiting.
	fn should_fall_back(error: &RpcError) -> bool {
		matches!(error, RpcError::Transient(_) | RpcError::Fatal(_))
	}
}

#[async_trait]
impl ChainRpcApi for BitcoinDualClient {
	async fn get_tip_height(&self) -> Result<Position, RpcError> {
		self.probe_local_if_due().await;
		match (self.preferred(), &self.local) {
			(Source::Local, Some(local)) => match local.get_tip_height().await {
				Ok(v) => Ok(v),
				Err(e) => {
					self.record_outcome(&e);
					if Self::should_fall_back(&e) {
						self.public.get_tip_height().await
					} else {
						Err(e)
					}
				},
			},
			_ => self.public.get_tip_height().await,
		}
	}

	async fn get_block(&self, position: Position) -> Result<FetchedBlock, RpcError> {
		self.probe_local_if_due().await;
		match (self.preferred(), &self.local) {
			(Source::Local, Some(local)) => match local.get_block(position).await {
				Ok(v) => Ok(v),
				Err(e) => {
					self.record_outcome(&e);
					if Self::should_fall_back(&e) {
						self.public.get_block(position).await
					} else {
						Err(e)
					}
				},
			},
			_ => self.public.get_block(position).await,
		}
	}

	async fn get_block_transactions(
		&self,
		position: Position,
		limit: u32,
	) -> Result<Vec<Transaction>, RpcError> {
		self.probe_local_if_due().await;
		match (self.preferred(), &self.local) {
			(Source::Local, Some(local)) => match local.get_block_transactions(position, limit).await {
				Ok(v) => Ok(v),
				Err(e) => {
					self.record_outcome(&e);
					if Self::should_fall_back(&e) {
						self.public.get_block_transactions(position, limit).await
					} else {
						Err(e)
					}
				},
			},
			_ => self.public.get_block_transactions(position, limit).await,
		}
	}

	fn current_source(&self) -> Source {
		self.preferred()
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;

	struct StubClient {
		tip: Result<Position, RpcError>,
	}

	#[async_trait]
	impl ChainRpcApi for StubClient {
		async fn get_tip_height(&self) -> Result<Position, RpcError> {
			self.tip.clone()
		}

		async fn get_block(&self, _position: Position) -> Result<FetchedBlock, RpcError> {
			Err(RpcError::NotFound)
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
	async fn falls_back_to_public_when_local_is_transient() {
		let local = Arc::new(StubClient { tip: Err(RpcError::Transient("timeout".into())) });
		let public = Arc::new(StubClient { tip: Ok(Position(42)) });
		let dual = BitcoinDualClient::new(Some(local), public, true);

		let tip = dual.get_tip_height().await.unwrap();
		assert_eq!(tip, Position(42));
		assert_eq!(dual.current_source(), Source::Public);
	}

	#[tokio::test]
	async fn rate_limit_on_local_is_returned_without_flipping_or_falling_back() {
		let local = Arc::new(StubClient { tip: Err(RpcError::RateLimited) });
		let public = Arc::new(StubClient { tip: Ok(Position(99)) });
		let dual = BitcoinDualClient::new(Some(local), public, true);

		let err = dual.get_tip_height().await.unwrap_err();
		assert_eq!(err, RpcError::RateLimited);
		assert_eq!(dual.current_source(), Source::Local);
	}

	#[tokio::test]
	async fn without_a_local_client_every_call_goes_to_public() {
		let public = Arc::new(StubClient { tip: Ok(Position(7)) });
		let dual = BitcoinDualClient::new(None, public, false);

		assert_eq!(dual.get_tip_height().await.unwrap(), Position(7));
		assert_eq!(dual.current_source(), Source::Public);
	}
}
