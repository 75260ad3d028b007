//! Cursor read path.
//!
//! `advance` lives here only for the read/inspect call sites (`Status`,
//! `BackfillProgress`); the collector's own cursor advance happens inside
//! [`super::sink::Sink::write_batch`], in the same transaction as the batch
//! it just wrote, so a crash between the two can never happen.

use async_trait::async_trait;

use crate::{
	error::EngineError,
	model::{ChainId, Position},
};

#[async_trait]
pub trait CursorStore: Send + Sync {
	/// Last committed position for `chain`, or `None` if no cycle has ever
	/// committed for it.
	async fn load(&self, chain: ChainId) -> Result<Option<Position>, EngineError>;

	/// Unconditionally overwrites the cursor row. Used only by the operator
	/// reset path (out of scope for the collector's own advance, which goes
	/// through `Sink::write_batch`).
	async fn reset(&self, chain: ChainId, position: Option<Position>) -> Result<(), EngineError>;
}
