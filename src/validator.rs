//! Pure per-record validation.
//!
//! `validate_block`/`validate_transaction` never reject a record — a failed
//! check downgrades the quality verdict but the record is always persisted,
//! so a validation bug can never stall the pipeline.

use chrono::{DateTime, Duration, Utc};

use crate::model::{
	Block, ChainId, ChainSpecificBlockData, IssueTag, QualityLevel, QualityVerdict, Transaction,
};

const TIMESTAMP_SKEW: Duration = Duration::hours(2);

/// Chain-specific bounds the validator checks against. One impl per chain;
/// composed into `validate_block`/`validate_transaction` rather than shared
/// through an inheritance hierarchy.
pub trait ChainRules {
	fn hash_len(&self) -> usize;
	fn hash_is_well_formed(&self, hash: &str) -> bool {
		hash.len() == self.hash_len() && hash.chars().all(|c| c.is_ascii_hexdigit())
	}
	/// Solana-only: block height (committed so far) must not exceed slot.
	fn check_height_consistency(&self, _block: &Block) -> Option<(IssueTag, String)> {
		None
	}
}

pub struct BitcoinRules;

impl ChainRules for BitcoinRules {
	fn hash_len(&self) -> usize {
		64
	}
}

pub struct SolanaRules;

impl ChainRules for SolanaRules {
	fn hash_len(&self) -> usize {
		64
	}

	fn check_height_consistency(&self, block: &Block) -> Option<(IssueTag, String)> {
		if let ChainSpecificBlockData::Solana { parent_slot } = block.chain_specific {
			if parent_slot >= block.position.0 {
				return Some((
					IssueTag::OutOfBounds,
					format!("parent_slot {parent_slot} >= slot {}", block.position.0),
				));
			}
		}
		None
	}
}

pub fn rules_for(chain: ChainId) -> Box<dyn ChainRules> {
	match chain {
		ChainId::Bitcoin => Box::new(BitcoinRules),
		ChainId::Solana => Box::new(SolanaRules),
	}
}

/// Carries the context a validation run needs beyond the record itself.
pub struct ValidationContext<'a> {
	pub now: DateTime<Utc>,
	pub previous_committed_hash: Option<&'a str>,
	pub is_tip_mode: bool,
}

pub fn validate_block(
	block: &Block,
	rules: &dyn ChainRules,
	ctx: &ValidationContext<'_>,
) -> QualityVerdict {
	let mut verdict = QualityVerdict::ok();

	if block.hash.is_empty() {
		verdict.downgrade(QualityLevel::Suspect, IssueTag::MissingField, "block hash is empty");
	} else if !rules.hash_is_well_formed(&block.hash) {
		verdict.downgrade(
			QualityLevel::Warn,
			IssueTag::BadHashFormat,
			format!("hash '{}' does not match expected format", block.hash),
		);
	}

	if block.size_bytes == 0 {
		verdict.downgrade(QualityLevel::Warn, IssueTag::OutOfBounds, "block size is zero");
	}

	if ctx.is_tip_mode {
		let skew = (ctx.now - block.producer_timestamp).abs();
		if skew > TIMESTAMP_SKEW {
			verdict.downgrade(
				QualityLevel::Warn,
				IssueTag::TimestampSkew,
				format!("producer timestamp skewed by {}s", skew.num_seconds()),
			);
		}
	}

	if let (Some(parent_hash), Some(previous_committed)) =
		(block.parent_hash.as_deref(), ctx.previous_committed_hash)
	{
		if parent_hash != previous_committed {
			verdict.downgrade(
				QualityLevel::Suspect,
				IssueTag::ParentHashMismatch,
				format!("parent_hash '{parent_hash}' does not match previously committed hash"),
			);
		}
	}

	if let Some((tag, detail)) = rules.check_height_consistency(block) {
		verdict.downgrade(QualityLevel::Warn, tag, detail);
	}

	verdict
}

pub fn validate_transaction(tx: &Transaction, rules: &dyn ChainRules) -> QualityVerdict {
	let mut verdict = QualityVerdict::ok();

	if tx.tx_id.is_empty() {
		verdict.downgrade(QualityLevel::Suspect, IssueTag::MissingField, "tx_id is empty");
	} else if !rules.hash_is_well_formed(&tx.tx_id) {
		verdict.downgrade(
			QualityLevel::Warn,
			IssueTag::BadHashFormat,
			format!("tx_id '{}' does not match expected format", tx.tx_id),
		);
	}

	verdict
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Position, Source};

	fn sample_block(chain: ChainId) -> Block {
		Block {
			chain,
			position: Position(100),
			hash: "a".repeat(64),
			parent_hash: Some("b".repeat(64)),
			producer_timestamp: Utc::now(),
			size_bytes: 1024,
			tx_count: 1,
			chain_specific: match chain {
				ChainId::Bitcoin => {
					ChainSpecificBlockData::Bitcoin { difficulty: 1.0, nonce: 1, merkle_root: "c".repeat(64) }
				},
				ChainId::Solana => ChainSpecificBlockData::Solana { parent_slot: 99 },
			},
			source: Source::Public,
			ingested_at: Utc::now(),
		}
	}

	fn ctx(now: DateTime<Utc>, previous_hash: Option<&str>) -> ValidationContext<'_> {
		ValidationContext { now, previous_committed_hash: previous_hash, is_tip_mode: true }
	}

	#[test]
	fn well_formed_block_is_ok() {
		let block = sample_block(ChainId::Bitcoin);
		let verdict = validate_block(&block, &BitcoinRules, &ctx(block.producer_timestamp, None));
		assert!(verdict.is_ok());
	}

	#[test]
	fn bad_hash_format_downgrades_to_warn() {
		let mut block = sample_block(ChainId::Bitcoin);
		block.hash = "not-a-hash".to_string();
		let verdict = validate_block(&block, &BitcoinRules, &ctx(block.producer_timestamp, None));
		assert_eq!(verdict.level, QualityLevel::Warn);
	}

	#[test]
	fn parent_hash_mismatch_downgrades_to_suspect() {
		let block = sample_block(ChainId::Bitcoin);
		let verdict =
			validate_block(&block, &BitcoinRules, &ctx(block.producer_timestamp, Some(&"z".repeat(64))));
		assert_eq!(verdict.level, QualityLevel::Suspect);
	}

	#[test]
	fn timestamp_skew_beyond_two_hours_downgrades_to_warn() {
		let block = sample_block(ChainId::Bitcoin);
		let far_future = block.producer_timestamp + Duration::hours(3);
		let verdict = validate_block(&block, &BitcoinRules, &ctx(far_future, None));
		assert_eq!(verdict.level, QualityLevel::Warn);
	}

	#[test]
	fn solana_parent_slot_must_be_below_slot() {
		let mut block = sample_block(ChainId::Solana);
		block.chain_specific = ChainSpecificBlockData::Solana { parent_slot: 200 };
		let verdict = validate_block(&block, &SolanaRules, &ctx(block.producer_timestamp, None));
		assert_eq!(verdict.level, QualityLevel::Warn);
	}

	#[test]
	fn empty_tx_id_downgrades_to_suspect() {
		let tx = Transaction {
			chain: ChainId::Bitcoin,
			tx_id: String::new(),
			block_position: Position(1),
			index_in_block: 0,
			fee: 100,
			size_bytes: 200,
			status: None,
			source: Source::Public,
		};
		let verdict = validate_transaction(&tx, &BitcoinRules);
		assert_eq!(verdict.level, QualityLevel::Suspect);
	}
}
