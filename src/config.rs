//! Engine configuration: a `config`-crate TOML/env settings tree layered
//! under a `clap`-derived command line. A `config/default.toml` file is
//! merged with `CHAIN_INGESTOR__`-prefixed environment variables (double
//! underscore nesting, e.g. `CHAIN_INGESTOR__BITCOIN__ENABLED`) and
//! `try_deserialize`d into a typed [`Settings`] tree.

use std::path::PathBuf;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

fn default_true() -> bool {
	true
}

fn default_false() -> bool {
	false
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinSettings {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_false")]
	pub use_local_node: bool,
	#[serde(default = "default_mode")]
	pub mode: CollectionModeSetting,
	#[serde(default = "default_start_position")]
	pub start_position: i64,
	#[serde(default = "default_parallelism_backfill")]
	pub parallelism: u32,
	#[serde(default)]
	pub tx_limit: u32,
	pub public_rest_endpoint: String,
	pub local_rpc_endpoint: Option<String>,
	pub local_rpc_user: Option<String>,
	pub local_rpc_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaSettings {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_mode_tip")]
	pub mode: CollectionModeSetting,
	#[serde(default = "default_start_position")]
	pub start_position: i64,
	#[serde(default = "default_parallelism_tip")]
	pub parallelism: u32,
	#[serde(default)]
	pub tx_limit: u32,
	pub rpc_endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionModeSetting {
	Tip,
	Backfill,
}

fn default_mode() -> CollectionModeSetting {
	CollectionModeSetting::Tip
}

fn default_mode_tip() -> CollectionModeSetting {
	CollectionModeSetting::Tip
}

fn default_start_position() -> i64 {
	-1
}

fn default_parallelism_backfill() -> u32 {
	10
}

fn default_parallelism_tip() -> u32 {
	1
}

fn default_cycle_interval() -> u64 {
	5
}

fn default_max_duration_minutes() -> u64 {
	10
}

fn default_max_size_gb() -> f64 {
	5.0
}

fn default_batch_size() -> usize {
	500
}

fn default_max_retries() -> u32 {
	3
}

fn default_bind(port: u16) -> String {
	format!("127.0.0.1:{port}")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSettings {
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
}

impl Default for SinkSettings {
	fn default() -> Self {
		Self { batch_size: default_batch_size(), max_retries: default_max_retries() }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
	pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSettings {
	#[serde(default = "default_health_bind")]
	pub bind_address: String,
}

fn default_health_bind() -> String {
	default_bind(5555)
}

fn default_metrics_bind() -> String {
	default_bind(5566)
}

fn default_control_plane_bind() -> String {
	default_bind(8080)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub bitcoin: BitcoinSettings,
	pub solana: SolanaSettings,
	#[serde(default = "default_cycle_interval")]
	pub cycle_interval_seconds: u64,
	#[serde(default = "default_max_duration_minutes")]
	pub max_duration_minutes: u64,
	#[serde(default = "default_max_size_gb")]
	pub max_size_gb: f64,
	#[serde(default)]
	pub sink: SinkSettings,
	pub store: StoreSettings,
	#[serde(default = "control_plane_defaults")]
	pub control_plane: EndpointSettings,
	#[serde(default = "metrics_defaults")]
	pub metrics: EndpointSettings,
	#[serde(default = "health_defaults")]
	pub health: EndpointSettings,
}

fn control_plane_defaults() -> EndpointSettings {
	EndpointSettings { bind_address: default_control_plane_bind() }
}

fn metrics_defaults() -> EndpointSettings {
	EndpointSettings { bind_address: default_metrics_bind() }
}

fn health_defaults() -> EndpointSettings {
	EndpointSettings { bind_address: default_health_bind() }
}

impl Settings {
	/// Load settings from `config_path` (TOML), then apply
	/// `CHAIN_INGESTOR__`-prefixed environment-variable overrides using
	/// `__` as the nesting separator, e.g. `CHAIN_INGESTOR__BITCOIN__ENABLED`.
	pub fn load(config_path: &std::path::Path) -> Result<Self, config::ConfigError> {
		let builder = Config::builder()
			.add_source(File::from(config_path))
			.add_source(Environment::with_prefix("CHAIN_INGESTOR").separator("__"));

		builder.build()?.try_deserialize()
	}

	#[cfg(test)]
	pub fn new_test() -> Self {
		Settings {
			bitcoin: BitcoinSettings {
				enabled: true,
				use_local_node: false,
				mode: CollectionModeSetting::Tip,
				start_position: -1,
				parallelism: 10,
				tx_limit: 0,
				public_rest_endpoint: "http://127.0.0.1:3000".to_string(),
				local_rpc_endpoint: None,
				local_rpc_user: None,
				local_rpc_password: None,
			},
			solana: SolanaSettings {
				enabled: true,
				mode: CollectionModeSetting::Tip,
				start_position: -1,
				parallelism: 1,
				tx_limit: 0,
				rpc_endpoint: "http://127.0.0.1:8899".to_string(),
			},
			cycle_interval_seconds: 5,
			max_duration_minutes: 0,
			max_size_gb: 5.0,
			sink: SinkSettings::default(),
			store: StoreSettings { url: "sqlite::memory:".to_string() },
			control_plane: control_plane_defaults(),
			metrics: metrics_defaults(),
			health: health_defaults(),
		}
	}
}

/// Command line flags layered over [`Settings`]: only the config file path
/// and the logging setup are needed before `Settings::load` can run, so
/// everything else stays in the TOML/env tree.
#[derive(Debug, Parser)]
#[clap(name = "chain-ingestord", about = "Bitcoin/Solana ingestion engine")]
pub struct CommandLineOptions {
	#[clap(long, short = 'c', default_value = "config/default.toml")]
	pub config_path: PathBuf,

	#[clap(long, default_value = "info")]
	pub log_level: String,

	#[clap(long)]
	pub log_json: bool,
}
