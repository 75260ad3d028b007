//! Binary entry point: parses the command line, loads settings, wires the
//! analytics store, control plane, metrics and health endpoints together
//! under one [`task_scope`], and blocks until the scope's root future
//! returns or a spawned task fails.

use std::sync::Arc;

use chain_ingestor::{
	config::{CommandLineOptions, Settings},
	control_plane, health, logging, metrics,
	store::SqliteStore,
	supervisor::Supervisor,
	task_scope::task_scope,
};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = CommandLineOptions::parse();
	logging::init(&cli.log_level, cli.log_json);

	let settings = match Settings::load(&cli.config_path) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("error reading settings from {}: {error}", cli.config_path.display());
			std::process::exit(1);
		},
	};

	tracing::info!("starting chain ingestion engine");

	task_scope(|scope| {
		let settings = settings.clone();
		Box::pin(async move {
			let store = Arc::new(
				SqliteStore::connect(&settings.store.url, settings.sink.max_retries, settings.sink.batch_size)
					.await?,
			);

			metrics::register_metrics();

			let control_plane_bind = settings.control_plane.bind_address.clone();
			let metrics_bind = settings.metrics.bind_address.clone();
			let health_bind = settings.health.bind_address.clone();

			let supervisor = Arc::new(Supervisor::new(settings, store.clone(), store, scope.clone()));
			supervisor.spawn_budget_ticker();

			control_plane::serve(scope, &control_plane_bind, supervisor).await?;
			metrics::serve(scope, &metrics_bind).await?;
			health::serve(scope, &health_bind).await?;

			scope.cancelled().await;
			Ok(())
		})
	})
	.await
}
