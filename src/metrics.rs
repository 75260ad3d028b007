//! Prometheus registry and `/metrics` endpoint.
//!
//! Counters and gauges are labeled by chain so a single registry covers both
//! collectors; `record_cycle` is the one call site every collector cycle
//! funnels through.

use std::net::SocketAddr;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;
use warp::Filter;

use crate::{model::ChainId, task_scope::Scope};

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref RECORDS_IN_TOTAL: IntCounterVec = IntCounterVec::new(
		Opts::new("records_in_total", "Records fetched from upstream RPC clients"),
		&["chain"]
	)
	.expect("metric registration is infallible with a static Opts");
	pub static ref RECORDS_OUT_TOTAL: IntCounterVec = IntCounterVec::new(
		Opts::new("records_out_total", "Records committed to the analytics store"),
		&["chain"]
	)
	.expect("metric registration is infallible with a static Opts");
	pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
		Opts::new("errors_total", "Errors observed per chain, labeled by error kind"),
		&["chain", "kind"]
	)
	.expect("metric registration is infallible with a static Opts");
	pub static ref CYCLE_DURATION_SECONDS: IntGaugeVec = IntGaugeVec::new(
		Opts::new("cycle_duration_seconds", "Wall-clock duration of the most recent collector cycle"),
		&["chain"]
	)
	.expect("metric registration is infallible with a static Opts");
	pub static ref CURSOR_POSITION: IntGaugeVec = IntGaugeVec::new(
		Opts::new("cursor_position", "Last committed position per chain"),
		&["chain"]
	)
	.expect("metric registration is infallible with a static Opts");
}

/// Registers every metric with the global registry. Must run once before
/// `serve` is started; idempotent registration is not guaranteed by
/// `prometheus::Registry`, so callers must not call this twice.
pub fn register_metrics() {
	REGISTRY.register(Box::new(RECORDS_IN_TOTAL.clone())).expect("metric already registered");
	REGISTRY.register(Box::new(RECORDS_OUT_TOTAL.clone())).expect("metric already registered");
	REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).expect("metric already registered");
	REGISTRY
		.register(Box::new(CYCLE_DURATION_SECONDS.clone()))
		.expect("metric already registered");
	REGISTRY.register(Box::new(CURSOR_POSITION.clone())).expect("metric already registered");
}

/// Records one collector cycle's outcome into the counters/gauges above.
pub fn record_cycle(
	chain: ChainId,
	records_in: u64,
	records_out: u64,
	duration_seconds: i64,
	cursor_position: u64,
) {
	let chain = chain.as_str();
	RECORDS_IN_TOTAL.with_label_values(&[chain]).inc_by(records_in);
	RECORDS_OUT_TOTAL.with_label_values(&[chain]).inc_by(records_out);
	CYCLE_DURATION_SECONDS.with_label_values(&[chain]).set(duration_seconds);
	CURSOR_POSITION.with_label_values(&[chain]).set(cursor_position as i64);
}

pub fn record_error(chain: ChainId, kind: &str) {
	ERRORS_TOTAL.with_label_values(&[chain.as_str(), kind]).inc();
}

fn metrics_handler() -> String {
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("could not encode metrics: {e}");
	}
	String::from_utf8(buffer).unwrap_or_else(|e| {
		tracing::error!("metrics buffer was not valid utf8: {e}");
		String::new()
	})
}

#[tracing::instrument(name = "metrics-server", skip_all)]
pub async fn serve(scope: &Scope<'_, anyhow::Error>, bind_address: &str) -> anyhow::Result<()> {
	let addr: SocketAddr = bind_address.parse()?;

	let route = warp::path("metrics").and(warp::path::end()).map(metrics_handler);

	info!(bind_address = %addr, "starting metrics endpoint");

	let (_, server) = warp::serve(route).bind_with_graceful_shutdown(addr, async move {
		std::future::pending::<()>().await;
	});

	scope.spawn_weak(async move {
		server.await;
		Ok(())
	});

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_cycle_updates_gauges() {
		record_cycle(ChainId::Bitcoin, 5, 5, 12, 800_000);
		assert_eq!(CURSOR_POSITION.with_label_values(&["bitcoin"]).get(), 800_000);
		assert_eq!(CYCLE_DURATION_SECONDS.with_label_values(&["bitcoin"]).get(), 12);
	}

	#[tokio::test]
	async fn metrics_endpoint_serves_text_format() {
		use crate::task_scope::task_scope;

		task_scope(|scope| async move {
			serve(scope, "127.0.0.1:18766").await.unwrap();
			tokio::time::sleep(std::time::Duration::from_millis(50)).await;

			let resp = reqwest::get("http://127.0.0.1:18766/metrics").await.unwrap();
			assert_eq!(resp.status(), reqwest::StatusCode::OK);

			Ok::<_, anyhow::Error>(())
		})
		.await
		.unwrap();
	}
}
