//! Control-plane HTTP surface: `GET /`, `POST /start`, `POST /stop`,
//! `GET /status`, `GET /health`, `GET /backfill-progress`.
//!
//! Every filter is a thin adapter: deserialize nothing (all bodies are
//! empty), call one [`Supervisor`] method, serialize the result. Auth, rate
//! limiting and a UI are out of scope here.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use serde::Serialize;
use tracing::info;
use warp::{http::StatusCode, reply::Reply, Filter};

use crate::{
	model::StopReason,
	supervisor::{ChainHealth, StartOutcome, StopOutcome, Supervisor},
	task_scope::Scope,
};

#[derive(Serialize)]
struct RootResponse {
	name: &'static str,
	version: &'static str,
}

#[derive(Serialize)]
struct StartResponse {
	started_at: Option<chrono::DateTime<chrono::Utc>>,
	error: Option<String>,
}

#[derive(Serialize)]
struct StopResponse {
	stopped_at: Option<chrono::DateTime<chrono::Utc>>,
	reason: Option<&'static str>,
	error: Option<String>,
}

#[derive(Serialize)]
struct StatusChainEntry {
	position: Option<u64>,
	records: u64,
	rate_per_sec: f64,
	last_error: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
	is_running: bool,
	started_at: Option<chrono::DateTime<chrono::Utc>>,
	per_chain: std::collections::HashMap<&'static str, StatusChainEntry>,
}

#[derive(Serialize)]
struct HealthChainEntry {
	health: &'static str,
	seconds_since_last_commit: Option<i64>,
	error_count_5m: u32,
}

#[derive(Serialize)]
struct HealthResponse {
	overall: &'static str,
	per_chain: std::collections::HashMap<&'static str, HealthChainEntry>,
}

#[derive(Serialize)]
struct BackfillChainEntry {
	start: Option<u64>,
	current: Option<u64>,
	target: Option<u64>,
	percent: Option<f64>,
}

#[derive(Serialize)]
struct BackfillResponse {
	per_chain: std::collections::HashMap<&'static str, BackfillChainEntry>,
}

fn health_label(h: ChainHealth) -> &'static str {
	match h {
		ChainHealth::Healthy => "healthy",
		ChainHealth::Degraded => "degraded",
		ChainHealth::Unhealthy => "unhealthy",
	}
}

fn stop_reason_label(r: StopReason) -> &'static str {
	match r {
		StopReason::Manual => "manual",
		StopReason::TimeBudget => "time_budget",
		StopReason::SizeBudget => "size_budget",
		StopReason::Fatal => "fatal",
	}
}

async fn handle_root() -> Result<impl Reply, Infallible> {
	Ok(warp::reply::json(&RootResponse { name: "chain-ingestor", version: env!("CARGO_PKG_VERSION") }))
}

async fn handle_start(supervisor: Arc<Supervisor>) -> Result<impl Reply, Infallible> {
	match supervisor.start().await {
		StartOutcome::Accepted => Ok(warp::reply::with_status(
			warp::reply::json(&StartResponse { started_at: Some(chrono::Utc::now()), error: None }),
			StatusCode::OK,
		)),
		StartOutcome::AlreadyRunning => Ok(warp::reply::with_status(
			warp::reply::json(&StartResponse { started_at: None, error: Some("already running".into()) }),
			StatusCode::CONFLICT,
		)),
		StartOutcome::Rejected(reason) => Ok(warp::reply::with_status(
			warp::reply::json(&StartResponse { started_at: None, error: Some(reason) }),
			StatusCode::SERVICE_UNAVAILABLE,
		)),
	}
}

async fn handle_stop(supervisor: Arc<Supervisor>) -> Result<impl Reply, Infallible> {
	match supervisor.stop(StopReason::Manual).await {
		StopOutcome::Stopped(reason) => Ok(warp::reply::with_status(
			warp::reply::json(&StopResponse {
				stopped_at: Some(chrono::Utc::now()),
				reason: Some(stop_reason_label(reason)),
				error: None,
			}),
			StatusCode::OK,
		)),
		StopOutcome::NotRunning => Ok(warp::reply::with_status(
			warp::reply::json(&StopResponse { stopped_at: None, reason: None, error: Some("not running".into()) }),
			StatusCode::CONFLICT,
		)),
	}
}

async fn handle_status(supervisor: Arc<Supervisor>) -> Result<impl Reply, Infallible> {
	let report = supervisor.status().await;
	let per_chain = report
		.per_chain
		.into_iter()
		.map(|(chain, s)| {
			(
				chain.as_str(),
				StatusChainEntry {
					position: s.position,
					records: s.records,
					rate_per_sec: s.rate_per_sec,
					last_error: s.last_error,
				},
			)
		})
		.collect();
	Ok(warp::reply::json(&StatusResponse {
		is_running: report.is_running,
		started_at: report.started_at,
		per_chain,
	}))
}

async fn handle_health(supervisor: Arc<Supervisor>) -> Result<impl Reply, Infallible> {
	let report = supervisor.health().await;
	let per_chain = report
		.per_chain
		.into_iter()
		.map(|(chain, h)| {
			(
				chain.as_str(),
				HealthChainEntry {
					health: health_label(h.health),
					seconds_since_last_commit: h.seconds_since_last_commit,
					error_count_5m: h.error_count_5m,
				},
			)
		})
		.collect();
	Ok(warp::reply::json(&HealthResponse { overall: health_label(report.overall), per_chain }))
}

async fn handle_backfill_progress(supervisor: Arc<Supervisor>) -> Result<impl Reply, Infallible> {
	let progress = supervisor.backfill_progress().await;
	let per_chain = progress
		.into_iter()
		.map(|(chain, p)| {
			(
				chain.as_str(),
				BackfillChainEntry { start: p.start, current: p.current, target: p.target, percent: p.percent },
			)
		})
		.collect();
	Ok(warp::reply::json(&BackfillResponse { per_chain }))
}

fn with_supervisor(
	supervisor: Arc<Supervisor>,
) -> impl Filter<Extract = (Arc<Supervisor>,), Error = Infallible> + Clone {
	warp::any().map(move || supervisor.clone())
}

pub async fn serve(
	scope: &Scope<'_, anyhow::Error>,
	bind_address: &str,
	supervisor: Arc<Supervisor>,
) -> anyhow::Result<()> {
	let addr: SocketAddr = bind_address.parse()?;

	let root = warp::path::end().and(warp::get()).and_then(handle_root);
	let start = warp::path("start")
		.and(warp::path::end())
		.and(warp::post())
		.and(with_supervisor(supervisor.clone()))
		.and_then(handle_start);
	let stop = warp::path("stop")
		.and(warp::path::end())
		.and(warp::post())
		.and(with_supervisor(supervisor.clone()))
		.and_then(handle_stop);
	let status = warp::path("status")
		.and(warp::path::end())
		.and(warp::get())
		.and(with_supervisor(supervisor.clone()))
		.and_then(handle_status);
	let health = warp::path("health")
		.and(warp::path::end())
		.and(warp::get())
		.and(with_supervisor(supervisor.clone()))
		.and_then(handle_health);
	let backfill_progress = warp::path("backfill-progress")
		.and(warp::path::end())
		.and(warp::get())
		.and(with_supervisor(supervisor))
		.and_then(handle_backfill_progress);

	let routes = root.or(start).or(stop).or(status).or(health).or(backfill_progress);

	info!(bind_address = %addr, "starting control plane");

	let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
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
	fn stop_reason_labels_are_snake_case() {
		assert_eq!(stop_reason_label(StopReason::TimeBudget), "time_budget");
		assert_eq!(stop_reason_label(StopReason::SizeBudget), "size_budget");
	}

	#[test]
	fn health_labels_match_classification() {
		assert_eq!(health_label(ChainHealth::Healthy), "healthy");
		assert_eq!(health_label(ChainHealth::Unhealthy), "unhealthy");
	}
}
