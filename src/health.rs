//! Bare process liveness endpoint: `GET /health` -> `200 OK`.
//!
//! Distinct from the richer per-chain health classification exposed by the
//! control plane: this is only a "is the process alive" probe for an
//! orchestrator's liveness check, built on [`warp`] so it can share a runtime
//! with the metrics server and the control plane instead of owning a raw
//! `TcpListener`.

use std::net::SocketAddr;

use tracing::info;
use warp::Filter;

use crate::task_scope::Scope;

pub async fn serve(scope: &Scope<'_, anyhow::Error>, bind_address: &str) -> anyhow::Result<()> {
	let addr: SocketAddr = bind_address.parse()?;

	let route = warp::path("health").and(warp::path::end()).map(|| "OK");

	info!(bind_address = %addr, "starting liveness endpoint");

	let (_, server) = warp::serve(route).bind_with_graceful_shutdown(addr, async move {
		std::future::pending::<()>().await;
	});

	scope.spawn_weak(async move {
		server.await;
		Ok(())
	});

	Ok(())
}
