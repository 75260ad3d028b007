//! A minimal scoped-task runner.
//!
//! The engine's root future and every long-running subsystem (control plane,
//! metrics server, per-chain collectors) are spawned through a [`Scope`]
//! rather than bare `tokio::spawn`. A `Scope` gives us two things a plain
//! `JoinSet` doesn't: a shared cancellation signal every spawned task can
//! observe at its suspension points, and a distinction between tasks whose
//! failure should bring the whole process down (`spawn`) and best-effort
//! background tasks whose failure should just be logged (`spawn_weak`).

use std::{future::Future, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to the scope's cancellation signal. Cloned freely; cheap.
#[derive(Clone)]
pub struct Scope<'a, E> {
	cancellation: CancellationToken,
	handles: Arc<std::sync::Mutex<Vec<JoinHandle<Result<(), E>>>>>,
	_marker: std::marker::PhantomData<&'a ()>,
}

impl<'a, E> Scope<'a, E>
where
	E: std::fmt::Debug + Send + 'static,
{
	fn new() -> Self {
		Self {
			cancellation: CancellationToken::new(),
			handles: Arc::new(std::sync::Mutex::new(Vec::new())),
			_marker: std::marker::PhantomData,
		}
	}

	/// Spawn a task whose failure is treated as fatal for the whole scope:
	/// its cancellation token is triggered so every other task observes the
	/// shutdown at its next suspension point.
	pub fn spawn<F>(&self, fut: F)
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Send + 'static,
	{
		let cancellation = self.cancellation.clone();
		let handle = tokio::spawn(async move {
			let result = fut.await;
			if result.is_err() {
				cancellation.cancel();
			}
			result
		});
		self.handles.lock().unwrap().push(handle);
	}

	/// Spawn a best-effort background task. Its failure is logged but does
	/// not cancel the rest of the scope (used for the control-plane/metrics
	/// HTTP servers: losing them shouldn't stop ingestion).
	pub fn spawn_weak<F>(&self, fut: F)
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
	{
		tokio::spawn(async move {
			if let Err(e) = fut.await {
				tracing::error!("background task exited with error: {e:?}");
			}
		});
	}

	/// The cancellation signal every suspension point should race against.
	pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
		self.cancellation.cancelled()
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancellation.clone()
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancellation.is_cancelled()
	}

	pub fn cancel(&self) {
		self.cancellation.cancel();
	}
}

/// Entry point: runs `root` with a fresh [`Scope`], then waits for every task
/// spawned via [`Scope::spawn`] to finish, returning the first error (if
/// any) encountered either by the root future or by a spawned task.
pub async fn task_scope<'a, F, Fut, T, E>(root: F) -> Result<T, E>
where
	F: for<'s> FnOnce(&'s Scope<'a, E>) -> Fut,
	Fut: Future<Output = Result<T, E>> + 'a,
	E: std::fmt::Debug + Send + 'static,
{
	let scope = Scope::new();
	let result = root(&scope).await;

	let handles = std::mem::take(&mut *scope.handles.lock().unwrap());
	for handle in handles {
		match handle.await {
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				if result.is_ok() {
					return Err(e);
				}
			},
			Err(join_error) => {
				tracing::error!("scoped task panicked: {join_error}");
			},
		}
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn root_error_propagates() {
		let result: Result<(), &'static str> =
			task_scope(|_scope| async move { Err("boom") }).await;
		assert_eq!(result, Err("boom"));
	}

	#[tokio::test]
	async fn spawned_task_error_propagates_and_cancels_scope() {
		let result: Result<(), &'static str> = task_scope(|scope| async move {
			scope.spawn(async { Err("spawned failure") });
			scope.cancelled().await;
			Ok(())
		})
		.await;
		assert_eq!(result, Err("spawned failure"));
	}

	#[tokio::test]
	async fn weak_task_failure_does_not_fail_scope() {
		let result: Result<(), &'static str> = task_scope(|scope| async move {
			scope.spawn_weak(async { Err("ignored") });
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
			Ok(())
		})
		.await;
		assert_eq!(result, Ok(()));
	}
}
