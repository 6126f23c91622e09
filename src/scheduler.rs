//! Bounded-concurrency executor with back-pressure, binding the
//! `Uploader`/`Downloader` orchestration loops to a fixed pool of P workers.
//!
//! This generalizes the bounded `FuturesOrdered`/`JoinSet` pumps seen
//! throughout the ancestor codebase (the `PUT_BLOCKS_MAX_PARALLEL`-capped
//! pipeline uploading blocks, the `WorkerProcessor` driving a bounded set of
//! background workers) into a single reusable component instead of an
//! inline loop per call site.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Error;

/// Default worker pool size per transfer.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// A bounded-concurrency task pool. At no point does the number of
/// outstanding tasks exceed `pool_size`: `submit` blocks the caller when the
/// pool is full, which is the engine's only form of back-pressure.
pub struct TransferScheduler<T> {
	pool_size: usize,
	permits: Arc<Semaphore>,
	tasks: JoinSet<Result<T, Error>>,
}

impl<T: Send + 'static> TransferScheduler<T> {
	pub fn new(pool_size: usize) -> Self {
		Self {
			pool_size,
			permits: Arc::new(Semaphore::new(pool_size)),
			tasks: JoinSet::new(),
		}
	}

	pub fn pool_size(&self) -> usize {
		self.pool_size
	}

	/// Number of tasks currently in flight.
	pub fn in_flight(&self) -> usize {
		self.tasks.len()
	}

	/// Enqueue one unit of work. Awaits a free permit first: with P tasks
	/// already in flight, this suspends until one completes.
	pub async fn submit<F>(&mut self, task: F)
	where
		F: Future<Output = Result<T, Error>> + Send + 'static,
		T: 'static,
	{
		let permit = self
			.permits
			.clone()
			.acquire_owned()
			.await
			.expect("scheduler semaphore was closed");
		self.tasks.spawn(async move {
			let result = task.await;
			drop(permit);
			result
		});
	}

	/// Non-blocking reap of whatever has finished since the last poll.
	pub fn poll_completed(&mut self) -> Vec<Result<T, Error>> {
		let mut out = Vec::new();
		while let Some(joined) = self.tasks.try_join_next() {
			out.push(joined.expect("transfer worker task panicked"));
		}
		out
	}

	/// Await every outstanding task and return their terminal results. Used
	/// both for a clean finish and, after an error has aborted submission,
	/// to drain in-flight work whose results are then discarded.
	pub async fn join_all(&mut self) -> Vec<Result<T, Error>> {
		let mut out = Vec::new();
		while let Some(joined) = self.tasks.join_next().await {
			out.push(joined.expect("transfer worker task panicked"));
		}
		out
	}
}
