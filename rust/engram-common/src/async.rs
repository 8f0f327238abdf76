//! Cross-platform async utilities for task spawning and aggregation.
//!
//! This module provides async primitives that work on both native platforms
//! (using tokio) and WebAssembly (using wasm-bindgen-futures). The main
//! abstractions are:
//!
//! - [`spawn`]: Spawn a future and await its result
//! - [`TaskQueue`]: Aggregate multiple fire-and-forget tasks and join them
//!
//! On native platforms, tasks are spawned via `tokio::spawn` which requires
//! `Send` bounds. On wasm32, tasks are spawned via
//! `wasm_bindgen_futures::spawn_local` which does not require `Send` (since
//! wasm is single-threaded).

use std::future::Future;

#[cfg(target_arch = "wasm32")]
use std::pin::Pin;

#[cfg(target_arch = "wasm32")]
use futures_util::future::try_join_all;
#[cfg(target_arch = "wasm32")]
use tokio::sync::oneshot::channel;

#[cfg(not(target_arch = "wasm32"))]
use tokio::task::JoinSet;

use thiserror::Error;

use crate::ConditionalSend;

/// Errors that can occur during async task execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngramAsyncError {
    /// The spawned task failed to rejoin (e.g., task panicked or was cancelled).
    #[error("Unable to rejoin pending future")]
    JoinError,
}

/// Spawns a future on the executor and returns its output.
///
/// Returns [`EngramAsyncError::JoinError`] if the spawned task panics, is
/// cancelled before completion, or (on wasm) the receiver is dropped before
/// the task completes.
pub async fn spawn<F>(future: F) -> Result<F::Output, EngramAsyncError>
where
    F: Future + ConditionalSend + 'static,
    F::Output: Send + 'static,
{
    #[cfg(target_arch = "wasm32")]
    {
        let (tx, rx) = channel();

        wasm_bindgen_futures::spawn_local(async move {
            // Send the result back; ignore error if receiver was dropped
            let _ = tx.send(future.await);
        });

        rx.await.map_err(|_| EngramAsyncError::JoinError)
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::spawn(future)
            .await
            .map_err(|_| EngramAsyncError::JoinError)
    }
}

/// Spawns a future without awaiting its output.
///
/// The future is polled to completion by the executor; its output (if any) is
/// discarded. Useful for fan-out work whose completion is observed through
/// some other channel.
pub fn spawn_detached<F>(future: F)
where
    F: Future + ConditionalSend + 'static,
    F::Output: ConditionalSend + 'static,
{
    #[cfg(target_arch = "wasm32")]
    {
        wasm_bindgen_futures::spawn_local(async move {
            let _ = future.await;
        });
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::spawn(async move {
            let _ = future.await;
        });
    }
}

/// An aggregator of async work that can be used to observe the moment when all
/// the aggregated work is completed. It is similar to tokio's [`JoinSet`], but
/// is relatively constrained and also works on `wasm32-unknown-unknown`.
/// Unlike [`JoinSet`], the results can not be observed individually.
#[derive(Default)]
pub struct TaskQueue {
    #[cfg(not(target_arch = "wasm32"))]
    tasks: JoinSet<Result<(), EngramAsyncError>>,

    #[cfg(target_arch = "wasm32")]
    tasks: Vec<SendSyncDoNotApply>,
}

/// Wrapper to make non-Send futures usable in contexts requiring Send+Sync.
///
/// # Safety
///
/// This is safe on wasm32 because wasm is single-threaded, so the futures are
/// only ever polled from the thread that created them, and this wrapper is
/// only compiled on wasm32 targets.
#[cfg(target_arch = "wasm32")]
struct SendSyncDoNotApply(Pin<Box<dyn Future<Output = Result<(), EngramAsyncError>>>>);

#[cfg(target_arch = "wasm32")]
// SAFETY: wasm32 is single-threaded, so Send is vacuously satisfied
unsafe impl Send for SendSyncDoNotApply {}

#[cfg(target_arch = "wasm32")]
// SAFETY: wasm32 is single-threaded, so Sync is vacuously satisfied
unsafe impl Sync for SendSyncDoNotApply {}

#[cfg(target_arch = "wasm32")]
impl Future for SendSyncDoNotApply {
    type Output = Result<(), EngramAsyncError>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        // SAFETY: the inner future is never moved, only polled in place
        let inner = unsafe { &mut self.get_unchecked_mut().0 };
        inner.as_mut().poll(cx)
    }
}

impl TaskQueue {
    /// Queues a future to be executed when [`join`](Self::join) is called.
    ///
    /// The future must return `Result<(), EngramAsyncError>`. All queued
    /// futures will be polled to completion before `join` returns.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = Result<(), EngramAsyncError>> + ConditionalSend + 'static,
    {
        #[cfg(not(target_arch = "wasm32"))]
        {
            self.tasks.spawn(future);
        }

        #[cfg(target_arch = "wasm32")]
        {
            self.tasks.push(SendSyncDoNotApply(Box::pin(future)));
        }
    }

    /// Waits for every queued task to complete, surfacing the first error
    /// encountered (remaining tasks are still driven to completion).
    pub async fn join(&mut self) -> Result<(), EngramAsyncError> {
        #[cfg(not(target_arch = "wasm32"))]
        {
            let mut result = Ok(());

            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => (),
                    Ok(Err(error)) => {
                        if result.is_ok() {
                            result = Err(error);
                        }
                    }
                    Err(_) => {
                        if result.is_ok() {
                            result = Err(EngramAsyncError::JoinError);
                        }
                    }
                }
            }

            result
        }

        #[cfg(target_arch = "wasm32")]
        {
            let tasks = std::mem::take(&mut self.tasks);
            try_join_all(tasks).await?;
            Ok(())
        }
    }
}
