//! Per-key debounce and cancellation for asynchronous requests.
//!
//! Every data fetch goes through [`RequestCoordinator`]. A new call for a key
//! cancels whatever the previous call for that key was doing (waiting out its
//! debounce window or already in flight), and only the newest call for a key
//! may hand its result back.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Cancelled;

/// Result of a scheduled call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Applied(T),
    /// A newer call for the same key (or an explicit cancel) took over.
    Superseded,
}

impl<T> Outcome<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Superseded => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

/// Identity of one scheduled call.
#[derive(Debug, Clone)]
struct RequestHandle {
    key: String,
    generation: u64,
    token: CancellationToken,
}

struct Slot {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone, Default)]
pub struct RequestCoordinator {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_generation: Arc<AtomicU64>,
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` without a newer call for `key`, then runs `operation`.
    pub async fn schedule<T, F, Fut>(
        &self,
        key: impl Into<String>,
        delay: Duration,
        operation: F,
    ) -> Result<Outcome<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.schedule_with(key, delay, operation, |value| value).await
    }

    /// Like [`schedule`](Self::schedule), but hands the result to `apply`
    /// while the key table is still locked, so a newer call for the key can
    /// neither start nor finish between the generation check and `apply`.
    pub async fn schedule_with<T, R, F, Fut, A>(
        &self,
        key: impl Into<String>,
        delay: Duration,
        operation: F,
        apply: A,
    ) -> Result<Outcome<R>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
        A: FnOnce(T) -> R,
    {
        let handle = self.begin(key.into()).await;

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = handle.token.cancelled() => {
                    debug!(
                        key = %handle.key,
                        generation = handle.generation,
                        "request: debounced call superseded"
                    );
                    return Ok(Outcome::Superseded);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Dropping the operation future on cancellation is what aborts the
        // underlying transport call.
        let result = tokio::select! {
            biased;
            _ = handle.token.cancelled() => None,
            result = operation(handle.token.clone()) => Some(result),
        };

        self.finish(handle, result, apply).await
    }

    async fn begin(&self, key: String) -> RequestHandle {
        let mut slots = self.slots.lock().await;
        // Drawn under the lock so registration order matches generation order.
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        if let Some(previous) = slots.insert(
            key.clone(),
            Slot {
                generation,
                token: token.clone(),
            },
        ) {
            debug!(
                %key,
                superseded_generation = previous.generation,
                generation,
                "request: cancelling previous call"
            );
            previous.token.cancel();
        }
        RequestHandle {
            key,
            generation,
            token,
        }
    }

    async fn finish<T, R, A>(
        &self,
        handle: RequestHandle,
        result: Option<Result<T>>,
        apply: A,
    ) -> Result<Outcome<R>>
    where
        A: FnOnce(T) -> R,
    {
        let mut slots = self.slots.lock().await;
        let is_current = slots
            .get(&handle.key)
            .is_some_and(|slot| slot.generation == handle.generation);
        if is_current {
            slots.remove(&handle.key);
        }

        let Some(result) = result else {
            return Ok(Outcome::Superseded);
        };
        if !is_current || handle.token.is_cancelled() {
            debug!(
                key = %handle.key,
                generation = handle.generation,
                "request: discarding stale result"
            );
            return Ok(Outcome::Superseded);
        }

        match result {
            Ok(value) => Ok(Outcome::Applied(apply(value))),
            Err(err) if err.is::<Cancelled>() => Ok(Outcome::Superseded),
            Err(err) => Err(err),
        }
    }

    /// Cancels the pending or in-flight call for `key`, if any.
    pub async fn cancel(&self, key: &str) -> bool {
        let removed = self.slots.lock().await.remove(key);
        match removed {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending or in-flight call; used on teardown.
    pub async fn cancel_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let count = slots.len();
        for (_, slot) in slots.drain() {
            slot.token.cancel();
        }
        count
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        self.slots.lock().await.contains_key(key)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
