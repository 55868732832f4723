//! Concurrency-bounded FIFO admission queue.
//!
//! A [`Funnel`] caps how many asynchronous operations run at once. Operations
//! beyond the cap wait in arrival order and are admitted one by one as running
//! operations settle.
//!
//! ## Lifecycle of an operation
//!
//! ```text
//! push ──► queued ──► running ──► settled
//!             │
//!             └── clear_pending ──► settled (Cancelled)
//! ```
//!
//! Every operation settles exactly once. An operation removed by
//! [`Funnel::clear_pending`] settles as [`FunnelError::Cancelled`] so that
//! nobody awaiting its handle waits forever.
//!
//! ## Example
//!
//! ```rust
//! use stratus_invoke::funnel::Funnel;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let funnel = Funnel::with_max_concurrency(2);
//! let handles: Vec<_> = (0..5).map(|i| funnel.push(move || async move { i * 2 })).collect();
//! for (i, handle) in handles.into_iter().enumerate() {
//!     assert_eq!(handle.await.unwrap(), i * 2);
//! }
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::{oneshot, Notify};

/// Why a funnel operation did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FunnelError {
    /// The operation was removed from the queue before it started.
    #[error("operation cancelled before it started")]
    Cancelled,
    /// The operation panicked or its task was torn down while running.
    #[error("operation aborted while running")]
    Aborted,
}

impl From<FunnelError> for stratus_core::Error {
    fn from(e: FunnelError) -> Self {
        match e {
            FunnelError::Cancelled => Self::cancelled("removed from funnel before it started"),
            FunnelError::Aborted => Self::internal("funnel operation aborted"),
        }
    }
}

struct Queued {
    order: u64,
    admit: oneshot::Sender<Slot>,
}

#[derive(Default)]
struct FunnelState {
    /// 0 means unbounded.
    max_concurrency: usize,
    running: usize,
    queue: VecDeque<Queued>,
    next_order: u64,
}

impl FunnelState {
    fn has_capacity(&self) -> bool {
        self.max_concurrency == 0 || self.running < self.max_concurrency
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.queue.is_empty()
    }
}

struct Shared {
    name: Option<String>,
    state: Mutex<FunnelState>,
    idle: Notify,
}

impl Shared {
    // Bookkeeping must stay usable after a panic elsewhere; no critical
    // section leaves the state half-updated.
    fn lock(&self) -> MutexGuard<'_, FunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, state: &FunnelState) {
        if let Some(name) = &self.name {
            crate::metrics::record_funnel_depth(name, state.running, state.queue.len());
        }
    }

    /// Admits queued operations while capacity allows.
    ///
    /// Popping the queue head and bumping the running count happen under the
    /// same lock, so concurrent callers can never admit past the cap.
    fn admit_ready(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                if !state.has_capacity() {
                    break;
                }
                let Some(queued) = state.queue.pop_front() else {
                    break;
                };
                state.running += 1;
                self.record_depth(&state);
                queued
            };

            tracing::trace!(order = next.order, "admitting funnel operation");
            if let Err(slot) = next.admit.send(Slot::new(Arc::clone(self))) {
                // The waiting task is gone; hand the slot straight back.
                slot.disarm();
            }
        }
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            self.record_depth(&state);
        }
        self.admit_ready();
        if self.lock().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

/// A running slot. Dropping it releases the slot and admits the queue head.
struct Slot {
    shared: Option<Arc<Shared>>,
}

impl Slot {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    /// Gives the slot back without admitting anything; the caller is
    /// already inside the admission loop.
    fn disarm(mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.lock();
            state.running = state.running.saturating_sub(1);
            shared.record_depth(&state);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

/// Handle to the eventual outcome of an operation pushed into a [`Funnel`].
///
/// Dropping the handle does not cancel the operation.
#[must_use = "the handle is the only way to observe the operation's outcome"]
pub struct FunnelHandle<T> {
    order: u64,
    rx: oneshot::Receiver<Result<T, FunnelError>>,
}

impl<T> FunnelHandle<T> {
    /// Returns the FIFO arrival index assigned when the operation was pushed.
    #[must_use]
    pub const fn order(&self) -> u64 {
        self.order
    }
}

impl<T> Future for FunnelHandle<T> {
    type Output = Result<T, FunnelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(FunnelError::Aborted)))
    }
}

/// Concurrency-bounded FIFO admission queue for asynchronous operations.
///
/// Cloning a funnel yields another handle to the same queue.
#[derive(Clone)]
pub struct Funnel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Funnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Funnel")
            .field("name", &self.shared.name)
            .field("max_concurrency", &state.max_concurrency)
            .field("running", &state.running)
            .field("pending", &state.queue.len())
            .finish()
    }
}

impl Default for Funnel {
    fn default() -> Self {
        Self::new()
    }
}

impl Funnel {
    /// Creates an unbounded funnel. Bounding is opt-in.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_concurrency(0)
    }

    /// Creates a funnel admitting at most `max_concurrency` operations at
    /// once; 0 means unbounded.
    #[must_use]
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self::build(None, max_concurrency)
    }

    /// Creates a funnel that reports its depth under `name` via the metrics
    /// facade.
    #[must_use]
    pub fn named(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self::build(Some(name.into()), max_concurrency)
    }

    /// Returns the name gauges are reported under, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    fn build(name: Option<String>, max_concurrency: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(FunnelState {
                    max_concurrency,
                    ..FunnelState::default()
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Queues `op` for execution and returns a handle to its outcome.
    ///
    /// The operation runs on a spawned tokio task once admitted, so this
    /// must be called from within a tokio runtime.
    pub fn push<F, Fut, T>(&self, op: F) -> FunnelHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (admit_tx, admit_rx) = oneshot::channel::<Slot>();
        let (result_tx, result_rx) = oneshot::channel();

        let order = {
            let mut state = self.shared.lock();
            let order = state.next_order;
            state.next_order += 1;
            state.queue.push_back(Queued {
                order,
                admit: admit_tx,
            });
            self.shared.record_depth(&state);
            order
        };

        tokio::spawn(async move {
            let outcome = match admit_rx.await {
                Ok(slot) => {
                    let result = AssertUnwindSafe(async move { op().await })
                        .catch_unwind()
                        .await;
                    drop(slot);
                    result.map_err(|_| FunnelError::Aborted)
                }
                Err(_) => Err(FunnelError::Cancelled),
            };
            // The caller may have dropped the handle.
            let _ = result_tx.send(outcome);
        });

        self.shared.admit_ready();
        FunnelHandle {
            order,
            rx: result_rx,
        }
    }

    /// Changes the cap for future admissions; 0 means unbounded.
    ///
    /// Running operations are never paused or preempted. Raising the cap
    /// immediately admits queued operations up to the new limit.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.shared.lock().max_concurrency = max_concurrency;
        self.shared.admit_ready();
    }

    /// Returns the current cap; 0 means unbounded.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.shared.lock().max_concurrency
    }

    /// Removes every queued operation without starting it.
    ///
    /// Each removed operation settles as [`FunnelError::Cancelled`]. Running
    /// operations are unaffected. Returns how many were removed.
    pub fn clear_pending(&self) -> usize {
        let drained: Vec<Queued> = {
            let mut state = self.shared.lock();
            let drained = state.queue.drain(..).collect();
            self.shared.record_depth(&state);
            drained
        };
        let cancelled = drained.len();
        // Dropping the admission senders settles each waiting task.
        drop(drained);

        if self.shared.lock().is_idle() {
            self.shared.idle.notify_waiters();
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "cleared pending funnel operations");
        }
        cancelled
    }

    /// Returns the number of operations currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Returns the number of operations waiting for admission.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Resolves once nothing is running or queued.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Yields enough times for spawned tasks to reach their next await point.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn unbounded_by_default() {
        let funnel = Funnel::new();
        assert_eq!(funnel.max_concurrency(), 0);

        let gate = Arc::new(Notify::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gate = Arc::clone(&gate);
                funnel.push(move || async move { gate.notified().await })
            })
            .collect();
        settle().await;
        assert_eq!(funnel.running(), 10);
        assert_eq!(funnel.pending(), 0);

        gate.notify_waiters();
        for handle in handles {
            assert!(handle.await.is_ok());
        }
        assert_eq!(funnel.running(), 0);
    }

    #[tokio::test]
    async fn errors_from_operations_are_passed_through() {
        let funnel = Funnel::with_max_concurrency(1);
        let handle = funnel.push(|| async { Err::<u32, &str>("boom") });
        assert_eq!(handle.await, Ok(Err("boom")));
        assert_eq!(funnel.running(), 0);
    }

    #[tokio::test]
    async fn panicking_operation_releases_its_slot() {
        let funnel = Funnel::with_max_concurrency(1);
        let bad = funnel.push(|| async { panic!("operation exploded") });
        let good = funnel.push(|| async { 7 });

        assert_eq!(bad.await, Err::<(), _>(FunnelError::Aborted));
        assert_eq!(good.await, Ok(7));
        assert_eq!(funnel.running(), 0);
    }

    #[tokio::test]
    async fn handle_reports_arrival_order() {
        let funnel = Funnel::with_max_concurrency(1);
        let first = funnel.push(|| async {});
        let second = funnel.push(|| async {});
        assert_eq!(first.order(), 0);
        assert_eq!(second.order(), 1);
        let _ = (first.await, second.await);
    }

    #[tokio::test]
    async fn idle_resolves_after_running_work_finishes() {
        let funnel = Funnel::with_max_concurrency(2);
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let finished = Arc::clone(&finished);
            drop(funnel.push(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), funnel.idle())
            .await
            .expect("funnel should drain");
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn idle_returns_immediately_when_empty() {
        let funnel = Funnel::new();
        tokio::time::timeout(Duration::from_millis(100), funnel.idle())
            .await
            .expect("empty funnel is idle");
    }

    #[test]
    fn funnel_error_converts_to_core_error() {
        let err: stratus_core::Error = FunnelError::Cancelled.into();
        assert_eq!(err.name(), "CancelledError");
    }
}
