//! Matches asynchronously delivered returns to their originating calls.
//!
//! Queue-relayed transports publish a [`Call`](crate::envelope::Call) on one
//! channel and deliver its [`Return`] on a separate channel shared with many
//! other calls, in any order. The [`Correlator`] holds the table of
//! outstanding call IDs; each inbound return is looked up by call ID and
//! handed to the waiter registered for it.
//!
//! Returns whose call ID has no outstanding entry (late arrivals after a
//! timeout, or returns addressed to another instance) are logged and
//! discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use stratus_core::{CallId, Error};

use crate::envelope::{now_ms, Return};

type Table = HashMap<CallId, oneshot::Sender<Return>>;

/// Outstanding-call table for one facade instance.
///
/// Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    pending: Arc<Mutex<Table>>,
}

impl Correlator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `call_id` as outstanding and returns the handle that
    /// resolves when its return arrives.
    ///
    /// Register before publishing the call, so a fast return cannot race
    /// past its own table entry.
    #[must_use]
    pub fn register(&self, call_id: CallId) -> PendingReturn {
        let (tx, rx) = oneshot::channel();
        let previous = self.table().insert(call_id, tx);
        if previous.is_some() {
            tracing::error!(%call_id, "call ID registered twice; earlier waiter dropped");
        }
        PendingReturn {
            call_id,
            rx,
            correlator: self.clone(),
        }
    }

    /// Delivers `ret` to the waiter registered for its call ID.
    ///
    /// Returns false if no call with that ID is outstanding.
    pub fn settle(&self, ret: Return) -> bool {
        let call_id = ret.call_id;
        let Some(waiter) = self.table().remove(&call_id) else {
            tracing::warn!(%call_id, "discarding return with no outstanding call");
            crate::metrics::record_unmatched_return();
            return false;
        };
        if waiter.send(ret).is_err() {
            tracing::debug!(%call_id, "caller stopped waiting before its return arrived");
        }
        true
    }

    /// Returns the number of calls still awaiting a return.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table().len()
    }

    /// Settles every outstanding call with an error return built from
    /// `error`. Returns how many calls were settled.
    pub fn fail_all(&self, error: &Error) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let now = now_ms();
        let count = drained.len();
        for (call_id, waiter) in drained {
            let _ = waiter.send(Return::transport_failure(call_id, error, now, now));
        }
        if count > 0 {
            tracing::debug!(count, error = %error, "failed outstanding calls");
        }
        count
    }

    /// Drops the entry for `call_id`, e.g. when publishing its call failed.
    /// A return arriving later is discarded as unmatched.
    pub fn forget(&self, call_id: CallId) {
        self.table().remove(&call_id);
    }
}

/// A registered call awaiting its return.
#[derive(Debug)]
pub struct PendingReturn {
    call_id: CallId,
    rx: oneshot::Receiver<Return>,
    correlator: Correlator,
}

impl PendingReturn {
    /// Returns the call ID this handle waits for.
    #[must_use]
    pub const fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Waits for the return, synthesizing an error return if `timeout`
    /// elapses first or the correlator is torn down.
    ///
    /// The synthesized return's execution window spans the wait itself.
    pub async fn wait(self, timeout: Option<Duration>) -> Return {
        let started = now_ms();
        let Self {
            call_id,
            rx,
            correlator,
        } = self;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    correlator.forget(call_id);
                    let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(%call_id, millis, "call timed out awaiting return");
                    return Return::transport_failure(
                        call_id,
                        &Error::Timeout { millis },
                        started,
                        now_ms(),
                    );
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| {
            Return::transport_failure(
                call_id,
                &Error::internal("correlation entry dropped"),
                started,
                now_ms(),
            )
        })
    }
}
