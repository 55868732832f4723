//! Admission, resizing and cancellation behavior of the funnel.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tokio::sync::oneshot;

use stratus_invoke::funnel::{Funnel, FunnelError, FunnelHandle};

/// Yields until spawned tasks have run as far as they can.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Tasks that block until released, recording admission order and peak
/// concurrency.
struct Harness {
    funnel: Funnel,
    started: Arc<Mutex<Vec<usize>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    gates: Vec<Option<oneshot::Sender<()>>>,
    handles: Vec<Option<FunnelHandle<usize>>>,
}

impl Harness {
    fn new(max_concurrency: usize, tasks: usize) -> Self {
        let mut harness = Self {
            funnel: Funnel::with_max_concurrency(max_concurrency),
            started: Arc::default(),
            active: Arc::default(),
            peak: Arc::default(),
            gates: Vec::new(),
            handles: Vec::new(),
        };
        for i in 0..tasks {
            harness.push(i);
        }
        harness
    }

    fn push(&mut self, i: usize) {
        let (tx, rx) = oneshot::channel::<()>();
        let started = Arc::clone(&self.started);
        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak);
        let handle = self.funnel.push(move || async move {
            started.lock().unwrap().push(i);
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let _ = rx.await;
            active.fetch_sub(1, Ordering::SeqCst);
            i
        });
        self.gates.push(Some(tx));
        self.handles.push(Some(handle));
    }

    fn release(&mut self, i: usize) {
        if let Some(gate) = self.gates[i].take() {
            let _ = gate.send(());
        }
    }

    fn started(&self) -> Vec<usize> {
        self.started.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn outcome(&mut self, i: usize) -> Result<usize, FunnelError> {
        self.handles[i].take().expect("outcome taken twice").await
    }
}

#[tokio::test]
async fn admits_at_most_cap_in_push_order() {
    let mut harness = Harness::new(3, 10);
    settle().await;
    assert_eq!(harness.funnel.running(), 3);
    assert_eq!(harness.funnel.pending(), 7);
    assert_eq!(harness.started(), vec![0, 1, 2]);

    for i in 0..10 {
        harness.release(i);
        settle().await;
        assert!(harness.funnel.running() <= 3);
    }
    for i in 0..10 {
        assert_eq!(harness.outcome(i).await, Ok(i));
    }
    assert_eq!(harness.peak(), 3);
    assert_eq!(harness.started(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn raising_the_cap_admits_immediately() {
    let mut harness = Harness::new(2, 6);
    settle().await;
    assert_eq!(harness.funnel.running(), 2);

    harness.funnel.set_max_concurrency(4);
    settle().await;
    assert_eq!(harness.funnel.running(), 4);
    assert_eq!(harness.funnel.pending(), 2);
    assert_eq!(harness.started(), vec![0, 1, 2, 3]);

    for i in 0..6 {
        harness.release(i);
    }
    for i in 0..6 {
        assert_eq!(harness.outcome(i).await, Ok(i));
    }
}

#[tokio::test]
async fn lowering_the_cap_never_preempts() {
    let mut harness = Harness::new(4, 6);
    settle().await;
    assert_eq!(harness.funnel.running(), 4);

    harness.funnel.set_max_concurrency(1);
    settle().await;
    assert_eq!(harness.funnel.running(), 4);

    // Releasing one of four leaves three running; still above the new cap.
    harness.release(0);
    settle().await;
    assert_eq!(harness.funnel.running(), 3);
    assert_eq!(harness.funnel.pending(), 2);

    for i in 1..4 {
        harness.release(i);
    }
    settle().await;
    assert_eq!(harness.funnel.running(), 1);
    assert_eq!(harness.started(), vec![0, 1, 2, 3, 4]);

    harness.release(4);
    harness.release(5);
    for i in 0..6 {
        assert_eq!(harness.outcome(i).await, Ok(i));
    }
}

#[tokio::test]
async fn clear_pending_cancels_only_queued_tasks() {
    let mut harness = Harness::new(1, 4);
    settle().await;

    assert_eq!(harness.funnel.clear_pending(), 3);
    assert_eq!(harness.funnel.pending(), 0);
    assert_eq!(harness.funnel.running(), 1);

    for i in 1..4 {
        assert_eq!(harness.outcome(i).await, Err(FunnelError::Cancelled));
    }

    harness.release(0);
    assert_eq!(harness.outcome(0).await, Ok(0));
    assert_eq!(harness.started(), vec![0]);
}

#[tokio::test]
async fn funnel_accepts_work_after_clearing() {
    let funnel = Funnel::with_max_concurrency(1);
    assert_eq!(funnel.clear_pending(), 0);
    assert_eq!(funnel.push(|| async { "ok" }).await, Ok("ok"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cap_holds_and_admission_is_fifo(
        (cap, order) in (1usize..5, 0usize..16).prop_flat_map(|(cap, tasks)| {
            (Just(cap), Just((0..tasks).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        tokio_test::block_on(async {
            let tasks = order.len();
            let mut harness = Harness::new(cap, tasks);
            settle().await;

            for &i in &order {
                prop_assert!(harness.funnel.running() <= cap);
                harness.release(i);
                settle().await;
            }
            for i in 0..tasks {
                prop_assert_eq!(harness.outcome(i).await, Ok(i));
            }

            prop_assert!(harness.peak() <= cap);
            prop_assert_eq!(harness.started(), (0..tasks).collect::<Vec<_>>());
            prop_assert_eq!(harness.funnel.running(), 0);
            Ok(())
        })?;
    }
}
