// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios exercising the memory pool's public surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use otap_df_memory_pool::{EventKind, MemoryPool, QueryId, TaskKey};

fn task(query: u64, stage: u32, index: u32, attempt: u32) -> TaskKey {
    TaskKey::new(QueryId::new(query), stage, index, attempt)
}

/// Scenario 1: tagged allocation accounting.
#[test]
fn tagged_allocation_accounting() {
    let pool = MemoryPool::new(1000);
    let t = task(1, 0, 0, 0);

    assert!(pool.try_reserve(t, "a", 10));
    let allocations = pool.get_tagged_memory_allocations();
    assert_eq!(
        allocations.get(&t.query_id()).and_then(|m| m.get("a")),
        Some(&10)
    );

    pool.free(t, "a", 5).expect("partial free should succeed");
    let allocations = pool.get_tagged_memory_allocations();
    assert_eq!(
        allocations.get(&t.query_id()).and_then(|m| m.get("a")),
        Some(&5)
    );

    assert!(pool.try_reserve(t, "b", 20));
    let allocations = pool.get_tagged_memory_allocations();
    let query_tags = allocations.get(&t.query_id()).expect("query present");
    assert_eq!(query_tags.get("a"), Some(&5));
    assert_eq!(query_tags.get("b"), Some(&20));

    pool.free(t, "a", 5).expect("should drain tag a to zero");
    let allocations = pool.get_tagged_memory_allocations();
    let query_tags = allocations.get(&t.query_id()).expect("query still present");
    assert!(!query_tags.contains_key("a"));
    assert_eq!(query_tags.get("b"), Some(&20));

    pool.free(t, "b", 20).expect("should drain tag b to zero");
    let allocations = pool.get_tagged_memory_allocations();
    assert!(allocations.get(&t.query_id()).is_none());
}

/// Scenario 2: per-task / per-query rollup, including the underflow error.
#[test]
fn per_task_rollup() {
    let pool = MemoryPool::new(1000);
    let q1t1 = task(1, 0, 1, 0);
    let q1t2 = task(1, 0, 2, 0);
    let q2t1 = task(2, 0, 1, 0);

    assert!(pool.try_reserve(q1t1, "x", 10));
    assert!(pool.try_reserve(q1t2, "x", 7));
    assert!(pool.try_reserve(q2t1, "x", 9));

    assert_eq!(pool.get_query_memory_reservation(QueryId::new(1)), 17);
    assert_eq!(pool.get_query_memory_reservation(QueryId::new(2)), 9);
    assert_eq!(pool.get_task_memory_reservations().len(), 3);

    assert!(pool.try_reserve(q1t1, "x", 3));
    assert_eq!(pool.get_query_memory_reservation(QueryId::new(1)), 20);
    assert_eq!(pool.get_task_memory_reservation(q1t1), 13);

    pool.free(q1t1, "x", 5).expect("free within balance");
    assert_eq!(pool.get_query_memory_reservation(QueryId::new(1)), 15);
    assert_eq!(pool.get_task_memory_reservation(q1t1), 8);

    let err = pool.free(q1t1, "x", 9).expect_err("overdraw should fail");
    assert_eq!(
        err.to_string(),
        "tried to free more memory than is reserved by task"
    );
    // State must be unchanged after a rejected free.
    assert_eq!(pool.get_query_memory_reservation(QueryId::new(1)), 15);
    assert_eq!(pool.get_task_memory_reservation(q1t1), 8);

    pool.free(q1t1, "x", 8).expect("drain task1 to zero");
    assert_eq!(pool.get_task_memory_reservation(q1t1), 0);
    assert!(!pool.get_task_memory_reservations().contains_key(&q1t1));
    assert_eq!(pool.get_query_memory_reservation(QueryId::new(1)), 7);
}

/// The per-task revocable free path rejects an overdraw with the same
/// contractual message shape as the non-revocable path, and leaves the
/// ledger untouched.
#[test]
fn revocable_free_overdraw_is_rejected() {
    let pool = MemoryPool::new(1000);
    let t = task(1, 0, 0, 0);

    pool.reserve_revocable(t, 10);

    let err = pool
        .free_revocable(t, 11)
        .expect_err("overdrawing a task's revocable reservation should fail");
    assert_eq!(
        err.to_string(),
        "tried to free more revocable memory than is reserved by task"
    );

    // State must be unchanged after a rejected free.
    assert_eq!(pool.get_reserved_revocable_bytes(), 10);

    pool.free_revocable(t, 10)
        .expect("freeing exactly what was reserved should succeed");
    assert_eq!(pool.get_reserved_revocable_bytes(), 0);
}

/// Scenario 3: waiter FIFO wake and non-cancellability.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_fifo_wake() {
    const MB: u64 = 1024 * 1024;
    let pool = MemoryPool::new(10 * MB);
    let t = task(1, 0, 0, 0);

    assert!(pool.try_reserve(t, "probe", 10 * MB - 2));

    let future = pool.reserve(t, "big", 10 * MB);
    assert!(!future.is_ready());
    assert_eq!(
        future.cancel().unwrap_err().to_string(),
        "cancellation is not supported"
    );

    let waiting = tokio::spawn(future);

    // Give the spawned task a chance to register its waker before we free.
    tokio::task::yield_now().await;

    pool.free(t, "probe", 10 * MB - 2)
        .expect("freeing the probe reservation should succeed");

    tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("reservation future should complete once capacity frees up")
        .expect("spawned task should not panic");

    assert_eq!(pool.get_reserved_bytes(), 10 * MB);
}

/// Scenario 4: a global revocable reservation blocks a non-revocable one
/// until it is freed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_revocable_blocks_non_revocable() {
    let pool = MemoryPool::new(1000);

    assert!(pool.try_reserve_revocable(999));
    assert!(!pool.try_reserve_revocable(2));

    let t = task(1, 0, 0, 0);
    let future = pool.reserve(t, "tag", 2);
    assert!(!future.is_ready());

    let waiting = tokio::spawn(future);
    tokio::task::yield_now().await;

    pool.free_global_revocable(999)
        .expect("global revocable free should succeed");

    tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("future should complete once revocable memory is freed")
        .expect("spawned task should not panic");

    assert_eq!(pool.get_reserved_bytes(), 2);
    assert_eq!(pool.get_reserved_revocable_bytes(), 0);
}

/// Scenario 5: an operator holding revocable memory is asked to revoke it,
/// unblocking a waiter that had exhausted non-revocable capacity.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocable_to_free_transition_via_revoke() {
    const MB: u64 = 1024 * 1024;
    let pool = MemoryPool::new(10 * MB);
    let operator = task(1, 0, 0, 0);
    let blocked = task(2, 0, 0, 0);

    // The operator claims the entire pool as revocable memory it can spill
    // on request; `reserve_revocable` never blocks or fails for capacity.
    pool.reserve_revocable(operator, 10 * MB);
    assert_eq!(pool.get_free_bytes(), 0);

    let future = pool.reserve(blocked, "tag", 1);
    assert!(!future.is_ready());
    let waiting = tokio::spawn(future);
    tokio::task::yield_now().await;

    // The policy is notified once the pool has no free bytes left and asks
    // the operator to revoke everything it holds.
    pool.free_revocable(operator, 10 * MB)
        .expect("operator revokes its full revocable reservation");

    tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("reservation should unblock once revocable memory is freed")
        .expect("spawned task should not panic");

    assert_eq!(pool.get_reserved_revocable_bytes(), 0);
    assert_eq!(pool.get_reserved_bytes(), 1);
}

/// Scenario 6: a registered listener observes the post-mutation state.
#[test]
fn listener_observes_reservation() {
    let pool = MemoryPool::new(1000);
    let seen_reserved_bytes = Arc::new(AtomicU64::new(u64::MAX));
    let seen = seen_reserved_bytes.clone();

    let _id = pool.register_listener(EventKind::MemoryReserved, move |event| {
        seen.store(event.reserved_bytes, Ordering::SeqCst);
    });

    let t = task(1, 0, 0, 0);
    assert!(pool.try_reserve(t, "test", 3));

    assert_eq!(seen_reserved_bytes.load(Ordering::SeqCst), 3);
    assert_eq!(pool.get_reserved_bytes(), 3);
}

/// A listener that panics must not corrupt pool state or abort the caller.
#[test]
fn panicking_listener_is_isolated() {
    let pool = MemoryPool::new(1000);
    let _id = pool.register_listener(EventKind::MemoryReserved, |_event| {
        panic!("listener misbehaving on purpose");
    });

    let t = task(1, 0, 0, 0);
    assert!(pool.try_reserve(t, "test", 3));
    assert_eq!(pool.get_reserved_bytes(), 3);
}

/// Testable property: quiescence implies emptiness.
#[test]
fn quiescence_implies_empty_maps() {
    let pool = MemoryPool::new(1000);
    let t1 = task(1, 0, 0, 0);
    let t2 = task(1, 0, 1, 0);

    assert!(pool.try_reserve(t1, "a", 40));
    assert!(pool.try_reserve(t2, "b", 60));
    pool.free(t1, "a", 40).unwrap();
    pool.free(t2, "b", 60).unwrap();

    assert_eq!(pool.get_reserved_bytes(), 0);
    assert!(pool.get_task_memory_reservations().is_empty());
    assert!(pool.get_query_memory_reservations().is_empty());
    assert!(pool.get_tagged_memory_allocations().is_empty());
}

/// Testable property: query totals always equal the sum of that query's
/// task totals, across an interleaving of several tasks sharing a query.
#[test]
fn query_totals_match_task_sum() {
    let pool = MemoryPool::new(1000);
    let t1 = task(7, 0, 0, 0);
    let t2 = task(7, 0, 1, 0);
    let t3 = task(7, 1, 0, 0);

    assert!(pool.try_reserve(t1, "x", 11));
    assert!(pool.try_reserve(t2, "y", 22));
    assert!(pool.try_reserve(t3, "z", 33));
    pool.free(t2, "y", 5).unwrap();

    let tasks = pool.get_task_memory_reservations();
    let sum: u64 = [t1, t2, t3].iter().map(|t| tasks.get(t).copied().unwrap_or(0)).sum();
    assert_eq!(sum, pool.get_query_memory_reservation(QueryId::new(7)));
}

/// Testable property: free bytes can go negative once revocable
/// reservations outgrow what non-revocable accounting alone would allow.
#[test]
fn free_bytes_may_go_negative() {
    let pool = MemoryPool::new(100);
    let t = task(1, 0, 0, 0);
    assert!(pool.try_reserve(t, "tag", 100));
    pool.reserve_revocable(t, 10);
    assert_eq!(pool.get_free_bytes(), -10);
}

/// Testable property: a batch of queued waiters, whose bytes are already
/// folded into `reserved_bytes` the moment each one is created, all
/// complete together the instant the pool next fits them, regardless of
/// how many there were or how big each request was.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_batch_completes_together_once_capacity_allows() {
    use rand::Rng;

    let mut rng = rand::rng();
    let waiter_count = rng.random_range(3..8);
    let base_task = task(1, 0, 0, 0);
    let pool = MemoryPool::new(100);

    assert!(pool.try_reserve(base_task, "base", 100));

    let mut handles = Vec::with_capacity(waiter_count);
    let mut total_requested: u64 = 0;
    for i in 0..waiter_count {
        let requested: u64 = rng.random_range(1..10);
        total_requested += requested;
        let waiter = task(2, 0, i as u32, 0);
        let future = pool.reserve(waiter, "waiter", requested);
        assert!(!future.is_ready());
        handles.push(tokio::spawn(future));
    }

    tokio::task::yield_now().await;
    for handle in &handles {
        assert!(!handle.is_finished());
    }

    pool.free(base_task, "base", 100)
        .expect("freeing the base reservation should satisfy every waiter at once");

    for handle in handles {
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("every queued waiter should complete once capacity allows")
            .expect("spawned task should not panic");
    }

    assert_eq!(pool.get_reserved_bytes(), total_requested);
}
