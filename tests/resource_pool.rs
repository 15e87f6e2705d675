// tests/resource_pool.rs

mod common;
use crate::common::{init_tracing, with_timeout};

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use ducc::sched::{ResourcePool, acquire_multiple, release_multiple};

#[test]
fn create_or_get_returns_the_first_resource_for_a_key() {
    let pool = ResourcePool::new();

    let first = pool.create_or_get_resource("scale", 1);
    let second = pool.create_or_get_resource("scale", 7);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.capacity(), 1, "capacity of later calls is ignored");
    assert_eq!(pool.len(), 1);
}

#[test]
fn lock_order_follows_creation_order() {
    let pool = ResourcePool::new();
    let a = pool.create_or_get_resource("a", 1);
    let b = pool.create_or_get_resource("b", 1);
    let c = pool.create_or_get_resource("c", 1);

    assert!(a.lock_order() < b.lock_order());
    assert!(b.lock_order() < c.lock_order());
    assert_eq!(pool.keys(), vec!["a", "b", "c"]);
}

#[test]
fn concurrent_creation_agrees_on_one_resource() {
    let pool = Arc::new(ResourcePool::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.create_or_get_resource("shared", 2))
        })
        .collect();
    let resources: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for r in &resources {
        assert!(Arc::ptr_eq(r, &resources[0]));
    }
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn acquire_waits_for_release() {
    init_tracing();
    let pool = ResourcePool::new();
    let scale = pool.create_or_get_resource("scale", 1);

    scale.acquire().await;
    assert_eq!(scale.available(), 0);

    let waiter = {
        let scale = Arc::clone(&scale);
        tokio::spawn(async move {
            scale.acquire().await;
            scale.release();
        })
    };

    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    scale.release();
    with_timeout(waiter).await.unwrap();
    assert_eq!(scale.available(), 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_honours_backoff_but_try_acquire_does_not() {
    init_tracing();
    let pool = ResourcePool::new();
    let registry = pool.create_or_get_resource("container_registry_example.org", 2);

    let start = Instant::now();
    registry.prohibit_for(Duration::from_secs(10));
    assert!(registry.prohibited_until().is_some());

    // The non-blocking path ignores the window on purpose.
    assert!(registry.try_acquire());
    registry.release();

    registry.acquire().await;
    assert!(
        start.elapsed() >= Duration::from_secs(10),
        "acquire returned after {:?}",
        start.elapsed()
    );
    registry.release();
    assert_eq!(registry.available(), 2);
}

#[tokio::test(start_paused = true)]
async fn prohibit_until_never_shortens_the_window() {
    let pool = ResourcePool::new();
    let r = pool.create_or_get_resource("r", 1);
    let start = Instant::now();

    r.prohibit_until(start + Duration::from_secs(30));
    r.prohibit_until(start + Duration::from_secs(5));
    assert_eq!(r.prohibited_until(), Some(start + Duration::from_secs(30)));

    r.acquire().await;
    assert!(start.elapsed() >= Duration::from_secs(30));
    r.release();
}

#[tokio::test(start_paused = true)]
async fn extending_the_window_delays_current_waiters() {
    let pool = ResourcePool::new();
    let r = pool.create_or_get_resource("r", 1);
    let start = Instant::now();
    r.prohibit_for(Duration::from_secs(2));

    let waiter = {
        let r = Arc::clone(&r);
        tokio::spawn(async move {
            r.acquire().await;
            Instant::now()
        })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    r.prohibit_for(Duration::from_secs(5));

    let acquired_at = waiter.await.unwrap();
    assert!(acquired_at - start >= Duration::from_secs(6));
    r.release();
}

#[test]
#[should_panic(expected = "released beyond its capacity")]
fn releasing_more_than_acquired_panics() {
    let pool = ResourcePool::new();
    let r = pool.create_or_get_resource("r", 1);
    r.release();
}

#[tokio::test]
async fn acquire_multiple_round_trip_restores_capacity() {
    let pool = ResourcePool::new();
    let a = pool.create_or_get_resource("a", 2);
    let b = pool.create_or_get_resource("b", 1);
    let c = pool.create_or_get_resource("c", 3);
    let set = vec![Arc::clone(&c), Arc::clone(&a), Arc::clone(&b)];

    for _ in 0..3 {
        acquire_multiple(&set).await;
        assert_eq!((a.available(), b.available(), c.available()), (1, 0, 2));
        release_multiple(&set);
    }

    assert_eq!((a.available(), b.available(), c.available()), (2, 1, 3));
}

#[tokio::test]
async fn cancelled_acquire_multiple_gives_back_partial_acquisitions() {
    let pool = ResourcePool::new();
    let first = pool.create_or_get_resource("first", 1);
    let second = pool.create_or_get_resource("second", 1);

    // Hold the later resource so the batch stalls after taking `first`.
    second.acquire().await;

    let set = vec![Arc::clone(&second), Arc::clone(&first)];
    let attempt = tokio::time::timeout(Duration::from_millis(20), acquire_multiple(&set)).await;
    assert!(attempt.is_err());

    assert_eq!(first.available(), 1);
    second.release();
}

#[tokio::test]
async fn acquire_multiple_takes_a_repeated_resource_once() {
    let pool = ResourcePool::new();
    let single = pool.create_or_get_resource("single", 1);
    let pair = pool.create_or_get_resource("pair", 2);
    let set = vec![
        Arc::clone(&single),
        Arc::clone(&pair),
        Arc::clone(&single),
        Arc::clone(&pair),
    ];

    with_timeout(acquire_multiple(&set)).await;
    assert_eq!((single.available(), pair.available()), (0, 1));

    release_multiple(&set);
    assert_eq!((single.available(), pair.available()), (1, 2));
}

/// Run `tasks` concurrently, each acquiring its resource subset with
/// `acquire_multiple`, and report whether all of them finished in time.
fn all_tasks_finish(capacities: Vec<usize>, tasks: Vec<Vec<usize>>) -> bool {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let pool = Arc::new(ResourcePool::new());
        let resources: Vec<_> = capacities
            .iter()
            .enumerate()
            .map(|(i, cap)| pool.create_or_get_resource(&format!("r{i}"), *cap))
            .collect();

        let mut handles = Vec::new();
        for wanted in tasks {
            let mut set: Vec<_> = wanted
                .into_iter()
                .map(|i| Arc::clone(&resources[i % resources.len()]))
                .collect();
            set.sort_by_key(|r| r.lock_order());
            set.dedup_by_key(|r| r.lock_order());
            // Callers list resources in arbitrary order.
            set.reverse();

            handles.push(tokio::spawn(async move {
                for _ in 0..3 {
                    acquire_multiple(&set).await;
                    tokio::task::yield_now().await;
                    release_multiple(&set);
                }
            }));
        }

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            for h in handles {
                h.await.unwrap();
            }
        })
        .await
        .is_ok();

        finished
            && resources
                .iter()
                .zip(&capacities)
                .all(|(r, cap)| r.available() == *cap)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn overlapping_resource_sets_never_deadlock(
        capacities in proptest::collection::vec(1..3usize, 2..6),
        tasks in proptest::collection::vec(
            proptest::collection::vec(0..8usize, 2..5),
            2..12,
        ),
    ) {
        prop_assert!(all_tasks_finish(capacities, tasks));
    }
}
