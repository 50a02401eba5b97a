//! Stories about the worker pool draining the work queue

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use memcached_operator::controller::{ObjectKey, WorkerPool};
use memcached_operator::crd::RuleSpec;
use memcached_operator::events::reasons;
use memcached_operator::queue::WorkQueue;
use memcached_operator::retry::RetryConfig;

use super::fake::{context, leaf, proxy, FakeCluster};

fn fast_backoff() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

/// Poll `done` until it holds, failing the test after a few seconds
async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Story: a malformed proxy is reported and dropped while a valid proxy
/// queued next to it converges normally
#[tokio::test]
async fn story_malformed_proxy_does_not_block_valid_one() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "broken", RuleSpec::default()));
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.put_endpoints("default", "fuga", &["10.0.0.1"]);
    let (ctx, events) = context(&cluster);

    let queue = WorkQueue::new(fast_backoff());
    let pool = WorkerPool::new(queue.clone(), ctx, 2, 3);
    queue.add(ObjectKey::new("default", "broken"));
    queue.add(ObjectKey::new("default", "hoge"));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually("valid proxy to sync", || {
        cluster
            .proxy("default", "hoge")
            .and_then(|p| p.status)
            .is_some_and(|s| s.initialized)
    })
    .await;
    eventually("validation event", || {
        !events.with_reason(reasons::VALIDATION_FAILED).is_empty()
    })
    .await;
    shutdown.cancel();
    run.await.unwrap();

    let failures = events.with_reason(reasons::VALIDATION_FAILED);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].object, "default/broken");
    assert!(failures[0].warning);
    assert!(cluster.children_of("default", "broken").is_empty());
    assert!(cluster.proxy("default", "broken").unwrap().status.is_none());
    assert_eq!(cluster.children_of("default", "hoge").len(), 3);
    assert_eq!(queue.num_requeues(&ObjectKey::new("default", "broken")), 0);
}

/// Story: a proxy that keeps failing on the API is retried `max_retries`
/// times after the first attempt, then dropped with a warning event
#[tokio::test]
async fn story_failing_proxy_exhausts_retry_budget() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.fail_endpoint_reads(true);
    let (ctx, events) = context(&cluster);

    let queue = WorkQueue::new(fast_backoff());
    let pool = WorkerPool::new(queue.clone(), ctx, 1, 2);
    queue.add(ObjectKey::new("default", "hoge"));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually("retries to run out", || {
        !events.with_reason(reasons::RETRIES_EXHAUSTED).is_empty()
    })
    .await;
    shutdown.cancel();
    run.await.unwrap();

    assert_eq!(cluster.endpoint_reads(), 3);
    assert!(cluster.children_of("default", "hoge").is_empty());
    let exhausted = events.with_reason(reasons::RETRIES_EXHAUSTED);
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].object, "default/hoge");
}

/// Story: a proxy that recovers before its budget runs out converges
#[tokio::test]
async fn story_transient_failure_recovers() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.fail_endpoint_reads(true);
    let (ctx, events) = context(&cluster);

    let queue = WorkQueue::new(fast_backoff());
    let pool = WorkerPool::new(queue.clone(), ctx, 1, 1_000);
    queue.add(ObjectKey::new("default", "hoge"));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually("a failed attempt", || cluster.endpoint_reads() >= 2).await;
    cluster.fail_endpoint_reads(false);
    eventually("proxy to sync", || {
        cluster
            .proxy("default", "hoge")
            .and_then(|p| p.status)
            .is_some_and(|s| s.initialized)
    })
    .await;
    shutdown.cancel();
    run.await.unwrap();

    assert!(events.with_reason(reasons::RETRIES_EXHAUSTED).is_empty());
    assert_eq!(queue.num_requeues(&ObjectKey::new("default", "hoge")), 0);
}
