// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for invalidation, removal and garbage collection of entries.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use refetch::{
    Error, FetchError, ObserverOptions, QueryClient, QueryFilters, QueryObserver, QueryOptions, QueryStatus,
    QueryType, RefetchType,
};
use serde_json::json;

type TestResult = Result<(), Error>;

fn counting(key: serde_json::Value, calls: &Arc<AtomicUsize>) -> QueryOptions<u32> {
    let calls = Arc::clone(calls);
    QueryOptions::new(key).fetcher(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, FetchError>(u32::try_from(n + 1).unwrap_or(u32::MAX)) }
    })
}

#[tokio::test(start_paused = true)]
async fn unobserved_entry_is_collected_after_gc_time() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting(json!(["report"]), &calls).gc_time(Duration::from_secs(10));
    let observer = QueryObserver::new(&client, ObserverOptions::new(options))?;

    let subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;
    drop(subscription);

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(client.cache().len(), 1);

    // Coming back within the grace period keeps the entry and its data.
    let subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(client.cache().len(), 1);
    assert!(client.get_query_data(["report"]).is_some());

    drop(subscription);
    tokio::time::sleep(Duration::from_millis(10_001)).await;
    assert!(client.cache().is_empty());
    assert!(client.get_query_data(["report"]).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn entries_created_without_observers_are_collected() -> TestResult {
    let client = QueryClient::<u32>::new();
    let options = QueryOptions::new(["prefetched"])
        .gc_time(Duration::from_secs(30))
        .fetcher(|_| async { Ok::<_, FetchError>(1) });

    client.prefetch_query(options).await;
    assert_eq!(client.cache().len(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(client.cache().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn infinite_gc_time_keeps_entries() -> TestResult {
    let client = QueryClient::<u32>::new();
    client.build_query(&QueryOptions::new(["pinned"]).gc_time(Duration::MAX))?;
    client.set_query_data(["pinned"], 1)?;

    tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
    assert_eq!(client.get_query_data(["pinned"]).as_deref(), Some(&1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalidation_refetches_active_entries_only() -> TestResult {
    let client = QueryClient::new();
    let active_calls = Arc::new(AtomicUsize::new(0));
    let inactive_calls = Arc::new(AtomicUsize::new(0));

    let active = counting(json!(["todos", "open"]), &active_calls).stale_time(Duration::MAX);
    let observer = QueryObserver::new(&client, ObserverOptions::new(active))?;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = observer.subscribe(move |result| sink.lock().push(result.data().map(|d| **d)));

    let inactive = counting(json!(["todos", "done"]), &inactive_calls).stale_time(Duration::MAX);
    client.fetch_query(inactive)?.await?;
    tokio::time::sleep(Duration::from_millis(1)).await;

    client
        .invalidate_queries(&QueryFilters::new().key(["todos"]), RefetchType::Active)
        .await;

    assert_eq!(active_calls.load(Ordering::SeqCst), 2);
    assert_eq!(inactive_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), [None, Some(1), Some(2)]);

    // The inactive entry is stale despite its stale time and refetches on next use.
    let done = client.get_query_state(json!(["todos", "done"])).expect("entry exists");
    assert!(done.is_invalidated);
    assert_eq!(client.cache().find_all(&QueryFilters::new().stale(true)).len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalidation_without_refetch_only_marks() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting(json!(["settings"]), &calls).stale_time(Duration::MAX);
    let observer = QueryObserver::new(&client, ObserverOptions::new(options.clone()))?;
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    client
        .invalidate_queries(&QueryFilters::new(), RefetchType::None)
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(observer.current_result().is_stale());

    // The next fetch_query sees the entry as stale.
    assert_eq!(*client.fetch_query(options)?.await?, 2);
    assert!(!observer.current_result().is_stale());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refetch_queries_skips_disabled_observers() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    client.set_query_data(["paused"], 0)?;
    let options = ObserverOptions::new(counting(json!(["paused"]), &calls)).enabled(false);
    let observer = QueryObserver::new(&client, options)?;
    let _subscription = observer.subscribe(|_| {});

    client.refetch_queries(&QueryFilters::new()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.cache().find_all(&QueryFilters::new().query_type(QueryType::Active)).len(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reset_restores_initial_data_and_refetches_active() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting(json!(["draft"]), &calls).initial_data(100);
    let observer = QueryObserver::new(&client, ObserverOptions::new(options.clone()))?;
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;
    client.set_query_data(["draft"], 5)?;

    let reset = client.reset_queries(&QueryFilters::new().key(["draft"]));
    assert_eq!(client.get_query_data(["draft"]).as_deref(), Some(&100));
    reset.await;
    assert_eq!(client.get_query_data(["draft"]).as_deref(), Some(&2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reset_during_fetch_leaves_entry_collectable() -> TestResult {
    let client = QueryClient::<u32>::new();
    let options = QueryOptions::new(["export"])
        .gc_time(Duration::from_secs(10))
        .fetcher(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, FetchError>(1)
        });

    let handle = client.fetch_query(options)?;
    // The grace period elapses while the fetch is still running.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(client.cache().len(), 1);

    client.reset_queries(&QueryFilters::new().key(["export"])).await;
    assert!(handle.await.expect_err("reset cancels the fetch").is_cancelled());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(client.cache().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn removing_observed_entries() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let observer = QueryObserver::new(&client, ObserverOptions::new(counting(json!(["live"]), &calls)))?;
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    let query = observer.query();
    assert!(!client.cache().remove(&query));
    assert_eq!(client.cache().len(), 1);

    assert_eq!(client.remove_queries(&QueryFilters::new().key(["live"])), 1);
    assert!(client.cache().is_empty());

    // A later lookup builds a fresh entry.
    let fresh = client.build_query(&QueryOptions::new(["live"]))?;
    assert!(!fresh.ptr_eq(&query));
    assert_eq!(fresh.state().status, QueryStatus::Pending);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn is_fetching_counts_running_fetches() -> TestResult {
    let client = QueryClient::<u32>::new();
    let slow = |key: &'static str| {
        QueryOptions::new([key]).fetcher(|_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, FetchError>(1)
        })
    };

    let a = client.fetch_query(slow("a"))?;
    let b = client.fetch_query(slow("b"))?;
    assert_eq!(client.is_fetching(&QueryFilters::new()), 2);

    let _ = tokio::join!(a, b);
    assert_eq!(client.is_fetching(&QueryFilters::new()), 0);
    Ok(())
}
