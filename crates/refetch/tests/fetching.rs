// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for fetching through the client: deduplication, retries,
//! cancellation and network modes.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use refetch::{
    Backoff, Environment, Error, FetchError, FetchStatus, NetworkMode, ObserverOptions, QueryClient, QueryFilters,
    QueryObserver, QueryOptions, QueryStatus, RetryDelay, RetryPolicy,
};
use serde_json::json;

type TestResult = Result<(), Error>;

fn slow_todo(calls: &Arc<AtomicUsize>) -> QueryOptions<String> {
    let calls = Arc::clone(calls);
    QueryOptions::new(json!(["todo", 5])).fetcher(move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let id = ctx.key().segments()[1].clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, FetchError>(format!("todo {id}"))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_fetch() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = client.fetch_query(slow_todo(&calls))?;
    let second = client.fetch_query(slow_todo(&calls))?;
    assert!(first.same_fetch(&second));

    let (first, second) = tokio::join!(first, second);
    assert!(Arc::ptr_eq(&first?, &second?));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_caller_joins_running_fetch() -> TestResult {
    let client = QueryClient::<String>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(["todos"]).fetcher(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, FetchError>("list".to_string())
        }
    });

    let first = client.fetch_query(options.clone())?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(first.peek().is_none());

    let second = client.fetch_query(options)?;
    assert!(first.same_fetch(&second));

    let (first, second) = tokio::join!(first, second);
    assert!(Arc::ptr_eq(&first?, &second?));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn many_callers_share_one_fetch() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let futures = FuturesUnordered::new();
    for _ in 0..10 {
        futures.push(client.fetch_query(slow_todo(&calls))?);
    }

    assert!(
        futures
            .all(|out| async move { out.is_ok_and(|data| data.as_str() == "todo 5") })
            .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn two_observers_of_one_key_trigger_one_fetch() -> TestResult {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let a = QueryObserver::new(&client, ObserverOptions::new(slow_todo(&calls)))?;
    let b = QueryObserver::new(&client, ObserverOptions::new(slow_todo(&calls)))?;
    assert!(a.query().ptr_eq(&b.query()));

    let _a = a.subscribe(|_| {});
    let _b = b.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for observer in [&a, &b] {
        let result = observer.current_result();
        assert_eq!(result.status(), QueryStatus::Success);
        assert_eq!(result.data().map(|d| d.as_str()), Some("todo 5"));
    }
    assert_eq!(client.cache().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn object_property_order_does_not_split_entries() -> TestResult {
    let client = QueryClient::<u32>::new();
    client.set_query_data(json!(["todos", {"status": "done", "page": 1}]), 3)?;

    let data = client.get_query_data(json!(["todos", {"page": 1, "status": "done"}]));
    assert_eq!(data.as_deref(), Some(&3));
    assert!(client.get_query_data(json!(["todos", {"page": 2, "status": "done"}])).is_none());
    assert_eq!(client.cache().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_fetch_makes_retries_plus_one_attempts() -> TestResult {
    let client = QueryClient::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(["flaky"])
        .fetcher(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(FetchError::msg("service unavailable")) }
        })
        .retry(RetryPolicy::Retries(2))
        .retry_delay(RetryDelay::backoff(Backoff::Exponential, Duration::from_millis(10)));

    let err = client.fetch_query(options)?.await.expect_err("every attempt fails");
    assert_eq!(err.fetch_error().map(ToString::to_string).as_deref(), Some("service unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state(["flaky"]).expect("entry exists");
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.fetch_failure_count, 3);
    assert!(state.data.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failures() -> TestResult {
    let client = QueryClient::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(["eventually"]).fetcher(move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if ctx.attempt() < 2 {
                Err(FetchError::msg("not yet"))
            } else {
                Ok(7)
            }
        }
    });

    // Default retry policy and delay: three retries with jittered exponential backoff.
    let data = client.fetch_query(options)?.await?;
    assert_eq!(*data, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state(["eventually"]).expect("entry exists");
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_failure_count, 0);
    assert!(state.fetch_failure_reason.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelling_reverts_to_previous_data() -> TestResult {
    let client = QueryClient::<u32>::new();
    let options = QueryOptions::new(["slow"]).fetcher(|ctx| async move {
        ctx.signal().cancelled().await;
        Ok::<_, FetchError>(99)
    });
    client.set_query_data(["slow"], 1)?;

    let query = client.build_query(&options)?;
    let handle = query.fetch(refetch::FetchOptions::default());
    assert_eq!(query.state().fetch_status, FetchStatus::Fetching);

    assert_eq!(client.cancel_queries(&QueryFilters::new().key(["slow"])), 1);
    assert!(handle.await.expect_err("fetch was cancelled").is_cancelled());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = query.state();
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.data.as_deref(), Some(&1));
    assert_eq!(state.data_update_count, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn superseded_fetch_result_is_discarded() -> TestResult {
    let client = QueryClient::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    // The first attempt ignores cancellation and answers late with a stale value.
    let options = QueryOptions::new(["race"]).fetcher(move |_| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, FetchError>(1)
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(2)
            }
        }
    });
    client.set_query_data(["race"], 0)?;

    let query = client.build_query(&options)?;
    let old = query.fetch(refetch::FetchOptions::default());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let new = query.fetch(refetch::FetchOptions::cancel_refetch());
    assert!(!old.same_fetch(&new));

    assert_eq!(*new.await?, 2);
    assert!(old.await.expect_err("superseded").is_cancelled());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(query.data().as_deref(), Some(&2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn offline_fetch_pauses_until_reconnect() -> TestResult {
    let environment = Environment::with_state(false, true);
    let client = QueryClient::<u32>::builder().environment(environment.clone()).build();
    let options = QueryOptions::new(["remote"]).fetcher(|_| async { Ok::<_, FetchError>(5) });

    let handle = client.fetch_query(options)?;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.get_query_state(["remote"]).map(|s| s.fetch_status), Some(FetchStatus::Paused));
    assert!(handle.peek().is_none());

    assert!(environment.set_online(true));
    assert_eq!(*handle.await?, 5);
    assert_eq!(client.get_query_state(["remote"]).map(|s| s.fetch_status), Some(FetchStatus::Idle));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn always_mode_ignores_connectivity() -> TestResult {
    let client = QueryClient::<u32>::builder()
        .environment(Environment::with_state(false, true))
        .build();
    let options = QueryOptions::new(["local"])
        .network_mode(NetworkMode::Always)
        .fetcher(|_| async { Ok::<_, FetchError>(1) });

    assert_eq!(*client.fetch_query(options)?.await?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn offline_first_tries_once_then_pauses() -> TestResult {
    let environment = Environment::with_state(false, true);
    let client = QueryClient::<u32>::builder().environment(environment.clone()).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(["cached-by-sw"])
        .network_mode(NetworkMode::OfflineFirst)
        .retry_delay(RetryDelay::backoff(Backoff::Constant, Duration::from_millis(10)).jitter(false))
        .fetcher(move |_| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(FetchError::msg("offline"))
                } else {
                    Ok(3)
                }
            }
        });

    let handle = client.fetch_query(options)?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.get_query_state(["cached-by-sw"]).map(|s| s.fetch_status), Some(FetchStatus::Paused));

    environment.set_online(true);
    assert_eq!(*handle.await?, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_fetcher_settles_as_error() -> TestResult {
    let client = QueryClient::<u32>::new();

    let err = client.fetch_query(QueryOptions::new(["nothing"]))?.await.expect_err("no fetcher");
    assert!(err.fetch_error().is_some());
    assert_eq!(client.get_query_state(["nothing"]).map(|s| s.status), Some(QueryStatus::Error));
    Ok(())
}

#[tokio::test]
async fn invalid_keys_are_rejected_before_anything_is_created() {
    let client = QueryClient::<u32>::new();

    let err = client.fetch_query(QueryOptions::new(json!({"not": "an array"}))).expect_err("invalid key");
    assert!(matches!(err, refetch::KeyError::NotAnArray(_)));
    assert!(client.cache().is_empty());
}
