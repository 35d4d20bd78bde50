// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! An asynchronous query cache with deduplicated fetching, retries, and
//! subscription-based invalidation.
//!
//! The cache stores the results of asynchronous reads ("queries") under structured
//! keys and keeps interested consumers up to date:
//! - One entry per canonical key; property order inside objects never matters
//! - At most one fetch per entry at a time, shared by every caller
//! - Retries with capped exponential backoff and jitter
//! - Cooperative cancellation that reverts the entry to its pre-fetch state
//! - Observers that only notify when a field the consumer reads has changed
//! - Stale-while-revalidate on subscribe, refocus, reconnect and polling
//! - Garbage collection of unobserved entries after a grace period
//! - Serializable snapshots for persistence and server-to-client transfer
//!
//! # Examples
//!
//! ## Fetching
//!
//! ```
//! use refetch::{FetchError, QueryClient, QueryOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), refetch::Error> {
//! let client = QueryClient::<Vec<String>>::new();
//! let todos = QueryOptions::new(["todos"])
//!     .fetcher(|_ctx| async { Ok::<_, FetchError>(vec!["write docs".to_string()]) });
//!
//! // Concurrent callers share one fetch.
//! let (a, b) = tokio::join!(client.fetch_query(todos.clone())?, client.fetch_query(todos)?);
//! assert!(std::sync::Arc::ptr_eq(&a?, &b?));
//! # Ok(())
//! # }
//! ```
//!
//! ## Observing
//!
//! ```
//! use refetch::{FetchError, ObserverOptions, QueryClient, QueryFilters, QueryObserver, QueryOptions, RefetchType};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), refetch::Error> {
//! let client = QueryClient::<u32>::new();
//! let options = QueryOptions::new(["counter"]).fetcher(|_ctx| async { Ok::<_, FetchError>(1) });
//!
//! let observer = QueryObserver::new(&client, ObserverOptions::new(options))?;
//! let _subscription = observer.subscribe(|result| {
//!     // Reading `data` only: fetch status changes alone will not call this again.
//!     println!("counter: {:?}", result.data());
//! });
//!
//! // Mark everything under ["counter"] stale and refetch what is observed.
//! client.invalidate_queries(&QueryFilters::new().key(["counter"]), RefetchType::Active).await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod client;
mod environment;
mod error;
mod hydration;
mod key;
mod observer;
mod options;
mod query;
mod result;
mod retry;
mod runtime;
mod state;
mod subscription;
mod telemetry;

#[doc(inline)]
pub use cache::{QueryCache, QueryCacheEvent, QueryFilters, QueryType};
#[doc(inline)]
pub use client::{QueryClient, QueryClientBuilder, RefetchType};
#[doc(inline)]
pub use environment::Environment;
#[doc(inline)]
pub use error::{Error, FetchError, KeyError, Result};
#[doc(inline)]
pub use hydration::{DehydrateOptions, DehydratedQuery, DehydratedState, dehydrate, hydrate};
#[doc(inline)]
pub use key::{IntoQueryKey, KeyHash, QueryKey};
#[doc(inline)]
pub use observer::QueryObserver;
#[doc(inline)]
pub use options::{FetchOptions, NetworkMode, NotifyOnChange, ObserverOptions, Placeholder, QueryDefaults, QueryOptions, RefetchTrigger};
#[doc(inline)]
pub use query::{EntryObserver, FetchHandle, Query, QueryContext};
#[doc(inline)]
pub use result::{FieldSet, QueryObserverResult, ResultField};
#[doc(inline)]
pub use retry::{Backoff, BackoffOptions, RetryDelay, RetryPolicy};
#[doc(inline)]
pub use state::{FetchStatus, QueryData, QueryState, QueryStatus};
#[doc(inline)]
pub use subscription::Subscription;
#[doc(inline)]
pub use tokio_util::sync::CancellationToken;
