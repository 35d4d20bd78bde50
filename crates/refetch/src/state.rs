// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The state held by a cache entry.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::FetchError;

/// Data that can be stored in a query cache.
///
/// Cached values are shared between tasks and compared for equality so that a refetch
/// yielding an unchanged value keeps the previously cached allocation.
pub trait QueryData: PartialEq + Send + Sync + 'static {}

impl<T: PartialEq + Send + Sync + 'static> QueryData for T {}

/// Whether an entry holds data, an error, or nothing yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// No fetch has settled yet and no data was provided.
    Pending,

    /// The entry holds data.
    Success,

    /// The last fetch failed after exhausting its retries.
    Error,
}

/// Whether a fetch is currently running for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// No fetch is in flight.
    Idle,

    /// A fetch attempt or a retry delay is in progress.
    Fetching,

    /// A fetch wants to run but the environment is offline. It resumes automatically
    /// once connectivity returns.
    Paused,
}

/// A point-in-time snapshot of an entry's state.
///
/// `data` is present exactly when `status` is [`QueryStatus::Success`] and `error` is
/// present exactly when `status` is [`QueryStatus::Error`].
#[non_exhaustive]
pub struct QueryState<T> {
    /// The cached value.
    pub data: Option<Arc<T>>,

    /// When `data` was last written, by a fetch or directly.
    pub data_updated_at: Option<Instant>,

    /// How many times data has been written.
    pub data_update_count: u32,

    /// The error of the last settled fetch, if it failed.
    pub error: Option<FetchError>,

    /// When the entry last settled with an error.
    pub error_updated_at: Option<Instant>,

    /// How many times the entry has settled with an error.
    pub error_update_count: u32,

    /// Failed attempts of the current or last fetch. Reset when a fetch starts.
    pub fetch_failure_count: u32,

    /// The error of the most recent failed attempt. Reset when a fetch starts.
    pub fetch_failure_reason: Option<FetchError>,

    /// See [`QueryStatus`].
    pub status: QueryStatus,

    /// See [`FetchStatus`].
    pub fetch_status: FetchStatus,

    /// Set by invalidation; makes the entry stale regardless of its age.
    pub is_invalidated: bool,

    revision: u64,
}

impl<T> QueryState<T> {
    pub(crate) fn new(initial: Option<(Arc<T>, Instant)>) -> Self {
        let (data, data_updated_at, status) = match initial {
            Some((data, at)) => (Some(data), Some(at), QueryStatus::Success),
            None => (None, None, QueryStatus::Pending),
        };

        Self {
            data,
            data_updated_at,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            status,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            revision: 0,
        }
    }

    /// A counter that increases with every change to the entry.
    ///
    /// Observers use it to discard notifications that arrive out of order.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns `true` if the data is missing, invalidated, or older than `stale_time`.
    ///
    /// A `stale_time` of [`Duration::MAX`] means data never goes stale by age.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: Duration, now: Instant) -> bool {
        if self.data.is_none() || self.is_invalidated {
            return true;
        }

        self.data_updated_at
            .and_then(|at| at.checked_add(stale_time))
            .is_some_and(|fresh_until| now >= fresh_until)
    }

    /// Returns the instant at which fresh data turns stale, if it is fresh now.
    pub(crate) fn stale_at(&self, stale_time: Duration, now: Instant) -> Option<Instant> {
        if self.is_stale_by_time(stale_time, now) {
            return None;
        }

        self.data_updated_at?.checked_add(stale_time)
    }

    /// Returns `true` once data or an error has been written at least once.
    #[must_use]
    pub fn has_settled(&self) -> bool {
        self.data_update_count + self.error_update_count > 0 || self.data.is_some()
    }

    pub(crate) fn bump_revision(&mut self, previous: u64) {
        self.revision = previous + 1;
    }
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            data_updated_at: self.data_updated_at,
            data_update_count: self.data_update_count,
            error: self.error.clone(),
            error_updated_at: self.error_updated_at,
            error_update_count: self.error_update_count,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: self.fetch_failure_reason.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            is_invalidated: self.is_invalidated,
            revision: self.revision,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("data_updated_at", &self.data_updated_at)
            .field("data_update_count", &self.data_update_count)
            .field("error", &self.error)
            .field("error_update_count", &self.error_update_count)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}
