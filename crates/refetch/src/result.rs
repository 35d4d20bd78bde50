// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The result an observer hands to its listeners, and field tracking.
//!
//! Every accessor of [`QueryObserverResult`] records the field it reads. An observer
//! with [`NotifyOnChange::Tracked`](crate::NotifyOnChange::Tracked) then only notifies
//! its listeners when one of those fields changes.

use std::{
    fmt,
    ops::BitOr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::time::Instant;

use crate::{
    error::FetchError,
    state::{FetchStatus, QueryStatus},
};

/// A field of [`QueryObserverResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResultField {
    /// [`QueryObserverResult::status`]
    Status,
    /// [`QueryObserverResult::fetch_status`]
    FetchStatus,
    /// [`QueryObserverResult::data`]
    Data,
    /// [`QueryObserverResult::data_updated_at`]
    DataUpdatedAt,
    /// [`QueryObserverResult::data_update_count`]
    DataUpdateCount,
    /// [`QueryObserverResult::error`]
    Error,
    /// [`QueryObserverResult::error_updated_at`]
    ErrorUpdatedAt,
    /// [`QueryObserverResult::failure_count`]
    FailureCount,
    /// [`QueryObserverResult::failure_reason`]
    FailureReason,
    /// [`QueryObserverResult::is_stale`]
    IsStale,
    /// [`QueryObserverResult::is_placeholder_data`]
    IsPlaceholderData,
    /// [`QueryObserverResult::is_fetched_after_mount`]
    IsFetchedAfterMount,
}

const ALL_FIELDS: [ResultField; 12] = [
    ResultField::Status,
    ResultField::FetchStatus,
    ResultField::Data,
    ResultField::DataUpdatedAt,
    ResultField::DataUpdateCount,
    ResultField::Error,
    ResultField::ErrorUpdatedAt,
    ResultField::FailureCount,
    ResultField::FailureReason,
    ResultField::IsStale,
    ResultField::IsPlaceholderData,
    ResultField::IsFetchedAfterMount,
];

impl ResultField {
    const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// A set of [`ResultField`]s.
///
/// # Examples
///
/// ```
/// use refetch::{FieldSet, ResultField};
///
/// let fields = FieldSet::from(ResultField::Data) | ResultField::Error;
/// assert!(fields.contains(ResultField::Error));
/// assert!(!fields.contains(ResultField::IsStale));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldSet(u32);

impl FieldSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every field.
    #[must_use]
    pub fn all() -> Self {
        ALL_FIELDS.into_iter().collect()
    }

    /// Returns the set with `field` added.
    #[must_use]
    pub const fn with(self, field: ResultField) -> Self {
        Self(self.0 | field.bit())
    }

    /// Returns `true` if `field` is in the set.
    #[must_use]
    pub const fn contains(self, field: ResultField) -> bool {
        self.0 & field.bit() != 0
    }

    /// Returns `true` if the sets share a field.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `true` if the set holds no field.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the fields in the set.
    pub fn iter(self) -> impl Iterator<Item = ResultField> {
        ALL_FIELDS.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<ResultField> for FieldSet {
    fn from(field: ResultField) -> Self {
        Self::empty().with(field)
    }
}

impl FromIterator<ResultField> for FieldSet {
    fn from_iter<I: IntoIterator<Item = ResultField>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl BitOr<ResultField> for FieldSet {
    type Output = Self;

    fn bitor(self, rhs: ResultField) -> Self {
        self.with(rhs)
    }
}

impl BitOr for FieldSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Records which fields listeners read. Shared by every result an observer produces.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker(Arc<AtomicU32>);

impl Tracker {
    fn track(&self, field: ResultField) {
        self.0.fetch_or(field.bit(), Ordering::Relaxed);
    }

    pub fn fields(&self) -> FieldSet {
        FieldSet(self.0.load(Ordering::Relaxed))
    }
}

/// The consumer-facing view of an entry, as seen through one observer.
pub struct QueryObserverResult<R> {
    pub(crate) status: QueryStatus,
    pub(crate) fetch_status: FetchStatus,
    pub(crate) data: Option<Arc<R>>,
    pub(crate) data_updated_at: Option<Instant>,
    pub(crate) data_update_count: u32,
    pub(crate) error: Option<FetchError>,
    pub(crate) error_updated_at: Option<Instant>,
    pub(crate) failure_count: u32,
    pub(crate) failure_reason: Option<FetchError>,
    pub(crate) is_stale: bool,
    pub(crate) is_placeholder_data: bool,
    pub(crate) is_fetched_after_mount: bool,
    pub(crate) tracker: Tracker,
}

impl<R> QueryObserverResult<R> {
    /// A result with nothing fetched yet.
    pub(crate) fn pending(tracker: Tracker) -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            failure_count: 0,
            failure_reason: None,
            is_stale: true,
            is_placeholder_data: false,
            is_fetched_after_mount: false,
            tracker,
        }
    }

    /// See [`QueryStatus`]. Reports [`QueryStatus::Success`] while placeholder data is shown.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.tracker.track(ResultField::Status);
        self.status
    }

    /// See [`FetchStatus`].
    #[must_use]
    pub fn fetch_status(&self) -> FetchStatus {
        self.tracker.track(ResultField::FetchStatus);
        self.fetch_status
    }

    /// The data, after `select` was applied.
    #[must_use]
    pub fn data(&self) -> Option<&Arc<R>> {
        self.tracker.track(ResultField::Data);
        self.data.as_ref()
    }

    /// When the entry's data was last written.
    #[must_use]
    pub fn data_updated_at(&self) -> Option<Instant> {
        self.tracker.track(ResultField::DataUpdatedAt);
        self.data_updated_at
    }

    /// How many times the entry's data has been written.
    #[must_use]
    pub fn data_update_count(&self) -> u32 {
        self.tracker.track(ResultField::DataUpdateCount);
        self.data_update_count
    }

    /// The error of the last settled fetch.
    #[must_use]
    pub fn error(&self) -> Option<&FetchError> {
        self.tracker.track(ResultField::Error);
        self.error.as_ref()
    }

    /// When the entry last settled with an error.
    #[must_use]
    pub fn error_updated_at(&self) -> Option<Instant> {
        self.tracker.track(ResultField::ErrorUpdatedAt);
        self.error_updated_at
    }

    /// Failed attempts of the current or last fetch.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.tracker.track(ResultField::FailureCount);
        self.failure_count
    }

    /// The error of the most recent failed attempt.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&FetchError> {
        self.tracker.track(ResultField::FailureReason);
        self.failure_reason.as_ref()
    }

    /// Whether the data is stale for this observer's stale time.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.tracker.track(ResultField::IsStale);
        self.is_stale
    }

    /// Whether [`data`](Self::data) is a placeholder rather than cached data.
    #[must_use]
    pub fn is_placeholder_data(&self) -> bool {
        self.tracker.track(ResultField::IsPlaceholderData);
        self.is_placeholder_data
    }

    /// Whether the entry settled at least once since this observer subscribed.
    #[must_use]
    pub fn is_fetched_after_mount(&self) -> bool {
        self.tracker.track(ResultField::IsFetchedAfterMount);
        self.is_fetched_after_mount
    }

    /// No data and no error yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    /// Data is available.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    /// The last fetch failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    /// A fetch is running.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.fetch_status() == FetchStatus::Fetching
    }

    /// A fetch is waiting for connectivity.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.fetch_status() == FetchStatus::Paused
    }

    /// The first fetch is running.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// A fetch is running for an entry that already settled.
    #[must_use]
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    /// The entry failed before it ever held fetched data.
    #[must_use]
    pub fn is_loading_error(&self) -> bool {
        self.is_error() && self.data_update_count() == 0
    }

    /// The entry failed after it had held fetched data.
    #[must_use]
    pub fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data_update_count() > 0
    }

    /// Fields whose values differ between `self` and `other`. Does not track reads.
    pub(crate) fn changed_fields(&self, other: &Self) -> FieldSet {
        let checks = [
            (ResultField::Status, self.status != other.status),
            (ResultField::FetchStatus, self.fetch_status != other.fetch_status),
            (ResultField::Data, !same_arc(self.data.as_ref(), other.data.as_ref())),
            (ResultField::DataUpdatedAt, self.data_updated_at != other.data_updated_at),
            (ResultField::DataUpdateCount, self.data_update_count != other.data_update_count),
            (ResultField::Error, !same_error(self.error.as_ref(), other.error.as_ref())),
            (ResultField::ErrorUpdatedAt, self.error_updated_at != other.error_updated_at),
            (ResultField::FailureCount, self.failure_count != other.failure_count),
            (
                ResultField::FailureReason,
                !same_error(self.failure_reason.as_ref(), other.failure_reason.as_ref()),
            ),
            (ResultField::IsStale, self.is_stale != other.is_stale),
            (ResultField::IsPlaceholderData, self.is_placeholder_data != other.is_placeholder_data),
            (
                ResultField::IsFetchedAfterMount,
                self.is_fetched_after_mount != other.is_fetched_after_mount,
            ),
        ];

        checks
            .into_iter()
            .filter_map(|(field, changed)| changed.then_some(field))
            .collect()
    }
}

fn same_arc<R>(a: Option<&Arc<R>>, b: Option<&Arc<R>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_error(a: Option<&FetchError>, b: Option<&FetchError>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

impl<R> Clone for QueryObserverResult<R> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            data_updated_at: self.data_updated_at,
            data_update_count: self.data_update_count,
            error: self.error.clone(),
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_stale: self.is_stale,
            is_placeholder_data: self.is_placeholder_data,
            is_fetched_after_mount: self.is_fetched_after_mount,
            tracker: self.tracker.clone(),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for QueryObserverResult<R> {
    // Reads fields directly so that formatting does not count as tracked access.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("failure_count", &self.failure_count)
            .field("is_stale", &self.is_stale)
            .field("is_placeholder_data", &self.is_placeholder_data)
            .finish_non_exhaustive()
    }
}
