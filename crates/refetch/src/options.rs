// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layered configuration.
//!
//! Settings are resolved from four layers, the most specific winning:
//!
//! 1. [`QueryDefaults`], fixed when the [`QueryClient`](crate::QueryClient) is built.
//! 2. Per key prefix defaults registered with
//!    [`QueryClient::set_query_defaults`](crate::QueryClient::set_query_defaults).
//! 3. The [`QueryOptions`] passed to an operation.
//! 4. The [`ObserverOptions`] of an observer, for observer-level behavior.
//!
//! Entry-level settings are merged when an entry is created and again whenever an
//! observer or fetch supplies new options for it.

use std::{fmt, sync::Arc, time::Duration};

use futures::{FutureExt, TryFutureExt, future::BoxFuture};
use serde::{Deserialize, Deserializer};
use tokio::time::Instant;

use crate::{
    error::{FetchError, KeyError},
    key::{IntoQueryKey, QueryKey},
    query::QueryContext,
    result::FieldSet,
    retry::{RetryDelay, RetryPolicy},
};

/// The default time an unused entry is kept before it is collected.
pub(crate) const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

pub(crate) type Fetcher<T> = Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// When fetches are allowed to run with respect to connectivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Fetches only run while online; they pause while offline.
    #[default]
    Online,

    /// Fetches always run, regardless of connectivity.
    Always,

    /// The first attempt always runs; retries pause while offline.
    OfflineFirst,
}

/// Whether an event triggers a refetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchTrigger {
    /// Never refetch on this event.
    Never,

    /// Refetch if the data is stale.
    #[default]
    IfStale,

    /// Always refetch, even if the data is fresh.
    Always,
}

/// Client-wide defaults.
///
/// Can be deserialized from host configuration. Durations are given in milliseconds
/// and `null` means "never":
///
/// ```
/// use std::time::Duration;
/// use refetch::QueryDefaults;
///
/// let defaults: QueryDefaults = serde_json::from_str(
///     r#"{ "stale_time_ms": 30000, "gc_time_ms": null, "retry": false }"#,
/// )?;
///
/// assert_eq!(defaults.stale_time, Duration::from_secs(30));
/// assert_eq!(defaults.gc_time, Duration::MAX);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct QueryDefaults {
    /// How long data stays fresh after it was written. Default: zero.
    #[serde(rename = "stale_time_ms", deserialize_with = "millis")]
    pub stale_time: Duration,

    /// How long an entry without observers is kept. Default: five minutes.
    #[serde(rename = "gc_time_ms", deserialize_with = "millis")]
    pub gc_time: Duration,

    /// Retry policy for failed fetches. Default: three retries.
    ///
    /// Deserializes from a number of retries or a boolean.
    #[serde(deserialize_with = "retry_policy")]
    pub retry: RetryPolicy,

    /// Delay between retries. Default: exponential from one second, capped at thirty.
    #[serde(skip)]
    pub retry_delay: RetryDelay,

    /// See [`NetworkMode`]. Default: [`NetworkMode::Online`].
    pub network_mode: NetworkMode,

    /// Refetch behavior when an observer subscribes.
    pub refetch_on_mount: RefetchTrigger,

    /// Refetch behavior when the host regains focus.
    pub refetch_on_window_focus: RefetchTrigger,

    /// Refetch behavior when the host reconnects.
    pub refetch_on_reconnect: RefetchTrigger,

    /// Whether an observer subscribing to an entry in error state fetches again.
    pub retry_on_mount: bool,

    /// Whether a refetch yielding an equal value keeps the cached allocation.
    pub structural_sharing: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: DEFAULT_GC_TIME,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            refetch_on_mount: RefetchTrigger::default(),
            refetch_on_window_focus: RefetchTrigger::default(),
            refetch_on_reconnect: RefetchTrigger::default(),
            retry_on_mount: true,
            structural_sharing: true,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map_or(Duration::MAX, Duration::from_millis))
}

fn retry_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RetryPolicy, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Enabled(bool),
        Retries(u32),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Enabled(true) => RetryPolicy::Forever,
        Raw::Enabled(false) => RetryPolicy::Never,
        Raw::Retries(n) => RetryPolicy::Retries(n),
    })
}

/// Per-query options: the key, the fetcher, and entry-level overrides.
///
/// Unset fields fall back to key prefix defaults and then to [`QueryDefaults`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use refetch::{FetchError, QueryOptions, RetryPolicy};
///
/// let options = QueryOptions::new(["todos"])
///     .fetcher(|_ctx| async { Ok::<_, FetchError>(vec!["write docs".to_string()]) })
///     .stale_time(Duration::from_secs(30))
///     .retry(RetryPolicy::Never);
/// # let _ = options;
/// ```
pub struct QueryOptions<T> {
    pub(crate) key: Result<QueryKey, KeyError>,
    pub(crate) fetcher: Option<Fetcher<T>>,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) gc_time: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) retry_delay: Option<RetryDelay>,
    pub(crate) network_mode: Option<NetworkMode>,
    pub(crate) structural_sharing: Option<bool>,
    pub(crate) initial_data: Option<Arc<T>>,
    pub(crate) initial_data_updated_at: Option<Instant>,
}

impl<T> QueryOptions<T> {
    /// Creates options for the given key.
    ///
    /// An invalid key is reported by the operation the options are passed to.
    pub fn new(key: impl IntoQueryKey) -> Self {
        Self {
            key: key.into_query_key(),
            fetcher: None,
            stale_time: None,
            gc_time: None,
            retry: None,
            retry_delay: None,
            network_mode: None,
            structural_sharing: None,
            initial_data: None,
            initial_data_updated_at: None,
        }
    }

    /// Sets the async function that produces the data.
    ///
    /// The fetcher receives a [`QueryContext`] carrying the key and a cancellation
    /// signal. Any error type convertible into [`FetchError`] may be returned.
    #[must_use]
    pub fn fetcher<F, Fut, E>(mut self, fetcher: F) -> Self
    where
        F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
        T: Send + 'static,
    {
        self.fetcher = Some(Arc::new(move |ctx| fetcher(ctx).map_err(Into::into).boxed()));
        self
    }

    /// Sets how long data stays fresh.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets how long the entry is kept without observers. [`Duration::MAX`] keeps it forever.
    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the delay between retries.
    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Sets the network mode.
    #[must_use]
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    /// Enables or disables structural sharing.
    #[must_use]
    pub fn structural_sharing(mut self, enabled: bool) -> Self {
        self.structural_sharing = Some(enabled);
        self
    }

    /// Seeds a newly created entry with data, as if it had been fetched.
    ///
    /// Ignored when the entry already exists.
    #[must_use]
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(Arc::new(data));
        self
    }

    /// Sets when the initial data was produced. Defaults to the entry's creation time.
    #[must_use]
    pub fn initial_data_updated_at(mut self, at: Instant) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }

    /// Returns the key, or the error that made it invalid.
    ///
    /// # Errors
    ///
    /// Returns the [`KeyError`] produced when the options were created.
    pub fn key(&self) -> Result<&QueryKey, KeyError> {
        self.key.as_ref().map_err(Clone::clone)
    }

    /// Fills every unset field from `fallback`, keeping this key.
    #[must_use]
    pub(crate) fn or(self, fallback: &Self) -> Self {
        Self {
            key: self.key,
            fetcher: self.fetcher.or_else(|| fallback.fetcher.clone()),
            stale_time: self.stale_time.or(fallback.stale_time),
            gc_time: self.gc_time.or(fallback.gc_time),
            retry: self.retry.or_else(|| fallback.retry.clone()),
            retry_delay: self.retry_delay.or_else(|| fallback.retry_delay.clone()),
            network_mode: self.network_mode.or(fallback.network_mode),
            structural_sharing: self.structural_sharing.or(fallback.structural_sharing),
            initial_data: self.initial_data.or_else(|| fallback.initial_data.clone()),
            initial_data_updated_at: self.initial_data_updated_at.or(fallback.initial_data_updated_at),
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: self.fetcher.clone(),
            stale_time: self.stale_time,
            gc_time: self.gc_time,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            network_mode: self.network_mode,
            structural_sharing: self.structural_sharing,
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("has_fetcher", &self.fetcher.is_some())
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("structural_sharing", &self.structural_sharing)
            .field("has_initial_data", &self.initial_data.is_some())
            .finish()
    }
}

/// Entry-level settings with every layer applied.
pub(crate) struct QueryConfig<T> {
    pub fetcher: Option<Fetcher<T>>,
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub structural_sharing: bool,
    pub initial_data: Option<(Arc<T>, Instant)>,
}

impl<T> QueryConfig<T> {
    pub fn resolve(options: &QueryOptions<T>, defaults: &QueryDefaults) -> Self {
        Self {
            fetcher: options.fetcher.clone(),
            stale_time: options.stale_time.unwrap_or(defaults.stale_time),
            gc_time: options.gc_time.unwrap_or(defaults.gc_time),
            retry: options.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: options.retry_delay.clone().unwrap_or_else(|| defaults.retry_delay.clone()),
            network_mode: options.network_mode.unwrap_or(defaults.network_mode),
            structural_sharing: options.structural_sharing.unwrap_or(defaults.structural_sharing),
            initial_data: options
                .initial_data
                .clone()
                .map(|data| (data, options.initial_data_updated_at.unwrap_or_else(Instant::now))),
        }
    }

    /// Applies newer options to an existing entry.
    ///
    /// A missing fetcher does not clear the current one, and the collection grace
    /// period only ever grows.
    pub fn update(&mut self, newer: Self) {
        if newer.fetcher.is_some() {
            self.fetcher = newer.fetcher;
        }
        self.stale_time = newer.stale_time;
        self.gc_time = self.gc_time.max(newer.gc_time);
        self.retry = newer.retry;
        self.retry_delay = newer.retry_delay;
        self.network_mode = newer.network_mode;
        self.structural_sharing = newer.structural_sharing;
    }
}

impl<T> Clone for QueryConfig<T> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            stale_time: self.stale_time,
            gc_time: self.gc_time,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            network_mode: self.network_mode,
            structural_sharing: self.structural_sharing,
            initial_data: self.initial_data.clone(),
        }
    }
}

/// Options for a single call to [`Query::fetch`](crate::Query::fetch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct FetchOptions {
    /// If a fetch is already in flight and the entry has data, cancel it and start a
    /// new one instead of joining it.
    pub cancel_refetch: bool,
}

impl FetchOptions {
    /// Options that supersede an in-flight fetch.
    #[must_use]
    pub fn cancel_refetch() -> Self {
        Self { cancel_refetch: true }
    }
}

/// Data an observer shows while its entry has none.
pub enum Placeholder<T> {
    /// A fixed placeholder value. It is passed through the observer's `select`.
    Value(Arc<T>),

    /// The data the observer showed before it was rebound to a new key.
    KeepPrevious,
}

impl<T> Clone for Placeholder<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(data) => Self::Value(Arc::clone(data)),
            Self::KeepPrevious => Self::KeepPrevious,
        }
    }
}

impl<T> fmt::Debug for Placeholder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => write!(f, "Value"),
            Self::KeepPrevious => write!(f, "KeepPrevious"),
        }
    }
}

/// Which result changes notify an observer's listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotifyOnChange {
    /// Notify when a field the listeners have read changes. Until any field has been
    /// read, every change notifies.
    #[default]
    Tracked,

    /// Notify on every change of the result.
    All,

    /// Notify when one of the given fields changes.
    Fields(FieldSet),
}

pub(crate) enum Selector<T, R> {
    Identity(fn(Arc<T>) -> Arc<R>),
    Map(Arc<dyn Fn(&T) -> R + Send + Sync>),
}

impl<T, R> Selector<T, R> {
    pub fn apply(&self, data: &Arc<T>) -> Arc<R> {
        match self {
            Self::Identity(f) => f(Arc::clone(data)),
            Self::Map(f) => Arc::new(f(data)),
        }
    }
}

impl<T, R> Clone for Selector<T, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Identity(f) => Self::Identity(*f),
            Self::Map(f) => Self::Map(Arc::clone(f)),
        }
    }
}

/// Options of a [`QueryObserver`](crate::QueryObserver).
///
/// `R` is the type the observer exposes; it differs from the cached type `T` only
/// when a `select` transformation is set.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use refetch::{ObserverOptions, QueryOptions};
///
/// let options = ObserverOptions::new(QueryOptions::<Vec<String>>::new(["todos"]))
///     .refetch_interval(Duration::from_secs(60))
///     .select(|todos| todos.len());
/// # let _ = options;
/// ```
pub struct ObserverOptions<T, R = T> {
    pub(crate) query: QueryOptions<T>,
    pub(crate) enabled: bool,
    pub(crate) refetch_interval: Option<Duration>,
    pub(crate) refetch_interval_in_background: bool,
    pub(crate) refetch_on_mount: Option<RefetchTrigger>,
    pub(crate) refetch_on_window_focus: Option<RefetchTrigger>,
    pub(crate) refetch_on_reconnect: Option<RefetchTrigger>,
    pub(crate) retry_on_mount: Option<bool>,
    pub(crate) placeholder: Option<Placeholder<T>>,
    pub(crate) notify_on_change: NotifyOnChange,
    pub(crate) select: Selector<T, R>,
}

impl<T> ObserverOptions<T, T> {
    /// Creates observer options over the given query options.
    #[must_use]
    pub fn new(query: QueryOptions<T>) -> Self {
        Self {
            query,
            enabled: true,
            refetch_interval: None,
            refetch_interval_in_background: false,
            refetch_on_mount: None,
            refetch_on_window_focus: None,
            refetch_on_reconnect: None,
            retry_on_mount: None,
            placeholder: None,
            notify_on_change: NotifyOnChange::default(),
            select: Selector::Identity(std::convert::identity),
        }
    }
}

impl<T, R> ObserverOptions<T, R> {
    /// Transforms the cached data before it reaches listeners.
    ///
    /// The transformation runs once per distinct cached value, not once per
    /// notification.
    #[must_use]
    pub fn select<S>(self, select: impl Fn(&T) -> S + Send + Sync + 'static) -> ObserverOptions<T, S> {
        ObserverOptions {
            query: self.query,
            enabled: self.enabled,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            retry_on_mount: self.retry_on_mount,
            placeholder: self.placeholder,
            notify_on_change: self.notify_on_change,
            select: Selector::Map(Arc::new(select)),
        }
    }

    /// Disables automatic fetching while `false`. Manual refetches still run.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Overrides the stale time of the underlying query options.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.query.stale_time = Some(stale_time);
        self
    }

    /// Refetches on the given interval while subscribed.
    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Keeps polling while the host is not focused.
    #[must_use]
    pub fn refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = enabled;
        self
    }

    /// Sets the refetch behavior when subscribing.
    #[must_use]
    pub fn refetch_on_mount(mut self, trigger: RefetchTrigger) -> Self {
        self.refetch_on_mount = Some(trigger);
        self
    }

    /// Sets the refetch behavior on refocus.
    #[must_use]
    pub fn refetch_on_window_focus(mut self, trigger: RefetchTrigger) -> Self {
        self.refetch_on_window_focus = Some(trigger);
        self
    }

    /// Sets the refetch behavior on reconnect.
    #[must_use]
    pub fn refetch_on_reconnect(mut self, trigger: RefetchTrigger) -> Self {
        self.refetch_on_reconnect = Some(trigger);
        self
    }

    /// Sets whether subscribing to an entry in error state fetches again.
    #[must_use]
    pub fn retry_on_mount(mut self, enabled: bool) -> Self {
        self.retry_on_mount = Some(enabled);
        self
    }

    /// Sets the placeholder shown while the entry has no data.
    #[must_use]
    pub fn placeholder_data(mut self, placeholder: Placeholder<T>) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    /// Sets which result changes notify listeners.
    #[must_use]
    pub fn notify_on_change(mut self, notify: NotifyOnChange) -> Self {
        self.notify_on_change = notify;
        self
    }

    /// Returns the query options.
    #[must_use]
    pub fn query(&self) -> &QueryOptions<T> {
        &self.query
    }
}

impl<T, R> Clone for ObserverOptions<T, R> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            enabled: self.enabled,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            retry_on_mount: self.retry_on_mount,
            placeholder: self.placeholder.clone(),
            notify_on_change: self.notify_on_change,
            select: self.select.clone(),
        }
    }
}

impl<T, R> fmt::Debug for ObserverOptions<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverOptions")
            .field("query", &self.query)
            .field("enabled", &self.enabled)
            .field("refetch_interval", &self.refetch_interval)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("placeholder", &self.placeholder)
            .field("notify_on_change", &self.notify_on_change)
            .field("has_select", &matches!(self.select, Selector::Map(_)))
            .finish_non_exhaustive()
    }
}
