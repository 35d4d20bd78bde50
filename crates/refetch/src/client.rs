// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The client façade over the query cache.

use std::{fmt, marker::PhantomData, sync::Arc};

use futures::future;
use parking_lot::Mutex;
use tokio::{runtime::Handle, time::Instant};

use crate::{
    cache::{QueryCache, QueryFilters, QueryType},
    environment::Environment,
    error::KeyError,
    key::{IntoQueryKey, QueryKey},
    options::{FetchOptions, QueryConfig, QueryDefaults, QueryOptions},
    query::{FetchHandle, Query},
    runtime::{Runtime, TaskGuard},
    state::{FetchStatus, QueryData, QueryState},
};

/// Which invalidated entries [`QueryClient::invalidate_queries`] refetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchType {
    /// Entries with at least one enabled observer.
    #[default]
    Active,
    /// Entries without enabled observers.
    Inactive,
    /// Every invalidated entry.
    All,
    /// Only mark entries invalid; refetch nothing.
    None,
}

/// Builder for [`QueryClient`].
///
/// Created by [`QueryClient::builder`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use refetch::{Environment, QueryClient, QueryDefaults};
///
/// let mut defaults = QueryDefaults::default();
/// defaults.stale_time = Duration::from_secs(30);
///
/// let client = QueryClient::<String>::builder()
///     .defaults(defaults)
///     .environment(Environment::new())
///     .build();
/// # let _ = client;
/// ```
#[must_use]
pub struct QueryClientBuilder<T> {
    defaults: QueryDefaults,
    environment: Environment,
    runtime: Runtime,
    _data: PhantomData<fn() -> T>,
}

impl<T: QueryData> QueryClientBuilder<T> {
    fn new() -> Self {
        Self {
            defaults: QueryDefaults::default(),
            environment: Environment::new(),
            runtime: Runtime::default(),
            _data: PhantomData,
        }
    }

    /// Sets the client-wide defaults.
    pub fn defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets the source of connectivity and focus state.
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Spawns fetches and timers onto `handle` instead of the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Runtime::with_handle(handle);
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> QueryClient<T> {
        QueryClient {
            inner: Arc::new(ClientInner {
                cache: QueryCache::new(self.environment.clone(), self.runtime.clone()),
                defaults: self.defaults,
                key_defaults: Mutex::new(Vec::new()),
                environment: self.environment,
                runtime: self.runtime,
                mount: Mutex::new(Mount::default()),
            }),
        }
    }
}

impl<T> fmt::Debug for QueryClientBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClientBuilder")
            .field("defaults", &self.defaults)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// The entry point: a query cache together with its configuration.
///
/// Every key maps to one entry of type `T`; use an enum for caches that hold several
/// kinds of data. Clones share the same cache.
///
/// # Examples
///
/// ```
/// use refetch::{FetchError, QueryClient, QueryOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), refetch::Error> {
/// let client = QueryClient::new();
/// let options = QueryOptions::new(["greeting"]).fetcher(|_ctx| async { Ok::<_, FetchError>("hello".to_string()) });
///
/// let greeting = client.fetch_query(options)?.await?;
/// assert_eq!(greeting.as_str(), "hello");
/// assert_eq!(client.get_query_data(["greeting"]).as_deref().map(String::as_str), Some("hello"));
/// # Ok(())
/// # }
/// ```
pub struct QueryClient<T> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    cache: QueryCache<T>,
    defaults: QueryDefaults,
    key_defaults: Mutex<Vec<QueryOptions<T>>>,
    environment: Environment,
    runtime: Runtime,
    mount: Mutex<Mount>,
}

#[derive(Default)]
struct Mount {
    count: usize,
    watcher: Option<TaskGuard>,
}

impl<T: QueryData> QueryClient<T> {
    /// Creates a client with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a client.
    pub fn builder() -> QueryClientBuilder<T> {
        QueryClientBuilder::new()
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &QueryCache<T> {
        &self.inner.cache
    }

    /// The client-wide defaults.
    #[must_use]
    pub fn defaults(&self) -> &QueryDefaults {
        &self.inner.defaults
    }

    /// The environment the client reacts to.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Registers defaults for every key starting with the key of `options`.
    ///
    /// Registering the same key again replaces the earlier defaults. When several
    /// prefixes match a key, later registrations win.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid.
    pub fn set_query_defaults(&self, options: QueryOptions<T>) -> Result<(), KeyError> {
        let hash = options.key()?.hash().clone();
        let mut registered = self.inner.key_defaults.lock();
        match registered
            .iter_mut()
            .find(|o| o.key.as_ref().is_ok_and(|k| *k.hash() == hash))
        {
            Some(existing) => *existing = options,
            None => registered.push(options),
        }
        Ok(())
    }

    /// Returns the registered defaults that apply to `key`, merged.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if `key` is invalid.
    pub fn get_query_defaults(&self, key: impl IntoQueryKey) -> Result<QueryOptions<T>, KeyError> {
        let key = key.into_query_key()?;
        Ok(self.defaults_for(&key))
    }

    fn defaults_for(&self, key: &QueryKey) -> QueryOptions<T> {
        self.inner
            .key_defaults
            .lock()
            .iter()
            .filter(|o| o.key.as_ref().is_ok_and(|prefix| key.matches_prefix(prefix)))
            .fold(QueryOptions::new(key.clone()), |merged, registered| {
                QueryOptions {
                    key: Ok(key.clone()),
                    ..registered.clone()
                }
                .or(&merged)
            })
    }

    /// Finds or creates the entry for `options` and applies the merged configuration.
    pub(crate) fn build(&self, options: &QueryOptions<T>) -> Result<(Query<T>, QueryConfig<T>), KeyError> {
        let key = options.key()?.clone();
        let merged = options.clone().or(&self.defaults_for(&key));
        let config = QueryConfig::resolve(&merged, &self.inner.defaults);

        let (query, created) = self.inner.cache.find_or_create(key, config.clone());
        if !created {
            query.update_config(config.clone());
        }
        Ok((query, config))
    }

    /// Returns the entry for `options`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn build_query(&self, options: &QueryOptions<T>) -> Result<Query<T>, KeyError> {
        self.build(options).map(|(query, _)| query)
    }

    /// Returns fresh cached data, or fetches it.
    ///
    /// Data younger than the resolved `stale_time` is returned without fetching.
    /// Otherwise a fetch starts, or an in-flight one is joined, before this returns.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn fetch_query(&self, options: QueryOptions<T>) -> Result<FetchHandle<T>, KeyError> {
        let (query, config) = self.build(&options)?;
        let state = query.state();
        if let Some(data) = &state.data
            && !state.is_stale_by_time(config.stale_time, Instant::now())
        {
            return Ok(FetchHandle::ready(Arc::clone(data)));
        }

        Ok(query.fetch(FetchOptions::default()))
    }

    /// Warms the cache for `options`.
    ///
    /// Behaves like [`fetch_query`](Self::fetch_query) but never fails: errors,
    /// including an invalid key, are discarded. The fetch starts before this returns;
    /// the returned future only waits for it.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn prefetch_query(&self, options: QueryOptions<T>) -> impl Future<Output = ()> + Send + use<T> {
        let handle = self.fetch_query(options).ok();
        async move {
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }

    /// Returns cached data regardless of its age, fetching only if there is none.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn ensure_query_data(&self, options: QueryOptions<T>) -> Result<FetchHandle<T>, KeyError> {
        let (query, _) = self.build(&options)?;
        Ok(match query.data() {
            Some(data) => FetchHandle::ready(data),
            None => query.fetch(FetchOptions::default()),
        })
    }

    /// Returns the cached data for `key`. An invalid key has no data.
    #[must_use]
    pub fn get_query_data(&self, key: impl IntoQueryKey) -> Option<Arc<T>> {
        let key = key.into_query_key().ok()?;
        self.inner.cache.find(&key)?.data()
    }

    /// Returns the key and cached data of every entry matching `filters`.
    #[must_use]
    pub fn get_queries_data(&self, filters: &QueryFilters<T>) -> Vec<(QueryKey, Option<Arc<T>>)> {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .map(|q| (q.key().clone(), q.data()))
            .collect()
    }

    /// Returns a snapshot of the state of the entry for `key`.
    #[must_use]
    pub fn get_query_state(&self, key: impl IntoQueryKey) -> Option<QueryState<T>> {
        let key = key.into_query_key().ok()?;
        self.inner.cache.find(&key).map(|q| q.state())
    }

    /// Writes data for `key`, creating the entry if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if `key` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn set_query_data(&self, key: impl IntoQueryKey, data: T) -> Result<Arc<T>, KeyError> {
        let key = key.into_query_key()?;
        let query = match self.inner.cache.find(&key) {
            Some(query) => query,
            None => self.build_query(&QueryOptions::new(key))?,
        };
        Ok(query.set_data(data))
    }

    /// Writes the value `updater` derives from the current data.
    ///
    /// Returning `None` from `updater` leaves the cache untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if `key` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn update_query_data(
        &self,
        key: impl IntoQueryKey,
        updater: impl FnOnce(Option<&T>) -> Option<T>,
    ) -> Result<Option<Arc<T>>, KeyError> {
        let key = key.into_query_key()?;
        let current = self.get_query_data(&key);
        let Some(next) = updater(current.as_deref()) else {
            return Ok(None);
        };
        self.set_query_data(key, next).map(Some)
    }

    /// Applies `updater` to every entry matching `filters`.
    ///
    /// Returns each entry's key and its data afterwards.
    pub fn set_queries_data(
        &self,
        filters: &QueryFilters<T>,
        updater: impl Fn(Option<&T>) -> Option<T>,
    ) -> Vec<(QueryKey, Option<Arc<T>>)> {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .map(|q| {
                let current = q.data();
                let data = match updater(current.as_deref()) {
                    Some(next) => Some(q.set_data(next)),
                    None => current,
                };
                (q.key().clone(), data)
            })
            .collect()
    }

    /// Marks every entry matching `filters` stale and refetches those selected by `refetch`.
    ///
    /// Marking and starting fetches happen before this returns; the returned future
    /// resolves once every started fetch has settled. Fetch errors are discarded.
    pub fn invalidate_queries(
        &self,
        filters: &QueryFilters<T>,
        refetch: RefetchType,
    ) -> impl Future<Output = ()> + Send + use<T> {
        for query in self.inner.cache.find_all(filters) {
            query.invalidate();
        }

        let handles = match refetch {
            RefetchType::None => Vec::new(),
            RefetchType::Active => self.refetch(&filters.with_query_type(QueryType::Active)),
            RefetchType::Inactive => self.refetch(&filters.with_query_type(QueryType::Inactive)),
            RefetchType::All => self.refetch(&filters.with_query_type(QueryType::All)),
        };
        settle_all(handles)
    }

    /// Refetches every enabled entry matching `filters`, superseding fetches in flight.
    pub fn refetch_queries(&self, filters: &QueryFilters<T>) -> impl Future<Output = ()> + Send + use<T> {
        settle_all(self.refetch(filters))
    }

    /// Resets every entry matching `filters` to its initial state and refetches the active ones.
    pub fn reset_queries(&self, filters: &QueryFilters<T>) -> impl Future<Output = ()> + Send + use<T> {
        for query in self.inner.cache.find_all(filters) {
            query.reset();
        }
        settle_all(self.refetch(&filters.with_query_type(QueryType::Active)))
    }

    fn refetch(&self, filters: &QueryFilters<T>) -> Vec<FetchHandle<T>> {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .filter(|q| !q.is_disabled())
            .map(|q| q.fetch(FetchOptions::cancel_refetch()))
            .collect()
    }

    /// Cancels the fetches of every entry matching `filters`.
    ///
    /// Returns how many fetches were cancelled.
    pub fn cancel_queries(&self, filters: &QueryFilters<T>) -> usize {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .filter(Query::cancel)
            .count()
    }

    /// Removes every entry matching `filters`, observed or not.
    ///
    /// Returns how many entries were removed.
    pub fn remove_queries(&self, filters: &QueryFilters<T>) -> usize {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .filter(|q| self.inner.cache.force_remove(q))
            .count()
    }

    /// The number of entries matching `filters` with a fetch running.
    #[must_use]
    pub fn is_fetching(&self, filters: &QueryFilters<T>) -> usize {
        self.inner
            .cache
            .find_all(filters)
            .into_iter()
            .filter(|q| q.state().fetch_status == FetchStatus::Fetching)
            .count()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Starts reacting to the environment.
    ///
    /// While mounted, regaining focus refetches stale active entries and reconnecting
    /// refetches as configured by each observer. Calls nest; each `mount` needs a
    /// matching [`unmount`](Self::unmount).
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn mount(&self) {
        let mut mount = self.inner.mount.lock();
        mount.count += 1;
        if mount.count > 1 {
            return;
        }

        let cache = self.inner.cache.clone();
        let mut focus = self.inner.environment.watch_focus();
        let mut online = self.inner.environment.watch_online();
        mount.watcher = Some(TaskGuard::new(self.inner.runtime.spawn(async move {
            loop {
                tokio::select! {
                    changed = focus.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *focus.borrow_and_update() {
                            cache.on_focus();
                        }
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *online.borrow_and_update() {
                            cache.on_online();
                        }
                    }
                }
            }
        })));
    }

    /// Stops reacting to the environment once every `mount` has been matched.
    pub fn unmount(&self) {
        let mut mount = self.inner.mount.lock();
        mount.count = mount.count.saturating_sub(1);
        if mount.count == 0 {
            mount.watcher = None;
        }
    }
}

fn settle_all<T: Send + Sync + 'static>(handles: Vec<FetchHandle<T>>) -> impl Future<Output = ()> + Send + use<T> {
    async move {
        future::join_all(handles).await;
    }
}

impl<T: QueryData> Default for QueryClient<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for QueryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("defaults", &self.inner.defaults)
            .finish_non_exhaustive()
    }
}
