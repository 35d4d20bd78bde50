// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The registry of cache entries.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    environment::Environment,
    error::KeyError,
    key::{IntoQueryKey, KeyHash, QueryKey},
    options::QueryConfig,
    query::{Query, next_observer_id},
    runtime::Runtime,
    state::{FetchStatus, QueryData},
    subscription::Subscription,
    telemetry::{self, QueryActivity},
};

type Listener<T> = Arc<dyn Fn(&QueryCacheEvent<T>) + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&Query<T>) -> bool + Send + Sync>;

/// A change in the cache, delivered to listeners registered with
/// [`QueryCache::subscribe`].
#[non_exhaustive]
pub enum QueryCacheEvent<T> {
    /// An entry was created.
    Added(Query<T>),
    /// An entry was removed or collected.
    Removed(Query<T>),
    /// The state of an entry changed.
    Updated(Query<T>),
    /// An observer subscribed to an entry.
    ObserverAdded(Query<T>),
    /// An observer unsubscribed from an entry.
    ObserverRemoved(Query<T>),
    /// An observer produced a new result and notified its listeners.
    ObserverResultsUpdated(Query<T>),
}

impl<T> QueryCacheEvent<T> {
    /// The entry the event concerns.
    #[must_use]
    pub fn query(&self) -> &Query<T> {
        match self {
            Self::Added(q)
            | Self::Removed(q)
            | Self::Updated(q)
            | Self::ObserverAdded(q)
            | Self::ObserverRemoved(q)
            | Self::ObserverResultsUpdated(q) => q,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "Added",
            Self::Removed(_) => "Removed",
            Self::Updated(_) => "Updated",
            Self::ObserverAdded(_) => "ObserverAdded",
            Self::ObserverRemoved(_) => "ObserverRemoved",
            Self::ObserverResultsUpdated(_) => "ObserverResultsUpdated",
        }
    }
}

impl<T> fmt::Debug for QueryCacheEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(self.name()).field(self.query().key()).finish()
    }
}

/// Which entries a filter selects by observer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryType {
    /// Every entry.
    #[default]
    All,
    /// Entries with at least one enabled observer.
    Active,
    /// Entries without enabled observers.
    Inactive,
}

/// Selects entries for bulk operations.
///
/// An empty filter selects every entry. Criteria combine with logical and.
///
/// # Examples
///
/// ```
/// use refetch::{QueryFilters, QueryType};
///
/// let filters = QueryFilters::<Vec<String>>::new()
///     .key(["todos"])
///     .query_type(QueryType::Active)
///     .stale(true);
/// # let _ = filters;
/// ```
pub struct QueryFilters<T> {
    key: Option<Result<QueryKey, KeyError>>,
    exact: bool,
    query_type: QueryType,
    stale: Option<bool>,
    fetch_status: Option<FetchStatus>,
    predicate: Option<Predicate<T>>,
}

impl<T> QueryFilters<T> {
    /// A filter selecting every entry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: None,
            exact: false,
            query_type: QueryType::All,
            stale: None,
            fetch_status: None,
            predicate: None,
        }
    }

    /// Selects entries whose key starts with `key`. An invalid key selects nothing.
    #[must_use]
    pub fn key(mut self, key: impl IntoQueryKey) -> Self {
        self.key = Some(key.into_query_key());
        self
    }

    /// Requires the key to match exactly rather than as a prefix.
    #[must_use]
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    /// Selects entries by observer activity.
    #[must_use]
    pub fn query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    /// Selects only stale (`true`) or only fresh (`false`) entries.
    #[must_use]
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Selects entries with the given fetch status.
    #[must_use]
    pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Selects entries for which `predicate` returns `true`.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Fn(&Query<T>) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn with_query_type(&self, query_type: QueryType) -> Self {
        Self {
            query_type,
            ..self.clone()
        }
    }
}

impl<T: QueryData> QueryFilters<T> {
    /// Returns `true` if `query` satisfies every criterion.
    #[must_use]
    pub fn matches(&self, query: &Query<T>) -> bool {
        if let Some(key) = &self.key {
            let Ok(key) = key else {
                return false;
            };
            let key_matches = if self.exact {
                query.hash() == key.hash()
            } else {
                query.key().matches_prefix(key)
            };
            if !key_matches {
                return false;
            }
        }

        let type_matches = match self.query_type {
            QueryType::All => true,
            QueryType::Active => query.is_active(),
            QueryType::Inactive => !query.is_active(),
        };

        type_matches
            && self.stale.is_none_or(|stale| query.is_stale() == stale)
            && self
                .fetch_status
                .is_none_or(|status| query.state().fetch_status == status)
            && self.predicate.as_ref().is_none_or(|p| p(query))
    }
}

impl<T> Default for QueryFilters<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for QueryFilters<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            exact: self.exact,
            query_type: self.query_type,
            stale: self.stale,
            fetch_status: self.fetch_status,
            predicate: self.predicate.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryFilters<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("query_type", &self.query_type)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// The registry mapping key hashes to entries.
///
/// Every entry is reachable through its own hash and no other. Entries are created on
/// first use and collected once they have been unobserved for their `gc_time`.
/// Clones share the same registry.
pub struct QueryCache<T> {
    shared: Arc<CacheShared<T>>,
}

pub(crate) struct CacheShared<T> {
    queries: Mutex<HashMap<KeyHash, Query<T>>>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    environment: Environment,
    runtime: Runtime,
}

impl<T: QueryData> CacheShared<T> {
    pub fn notify(&self, event: &QueryCacheEvent<T>) {
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Removes `query` if it is still registered and `condition` holds.
    pub fn remove_if(&self, query: &Query<T>, condition: impl FnOnce(&Query<T>) -> bool) -> bool {
        let mut queries = self.queries.lock();
        let registered = queries.get(query.hash()).is_some_and(|q| q.ptr_eq(query));
        if !registered || !condition(query) {
            return false;
        }
        queries.remove(query.hash());
        drop(queries);

        telemetry::record(query.hash(), QueryActivity::Removed);
        self.notify(&QueryCacheEvent::Removed(query.clone()));
        true
    }
}

impl<T: QueryData> QueryCache<T> {
    pub(crate) fn new(environment: Environment, runtime: Runtime) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                queries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                environment,
                runtime,
            }),
        }
    }

    /// Returns the entry for `key`, if it exists.
    #[must_use]
    pub fn find(&self, key: &QueryKey) -> Option<Query<T>> {
        self.shared.queries.lock().get(key.hash()).cloned()
    }

    /// Returns the entry for `key`, creating it with `config` if it does not exist.
    ///
    /// The returned flag is `true` if the entry was created by this call.
    pub(crate) fn find_or_create(&self, key: QueryKey, config: QueryConfig<T>) -> (Query<T>, bool) {
        let mut queries = self.shared.queries.lock();
        if let Some(query) = queries.get(key.hash()) {
            return (query.clone(), false);
        }

        let query = Query::new(
            key.clone(),
            config,
            Arc::downgrade(&self.shared),
            self.shared.environment.clone(),
            self.shared.runtime.clone(),
        );
        queries.insert(key.hash().clone(), query.clone());
        drop(queries);

        self.shared.notify(&QueryCacheEvent::Added(query.clone()));
        (query, true)
    }

    /// Returns every entry matching `filters`.
    #[must_use]
    pub fn find_all(&self, filters: &QueryFilters<T>) -> Vec<Query<T>> {
        self.get_all().into_iter().filter(|q| filters.matches(q)).collect()
    }

    /// Returns every entry.
    #[must_use]
    pub fn get_all(&self) -> Vec<Query<T>> {
        self.shared.queries.lock().values().cloned().collect()
    }

    /// Removes `query` unless observers remain, cancelling its in-flight fetch.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove(&self, query: &Query<T>) -> bool {
        let removed = self.shared.remove_if(query, |q| q.observer_count() == 0);
        if removed {
            query.cancel();
        }
        removed
    }

    /// Removes `query` even if it is observed, cancelling its in-flight fetch.
    ///
    /// Returns `true` if the entry was removed.
    pub fn force_remove(&self, query: &Query<T>) -> bool {
        let removed = self.shared.remove_if(query, |_| true);
        if removed {
            query.cancel();
        }
        removed
    }

    /// Removes every entry.
    pub fn clear(&self) {
        for query in self.get_all() {
            self.force_remove(&query);
        }
    }

    /// The number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queries.lock().len()
    }

    /// Returns `true` if the cache holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a listener for cache events until the subscription is dropped.
    ///
    /// Listeners run synchronously on the task that caused the event.
    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent<T>) + Send + Sync + 'static) -> Subscription {
        let id = next_observer_id();
        self.shared.listeners.lock().push((id, Arc::new(listener)));

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.listeners.lock().retain(|(i, _)| *i != id);
            }
        })
    }

    /// Tells every observer that the host regained focus.
    pub fn on_focus(&self) {
        for query in self.get_all() {
            query.on_focus();
        }
    }

    /// Tells every observer that the host reconnected.
    pub fn on_online(&self) {
        for query in self.get_all() {
            query.on_online();
        }
    }

    pub(crate) fn notify(&self, event: &QueryCacheEvent<T>) {
        self.shared.notify(event);
    }
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("len", &self.shared.queries.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::FetchError,
        options::{FetchOptions, QueryDefaults, QueryOptions},
        query::EntryObserver,
        state::QueryState,
    };

    struct Passive;

    impl EntryObserver<u32> for Passive {
        fn on_entry_change(&self, _query: &Query<u32>, _state: &QueryState<u32>) {}
    }

    fn cache() -> QueryCache<u32> {
        QueryCache::new(Environment::new(), Runtime::default())
    }

    fn create(cache: &QueryCache<u32>, options: &QueryOptions<u32>) -> Query<u32> {
        let config = QueryConfig::resolve(options, &QueryDefaults::default());
        cache.find_or_create(options.key().expect("valid key").clone(), config).0
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let cache = cache();
        let options = QueryOptions::new(serde_json::json!(["todos", {"a": 1, "b": 2}]));
        let config = || QueryConfig::resolve(&options, &QueryDefaults::default());

        let (first, created) = cache.find_or_create(options.key().expect("valid key").clone(), config());
        assert!(created);

        let same_key = QueryKey::new(serde_json::json!(["todos", {"b": 2, "a": 1}])).expect("valid key");
        let (second, created) = cache.find_or_create(same_key.clone(), config());
        assert!(!created);
        assert!(first.ptr_eq(&second));
        assert_eq!(cache.len(), 1);
        assert!(cache.find(&same_key).is_some_and(|q| q.ptr_eq(&first)));
    }

    #[tokio::test]
    async fn remove_is_a_no_op_while_observed() {
        let cache = cache();
        let query = create(&cache, &QueryOptions::new(["a"]));
        let subscription = query.subscribe_observer(Arc::new(Passive));

        assert!(!cache.remove(&query));
        assert_eq!(cache.len(), 1);

        drop(subscription);
        assert!(cache.remove(&query));
        assert!(cache.is_empty());
        assert!(!cache.remove(&query), "already removed");
    }

    #[tokio::test(start_paused = true)]
    async fn force_remove_cancels_fetch() {
        let cache = cache();
        let query = create(
            &cache,
            &QueryOptions::new(["slow"]).fetcher(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, FetchError>(1)
            }),
        );
        let _subscription = query.subscribe_observer(Arc::new(Passive));
        let handle = query.fetch(FetchOptions::default());

        assert!(cache.force_remove(&query));
        assert!(handle.await.expect_err("cancelled").is_cancelled());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let cache = cache();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let subscription = cache.subscribe(move |event| log.lock().push(format!("{event:?}")));

        let query = create(&cache, &QueryOptions::new(["a"]));
        let observer = query.subscribe_observer(Arc::new(Passive));
        query.set_data(1);
        drop(observer);
        cache.force_remove(&query);

        drop(subscription);
        query.set_data(2);

        assert_eq!(
            events.lock().clone(),
            [
                r#"Added(QueryKey(["a"]))"#,
                r#"ObserverAdded(QueryKey(["a"]))"#,
                r#"Updated(QueryKey(["a"]))"#,
                r#"ObserverRemoved(QueryKey(["a"]))"#,
                r#"Removed(QueryKey(["a"]))"#,
            ]
        );
    }

    #[tokio::test]
    async fn filters_select_by_key_and_activity() {
        let cache = cache();
        let todos = create(&cache, &QueryOptions::new(serde_json::json!(["todos", 1])));
        let _other = create(&cache, &QueryOptions::new(["users"]));
        let _active = todos.subscribe_observer(Arc::new(Passive));

        let by_prefix = cache.find_all(&QueryFilters::new().key(["todos"]));
        assert_eq!(by_prefix.len(), 1);
        assert!(by_prefix[0].ptr_eq(&todos));

        assert!(cache.find_all(&QueryFilters::new().key(["todos"]).exact(true)).is_empty());
        assert_eq!(cache.find_all(&QueryFilters::new().query_type(QueryType::Active)).len(), 1);
        assert_eq!(cache.find_all(&QueryFilters::new().query_type(QueryType::Inactive)).len(), 1);
        assert_eq!(cache.find_all(&QueryFilters::new()).len(), 2);
        assert_eq!(
            cache
                .find_all(&QueryFilters::new().predicate(|q: &Query<u32>| q.key().segments().len() == 2))
                .len(),
            1
        );
        assert!(
            cache
                .find_all(&QueryFilters::new().key(serde_json::json!("not an array")))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn filters_select_by_staleness_and_fetch_status() {
        let cache = cache();
        let fresh = create(&cache, &QueryOptions::new(["fresh"]).stale_time(Duration::from_secs(60)));
        fresh.set_data(1);
        let _stale = create(&cache, &QueryOptions::new(["stale"]));

        let fresh_only = cache.find_all(&QueryFilters::new().stale(false));
        assert_eq!(fresh_only.len(), 1);
        assert!(fresh_only[0].ptr_eq(&fresh));
        assert_eq!(cache.find_all(&QueryFilters::new().fetch_status(FetchStatus::Idle)).len(), 2);
        assert!(cache.find_all(&QueryFilters::new().fetch_status(FetchStatus::Fetching)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unobserved_entries_are_collected_after_gc_time() {
        let cache = cache();
        let query = create(&cache, &QueryOptions::new(["gc"]).gc_time(Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(cache.len(), 1);

        let subscription = query.subscribe_observer(Arc::new(Passive));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cache.len(), 1, "an observed entry is never collected");

        drop(subscription);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.is_empty());
    }
}
