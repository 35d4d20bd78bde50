// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Binding of one consumer to one cache entry.
//!
//! A [`QueryObserver`] derives a [`QueryObserverResult`] from its entry, applies the
//! optional `select` transformation, and only notifies its listeners when a field they
//! care about changed. While it has listeners it is subscribed to the entry, refetches
//! stale data on mount, refocus and reconnect, and runs its staleness and polling
//! timers. Dropping the last listener unsubscribes it from the entry without touching
//! an in-flight fetch.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::{
    cache::QueryCacheEvent,
    client::QueryClient,
    error::KeyError,
    options::{FetchOptions, NotifyOnChange, ObserverOptions, Placeholder, QueryDefaults, RefetchTrigger},
    query::{EntryObserver, FetchHandle, Query, next_observer_id},
    result::{FieldSet, QueryObserverResult, Tracker},
    runtime::TaskGuard,
    state::{QueryData, QueryState, QueryStatus},
    subscription::Subscription,
};

type Listener<R> = Arc<dyn Fn(&QueryObserverResult<R>) + Send + Sync>;

/// Observes one cache entry on behalf of a consumer.
///
/// `T` is the cached type and `R` the type listeners see, which differs from `T` only
/// when [`ObserverOptions::select`] is used. Clones share the same observer.
///
/// # Examples
///
/// ```
/// use refetch::{FetchError, ObserverOptions, QueryClient, QueryObserver, QueryOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), refetch::Error> {
/// let client = QueryClient::<Vec<String>>::new();
/// let options = QueryOptions::new(["todos"])
///     .fetcher(|_ctx| async { Ok::<_, FetchError>(vec!["write docs".to_string()]) });
///
/// let observer = QueryObserver::new(&client, ObserverOptions::new(options).select(|todos| todos.len()))?;
/// let _subscription = observer.subscribe(|result| {
///     if let Some(count) = result.data() {
///         println!("{count} todos");
///     }
/// });
///
/// observer.refetch().await?;
/// assert_eq!(observer.current_result().data().map(|n| **n), Some(1));
/// # Ok(())
/// # }
/// ```
pub struct QueryObserver<T, R = T> {
    inner: Arc<ObserverInner<T, R>>,
}

struct ObserverInner<T, R> {
    id: u64,
    client: QueryClient<T>,
    this: Weak<Self>,
    tracker: Tracker,
    listeners: Mutex<Vec<(u64, Listener<R>)>>,
    state: Mutex<ObserverState<T, R>>,
}

struct ObserverState<T, R> {
    options: ObserverOptions<T, R>,
    stale_time: Duration,
    query: Query<T>,
    result: QueryObserverResult<R>,
    revision: u64,
    mounted: bool,
    mount_counts: (u32, u32),
    selected: Option<(Arc<T>, Arc<R>)>,
    placeholder: Option<(Arc<T>, Arc<R>)>,
    previous_data: Option<Arc<R>>,
    stale_timer: Option<TaskGuard>,
    interval_timer: Option<TaskGuard>,
}

impl<T, R> ObserverState<T, R> {
    fn select(&mut self, data: &Arc<T>) -> Arc<R> {
        if let Some((source, selected)) = &self.selected
            && Arc::ptr_eq(source, data)
        {
            return Arc::clone(selected);
        }

        let selected = self.options.select.apply(data);
        self.selected = Some((Arc::clone(data), Arc::clone(&selected)));
        selected
    }

    fn placeholder_data(&mut self) -> Option<Arc<R>> {
        match self.options.placeholder.clone()? {
            Placeholder::KeepPrevious => self.previous_data.clone(),
            Placeholder::Value(value) => {
                if let Some((source, selected)) = &self.placeholder
                    && Arc::ptr_eq(source, &value)
                {
                    return Some(Arc::clone(selected));
                }

                let selected = self.options.select.apply(&value);
                self.placeholder = Some((value, Arc::clone(&selected)));
                Some(selected)
            }
        }
    }

    fn build_result(&mut self, state: &QueryState<T>, tracker: &Tracker) -> QueryObserverResult<R> {
        let mut status = state.status;
        let mut is_placeholder_data = false;
        let mut data = state.data.as_ref().map(|data| self.select(data));

        if data.is_none()
            && state.status == QueryStatus::Pending
            && let Some(placeholder) = self.placeholder_data()
        {
            data = Some(placeholder);
            status = QueryStatus::Success;
            is_placeholder_data = true;
        }

        QueryObserverResult {
            status,
            fetch_status: state.fetch_status,
            data,
            data_updated_at: state.data_updated_at,
            data_update_count: state.data_update_count,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_stale: state.is_stale_by_time(self.stale_time, Instant::now()),
            is_placeholder_data,
            is_fetched_after_mount: state.data_update_count > self.mount_counts.0
                || state.error_update_count > self.mount_counts.1,
            tracker: tracker.clone(),
        }
    }

    fn mark_mounted(&mut self, state: &QueryState<T>) {
        self.mounted = true;
        self.mount_counts = (state.data_update_count, state.error_update_count);
    }

    fn trigger(&self, pick: fn(&ObserverOptions<T, R>) -> Option<RefetchTrigger>, fallback: RefetchTrigger) -> RefetchTrigger {
        pick(&self.options).unwrap_or(fallback)
    }
}

fn should_fetch_on<T>(enabled: bool, trigger: RefetchTrigger, state: &QueryState<T>, stale_time: Duration) -> bool {
    enabled
        && match trigger {
            RefetchTrigger::Never => false,
            RefetchTrigger::Always => true,
            RefetchTrigger::IfStale => state.is_stale_by_time(stale_time, Instant::now()),
        }
}

fn should_notify(mode: NotifyOnChange, changed: FieldSet, tracker: &Tracker) -> bool {
    if changed.is_empty() {
        return false;
    }

    match mode {
        NotifyOnChange::All => true,
        NotifyOnChange::Fields(fields) => changed.intersects(fields),
        NotifyOnChange::Tracked => {
            let read = tracker.fields();
            read.is_empty() || changed.intersects(read)
        }
    }
}

impl<T: QueryData, R: Send + Sync + 'static> QueryObserver<T, R> {
    /// Creates an observer for the entry named by `options`, creating the entry if needed.
    ///
    /// The observer stays passive until its first listener subscribes.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn new(client: &QueryClient<T>, options: ObserverOptions<T, R>) -> Result<Self, KeyError> {
        let (query, config) = client.build(&options.query)?;
        let state = query.state();
        let tracker = Tracker::default();

        let mut observer_state = ObserverState {
            options,
            stale_time: config.stale_time,
            query,
            result: QueryObserverResult::pending(tracker.clone()),
            revision: state.revision(),
            mounted: false,
            mount_counts: (state.data_update_count, state.error_update_count),
            selected: None,
            placeholder: None,
            previous_data: None,
            stale_timer: None,
            interval_timer: None,
        };
        observer_state.result = observer_state.build_result(&state, &tracker);

        let inner = Arc::new_cyclic(|this| ObserverInner {
            id: next_observer_id(),
            client: client.clone(),
            this: Weak::clone(this),
            tracker,
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(observer_state),
        });

        Ok(Self { inner })
    }

    /// Registers a listener and calls it once with the current result.
    ///
    /// The first listener subscribes the observer to its entry, which may start a
    /// fetch if the data is missing or stale. Dropping the returned subscription
    /// unregisters the listener; dropping the last one unsubscribes from the entry.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn subscribe(&self, listener: impl Fn(&QueryObserverResult<R>) + Send + Sync + 'static) -> Subscription {
        let id = next_observer_id();
        let listener: Listener<R> = Arc::new(listener);
        let first = {
            let mut listeners = self.inner.listeners.lock();
            listeners.push((id, Arc::clone(&listener)));
            listeners.len() == 1
        };

        if first {
            self.inner.mount();
        }

        let result = self.inner.state.lock().result.clone();
        listener(&result);

        if first {
            self.inner.fetch_on_mount();
            self.inner.schedule_interval();
        }

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_listener(id);
            }
        })
    }

    /// The latest result.
    ///
    /// While the observer has no listeners the result is recomputed from the entry.
    #[must_use]
    pub fn current_result(&self) -> QueryObserverResult<R> {
        let mut st = self.inner.state.lock();
        if !st.mounted {
            let state = st.query.state();
            st.revision = state.revision();
            let result = st.build_result(&state, &self.inner.tracker);
            st.result = result;
        }
        st.result.clone()
    }

    /// The entry this observer is bound to.
    #[must_use]
    pub fn query(&self) -> Query<T> {
        self.inner.state.lock().query.clone()
    }

    /// Fetches the entry now, superseding a fetch in flight.
    ///
    /// Runs even when the observer is disabled.
    pub fn refetch(&self) -> FetchHandle<T> {
        self.query().fetch(FetchOptions::cancel_refetch())
    }

    /// Replaces the options, rebinding to another entry if the key changed.
    ///
    /// A rebind always notifies listeners. If the observer has listeners, the new
    /// entry is fetched when its data is missing or stale.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key in `options` is invalid. The observer keeps
    /// its previous options in that case.
    pub fn set_options(&self, options: ObserverOptions<T, R>) -> Result<(), KeyError> {
        let (query, config) = self.inner.client.build(&options.query)?;

        let mut st = self.inner.state.lock();
        let previous = std::mem::replace(&mut st.query, query.clone());
        let rebound = !previous.ptr_eq(&query);
        let became_enabled = options.enabled && !st.options.enabled;
        let stale_time_changed = config.stale_time != st.stale_time;

        st.options = options;
        st.stale_time = config.stale_time;
        st.selected = None;
        st.placeholder = None;
        if rebound {
            if !st.result.is_placeholder_data {
                st.previous_data = st.result.data.clone();
            }
            st.revision = 0;
            let state = query.state();
            st.mount_counts = (state.data_update_count, state.error_update_count);
        }
        let mounted = st.mounted;
        drop(st);

        if mounted && rebound {
            previous.remove_observer(self.inner.id);
            if let Some(me) = self.inner.entry_observer() {
                query.add_observer(self.inner.id, me);
            }
        }

        self.inner.update_result(rebound);

        if mounted {
            if rebound {
                self.inner.fetch_on_mount();
            } else if became_enabled || stale_time_changed {
                self.inner.fetch_if_stale();
            }
            self.inner.schedule_interval();
        }

        Ok(())
    }

    /// Returns `true` if at least one listener is registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.lock().is_empty()
    }

    /// Unregisters every listener and unsubscribes from the entry.
    pub fn destroy(&self) {
        self.inner.listeners.lock().clear();
        self.inner.unmount();
    }
}

impl<T: QueryData, R: Send + Sync + 'static> ObserverInner<T, R> {
    fn entry_observer(&self) -> Option<Arc<dyn EntryObserver<T>>> {
        self.this.upgrade().map(|me| me as Arc<dyn EntryObserver<T>>)
    }

    fn defaults(&self) -> &QueryDefaults {
        self.client.defaults()
    }

    fn mount(&self) {
        let query = {
            let mut st = self.state.lock();
            let state = st.query.state();
            st.mark_mounted(&state);
            st.query.clone()
        };

        if let Some(me) = self.entry_observer() {
            query.add_observer(self.id, me);
        }

        let mut st = self.state.lock();
        let state = st.query.state();
        st.revision = state.revision();
        let result = st.build_result(&state, &self.tracker);
        st.result = result;
        self.schedule_stale_timer(&mut st, &state);
    }

    fn unmount(&self) {
        let query = {
            let mut st = self.state.lock();
            if !st.mounted {
                return;
            }
            st.mounted = false;
            st.stale_timer = None;
            st.interval_timer = None;
            st.query.clone()
        };

        query.remove_observer(self.id);
    }

    fn remove_listener(&self, id: u64) {
        let now_empty = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(i, _)| *i != id);
            listeners.len() < before && listeners.is_empty()
        };

        if now_empty {
            self.unmount();
        }
    }

    fn fetch_on_mount(&self) {
        let (query, fetch) = {
            let st = self.state.lock();
            let state = st.query.state();
            let enabled = st.options.enabled;
            let retry_on_mount = st.options.retry_on_mount.unwrap_or(self.defaults().retry_on_mount);

            let load = enabled && state.data.is_none() && !(state.status == QueryStatus::Error && !retry_on_mount);
            let trigger = st.trigger(|o| o.refetch_on_mount, self.defaults().refetch_on_mount);
            let refetch = state.data.is_some() && should_fetch_on(enabled, trigger, &state, st.stale_time);
            (st.query.clone(), load || refetch)
        };

        if fetch {
            drop(query.fetch(FetchOptions::default()));
        }
    }

    fn fetch_if_stale(&self) {
        let (query, fetch) = {
            let st = self.state.lock();
            let state = st.query.state();
            (
                st.query.clone(),
                should_fetch_on(st.options.enabled, RefetchTrigger::IfStale, &state, st.stale_time),
            )
        };

        if fetch {
            drop(query.fetch(FetchOptions::default()));
        }
    }

    fn fetch_on_event(&self, query: &Query<T>, pick: fn(&ObserverOptions<T, R>) -> Option<RefetchTrigger>, fallback: RefetchTrigger) {
        let fetch = {
            let st = self.state.lock();
            if !st.mounted || !st.query.ptr_eq(query) {
                return;
            }
            should_fetch_on(st.options.enabled, st.trigger(pick, fallback), &query.state(), st.stale_time)
        };

        if fetch {
            drop(query.fetch(FetchOptions::default()));
        }
    }

    /// Recomputes the result from the entry's current state.
    fn update_result(&self, force_notify: bool) {
        let st = self.state.lock();
        let state = st.query.state();
        self.apply(st, &state, force_notify);
    }

    fn on_change(&self, query: &Query<T>, state: &QueryState<T>) {
        let st = self.state.lock();
        if !st.mounted || !st.query.ptr_eq(query) || state.revision() <= st.revision {
            return;
        }
        self.apply(st, state, false);
    }

    fn apply(&self, mut st: MutexGuard<'_, ObserverState<T, R>>, state: &QueryState<T>, force_notify: bool) {
        st.revision = state.revision();
        let result = st.build_result(state, &self.tracker);
        let changed = result.changed_fields(&st.result);
        st.result = result.clone();

        let notify = force_notify || should_notify(st.options.notify_on_change, changed, &self.tracker);
        if st.mounted {
            self.schedule_stale_timer(&mut st, state);
        }
        let query = st.query.clone();
        drop(st);

        if notify {
            let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
            for listener in &listeners {
                listener(&result);
            }
            if !listeners.is_empty() {
                self.client.cache().notify(&QueryCacheEvent::ObserverResultsUpdated(query));
            }
        }
    }

    fn schedule_stale_timer(&self, st: &mut ObserverState<T, R>, state: &QueryState<T>) {
        st.stale_timer = None;
        let Some(stale_at) = state.stale_at(st.stale_time, Instant::now()) else {
            return;
        };

        let this = Weak::clone(&self.this);
        st.stale_timer = Some(TaskGuard::new(self.client.runtime().spawn(async move {
            tokio::time::sleep_until(stale_at).await;
            if let Some(inner) = this.upgrade() {
                inner.update_result(false);
            }
        })));
    }

    fn schedule_interval(&self) {
        let mut st = self.state.lock();
        st.interval_timer = None;

        let Some(interval) = st.options.refetch_interval.filter(|i| !i.is_zero()) else {
            return;
        };
        if !st.mounted || !st.options.enabled {
            return;
        }

        let this = Weak::clone(&self.this);
        let in_background = st.options.refetch_interval_in_background;
        let environment = self.client.environment().clone();
        st.interval_timer = Some(TaskGuard::new(self.client.runtime().spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = this.upgrade() else {
                    return;
                };
                if in_background || environment.is_focused() {
                    let query = inner.state.lock().query.clone();
                    drop(query.fetch(FetchOptions::default()));
                }
            }
        })));
    }
}

impl<T: QueryData, R: Send + Sync + 'static> EntryObserver<T> for ObserverInner<T, R> {
    fn on_entry_change(&self, query: &Query<T>, state: &QueryState<T>) {
        self.on_change(query, state);
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().options.enabled
    }

    fn is_stale(&self, query: &Query<T>) -> bool {
        let stale_time = self.state.lock().stale_time;
        query.is_stale_by_time(stale_time)
    }

    fn on_focus(&self, query: &Query<T>) {
        self.fetch_on_event(query, |o| o.refetch_on_window_focus, self.defaults().refetch_on_window_focus);
    }

    fn on_online(&self, query: &Query<T>) {
        self.fetch_on_event(query, |o| o.refetch_on_reconnect, self.defaults().refetch_on_reconnect);
    }
}

impl<T, R> Clone for QueryObserver<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> fmt::Debug for QueryObserver<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("QueryObserver")
            .field("key", st.query.key())
            .field("mounted", &st.mounted)
            .field("listeners", &self.inner.listeners.lock().len())
            .finish_non_exhaustive()
    }
}
