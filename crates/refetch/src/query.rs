// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single cache entry and its fetch state machine.
//!
//! A [`Query`] owns the state of one key. At most one fetch runs per entry at a time;
//! concurrent callers share the in-flight [`FetchHandle`]. Each fetch runs as a spawned
//! task that retries with backoff, pauses while offline, and settles the entry when it
//! finishes. Every state change is delivered synchronously to the subscribed
//! [`EntryObserver`]s in subscription order, after the entry's lock is released.

use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    FutureExt,
    future::{self, BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CacheShared, QueryCacheEvent},
    environment::Environment,
    error::{Error, FetchError},
    key::{KeyHash, QueryKey},
    options::{FetchOptions, Fetcher, NetworkMode, QueryConfig},
    retry::{RetryDelay, RetryPolicy},
    runtime::{Runtime, TaskGuard},
    state::{FetchStatus, QueryData, QueryState, QueryStatus},
    subscription::Subscription,
    telemetry::{self, QueryActivity},
};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_observer_id() -> u64 {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Receives the state changes of an entry.
///
/// Implemented by [`QueryObserver`](crate::QueryObserver). Custom implementations can
/// be attached with [`Query::subscribe_observer`].
///
/// Callbacks run on the task that changed the entry, after the entry's lock has been
/// released, so they may call back into the entry.
pub trait EntryObserver<T>: Send + Sync {
    /// Called after every change of the entry's state.
    fn on_entry_change(&self, query: &Query<T>, state: &QueryState<T>);

    /// Whether this observer counts towards the entry being active.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this observer considers the entry's data stale.
    fn is_stale(&self, query: &Query<T>) -> bool {
        let state = query.state();
        state.data.is_none() || state.is_invalidated
    }

    /// Called when the host regains focus.
    fn on_focus(&self, _query: &Query<T>) {}

    /// Called when the host reconnects.
    fn on_online(&self, _query: &Query<T>) {}
}

/// The context passed to a fetcher.
#[derive(Debug, Clone)]
pub struct QueryContext {
    key: QueryKey,
    signal: CancellationToken,
    attempt: u32,
}

impl QueryContext {
    /// The key being fetched.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Cancelled when the fetch is cancelled. Fetchers should stop early once it fires;
    /// a result produced after cancellation is discarded either way.
    #[must_use]
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Zero for the first attempt, then the number of failures so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

enum FetchOutcome<T> {
    Success(Arc<T>),
    Failed(FetchError),
    Cancelled,
}

impl<T> Clone for FetchOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Success(data) => Self::Success(Arc::clone(data)),
            Self::Failed(error) => Self::Failed(error.clone()),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl<T> From<FetchOutcome<T>> for Result<Arc<T>, Error> {
    fn from(outcome: FetchOutcome<T>) -> Self {
        match outcome {
            FetchOutcome::Success(data) => Ok(data),
            FetchOutcome::Failed(error) => Err(Error::Fetch(error)),
            FetchOutcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// A shareable handle to the outcome of a fetch.
///
/// Every caller that joins a deduplicated fetch receives a clone of the same handle.
/// Awaiting it yields the fetched data, the final error, or [`Error::Cancelled`].
/// Dropping a handle does not cancel the fetch.
pub struct FetchHandle<T> {
    shared: Shared<BoxFuture<'static, FetchOutcome<T>>>,
}

impl<T: Send + Sync + 'static> FetchHandle<T> {
    fn pending(receiver: oneshot::Receiver<FetchOutcome<T>>) -> Self {
        // A dropped sender means the entry went away mid-fetch.
        Self {
            shared: receiver.map(|r| r.unwrap_or(FetchOutcome::Cancelled)).boxed().shared(),
        }
    }

    fn settled(outcome: FetchOutcome<T>) -> Self {
        Self {
            shared: future::ready(outcome).boxed().shared(),
        }
    }

    /// A handle that is already resolved with `data`.
    #[must_use]
    pub fn ready(data: Arc<T>) -> Self {
        Self::settled(FetchOutcome::Success(data))
    }

    /// Returns the outcome if the fetch has settled and the outcome has been observed
    /// by a poll of any clone of this handle.
    #[must_use]
    pub fn peek(&self) -> Option<Result<Arc<T>, Error>> {
        self.shared.peek().cloned().map(Into::into)
    }

    /// Returns `true` if both handles belong to the same fetch.
    #[must_use]
    pub fn same_fetch(&self, other: &Self) -> bool {
        self.shared.ptr_eq(&other.shared)
    }
}

impl<T> Clone for FetchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Future for FetchHandle<T> {
    type Output = Result<Arc<T>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.shared).poll(cx).map(Into::into)
    }
}

impl<T> fmt::Debug for FetchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle").finish_non_exhaustive()
    }
}

/// One cache slot: a key, its state, and the subscribed observers.
///
/// `Query` is a cheap handle; clones refer to the same entry.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

struct QueryInner<T> {
    key: QueryKey,
    cache: Weak<CacheShared<T>>,
    environment: Environment,
    runtime: Runtime,
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    state: QueryState<T>,
    config: QueryConfig<T>,
    observers: Vec<Subscriber<T>>,
    in_flight: Option<InFlight<T>>,
    gc: Option<TaskGuard>,
    next_generation: u64,
}

struct Subscriber<T> {
    id: u64,
    observer: Arc<dyn EntryObserver<T>>,
}

struct InFlight<T> {
    generation: u64,
    signal: CancellationToken,
    handle: FetchHandle<T>,
    settle: oneshot::Sender<FetchOutcome<T>>,
    revert: QueryState<T>,
}

impl<T> InFlight<T> {
    fn cancel(self) {
        self.signal.cancel();
        let _ = self.settle.send(FetchOutcome::Cancelled);
    }
}

/// A state change ready to be delivered once the lock is released.
struct Commit<T> {
    state: QueryState<T>,
    observers: Vec<Arc<dyn EntryObserver<T>>>,
}

impl<T> Slot<T> {
    fn commit(&mut self) -> Commit<T> {
        let revision = self.state.revision();
        self.state.bump_revision(revision);
        Commit {
            state: self.state.clone(),
            observers: self.observers(),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn EntryObserver<T>>> {
        self.observers.iter().map(|s| Arc::clone(&s.observer)).collect()
    }

    fn take_current(&mut self, generation: u64) -> Option<InFlight<T>> {
        if self.is_current(generation) {
            self.in_flight.take()
        } else {
            None
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.generation == generation)
    }

    fn share(&self, data: T) -> Arc<T>
    where
        T: PartialEq,
    {
        match &self.state.data {
            Some(current) if self.config.structural_sharing && **current == data => Arc::clone(current),
            _ => Arc::new(data),
        }
    }

    fn write_error(&mut self, error: FetchError, failures: u32) {
        let state = &mut self.state;
        state.status = QueryStatus::Error;
        state.data = None;
        state.error = Some(error.clone());
        state.error_updated_at = Some(Instant::now());
        state.error_update_count += 1;
        state.fetch_failure_count = failures;
        state.fetch_failure_reason = Some(error);
        state.fetch_status = FetchStatus::Idle;
    }
}

fn must_pause(mode: NetworkMode, online: bool, failures: u32) -> bool {
    match mode {
        NetworkMode::Online => !online,
        NetworkMode::Always => false,
        NetworkMode::OfflineFirst => failures > 0 && !online,
    }
}

impl<T> Query<T> {
    /// The key of this entry.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// The canonical hash of the key.
    #[must_use]
    pub fn hash(&self) -> &KeyHash {
        self.inner.key.hash()
    }

    /// A snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.inner.slot.lock().state.clone()
    }

    /// The cached data, if any.
    #[must_use]
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.slot.lock().state.data.clone()
    }

    /// Returns `true` if the data is missing, invalidated or older than `stale_time`.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        self.inner.slot.lock().state.is_stale_by_time(stale_time, Instant::now())
    }

    /// The number of subscribed observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.slot.lock().observers.len()
    }

    /// Returns `true` if both handles refer to the same entry.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: QueryData> Query<T> {
    /// Creates an entry and schedules its collection. Observers cancel the schedule.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub(crate) fn new(
        key: QueryKey,
        config: QueryConfig<T>,
        cache: Weak<CacheShared<T>>,
        environment: Environment,
        runtime: Runtime,
    ) -> Self {
        let state = QueryState::new(config.initial_data.clone());
        let query = Self {
            inner: Arc::new(QueryInner {
                key,
                cache,
                environment,
                runtime,
                slot: Mutex::new(Slot {
                    state,
                    config,
                    observers: Vec::new(),
                    in_flight: None,
                    gc: None,
                    next_generation: 0,
                }),
            }),
        };

        query.schedule_gc(&mut query.inner.slot.lock());
        telemetry::record(query.hash(), QueryActivity::Created);
        query
    }

    /// Starts a fetch, or joins the one in flight.
    ///
    /// With [`FetchOptions::cancel_refetch`] and data present, an in-flight fetch is
    /// cancelled and replaced. Without a fetcher the entry settles with an error.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub fn fetch(&self, options: FetchOptions) -> FetchHandle<T> {
        let mut slot = self.inner.slot.lock();

        let mut superseded = None;
        if let Some(in_flight) = &slot.in_flight {
            if options.cancel_refetch && slot.state.data.is_some() {
                superseded = slot.in_flight.take();
            } else {
                let handle = in_flight.handle.clone();
                drop(slot);
                telemetry::record(self.hash(), QueryActivity::FetchDeduplicated);
                return handle;
            }
        }

        let Some(fetcher) = slot.config.fetcher.clone() else {
            let error = FetchError::msg(format!("no fetcher configured for query {}", self.key()));
            slot.write_error(error.clone(), 1);
            let commit = slot.commit();
            drop(slot);

            if let Some(old) = superseded {
                old.cancel();
            }
            telemetry::record_attempt(self.hash(), QueryActivity::FetchFailed, 1);
            self.dispatch(commit);
            return FetchHandle::settled(FetchOutcome::Failed(error));
        };

        let generation = slot.next_generation;
        slot.next_generation += 1;

        let revert = superseded.as_ref().map_or_else(|| slot.state.clone(), |old| old.revert.clone());
        let paused = must_pause(slot.config.network_mode, self.inner.environment.is_online(), 0);
        slot.state.fetch_status = if paused { FetchStatus::Paused } else { FetchStatus::Fetching };
        slot.state.fetch_failure_count = 0;
        slot.state.fetch_failure_reason = None;

        let signal = CancellationToken::new();
        let (settle, receiver) = oneshot::channel();
        let handle = FetchHandle::pending(receiver);
        slot.in_flight = Some(InFlight {
            generation,
            signal: signal.clone(),
            handle: handle.clone(),
            settle,
            revert,
        });

        let job = FetchJob {
            query: Arc::downgrade(&self.inner),
            key: self.inner.key.clone(),
            generation,
            signal,
            fetcher,
            retry: slot.config.retry.clone(),
            retry_delay: slot.config.retry_delay.clone(),
            network_mode: slot.config.network_mode,
            environment: self.inner.environment.clone(),
        };
        let commit = slot.commit();
        drop(slot);

        if let Some(old) = superseded {
            old.cancel();
            telemetry::record(self.hash(), QueryActivity::FetchCancelled);
        }
        telemetry::record(self.hash(), QueryActivity::FetchStarted);
        if paused {
            telemetry::record(self.hash(), QueryActivity::FetchPaused);
        }

        self.inner.runtime.spawn(job.run());
        self.dispatch(commit);
        handle
    }

    /// Cancels the in-flight fetch.
    ///
    /// The entry reverts to the state it had before the fetch started and every
    /// waiter receives [`Error::Cancelled`]. Returns `false` if nothing was in flight.
    pub fn cancel(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        let Some(in_flight) = slot.in_flight.take() else {
            return false;
        };

        let revision = slot.state.revision();
        let mut reverted = in_flight.revert.clone();
        reverted.fetch_status = FetchStatus::Idle;
        reverted.bump_revision(revision);
        slot.state = reverted;
        if slot.observers.is_empty() {
            self.schedule_gc(&mut slot);
        }

        let commit = Commit {
            state: slot.state.clone(),
            observers: slot.observers(),
        };
        drop(slot);

        in_flight.cancel();
        telemetry::record(self.hash(), QueryActivity::FetchCancelled);
        self.dispatch(commit);
        true
    }

    /// Writes data directly, as if a fetch had succeeded.
    ///
    /// Does not start, stop or otherwise affect a fetch.
    pub fn set_data(&self, data: T) -> Arc<T> {
        let mut slot = self.inner.slot.lock();
        let data = slot.share(data);
        write_success(&mut slot.state, Arc::clone(&data), Instant::now());
        let commit = slot.commit();
        drop(slot);

        self.dispatch(commit);
        data
    }

    /// Writes an error directly, as if a fetch had failed.
    pub fn set_error(&self, error: FetchError) {
        let mut slot = self.inner.slot.lock();
        let fetch_status = slot.state.fetch_status;
        let failures = slot.state.fetch_failure_count;
        slot.write_error(error, failures);
        slot.state.fetch_status = fetch_status;
        let commit = slot.commit();
        drop(slot);

        self.dispatch(commit);
    }

    /// Marks the data stale regardless of its age.
    pub fn invalidate(&self) {
        let mut slot = self.inner.slot.lock();
        if slot.state.is_invalidated {
            return;
        }

        slot.state.is_invalidated = true;
        let commit = slot.commit();
        drop(slot);

        telemetry::record(self.hash(), QueryActivity::Invalidated);
        self.dispatch(commit);
    }

    /// Returns the entry to its initial state, cancelling any fetch.
    pub fn reset(&self) {
        let mut slot = self.inner.slot.lock();
        let cancelled = slot.in_flight.take();

        let revision = slot.state.revision();
        slot.state = QueryState::new(slot.config.initial_data.clone());
        slot.state.bump_revision(revision);
        if slot.observers.is_empty() {
            self.schedule_gc(&mut slot);
        }
        let commit = Commit {
            state: slot.state.clone(),
            observers: slot.observers(),
        };
        drop(slot);

        if let Some(in_flight) = cancelled {
            in_flight.cancel();
        }
        telemetry::record(self.hash(), QueryActivity::Reset);
        self.dispatch(commit);
    }

    /// Returns `true` if any observer considers the data stale, or, without
    /// observers, if it is stale by the entry's configured stale time.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let slot = self.inner.slot.lock();
        if slot.observers.is_empty() {
            return slot.state.is_stale_by_time(slot.config.stale_time, Instant::now());
        }

        let observers = slot.observers();
        drop(slot);
        observers.iter().any(|o| o.is_stale(self))
    }

    /// Returns `true` if at least one enabled observer is subscribed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let observers = self.inner.slot.lock().observers();
        observers.iter().any(|o| o.is_enabled())
    }

    /// Returns `true` if the entry should not be refetched implicitly.
    ///
    /// An observed entry is disabled when none of its observers is enabled. An
    /// unobserved entry is disabled when it has no fetcher or has never settled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        let slot = self.inner.slot.lock();
        if slot.observers.is_empty() {
            return slot.config.fetcher.is_none() || slot.state.data_update_count + slot.state.error_update_count == 0;
        }

        drop(slot);
        !self.is_active()
    }

    /// Attaches a custom observer until the returned subscription is dropped.
    pub fn subscribe_observer(&self, observer: Arc<dyn EntryObserver<T>>) -> Subscription {
        let id = next_observer_id();
        self.add_observer(id, observer);

        let query = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = query.upgrade() {
                Self { inner }.remove_observer(id);
            }
        })
    }

    pub(crate) fn add_observer(&self, id: u64, observer: Arc<dyn EntryObserver<T>>) {
        let mut slot = self.inner.slot.lock();
        if slot.observers.iter().any(|s| s.id == id) {
            return;
        }
        slot.observers.push(Subscriber { id, observer });
        slot.gc = None;
        drop(slot);

        self.emit(QueryCacheEvent::ObserverAdded(self.clone()));
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        let mut slot = self.inner.slot.lock();
        let before = slot.observers.len();
        slot.observers.retain(|s| s.id != id);
        if slot.observers.len() == before {
            return;
        }
        if slot.observers.is_empty() {
            self.schedule_gc(&mut slot);
        }
        drop(slot);

        self.emit(QueryCacheEvent::ObserverRemoved(self.clone()));
    }

    pub(crate) fn update_config(&self, config: QueryConfig<T>) {
        self.inner.slot.lock().config.update(config);
    }

    pub(crate) fn stale_time(&self) -> Duration {
        self.inner.slot.lock().config.stale_time
    }

    /// Replaces the state with a restored snapshot, keeping the current fetch status.
    pub(crate) fn restore(&self, mut state: QueryState<T>) {
        let mut slot = self.inner.slot.lock();
        state.fetch_status = slot.state.fetch_status;
        state.bump_revision(slot.state.revision());
        slot.state = state;
        let commit = Commit {
            state: slot.state.clone(),
            observers: slot.observers(),
        };
        drop(slot);

        telemetry::record(self.hash(), QueryActivity::Hydrated);
        self.dispatch(commit);
    }

    /// Returns `true` if the entry may be collected: unobserved and not fetching.
    pub(crate) fn is_collectable(&self) -> bool {
        let slot = self.inner.slot.lock();
        slot.observers.is_empty() && slot.in_flight.is_none()
    }

    pub(crate) fn on_focus(&self) {
        let observers = self.inner.slot.lock().observers();
        for observer in observers {
            observer.on_focus(self);
        }
    }

    pub(crate) fn on_online(&self) {
        let observers = self.inner.slot.lock().observers();
        for observer in observers {
            observer.on_online(self);
        }
    }

    fn schedule_gc(&self, slot: &mut Slot<T>) {
        slot.gc = None;
        let gc_time = slot.config.gc_time;
        if gc_time == Duration::MAX {
            return;
        }

        let query = Arc::downgrade(&self.inner);
        slot.gc = Some(TaskGuard::new(self.inner.runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(inner) = query.upgrade() {
                Self { inner }.collect();
            }
        })));
    }

    fn collect(&self) {
        let Some(cache) = self.inner.cache.upgrade() else {
            return;
        };

        if cache.remove_if(self, Self::is_collectable) {
            telemetry::record(self.hash(), QueryActivity::GcCollected);
        }
    }

    fn emit(&self, event: QueryCacheEvent<T>) {
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(&event);
        }
    }

    fn dispatch(&self, commit: Commit<T>) {
        for observer in &commit.observers {
            observer.on_entry_change(self, &commit.state);
        }
        self.emit(QueryCacheEvent::Updated(self.clone()));
    }

    fn set_paused(&self, generation: u64, paused: bool) -> bool {
        let mut slot = self.inner.slot.lock();
        if !slot.is_current(generation) {
            return false;
        }

        let target = if paused { FetchStatus::Paused } else { FetchStatus::Fetching };
        if slot.state.fetch_status == target {
            return true;
        }

        slot.state.fetch_status = target;
        let commit = slot.commit();
        drop(slot);

        let activity = if paused {
            QueryActivity::FetchPaused
        } else {
            QueryActivity::FetchResumed
        };
        telemetry::record(self.hash(), activity);
        self.dispatch(commit);
        true
    }

    fn record_failure(&self, generation: u64, failures: u32, error: FetchError) -> bool {
        let mut slot = self.inner.slot.lock();
        if !slot.is_current(generation) {
            drop(slot);
            telemetry::record(self.hash(), QueryActivity::LateResultDiscarded);
            return false;
        }

        slot.state.fetch_failure_count = failures;
        slot.state.fetch_failure_reason = Some(error);
        let commit = slot.commit();
        drop(slot);

        telemetry::record_attempt(self.hash(), QueryActivity::FetchRetrying, failures);
        self.dispatch(commit);
        true
    }

    fn settle_success(&self, generation: u64, data: T) {
        let mut slot = self.inner.slot.lock();
        let Some(in_flight) = slot.take_current(generation) else {
            drop(slot);
            telemetry::record(self.hash(), QueryActivity::LateResultDiscarded);
            return;
        };

        let data = slot.share(data);
        write_success(&mut slot.state, Arc::clone(&data), Instant::now());
        slot.state.fetch_status = FetchStatus::Idle;
        slot.state.fetch_failure_count = 0;
        slot.state.fetch_failure_reason = None;
        if slot.observers.is_empty() {
            self.schedule_gc(&mut slot);
        }
        let commit = slot.commit();
        drop(slot);

        let _ = in_flight.settle.send(FetchOutcome::Success(data));
        telemetry::record(self.hash(), QueryActivity::FetchSucceeded);
        self.dispatch(commit);
    }

    fn settle_error(&self, generation: u64, failures: u32, error: FetchError) {
        let mut slot = self.inner.slot.lock();
        let Some(in_flight) = slot.take_current(generation) else {
            drop(slot);
            telemetry::record(self.hash(), QueryActivity::LateResultDiscarded);
            return;
        };

        slot.write_error(error.clone(), failures);
        if slot.observers.is_empty() {
            self.schedule_gc(&mut slot);
        }
        let commit = slot.commit();
        drop(slot);

        let _ = in_flight.settle.send(FetchOutcome::Failed(error));
        telemetry::record_attempt(self.hash(), QueryActivity::FetchFailed, failures);
        self.dispatch(commit);
    }
}

fn write_success<T>(state: &mut QueryState<T>, data: Arc<T>, at: Instant) {
    state.status = QueryStatus::Success;
    state.data = Some(data);
    state.data_updated_at = Some(at);
    state.data_update_count += 1;
    state.error = None;
    state.is_invalidated = false;
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("status", &slot.state.status)
            .field("fetch_status", &slot.state.fetch_status)
            .field("observers", &slot.observers.len())
            .finish_non_exhaustive()
    }
}

/// The retry loop of one fetch, run as a detached task.
struct FetchJob<T> {
    query: Weak<QueryInner<T>>,
    key: QueryKey,
    generation: u64,
    signal: CancellationToken,
    fetcher: Fetcher<T>,
    retry: RetryPolicy,
    retry_delay: RetryDelay,
    network_mode: NetworkMode,
    environment: Environment,
}

impl<T: QueryData> FetchJob<T> {
    fn query(&self) -> Option<Query<T>> {
        self.query.upgrade().map(|inner| Query { inner })
    }

    async fn run(self) {
        let mut failures = 0;

        loop {
            if self.signal.is_cancelled() {
                return;
            }

            if must_pause(self.network_mode, self.environment.is_online(), failures) {
                if !self.query().is_some_and(|q| q.set_paused(self.generation, true)) {
                    return;
                }

                tokio::select! {
                    () = self.signal.cancelled() => return,
                    () = self.environment.wait_online() => {}
                }

                if !self.query().is_some_and(|q| q.set_paused(self.generation, false)) {
                    return;
                }
            }

            let context = QueryContext {
                key: self.key.clone(),
                signal: self.signal.clone(),
                attempt: failures,
            };
            let result = (self.fetcher)(context).await;

            let Some(query) = self.query() else {
                return;
            };

            match result {
                Ok(data) => {
                    query.settle_success(self.generation, data);
                    return;
                }
                Err(error) => {
                    failures += 1;
                    if !self.retry.should_retry(failures, &error) {
                        query.settle_error(self.generation, failures, error);
                        return;
                    }

                    let delay = self.retry_delay.delay_for(failures, &error);
                    if !query.record_failure(self.generation, failures, error) {
                        return;
                    }
                    drop(query);

                    tokio::select! {
                        () = self.signal.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        options::{QueryDefaults, QueryOptions},
        retry::RetryDelay,
    };

    fn detached<T: QueryData>(options: &QueryOptions<T>) -> Query<T> {
        Query::new(
            options.key().expect("valid key").clone(),
            QueryConfig::resolve(options, &QueryDefaults::default()),
            Weak::new(),
            Environment::new(),
            Runtime::default(),
        )
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<(QueryStatus, FetchStatus, u32)>>,
    }

    impl EntryObserver<u32> for Recorder {
        fn on_entry_change(&self, _query: &Query<u32>, state: &QueryState<u32>) {
            self.states
                .lock()
                .push((state.status, state.fetch_status, state.fetch_failure_count));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_success_settles_entry() {
        let query = detached(&QueryOptions::new(["n"]).fetcher(|_| async { Ok::<_, FetchError>(42_u32) }));

        let data = query.fetch(FetchOptions::default()).await.expect("fetch succeeds");
        assert_eq!(*data, 42);

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.data_update_count, 1);
        assert!(state.data_updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_handle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = detached(&QueryOptions::new(["n"]).fetcher(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, FetchError>(1_u32)
            }
        }));

        let a = query.fetch(FetchOptions::default());
        let b = query.fetch(FetchOptions::default());
        assert!(a.same_fetch(&b));

        let (a, b) = tokio::join!(a, b);
        assert!(Arc::ptr_eq(&a.expect("a"), &b.expect("b")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_settles_with_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = detached(
            &QueryOptions::new(["n"])
                .fetcher(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u32, _>(FetchError::msg("down")) }
                })
                .retry(RetryPolicy::Retries(2))
                .retry_delay(RetryDelay::fixed(Duration::from_millis(10))),
        );
        let recorder = Arc::new(Recorder::default());
        let _sub = query.subscribe_observer(recorder.clone());

        let err = query.fetch(FetchOptions::default()).await.expect_err("fetch fails");
        assert_eq!(err.fetch_error().map(ToString::to_string).as_deref(), Some("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.fetch_failure_count, 3);
        assert!(state.data.is_none());

        let states = recorder.states.lock().clone();
        assert_eq!(
            states,
            [
                (QueryStatus::Pending, FetchStatus::Fetching, 0),
                (QueryStatus::Pending, FetchStatus::Fetching, 1),
                (QueryStatus::Pending, FetchStatus::Fetching, 2),
                (QueryStatus::Error, FetchStatus::Idle, 3),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reverts_and_discards_late_result() {
        let query = detached(&QueryOptions::new(["n"]).fetcher(|_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, FetchError>(2_u32)
        }));
        query.set_data(1);
        let before = query.state();

        let handle = query.fetch(FetchOptions::default());
        assert_eq!(query.state().fetch_status, FetchStatus::Fetching);
        assert!(query.cancel());
        assert!(!query.cancel());

        assert!(handle.await.expect_err("cancelled").is_cancelled());
        let after = query.state();
        assert_eq!(after.fetch_status, FetchStatus::Idle);
        assert_eq!(after.data.as_deref(), Some(&1));
        assert_eq!(after.data_update_count, before.data_update_count);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(query.data().as_deref(), Some(&1));
        assert!(query.state().revision() == after.revision(), "late result must not change the entry");
    }

    #[tokio::test(start_paused = true)]
    async fn structural_sharing_keeps_equal_data() {
        let query = detached(&QueryOptions::new(["n"]).fetcher(|_| async { Ok::<_, FetchError>(vec![1, 2]) }));

        let first = query.fetch(FetchOptions::default()).await.expect("first");
        let second = query.fetch(FetchOptions::default()).await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(query.state().data_update_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_fetcher_settles_with_error() {
        let query = detached(&QueryOptions::<u32>::new(["n"]));

        let err = query.fetch(FetchOptions::default()).await.expect_err("no fetcher");
        assert!(err.fetch_error().is_some());
        assert_eq!(query.state().status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_refetch_supersedes_in_flight_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = detached(&QueryOptions::new(["n"]).fetcher(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, FetchError>(7_u32)
            }
        }));
        query.set_data(100);

        let first = query.fetch(FetchOptions::default());
        let second = query.fetch(FetchOptions::cancel_refetch());
        assert!(!first.same_fetch(&second));

        assert!(first.await.expect_err("superseded").is_cancelled());
        assert_eq!(*second.await.expect("second"), 7);
        assert_eq!(query.data().as_deref(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "a fetch cancelled before it started never runs");
    }

    #[tokio::test(start_paused = true)]
    async fn set_error_clears_data_and_keeps_fetch_status() {
        let query = detached(&QueryOptions::<u32>::new(["n"]));
        query.set_data(5);
        query.set_error(FetchError::msg("bad"));

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.data.is_none());
        assert_eq!(state.error_update_count, 1);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_reset() {
        let query = detached(&QueryOptions::<u32>::new(["n"]).initial_data(3).stale_time(Duration::MAX));
        assert!(!query.is_stale());

        query.invalidate();
        assert!(query.is_stale());
        assert!(query.state().is_invalidated);

        query.set_data(4);
        assert!(!query.state().is_invalidated);

        query.reset();
        let state = query.state();
        assert_eq!(state.data.as_deref(), Some(&3));
        assert_eq!(state.data_update_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_fetch_pauses_until_online() {
        let environment = Environment::with_state(false, true);
        let options = QueryOptions::new(["n"]).fetcher(|_| async { Ok::<_, FetchError>(9_u32) });
        let query = Query::new(
            options.key().expect("valid key").clone(),
            QueryConfig::resolve(&options, &QueryDefaults::default()),
            Weak::new(),
            environment.clone(),
            Runtime::default(),
        );

        let handle = query.fetch(FetchOptions::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(query.state().fetch_status, FetchStatus::Paused);

        environment.set_online(true);
        assert_eq!(*handle.await.expect("resumes"), 9);
        assert_eq!(query.state().fetch_status, FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn always_mode_ignores_connectivity() {
        let options = QueryOptions::new(["n"])
            .fetcher(|_| async { Ok::<_, FetchError>(1_u32) })
            .network_mode(NetworkMode::Always);
        let query = Query::new(
            options.key().expect("valid key").clone(),
            QueryConfig::resolve(&options, &QueryDefaults::default()),
            Weak::new(),
            Environment::with_state(false, false),
            Runtime::default(),
        );

        assert_eq!(*query.fetch(FetchOptions::default()).await.expect("runs offline"), 1);
    }

    #[test]
    fn pause_rules() {
        assert!(must_pause(NetworkMode::Online, false, 0));
        assert!(!must_pause(NetworkMode::Online, true, 0));
        assert!(!must_pause(NetworkMode::Always, false, 3));
        assert!(!must_pause(NetworkMode::OfflineFirst, false, 0));
        assert!(must_pause(NetworkMode::OfflineFirst, false, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn fetcher_sees_attempt_and_signal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let query = detached(
            &QueryOptions::new(["ctx"])
                .fetcher(move |ctx: QueryContext| {
                    log.lock().push((ctx.attempt(), ctx.key().hash().to_string(), ctx.signal().is_cancelled()));
                    async move {
                        if ctx.attempt() == 0 {
                            Err(FetchError::msg("first"))
                        } else {
                            Ok(1_u32)
                        }
                    }
                })
                .retry_delay(RetryDelay::fixed(Duration::ZERO)),
        );

        query.fetch(FetchOptions::default()).await.expect("second attempt succeeds");
        assert_eq!(
            seen.lock().clone(),
            [(0, r#"["ctx"]"#.to_string(), false), (1, r#"["ctx"]"#.to_string(), false)]
        );
    }
}
