// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Snapshots of the cache for persistence and transfer.
//!
//! [`dehydrate`] captures settled entries in a serializable form and [`hydrate`]
//! restores them into another client. Timestamps are stored as Unix milliseconds, so
//! restored data keeps its age across process restarts and goes stale once it is older
//! than its `stale_time`.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    client::QueryClient,
    error::{Error, FetchError, Result},
    key::QueryKey,
    options::QueryOptions,
    query::Query,
    state::{QueryData, QueryState, QueryStatus},
};

/// Restored timestamps older than this are not trusted to carry their age.
const RESTORE_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

type ShouldDehydrate<T> = Arc<dyn Fn(&Query<T>) -> bool + Send + Sync>;

/// A serializable snapshot of a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedState<T> {
    /// The captured entries, ordered by key hash.
    pub queries: Vec<DehydratedQuery<T>>,
}

/// A serializable snapshot of one entry.
///
/// Errors are kept as their message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedQuery<T> {
    /// The entry's key.
    pub key: QueryKey,
    /// See [`QueryStatus`].
    pub status: QueryStatus,
    /// Present exactly when `status` is [`QueryStatus::Success`].
    pub data: Option<Arc<T>>,
    /// When the data was written, in milliseconds since the Unix epoch.
    pub data_updated_at: Option<u64>,
    /// How many times data was written.
    pub data_update_count: u32,
    /// Present exactly when `status` is [`QueryStatus::Error`].
    pub error: Option<String>,
    /// When the error was written, in milliseconds since the Unix epoch.
    pub error_updated_at: Option<u64>,
    /// How many times the entry settled with an error.
    pub error_update_count: u32,
    /// Whether the entry was invalidated.
    pub is_invalidated: bool,
}

/// Selects which entries [`dehydrate`] captures.
pub struct DehydrateOptions<T> {
    should_dehydrate: Option<ShouldDehydrate<T>>,
}

impl<T> DehydrateOptions<T> {
    /// Captures every entry that has settled at least once.
    #[must_use]
    pub fn new() -> Self {
        Self { should_dehydrate: None }
    }

    /// Captures the entries for which `predicate` returns `true`.
    #[must_use]
    pub fn should_dehydrate(mut self, predicate: impl Fn(&Query<T>) -> bool + Send + Sync + 'static) -> Self {
        self.should_dehydrate = Some(Arc::new(predicate));
        self
    }
}

impl<T> Default for DehydrateOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DehydrateOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DehydrateOptions")
            .field("custom_predicate", &self.should_dehydrate.is_some())
            .finish()
    }
}

/// Captures the entries of `client` selected by `options`.
///
/// # Examples
///
/// ```
/// use refetch::{DehydrateOptions, QueryClient, dehydrate, hydrate};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = QueryClient::<String>::new();
/// server.set_query_data(["greeting"], "hello".to_string())?;
///
/// let json = serde_json::to_string(&dehydrate(&server, &DehydrateOptions::new()))?;
///
/// let browser = QueryClient::<String>::new();
/// hydrate(&browser, serde_json::from_str(&json)?)?;
/// assert_eq!(browser.get_query_data(["greeting"]).as_deref().map(String::as_str), Some("hello"));
/// # Ok(())
/// # }
/// ```
#[must_use]
pub fn dehydrate<T: QueryData>(client: &QueryClient<T>, options: &DehydrateOptions<T>) -> DehydratedState<T> {
    let now = Instant::now();
    let wall = SystemTime::now();

    let mut queries: Vec<_> = client
        .cache()
        .get_all()
        .into_iter()
        .filter(|query| match &options.should_dehydrate {
            Some(predicate) => predicate(query),
            None => query.state().has_settled(),
        })
        .map(|query| {
            let state = query.state();
            DehydratedQuery {
                key: query.key().clone(),
                status: state.status,
                data: state.data,
                data_updated_at: state.data_updated_at.and_then(|at| to_unix_ms(at, now, wall)),
                data_update_count: state.data_update_count,
                error: state.error.map(|e| e.to_string()),
                error_updated_at: state.error_updated_at.and_then(|at| to_unix_ms(at, now, wall)),
                error_update_count: state.error_update_count,
                is_invalidated: state.is_invalidated,
            }
        })
        .collect();

    queries.sort_by(|a, b| a.key.hash().cmp(b.key.hash()));
    DehydratedState { queries }
}

/// Restores a snapshot into `client`.
///
/// Missing entries are created. Existing entries are overwritten only when the
/// snapshot's data is newer than theirs; a fetch in flight keeps running. Returns the
/// number of entries written.
///
/// # Errors
///
/// Returns [`Error::Hydrate`] without writing anything if an entry's status does not
/// agree with the presence of its data and error.
///
/// # Panics
///
/// With the ambient runtime, panics if called outside of a tokio runtime.
pub fn hydrate<T: QueryData>(client: &QueryClient<T>, state: DehydratedState<T>) -> Result<usize> {
    for query in &state.queries {
        validate(query)?;
    }

    let now = Instant::now();
    let wall = SystemTime::now();
    let mut written = 0;

    for dehydrated in state.queries {
        let existing = client.cache().find(&dehydrated.key);
        if let Some(query) = &existing
            && !is_newer(&dehydrated, &query.state(), now, wall)
        {
            continue;
        }

        let query = match existing {
            Some(query) => query,
            None => client.build_query(&QueryOptions::new(dehydrated.key.clone()))?,
        };
        query.restore(restored_state(dehydrated, now, wall));
        written += 1;
    }

    Ok(written)
}

fn validate<T>(query: &DehydratedQuery<T>) -> Result<()> {
    let consistent = match query.status {
        QueryStatus::Pending => query.data.is_none() && query.error.is_none(),
        QueryStatus::Success => query.data.is_some() && query.error.is_none(),
        QueryStatus::Error => query.data.is_none() && query.error.is_some(),
    };

    if consistent {
        Ok(())
    } else {
        Err(Error::Hydrate(format!(
            "entry {} has status {:?} but data present = {}, error present = {}",
            query.key,
            query.status,
            query.data.is_some(),
            query.error.is_some()
        )))
    }
}

fn is_newer<T>(dehydrated: &DehydratedQuery<T>, current: &QueryState<T>, now: Instant, wall: SystemTime) -> bool {
    let current_at = current.data_updated_at.and_then(|at| to_unix_ms(at, now, wall));
    match (dehydrated.data_updated_at, current_at) {
        (Some(snapshot), Some(current)) => snapshot > current,
        (Some(_), None) => true,
        (None, _) => current.data.is_none() && !current.has_settled(),
    }
}

fn restored_state<T>(dehydrated: DehydratedQuery<T>, now: Instant, wall: SystemTime) -> QueryState<T> {
    let mut state = QueryState::new(None);
    let mut expired = false;
    let mut restore = |ms: Option<u64>| {
        ms.map(|ms| {
            from_unix_ms(ms, now, wall).unwrap_or_else(|| {
                expired = true;
                now
            })
        })
    };

    state.data_updated_at = restore(dehydrated.data_updated_at);
    state.error_updated_at = restore(dehydrated.error_updated_at);
    state.status = dehydrated.status;
    state.data = dehydrated.data;
    state.data_update_count = dehydrated.data_update_count;
    state.error = dehydrated.error.map(FetchError::msg);
    state.error_update_count = dehydrated.error_update_count;
    // Timestamps past the restore horizon, or before the monotonic clock's origin, are stale.
    state.is_invalidated = dehydrated.is_invalidated || expired;
    state
}

fn to_unix_ms(at: Instant, now: Instant, wall: SystemTime) -> Option<u64> {
    let age = now.saturating_duration_since(at);
    let since_epoch = wall.checked_sub(age)?.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}

fn from_unix_ms(ms: u64, now: Instant, wall: SystemTime) -> Option<Instant> {
    let written = UNIX_EPOCH.checked_add(Duration::from_millis(ms))?;
    // Timestamps from the future are treated as written now.
    let age = wall.duration_since(written).unwrap_or(Duration::ZERO);
    if age > RESTORE_HORIZON {
        return None;
    }
    now.checked_sub(age)
}
