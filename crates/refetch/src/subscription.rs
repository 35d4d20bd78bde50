// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Listener registrations that unregister on drop.

use std::fmt;

type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// A registered listener. Dropping the subscription unregisters it.
///
/// Returned by [`QueryObserver::subscribe`](crate::QueryObserver::subscribe),
/// [`QueryCache::subscribe`](crate::QueryCache::subscribe) and
/// [`Query::subscribe_observer`](crate::Query::subscribe_observer).
#[must_use = "dropping a subscription immediately unsubscribes"]
pub struct Subscription {
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unregisters the listener now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
