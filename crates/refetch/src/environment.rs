// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connectivity and focus signals supplied by the host.
//!
//! The cache never probes the network or the windowing system itself. The host owns an
//! [`Environment`], reports changes through [`Environment::set_online`] and
//! [`Environment::set_focused`], and hands a clone to the [`QueryClient`](crate::QueryClient).
//! Fetches pause while the environment is offline and resume when it comes back;
//! mounted clients refetch stale data on refocus and reconnect.

use std::sync::Arc;

use tokio::sync::watch;

/// A shared, injectable source of online and focus state.
///
/// Clones share the same underlying state. A new environment starts online and focused.
///
/// # Examples
///
/// ```
/// use refetch::Environment;
///
/// let env = Environment::new();
/// assert!(env.is_online());
///
/// env.set_online(false);
/// assert!(!env.is_online());
/// ```
#[derive(Debug, Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

#[derive(Debug)]
struct EnvironmentInner {
    online: watch::Sender<bool>,
    focused: watch::Sender<bool>,
}

impl Environment {
    /// Creates an environment that is online and focused.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(true, true)
    }

    /// Creates an environment with the given initial state.
    #[must_use]
    pub fn with_state(online: bool, focused: bool) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                online: watch::Sender::new(online),
                focused: watch::Sender::new(focused),
            }),
        }
    }

    /// Returns `true` if fetches that require connectivity may run.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Returns `true` if the host application is focused.
    #[must_use]
    pub fn is_focused(&self) -> bool {
        *self.inner.focused.borrow()
    }

    /// Reports a connectivity change.
    ///
    /// Returns `true` if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        set_if_changed(&self.inner.online, online)
    }

    /// Reports a focus change.
    ///
    /// Returns `true` if the state changed.
    pub fn set_focused(&self, focused: bool) -> bool {
        set_if_changed(&self.inner.focused, focused)
    }

    /// Resolves once the environment is online.
    pub(crate) async fn wait_online(&self) {
        let mut rx = self.inner.online.subscribe();
        // The sender lives as long as `self`, so this only fails if `self` is gone.
        let _ = rx.wait_for(|online| *online).await;
    }

    pub(crate) fn watch_online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub(crate) fn watch_focus(&self) -> watch::Receiver<bool> {
        self.inner.focused.subscribe()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn set_if_changed(sender: &watch::Sender<bool>, value: bool) -> bool {
    sender.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}
