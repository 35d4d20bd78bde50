// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime abstraction for background tasks.
//!
//! Fetches, retries, garbage collection and observer timers all run as detached tasks.
//! This module decides where those tasks are spawned.

use tokio::{runtime::Handle, task::JoinHandle};

#[derive(Debug, Clone, Default)]
pub(crate) struct Runtime {
    kind: RuntimeKind,
}

#[derive(Debug, Clone, Default)]
enum RuntimeKind {
    /// Spawn onto whichever tokio runtime is current at spawn time.
    #[default]
    Ambient,

    /// Spawn onto a specific runtime.
    Handle(Handle),
}

impl Runtime {
    #[must_use]
    pub(crate) fn with_handle(handle: Handle) -> Self {
        Self {
            kind: RuntimeKind::Handle(handle),
        }
    }

    /// Spawns `work` as a detached task.
    ///
    /// # Panics
    ///
    /// With the ambient runtime, panics if called outside of a tokio runtime.
    pub(crate) fn spawn<T>(&self, work: T) -> JoinHandle<()>
    where
        T: Future<Output = ()> + Send + 'static,
    {
        match &self.kind {
            RuntimeKind::Ambient => tokio::spawn(work),
            RuntimeKind::Handle(handle) => handle.spawn(work),
        }
    }
}

/// A spawned background task that is aborted when dropped.
#[derive(Debug)]
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
