// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for query operations.

use std::{fmt, sync::Arc};

/// An error produced by a query operation.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The query key was malformed or could not be serialized.
    ///
    /// Returned synchronously before any cache entry is created.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The fetcher failed and every retry was exhausted.
    #[error("fetch failed: {0}")]
    Fetch(FetchError),

    /// The fetch was cancelled before it settled.
    ///
    /// Cancellation never becomes the entry's error state; the entry reverts to the
    /// state it had before the fetch started.
    #[error("fetch cancelled")]
    Cancelled,

    /// A snapshot could not be converted for hydration.
    #[error("hydration failed: {0}")]
    Hydrate(String),
}

impl Error {
    /// Returns the fetch error if this is a [`Error::Fetch`].
    #[must_use]
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this error represents a cancelled fetch.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A malformed query key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The key value could not be represented as JSON.
    #[error("query key is not serializable: {0}")]
    Serialize(String),

    /// The key is valid JSON but not an array.
    #[error("query key must be an array, got {0}")]
    NotAnArray(&'static str),
}

/// The error returned by a fetcher.
///
/// Any type convertible into [`anyhow::Error`] converts into a `FetchError`, so
/// fetchers can use the `?` operator freely. The error is reference counted because a
/// single failure is shared by every waiter of a deduplicated fetch and by the cache
/// entry itself.
///
/// `FetchError` intentionally does not implement [`std::error::Error`]; that keeps the
/// blanket conversion coherent. Use [`FetchError::as_anyhow`] to reach the source chain.
///
/// # Examples
///
/// ```
/// use refetch::FetchError;
///
/// fn parse(input: &str) -> Result<u32, FetchError> {
///     Ok(input.parse::<u32>()?)
/// }
///
/// let err = parse("nope").unwrap_err();
/// assert!(err.is::<std::num::ParseIntError>());
/// ```
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Creates a fetch error from a plain message.
    #[must_use]
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Returns the underlying error.
    #[must_use]
    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the underlying error is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if both handles point to the same failure.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E: Into<anyhow::Error>> From<E> for FetchError {
    fn from(err: E) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A specialized [`Result`] type for query operations.
pub type Result<T> = std::result::Result<T, Error>;
