// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(test)]
pub(crate) const QUERY_HASH: &str = "query.hash";

#[cfg(test)]
pub(crate) const QUERY_ACTIVITY: &str = "query.activity";

#[cfg(test)]
pub(crate) const QUERY_FAILURE_COUNT: &str = "query.failure_count";

#[cfg(test)]
pub(crate) const QUERY_EVENT: &str = "query.event";
