// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured logging of query activity.
//!
//! Every state transition of a cache entry is reported as a single `tracing` event
//! carrying the entry's key hash and the activity name. Routine transitions are
//! logged at debug level so they are free unless a subscriber opts in.

use crate::key::KeyHash;

pub(crate) mod attributes;
#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryActivity {
    Created,
    Removed,
    FetchStarted,
    FetchDeduplicated,
    FetchSucceeded,
    FetchRetrying,
    FetchFailed,
    FetchCancelled,
    FetchPaused,
    FetchResumed,
    LateResultDiscarded,
    Invalidated,
    Reset,
    GcCollected,
    Hydrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
}

impl QueryActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "query.created",
            Self::Removed => "query.removed",
            Self::FetchStarted => "query.fetch_started",
            Self::FetchDeduplicated => "query.fetch_deduplicated",
            Self::FetchSucceeded => "query.fetch_succeeded",
            Self::FetchRetrying => "query.fetch_retrying",
            Self::FetchFailed => "query.fetch_failed",
            Self::FetchCancelled => "query.fetch_cancelled",
            Self::FetchPaused => "query.fetch_paused",
            Self::FetchResumed => "query.fetch_resumed",
            Self::LateResultDiscarded => "query.late_result_discarded",
            Self::Invalidated => "query.invalidated",
            Self::Reset => "query.reset",
            Self::GcCollected => "query.gc_collected",
            Self::Hydrated => "query.hydrated",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::FetchDeduplicated | Self::LateResultDiscarded => Severity::Trace,
            Self::Created | Self::FetchStarted | Self::FetchSucceeded | Self::FetchPaused | Self::FetchResumed | Self::Hydrated => {
                Severity::Debug
            }
            Self::Removed | Self::FetchRetrying | Self::FetchCancelled | Self::Invalidated | Self::Reset | Self::GcCollected => {
                Severity::Info
            }
            Self::FetchFailed => Severity::Warn,
        }
    }
}

/// Emits a structured event for `activity` on the entry identified by `hash`.
pub(crate) fn record(hash: &KeyHash, activity: QueryActivity) {
    emit(hash, activity, None);
}

/// Like [`record`], additionally attaching a failure count.
pub(crate) fn record_attempt(hash: &KeyHash, activity: QueryActivity, failure_count: u32) {
    emit(hash, activity, Some(failure_count));
}

fn emit(hash: &KeyHash, activity: QueryActivity, failure_count: Option<u32>) {
    let name = activity.as_str();

    // Tracing levels must be constant, so a macro selects the level.
    // Field names must match the constants in attributes.rs.
    macro_rules! emit_event {
        ($level:ident) => {
            tracing::$level!(
                query.hash = %hash,
                query.activity = name,
                query.failure_count = failure_count,
                "query.event"
            )
        };
    }

    match activity.severity() {
        Severity::Trace => emit_event!(trace),
        Severity::Debug => emit_event!(debug),
        Severity::Info => emit_event!(info),
        Severity::Warn => emit_event!(warn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueryKey, telemetry::testing::LogCapture};

    fn hash() -> KeyHash {
        QueryKey::new(["todos"]).expect("valid key").hash().clone()
    }

    #[test]
    fn activity_names() {
        assert_eq!(QueryActivity::Created.as_str(), "query.created");
        assert_eq!(QueryActivity::FetchRetrying.as_str(), "query.fetch_retrying");
        assert_eq!(QueryActivity::LateResultDiscarded.as_str(), "query.late_result_discarded");
        assert_eq!(QueryActivity::GcCollected.as_str(), "query.gc_collected");
    }

    #[test]
    fn severities() {
        assert_eq!(QueryActivity::FetchDeduplicated.severity(), Severity::Trace);
        assert_eq!(QueryActivity::FetchStarted.severity(), Severity::Debug);
        assert_eq!(QueryActivity::Invalidated.severity(), Severity::Info);
        assert_eq!(QueryActivity::FetchFailed.severity(), Severity::Warn);
    }

    #[test]
    fn emitted_event_contains_fields() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        record_attempt(&hash(), QueryActivity::FetchFailed, 4);

        capture.assert_contains(attributes::QUERY_HASH);
        capture.assert_contains(attributes::QUERY_ACTIVITY);
        capture.assert_contains(attributes::QUERY_FAILURE_COUNT);
        capture.assert_contains(attributes::QUERY_EVENT);
        capture.assert_contains(r#"["todos"]"#);
        capture.assert_activity(QueryActivity::FetchFailed);
        capture.assert_failure_count(4);
        capture.assert_contains("WARN");
    }

    #[test]
    fn activities_are_captured_in_order() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        record(&hash(), QueryActivity::Created);
        record(&hash(), QueryActivity::FetchStarted);
        record(&hash(), QueryActivity::Reset);

        assert_eq!(capture.activities(), ["query.created", "query.fetch_started", "query.reset"]);
    }

    #[test]
    fn levels_follow_severity() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record(&hash(), QueryActivity::Removed);
        capture.assert_contains("INFO");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record(&hash(), QueryActivity::FetchStarted);
        capture.assert_contains("DEBUG");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record(&hash(), QueryActivity::FetchDeduplicated);
        capture.assert_contains("TRACE");
    }
}
