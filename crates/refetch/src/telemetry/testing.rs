// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Log capture for asserting on emitted query events.

use std::{io::Write, sync::Arc};

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use super::{QueryActivity, attributes};

/// Collects formatted query events into a shared buffer.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// The `query.activity` values of every captured event, in emission order.
    #[must_use]
    pub fn activities(&self) -> Vec<String> {
        let prefix = format!("{}=\"", attributes::QUERY_ACTIVITY);
        self.output()
            .lines()
            .filter_map(|line| {
                let rest = &line[line.find(&prefix)? + prefix.len()..];
                rest.split('"').next().map(str::to_string)
            })
            .collect()
    }

    pub fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(output.contains(expected), "log output does not contain '{expected}', got:\n{output}");
    }

    pub fn assert_activity(&self, activity: QueryActivity) {
        let activities = self.activities();
        assert!(
            activities.iter().any(|a| a == activity.as_str()),
            "no {} event, got {activities:?}",
            activity.as_str()
        );
    }

    pub fn assert_failure_count(&self, count: u32) {
        self.assert_contains(&format!("{}={count}", attributes::QUERY_FAILURE_COUNT));
    }

    /// A subscriber that writes every level into this buffer.
    /// Install with `set_default()` to keep the capture thread-local.
    #[must_use]
    pub fn subscriber(&self) -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

pub(crate) struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
