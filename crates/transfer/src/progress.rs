use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// Receiver of progress and status messages.
pub trait MessageSink: Send + Sync {
    fn post_message(&self, topic: &str, payload: &str);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn post_message(&self, topic: &str, payload: &str) {
        info!(topic, payload, "update message");
    }
}

/// Sink that keeps every message, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Payloads posted under `topic`.
    pub fn topic(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }
}

impl MessageSink for MemorySink {
    fn post_message(&self, topic: &str, payload: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((topic.to_string(), payload.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// Accumulates update progress across partitions and posts it to a sink.
///
/// Each partition script owns a proportion of the whole bar; steps within a
/// script are fractions of that proportion. Progress only moves forward and
/// is clamped to `[0, 1]`.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn MessageSink>,
    inner: Arc<Mutex<ProgressInner>>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    total: f32,
    posted: f32,
    proportion: f32,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            inner: Arc::new(Mutex::new(ProgressInner {
                proportion: 1.0,
                ..Default::default()
            })),
        }
    }

    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }

    /// Announces the progress bar.
    pub fn show(&self) {
        self.sink.post_message("show_progress", &format!("{:.6},{:.6}", 1.0, 0.0));
    }

    /// Sets the share of the bar owned by the next script.
    pub fn set_proportion(&self, proportion: f32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.proportion = proportion.clamp(0.0, 1.0);
        }
    }

    pub fn proportion(&self) -> f32 {
        self.inner.lock().map(|i| i.proportion).unwrap_or(0.0)
    }

    /// Adds `fraction` of the current script's proportion.
    pub fn advance(&self, fraction: f32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let step = fraction.max(0.0) * inner.proportion;
        inner.total = (inner.total + step).min(1.0);
        if inner.total > inner.posted {
            inner.posted = inner.total;
            debug!(progress = inner.total, "progress advanced");
            self.sink.post_message("set_progress", &format!("{:.6}", inner.total));
        }
    }

    /// Moves the bar to the end.
    pub fn fill(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.total = 1.0;
            inner.posted = 1.0;
        }
        self.sink.post_message("set_progress", &format!("{:.6}", 1.0));
    }

    pub fn fraction(&self) -> f32 {
        self.inner.lock().map(|i| i.total).unwrap_or(0.0)
    }
}
