//! Metrics sink adapter.
//!
//! Thin tagged wrappers over the `metrics` facade. The backend recorder is
//! installed by the process bootstrap; the core only emits.

use metrics::Label;

/// An ordered tag set attached to a metric.
#[derive(Debug, Clone, Default)]
pub struct Tags(Vec<Label>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.push(Label::new(key, value.into()));
        self
    }

    /// Adds the tag only when a value is present.
    pub fn maybe(self, key: &'static str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    fn labels(&self) -> Vec<Label> {
        self.0.clone()
    }
}

/// Increments a counter by one.
pub fn counter(name: impl Into<String>, tags: &Tags) {
    metrics::counter!(name.into(), tags.labels()).increment(1);
}

/// Records a value into a summary distribution.
pub fn summary(name: impl Into<String>, tags: &Tags, value: f64) {
    metrics::histogram!(name.into(), tags.labels()).record(value);
}

/// Records a duration in milliseconds.
pub fn timer(name: impl Into<String>, tags: &Tags, millis: f64) {
    metrics::histogram!(name.into(), tags.labels()).record(millis);
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn test_counter_carries_tags() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let tags = Tags::new()
                .with("cseq_method", "INVITE")
                .maybe("src_host", None::<String>)
                .maybe("dst_host", Some("pbx-1"));
            counter("sip_call_messages", &tags);
            counter("sip_call_messages", &tags);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(snapshot.len(), 1);
        let (key, _, _, value) = &snapshot[0];
        assert_eq!(key.key().name(), "sip_call_messages");
        let labels: Vec<_> = key.key().labels().collect();
        assert_eq!(labels.len(), 2);
        assert_matches!(value, DebugValue::Counter(2));
    }

    #[test]
    fn test_summary_records_values() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            summary("rtpr_rtp_mos", &Tags::new(), 4.2);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(snapshot.len(), 1);
        let (key, _, _, value) = &snapshot[0];
        assert_eq!(key.key().name(), "rtpr_rtp_mos");
        match value {
            DebugValue::Histogram(values) => assert_eq!(values.len(), 1),
            other => panic!("unexpected metric value: {other:?}"),
        }
    }
}
