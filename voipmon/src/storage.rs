//! Persistence sink.
//!
//! Handlers call [`Sink::store`] with a collection prefix and the source
//! packet timestamp; the sink derives the time-bucketed collection name and
//! forwards the document to the `storage` bus topic. A single
//! [`StorageWriter`] worker drains that topic, batches per collection and
//! hands the batches to a [`DocumentStore`].
//!
//! The date suffix always comes from the packet's own timestamp in UTC;
//! a late-arriving packet lands in its historical bucket.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::interval;
use tracing::{debug, error};

use crate::bus::{Bus, Event, Subscription};
use crate::config::StorageConfig;
use crate::error::Result;

pub(crate) mod mongo;

pub use mongo::MongoStore;

/// Bus topic drained by the storage writer.
pub const STORAGE_TOPIC: &str = "storage";

/// A write headed for the document store.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub collection: String,
    pub document: Value,
    /// Field used as the upsert predicate; `None` means plain insert.
    pub upsert_by: Option<&'static str>,
}

/// Destination of batched writes. Implementations must be internally
/// thread-safe; they are shared across workers.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()>;

    /// Replaces the whole document matching `key_field`, inserting when
    /// absent.
    async fn upsert(&self, collection: &str, key_field: &str, document: Value) -> Result<()>;
}

/// Cloneable producer half of the persistence sink.
#[derive(Clone)]
pub struct Sink {
    bus: Bus,
    time_suffix: String,
}

impl Sink {
    pub fn new(bus: Bus, time_suffix: impl Into<String>) -> Self {
        Self {
            bus,
            time_suffix: time_suffix.into(),
        }
    }

    /// `<prefix>_<suffix>` with the suffix rendered from `ts` in UTC.
    pub fn collection(&self, prefix: &str, ts: DateTime<Utc>) -> String {
        format!("{}_{}", prefix, ts.format(&self.time_suffix))
    }

    /// Queues `document` for the time-bucketed collection derived from the
    /// source packet timestamp.
    pub fn store(&self, prefix: &str, ts: DateTime<Utc>, document: Value) {
        let request = StoreRequest {
            collection: self.collection(prefix, ts),
            document,
            upsert_by: None,
        };
        self.bus.send(STORAGE_TOPIC, Event::Store(Arc::new(request)));
    }

    /// Queues an upsert into an un-bucketed collection, replacing the whole
    /// document matching `key_field`.
    pub fn upsert(&self, collection: &str, key_field: &'static str, document: Value) {
        let request = StoreRequest {
            collection: collection.to_string(),
            document,
            upsert_by: Some(key_field),
        };
        self.bus.send(STORAGE_TOPIC, Event::Store(Arc::new(request)));
    }
}

/// Worker draining the `storage` topic into a [`DocumentStore`].
pub struct StorageWriter {
    store: Arc<dyn DocumentStore>,
    subscription: Subscription,
    config: StorageConfig,
    batches: HashMap<String, Vec<Value>>,
    buffered: usize,
}

impl StorageWriter {
    pub fn new(bus: &Bus, store: Arc<dyn DocumentStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            subscription: bus.subscribe(STORAGE_TOPIC),
            config: config.clone(),
            batches: HashMap::new(),
            buffered: 0,
        }
    }

    pub async fn run(mut self) {
        let mut tick = interval(self.config.flush_interval());
        loop {
            tokio::select! {
                message = self.subscription.recv() => match message {
                    Some(message) => {
                        if let Event::Store(request) = message.event {
                            self.accept(request).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.flush_all().await,
            }
        }
        self.flush_all().await;
    }

    async fn accept(&mut self, request: Arc<StoreRequest>) {
        let request = Arc::unwrap_or_clone(request);
        match request.upsert_by {
            Some(key_field) => {
                // Upserts are rare (agent registrations); write through.
                if let Err(err) = self
                    .store
                    .upsert(&request.collection, key_field, request.document)
                    .await
                {
                    error!(collection = %request.collection, %err, "upsert failed");
                }
            }
            None => {
                self.batches
                    .entry(request.collection)
                    .or_default()
                    .push(request.document);
                self.buffered += 1;
                if self.buffered >= self.config.batch_size {
                    self.flush_all().await;
                }
            }
        }
    }

    async fn flush_all(&mut self) {
        if self.buffered == 0 {
            return;
        }
        debug!(documents = self.buffered, "flushing storage batches");
        self.buffered = 0;
        for (collection, documents) in self.batches.drain() {
            if let Err(err) = self.store.insert_many(&collection, documents).await {
                // No retry; the next record carries fresh state.
                error!(collection = %collection, %err, "bulk write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        inserts: Mutex<Vec<(String, Vec<Value>)>>,
        upserts: Mutex<Vec<(String, String, Value)>>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for RecordingStore {
        async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
            self.inserts
                .lock()
                .unwrap()
                .push((collection.to_string(), documents));
            Ok(())
        }

        async fn upsert(&self, collection: &str, key_field: &str, document: Value) -> Result<()> {
            self.upserts.lock().unwrap().push((
                collection.to_string(),
                key_field.to_string(),
                document,
            ));
            Ok(())
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_collection_suffix_uses_packet_date() {
        let sink = Sink::new(Bus::new(), "%Y%m%d");
        assert_eq!(
            sink.collection("sip_call_raw", ts("2024-02-29T23:59:59Z")),
            "sip_call_raw_20240229"
        );
        // A late-arriving packet belongs in its historical bucket.
        assert_eq!(
            sink.collection("rtpr_rtp_raw", ts("2019-01-02T00:00:00Z")),
            "rtpr_rtp_raw_20190102"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_batches_and_flushes_on_interval() {
        let bus = Bus::new();
        let store = Arc::new(RecordingStore::default());
        let writer = StorageWriter::new(&bus, store.clone(), &StorageConfig::default());
        tokio::spawn(writer.run());

        let sink = Sink::new(bus.clone(), "%Y%m%d");
        sink.store("sip_call_raw", ts("2024-05-01T10:00:00Z"), json!({"n": 1}));
        sink.store("sip_call_raw", ts("2024-05-01T11:00:00Z"), json!({"n": 2}));

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let inserts = store.inserts.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        let (collection, documents) = &inserts[0];
        assert_eq!(collection, "sip_call_raw_20240501");
        assert_eq!(documents.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_flushes_when_batch_fills() {
        let bus = Bus::new();
        let store = Arc::new(RecordingStore::default());
        let config = StorageConfig {
            batch_size: 2,
            flush_interval: 60_000,
        };
        let writer = StorageWriter::new(&bus, store.clone(), &config);
        tokio::spawn(writer.run());

        let sink = Sink::new(bus.clone(), "%Y%m%d");
        sink.store("rtpr_rtp_raw", ts("2024-05-01T10:00:00Z"), json!({"n": 1}));
        sink.store("rtpr_rtp_raw", ts("2024-05-01T10:00:01Z"), json!({"n": 2}));

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.inserts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upserts_write_through() {
        let bus = Bus::new();
        let store = Arc::new(RecordingStore::default());
        let writer = StorageWriter::new(&bus, store.clone(), &StorageConfig::default());
        tokio::spawn(writer.run());

        let sink = Sink::new(bus.clone(), "%Y%m%d");
        sink.upsert("hosts", "name", json!({"name": "agent-1", "addr": "10.0.0.5"}));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let upserts = store.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].0, "hosts");
        assert_eq!(upserts[0].1, "name");
    }
}
