//! In-memory doubles for the traits in this crate.

use crate::error::TransferError;
use crate::interrupt::Clock;
use crate::job::LogLine;
use crate::traits::{ByteSource, Console, ObjectInfo, ObjectStore};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Arc::default(),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *lock(&self.offset)
    }
}

/// Something observable a double did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(String),
    Warn(String),
    Log(String),
    Put(String),
    Get(String),
    Delete(String),
}

/// Shared, ordered record of events across several doubles.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        lock(&self.0).push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    /// Position of the first event satisfying `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        lock(&self.0).iter().position(pred)
    }
}

/// Collects everything printed to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingConsole {
    pub events: EventLog,
}

impl RecordingConsole {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Log(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Status and warning lines joined together, handy for `contains` checks.
    pub fn text(&self) -> String {
        self.events
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Status(s) | Event::Warn(s) => Some(s),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Console for RecordingConsole {
    fn status(&self, message: &str) {
        self.events.push(Event::Status(message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.events.push(Event::Warn(message.to_string()));
    }

    fn log_line(&self, line: &LogLine) {
        self.events.push(Event::Log(line.to_string()));
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// An object store held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    failures: Arc<Mutex<VecDeque<TransferError>>>,
    pub events: EventLog,
}

impl MemoryStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Stores an object directly, bypassing the event log.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// The next operation fails with `err`.
    pub fn fail_next(&self, err: TransferError) {
        lock(&self.failures).push_back(err);
    }

    fn injected_failure(&self) -> Result<(), TransferError> {
        match lock(&self.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        self.injected_failure()?;
        Ok(lock(&self.objects).contains_key(key))
    }

    async fn put_stream(&self, key: &str, mut source: ByteSource) -> Result<(), TransferError> {
        self.events.push(Event::Put(key.to_string()));
        self.injected_failure()?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = source.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.insert(key, buf.freeze(), Utc::now());
        Ok(())
    }

    async fn get_stream(&self, key: &str) -> Result<ByteSource, TransferError> {
        self.events.push(Event::Get(key.to_string()));
        self.injected_failure()?;

        let data = self.object(key).ok_or_else(|| TransferError::NotFound {
            operation: "get",
            key: key.to_string(),
        })?;
        // Small chunks, so consumers see the body arrive piecewise.
        let chunks: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn list_modified_since(
        &self,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObjectInfo>, TransferError> {
        self.injected_failure()?;
        Ok(lock(&self.objects)
            .iter()
            .filter(|(key, o)| key.starts_with(prefix) && o.last_modified >= since)
            .map(|(key, o)| ObjectInfo {
                key: key.clone(),
                last_modified: o.last_modified,
                size: o.data.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), TransferError> {
        self.events.push(Event::Delete(key.to_string()));
        self.injected_failure()?;
        lock(&self.objects).remove(key);
        Ok(())
    }
}
