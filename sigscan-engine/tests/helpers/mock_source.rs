//! In-memory upstream source
//!
//! Readings are keyed by (data class, identifier) with an optional default
//! score per class. Classes can be marked unavailable and identifiers can be
//! slowed down to exercise deadlines.

use async_trait::async_trait;
use sigscan_engine::types::{DataClass, Identifier, ScanError, ScanResult, SignalReading, SourceId};
use sigscan_engine::upstream::{UpstreamReply, UpstreamSource};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MockSource {
    id: SourceId,
    readings: Mutex<HashMap<(String, String), SignalReading>>,
    defaults: Mutex<HashMap<String, f64>>,
    unavailable: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: SourceId::new(id),
            readings: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, data_class: &str, identifier: &str, reading: SignalReading) {
        self.readings
            .lock()
            .unwrap()
            .insert((data_class.to_string(), identifier.to_string()), reading);
    }

    /// Score served for any identifier without an explicit reading
    pub fn set_default(&self, data_class: &str, score: f64) {
        self.defaults.lock().unwrap().insert(data_class.to_string(), score);
    }

    pub fn make_unavailable(&self, data_class: &str) {
        self.unavailable.lock().unwrap().insert(data_class.to_string());
    }

    /// Every fetch for `identifier` sleeps this long first
    pub fn slow_down(&self, identifier: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(identifier.to_string(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamSource for MockSource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    async fn fetch(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<UpstreamReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(identifier.as_str()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.lock().unwrap().contains(data_class.as_str()) {
            return Err(ScanError::UpstreamUnavailable {
                data_class: data_class.clone(),
                message: "provider has no data".to_string(),
            });
        }

        let key = (data_class.to_string(), identifier.to_string());
        if let Some(reading) = self.readings.lock().unwrap().get(&key) {
            return Ok(UpstreamReply::Fresh(reading.clone()));
        }
        match self.defaults.lock().unwrap().get(data_class.as_str()) {
            Some(score) => Ok(UpstreamReply::Fresh(SignalReading::new(*score))),
            None => Err(ScanError::UpstreamUnavailable {
                data_class: data_class.clone(),
                message: format!("no reading for {}", identifier),
            }),
        }
    }
}
