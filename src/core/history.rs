use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::Reading;

pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity FIFO of recent readings for one sensor stream.
#[derive(Debug)]
pub struct HistoryWindow {
    entries: VecDeque<Arc<Reading>>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, returning the entry evicted to make room (if any).
    pub fn push(&mut self, reading: Arc<Reading>) -> Option<Arc<Reading>> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(reading);
        evicted
    }

    pub fn latest(&self) -> Option<&Arc<Reading>> {
        self.entries.back()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-first copy of the window. Readings are shared, not cloned.
    pub fn snapshot(&self) -> Vec<Arc<Reading>> {
        self.entries.iter().cloned().collect()
    }
}

/// The stream state a reading was evaluated against.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    pub previous: Option<Arc<Reading>>,
    /// Window contents before the reading was appended, oldest first.
    pub prior: Vec<Arc<Reading>>,
}

impl HistorySnapshot {
    /// Prior history followed by `current`.
    pub fn recent_with(&self, current: &Arc<Reading>) -> Vec<Arc<Reading>> {
        let mut recent = Vec::with_capacity(self.prior.len() + 1);
        recent.extend(self.prior.iter().cloned());
        recent.push(Arc::clone(current));
        recent
    }
}

/// History windows keyed by sensor id.
///
/// Each stream has its own lock, so appends to one stream are serialized
/// while different streams proceed in parallel.
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    streams: RwLock<HashMap<String, Arc<Mutex<HistoryWindow>>>>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn stream(&self, sensor_id: &str) -> Arc<Mutex<HistoryWindow>> {
        {
            let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(window) = streams.get(sensor_id) {
                return Arc::clone(window);
            }
        }
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            streams
                .entry(sensor_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HistoryWindow::new(self.capacity)))),
        )
    }

    /// Capture the stream state for `reading`, then append it.
    pub fn record(&self, reading: Arc<Reading>) -> HistorySnapshot {
        let stream = self.stream(&reading.sensor_id);
        let mut window = stream.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = HistorySnapshot {
            previous: window.latest().cloned(),
            prior: window.snapshot(),
        };
        window.push(reading);
        snapshot
    }

    /// Read-only view of a stream without appending.
    #[cfg(test)]
    pub fn snapshot(&self, sensor_id: &str) -> HistorySnapshot {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        match streams.get(sensor_id) {
            Some(stream) => {
                let window = stream.lock().unwrap_or_else(PoisonError::into_inner);
                HistorySnapshot {
                    previous: window.latest().cloned(),
                    prior: window.snapshot(),
                }
            }
            None => HistorySnapshot::default(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;
    use chrono::Utc;

    fn make_reading(sensor: &str, temp: f64) -> Arc<Reading> {
        Arc::new(Reading::new(sensor, Utc::now()).with(Field::Temperature, temp))
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut window = HistoryWindow::new(3);
        for t in 0..3 {
            assert!(window.push(make_reading("a", t as f64)).is_none());
        }
        let evicted = window.push(make_reading("a", 3.0)).unwrap();
        assert_eq!(evicted.temperature, Some(0.0));
        assert_eq!(window.len(), 3);
        let temps: Vec<_> = window.snapshot().iter().map(|r| r.temperature.unwrap()).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut window = HistoryWindow::new(0);
        window.push(make_reading("a", 1.0));
        window.push(make_reading("a", 2.0));
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.latest().unwrap().temperature, Some(2.0));
    }

    #[test]
    fn record_returns_state_before_append() {
        let store = HistoryStore::new(DEFAULT_CAPACITY);
        let first = store.record(make_reading("GH001", 20.0));
        assert!(first.previous.is_none());
        assert!(first.prior.is_empty());

        let second = store.record(make_reading("GH001", 21.0));
        assert_eq!(second.previous.as_ref().unwrap().temperature, Some(20.0));
        assert_eq!(second.prior.len(), 1);
    }

    #[test]
    fn streams_are_independent() {
        let store = HistoryStore::new(10);
        store.record(make_reading("a", 1.0));
        store.record(make_reading("a", 2.0));
        let b = store.record(make_reading("b", 9.0));
        assert!(b.previous.is_none());
        assert_eq!(store.stream_count(), 2);
        assert_eq!(store.snapshot("a").prior.len(), 2);
        assert!(store.snapshot("missing").prior.is_empty());
    }

    #[test]
    fn recent_with_appends_current() {
        let store = HistoryStore::new(10);
        store.record(make_reading("a", 1.0));
        let current = make_reading("a", 2.0);
        let snap = store.record(Arc::clone(&current));
        let recent = snap.recent_with(&current);
        assert_eq!(recent.len(), 2);
        assert!(Arc::ptr_eq(recent.last().unwrap(), &current));
    }

    #[test]
    fn concurrent_writers_on_separate_streams() {
        let store = HistoryStore::new(50);
        std::thread::scope(|s| {
            for stream in ["a", "b", "c", "d"] {
                let store = &store;
                s.spawn(move || {
                    for t in 0..100 {
                        store.record(make_reading(stream, t as f64));
                    }
                });
            }
        });
        assert_eq!(store.stream_count(), 4);
        for stream in ["a", "b", "c", "d"] {
            let snap = store.snapshot(stream);
            assert_eq!(snap.prior.len(), 50);
            assert_eq!(snap.previous.unwrap().temperature, Some(99.0));
        }
    }
}
