//! Prediction cache keyed by a coarse reading fingerprint.
//!
//! Near-identical readings (after rounding) share one entry, so callers that
//! need an exact recomputation must bypass the cache. Entries expire lazily on
//! `get`; a full cache drops its oldest fifth before inserting a new key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::{DetectionVerdict, Field, Reading};

/// Default TTL for cached verdicts.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default maximum number of entries.
pub const DEFAULT_MAX_SIZE: usize = 1_000;

const FINGERPRINT_LEN: usize = 16;

#[derive(Debug)]
struct CacheEntry {
    verdict: Arc<DetectionVerdict>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
}

/// Bounded TTL cache of detection verdicts.
pub struct PredictionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache key for a reading scored by `model`: blake3 over the model name and
/// the rounded temperature, humidity, voltage, battery and VPD. Absent fields
/// round as zero.
pub fn fingerprint(reading: &Reading, model: &str) -> String {
    let canonical = format!(
        "{model}|{}|{}|{}|{}|{}",
        round_to(reading.value_or(Field::Temperature, 0.0), 10.0),
        round_to(reading.value_or(Field::Humidity, 0.0), 10.0),
        round_to(reading.value_or(Field::Voltage, 0.0), 100.0),
        round_to(reading.value_or(Field::BatteryLevel, 0.0), 1.0),
        round_to(reading.value_or(Field::Vpd, 0.0), 100.0),
    );
    let hash = blake3::hash(canonical.as_bytes());
    hash.to_hex()[..FINGERPRINT_LEN].to_string()
}

fn round_to(value: f64, scale: f64) -> f64 {
    // Adding 0.0 folds -0.0 into 0.0 so both format the same
    (value * scale).round() / scale + 0.0
}

impl PredictionCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Lock the map. A poisoned map may be half-updated, so it is cleared.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Prediction cache lock poisoned, clearing cache");
            let mut guard = poisoned.into_inner();
            guard.clear();
            self.entries.clear_poison();
            guard
        })
    }

    pub fn get(&self, key: &str) -> Option<Arc<DetectionVerdict>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Arc<DetectionVerdict>> {
        let mut entries = self.lock();
        let fresh = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) < self.ttl => {
                Some(Arc::clone(&entry.verdict))
            }
            Some(_) => {
                entries.remove(key);
                debug!(key, "Cache entry expired");
                None
            }
            None => None,
        };
        drop(entries);

        match fresh {
            Some(verdict) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(verdict)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, verdict: Arc<DetectionVerdict>) {
        self.put_at(key, verdict, Instant::now());
    }

    fn put_at(&self, key: String, verdict: Arc<DetectionVerdict>, now: Instant) {
        let mut entries = self.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let evicted = evict_oldest(&mut entries, (self.max_size / 5).max(1));
            debug!(evicted, "Prediction cache full, evicted oldest entries");
        }
        entries.insert(
            key,
            CacheEntry {
                verdict,
                inserted_at: now,
            },
        );
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Cache hit rate (0.0–1.0).
    pub fn hit_rate(&self) -> f64 {
        let h = self.hits() as f64;
        let total = h + self.misses() as f64;
        if total == 0.0 { 0.0 } else { h / total }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_rate(),
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }
}

fn evict_oldest(entries: &mut HashMap<String, CacheEntry>, count: usize) -> usize {
    let mut by_age: Vec<(Instant, String)> = entries
        .iter()
        .map(|(k, e)| (e.inserted_at, k.clone()))
        .collect();
    by_age.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let mut removed = 0;
    for (_, key) in by_age.into_iter().take(count) {
        entries.remove(&key);
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::score::{combine, CombinerConfig};
    use crate::core::MlStatus;
    use chrono::Utc;

    fn make_verdict() -> Arc<DetectionVerdict> {
        Arc::new(combine(vec![], vec![], MlStatus::Skipped, &[], &CombinerConfig::default()))
    }

    fn make_reading(temp: f64, humidity: f64, voltage: f64) -> Reading {
        Reading::new("GH001", Utc::now())
            .with(Field::Temperature, temp)
            .with(Field::Humidity, humidity)
            .with(Field::Voltage, voltage)
    }

    #[test]
    fn put_then_get_round_trip() {
        let cache = PredictionCache::default();
        let verdict = make_verdict();
        cache.put("k".into(), Arc::clone(&verdict));
        let hit = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&hit, &verdict));
        assert_eq!(cache.hits(), 1);
        assert!(cache.get("other").is_none());
        assert_eq!(cache.misses(), 1);
        assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn expired_entries_miss_and_are_dropped() {
        let cache = PredictionCache::new(Duration::from_secs(300), 10);
        let start = Instant::now();
        cache.put_at("k".into(), make_verdict(), start);

        assert!(cache.get_at("k", start + Duration::from_secs(299)).is_some());
        assert!(cache.get_at("k", start + Duration::from_secs(300)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn never_exceeds_max_size() {
        let cache = PredictionCache::new(DEFAULT_TTL, 10);
        let verdict = make_verdict();
        for i in 0..=10 {
            cache.put(format!("k{i}"), Arc::clone(&verdict));
            assert!(cache.len() <= 10);
        }
        // Full at 10, the 11th insert drops 10/5 = 2 first
        assert_eq!(cache.len(), 9);
    }

    #[test]
    fn evicts_oldest_fifth() {
        let cache = PredictionCache::new(DEFAULT_TTL, 5);
        let start = Instant::now();
        for i in 0..5u64 {
            cache.put_at(format!("k{i}"), make_verdict(), start + Duration::from_secs(i));
        }
        cache.put_at("new".into(), make_verdict(), start + Duration::from_secs(10));
        let now = start + Duration::from_secs(11);
        assert!(cache.get_at("k0", now).is_none());
        for i in 1..5 {
            assert!(cache.get_at(&format!("k{i}"), now).is_some(), "k{i} should survive");
        }
        assert!(cache.get_at("new", now).is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = PredictionCache::new(DEFAULT_TTL, 2);
        cache.put("a".into(), make_verdict());
        cache.put("b".into(), make_verdict());
        cache.put("a".into(), make_verdict());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn near_duplicates_share_a_fingerprint() {
        let a = make_reading(25.01, 65.04, 3.301);
        let b = make_reading(24.99, 64.96, 3.299);
        assert_eq!(fingerprint(&a, "gbm"), fingerprint(&b, "gbm"));
        assert_eq!(fingerprint(&a, "gbm").len(), 16);

        let c = make_reading(25.2, 65.0, 3.3);
        assert_ne!(fingerprint(&a, "gbm"), fingerprint(&c, "gbm"));
    }

    #[test]
    fn fingerprint_separates_models() {
        let a = make_reading(25.0, 65.0, 3.3);
        assert_ne!(fingerprint(&a, "gradient_boosting"), fingerprint(&a, "isolation_forest"));
    }

    #[test]
    fn fingerprint_ignores_sensor_and_unrounded_fields() {
        let a = make_reading(25.0, 65.0, 3.3).with(Field::Co2, 400.0);
        let mut b = make_reading(25.0, 65.0, 3.3).with(Field::Co2, 1900.0);
        b.sensor_id = "GH002".into();
        assert_eq!(fingerprint(&a, "gbm"), fingerprint(&b, "gbm"));
    }

    #[test]
    fn clear_and_stats() {
        let cache = PredictionCache::new(Duration::from_secs(60), 100);
        cache.put("a".into(), make_verdict());
        cache.get("a");
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 100);
        assert_eq!(stats.ttl_seconds, 60);
        assert_eq!(stats.hits, 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn poisoned_lock_clears_cache() {
        let cache = PredictionCache::default();
        cache.put("a".into(), make_verdict());
        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let _guard = cache.entries.lock().unwrap();
                panic!("poison the cache");
            });
            assert!(handle.join().is_err());
        });
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
        cache.put("b".into(), make_verdict());
        assert!(cache.get("b").is_some());
    }
}
