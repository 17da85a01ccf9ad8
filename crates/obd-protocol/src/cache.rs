//! Typed caches for DTC descriptions and PID readings

use crate::dtc::{normalize_dtc_code, DtcInfo};
use crate::pid::DecodedValue;
use obd_cache::{CacheStats, ResultCache};
use std::time::Duration;

/// DTC descriptions keyed by normalized code
pub struct DtcDescriptionCache {
    cache: ResultCache<DtcInfo>,
}

impl DtcDescriptionCache {
    pub const DEFAULT_MAX_SIZE: usize = 5000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_SIZE, Self::DEFAULT_TTL)
    }

    pub fn with_capacity(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: ResultCache::new(max_size, ttl),
        }
    }

    pub fn get(&self, code: &str) -> Option<DtcInfo> {
        self.cache.get(&normalize_dtc_code(code))
    }

    pub fn insert(&self, info: DtcInfo) {
        self.cache.set(normalize_dtc_code(&info.code), info);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl Default for DtcDescriptionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest PID readings keyed by `<vehicle id>:<pid name>`
pub struct PidValueCache {
    cache: ResultCache<DecodedValue>,
}

impl PidValueCache {
    pub const DEFAULT_MAX_SIZE: usize = 1000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_SIZE, Self::DEFAULT_TTL)
    }

    pub fn with_capacity(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: ResultCache::new(max_size, ttl),
        }
    }

    fn key(vehicle_id: &str, pid_name: &str) -> String {
        format!("{vehicle_id}:{pid_name}")
    }

    pub fn get(&self, vehicle_id: &str, pid_name: &str) -> Option<DecodedValue> {
        self.cache.get(&Self::key(vehicle_id, pid_name))
    }

    /// Store a reading under its own PID name
    pub fn insert(&self, vehicle_id: &str, value: DecodedValue) {
        self.cache.set(Self::key(vehicle_id, &value.name), value);
    }

    /// Store with a TTL matched to how often the PID is polled
    pub fn insert_with_ttl(&self, vehicle_id: &str, value: DecodedValue, ttl: Duration) {
        self.cache
            .set_with_ttl(Self::key(vehicle_id, &value.name), value, ttl);
    }

    pub fn invalidate(&self, vehicle_id: &str, pid_name: &str) -> Option<DecodedValue> {
        self.cache.remove(&Self::key(vehicle_id, pid_name))
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl Default for PidValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtc::DtcCatalog;

    fn reading(name: &str, value: f64) -> DecodedValue {
        DecodedValue {
            mode: 0x01,
            pid: 0x0C,
            name: name.to_string(),
            unit: Some("rpm".to_string()),
            value,
            raw_bytes: vec![0x1A, 0xF8],
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_dtc_cache_normalizes_keys() {
        let cache = DtcDescriptionCache::new();
        cache.insert(DtcCatalog::standard().describe("P0420"));

        let hit = cache.get(" p0420 ").unwrap();
        assert_eq!(hit.code, "P0420");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_pid_cache_is_per_vehicle() {
        let cache = PidValueCache::new();
        cache.insert("vehicle-1", reading("Engine RPM", 1726.0));

        assert_eq!(cache.get("vehicle-1", "Engine RPM").unwrap().value, 1726.0);
        assert!(cache.get("vehicle-2", "Engine RPM").is_none());
        assert!(cache.invalidate("vehicle-1", "Engine RPM").is_some());
        assert!(cache.get("vehicle-1", "Engine RPM").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pid_cache_ttl() {
        let cache = PidValueCache::new();
        cache.insert_with_ttl("vehicle-1", reading("Engine RPM", 800.0), Duration::from_millis(250));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(cache.get("vehicle-1", "Engine RPM").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }
}
