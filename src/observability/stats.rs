//! Per-endpoint statistics
//!
//! Each `(method, endpoint)` key owns an accumulator updated once per admitted
//! request hit. Durations live in a bounded window kept twice: a FIFO for
//! eviction order and a counted multiset for ordered statistics, so an update
//! costs O(log n) and min/max/percentiles never re-sort.
//!
//! Entries are mutated only through [`StatsTable::record`], serialized per key
//! by the map's shard lock. Readers get point-in-time copies.

use crate::observability::model::RequestHit;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Bounded window of recent durations (microseconds)
#[derive(Debug, Clone)]
struct DurationWindow {
    order: VecDeque<(Instant, u64)>,
    counts: BTreeMap<u64, u32>,
    sum: u128,
    capacity: usize,
    max_age: Option<Duration>,
}

impl DurationWindow {
    fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            order: VecDeque::new(),
            counts: BTreeMap::new(),
            sum: 0,
            capacity: capacity.max(1),
            max_age,
        }
    }

    fn push(&mut self, now: Instant, micros: u64) {
        self.expire(now);
        if self.order.len() == self.capacity {
            self.pop_oldest();
        }
        self.order.push_back((now, micros));
        *self.counts.entry(micros).or_insert(0) += 1;
        self.sum += micros as u128;
    }

    /// Drop durations older than the configured maximum age
    fn expire(&mut self, now: Instant) {
        let Some(max_age) = self.max_age else {
            return;
        };
        while let Some(&(at, _)) = self.order.front() {
            if now.saturating_duration_since(at) <= max_age {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((_, micros)) = self.order.pop_front() {
            if let Some(count) = self.counts.get_mut(&micros) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&micros);
                }
            }
            self.sum -= micros as u128;
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn min(&self) -> Option<u64> {
        self.counts.keys().next().copied()
    }

    fn max(&self) -> Option<u64> {
        self.counts.keys().next_back().copied()
    }

    fn mean(&self) -> Option<f64> {
        if self.order.is_empty() {
            None
        } else {
            Some(self.sum as f64 / self.order.len() as f64)
        }
    }

    /// Nearest-rank quantile
    fn quantile(&self, q: f64) -> Option<u64> {
        let total = self.order.len();
        if total == 0 {
            return None;
        }
        let rank = ((q * total as f64).ceil() as usize).clamp(1, total);
        let mut seen = 0usize;
        for (&micros, &count) in &self.counts {
            seen += count as usize;
            if seen >= rank {
                return Some(micros);
            }
        }
        self.max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EndpointKey {
    method: String,
    path: String,
}

#[derive(Debug, Clone)]
struct Accumulator {
    count: u64,
    error_count: u64,
    status_codes: BTreeMap<u16, u64>,
    last_hit: Option<DateTime<Utc>>,
    window: DurationWindow,
}

/// Counts per status class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusClasses {
    pub informational: u64,
    pub success: u64,
    pub redirect: u64,
    pub client_error: u64,
    pub server_error: u64,
}

/// Point-in-time statistics for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub method: String,
    pub path: String,
    pub count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub status_classes: StatusClasses,
    /// Number of durations currently in the window
    pub window_len: usize,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub last_hit: Option<DateTime<Utc>>,
}

/// Aggregate across all endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub endpoint_count: usize,
    pub total_hits: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub success_rate: f64,
    /// Mean over every duration currently held in the endpoint windows
    pub mean_duration_ms: Option<f64>,
}

impl StatsSummary {
    pub fn from_endpoints(endpoints: &[EndpointStats]) -> Self {
        let total_hits: u64 = endpoints.iter().map(|e| e.count).sum();
        let total_errors: u64 = endpoints.iter().map(|e| e.error_count).sum();
        let total_success = total_hits - total_errors;

        let (weighted, samples) = endpoints
            .iter()
            .filter_map(|e| e.mean_ms.map(|mean| (mean * e.window_len as f64, e.window_len)))
            .fold((0.0, 0usize), |(sum, n), (w, len)| (sum + w, n + len));

        Self {
            endpoint_count: endpoints.len(),
            total_hits,
            total_success,
            total_errors,
            success_rate: ratio(total_success, total_hits),
            mean_duration_ms: (samples > 0).then(|| weighted / samples as f64),
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

impl Accumulator {
    fn new(window: usize, max_age: Option<Duration>) -> Self {
        Self {
            count: 0,
            error_count: 0,
            status_codes: BTreeMap::new(),
            last_hit: None,
            window: DurationWindow::new(window, max_age),
        }
    }

    fn snapshot(&self, key: &EndpointKey) -> EndpointStats {
        let mut classes = StatusClasses::default();
        for (&status, &n) in &self.status_codes {
            match status / 100 {
                1 => classes.informational += n,
                2 => classes.success += n,
                3 => classes.redirect += n,
                4 => classes.client_error += n,
                _ => classes.server_error += n,
            }
        }

        let success_count = self.count - self.error_count;
        EndpointStats {
            method: key.method.clone(),
            path: key.path.clone(),
            count: self.count,
            success_count,
            error_count: self.error_count,
            success_rate: ratio(success_count, self.count),
            error_rate: ratio(self.error_count, self.count),
            status_codes: self.status_codes.clone(),
            status_classes: classes,
            window_len: self.window.len(),
            min_ms: self.window.min().map(micros_to_ms),
            max_ms: self.window.max().map(micros_to_ms),
            mean_ms: self.window.mean().map(|m| m / 1000.0),
            p50_ms: self.window.quantile(0.50).map(micros_to_ms),
            p95_ms: self.window.quantile(0.95).map(micros_to_ms),
            p99_ms: self.window.quantile(0.99).map(micros_to_ms),
            last_hit: self.last_hit,
        }
    }
}

/// Incrementally maintained statistics keyed by (method, endpoint)
#[derive(Debug)]
pub struct StatsTable {
    entries: DashMap<EndpointKey, Accumulator>,
    window: usize,
    max_age: Option<Duration>,
}

impl StatsTable {
    pub fn new(window: usize, max_age: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            max_age,
        }
    }

    pub fn record(&self, hit: &RequestHit) {
        let key = EndpointKey {
            method: hit.method.clone(),
            path: hit.endpoint().to_string(),
        };
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Accumulator::new(self.window, self.max_age));

        entry.count += 1;
        if hit.is_error() {
            entry.error_count += 1;
        }
        *entry.status_codes.entry(hit.status).or_insert(0) += 1;
        entry.last_hit = Some(match entry.last_hit {
            Some(last) if last > hit.timestamp => last,
            _ => hit.timestamp,
        });
        entry.window.push(Instant::now(), hit.duration_us);
    }

    pub fn get(&self, method: &str, path: &str) -> Option<EndpointStats> {
        let key = EndpointKey {
            method: method.to_string(),
            path: path.to_string(),
        };
        let now = Instant::now();
        self.entries.get_mut(&key).map(|mut entry| {
            entry.window.expire(now);
            entry.snapshot(&key)
        })
    }

    /// Copy of every endpoint, sorted by path then method
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        let now = Instant::now();
        let mut stats: Vec<EndpointStats> = self
            .entries
            .iter_mut()
            .map(|mut entry| {
                entry.window.expire(now);
                entry.snapshot(entry.key())
            })
            .collect();
        stats.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hit(method: &str, path: &str, status: u16, ms: u64) -> RequestHit {
        RequestHit::new(method, path, status, Duration::from_millis(ms))
    }

    #[test]
    fn test_counts_and_errors() {
        let table = StatsTable::new(100, None);
        for _ in 0..5 {
            table.record(&hit("GET", "/users", 200, 12));
        }
        table.record(&hit("GET", "/users", 500, 40));

        let stats = table.get("GET", "/users").unwrap();
        assert_eq!(stats.count, 6);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 5);
        assert_eq!(stats.status_codes[&200], 5);
        assert_eq!(stats.status_classes.server_error, 1);
        assert_eq!(stats.min_ms, Some(12.0));
        assert_eq!(stats.max_ms, Some(40.0));
        assert_eq!(stats.p50_ms, Some(12.0));
        assert_eq!(stats.p95_ms, Some(40.0));
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let table = StatsTable::new(1000, None);
        for ms in 1..=100 {
            table.record(&hit("GET", "/p", 200, ms));
        }

        let stats = table.get("GET", "/p").unwrap();
        assert_eq!(stats.p50_ms, Some(50.0));
        assert_eq!(stats.p95_ms, Some(95.0));
        assert_eq!(stats.p99_ms, Some(99.0));
        assert_eq!(stats.mean_ms, Some(50.5));
    }

    #[test]
    fn test_window_is_bounded_but_count_is_not() {
        let table = StatsTable::new(3, None);
        for ms in [100, 1, 2, 3] {
            table.record(&hit("GET", "/w", 200, ms));
        }

        let stats = table.get("GET", "/w").unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.window_len, 3);
        assert_eq!(stats.max_ms, Some(3.0));
    }

    #[test]
    fn test_window_ages_out() {
        let table = StatsTable::new(100, Some(Duration::from_millis(20)));
        table.record(&hit("GET", "/old", 200, 5));
        std::thread::sleep(Duration::from_millis(50));

        let stats = table.get("GET", "/old").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.window_len, 0);
        assert_eq!(stats.mean_ms, None);
    }

    #[test]
    fn test_route_template_groups_paths() {
        let table = StatsTable::new(10, None);
        for id in 1..=3 {
            let mut h = hit("GET", &format!("/users/{}", id), 200, 1);
            h.route = Some("/users/:id".to_string());
            table.record(&h);
        }

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("GET", "/users/:id").unwrap().count, 3);
    }

    #[test]
    fn test_summary() {
        let table = StatsTable::new(10, None);
        table.record(&hit("GET", "/a", 200, 10));
        table.record(&hit("GET", "/a", 404, 20));
        table.record(&hit("POST", "/b", 201, 30));

        let summary = StatsSummary::from_endpoints(&table.snapshot());
        assert_eq!(summary.endpoint_count, 2);
        assert_eq!(summary.total_hits, 3);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.mean_duration_ms, Some(20.0));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let table = Arc::new(StatsTable::new(50, None));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        table.record(&hit("GET", "/c", if i % 10 == 0 { 503 } else { 200 }, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = table.get("GET", "/c").unwrap();
        assert_eq!(stats.count, 1000);
        assert_eq!(stats.error_count, 100);
        assert_eq!(stats.window_len, 50);
    }
}
