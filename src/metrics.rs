// ============================================================================
// Metrics Aggregator
// ============================================================================
//
// In-process request counters served as JSON by the admin surface. Reset
// swaps in a freshly constructed aggregator atomically, so readers racing a
// reset see either the old totals or a clean slate, never a half-cleared
// one.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::{json, Value};

#[derive(Default)]
struct RouteStats {
    count: u64,
    errors: u64,
    latency_ms_sum: u64,
    by_status: HashMap<u16, u64>,
}

#[derive(Default)]
struct MetricsData {
    total_requests: u64,
    total_errors: u64,
    total_latency_ms: u64,
    per_route: HashMap<String, RouteStats>,
}

struct MetricsInner {
    started_at: Instant,
    data: Mutex<MetricsData>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            data: Mutex::new(MetricsData::default()),
        }
    }
}

pub struct Metrics {
    inner: RwLock<Arc<MetricsInner>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(MetricsInner::new())),
        }
    }

    fn current(&self) -> Arc<MetricsInner> {
        self.inner.read().expect("metrics lock poisoned").clone()
    }

    /// Record one finished request against its matched route pattern (or a
    /// synthetic label such as "unmatched").
    pub fn record(&self, route: &str, status: u16, latency_ms: u64) {
        let inner = self.current();
        let mut data = inner.data.lock().expect("metrics lock poisoned");

        data.total_requests += 1;
        data.total_latency_ms += latency_ms;
        if status >= 400 {
            data.total_errors += 1;
        }

        let stats = data.per_route.entry(route.to_string()).or_default();
        stats.count += 1;
        stats.latency_ms_sum += latency_ms;
        if status >= 400 {
            stats.errors += 1;
        }
        *stats.by_status.entry(status).or_insert(0) += 1;
    }

    pub fn summary(&self) -> Value {
        let inner = self.current();
        let data = inner.data.lock().expect("metrics lock poisoned");

        let avg_latency = if data.total_requests > 0 {
            data.total_latency_ms as f64 / data.total_requests as f64
        } else {
            0.0
        };
        let error_rate = if data.total_requests > 0 {
            data.total_errors as f64 / data.total_requests as f64
        } else {
            0.0
        };

        json!({
            "uptimeSecs": inner.started_at.elapsed().as_secs(),
            "totalRequests": data.total_requests,
            "totalErrors": data.total_errors,
            "errorRate": error_rate,
            "avgLatencyMs": avg_latency,
        })
    }

    /// Full dump: the summary plus the per-route breakdown.
    pub fn dump(&self) -> Value {
        let summary = self.summary();
        let inner = self.current();
        let data = inner.data.lock().expect("metrics lock poisoned");

        let routes: HashMap<&String, Value> = data
            .per_route
            .iter()
            .map(|(route, stats)| {
                let avg = if stats.count > 0 {
                    stats.latency_ms_sum as f64 / stats.count as f64
                } else {
                    0.0
                };
                let by_status: HashMap<String, u64> = stats
                    .by_status
                    .iter()
                    .map(|(status, count)| (status.to_string(), *count))
                    .collect();
                (
                    route,
                    json!({
                        "count": stats.count,
                        "errors": stats.errors,
                        "avgLatencyMs": avg,
                        "byStatus": by_status,
                    }),
                )
            })
            .collect();

        json!({
            "summary": summary,
            "routes": routes,
        })
    }

    /// Swap in a fresh aggregator.
    pub fn reset(&self) {
        let mut guard = self.inner.write().expect("metrics lock poisoned");
        *guard = Arc::new(MetricsInner::new());
        tracing::info!("metrics aggregator reset");
    }
}
