//! Request metrics: a counter pair updated by every request and drained on a
//! fixed interval into the `System_Metrics` table.
//!
//! Both counters live behind one mutex so a drain reads and resets them as a
//! single step; a concurrent `record` lands entirely before or after it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::backend::{SystemMetricRecord, TableStore, METRICS_TABLE};

#[derive(Debug, Default)]
struct Counters {
    request_count: u64,
    total_response_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    /// Mean request duration in seconds.
    pub avg_response_time: f64,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    counters: Mutex<Counters>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, duration: Duration) {
        let mut counters = self.counters.lock().await;
        counters.request_count += 1;
        counters.total_response_time += duration;
    }

    /// Takes the accumulated counters and resets them. `None` when nothing was
    /// recorded since the last drain.
    pub async fn drain(&self) -> Option<MetricsSnapshot> {
        let taken = std::mem::take(&mut *self.counters.lock().await);
        if taken.request_count == 0 {
            return None;
        }
        Some(MetricsSnapshot {
            request_count: taken.request_count,
            avg_response_time: taken.total_response_time.as_secs_f64()
                / taken.request_count as f64,
        })
    }
}

/// Times every request passing through the router.
pub async fn track_request(
    State(metrics): State<Arc<MetricsAggregator>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    metrics.record(start.elapsed()).await;
    response
}

/// Drains the aggregator once and writes a metric row. Write failures are
/// logged and dropped; the counters are already reset either way.
pub async fn flush_once(
    metrics: &MetricsAggregator,
    sink: &dyn TableStore,
) -> Option<SystemMetricRecord> {
    let snapshot = metrics.drain().await?;

    let record = SystemMetricRecord {
        timestamp: Utc::now(),
        request_count: snapshot.request_count,
        avg_response_time: snapshot.avg_response_time,
        model_uptime_status: "active".to_string(),
    };

    let row = match serde_json::to_value(&record) {
        Ok(row) => row,
        Err(e) => {
            tracing::warn!("Dropping metrics for this interval: {}", e);
            return None;
        }
    };

    match sink.insert(METRICS_TABLE, row).await {
        Ok(()) => {
            tracing::debug!(
                "Flushed metrics: {} requests, avg {:.4}s",
                record.request_count,
                record.avg_response_time
            );
            Some(record)
        }
        Err(e) => {
            tracing::warn!("Metrics flush failed (non-fatal): {}", e);
            None
        }
    }
}

pub async fn run_metrics_flush_loop(
    metrics: Arc<MetricsAggregator>,
    sink: Arc<dyn TableStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    tracing::info!("Metrics flush loop started (interval: {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_once(&metrics, sink.as_ref()).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics flush loop shutting down");
                break;
            }
        }
    }
}
