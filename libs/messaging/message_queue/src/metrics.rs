//! Queue Metrics
//!
//! Lock-free counters, meters and timers for message queue readers and
//! writers, registered by dotted name in a [`MetricsRegistry`].
//!
//! Each queue direction owns a [`QueueMetrics`] with four instruments:
//!
//! - `<prefix>.<broker>.<queue>.<direction>.messages`: message meter
//! - `<prefix>.<broker>.<queue>.<direction>.byte-count`: byte counter
//! - `<prefix>.<broker>.<queue>.<direction>.bytes`: byte meter
//! - `<prefix>.<broker>.<queue>.<direction>.reads|writes`: operation timer
//!
//! The message and byte instruments are only updated through the
//! [`MessageInterceptor`] handed to the broker, so every message crossing the
//! broker boundary is counted exactly once.

use crate::broker::MessageInterceptor;
use crate::error::QueueError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Event counter with a mean rate since creation
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    started: Instant,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Events per second since the meter was created
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }
}

/// Duration recorder
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Start timing; the elapsed time is recorded when the context drops
    pub fn time(&self) -> TimerContext<'_> {
        TimerContext {
            timer: self,
            started: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.load(Ordering::Relaxed))
    }

    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / count)
    }
}

#[must_use = "the timer records when the context is dropped"]
pub struct TimerContext<'a> {
    timer: &'a Timer,
    started: Instant,
}

impl Drop for TimerContext<'_> {
    fn drop(&mut self) {
        self.timer.record(self.started.elapsed());
    }
}

/// Point-in-time value of one registered instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Counter {
        count: u64,
    },
    Meter {
        count: u64,
        mean_rate: f64,
    },
    Timer {
        count: u64,
        mean_ns: u64,
        max_ns: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }
}

/// Process-wide collection of named instruments
///
/// Lookups are get-or-create, so two queues asking for the same name share
/// the instrument.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Arc<Counter>>,
    meters: DashMap<String, Arc<Meter>>,
    timers: DashMap<String, Arc<Timer>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters.entry(name.to_string()).or_default().clone()
    }

    pub fn meter(&self, name: &str) -> Arc<Meter> {
        self.meters.entry(name.to_string()).or_default().clone()
    }

    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.timers.entry(name.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut metrics = BTreeMap::new();
        for item in self.counters.iter() {
            metrics.insert(
                item.key().clone(),
                MetricValue::Counter {
                    count: item.value().count(),
                },
            );
        }
        for item in self.meters.iter() {
            metrics.insert(
                item.key().clone(),
                MetricValue::Meter {
                    count: item.value().count(),
                    mean_rate: item.value().mean_rate(),
                },
            );
        }
        for item in self.timers.iter() {
            let timer = item.value();
            metrics.insert(
                item.key().clone(),
                MetricValue::Timer {
                    count: timer.count(),
                    mean_ns: u64::try_from(timer.mean().as_nanos()).unwrap_or(u64::MAX),
                    max_ns: u64::try_from(timer.max().as_nanos()).unwrap_or(u64::MAX),
                },
            );
        }
        MetricsSnapshot { metrics }
    }

    pub fn export_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Reader,
    Writer,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Reader => "reader",
            Direction::Writer => "writer",
        }
    }

    fn timer_suffix(self) -> &'static str {
        match self {
            Direction::Reader => "reads",
            Direction::Writer => "writes",
        }
    }
}

/// Instruments for one direction of one named queue
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    base_name: String,
    messages: Arc<Meter>,
    byte_count: Arc<Counter>,
    bytes: Arc<Meter>,
    timer: Arc<Timer>,
}

impl QueueMetrics {
    pub fn new(
        registry: &MetricsRegistry,
        prefix: &str,
        broker: &str,
        queue: &str,
        direction: Direction,
    ) -> Self {
        let base_name = format!("{}.{}.{}.{}", prefix, broker, queue, direction.as_str());
        Self {
            messages: registry.meter(&format!("{}.messages", base_name)),
            byte_count: registry.counter(&format!("{}.byte-count", base_name)),
            bytes: registry.meter(&format!("{}.bytes", base_name)),
            timer: registry.timer(&format!("{}.{}", base_name, direction.timer_suffix())),
            base_name,
        }
    }

    /// Dotted name shared by all instruments, e.g. `message-queue.memory.events.reader`
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Count one message of `length` payload bytes
    #[inline]
    pub fn record_message(&self, length: usize) {
        let length = length as u64;
        self.messages.mark(1);
        self.byte_count.inc(length);
        self.bytes.mark(length);
    }

    /// Broker hook that counts every message passing the broker boundary
    pub fn interceptor(&self) -> MessageInterceptor {
        let metrics = self.clone();
        Arc::new(move |length| metrics.record_message(length))
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn messages(&self) -> u64 {
        self.messages.count()
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.count()
    }

    pub fn bytes_meter(&self) -> &Meter {
        &self.bytes
    }
}
