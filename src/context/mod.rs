//! Scope-local pipeline context — timers, metrics, items, and baggage.
//!
//! A [`PipelineContext`] is created when a scope starts and shared by every
//! dispatch inside that scope, including nested sends issued from inside
//! handlers. It carries:
//!
//! - **Timings** — spans recorded by [`TimerScope`]s.
//! - **Metrics** — named aggregates (count/total/min/max, derived average).
//! - **Items** — an arbitrary string-keyed bag of shared values.
//! - **Baggage** — a string-to-string map stored inside the items bag,
//!   used for flow-through values such as request ids.
//! - **Causality chain** — parent/child request edges recorded by the
//!   causality stage (see [`causality`]).
//!
//! Timings, metrics, and the causality chain are guarded by a single mutex
//! per context; snapshot accessors return copies so callers can iterate
//! without holding the lock. The items bag is a separate read-write lock
//! with no ordering guarantees beyond what callers establish themselves.

pub mod causality;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use causality::CausalityEntry;

/// Reserved items key under which the baggage map is stored.
pub const BAGGAGE_ITEM_KEY: &str = "courier.baggage";

/// Reserved items key holding the id of the request currently in flight,
/// maintained by the causality stage.
pub const CURRENT_REQUEST_ID_ITEM_KEY: &str = "courier.current-request-id";

/// Baggage key consulted by the causality stage when seeding the root
/// request id of a scope.
pub const REQUEST_ID_BAGGAGE_KEY: &str = "request_id";

type BaggageStore = RwLock<HashMap<String, String>>;

/// A recorded timing span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingEntry {
    /// Name the timer was started with.
    pub name: String,
    /// Elapsed wall-clock time between start and first stop.
    pub elapsed: Duration,
    /// Wall-clock instant the timer was started at.
    pub started_at: SystemTime,
}

/// Snapshot of one named metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Number of recorded observations.
    pub count: u64,
    /// Sum of all observed values.
    pub total: f64,
    /// Smallest observed value.
    pub min: f64,
    /// Largest observed value.
    pub max: f64,
    /// `total / count`, or `0` when nothing has been recorded.
    pub average: f64,
}

// Live aggregate for one metric name. min/max are meaningless until the
// first observation folds in.
#[derive(Debug, Clone, Copy, Default)]
struct Metric {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
}

impl Metric {
    fn fold(&mut self, count_delta: u64, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += count_delta;
        self.total += value;
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            count: self.count,
            total: self.total,
            min: self.min,
            max: self.max,
            average: if self.count == 0 {
                0.0
            } else {
                self.total / self.count as f64
            },
        }
    }
}

#[derive(Default)]
struct Aggregates {
    timings: Vec<TimingEntry>,
    metrics: HashMap<String, Metric>,
    causality: Vec<CausalityEntry>,
}

/// Scope-local, thread-safe telemetry and state bag.
pub struct PipelineContext {
    aggregates: Mutex<Aggregates>,
    items: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    /// Creates an empty context with an empty baggage map pre-installed
    /// under [`BAGGAGE_ITEM_KEY`].
    pub fn new() -> Self {
        let mut items: HashMap<String, Arc<dyn Any + Send + Sync>> = HashMap::new();
        items.insert(
            BAGGAGE_ITEM_KEY.to_string(),
            Arc::new(BaggageStore::default()),
        );
        Self {
            aggregates: Mutex::new(Aggregates::default()),
            items: RwLock::new(items),
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────

    /// Starts a named timer. The stopwatch starts immediately.
    ///
    /// The returned [`TimerScope`] records exactly one [`TimingEntry`] on
    /// its first [`stop`](TimerScope::stop) (or on drop), no matter how
    /// many times it is stopped afterwards. The timer holds only a weak
    /// reference to this context and never extends its lifetime.
    pub fn start_timer(self: &Arc<Self>, name: impl Into<String>) -> TimerScope {
        TimerScope {
            name: name.into(),
            context: Arc::downgrade(self),
            started_at: SystemTime::now(),
            started: Instant::now(),
            recorded: None,
        }
    }

    /// Returns a snapshot copy of all recorded timings.
    pub fn timings(&self) -> Vec<TimingEntry> {
        self.aggregates.lock().timings.clone()
    }

    pub(crate) fn record_timing(&self, entry: TimingEntry) {
        self.aggregates.lock().timings.push(entry);
    }

    // ── Metrics ───────────────────────────────────────────────────────────

    /// Adds 1 to the metric's count and total.
    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    /// Adds `delta` to both the metric's count and its total; `delta` also
    /// folds into min/max.
    pub fn increment_by(&self, name: &str, delta: u64) {
        self.aggregates
            .lock()
            .metrics
            .entry(name.to_string())
            .or_default()
            .fold(delta, delta as f64);
    }

    /// Records one observation: count advances by 1, total by `value`, and
    /// `value` folds into min/max.
    pub fn record(&self, name: &str, value: f64) {
        self.aggregates
            .lock()
            .metrics
            .entry(name.to_string())
            .or_default()
            .fold(1, value);
    }

    /// Returns a snapshot of all metrics with derived averages.
    pub fn metrics(&self) -> HashMap<String, MetricSnapshot> {
        self.aggregates
            .lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.snapshot()))
            .collect()
    }

    // ── Items ─────────────────────────────────────────────────────────────

    /// Stores a shared value under a string key. Keys are case-sensitive;
    /// the last write wins.
    pub fn set_item<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.items.write().insert(key.into(), Arc::new(value));
    }

    /// Looks up an item by key, downcast to `T`. Returns `None` when the
    /// key is absent or holds a value of a different type.
    pub fn item<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.items.read().get(key)?.clone();
        value.downcast::<T>().ok()
    }

    /// Removes an item. Returns `true` if the key was present.
    pub fn remove_item(&self, key: &str) -> bool {
        self.items.write().remove(key).is_some()
    }

    // ── Baggage ───────────────────────────────────────────────────────────

    /// Sets a baggage value. Last write wins.
    pub fn set_baggage(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(store) = self.baggage_store() {
            store.write().insert(key.into(), value.into());
        }
    }

    /// Looks up a baggage value.
    pub fn baggage(&self, key: &str) -> Option<String> {
        self.baggage_store()?.read().get(key).cloned()
    }

    /// Returns a snapshot copy of all baggage entries.
    pub fn all_baggage(&self) -> HashMap<String, String> {
        self.baggage_store()
            .map(|store| store.read().clone())
            .unwrap_or_default()
    }

    // The baggage map is installed at construction; it can only be absent
    // if a user overwrote the reserved key with a foreign value.
    fn baggage_store(&self) -> Option<Arc<BaggageStore>> {
        self.item::<BaggageStore>(BAGGAGE_ITEM_KEY)
    }

    // ── Causality ─────────────────────────────────────────────────────────

    /// Returns a snapshot copy of the causality chain in recording order.
    pub fn causality_chain(&self) -> Vec<CausalityEntry> {
        self.aggregates.lock().causality.clone()
    }

    pub(crate) fn record_causality(&self, entry: CausalityEntry) {
        self.aggregates.lock().causality.push(entry);
    }
}

/// A running stopwatch attached to a context.
///
/// Records one [`TimingEntry`] on the first call to [`stop`](Self::stop);
/// dropping an unstopped timer stops it. Stopping is idempotent.
pub struct TimerScope {
    name: String,
    context: Weak<PipelineContext>,
    started_at: SystemTime,
    started: Instant,
    recorded: Option<Duration>,
}

impl TimerScope {
    /// Current elapsed time — live while running, frozen after stop.
    pub fn elapsed(&self) -> Duration {
        self.recorded.unwrap_or_else(|| self.started.elapsed())
    }

    /// Stops the timer and records its timing entry. Subsequent calls do
    /// nothing.
    pub fn stop(&mut self) {
        if self.recorded.is_some() {
            return;
        }
        let elapsed = self.started.elapsed();
        self.recorded = Some(elapsed);
        if let Some(context) = self.context.upgrade() {
            context.record_timing(TimingEntry {
                name: self.name.clone(),
                elapsed,
                started_at: self.started_at,
            });
        }
    }
}

impl Drop for TimerScope {
    fn drop(&mut self) {
        self.stop();
    }
}
