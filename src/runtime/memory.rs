// ABOUTME: In-process reference runtime: priority dispatch, keyed concurrency, cancel-on,
// ABOUTME: ordinary retries with jittered backoff, and capped rate-limit deferrals
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::events::EventEnvelope;
use crate::runtime::{
    FunctionConfig, FunctionContext, FunctionHandler, RunRecord, RunStatus, RuntimeConfig, Step,
    Trigger,
};

/// Handle for publishing events into the runtime, cloned into each [`Step`].
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    inflight: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
}

impl EventSender {
    pub(crate) fn send(&self, event: EventEnvelope) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        // Receiver lives as long as the runtime; a send failure means the
        // runtime is shutting down and the event can be dropped.
        if self.tx.send(event).is_err() {
            finish_one(&self.inflight, &self.idle_notify);
        }
    }
}

/// Decrement the inflight count, waking idle waiters at zero.
fn finish_one(inflight: &AtomicUsize, idle_notify: &Notify) {
    if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle_notify.notify_waiters();
    }
}

struct RegisteredFunction {
    config: FunctionConfig,
    handler: FunctionHandler,
}

impl Clone for RegisteredFunction {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

struct ActiveRun {
    cancel_tx: watch::Sender<bool>,
    /// (cancel event name, match field, expected value from the trigger)
    matches: Vec<(String, String, serde_json::Value)>,
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct QueuedEvent {
    priority: u8,
    seq: u64,
    event: EventEnvelope,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    config: RuntimeConfig,
    functions: RwLock<Vec<RegisteredFunction>>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    inflight: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    seq: AtomicU64,
    runs: DashMap<Uuid, RunRecord>,
    active: DashMap<Uuid, ActiveRun>,
    permits: DashMap<String, Arc<Semaphore>>,
    gauges: DashMap<String, Gauge>,
}

/// In-process event-driven runtime implementing the durable-executor surface.
///
/// Not durable: state lives in memory, and a process exit loses queued
/// events. The production deployment runs the same functions on an external
/// durable executor; this runtime exists so the engine's concurrency,
/// cancellation, retry, and memoization semantics are real in tests.
#[derive(Clone)]
pub struct MemoryRuntime {
    inner: Arc<Inner>,
}

impl MemoryRuntime {
    /// Create a runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(config: RuntimeConfig) -> EngineResult<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                functions: RwLock::new(Vec::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                inflight: Arc::new(AtomicUsize::new(0)),
                idle_notify: Arc::new(Notify::new()),
                seq: AtomicU64::new(0),
                runs: DashMap::new(),
                active: DashMap::new(),
                permits: DashMap::new(),
                gauges: DashMap::new(),
            }),
        })
    }

    /// Register a function before calling [`Self::start`].
    pub fn register<F, Fut>(&self, config: FunctionConfig, handler: F)
    where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<()>> + Send + 'static,
    {
        let handler: FunctionHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        if let Ok(mut functions) = self.inner.functions.write() {
            functions.push(RegisteredFunction { config, handler });
        }
    }

    /// Start the dispatcher task.
    ///
    /// # Errors
    ///
    /// Returns an error when called more than once.
    pub async fn start(&self) -> EngineResult<()> {
        let rx = self
            .inner
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::internal("Runtime already started"))?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(dispatch_loop(inner, rx));
        Ok(())
    }

    /// Publish an event into the runtime.
    pub fn publish(&self, event: EventEnvelope) {
        self.sender().send(event);
    }

    /// Fire a cron-triggered function once, as the production scheduler
    /// would on its cron expression.
    ///
    /// # Errors
    ///
    /// Returns an error if no cron function with the given id is registered.
    pub fn invoke_cron(&self, function_id: &str) -> EngineResult<()> {
        let function = {
            let functions = self
                .inner
                .functions
                .read()
                .map_err(|_| EngineError::internal("Function registry poisoned"))?;
            functions
                .iter()
                .find(|f| {
                    f.config.id == function_id && matches!(f.config.trigger, Trigger::Cron { .. })
                })
                .cloned()
        };
        let function = function.ok_or_else(|| {
            EngineError::invalid_input(format!("No cron function registered: {function_id}"))
        })?;
        let tick = EventEnvelope {
            name: format!("{function_id}/cron.trigger"),
            data: serde_json::Value::Object(serde_json::Map::new()),
            sent_at: chrono::Utc::now(),
        };
        spawn_run(&self.inner, &function, tick);
        Ok(())
    }

    /// Wait until no events are queued and no runs are in flight.
    ///
    /// Work that spawns more work (continuations, refresh cycles) keeps the
    /// inflight count above zero until the whole cascade has settled, so
    /// this only returns at a true fixpoint.
    pub async fn await_idle(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of all run records
    #[must_use]
    pub fn run_records(&self) -> Vec<RunRecord> {
        self.inner.runs.iter().map(|r| r.value().clone()).collect()
    }

    /// Run records for one function
    #[must_use]
    pub fn records_for(&self, function_id: &str) -> Vec<RunRecord> {
        self.inner
            .runs
            .iter()
            .filter(|r| r.function_id == function_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Count of runs for a function that reached the given status
    #[must_use]
    pub fn count_with_status(&self, function_id: &str, status: RunStatus) -> usize {
        self.inner
            .runs
            .iter()
            .filter(|r| r.function_id == function_id && r.status == status)
            .count()
    }

    /// Peak observed concurrency for a function/key pair
    #[must_use]
    pub fn peak_concurrency(&self, function_id: &str, key_value: &str) -> usize {
        self.inner
            .gauges
            .get(&gauge_key(function_id, key_value))
            .map_or(0, |g| g.peak.load(Ordering::SeqCst))
    }

    fn sender(&self) -> EventSender {
        EventSender {
            tx: self.inner.tx.clone(),
            inflight: Arc::clone(&self.inner.inflight),
            idle_notify: Arc::clone(&self.inner.idle_notify),
        }
    }
}

fn gauge_key(function_id: &str, key_value: &str) -> String {
    format!("{function_id}:{key_value}")
}

fn key_value_of(payload: &serde_json::Value, field: &str) -> String {
    match payload.get(field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<EventEnvelope>) {
    let mut heap: BinaryHeap<QueuedEvent> = BinaryHeap::new();
    loop {
        while let Ok(event) = rx.try_recv() {
            push_event(&inner, &mut heap, event);
        }
        if heap.is_empty() {
            match rx.recv().await {
                Some(event) => {
                    push_event(&inner, &mut heap, event);
                    continue; // drain any siblings before dispatching
                }
                None => return,
            }
        }
        if let Some(queued) = heap.pop() {
            deliver(&inner, &queued.event);
        }
    }
}

fn push_event(inner: &Arc<Inner>, heap: &mut BinaryHeap<QueuedEvent>, event: EventEnvelope) {
    let priority = event_priority(inner, &event);
    let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
    heap.push(QueuedEvent {
        priority,
        seq,
        event,
    });
}

/// Priority 1 when any triggered function declares a priority field that is
/// true in the payload; 0 otherwise.
fn event_priority(inner: &Arc<Inner>, event: &EventEnvelope) -> u8 {
    let Ok(functions) = inner.functions.read() else {
        return 0;
    };
    let boosted = functions.iter().any(|f| {
        matches!(&f.config.trigger, Trigger::Event { name } if *name == event.name)
            && f.config
                .priority_field
                .as_ref()
                .and_then(|field| event.data.get(field))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    });
    u8::from(boosted)
}

fn deliver(inner: &Arc<Inner>, event: &EventEnvelope) {
    // Cancellation pass first: an uninstall must stop in-flight runs before
    // any newly triggered work observes the event. A continuation already
    // sitting in the queue at that point is not covered: it spawns a fresh,
    // uncancelled run after the uninstall. That run finds the connection row
    // gone and ends quietly at credential resolution.
    for entry in &inner.active {
        for (cancel_event, match_field, expected) in &entry.matches {
            if *cancel_event == event.name && event.data.get(match_field) == Some(expected) {
                debug!(event = %event.name, "Cancelling in-flight run");
                let _ = entry.cancel_tx.send(true);
            }
        }
    }

    let triggered: Vec<RegisteredFunction> = inner.functions.read().map_or_else(
        |_| Vec::new(),
        |functions| {
            functions
                .iter()
                .filter(|f| {
                    matches!(&f.config.trigger, Trigger::Event { name } if *name == event.name)
                })
                .cloned()
                .collect()
        },
    );
    for function in &triggered {
        spawn_run(inner, function, event.clone());
    }
    finish_one(&inner.inflight, &inner.idle_notify);
}

fn spawn_run(inner: &Arc<Inner>, function: &RegisteredFunction, event: EventEnvelope) {
    let run_id = Uuid::new_v4();
    inner.inflight.fetch_add(1, Ordering::SeqCst);
    inner.runs.insert(
        run_id,
        RunRecord {
            id: run_id,
            function_id: function.config.id.clone(),
            event_name: event.name.clone(),
            status: RunStatus::Running,
            error: None,
        },
    );
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let matches = function
        .config
        .cancel_on
        .iter()
        .filter_map(|c| {
            event
                .data
                .get(&c.match_field)
                .cloned()
                .map(|expected| (c.event.clone(), c.match_field.clone(), expected))
        })
        .collect();
    inner.active.insert(run_id, ActiveRun { cancel_tx, matches });

    let inner = Arc::clone(inner);
    let function = function.clone();
    tokio::spawn(async move {
        let status = execute_run(&inner, &function, &event, &cancel_rx).await;
        match &status {
            (RunStatus::Failed, Some(error)) => {
                warn!(function = %function.config.id, %error, "Run failed");
            }
            (RunStatus::Cancelled, _) => {
                info!(function = %function.config.id, "Run cancelled");
            }
            _ => {}
        }
        if let Some(mut record) = inner.runs.get_mut(&run_id) {
            record.status = status.0;
            record.error = status.1;
        }
        inner.active.remove(&run_id);
        finish_one(&inner.inflight, &inner.idle_notify);
    });
}

/// Holds the concurrency permit for a run and keeps the occupancy gauge
/// accurate when the run finishes on any path.
struct PermitGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    inner: Arc<Inner>,
    gauge: String,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(gauge) = self.inner.gauges.get(&self.gauge) {
            gauge.current.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Acquire the keyed concurrency permit, or `Err(())` when cancelled while
/// waiting.
async fn acquire_permit(
    inner: &Arc<Inner>,
    function: &RegisteredFunction,
    event: &EventEnvelope,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<Option<PermitGuard>, ()> {
    let Some(limit) = &function.config.concurrency else {
        return Ok(None);
    };
    let key = key_value_of(&event.data, &limit.key_field);
    let name = gauge_key(&function.config.id, &key);
    let semaphore = Arc::clone(
        &inner
            .permits
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit.limit))),
    );
    let acquired = tokio::select! {
        permit = semaphore.acquire_owned() => permit.ok(),
        () = cancelled_signal(cancel_rx.clone()) => None,
    };
    let Some(permit) = acquired else {
        return Err(());
    };
    let gauge = inner.gauges.entry(name.clone()).or_default();
    let current = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
    gauge.peak.fetch_max(current, Ordering::SeqCst);
    drop(gauge);
    Ok(Some(PermitGuard {
        _permit: permit,
        inner: Arc::clone(inner),
        gauge: name,
    }))
}

/// Drives one run to a terminal status: permit acquisition, the ordinary
/// retry loop, and capped rate-limit deferrals.
async fn execute_run(
    inner: &Arc<Inner>,
    function: &RegisteredFunction,
    event: &EventEnvelope,
    cancel_rx: &watch::Receiver<bool>,
) -> (RunStatus, Option<String>) {
    let Ok(_permit) = acquire_permit(inner, function, event, cancel_rx).await else {
        return (RunStatus::Cancelled, None);
    };

    let memo = Arc::new(DashMap::new());
    let sender = EventSender {
        tx: inner.tx.clone(),
        inflight: Arc::clone(&inner.inflight),
        idle_notify: Arc::clone(&inner.idle_notify),
    };
    let mut attempt: u32 = 0;
    let mut deferrals: u32 = 0;
    loop {
        if *cancel_rx.borrow() {
            break (RunStatus::Cancelled, None);
        }
        let step = Step::new(Arc::clone(&memo), sender.clone(), cancel_rx.clone());
        let context = FunctionContext {
            event: event.clone(),
            step,
            attempt,
        };
        match (function.handler)(context).await {
            Ok(()) => break (RunStatus::Completed, None),
            Err(EngineError::Cancelled) => break (RunStatus::Cancelled, None),
            Err(EngineError::RateLimited { retry_after }) => {
                deferrals += 1;
                if deferrals > function.config.max_rate_limit_deferrals {
                    break (
                        RunStatus::Failed,
                        Some(format!(
                            "Rate-limit deferral cap exhausted after {deferrals} attempts"
                        )),
                    );
                }
                debug!(
                    function = %function.config.id,
                    delay_secs = retry_after.as_secs(),
                    "Deferring run for rate limit"
                );
                if sleep_or_cancel(retry_after, cancel_rx).await.is_err() {
                    break (RunStatus::Cancelled, None);
                }
            }
            Err(error) if error.is_retriable() => {
                if attempt >= function.config.retries {
                    break (RunStatus::Failed, Some(error.to_string()));
                }
                let delay = backoff_delay(&inner.config, attempt);
                debug!(
                    function = %function.config.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying run after transient error"
                );
                if sleep_or_cancel(delay, cancel_rx).await.is_err() {
                    break (RunStatus::Cancelled, None);
                }
                attempt += 1;
            }
            Err(error) => break (RunStatus::Failed, Some(error.to_string())),
        }
    }
}

/// Exponential backoff with jitter, capped at the configured maximum.
fn backoff_delay(config: &RuntimeConfig, attempt: u32) -> Duration {
    let base = config.base_retry_delay.as_millis() as f64;
    let max = config.max_retry_delay.as_millis() as f64;
    let delay = (base * 2_f64.powf(f64::from(attempt.min(20)))).min(max);
    let jitter_range = delay * config.jitter_factor;
    let jitter = if jitter_range > 0.0 {
        rand::thread_rng().gen_range(0.0..=jitter_range)
    } else {
        0.0
    };
    Duration::from_millis((delay + jitter) as u64)
}

/// Resolves when the cancel signal fires; pends forever if the source is gone.
async fn cancelled_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel_rx: &watch::Receiver<bool>) -> Result<(), ()> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancelled_signal(cancel_rx.clone()) => Err(()),
    }
}
