//! Execution boundary: the seam between synchronous evaluation and the pool
//!
//! Everything the evaluator does runs on the calling thread in source order
//! except the resolution of a pending promise. Resolution goes through
//! [`ExecutionBoundary::resolve`], which may:
//!
//! - run independent group siblings on the shared [`WorkerPool`] while the
//!   requested promise runs on the calling thread,
//! - run earlier conflicting siblings first, in creation order,
//! - run a promise with a deadline on the pool so the caller can stop
//!   waiting for it.
//!
//! Resolution on a pool worker never starts another batch; nested work is
//! done inline on that worker.
//!
//! A thread that blocks on a promise running on another thread records the
//! wait first. Waits that would close a cycle between threads fail with
//! [`EvalError::CyclicResolution`] instead of blocking.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::conflict::{self, AccessSet};
use crate::eval::EvalError;
use crate::events::{EventSink, LifecycleEvent, LifecycleKind, TracingSink};
use crate::group::{ResolutionGroup, ScopeId};
use crate::pool::{self, PoolError, WorkerPool};
use crate::promise::{
    CancelReason, Claim, ErrorContext, Outcome, Promise, PromiseSpec, Site, Thunk, WeakPromise,
};
use crate::table::PromiseTable;
use crate::value::Value;

/// Counters describing what the boundary has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoundaryStats {
    /// Thunks run on the thread that accessed them
    pub inline: usize,
    /// Thunks handed to the pool
    pub dispatched: usize,
    /// Accesses that considered siblings
    pub batches: usize,
    /// Siblings forced into source order by a conflict
    pub serialized: usize,
    pub cancelled: usize,
    pub timeouts: usize,
}

#[derive(Default)]
struct Counters {
    inline: AtomicUsize,
    dispatched: AtomicUsize,
    batches: AtomicUsize,
    serialized: AtomicUsize,
    cancelled: AtomicUsize,
    timeouts: AtomicUsize,
}

/// Which promise each blocked thread is waiting for
#[derive(Default)]
struct WaitGraph {
    waiting: Mutex<HashMap<ThreadId, WeakPromise>>,
}

impl WaitGraph {
    /// Record that this thread is about to block on `promise`. Fails if the
    /// thread running `promise` is itself waiting, directly or through
    /// other threads, on something this thread is running.
    fn enter(&self, promise: &Promise) -> Result<WaitGuard<'_>, EvalError> {
        let me = thread::current().id();
        let mut waiting = self.waiting.lock();
        let mut seen = HashSet::new();
        let mut next = promise.clone();
        while let Some(owner) = next.running_thread() {
            if owner == me {
                return Err(EvalError::CyclicResolution {
                    promise: promise.id(),
                });
            }
            if !seen.insert(owner) {
                break;
            }
            match waiting.get(&owner).and_then(WeakPromise::upgrade) {
                Some(awaited) => next = awaited,
                None => break,
            }
        }
        waiting.insert(me, promise.downgrade());
        Ok(WaitGuard {
            graph: self,
            thread: me,
        })
    }
}

struct WaitGuard<'a> {
    graph: &'a WaitGraph,
    thread: ThreadId,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.graph.waiting.lock().remove(&self.thread);
    }
}

pub struct ExecutionBoundary {
    config: EngineConfig,
    pool: WorkerPool,
    events: Arc<dyn EventSink>,
    table: Arc<PromiseTable>,
    waits: WaitGraph,
    counters: Counters,
    next_correlation: AtomicU64,
    next_scope: AtomicU64,
}

impl ExecutionBoundary {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, PoolError> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: EngineConfig, events: Arc<dyn EventSink>) -> Result<Arc<Self>, PoolError> {
        let pool = WorkerPool::with_workers(config.workers, &config.thread_name_prefix)?;
        Ok(Arc::new(Self {
            config,
            pool,
            events,
            table: Arc::new(PromiseTable::new()),
            waits: WaitGraph::default(),
            counters: Counters::default(),
            next_correlation: AtomicU64::new(1),
            next_scope: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<PromiseTable> {
        &self.table
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn stats(&self) -> BoundaryStats {
        let c = &self.counters;
        BoundaryStats {
            inline: c.inline.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            serialized: c.serialized.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool. Pending promises still resolve inline afterwards;
    /// promises with a deadline fail with `PoolShutdown`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn new_group(&self, label: impl AsRef<str>) -> ResolutionGroup {
        let scope = ScopeId(self.next_scope.fetch_add(1, Ordering::Relaxed));
        ResolutionGroup::new(scope, label, Arc::clone(&self.table))
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Wrap `thunk` in a new pending promise, registered into `group`
    pub fn defer(
        self: &Arc<Self>,
        spec: PromiseSpec,
        thunk: Thunk,
        group: Option<&ResolutionGroup>,
    ) -> Promise {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let link = group.map(ResolutionGroup::link);
        let promise = self.table.insert_with(|id| {
            Promise::new(id, correlation, spec, thunk, link, Arc::clone(self))
        });
        if let Some(group) = group {
            group.register(promise.id());
        }
        let detail = promise.declared_type().map(|ty| format!("type {}", ty));
        self.emit(&promise, LifecycleKind::Created, detail);
        promise
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    pub(crate) fn resolve(
        self: &Arc<Self>,
        promise: &Promise,
        site: &Site,
    ) -> Result<Value, EvalError> {
        if let Some(outcome) = promise.settled_outcome() {
            return promise.outcome_result(outcome);
        }
        if self.config.batching && !pool::on_worker_thread() && promise.is_unstarted() {
            if let Some(group) = promise.group() {
                self.resolve_batch(promise, &group, site);
            }
        }
        self.drive(promise, site)
    }

    /// Start the siblings of `target` that can run alongside it, and run
    /// the earlier ones it conflicts with. `target` itself is left to the
    /// caller.
    fn resolve_batch(self: &Arc<Self>, target: &Promise, group: &ResolutionGroup, site: &Site) {
        let pending = group.pending_members();
        if pending.len() < 2 {
            return;
        }
        let Some(index) = pending.iter().position(|p| p.ptr_eq(target)) else {
            return;
        };
        let footprints: Vec<&AccessSet> = pending.iter().map(Promise::footprint).collect();
        let plan = conflict::plan_batch(index, &footprints, self.config.max_batch);

        let span = tracing::debug_span!("batch", target = %target.id(), scope = %group.scope());
        let _enter = span.enter();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        for &i in &plan.concurrent {
            self.dispatch(&pending[i], site);
        }
        if !plan.run_first.is_empty() || !plan.deferred.is_empty() {
            self.counters
                .serialized
                .fetch_add(plan.serialized(), Ordering::Relaxed);
            tracing::debug!(
                target: "latent::conflict",
                promise = %target.id(),
                run_first = plan.run_first.len(),
                deferred = plan.deferred.len(),
                "conflicting siblings kept in source order"
            );
        }
        for &i in &plan.run_first {
            // Each member caches its own failure; the target is unaffected
            let _ = self.drive(&pending[i], site);
        }
        tracing::debug!(concurrent = plan.concurrent.len(), "batch dispatched");
    }

    /// Queue a sibling on the pool. The job holds it weakly: a sibling that
    /// is dropped before a worker picks it up never runs.
    fn dispatch(&self, promise: &Promise, site: &Site) {
        let weak = promise.downgrade();
        let site = site.clone();
        let job = Box::new(move || {
            let Some(promise) = weak.upgrade() else {
                return;
            };
            if let Claim::Acquired(thunk) = promise.try_claim() {
                let boundary = Arc::clone(promise.boundary());
                boundary.execute(&promise, thunk, &site);
            }
        });
        match self.pool.submit(job) {
            Ok(()) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(promise = %promise.id(), error = %err, "sibling left pending");
            }
        }
    }

    /// Resolve one promise: claim it and run it, or wait for whoever did
    fn drive(self: &Arc<Self>, promise: &Promise, site: &Site) -> Result<Value, EvalError> {
        let on_pool = promise.deadline().is_some() && !pool::on_worker_thread();
        loop {
            promise.expire();
            let claim = if on_pool {
                promise.try_claim_queued()
            } else {
                promise.try_claim()
            };
            match claim {
                Claim::Settled(outcome) => return promise.outcome_result(outcome),
                Claim::RunningHere => {
                    return Err(EvalError::CyclicResolution {
                        promise: promise.id(),
                    })
                }
                Claim::RunningElsewhere => {
                    let _wait = self.waits.enter(promise)?;
                    if let Some(outcome) = promise.wait_settled(promise.deadline()) {
                        return promise.outcome_result(outcome);
                    }
                }
                Claim::Acquired(thunk) if on_pool => {
                    self.run_with_deadline(promise, thunk, site);
                    let _wait = self.waits.enter(promise)?;
                    if let Some(outcome) = promise.wait_settled(promise.deadline()) {
                        return promise.outcome_result(outcome);
                    }
                }
                Claim::Acquired(thunk) => {
                    self.counters.inline.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.execute(promise, thunk, site);
                    return promise.outcome_result(outcome);
                }
            }
        }
    }

    fn run_with_deadline(&self, promise: &Promise, thunk: Thunk, site: &Site) {
        let job_promise = promise.clone();
        let site = site.clone();
        let job = Box::new(move || {
            // Cancelled or expired before a worker got to it
            if !job_promise.begin() {
                return;
            }
            let boundary = Arc::clone(job_promise.boundary());
            boundary.execute(&job_promise, thunk, &site);
        });
        match self.pool.submit(job) {
            Ok(()) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                promise.complete(Outcome::Failed(EvalError::PoolShutdown));
            }
        }
    }

    /// Run a claimed thunk and settle the promise. Returns the outcome the
    /// promise ended up with, which differs from this run's result when the
    /// run was abandoned at its deadline.
    fn execute(&self, promise: &Promise, thunk: Thunk, site: &Site) -> Outcome {
        self.emit(promise, LifecycleKind::ResolutionStarted, None);

        let result = panic::catch_unwind(AssertUnwindSafe(thunk))
            .unwrap_or_else(|payload| Err(EvalError::RuntimeError(panic_message(payload))))
            .and_then(|value| match value {
                // Nested promises are resolved before the outer one caches
                Value::Promise(inner) => inner.resolve_at(site),
                other => Ok(other),
            });

        let outcome = match result {
            Ok(value) => Outcome::Resolved(value),
            Err(cause) => Outcome::Failed(EvalError::ThunkExecution(Arc::new(ErrorContext {
                promise: promise.id(),
                cause,
                created_at: promise.origin().clone(),
                created_time: promise.created_time(),
                resolved_at: site.clone(),
                resolved_time: SystemTime::now(),
            }))),
        };

        if promise.complete(outcome.clone()) {
            match &outcome {
                Outcome::Resolved(_) => self.emit(promise, LifecycleKind::Resolved, None),
                Outcome::Failed(err) => {
                    self.emit(promise, LifecycleKind::Failed, Some(err.to_string()))
                }
                Outcome::Cancelled(_) => {}
            }
            outcome
        } else {
            tracing::debug!(promise = %promise.id(), "late result discarded");
            promise.settled_outcome().unwrap_or(outcome)
        }
    }

    // ========================================================================
    // Lifecycle notifications
    // ========================================================================

    pub(crate) fn on_cancelled(&self, promise: &Promise, reason: CancelReason) {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        let detail = match reason {
            CancelReason::Requested => "requested",
            CancelReason::Deadline => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                "deadline"
            }
        };
        self.emit(promise, LifecycleKind::Cancelled, Some(detail.to_string()));
    }

    pub(crate) fn on_timeout(&self, promise: &Promise) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        self.emit(promise, LifecycleKind::Failed, Some("timeout".to_string()));
    }

    fn emit(&self, promise: &Promise, kind: LifecycleKind, detail: Option<String>) {
        let mut event = LifecycleEvent::new(promise.correlation_id(), promise.id(), kind)
            .scope(promise.scope())
            .function(promise.origin().function.clone());
        event.detail = detail;
        self.events.emit(&event);
    }
}

impl std::fmt::Debug for ExecutionBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBoundary")
            .field("pool", &self.pool)
            .field("table", &self.table)
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("thunk panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("thunk panicked: {}", s)
    } else {
        "thunk panicked".to_string()
    }
}
