//! Deferred values
//!
//! A [`Promise`] holds a thunk that has not run yet. It resolves at most
//! once: the first transparent access claims the thunk under the promise's
//! own lock, runs it (through the [`ExecutionBoundary`]), and caches the
//! outcome. Every later access returns that cached outcome, including a
//! cached failure, which is re-raised identically each time.
//!
//! State machine:
//!
//! ```text
//! Pending ──► Resolved
//!    │  └───► Error      (carries an ErrorContext, or a timeout)
//!    └──────► Cancelled  (only before the thunk starts)
//! ```
//!
//! Pending has three internal phases: unstarted, queued (handed to a pool
//! job that has not begun) and running. All report
//! [`PromiseState::Pending`]; only a promise whose thunk has not begun can
//! be cancelled.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::ast::Span;
use crate::conflict::AccessSet;
use crate::eval::EvalError;
use crate::group::{GroupLink, ResolutionGroup, ScopeId};
use crate::runtime::ExecutionBoundary;
use crate::table::PromiseId;
use crate::value::Value;

/// The deferred computation behind a promise
pub type Thunk = Box<dyn FnOnce() -> Result<Value, EvalError> + Send + 'static>;

/// Invoked once with the terminal outcome
pub type Callback = Box<dyn FnOnce(&Outcome) + Send + 'static>;

/// Computes a promise's read/write footprint on demand
pub type FootprintFn = Box<dyn Fn() -> AccessSet + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseState {
    Pending,
    Resolved,
    Error,
    Cancelled,
}

impl PromiseState {
    pub fn name(&self) -> &'static str {
        match self {
            PromiseState::Pending => "pending",
            PromiseState::Resolved => "resolved",
            PromiseState::Error => "error",
            PromiseState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromiseState::Pending)
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called
    Requested,
    /// The function's timeout elapsed before resolution started
    Deadline,
}

/// A terminal outcome
#[derive(Debug, Clone)]
pub enum Outcome {
    Resolved(Value),
    Failed(EvalError),
    Cancelled(CancelReason),
}

impl Outcome {
    pub fn state(&self) -> PromiseState {
        match self {
            Outcome::Resolved(_) => PromiseState::Resolved,
            Outcome::Failed(_) => PromiseState::Error,
            Outcome::Cancelled(_) => PromiseState::Cancelled,
        }
    }
}

// ============================================================================
// Sites and error context
// ============================================================================

/// Where a promise was created or resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Site {
    /// Enclosing function, `None` at the top level or in host code
    pub function: Option<Arc<str>>,
    pub span: Option<Span>,
}

impl Site {
    pub fn new(function: Option<Arc<str>>, span: Span) -> Self {
        Self {
            function,
            span: Some(span),
        }
    }

    /// A site outside interpreted code (Rust callers, display, callbacks)
    pub fn host() -> Self {
        Self::default()
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.function, &self.span) {
            (Some(func), Some(span)) => write!(f, "in {} at {}", func, span),
            (None, Some(span)) => write!(f, "at top level {}", span),
            (Some(func), None) => write!(f, "in {}", func),
            (None, None) => f.write_str("in host code"),
        }
    }
}

/// Attached to a promise whose thunk failed. Immutable once built; the same
/// `Arc` is handed out on every access.
#[derive(Debug)]
pub struct ErrorContext {
    pub promise: PromiseId,
    pub cause: EvalError,
    pub created_at: Site,
    pub created_time: SystemTime,
    pub resolved_at: Site,
    pub resolved_time: SystemTime,
}

impl ErrorContext {
    /// The innermost failure, looking through nested promise failures
    pub fn root_cause(&self) -> &EvalError {
        self.cause.root_cause()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (promise {} created {}, resolved {})",
            self.cause, self.promise, self.created_at, self.resolved_at
        )
    }
}

impl std::error::Error for ErrorContext {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

// ============================================================================
// Promise
// ============================================================================

/// Source of a promise's read/write footprint
pub enum Footprint {
    Fixed(AccessSet),
    Computed(FootprintFn),
}

impl fmt::Debug for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Footprint::Fixed(set) => f.debug_tuple("Fixed").field(set).finish(),
            Footprint::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Creation parameters for a promise
#[derive(Debug)]
pub struct PromiseSpec {
    pub origin: Site,
    pub declared_type: Option<Arc<str>>,
    pub timeout: Option<Duration>,
    pub footprint: Footprint,
}

impl PromiseSpec {
    /// Without a footprint a promise is assumed to touch everything.
    pub fn new(origin: Site) -> Self {
        Self {
            origin,
            declared_type: None,
            timeout: None,
            footprint: Footprint::Fixed(AccessSet::unknown()),
        }
    }

    pub fn declared_type(mut self, ty: impl AsRef<str>) -> Self {
        self.declared_type = Some(Arc::from(ty.as_ref()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn access(mut self, set: AccessSet) -> Self {
        self.footprint = Footprint::Fixed(set);
        self
    }

    pub fn footprint_with(mut self, f: impl Fn() -> AccessSet + Send + Sync + 'static) -> Self {
        self.footprint = Footprint::Computed(Box::new(f));
        self
    }
}

enum Phase {
    Unstarted(Thunk),
    /// The thunk belongs to a pool job that has not started it
    Queued,
    Running { thread: ThreadId, started: Instant },
    Settled(Outcome),
}

struct Cell {
    phase: Phase,
    elapsed: Option<Duration>,
    callbacks: Vec<Callback>,
}

/// Result of trying to take the thunk
pub(crate) enum Claim {
    Acquired(Thunk),
    RunningHere,
    RunningElsewhere,
    Settled(Outcome),
}

pub(crate) struct PromiseInner {
    id: PromiseId,
    correlation: u64,
    origin: Site,
    created_time: SystemTime,
    declared_type: Option<Arc<str>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    group: Option<GroupLink>,
    footprint: Footprint,
    footprint_cache: OnceLock<AccessSet>,
    cell: Mutex<Cell>,
    settled: Condvar,
    boundary: Arc<ExecutionBoundary>,
}

impl Drop for PromiseInner {
    fn drop(&mut self) {
        if matches!(self.cell.get_mut().phase, Phase::Unstarted(_)) {
            tracing::trace!(promise = %self.id, "reclaimed without running");
        }
        self.boundary.table().release(self.id);
    }
}

/// A transparent placeholder for a value whose computation may be deferred.
///
/// Cloning is cheap and shares the same underlying state.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<PromiseInner>,
}

/// A non-owning handle; never keeps the promise alive
#[derive(Clone)]
pub struct WeakPromise {
    inner: Weak<PromiseInner>,
}

impl WeakPromise {
    pub fn upgrade(&self) -> Option<Promise> {
        self.inner.upgrade().map(|inner| Promise { inner })
    }
}

impl Promise {
    pub(crate) fn new(
        id: PromiseId,
        correlation: u64,
        spec: PromiseSpec,
        thunk: Thunk,
        group: Option<GroupLink>,
        boundary: Arc<ExecutionBoundary>,
    ) -> Self {
        let deadline = spec.timeout.map(|t| Instant::now() + t);
        Promise {
            inner: Arc::new(PromiseInner {
                id,
                correlation,
                origin: spec.origin,
                created_time: SystemTime::now(),
                declared_type: spec.declared_type,
                timeout: spec.timeout,
                deadline,
                group,
                footprint: spec.footprint,
                footprint_cache: OnceLock::new(),
                cell: Mutex::new(Cell {
                    phase: Phase::Unstarted(thunk),
                    elapsed: None,
                    callbacks: Vec::new(),
                }),
                settled: Condvar::new(),
                boundary,
            }),
        }
    }

    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    pub fn correlation_id(&self) -> u64 {
        self.inner.correlation
    }

    pub fn origin(&self) -> &Site {
        &self.inner.origin
    }

    pub fn created_time(&self) -> SystemTime {
        self.inner.created_time
    }

    pub fn declared_type(&self) -> Option<&str> {
        self.inner.declared_type.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn group(&self) -> Option<ResolutionGroup> {
        self.inner.group.as_ref().and_then(GroupLink::upgrade)
    }

    pub fn scope(&self) -> Option<ScopeId> {
        self.inner.group.as_ref().map(GroupLink::scope)
    }

    pub fn downgrade(&self) -> WeakPromise {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn boundary(&self) -> &Arc<ExecutionBoundary> {
        &self.inner.boundary
    }

    /// The read/write footprint, computed on first request and then cached
    pub fn footprint(&self) -> &AccessSet {
        self.inner
            .footprint_cache
            .get_or_init(|| match &self.inner.footprint {
                Footprint::Fixed(set) => set.clone(),
                Footprint::Computed(f) => f(),
            })
    }

    // ------------------------------------------------------------------
    // Transparent access
    // ------------------------------------------------------------------

    /// Resolve from host code
    pub fn resolve(&self) -> Result<Value, EvalError> {
        self.resolve_at(&Site::host())
    }

    /// Resolve, recording `site` as the resolution location on failure
    pub fn resolve_at(&self, site: &Site) -> Result<Value, EvalError> {
        ExecutionBoundary::resolve(&self.inner.boundary, self, site)
    }

    // ------------------------------------------------------------------
    // Inspection surface; none of these run the thunk
    // ------------------------------------------------------------------

    pub fn state(&self) -> PromiseState {
        self.expire_if_unstarted();
        let cell = self.inner.cell.lock();
        match &cell.phase {
            Phase::Unstarted(_) | Phase::Queued | Phase::Running { .. } => PromiseState::Pending,
            Phase::Settled(outcome) => outcome.state(),
        }
    }

    pub fn get_state(&self) -> PromiseState {
        self.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == PromiseState::Resolved
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.state() == PromiseState::Error
    }

    /// Wall-clock time the thunk ran for, once it has finished
    pub fn execution_time(&self) -> Option<Duration> {
        self.inner.cell.lock().elapsed
    }

    pub fn get_execution_time(&self) -> Option<Duration> {
        self.execution_time()
    }

    /// Cancel before resolution starts. Returns whether the promise is now
    /// cancelled by this call; work already in flight is never interrupted.
    pub fn cancel(&self) -> bool {
        self.settle_unstarted(CancelReason::Requested)
    }

    /// Register `callback` for the terminal outcome. Runs immediately on
    /// this thread if the promise has already settled.
    pub fn add_callback(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        self.expire_if_unstarted();
        let settled = {
            let mut cell = self.inner.cell.lock();
            match &cell.phase {
                Phase::Settled(outcome) => Some(outcome.clone()),
                _ => {
                    cell.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(outcome) = settled {
            callback(&outcome);
        }
    }

    // ------------------------------------------------------------------
    // Resolution primitives used by the execution boundary
    // ------------------------------------------------------------------

    pub(crate) fn is_unstarted(&self) -> bool {
        matches!(self.inner.cell.lock().phase, Phase::Unstarted(_))
    }

    /// The thread running the thunk right now
    pub(crate) fn running_thread(&self) -> Option<ThreadId> {
        match self.inner.cell.lock().phase {
            Phase::Running { thread, .. } => Some(thread),
            _ => None,
        }
    }

    /// The cached outcome, if settled
    pub(crate) fn settled_outcome(&self) -> Option<Outcome> {
        match &self.inner.cell.lock().phase {
            Phase::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Take the thunk to run it on this thread. This is the exclusive
    /// region: only one caller can ever take the thunk.
    pub(crate) fn try_claim(&self) -> Claim {
        self.claim(false)
    }

    /// Take the thunk for a pool job; the promise stays queued until the
    /// job calls [`Promise::begin`].
    pub(crate) fn try_claim_queued(&self) -> Claim {
        self.claim(true)
    }

    fn claim(&self, queued: bool) -> Claim {
        self.expire_if_unstarted();
        let mut cell = self.inner.cell.lock();
        match &cell.phase {
            Phase::Settled(outcome) => return Claim::Settled(outcome.clone()),
            Phase::Running { thread, .. } if *thread == thread::current().id() => {
                return Claim::RunningHere;
            }
            Phase::Running { .. } | Phase::Queued => return Claim::RunningElsewhere,
            Phase::Unstarted(_) => {}
        }
        let next = if queued {
            Phase::Queued
        } else {
            Phase::Running {
                thread: thread::current().id(),
                started: Instant::now(),
            }
        };
        match std::mem::replace(&mut cell.phase, next) {
            Phase::Unstarted(thunk) => Claim::Acquired(thunk),
            // Checked above under the same lock
            _ => unreachable!("phase changed while locked"),
        }
    }

    /// Called by the pool job holding a queued thunk. Returns false if the
    /// promise was cancelled or expired while queued; the job then drops
    /// the thunk without running it.
    pub(crate) fn begin(&self) -> bool {
        let mut cell = self.inner.cell.lock();
        if !matches!(cell.phase, Phase::Queued) {
            return false;
        }
        cell.phase = Phase::Running {
            thread: thread::current().id(),
            started: Instant::now(),
        };
        true
    }

    /// Record the outcome of a claimed run. Returns false when the run was
    /// abandoned at its deadline; the late outcome is discarded.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut cell = self.inner.cell.lock();
            let started = match &cell.phase {
                Phase::Running { started, .. } => Some(*started),
                Phase::Queued => None,
                _ => return false,
            };
            cell.elapsed = started.map(|at| at.elapsed());
            cell.phase = Phase::Settled(outcome.clone());
            std::mem::take(&mut cell.callbacks)
        };
        self.inner.settled.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Block until settled, or until `deadline` passes. Returns the outcome
    /// if it settled in time.
    pub(crate) fn wait_settled(&self, deadline: Option<Instant>) -> Option<Outcome> {
        let mut cell = self.inner.cell.lock();
        loop {
            if let Phase::Settled(outcome) = &cell.phase {
                return Some(outcome.clone());
            }
            match deadline {
                Some(at) => {
                    if self.inner.settled.wait_until(&mut cell, at).timed_out() {
                        return match &cell.phase {
                            Phase::Settled(outcome) => Some(outcome.clone()),
                            _ => None,
                        };
                    }
                }
                None => self.inner.settled.wait(&mut cell),
            }
        }
    }

    /// Give up on a promise whose deadline passed: an unstarted or queued
    /// one is cancelled, a running one is failed with a timeout and its
    /// work is left to finish unobserved.
    pub(crate) fn expire(&self) {
        let Some(deadline) = self.inner.deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        if self.settle_unstarted(CancelReason::Deadline) {
            return;
        }
        let timeout = EvalError::Timeout {
            promise: self.inner.id,
            after: self.inner.timeout.unwrap_or_default(),
        };
        let abandoned = {
            let cell = self.inner.cell.lock();
            matches!(cell.phase, Phase::Running { .. })
        };
        if abandoned && self.complete(Outcome::Failed(timeout)) {
            tracing::debug!(promise = %self.inner.id, "abandoned in-flight resolution at deadline");
            self.inner.boundary.on_timeout(self);
        }
    }

    fn expire_if_unstarted(&self) {
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                self.settle_unstarted(CancelReason::Deadline);
            }
        }
    }

    fn settle_unstarted(&self, reason: CancelReason) -> bool {
        let outcome = Outcome::Cancelled(reason);
        let (thunk, callbacks) = {
            let mut cell = self.inner.cell.lock();
            if !matches!(cell.phase, Phase::Unstarted(_) | Phase::Queued) {
                return false;
            }
            let previous = std::mem::replace(&mut cell.phase, Phase::Settled(outcome.clone()));
            (previous, std::mem::take(&mut cell.callbacks))
        };
        // An unstarted thunk is dropped here, outside the lock, without
        // being called; a queued one is dropped by its job
        drop(thunk);
        self.inner.settled.notify_all();
        self.inner.boundary.on_cancelled(self, reason);
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Convert a cached outcome into what a transparent access returns
    pub(crate) fn outcome_result(&self, outcome: Outcome) -> Result<Value, EvalError> {
        match outcome {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled(CancelReason::Requested) => Err(EvalError::Cancelled {
                promise: self.inner.id,
            }),
            Outcome::Cancelled(CancelReason::Deadline) => Err(EvalError::Timeout {
                promise: self.inner.id,
                after: self.inner.timeout.unwrap_or_default(),
            }),
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("origin", &self.inner.origin)
            .finish()
    }
}

impl fmt::Display for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            Ok(value) => write!(f, "{}", value),
            Err(err) => write!(f, "<error: {}>", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn boundary() -> Arc<ExecutionBoundary> {
        ExecutionBoundary::new(EngineConfig::default().with_workers(2)).unwrap()
    }

    fn counting(counter: &Arc<AtomicUsize>, value: i64) -> Thunk {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(value))
        })
    }

    #[test]
    fn test_pending_until_accessed() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(PromiseSpec::new(Site::host()), counting(&counter, 7), None);

        assert!(p.is_pending());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(p.resolve(), Ok(Value::Int(7))));
        assert!(p.is_resolved());
        assert!(!p.is_pending());
    }

    #[test]
    fn test_thunk_runs_once() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(PromiseSpec::new(Site::host()), counting(&counter, 1), None);

        for _ in 0..5 {
            p.resolve().unwrap();
        }
        let clone = p.clone();
        clone.resolve().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_access_runs_once() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let p = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                Ok(Value::Int(3))
            }),
            None,
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || p.resolve().unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Value::Int(3));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_access() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(PromiseSpec::new(Site::host()), counting(&counter, 1), None);

        assert!(p.cancel());
        assert!(p.is_cancelled());
        assert!(matches!(p.resolve(), Err(EvalError::Cancelled { .. })));
        assert!(matches!(p.resolve(), Err(EvalError::Cancelled { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_resolution_has_no_effect() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(PromiseSpec::new(Site::host()), counting(&counter, 4), None);

        p.resolve().unwrap();
        assert!(!p.cancel());
        assert!(p.is_resolved());
        assert!(matches!(p.resolve(), Ok(Value::Int(4))));
    }

    #[test]
    fn test_error_is_cached_and_reraised() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let p = b.defer(
            PromiseSpec::new(Site::new(Some("f".into()), Span::new(0, 5))),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Err(EvalError::DivisionByZero)
            }),
            None,
        );

        let site = Site::new(None, Span::new(10, 17));
        let first = p.resolve_at(&site).unwrap_err();
        let second = p.resolve().unwrap_err();

        let (EvalError::ThunkExecution(a), EvalError::ThunkExecution(b)) = (&first, &second) else {
            panic!("expected thunk execution errors, got {first:?} / {second:?}");
        };
        assert!(Arc::ptr_eq(a, b));
        assert!(matches!(a.cause, EvalError::DivisionByZero));
        assert_eq!(a.created_at.function.as_deref(), Some("f"));
        assert_eq!(a.resolved_at, site);
        assert!(p.is_failed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_promise_is_flattened() {
        let b = boundary();
        let inner = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(|| Ok(Value::Int(41))),
            None,
        );
        let outer = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(move || Ok(Value::Promise(inner))),
            None,
        );

        let value = outer.resolve().unwrap();
        assert!(matches!(value, Value::Int(41)));
    }

    #[test]
    fn test_callback_after_resolution() {
        let b = boundary();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let p = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(|| Ok(Value::Int(9))),
            None,
        );

        let s = Arc::clone(&seen);
        p.add_callback(move |outcome| s.lock().push(outcome.state()));
        assert!(seen.lock().is_empty());

        p.resolve().unwrap();
        let s = Arc::clone(&seen);
        p.add_callback(move |outcome| s.lock().push(outcome.state()));

        assert_eq!(
            *seen.lock(),
            vec![PromiseState::Resolved, PromiseState::Resolved]
        );
    }

    #[test]
    fn test_callback_sees_cancellation() {
        let b = boundary();
        let seen = Arc::new(Mutex::new(None));
        let p = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(|| Ok(Value::Unit)),
            None,
        );
        let s = Arc::clone(&seen);
        p.add_callback(move |outcome| *s.lock() = Some(outcome.state()));
        p.cancel();
        assert_eq!(*seen.lock(), Some(PromiseState::Cancelled));
    }

    #[test]
    fn test_execution_time_recorded() {
        let b = boundary();
        let p = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(Value::Unit)
            }),
            None,
        );
        assert_eq!(p.execution_time(), None);
        p.resolve().unwrap();
        assert!(p.execution_time().unwrap() >= Duration::from_millis(20));
    }

    #[test]
    fn test_self_dependency_is_reported() {
        let b = boundary();
        let slot: Arc<Mutex<Option<WeakPromise>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let p = b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(move || {
                let me = s.lock().as_ref().and_then(WeakPromise::upgrade);
                match me {
                    Some(me) => me.resolve(),
                    None => Ok(Value::Unit),
                }
            }),
            None,
        );
        *slot.lock() = Some(p.downgrade());

        let err = p.resolve().unwrap_err();
        assert!(matches!(
            err.root_cause(),
            EvalError::CyclicResolution { .. }
        ));
    }

    #[test]
    fn test_deadline_cancels_unstarted() {
        let b = boundary();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(
            PromiseSpec::new(Site::host()).timeout(Duration::from_millis(10)),
            counting(&counter, 1),
            None,
        );
        std::thread::sleep(Duration::from_millis(30));

        assert!(p.is_cancelled());
        assert!(matches!(p.resolve(), Err(EvalError::Timeout { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deadline_abandons_running_work() {
        let b = boundary();
        let p = b.defer(
            PromiseSpec::new(Site::host()).timeout(Duration::from_millis(40)),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Value::Int(1))
            }),
            None,
        );

        let started = Instant::now();
        assert!(matches!(p.resolve(), Err(EvalError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(p.is_failed());
        // The late result never replaces the timeout
        std::thread::sleep(Duration::from_millis(250));
        assert!(matches!(p.resolve(), Err(EvalError::Timeout { .. })));
    }

    #[test]
    fn test_dropped_promise_never_runs() {
        let sink = Arc::new(RecordingSink::new());
        let b = ExecutionBoundary::with_sink(EngineConfig::default().with_workers(1), sink)
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let p = b.defer(PromiseSpec::new(Site::host()), counting(&counter, 1), None);
        let weak = p.downgrade();
        assert_eq!(b.table().live(), 1);

        drop(p);
        assert!(weak.upgrade().is_none());
        assert_eq!(b.table().live(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
