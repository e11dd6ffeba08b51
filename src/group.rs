//! Resolution groups
//!
//! A group collects the promises created during one dynamic call so that
//! accessing one of them can resolve its independent siblings alongside it.
//! Membership is advisory and non-owning: the group stores table keys, and a
//! member that nothing else references simply drops out.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::eval::EvalError;
use crate::promise::{Outcome, Promise};
use crate::table::{PromiseId, PromiseTable};

/// Identifies the dynamic scope a group belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(pub u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

struct GroupInner {
    scope: ScopeId,
    label: Arc<str>,
    members: Mutex<Vec<PromiseId>>,
    table: Arc<PromiseTable>,
}

#[derive(Clone)]
pub struct ResolutionGroup {
    inner: Arc<GroupInner>,
}

/// Back-reference from a promise to its group; never keeps the group alive
#[derive(Clone)]
pub struct GroupLink {
    scope: ScopeId,
    inner: Weak<GroupInner>,
}

impl GroupLink {
    pub fn upgrade(&self) -> Option<ResolutionGroup> {
        self.inner.upgrade().map(|inner| ResolutionGroup { inner })
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }
}

/// Aggregate view over a group's members
#[derive(Debug, Clone, Default)]
pub struct GroupSummary {
    pub pending: usize,
    pub resolved: usize,
    pub cancelled: usize,
    pub failed: Vec<(PromiseId, EvalError)>,
}

impl GroupSummary {
    pub fn total(&self) -> usize {
        self.pending + self.resolved + self.cancelled + self.failed.len()
    }
}

impl ResolutionGroup {
    pub(crate) fn new(scope: ScopeId, label: impl AsRef<str>, table: Arc<PromiseTable>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                scope,
                label: Arc::from(label.as_ref()),
                members: Mutex::new(Vec::new()),
                table,
            }),
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.inner.scope
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn link(&self) -> GroupLink {
        GroupLink {
            scope: self.inner.scope,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn register(&self, id: PromiseId) {
        self.inner.members.lock().push(id);
    }

    pub fn ptr_eq(&self, other: &ResolutionGroup) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live members in creation order. Reclaimed members are pruned.
    pub fn members(&self) -> Vec<Promise> {
        let ids: Vec<PromiseId> = self.inner.members.lock().clone();
        let mut live = Vec::with_capacity(ids.len());
        let mut gone = Vec::new();
        for id in ids {
            match self.inner.table.get(id) {
                Some(p) => live.push(p),
                None => gone.push(id),
            }
        }
        if !gone.is_empty() {
            self.inner.members.lock().retain(|id| !gone.contains(id));
        }
        live
    }

    /// Members whose thunks have not started, in creation order
    pub fn pending_members(&self) -> Vec<Promise> {
        self.members()
            .into_iter()
            .filter(Promise::is_unstarted)
            .collect()
    }

    /// Inspect every live member without resolving any of them
    pub fn summary(&self) -> GroupSummary {
        let mut summary = GroupSummary::default();
        for member in self.members() {
            // state() first so an expired deadline is applied
            let _ = member.state();
            match member.settled_outcome() {
                None => summary.pending += 1,
                Some(Outcome::Resolved(_)) => summary.resolved += 1,
                Some(Outcome::Cancelled(_)) => summary.cancelled += 1,
                Some(Outcome::Failed(err)) => summary.failed.push((member.id(), err)),
            }
        }
        summary
    }

    /// Forget all members. Called when the owning frame exits; the promises
    /// themselves are unaffected.
    pub fn dissolve(&self) {
        self.inner.members.lock().clear();
    }
}

impl fmt::Debug for ResolutionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionGroup")
            .field("scope", &self.inner.scope)
            .field("label", &self.inner.label)
            .field("members", &self.inner.members.lock().len())
            .finish()
    }
}
