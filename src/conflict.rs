//! Conflict Detector
//!
//! Decides which pending promises may run at the same time. Every pending
//! operation carries an [`AccessSet`]: the resources it may read and write.
//! Two operations are independent only if neither writes something the
//! other reads or writes. The analysis is conservative; an operation whose
//! effects cannot be bounded is tagged with a wildcard and conflicts with
//! everything that touches any resource.
//!
//! Footprints are computed statically from the deferred expression:
//! 1. Names not bound in the snapshot are reads of program globals
//! 2. Calls to declared functions pull in the callee body, transitively
//! 3. Assignments to non-local names inside a body are global writes
//! 4. Builtins contribute their handles (`print` writes `stdout`)
//! 5. Calls through anything else are wildcards
//! 6. Unstarted promises captured in the snapshot, at any depth inside
//!    lists and records, contribute their own footprints
//! 7. A global currently holding an unstarted promise is a wildcard

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::ast::{Expr, ExprKind, FnDecl, Stmt, StmtKind};
use crate::eval::Env;
use crate::value::{Builtin, Value};

/// Something a pending operation may read or write
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    /// A program-level mutable binding
    Global(Arc<str>),
    /// An external handle touched by a builtin
    Handle(Arc<str>),
}

impl Resource {
    pub fn global(name: impl AsRef<str>) -> Self {
        Resource::Global(Arc::from(name.as_ref()))
    }

    pub fn handle(name: impl AsRef<str>) -> Self {
        Resource::Handle(Arc::from(name.as_ref()))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Global(name) => write!(f, "global {}", name),
            Resource::Handle(name) => write!(f, "handle {}", name),
        }
    }
}

/// Read and write sets of one pending operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    reads: BTreeSet<Resource>,
    writes: BTreeSet<Resource>,
    wildcard: bool,
}

impl AccessSet {
    /// Touches nothing
    pub fn pure() -> Self {
        Self::default()
    }

    /// May touch anything
    pub fn unknown() -> Self {
        Self {
            wildcard: true,
            ..Self::default()
        }
    }

    pub fn read(mut self, resource: Resource) -> Self {
        self.reads.insert(resource);
        self
    }

    pub fn write(mut self, resource: Resource) -> Self {
        self.writes.insert(resource);
        self
    }

    pub fn add_read(&mut self, resource: Resource) {
        self.reads.insert(resource);
    }

    pub fn add_write(&mut self, resource: Resource) {
        self.writes.insert(resource);
    }

    pub fn mark_unknown(&mut self) {
        self.wildcard = true;
    }

    pub fn merge(&mut self, other: &AccessSet) {
        self.reads.extend(other.reads.iter().cloned());
        self.writes.extend(other.writes.iter().cloned());
        self.wildcard |= other.wildcard;
    }

    pub fn reads(&self) -> &BTreeSet<Resource> {
        &self.reads
    }

    pub fn writes(&self) -> &BTreeSet<Resource> {
        &self.writes
    }

    pub fn is_unknown(&self) -> bool {
        self.wildcard
    }

    pub fn is_pure(&self) -> bool {
        !self.wildcard && self.reads.is_empty() && self.writes.is_empty()
    }

    /// True unless the two operations provably touch disjoint state
    pub fn conflicts_with(&self, other: &AccessSet) -> bool {
        if self.is_pure() || other.is_pure() {
            return false;
        }
        if self.wildcard || other.wildcard {
            return true;
        }
        let writes_into = |a: &AccessSet, b: &AccessSet| {
            a.writes
                .iter()
                .any(|r| b.reads.contains(r) || b.writes.contains(r))
        };
        writes_into(self, other) || writes_into(other, self)
    }
}

impl fmt::Display for AccessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            return f.write_str("reads/writes *");
        }
        let list = |set: &BTreeSet<Resource>| {
            set.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "reads [{}] writes [{}]", list(&self.reads), list(&self.writes))
    }
}

// ============================================================================
// Batch planning
// ============================================================================

/// How a resolution request is split, by index into the pending list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    /// Earlier siblings the target depends on through shared state; run on
    /// the calling thread in creation order before the target
    pub run_first: Vec<usize>,
    /// Siblings independent of everything else in the batch
    pub concurrent: Vec<usize>,
    /// Siblings left pending
    pub deferred: Vec<usize>,
}

impl BatchPlan {
    /// Number of siblings forced into source order by a conflict
    pub fn serialized(&self) -> usize {
        self.run_first.len()
    }
}

/// Plan the resolution of `pending[target]`. `pending` holds the footprints
/// of the group's unstarted members in creation order, target included.
/// At most `max_batch` promises (target included) run concurrently.
pub fn plan_batch(target: usize, pending: &[&AccessSet], max_batch: usize) -> BatchPlan {
    let mut plan = BatchPlan::default();

    // Earlier members that conflict with the target, directly or through
    // another such member
    let mut closure = vec![target];
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..target {
            if closure.contains(&i) {
                continue;
            }
            if closure.iter().any(|&j| pending[i].conflicts_with(pending[j])) {
                closure.push(i);
                changed = true;
            }
        }
    }
    plan.run_first = closure.iter().copied().filter(|&i| i != target).collect();
    plan.run_first.sort_unstable();

    let limit = max_batch.saturating_sub(1);
    for (i, access) in pending.iter().enumerate() {
        if closure.contains(&i) {
            continue;
        }
        let blocked = closure
            .iter()
            .chain(plan.concurrent.iter())
            .chain(plan.deferred.iter())
            .any(|&j| access.conflicts_with(pending[j]));
        if blocked || plan.concurrent.len() >= limit {
            plan.deferred.push(i);
        } else {
            plan.concurrent.push(i);
        }
    }
    plan
}

// ============================================================================
// Static footprint analysis
// ============================================================================

/// Access to the program's declared functions and globals
pub trait FunctionLookup {
    fn lookup_function(&self, name: &str) -> Option<Arc<FnDecl>>;

    /// Current value of a program global
    fn lookup_global(&self, _name: &str) -> Option<Value> {
        None
    }
}

impl FunctionLookup for std::collections::HashMap<String, Arc<FnDecl>> {
    fn lookup_function(&self, name: &str) -> Option<Arc<FnDecl>> {
        self.get(name).cloned()
    }
}

/// Footprint of a deferred expression evaluated under `snapshot`
pub fn expr_footprint(expr: &Expr, snapshot: &Env, functions: &dyn FunctionLookup) -> AccessSet {
    let mut analyzer = Analyzer {
        functions,
        visited: HashSet::new(),
        access: AccessSet::pure(),
    };
    let scope = Scope {
        snapshot: Some(snapshot),
        bound: HashSet::new(),
    };
    analyzer.expr(expr, &scope);
    analyzer.access
}

/// Footprint of calling `name` with arguments that touch nothing
pub fn function_footprint(name: &str, functions: &dyn FunctionLookup) -> AccessSet {
    let mut analyzer = Analyzer {
        functions,
        visited: HashSet::new(),
        access: AccessSet::pure(),
    };
    analyzer.call_named(name, &Scope::body(Vec::new()));
    analyzer.access
}

fn builtin_footprint(builtin: Builtin) -> AccessSet {
    match builtin {
        Builtin::Print => AccessSet::pure().write(Resource::handle("stdout")),
        Builtin::Len
        | Builtin::Str
        | Builtin::Sleep
        | Builtin::Combine
        | Builtin::Range
        | Builtin::TypeOf
        | Builtin::GroupSummary => AccessSet::pure(),
    }
}

/// Method names that never run user code
const INERT_METHODS: &[&str] = &[
    "is_pending",
    "is_resolved",
    "is_cancelled",
    "get_state",
    "get_execution_time",
    "cancel",
];

fn holds_unstarted(value: &Value) -> bool {
    match value {
        Value::Promise(p) => p.is_unstarted(),
        Value::List(items) => items.iter().any(holds_unstarted),
        Value::Record(fields) => fields.values().any(holds_unstarted),
        _ => false,
    }
}

struct Scope<'a> {
    snapshot: Option<&'a Env>,
    bound: HashSet<String>,
}

impl<'a> Scope<'a> {
    fn body(params: Vec<String>) -> Self {
        Scope {
            snapshot: None,
            bound: params.into_iter().collect(),
        }
    }

    fn captured(&self, name: &str) -> Option<&'a Value> {
        self.snapshot.and_then(|env| env.get(name))
    }
}

struct Analyzer<'f> {
    functions: &'f dyn FunctionLookup,
    visited: HashSet<String>,
    access: AccessSet,
}

impl<'f> Analyzer<'f> {
    fn expr(&mut self, expr: &Expr, scope: &Scope<'_>) {
        match &expr.node {
            ExprKind::Lit(_) => {}
            ExprKind::Var(name) => self.var(name, scope),
            ExprKind::BinOp { left, right, .. } => {
                self.expr(left, scope);
                self.expr(right, scope);
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand, scope),
            ExprKind::Call { func, args } => {
                for arg in args {
                    self.expr(arg, scope);
                }
                self.callee(func, scope);
            }
            ExprKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                self.expr(receiver, scope);
                for arg in args {
                    self.expr(arg, scope);
                }
                if !INERT_METHODS.contains(&method.as_str()) {
                    self.access.mark_unknown();
                }
            }
            ExprKind::Field { target, .. } => self.expr(target, scope),
            ExprKind::Index { target, index } => {
                self.expr(target, scope);
                self.expr(index, scope);
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item, scope);
                }
            }
            ExprKind::Record(fields) => {
                for (_, value) in fields {
                    self.expr(value, scope);
                }
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond, scope);
                self.expr(then_branch, scope);
                self.expr(else_branch, scope);
            }
        }
    }

    fn var(&mut self, name: &str, scope: &Scope<'_>) {
        if scope.bound.contains(name) {
            return;
        }
        if let Some(value) = scope.captured(name) {
            self.captured_value(value);
            return;
        }
        if self.functions.lookup_function(name).is_some() || Builtin::from_name(name).is_some() {
            return;
        }
        self.access.add_read(Resource::global(name));
        // Whatever runs when that promise is forced is not bounded here
        if let Some(value) = self.functions.lookup_global(name) {
            if holds_unstarted(&value) {
                self.access.mark_unknown();
            }
        }
    }

    /// Forcing a captured value runs every unstarted promise inside it
    fn captured_value(&mut self, value: &Value) {
        match value {
            Value::Promise(p) => {
                if p.is_unstarted() {
                    self.access.merge(p.footprint());
                }
            }
            Value::List(items) => {
                for item in items.iter() {
                    self.captured_value(item);
                }
            }
            Value::Record(fields) => {
                for value in fields.values() {
                    self.captured_value(value);
                }
            }
            _ => {}
        }
    }

    fn callee(&mut self, func: &Expr, scope: &Scope<'_>) {
        let ExprKind::Var(name) = &func.node else {
            self.expr(func, scope);
            self.access.mark_unknown();
            return;
        };
        if scope.bound.contains(name) {
            self.access.mark_unknown();
            return;
        }
        match scope.captured(name) {
            Some(Value::Function(target)) => self.call_named(target, scope),
            Some(Value::Builtin(b)) => self.access.merge(&builtin_footprint(*b)),
            Some(_) => self.access.mark_unknown(),
            None => self.call_named(name, scope),
        }
    }

    fn call_named(&mut self, name: &str, scope: &Scope<'_>) {
        if let Some(decl) = self.functions.lookup_function(name) {
            if self.visited.insert(decl.name.clone()) {
                let mut body = Scope::body(decl.params.clone());
                self.block(&decl.body, &mut body);
            }
        } else if let Some(b) = Builtin::from_name(name) {
            self.access.merge(&builtin_footprint(b));
        } else {
            // A global holding a callable, or nothing at all
            if !scope.bound.contains(name) {
                self.access.add_read(Resource::global(name));
            }
            self.access.mark_unknown();
        }
    }

    fn block(&mut self, stmts: &[Stmt], scope: &mut Scope<'_>) {
        for stmt in stmts {
            self.stmt(stmt, scope);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, scope: &mut Scope<'_>) {
        match &stmt.node {
            StmtKind::Let { name, value } => {
                self.expr(value, scope);
                scope.bound.insert(name.clone());
            }
            StmtKind::Assign { name, value } => {
                self.expr(value, scope);
                if !scope.bound.contains(name) {
                    self.access.add_write(Resource::global(name));
                }
            }
            StmtKind::Expr(expr) => self.expr(expr, scope),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond, scope);
                self.block(then_body, scope);
                self.block(else_body, scope);
            }
            StmtKind::While { cond, body } => {
                self.expr(cond, scope);
                self.block(body, scope);
            }
            StmtKind::For { var, iter, body } => {
                self.expr(iter, scope);
                scope.bound.insert(var.clone());
                self.block(body, scope);
            }
            StmtKind::Sequential(body) => self.block(body, scope),
            StmtKind::Return { value, .. } => {
                if let Some(value) = value {
                    self.expr(value, scope);
                }
            }
        }
    }
}
