//! Tree-walking evaluator with dual delivery
//!
//! Evaluation is synchronous and runs in source order on the calling thread.
//! The one exception is a lazy terminator (`return E`): instead of
//! evaluating `E`, the dispatcher captures it together with a snapshot of the
//! current locals and hands back a [`Promise`]. Promises flow through the
//! evaluator untouched until an operator, condition, call or field access
//! needs their value, at which point they are resolved at that site.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::ast::{
    BinOp, Delivery, Expr, ExprKind, FnDecl, Item, Literal, Program, Span, Spanned, Stmt, StmtKind,
};
use crate::config::EngineConfig;
use crate::conflict::{self, AccessSet, FunctionLookup};
use crate::errors::find_similar;
use crate::events::EventSink;
use crate::group::ResolutionGroup;
use crate::operators;
use crate::pool::PoolError;
use crate::promise::{ErrorContext, Footprint, Outcome, Promise, PromiseSpec, Site, Thunk};
use crate::runtime::ExecutionBoundary;
use crate::table::PromiseId;
use crate::value::{Builtin, Value};

#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("unbound variable: {name}")]
    UnboundVariable { name: String, suggestions: Vec<String> },
    #[error("type error: {0}")]
    TypeError(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("{type_name} has no field `{field}`")]
    NoSuchField { field: String, type_name: &'static str },
    #[error("{function} expects {expected} argument(s), got {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("`{method}` is not applicable to a concrete {type_name}")]
    NotApplicable { method: String, type_name: &'static str },
    #[error("runtime error: {0}")]
    RuntimeError(String),
    /// The deferred computation failed; carries where it was created and
    /// where it was resolved
    #[error("{0}")]
    ThunkExecution(Arc<ErrorContext>),
    #[error("promise {promise} timed out after {after:?}")]
    Timeout { promise: PromiseId, after: Duration },
    #[error("promise {promise} was cancelled")]
    Cancelled { promise: PromiseId },
    #[error("promise {promise} depends on its own result")]
    CyclicResolution { promise: PromiseId },
    #[error("worker pool has shut down")]
    PoolShutdown,
}

impl EvalError {
    /// The innermost failure, looking through deferred-execution wrappers
    pub fn root_cause(&self) -> &EvalError {
        match self {
            EvalError::ThunkExecution(ctx) => ctx.cause.root_cause(),
            other => other,
        }
    }

    /// The outermost deferred-execution context, if any
    pub fn context(&self) -> Option<&Arc<ErrorContext>> {
        match self {
            EvalError::ThunkExecution(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), EvalError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), EvalError::Cancelled { .. })
    }
}

impl From<PoolError> for EvalError {
    fn from(_: PoolError) -> Self {
        EvalError::PoolShutdown
    }
}

// ============================================================================
// Environments and frames
// ============================================================================

/// Local bindings of one frame. Frames hold it behind an `Arc`; writes copy
/// on demand, so a snapshot taken by a lazy return never changes.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(name.into(), value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Explicit evaluation context for one dynamic call
pub struct Frame {
    locals: Arc<Env>,
    /// Receives the promises returned by calls made from this frame
    group: ResolutionGroup,
    /// The caller's group; this frame's lazy returns are registered there
    return_group: Option<ResolutionGroup>,
    decl: Option<Arc<FnDecl>>,
    function: Option<Arc<str>>,
    /// Inside a `sequential` block
    sequential: bool,
    /// A lazy return captured this frame's group
    captured: bool,
}

impl Frame {
    pub fn locals(&self) -> &Env {
        &self.locals
    }

    pub fn group(&self) -> &ResolutionGroup {
        &self.group
    }

    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    fn bind(&mut self, name: &str, value: Value) {
        // The old value is dropped here; it may be the last handle to a
        // pending promise
        Arc::make_mut(&mut self.locals).insert(name, value);
    }
}

/// How a statement finished
#[derive(Debug)]
pub enum Flow {
    Normal,
    Return(Value),
}

enum Output {
    Stdout,
    Captured(Vec<String>),
}

struct Shared {
    functions: RwLock<HashMap<String, Arc<FnDecl>>>,
    globals: RwLock<HashMap<String, Value>>,
    boundary: Arc<ExecutionBoundary>,
    top_group: ResolutionGroup,
    output: Mutex<Output>,
}

impl FunctionLookup for Shared {
    fn lookup_function(&self, name: &str) -> Option<Arc<FnDecl>> {
        self.functions.read().get(name).cloned()
    }

    fn lookup_global(&self, name: &str) -> Option<Value> {
        self.globals.read().get(name).cloned()
    }
}

/// Inspection methods; they apply to promises only and never resolve
const INSPECTION_METHODS: &[&str] = &[
    "is_pending",
    "is_resolved",
    "is_cancelled",
    "get_state",
    "cancel",
    "get_execution_time",
    "add_callback",
];

// ============================================================================
// Interpreter
// ============================================================================

/// Cheap to clone; clones share functions, globals and the execution
/// boundary. Promises hold the interpreter weakly, so a promise resolved
/// after every interpreter handle is gone fails with a runtime error.
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

impl Interpreter {
    pub fn new(config: EngineConfig) -> Result<Self, PoolError> {
        Ok(Self::with_boundary(ExecutionBoundary::new(config)?))
    }

    pub fn with_sink(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self, PoolError> {
        Ok(Self::with_boundary(ExecutionBoundary::with_sink(config, sink)?))
    }

    pub fn with_boundary(boundary: Arc<ExecutionBoundary>) -> Self {
        let top_group = boundary.new_group("<top>");
        Self {
            shared: Arc::new(Shared {
                functions: RwLock::new(HashMap::new()),
                globals: RwLock::new(HashMap::new()),
                boundary,
                top_group,
                output: Mutex::new(Output::Stdout),
            }),
        }
    }

    pub fn boundary(&self) -> &Arc<ExecutionBoundary> {
        &self.shared.boundary
    }

    /// The group that collects promises returned to top-level code and to
    /// host calls
    pub fn top_group(&self) -> &ResolutionGroup {
        &self.shared.top_group
    }

    /// Collect `print` output in memory instead of writing to stdout
    pub fn capture_output(&self) {
        *self.shared.output.lock() = Output::Captured(Vec::new());
    }

    pub fn take_output(&self) -> Vec<String> {
        match &mut *self.shared.output.lock() {
            Output::Captured(lines) => std::mem::take(lines),
            Output::Stdout => Vec::new(),
        }
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.shared.globals.read().get(name).cloned()
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        let old = self.shared.globals.write().insert(name.into(), value);
        drop(old);
    }

    pub fn define(&self, decl: Arc<FnDecl>) {
        self.shared.functions.write().insert(decl.name.clone(), decl);
    }

    /// Footprint of calling a declared function
    pub fn function_footprint(&self, name: &str) -> AccessSet {
        conflict::function_footprint(name, &*self.shared)
    }

    /// Run a program. Functions are visible from the start; globals and
    /// statements run in order. Returns the value of a top-level terminator,
    /// or of the final expression statement.
    pub fn run(&self, program: &Program) -> Result<Value, EvalError> {
        for decl in program.functions() {
            self.define(Arc::clone(decl));
        }
        let mut frame = self.top_frame();
        let mut last = Value::Unit;
        for item in &program.items {
            match item {
                Item::Function(_) => {}
                Item::Global { name, value, .. } => {
                    let value = self.eval_expr(&mut frame, value)?;
                    self.set_global(name.clone(), value);
                    last = Value::Unit;
                }
                Item::Stmt(Spanned {
                    node: StmtKind::Expr(expr),
                    ..
                }) => {
                    last = self.eval_expr(&mut frame, expr)?;
                }
                Item::Stmt(stmt) => {
                    if let Flow::Return(value) = self.exec_stmt(&mut frame, stmt)? {
                        return Ok(value);
                    }
                    last = Value::Unit;
                }
            }
        }
        Ok(last)
    }

    /// Call a declared function or builtin by name from host code
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let frame = self.top_frame();
        let callee = self.lookup(&frame, name)?;
        self.apply(&frame, &callee, args, &Site::host())
    }

    /// Call a function value from host code
    pub fn call_value(&self, callee: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
        let frame = self.top_frame();
        let callee = callee.force()?;
        self.apply(&frame, &callee, args, &Site::host())
    }

    pub fn top_frame(&self) -> Frame {
        Frame {
            locals: Arc::new(Env::new()),
            group: self.shared.top_group.clone(),
            return_group: None,
            decl: None,
            function: None,
            sequential: false,
            captured: false,
        }
    }

    fn site(&self, frame: &Frame, span: Span) -> Site {
        Site::new(frame.function.clone(), span)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn exec_block(&self, frame: &mut Frame, stmts: &[Stmt]) -> Result<Flow, EvalError> {
        for stmt in stmts {
            if let Flow::Return(value) = self.exec_stmt(frame, stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    pub fn exec_stmt(&self, frame: &mut Frame, stmt: &Stmt) -> Result<Flow, EvalError> {
        match &stmt.node {
            StmtKind::Let { name, value } => {
                let value = self.eval_expr(frame, value)?;
                frame.bind(name, value);
            }
            StmtKind::Assign { name, value } => {
                let value = self.eval_expr(frame, value)?;
                self.assign(frame, name, value)?;
            }
            StmtKind::Expr(expr) => {
                self.eval_expr(frame, expr)?;
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let body = if self.condition(frame, cond)? {
                    then_body
                } else {
                    else_body
                };
                return self.exec_block(frame, body);
            }
            StmtKind::While { cond, body } => {
                while self.condition(frame, cond)? {
                    if let Flow::Return(value) = self.exec_block(frame, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::For { var, iter, body } => {
                let site = self.site(frame, iter.span);
                let items = self.eval_expr(frame, iter)?;
                for item in operators::iterate(&items, &site)? {
                    frame.bind(var, item);
                    if let Flow::Return(value) = self.exec_block(frame, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::Sequential(body) => {
                let outer = std::mem::replace(&mut frame.sequential, true);
                let flow = self.exec_block(frame, body);
                frame.sequential = outer;
                return flow;
            }
            StmtKind::Return { delivery, value } => {
                let value = self.exec_terminator(frame, *delivery, value.as_ref(), stmt.span)?;
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&self, frame: &mut Frame, name: &str, value: Value) -> Result<(), EvalError> {
        if frame.locals.contains(name) {
            frame.bind(name, value);
            return Ok(());
        }
        let old = {
            let mut globals = self.shared.globals.write();
            match globals.get_mut(name) {
                Some(slot) => std::mem::replace(slot, value),
                None => {
                    drop(globals);
                    return Err(self.unbound(frame, name));
                }
            }
        };
        // Dropped outside the lock
        drop(old);
        Ok(())
    }

    /// The Dual-Delivery Dispatcher. `deliver E` evaluates and resolves `E`
    /// now; `return E` defers it; a bare `return` is `Unit`.
    pub fn exec_terminator(
        &self,
        frame: &mut Frame,
        delivery: Delivery,
        value: Option<&Arc<Expr>>,
        span: Span,
    ) -> Result<Value, EvalError> {
        let Some(expr) = value else {
            return Ok(Value::Unit);
        };
        let site = self.site(frame, span);
        match delivery {
            Delivery::Eager => self.eval_expr(frame, expr)?.force_at(&site),
            Delivery::Lazy => Ok(Value::Promise(self.defer_expr(frame, expr, site))),
        }
    }

    fn defer_expr(&self, frame: &mut Frame, expr: &Arc<Expr>, origin: Site) -> Promise {
        let snapshot = Arc::clone(&frame.locals);
        let (declared_type, timeout) = match &frame.decl {
            Some(decl) => (
                decl.ret_type.as_deref().map(Arc::from),
                decl.timeout_ms.map(Duration::from_millis),
            ),
            None => (None, None),
        };
        let timeout = timeout.or_else(|| self.shared.boundary.config().default_timeout());

        let footprint = {
            let shared = Arc::downgrade(&self.shared);
            let expr = Arc::clone(expr);
            let snapshot = Arc::clone(&snapshot);
            Footprint::Computed(Box::new(move || match shared.upgrade() {
                Some(shared) => conflict::expr_footprint(&expr, &snapshot, &*shared),
                None => AccessSet::unknown(),
            }))
        };

        let thunk: Thunk = {
            let shared = Arc::downgrade(&self.shared);
            let expr = Arc::clone(expr);
            let group = frame.group.clone();
            let decl = frame.decl.clone();
            let function = frame.function.clone();
            Box::new(move || {
                let shared = shared.upgrade().ok_or_else(|| {
                    EvalError::RuntimeError("interpreter dropped before the promise resolved".into())
                })?;
                let interp = Interpreter { shared };
                let mut frame = Frame {
                    locals: snapshot,
                    group,
                    return_group: None,
                    decl,
                    function,
                    sequential: false,
                    captured: false,
                };
                interp.eval_expr(&mut frame, &expr)
            })
        };

        frame.captured = true;
        let spec = PromiseSpec {
            origin,
            declared_type,
            timeout,
            footprint,
        };
        let group = frame.return_group.as_ref().unwrap_or(&frame.group);
        let promise = self.shared.boundary.defer(spec, thunk, Some(group));
        tracing::trace!(promise = %promise.id(), function = ?frame.function, "deferred return");
        promise
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn eval_expr(&self, frame: &mut Frame, expr: &Expr) -> Result<Value, EvalError> {
        match &expr.node {
            ExprKind::Lit(lit) => Ok(literal(lit)),

            ExprKind::Var(name) => self.lookup(frame, name),

            ExprKind::BinOp { op, left, right } if op.is_short_circuit() => {
                let site = self.site(frame, expr.span);
                let left = self.eval_expr(frame, left)?.force_at(&site)?.truthy()?;
                match (op, left) {
                    (BinOp::And, false) => Ok(Value::Bool(false)),
                    (BinOp::Or, true) => Ok(Value::Bool(true)),
                    _ => {
                        let right = self.eval_expr(frame, right)?.force_at(&site)?.truthy()?;
                        Ok(Value::Bool(right))
                    }
                }
            }

            ExprKind::BinOp { op, left, right } => {
                let left = self.eval_expr(frame, left)?;
                let right = self.eval_expr(frame, right)?;
                operators::binop(*op, &left, &right, &self.site(frame, expr.span))
            }

            ExprKind::UnaryOp { op, operand } => {
                let operand = self.eval_expr(frame, operand)?;
                operators::unary(*op, &operand, &self.site(frame, expr.span))
            }

            ExprKind::Call { func, args } => {
                let site = self.site(frame, expr.span);
                let callee = self.eval_expr(frame, func)?.force_at(&site)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(frame, arg)?);
                }
                let result = self.apply(frame, &callee, values, &site)?;
                if frame.sequential {
                    result.force_at(&site)
                } else {
                    Ok(result)
                }
            }

            ExprKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                let site = self.site(frame, expr.span);
                let receiver = self.eval_expr(frame, receiver)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(frame, arg)?);
                }
                if INSPECTION_METHODS.contains(&method.as_str()) {
                    return self.inspect(&receiver, method, values, &site);
                }
                let callee = match receiver.force_at(&site)? {
                    Value::Record(fields) => fields.get(method.as_str()).cloned().ok_or_else(|| {
                        EvalError::NoSuchField {
                            field: method.clone(),
                            type_name: "Record",
                        }
                    })?,
                    other => {
                        return Err(EvalError::NotApplicable {
                            method: method.clone(),
                            type_name: other.type_name(),
                        })
                    }
                };
                let callee = callee.force_at(&site)?;
                let result = self.apply(frame, &callee, values, &site)?;
                if frame.sequential {
                    result.force_at(&site)
                } else {
                    Ok(result)
                }
            }

            ExprKind::Field { target, field } => {
                let target = self.eval_expr(frame, target)?;
                operators::field(&target, field, &self.site(frame, expr.span))
            }

            ExprKind::Index { target, index } => {
                let target = self.eval_expr(frame, target)?;
                let index = self.eval_expr(frame, index)?;
                operators::index(&target, &index, &self.site(frame, expr.span))
            }

            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(frame, item)?);
                }
                Ok(Value::list(values))
            }

            ExprKind::Record(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    values.push((name.clone(), self.eval_expr(frame, value)?));
                }
                Ok(Value::record(values))
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.condition(frame, cond)? {
                    self.eval_expr(frame, then_branch)
                } else {
                    self.eval_expr(frame, else_branch)
                }
            }
        }
    }

    fn condition(&self, frame: &mut Frame, cond: &Expr) -> Result<bool, EvalError> {
        let site = self.site(frame, cond.span);
        self.eval_expr(frame, cond)?.force_at(&site)?.truthy()
    }

    fn lookup(&self, frame: &Frame, name: &str) -> Result<Value, EvalError> {
        if let Some(value) = frame.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.shared.globals.read().get(name) {
            return Ok(value.clone());
        }
        if self.shared.functions.read().contains_key(name) {
            return Ok(Value::Function(Arc::from(name)));
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(self.unbound(frame, name))
    }

    fn unbound(&self, frame: &Frame, name: &str) -> EvalError {
        let globals = self.shared.globals.read();
        let functions = self.shared.functions.read();
        let candidates = frame
            .locals
            .names()
            .chain(globals.keys().map(String::as_str))
            .chain(functions.keys().map(String::as_str))
            .chain(Builtin::ALL.iter().map(|b| b.name() as &str));
        EvalError::UnboundVariable {
            name: name.to_string(),
            suggestions: find_similar(name, candidates, 2),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn apply(
        &self,
        frame: &Frame,
        callee: &Value,
        args: Vec<Value>,
        site: &Site,
    ) -> Result<Value, EvalError> {
        match callee {
            Value::Function(name) => {
                let decl = self
                    .shared
                    .lookup_function(name)
                    .ok_or_else(|| self.unbound(frame, name))?;
                self.call_function(&decl, args, frame)
            }
            Value::Builtin(builtin) => self.call_builtin(*builtin, args, frame, site),
            other => Err(EvalError::TypeError(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &self,
        decl: &Arc<FnDecl>,
        args: Vec<Value>,
        caller: &Frame,
    ) -> Result<Value, EvalError> {
        if args.len() != decl.params.len() {
            return Err(EvalError::ArityMismatch {
                function: decl.name.clone(),
                expected: decl.params.len(),
                found: args.len(),
            });
        }
        let mut locals = Env::new();
        for (param, arg) in decl.params.iter().zip(args) {
            locals.insert(param.clone(), arg);
        }
        let mut frame = Frame {
            locals: Arc::new(locals),
            group: self.shared.boundary.new_group(&decl.name),
            return_group: Some(caller.group.clone()),
            decl: Some(Arc::clone(decl)),
            function: Some(Arc::from(decl.name.as_str())),
            sequential: false,
            captured: false,
        };

        let flow = self.exec_block(&mut frame, &decl.body);
        if !frame.captured {
            frame.group.dissolve();
        }
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Unit),
        }
    }

    fn call_builtin(
        &self,
        builtin: Builtin,
        args: Vec<Value>,
        frame: &Frame,
        site: &Site,
    ) -> Result<Value, EvalError> {
        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(EvalError::ArityMismatch {
                    function: builtin.name().to_string(),
                    expected,
                    found: args.len(),
                })
            }
        };

        match builtin {
            Builtin::Print => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in &args {
                    parts.push(arg.force_at(site)?.force_deep()?.to_string());
                }
                self.write_line(parts.join(" "));
                Ok(Value::Unit)
            }
            Builtin::Len => {
                arity(1)?;
                match args[0].force_at(site)? {
                    Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    Value::Record(fields) => Ok(Value::Int(fields.len() as i64)),
                    other => Err(EvalError::TypeError(format!(
                        "len() of {}",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Str => {
                arity(1)?;
                let value = args[0].force_at(site)?.force_deep()?;
                Ok(Value::str(value.to_string()))
            }
            Builtin::Sleep => {
                arity(1)?;
                let ms = match args[0].force_at(site)? {
                    Value::Int(ms) if ms >= 0 => ms as u64,
                    Value::Float(ms) if ms >= 0.0 => ms as u64,
                    other => {
                        return Err(EvalError::TypeError(format!(
                            "sleep() expects a non-negative number of milliseconds, got {}",
                            other.type_name()
                        )))
                    }
                };
                std::thread::sleep(Duration::from_millis(ms));
                Ok(Value::Unit)
            }
            Builtin::Combine => {
                // Resolving the first member batches its pending siblings
                let mut values = Vec::with_capacity(args.len());
                for arg in &args {
                    values.push(arg.force_at(site)?);
                }
                Ok(Value::list(values))
            }
            Builtin::Range => {
                let int = |v: &Value| match v.force_at(site)? {
                    Value::Int(n) => Ok(n),
                    other => Err(EvalError::TypeError(format!(
                        "range() expects Int, got {}",
                        other.type_name()
                    ))),
                };
                let (start, end) = match args.as_slice() {
                    [end] => (0, int(end)?),
                    [start, end] => (int(start)?, int(end)?),
                    _ => {
                        return Err(EvalError::ArityMismatch {
                            function: "range".into(),
                            expected: 2,
                            found: args.len(),
                        })
                    }
                };
                Ok(Value::list((start..end).map(Value::Int).collect()))
            }
            Builtin::TypeOf => {
                arity(1)?;
                match &args[0] {
                    Value::Promise(p) if p.is_pending() => {
                        Ok(Value::str(p.declared_type().unwrap_or("Promise")))
                    }
                    other => Ok(Value::str(other.force_at(site)?.type_name())),
                }
            }
            Builtin::GroupSummary => {
                let group = match args.as_slice() {
                    [] => frame.group.clone(),
                    [Value::Promise(p)] => p.group().ok_or_else(|| {
                        EvalError::RuntimeError("promise's group has been dissolved".into())
                    })?,
                    [other] => {
                        return Err(EvalError::NotApplicable {
                            method: "group_summary".into(),
                            type_name: other.type_name(),
                        })
                    }
                    _ => {
                        return Err(EvalError::ArityMismatch {
                            function: "group_summary".into(),
                            expected: 1,
                            found: args.len(),
                        })
                    }
                };
                let summary = group.summary();
                Ok(Value::record([
                    ("pending", Value::Int(summary.pending as i64)),
                    ("resolved", Value::Int(summary.resolved as i64)),
                    ("failed", Value::Int(summary.failed.len() as i64)),
                    ("cancelled", Value::Int(summary.cancelled as i64)),
                ]))
            }
        }
    }

    fn write_line(&self, line: String) {
        match &mut *self.shared.output.lock() {
            Output::Stdout => println!("{}", line),
            Output::Captured(lines) => lines.push(line),
        }
    }

    // ------------------------------------------------------------------
    // Promise inspection
    // ------------------------------------------------------------------

    fn inspect(
        &self,
        receiver: &Value,
        method: &str,
        args: Vec<Value>,
        site: &Site,
    ) -> Result<Value, EvalError> {
        let Value::Promise(promise) = receiver else {
            return Err(EvalError::NotApplicable {
                method: method.to_string(),
                type_name: receiver.type_name(),
            });
        };
        let expected = usize::from(method == "add_callback");
        if args.len() != expected {
            return Err(EvalError::ArityMismatch {
                function: method.to_string(),
                expected,
                found: args.len(),
            });
        }
        match method {
            "is_pending" => Ok(Value::Bool(promise.is_pending())),
            "is_resolved" => Ok(Value::Bool(promise.is_resolved())),
            "is_cancelled" => Ok(Value::Bool(promise.is_cancelled())),
            "get_state" => Ok(Value::str(promise.state().name())),
            "cancel" => Ok(Value::Bool(promise.cancel())),
            "get_execution_time" => Ok(promise
                .execution_time()
                .map(|d| Value::Float(d.as_secs_f64() * 1000.0))
                .unwrap_or(Value::Unit)),
            _ => {
                let callback = args[0].force_at(site)?;
                self.register_callback(promise, callback);
                Ok(Value::Unit)
            }
        }
    }

    /// The callback runs with the resolved value. Failed and cancelled
    /// outcomes skip it.
    fn register_callback(&self, promise: &Promise, callback: Value) {
        let shared = Arc::downgrade(&self.shared);
        let id = promise.id();
        promise.add_callback(move |outcome| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let interp = Interpreter { shared };
            match outcome {
                Outcome::Resolved(value) => {
                    let result = interp
                        .call_value(&callback, vec![value.clone()])
                        .and_then(|r| r.force());
                    if let Err(err) = result {
                        tracing::warn!(promise = %id, error = %err, "promise callback failed");
                    }
                }
                Outcome::Failed(err) => {
                    tracing::debug!(promise = %id, error = %err, "callback skipped, promise failed");
                }
                Outcome::Cancelled(_) => {
                    tracing::debug!(promise = %id, "callback skipped, promise cancelled");
                }
            }
        });
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("functions", &self.shared.functions.read().len())
            .field("globals", &self.shared.globals.read().len())
            .field("boundary", &self.shared.boundary)
            .finish()
    }
}

fn literal(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(x) => Value::Float(*x),
        Literal::String(s) => Value::str(s),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Unit => Value::Unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_eager_delivery_is_concrete() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![deliver(add(int(5), int(2)))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        assert!(matches!(value, Value::Int(7)));
    }

    #[test]
    fn test_lazy_delivery_is_pending() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![ret(add(int(5), int(2)))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        let p = value.as_promise().unwrap();
        assert!(p.is_pending());
        assert_eq!(value.force().unwrap(), Value::Int(7));
    }

    #[test]
    fn test_bare_return_is_unit() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![ret_unit()]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        assert!(matches!(value, Value::Unit));
    }

    #[test]
    fn test_falling_off_the_end_is_unit() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![let_("x", int(1))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        assert!(matches!(value, Value::Unit));
    }

    #[test]
    fn test_snapshot_ignores_later_assignment() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![
                    let_("x", int(1)),
                    let_("p", call("g", vec![var("x")])),
                    assign("x", int(100)),
                    deliver(var("p")),
                ]),
                def("g").params(&["n"]).body(vec![ret(add(var("n"), int(1)))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        assert_eq!(value, Value::Int(2));
    }

    #[test]
    fn test_callee_snapshot_is_authoritative() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("g").body(vec![
                    let_("y", int(1)),
                    let_("p", call("h", vec![var("y")])),
                    ret(var("p")),
                ]),
                def("h").params(&["v"]).body(vec![ret(mul(var("v"), int(10)))]),
                expr_item(call("g", vec![])),
            ]))
            .unwrap();
        assert_eq!(value.force().unwrap(), Value::Int(10));
    }

    #[test]
    fn test_unbound_variable_suggests() {
        let interp = test_interpreter();
        let err = interp
            .run(&program(vec![
                global("counter", int(0)),
                expr_item(var("countr")),
            ]))
            .unwrap_err();
        match err {
            EvalError::UnboundVariable { name, suggestions } => {
                assert_eq!(name, "countr");
                assert_eq!(suggestions, vec!["counter".to_string()]);
            }
            other => panic!("expected unbound variable, got {other:?}"),
        }
    }

    #[test]
    fn test_assign_to_undeclared_is_error() {
        let interp = test_interpreter();
        let err = interp
            .run(&program(vec![stmt_item(assign("nope", int(1)))]))
            .unwrap_err();
        assert!(matches!(err, EvalError::UnboundVariable { .. }));
    }

    #[test]
    fn test_arity_mismatch() {
        let interp = test_interpreter();
        let err = interp
            .run(&program(vec![
                def("f").params(&["a"]).body(vec![deliver(var("a"))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::ArityMismatch { expected: 1, found: 0, .. }
        ));
    }

    #[test]
    fn test_short_circuit_skips_right() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![expr_item(and(
                boolean(false),
                div(int(1), int(0)),
            ))]))
            .unwrap();
        assert!(matches!(value, Value::Bool(false)));
    }

    #[test]
    fn test_inspection_on_concrete_value_not_applicable() {
        let interp = test_interpreter();
        let err = interp
            .run(&program(vec![expr_item(method(int(7), "is_pending", vec![]))]))
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::NotApplicable { type_name: "Int", .. }
        ));
    }

    #[test]
    fn test_record_function_field_is_callable() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("double").params(&["n"]).body(vec![deliver(mul(var("n"), int(2)))]),
                stmt_item(let_("ops", record(vec![("double", var("double"))]))),
                expr_item(method(var("ops"), "double", vec![int(21)])),
            ]))
            .unwrap();
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn test_type_of_pending_uses_declared_type() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").returns("Int").body(vec![ret(int(1))]),
                stmt_item(let_("p", call("f", vec![]))),
                expr_item(call("type_of", vec![var("p")])),
            ]))
            .unwrap();
        assert_eq!(value, Value::str("Int"));
    }

    #[test]
    fn test_print_is_captured() {
        let interp = test_interpreter();
        interp.capture_output();
        interp
            .run(&program(vec![
                stmt_item(expr_stmt(call("print", vec![string("a"), int(1)]))),
                stmt_item(expr_stmt(call("print", vec![list(vec![string("b")])]))),
            ]))
            .unwrap();
        assert_eq!(interp.take_output(), vec!["a 1", "[\"b\"]"]);
    }

    #[test]
    fn test_for_and_while() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                global("total", int(0)),
                stmt_item(for_(
                    "i",
                    call("range", vec![int(5)]),
                    vec![assign("total", add(var("total"), var("i")))],
                )),
                stmt_item(while_(
                    lt(var("total"), int(20)),
                    vec![assign("total", add(var("total"), int(5)))],
                )),
                expr_item(var("total")),
            ]))
            .unwrap();
        assert_eq!(value, Value::Int(20));
    }

    #[test]
    fn test_host_call() {
        let interp = test_interpreter();
        interp
            .run(&program(vec![def("add1")
                .params(&["n"])
                .body(vec![ret(add(var("n"), int(1)))])]))
            .unwrap();
        let value = interp.call("add1", vec![Value::Int(41)]).unwrap();
        assert!(value.is_promise());
        assert_eq!(value.force().unwrap(), Value::Int(42));
    }

    #[test]
    fn test_promise_outliving_interpreter_fails_cleanly() {
        let interp = test_interpreter();
        let value = interp
            .run(&program(vec![
                def("f").body(vec![ret(int(1))]),
                expr_item(call("f", vec![])),
            ]))
            .unwrap();
        drop(interp);
        let err = value.force().unwrap_err();
        assert!(matches!(err.root_cause(), EvalError::RuntimeError(_)));
    }
}
