//! Test support infrastructure.
//!
//! This module provides tools for:
//! - Building programs without a front end (a small AST builder DSL)
//! - Running programs and forcing their results while the interpreter lives
//! - Timing assertions for parallel and serialized resolution
//! - One-time `tracing` initialisation for tests
//!
//! Every builder produces nodes with an empty span. Use [`WithSpan::at`] when
//! a test needs distinct source locations.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use crate::ast::{
    BinOp, Delivery, Expr, ExprKind, FnDecl, Item, Literal, Program, Span, Spanned, Stmt,
    StmtKind, UnaryOp,
};
use crate::config::EngineConfig;
use crate::eval::{EvalError, Interpreter};
use crate::value::Value;

// ============================================================================
// Logging
// ============================================================================

static INIT_LOGGING: Once = Once::new();

/// Install a test-writer subscriber filtered by `RUST_LOG` (default `warn`)
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Expressions
// ============================================================================

fn expr(kind: ExprKind) -> Expr {
    Spanned::new(kind, Span::default())
}

fn stmt(kind: StmtKind) -> Stmt {
    Spanned::new(kind, Span::default())
}

pub trait WithSpan {
    fn at(self, start: usize, end: usize) -> Self;
}

impl<T> WithSpan for Spanned<T> {
    fn at(mut self, start: usize, end: usize) -> Self {
        self.span = Span::new(start, end);
        self
    }
}

pub fn int(n: i64) -> Expr {
    expr(ExprKind::Lit(Literal::Int(n)))
}

pub fn float(x: f64) -> Expr {
    expr(ExprKind::Lit(Literal::Float(x)))
}

pub fn string(s: &str) -> Expr {
    expr(ExprKind::Lit(Literal::String(s.to_string())))
}

pub fn boolean(b: bool) -> Expr {
    expr(ExprKind::Lit(Literal::Bool(b)))
}

pub fn unit() -> Expr {
    expr(ExprKind::Lit(Literal::Unit))
}

pub fn var(name: &str) -> Expr {
    expr(ExprKind::Var(name.to_string()))
}

pub fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
    expr(ExprKind::BinOp {
        op,
        left: Arc::new(left),
        right: Arc::new(right),
    })
}

pub fn add(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Add, left, right)
}

pub fn sub(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Sub, left, right)
}

pub fn mul(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Mul, left, right)
}

pub fn div(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Div, left, right)
}

pub fn modulo(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Mod, left, right)
}

pub fn eq(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Eq, left, right)
}

pub fn lt(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Lt, left, right)
}

pub fn gt(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Gt, left, right)
}

pub fn and(left: Expr, right: Expr) -> Expr {
    binop(BinOp::And, left, right)
}

pub fn or(left: Expr, right: Expr) -> Expr {
    binop(BinOp::Or, left, right)
}

pub fn neg(operand: Expr) -> Expr {
    expr(ExprKind::UnaryOp {
        op: UnaryOp::Neg,
        operand: Arc::new(operand),
    })
}

pub fn not(operand: Expr) -> Expr {
    expr(ExprKind::UnaryOp {
        op: UnaryOp::Not,
        operand: Arc::new(operand),
    })
}

/// Call a function or builtin by name
pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    call_expr(var(name), args)
}

pub fn call_expr(func: Expr, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call {
        func: Arc::new(func),
        args,
    })
}

pub fn method(receiver: Expr, name: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::MethodCall {
        receiver: Arc::new(receiver),
        method: name.to_string(),
        args,
    })
}

pub fn field(target: Expr, name: &str) -> Expr {
    expr(ExprKind::Field {
        target: Arc::new(target),
        field: name.to_string(),
    })
}

pub fn index(target: Expr, idx: Expr) -> Expr {
    expr(ExprKind::Index {
        target: Arc::new(target),
        index: Arc::new(idx),
    })
}

pub fn list(items: Vec<Expr>) -> Expr {
    expr(ExprKind::List(items))
}

pub fn record(fields: Vec<(&str, Expr)>) -> Expr {
    expr(ExprKind::Record(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    ))
}

pub fn if_expr(cond: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
    expr(ExprKind::If {
        cond: Arc::new(cond),
        then_branch: Arc::new(then_branch),
        else_branch: Arc::new(else_branch),
    })
}

// ============================================================================
// Statements
// ============================================================================

pub fn let_(name: &str, value: Expr) -> Stmt {
    stmt(StmtKind::Let {
        name: name.to_string(),
        value,
    })
}

pub fn assign(name: &str, value: Expr) -> Stmt {
    stmt(StmtKind::Assign {
        name: name.to_string(),
        value,
    })
}

pub fn expr_stmt(value: Expr) -> Stmt {
    stmt(StmtKind::Expr(value))
}

pub fn if_stmt(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::If {
        cond,
        then_body,
        else_body,
    })
}

pub fn while_(cond: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::While { cond, body })
}

pub fn for_(name: &str, iter: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::For {
        var: name.to_string(),
        iter,
        body,
    })
}

pub fn sequential(body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Sequential(body))
}

/// Lazy terminator: `return E`
pub fn ret(value: Expr) -> Stmt {
    stmt(StmtKind::Return {
        delivery: Delivery::Lazy,
        value: Some(Arc::new(value)),
    })
}

/// Bare `return`
pub fn ret_unit() -> Stmt {
    stmt(StmtKind::Return {
        delivery: Delivery::Lazy,
        value: None,
    })
}

/// Eager terminator: `deliver E`
pub fn deliver(value: Expr) -> Stmt {
    stmt(StmtKind::Return {
        delivery: Delivery::Eager,
        value: Some(Arc::new(value)),
    })
}

// ============================================================================
// Items
// ============================================================================

/// Builder for a function declaration; finish with [`DefBuilder::body`]
pub struct DefBuilder {
    name: String,
    params: Vec<String>,
    ret_type: Option<String>,
    timeout_ms: Option<u64>,
}

pub fn def(name: &str) -> DefBuilder {
    DefBuilder {
        name: name.to_string(),
        params: Vec::new(),
        ret_type: None,
        timeout_ms: None,
    }
}

impl DefBuilder {
    pub fn params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn returns(mut self, ty: &str) -> Self {
        self.ret_type = Some(ty.to_string());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn body(self, body: Vec<Stmt>) -> Item {
        Item::Function(Arc::new(self.decl(body)))
    }

    pub fn decl(self, body: Vec<Stmt>) -> FnDecl {
        FnDecl {
            name: self.name,
            params: self.params,
            body,
            ret_type: self.ret_type,
            timeout_ms: self.timeout_ms,
            span: Span::default(),
        }
    }
}

pub fn global(name: &str, value: Expr) -> Item {
    Item::Global {
        name: name.to_string(),
        value,
        span: Span::default(),
    }
}

pub fn expr_item(value: Expr) -> Item {
    Item::Stmt(expr_stmt(value))
}

pub fn stmt_item(s: Stmt) -> Item {
    Item::Stmt(s)
}

pub fn program(items: Vec<Item>) -> Program {
    Program::new(items)
}

// ============================================================================
// Running programs
// ============================================================================

pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_workers(4)
}

/// Interpreter with a four-worker pool and captured `print` output
pub fn test_interpreter() -> Interpreter {
    test_interpreter_with(test_config())
}

pub fn test_interpreter_with(config: EngineConfig) -> Interpreter {
    init_test_logging();
    let interp = Interpreter::new(config).expect("worker pool should start");
    interp.capture_output();
    interp
}

/// Run a program and force its result completely. Promises hold the
/// interpreter weakly, so forcing must happen before it is dropped.
pub fn run_program(program: &Program) -> Result<Value, EvalError> {
    let interp = test_interpreter();
    interp.run(program)?.force_deep()
}

/// Run a program expecting success
pub fn run_program_ok(program: &Program) -> Value {
    match run_program(program) {
        Ok(value) => value,
        Err(e) => panic!("Program failed: {:?}\nProgram:\n{:#?}", e, program),
    }
}

/// Run a program expecting a specific error
pub fn run_program_err<F>(program: &Program, check: F)
where
    F: FnOnce(&EvalError) -> bool,
{
    match run_program(program) {
        Ok(value) => panic!(
            "Expected error but program produced {}.\nProgram:\n{:#?}",
            value, program
        ),
        Err(e) => {
            assert!(check(&e), "Wrong error type.\nActual: {:?}", e);
        }
    }
}

/// Run `f` and measure its wall-clock time
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed())
}

/// Assert a duration lies in `[min_ms, max_ms]`
pub fn assert_between(elapsed: Duration, min_ms: u64, max_ms: u64) {
    let ms = elapsed.as_millis() as u64;
    assert!(
        (min_ms..=max_ms).contains(&ms),
        "expected {}..={} ms, took {} ms",
        min_ms,
        max_ms,
        ms
    );
}

// ============================================================================
// Test Macros
// ============================================================================

/// Macro for asserting a program produces a value
#[macro_export]
macro_rules! assert_program_value {
    ($program:expr, $expected:expr) => {
        assert_eq!(
            $crate::test_support::run_program_ok(&$program),
            $crate::value::Value::from($expected)
        )
    };
}
