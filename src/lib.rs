//! Latent - transparent deferred values with eager and lazy delivery
//!
//! A function ends with either `deliver E` (evaluate now) or `return E`
//! (hand back a promise for `E`). Promises are indistinguishable from the
//! values they stand for until something needs the value; sibling promises
//! are then resolved together on a shared worker pool unless their
//! read/write footprints conflict.

pub mod ast;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod eval;
pub mod events;
pub mod group;
pub mod operators;
pub mod pool;
pub mod promise;
pub mod runtime;
pub mod table;
pub mod test_support;
pub mod value;

pub use ast::{Delivery, FnDecl, LocatedSpan, Position, Program, SourceMap, Span};
pub use config::{ConfigError, EngineConfig};
pub use conflict::{AccessSet, Resource};
pub use errors::{find_similar, format_deferred_error, format_eval_error, Colors, ErrorConfig};
pub use eval::{Env, EvalError, Interpreter};
pub use events::{EventSink, LifecycleEvent, LifecycleKind, NdjsonSink, RecordingSink, TracingSink};
pub use group::{GroupSummary, ResolutionGroup, ScopeId};
pub use pool::{PoolError, WorkerPool};
pub use promise::{CancelReason, ErrorContext, Outcome, Promise, PromiseSpec, PromiseState, Site};
pub use runtime::{BoundaryStats, ExecutionBoundary};
pub use table::PromiseId;
pub use value::{Builtin, Value};
