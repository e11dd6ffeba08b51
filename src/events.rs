//! Promise lifecycle events
//!
//! The execution boundary reports every state change of every promise to an
//! [`EventSink`]. Events carry a correlation id so that the creation and
//! eventual resolution of one promise can be joined in a log.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::group::ScopeId;
use crate::table::PromiseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    ResolutionStarted,
    Resolved,
    Failed,
    Cancelled,
}

impl LifecycleKind {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleKind::Created => "created",
            LifecycleKind::ResolutionStarted => "resolution_started",
            LifecycleKind::Resolved => "resolved",
            LifecycleKind::Failed => "failed",
            LifecycleKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub correlation_id: u64,
    pub promise: PromiseId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeId>,
    pub kind: LifecycleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<Arc<str>>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(correlation_id: u64, promise: PromiseId, kind: LifecycleKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            correlation_id,
            promise,
            scope: None,
            kind,
            function: None,
            timestamp_ms,
            detail: None,
        }
    }

    pub fn scope(mut self, scope: Option<ScopeId>) -> Self {
        self.scope = scope;
        self
    }

    pub fn function(mut self, function: Option<Arc<str>>) -> Self {
        self.function = function;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Emits each event as a `tracing` event under `latent::lifecycle`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        tracing::trace!(
            target: "latent::lifecycle",
            correlation_id = event.correlation_id,
            promise = %event.promise,
            scope = ?event.scope,
            function = event.function.as_deref().unwrap_or("<top>"),
            detail = event.detail.as_deref().unwrap_or(""),
            "{}",
            event.kind.name()
        );
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Event kinds recorded for one promise, in order
    pub fn kinds_for(&self, promise: PromiseId) -> Vec<LifecycleKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.promise == promise)
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, kind: LifecycleKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Writes one JSON object per line
pub struct NdjsonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for NdjsonSink<W> {
    fn emit(&self, event: &LifecycleEvent) {
        let mut writer = self.writer.lock();
        let written = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(err) = written {
            tracing::warn!(error = %err, "failed to write lifecycle event");
        }
    }
}
