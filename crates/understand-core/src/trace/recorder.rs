//! Trace recording: event log, limits, exception mode and the adapter seam.
//!
//! Adapters own the instrumentation mechanism of one target language. They all
//! feed an [`EventLog`], which assigns sequence numbers and stack depth from
//! its own bookkeeping, so merge and ranking never depend on how events were
//! observed.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::UnderstandResult;
use crate::models::{EventKind, QualifiedName, Trace, TraceEvent};
use crate::query::guards::{DEFAULT_TRACE_TIMEOUT, MAX_TRACE_CALLS};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What happens to an exception that escapes the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionMode {
    /// Report the exception to the caller through [`TraceRun::raised`].
    #[default]
    Propagate,
    /// Swallow it; only the trace records that it happened.
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    /// Maximum number of `call` events recorded.
    pub max_calls: Option<u64>,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TRACE_TIMEOUT),
            max_calls: Some(MAX_TRACE_CALLS),
        }
    }
}

impl RecordLimits {
    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            max_calls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOptions {
    pub limits: RecordLimits,
    pub mode: ExceptionMode,
}

/// Result of one instrumented run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRun {
    pub trace: Trace,
    /// Error text that escaped the entry point (propagate mode only).
    pub raised: Option<String>,
}

impl TraceRun {
    /// Apply the exception mode to an escaped error.
    pub fn new(trace: Trace, raised: Option<String>, mode: ExceptionMode) -> Self {
        let raised = match mode {
            ExceptionMode::Propagate => raised,
            ExceptionMode::Suppress => None,
        };
        Self { trace, raised }
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    Timeout,
    CallBudget,
}

/// Sequencing and budget bookkeeping shared by every adapter.
///
/// Once truncated or closed, the log rejects further events.
#[derive(Debug)]
pub struct EventLog {
    events: Vec<TraceEvent>,
    stack: Vec<QualifiedName>,
    calls: u64,
    started: Instant,
    limits: RecordLimits,
    truncation: Option<Truncation>,
    closed: bool,
}

impl EventLog {
    pub fn new(limits: RecordLimits) -> Self {
        Self {
            events: Vec::new(),
            stack: Vec::new(),
            calls: 0,
            started: Instant::now(),
            limits,
            truncation: None,
            closed: false,
        }
    }

    fn accepting(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Some(timeout) = self.limits.timeout {
            if self.started.elapsed() >= timeout {
                self.truncate(Truncation::Timeout);
                return false;
            }
        }
        true
    }

    fn push(&mut self, qualified_name: &str, kind: EventKind, depth: usize) {
        self.events.push(TraceEvent {
            seq: self.events.len() as u64,
            qualified_name: qualified_name.to_string(),
            kind,
            depth: depth as u32,
        });
    }

    pub fn call(&mut self, qualified_name: &str) -> ControlFlow<()> {
        if !self.accepting() {
            return ControlFlow::Break(());
        }
        if self.limits.max_calls.is_some_and(|max| self.calls >= max) {
            self.truncate(Truncation::CallBudget);
            return ControlFlow::Break(());
        }
        self.push(qualified_name, EventKind::Call, self.stack.len());
        self.stack.push(qualified_name.to_string());
        self.calls += 1;
        ControlFlow::Continue(())
    }

    pub fn ret(&mut self, qualified_name: &str) -> ControlFlow<()> {
        if !self.accepting() {
            return ControlFlow::Break(());
        }
        let Some(position) = self.stack.iter().rposition(|f| f == qualified_name) else {
            debug!(qualified_name, "return without matching call");
            return ControlFlow::Continue(());
        };
        // Frames above `position` unwound without a return event.
        self.stack.truncate(position + 1);
        self.push(qualified_name, EventKind::Return, position);
        self.stack.pop();
        ControlFlow::Continue(())
    }

    /// Record an exception originating in the innermost frame named
    /// `qualified_name`.
    pub fn exception(&mut self, qualified_name: &str) -> ControlFlow<()> {
        if !self.accepting() {
            return ControlFlow::Break(());
        }
        let depth = self
            .stack
            .iter()
            .rposition(|f| f == qualified_name)
            .unwrap_or(self.stack.len().saturating_sub(1));
        self.push(qualified_name, EventKind::Exception, depth);
        ControlFlow::Continue(())
    }

    pub fn truncate(&mut self, reason: Truncation) {
        if self.truncation.is_none() && !self.closed {
            warn!(
                reason = ?reason,
                events = self.events.len(),
                "trace recording truncated"
            );
            self.truncation = Some(reason);
        }
        self.closed = true;
    }

    /// Stop accepting events without marking the trace truncated.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn truncation(&self) -> Option<Truncation> {
        self.truncation
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> Trace {
        Trace {
            events: self.events.clone(),
            truncated: self.truncation.is_some(),
        }
    }

    pub fn finish(self) -> Trace {
        Trace {
            events: self.events,
            truncated: self.truncation.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter seam
// ---------------------------------------------------------------------------

/// Per-language instrumentation of one entry point.
///
/// Implementations must return a partial trace rather than block past the
/// configured limits, and must fail with
/// [`crate::errors::UnderstandError::InstrumentationTarget`] when the entry
/// point cannot be found or called.
pub trait TraceAdapter {
    fn language(&self) -> &str;

    fn record(
        &self,
        entry_point: &str,
        arguments: &[String],
        options: &RecordOptions,
    ) -> UnderstandResult<TraceRun>;
}

/// Record one run of `entry_point` through `adapter`.
pub fn record(
    adapter: &dyn TraceAdapter,
    entry_point: &str,
    arguments: &[String],
    options: &RecordOptions,
) -> UnderstandResult<TraceRun> {
    let started = Instant::now();
    let run = adapter.record(entry_point, arguments, options)?;
    if let Some(raised) = &run.raised {
        warn!(entry_point, error = %raised, "exception escaped the entry point");
    }
    info!(
        language = adapter.language(),
        entry_point,
        events = run.trace.events.len(),
        truncated = run.trace.truncated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "trace recorded"
    );
    Ok(run)
}
