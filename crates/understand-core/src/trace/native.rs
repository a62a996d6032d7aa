//! In-process adapter: registered Rust entry points instrumented by a probe.
//!
//! Instrumented code wraps each traced function body in [`Probe::call`]. The
//! entry point runs on its own thread so a wall-clock timeout returns a
//! partial trace even when the body never yields back to a probe; once the
//! log is closed, every further probe call fails with [`Fault::Aborted`].

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::errors::{UnderstandError, UnderstandResult};
use crate::models::QualifiedName;
use crate::trace::recorder::{EventLog, RecordOptions, TraceAdapter, TraceRun, Truncation};

/// Failure travelling up through probed frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Raised {
        message: String,
        /// Set once the innermost probed frame has recorded the exception.
        attributed: bool,
    },
    /// Recording stopped; unwind without recording anything.
    Aborted,
}

impl Fault {
    pub fn raise(message: impl Into<String>) -> Self {
        Fault::Raised {
            message: message.into(),
            attributed: false,
        }
    }
}

/// Handle through which instrumented code reports call boundaries.
#[derive(Clone)]
pub struct Probe {
    log: Arc<Mutex<EventLog>>,
}

impl Probe {
    /// Run `body` as a traced call of `qualified_name`.
    pub fn call<T>(
        &self,
        qualified_name: &str,
        body: impl FnOnce(&Probe) -> Result<T, Fault>,
    ) -> Result<T, Fault> {
        if self.log.lock().call(qualified_name).is_break() {
            return Err(Fault::Aborted);
        }
        let mut result = body(self);
        let mut log = self.log.lock();
        if let Err(Fault::Raised { attributed, .. }) = &mut result {
            if !*attributed {
                let _ = log.exception(qualified_name);
                *attributed = true;
            }
        }
        if matches!(result, Err(Fault::Aborted)) {
            return result;
        }
        let _ = log.ret(qualified_name);
        result
    }
}

pub type EntryPoint = Arc<dyn Fn(&Probe, &[String]) -> Result<(), Fault> + Send + Sync>;

/// Registry of instrumentable entry points keyed by qualified name.
#[derive(Clone, Default)]
pub struct NativeAdapter {
    entries: BTreeMap<QualifiedName, EntryPoint>,
}

impl NativeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, qualified_name: impl Into<QualifiedName>, entry: F) -> &mut Self
    where
        F: Fn(&Probe, &[String]) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.entries.insert(qualified_name.into(), Arc::new(entry));
        self
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }
}

enum Outcome {
    Finished(Result<(), Fault>),
    TimedOut,
    Panicked,
}

impl TraceAdapter for NativeAdapter {
    fn language(&self) -> &str {
        "rust"
    }

    fn record(
        &self,
        entry_point: &str,
        arguments: &[String],
        options: &RecordOptions,
    ) -> UnderstandResult<TraceRun> {
        let body = self.entries.get(entry_point).cloned().ok_or_else(|| {
            UnderstandError::InstrumentationTarget(format!(
                "no registered entry point named {entry_point}"
            ))
        })?;

        let log = Arc::new(Mutex::new(EventLog::new(options.limits)));
        let probe = Probe {
            log: Arc::clone(&log),
        };
        let name = entry_point.to_string();
        let args = arguments.to_vec();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("understand-trace".to_string())
            .spawn(move || {
                let result = probe.call(&name, |p| body(p, &args));
                let _ = tx.send(result);
            })?;

        let outcome = match options.limits.timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => Outcome::Finished(result),
                Err(RecvTimeoutError::Timeout) => Outcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Outcome::Panicked,
            },
            None => match rx.recv() {
                Ok(result) => Outcome::Finished(result),
                Err(_) => Outcome::Panicked,
            },
        };

        let mut log = log.lock();
        let raised = match outcome {
            Outcome::Finished(Ok(())) | Outcome::Finished(Err(Fault::Aborted)) => None,
            Outcome::Finished(Err(Fault::Raised { message, .. })) => Some(message),
            Outcome::TimedOut => {
                log.truncate(Truncation::Timeout);
                None
            }
            Outcome::Panicked => Some(format!("entry point {entry_point} panicked")),
        };
        log.close();
        Ok(TraceRun::new(log.snapshot(), raised, options.mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, Trace};
    use crate::trace::recorder::{record, ExceptionMode, RecordLimits};
    use std::time::Duration;

    fn pipeline_adapter() -> NativeAdapter {
        let mut adapter = NativeAdapter::new();
        adapter.register("app:a", |probe, args| {
            let n: u32 = args.first().and_then(|a| a.parse().ok()).unwrap_or(1);
            for _ in 0..n {
                probe.call("app:b", |probe| {
                    probe.call("app:c", |_| Err::<(), _>(Fault::raise("ValueError: bad")))
                })
                .or_else(|fault| match fault {
                    Fault::Raised { .. } => Ok(()),
                    aborted => Err(aborted),
                })?;
            }
            Ok(())
        });
        adapter.register("app:fail", |probe, _| {
            probe.call("app:c", |_| Err(Fault::raise("boom")))
        });
        adapter
    }

    fn summary(trace: &Trace) -> Vec<(&str, EventKind, u32)> {
        trace
            .events
            .iter()
            .map(|e| (e.qualified_name.as_str(), e.kind, e.depth))
            .collect()
    }

    #[test]
    fn test_native_records_nesting_and_origin_of_exception() {
        let adapter = pipeline_adapter();
        let run = record(&adapter, "app:a", &["1".to_string()], &RecordOptions::default()).unwrap();
        assert_eq!(
            summary(&run.trace),
            vec![
                ("app:a", EventKind::Call, 0),
                ("app:b", EventKind::Call, 1),
                ("app:c", EventKind::Call, 2),
                ("app:c", EventKind::Exception, 2),
                ("app:c", EventKind::Return, 2),
                ("app:b", EventKind::Return, 1),
                ("app:a", EventKind::Return, 0),
            ]
        );
        assert!(!run.trace.truncated);
        assert_eq!(run.raised, None);
    }

    #[test]
    fn test_native_exception_modes() {
        let adapter = pipeline_adapter();
        let propagate = adapter
            .record("app:fail", &[], &RecordOptions::default())
            .unwrap();
        assert_eq!(propagate.raised.as_deref(), Some("boom"));
        assert_eq!(propagate.trace.exception_sites().len(), 1);

        let suppress = adapter
            .record(
                "app:fail",
                &[],
                &RecordOptions {
                    mode: ExceptionMode::Suppress,
                    ..RecordOptions::default()
                },
            )
            .unwrap();
        assert_eq!(suppress.raised, None);
        assert_eq!(suppress.trace, propagate.trace);
    }

    #[test]
    fn test_native_call_budget_returns_partial_trace() {
        let adapter = pipeline_adapter();
        let options = RecordOptions {
            limits: RecordLimits {
                timeout: Some(Duration::from_secs(5)),
                max_calls: Some(4),
            },
            mode: ExceptionMode::Propagate,
        };
        let run = adapter.record("app:a", &["10".to_string()], &options).unwrap();
        assert!(run.trace.truncated);
        assert_eq!(run.trace.call_counts().values().sum::<u64>(), 4);
        assert_eq!(run.raised, None);
    }

    #[test]
    fn test_native_timeout_on_uncooperative_entry() {
        let mut adapter = NativeAdapter::new();
        adapter.register("app:spin", |probe, _| {
            probe.call("app:inner", |_| {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
        });
        let options = RecordOptions {
            limits: RecordLimits {
                timeout: Some(Duration::from_millis(50)),
                max_calls: None,
            },
            mode: ExceptionMode::Propagate,
        };
        let run = adapter.record("app:spin", &[], &options).unwrap();
        assert!(run.trace.truncated);
        assert_eq!(run.trace.events.len(), 2);
        assert_eq!(run.raised, None);
    }

    #[test]
    fn test_native_unknown_entry_point_is_fatal() {
        let adapter = pipeline_adapter();
        let err = adapter
            .record("app:missing", &[], &RecordOptions::default())
            .unwrap_err();
        assert!(matches!(err, UnderstandError::InstrumentationTarget(_)));
        let names: Vec<&str> = adapter.entry_points().collect();
        assert_eq!(names, vec!["app:a", "app:fail"]);
    }
}
