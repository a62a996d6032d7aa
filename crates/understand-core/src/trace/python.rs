//! Subprocess adapter driving a Python interpreter with `sys.settrace`.
//!
//! The tracer script streams one JSON object per line on stdout. Only frames
//! whose code lives under the repository root are reported, named exactly as
//! the scanner names them (`pkg/service:Class.method`). The Rust side owns
//! sequencing, depth and limits through [`EventLog`] and kills the child when
//! a limit is hit.
//!
//! Generators and coroutines report one call and one return per frame, not
//! one per resume. Iteration-protocol exceptions (`StopIteration` and
//! friends) are not exception sites. Interpreters older than 3.11 lack
//! `co_qualname`, so method names are rebuilt from the `self`/`cls` argument.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{UnderstandError, UnderstandResult};
use crate::trace::recorder::{
    EventLog, ExceptionMode, RecordOptions, TraceAdapter, TraceRun, Truncation,
};

pub const DEFAULT_PYTHON: &str = "python3";

/// Exit status the tracer uses for a missing or uncallable target.
const TARGET_ERROR_EXIT: i32 = 3;

const PY_TRACER: &str = r#"
import dis, importlib, importlib.util, inspect, json, os, sys, traceback

root = os.path.realpath(sys.argv[1])
target_path = os.path.realpath(sys.argv[2])
func_name = sys.argv[3]
mode = sys.argv[4]
raw_args = sys.argv[5:]
out = sys.stdout
sys.stdout = sys.stderr

RESUMABLE = inspect.CO_GENERATOR | inspect.CO_COROUTINE | inspect.CO_ASYNC_GENERATOR
CONTROL_FLOW = (StopIteration, StopAsyncIteration, GeneratorExit)
YIELD_OPS = {dis.opmap[n] for n in ("YIELD_VALUE", "YIELD_FROM") if n in dis.opmap}
RESUME_OP = dis.opmap.get("RESUME")

def emit(kind, q=None, m=None):
    out.write(json.dumps({"k": kind, "q": q, "m": m}) + "\n")
    out.flush()

def coerce(value):
    try:
        return int(value)
    except ValueError:
        return value

names = {}
live = set()
unwinding = set()

def method_owner(frame, code):
    if not code.co_argcount or code.co_varnames[0] not in ("self", "cls"):
        return None
    bound = frame.f_locals.get(code.co_varnames[0])
    klass = bound if isinstance(bound, type) else type(bound)
    for candidate in getattr(klass, "__mro__", ()):
        member = candidate.__dict__.get(code.co_name)
        func = getattr(member, "__func__", member)
        if getattr(func, "__code__", None) is code:
            return candidate.__qualname__
    return None

def qualify(frame):
    code = frame.f_code
    if code in names:
        return names[code]
    name = None
    path = os.path.realpath(code.co_filename)
    if path.startswith(root + os.sep) and os.path.isfile(path):
        rel = os.path.relpath(path, root).replace(os.sep, "/")
        module = rel.rsplit(".", 1)[0] if "." in rel.rsplit("/", 1)[-1] else rel
        qual = getattr(code, "co_qualname", None)
        if qual is None:
            owner = method_owner(frame, code)
            qual = owner + "." + code.co_name if owner else code.co_name
        parts = [p for p in qual.split(".") if p != "<locals>"]
        if parts and not any(p.startswith("<") for p in parts):
            name = module + ":" + ".".join(parts)
    names[code] = name
    return name

def suspended(frame):
    code = frame.f_code.co_code
    i = frame.f_lasti
    if id(frame) in unwinding or not 0 <= i < len(code):
        return False
    if code[i] in YIELD_OPS or code[i] == RESUME_OP:
        return True
    if i + 2 < len(code):
        return code[i + 2] == RESUME_OP or code[i + 2] in YIELD_OPS
    return False

def local_tracer(frame, event, arg):
    q = qualify(frame)
    resumable = frame.f_code.co_flags & RESUMABLE
    if event == "line":
        unwinding.discard(id(frame))
    elif event == "return":
        if resumable:
            if suspended(frame):
                return local_tracer
            live.discard(id(frame))
            unwinding.discard(id(frame))
        emit("return", q)
    elif event == "exception":
        if resumable:
            unwinding.add(id(frame))
        if issubclass(arg[0], CONTROL_FLOW):
            return local_tracer
        deeper = arg[2].tb_next if arg[2] is not None else None
        while deeper is not None:
            if qualify(deeper.tb_frame) is not None:
                return local_tracer
            deeper = deeper.tb_next
        emit("exception", q, repr(arg[1]))
    return local_tracer

def global_tracer(frame, event, arg):
    if event != "call":
        return None
    q = qualify(frame)
    if q is None:
        return None
    if frame.f_code.co_flags & RESUMABLE:
        if id(frame) in live:
            return local_tracer
        live.add(id(frame))
    emit("call", q)
    return local_tracer

def load_module():
    sys.path.insert(0, root)
    rel = os.path.relpath(target_path, root).replace(os.sep, "/")
    dotted = rel[:-3].replace("/", ".") if rel.endswith(".py") else None
    if dotted is not None and dotted.endswith(".__init__"):
        dotted = dotted[: -len(".__init__")]
    if dotted and not rel.startswith("../") and all(p.isidentifier() for p in dotted.split(".")):
        return importlib.import_module(dotted)
    spec = importlib.util.spec_from_file_location("__understand_target__", target_path)
    module = importlib.util.module_from_spec(spec)
    sys.modules[spec.name] = module
    spec.loader.exec_module(module)
    return module

if not os.path.isfile(target_path):
    emit("target_error", None, "no such file: " + sys.argv[2])
    sys.exit(3)
try:
    target = load_module()
    for part in func_name.split("."):
        target = getattr(target, part)
except SystemExit:
    raise
except BaseException as exc:
    emit("target_error", None, "cannot load " + func_name + ": " + repr(exc))
    sys.exit(3)
if not callable(target):
    emit("target_error", None, func_name + " is not callable")
    sys.exit(3)

args = [coerce(a) for a in raw_args]
sys.settrace(global_tracer)
try:
    target(*args)
except BaseException as exc:
    sys.settrace(None)
    emit("raised", None, "".join(traceback.format_exception_only(type(exc), exc)).strip())
    sys.exit(1 if mode == "propagate" else 0)
finally:
    sys.settrace(None)
sys.exit(0)
"#;

#[derive(Debug, Deserialize)]
struct WireEvent {
    k: String,
    q: Option<String>,
    m: Option<String>,
}

/// Records Python entry points of the repository rooted at `root`.
#[derive(Debug, Clone)]
pub struct PythonAdapter {
    root: PathBuf,
    python: String,
}

impl PythonAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            python: DEFAULT_PYTHON.to_string(),
        }
    }

    pub fn with_interpreter(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Source file and function path of `pkg/service:compute` or
    /// `pkg/service.py:compute`.
    pub fn resolve_entry_point(&self, entry_point: &str) -> UnderstandResult<(PathBuf, String)> {
        let (module, function) = entry_point
            .rsplit_once(':')
            .filter(|(m, f)| !m.is_empty() && !f.is_empty())
            .ok_or_else(|| {
                UnderstandError::InstrumentationTarget(format!(
                    "entry point must look like path/module:function, got {entry_point}"
                ))
            })?;
        let module = module.trim_start_matches("./");
        let candidates = if module.ends_with(".py") {
            vec![self.root.join(module)]
        } else {
            vec![
                self.root.join(format!("{module}.py")),
                self.root.join(module).join("__init__.py"),
            ]
        };
        let file = candidates
            .into_iter()
            .find(|c| c.is_file())
            .ok_or_else(|| {
                UnderstandError::InstrumentationTarget(format!(
                    "no source file for {module} under {}",
                    self.root.display()
                ))
            })?;
        Ok((file, function.to_string()))
    }
}

impl TraceAdapter for PythonAdapter {
    fn language(&self) -> &str {
        "python"
    }

    fn record(
        &self,
        entry_point: &str,
        arguments: &[String],
        options: &RecordOptions,
    ) -> UnderstandResult<TraceRun> {
        let (file, function) = self.resolve_entry_point(entry_point)?;
        let mode = match options.mode {
            ExceptionMode::Propagate => "propagate",
            ExceptionMode::Suppress => "suppress",
        };

        let mut child = Command::new(&self.python)
            .arg("-c")
            .arg(PY_TRACER)
            .arg(&self.root)
            .arg(&file)
            .arg(&function)
            .arg(mode)
            .args(arguments)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                UnderstandError::InstrumentationTarget(format!(
                    "cannot start {}: {e}",
                    self.python
                ))
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(UnderstandError::InstrumentationTarget(
                "tracer stdout unavailable".to_string(),
            ));
        };
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("understand-pytrace".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    match serde_json::from_str::<WireEvent>(&line) {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!(error = %err, "ignoring tracer output line"),
                    }
                }
            })?;

        let deadline = options.limits.timeout.map(|t| Instant::now() + t);
        let mut log = EventLog::new(options.limits);
        let mut raised = None;
        let mut target_error = None;
        loop {
            let received = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Err(RecvTimeoutError::Timeout)
                    } else {
                        rx.recv_timeout(deadline - now)
                    }
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    log.truncate(Truncation::Timeout);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let name = event.q.as_deref().unwrap_or_default();
            let flow = match event.k.as_str() {
                "call" => log.call(name),
                "return" => log.ret(name),
                "exception" => log.exception(name),
                "raised" => {
                    raised = event.m;
                    continue;
                }
                "target_error" => {
                    target_error = event.m;
                    continue;
                }
                other => {
                    debug!(kind = other, "unknown tracer event");
                    continue;
                }
            };
            if flow.is_break() {
                break;
            }
        }

        if log.truncation().is_some() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        if status.code() == Some(TARGET_ERROR_EXIT) || target_error.is_some() {
            return Err(UnderstandError::InstrumentationTarget(
                target_error.unwrap_or_else(|| format!("{entry_point} could not be loaded")),
            ));
        }
        log.close();
        Ok(TraceRun::new(log.finish(), raised, options.mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use crate::trace::recorder::RecordLimits;
    use std::fs;
    use std::time::Duration;

    fn python_available() -> bool {
        Command::new(DEFAULT_PYTHON)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("__init__.py"), "").unwrap();
        fs::write(
            pkg.join("service.py"),
            "\
import json
import time

def compute(x):
    return helper(x) + 1

def helper(x):
    json.dumps(x)
    return x * 2

def fail(x):
    return validate(x)

def validate(x):
    if x < 0:
        raise ValueError('negative')
    return x

def spin():
    while True:
        helper(1)

def numbers(n):
    for i in range(n):
        yield helper(i)

def total(n):
    return sum(numbers(n))

class Countdown:
    def __init__(self, n):
        self.n = n

    def __iter__(self):
        return self

    def __next__(self):
        if self.n <= 0:
            raise StopIteration
        self.n -= 1
        return self.n

def drain(n):
    return list(Countdown(n))

def sleepy():
    helper(1)
    time.sleep(30)
",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_resolve_entry_point_forms() {
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let (file, func) = adapter.resolve_entry_point("pkg/service:compute").unwrap();
        assert!(file.ends_with("pkg/service.py"));
        assert_eq!(func, "compute");
        assert!(adapter.resolve_entry_point("pkg/service.py:compute").is_ok());
        assert!(adapter.resolve_entry_point("pkg:compute").is_ok());
        assert!(adapter.resolve_entry_point("pkg/missing:compute").is_err());
        assert!(adapter.resolve_entry_point("compute").is_err());
    }

    #[test]
    fn test_python_trace_records_repo_frames_only() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let run = adapter
            .record("pkg/service:compute", &["3".to_string()], &RecordOptions::default())
            .unwrap();
        let events: Vec<(&str, EventKind, u32)> = run
            .trace
            .events
            .iter()
            .map(|e| (e.qualified_name.as_str(), e.kind, e.depth))
            .collect();
        assert_eq!(
            events,
            vec![
                ("pkg/service:compute", EventKind::Call, 0),
                ("pkg/service:helper", EventKind::Call, 1),
                ("pkg/service:helper", EventKind::Return, 1),
                ("pkg/service:compute", EventKind::Return, 0),
            ]
        );
        assert!(!run.trace.truncated);
        assert_eq!(run.raised, None);
    }

    #[test]
    fn test_python_exception_attributed_to_origin() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let run = adapter
            .record("pkg/service:fail", &["-1".to_string()], &RecordOptions::default())
            .unwrap();
        let sites: Vec<&str> = run.trace.exception_sites().into_iter().collect();
        assert_eq!(sites, vec!["pkg/service:validate"]);
        assert!(run.raised.unwrap().contains("negative"));

        let suppressed = adapter
            .record(
                "pkg/service:fail",
                &["-1".to_string()],
                &RecordOptions {
                    mode: ExceptionMode::Suppress,
                    ..RecordOptions::default()
                },
            )
            .unwrap();
        assert_eq!(suppressed.raised, None);
        assert_eq!(suppressed.trace.exception_sites().len(), 1);
    }

    #[test]
    fn test_python_timeout_returns_partial_trace() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let options = RecordOptions {
            limits: RecordLimits {
                timeout: Some(Duration::from_millis(1500)),
                max_calls: Some(50),
            },
            mode: ExceptionMode::Propagate,
        };
        let run = adapter.record("pkg/service:spin", &[], &options).unwrap();
        assert!(run.trace.truncated);
        assert_eq!(run.trace.call_counts().values().sum::<u64>(), 50);
    }

    #[test]
    fn test_python_generator_is_one_call() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let run = adapter
            .record("pkg/service:total", &["5".to_string()], &RecordOptions::default())
            .unwrap();
        let counts = run.trace.call_counts();
        assert_eq!(counts["pkg/service:numbers"], 1);
        assert_eq!(counts["pkg/service:helper"], 5);
        let returns = run
            .trace
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Return && e.qualified_name == "pkg/service:numbers")
            .count();
        assert_eq!(returns, 1);
        assert!(run
            .trace
            .events
            .iter()
            .filter(|e| e.qualified_name == "pkg/service:helper")
            .all(|e| e.depth == 2));
        assert_eq!(run.trace.events.last().map(|e| e.kind), Some(EventKind::Return));
    }

    #[test]
    fn test_python_stop_iteration_is_not_an_exception_site() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let run = adapter
            .record("pkg/service:drain", &["3".to_string()], &RecordOptions::default())
            .unwrap();
        assert!(run.trace.exception_sites().is_empty());
        assert_eq!(run.raised, None);
        let counts = run.trace.call_counts();
        assert_eq!(counts["pkg/service:Countdown.__next__"], 4);
        assert_eq!(counts["pkg/service:Countdown.__init__"], 1);
    }

    #[test]
    fn test_python_wall_clock_timeout_kills_child() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let options = RecordOptions {
            limits: RecordLimits {
                timeout: Some(Duration::from_millis(300)),
                max_calls: None,
            },
            mode: ExceptionMode::Propagate,
        };
        let started = Instant::now();
        let run = adapter.record("pkg/service:sleepy", &[], &options).unwrap();
        assert!(run.trace.truncated);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!run
            .trace
            .events
            .iter()
            .any(|e| e.kind == EventKind::Return && e.qualified_name == "pkg/service:sleepy"));
    }

    #[test]
    fn test_python_missing_function_is_fatal() {
        if !python_available() {
            return;
        }
        let dir = repo();
        let adapter = PythonAdapter::new(dir.path());
        let err = adapter
            .record("pkg/service:nope", &[], &RecordOptions::default())
            .unwrap_err();
        assert!(matches!(err, UnderstandError::InstrumentationTarget(_)));
    }
}
