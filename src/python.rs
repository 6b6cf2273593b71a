//! Embedded Python interpreter for the worker.
//!
//! Values cross the boundary as JSON strings: arguments are serialized in
//! Rust and loaded with `json.loads`, results come back through
//! `json.dumps` and are parsed with serde.
//!
//! While a call, code block or shell line runs, the worker is reachable
//! from Python through the `pipebridge` module:
//!
//! ```python
//! import pipebridge
//! pipebridge.callback("open_file", "/tmp/data.csv")   # call into the host
//! name = input("name? ")                              # nested console read
//! pipebridge.graphics({"op": "plot", "points": [1, 2]})
//! if pipebridge.break_requested(): ...
//! ```
//!
//! `sys.stdout`/`sys.stderr` write straight to the console and `input()`
//! reads from it, so output and prompts keep their order.

use std::cell::Cell;
use std::ffi::CStr;

use anyhow::{Context, Result};
use pyo3::exceptions::{PyEOFError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyModule, PyTuple};
use serde_json::Value;
use tracing::{debug, info};

use crate::interpreter::{Interpreter, Interrupt};
use crate::message::{CallbackInvocation, CodeBlock, FunctionCall, Payload};
use crate::worker::Worker;

const HELPERS: &CStr = c"
import builtins, json, sys, traceback
import __main__
import pipebridge

class _Console:
    def __init__(self, is_err):
        self.is_err = is_err
    def write(self, text):
        pipebridge.write_console(text, self.is_err)
        return len(text)
    def flush(self):
        pass

class _Stdin:
    def readline(self, size=-1):
        return pipebridge.read_console('') + '\\n'

def _input(prompt=''):
    return pipebridge.read_console(str(prompt))

def call(name, args_json):
    namespace = vars(__main__)
    fn = namespace[name] if name in namespace else getattr(builtins, name)
    return _attached(lambda: json.dumps(fn(*json.loads(args_json)), default=repr))

def exec_block(source):
    def run():
        exec(compile(source, '<pipebridge>', 'exec'), vars(__main__))
        return 'null'
    return _attached(run)

def eval_line(line):
    def run():
        exec(compile(line, '<console>', 'single'), vars(__main__))
        return 'null'
    return _attached(run)

def _attached(thunk):
    saved = sys.stdout, sys.stderr, sys.stdin, builtins.input
    sys.stdout, sys.stderr = _Console(False), _Console(True)
    sys.stdin, builtins.input = _Stdin(), _input
    result, error = None, None
    try:
        result = thunk()
    except BaseException as e:
        error = ''.join(traceback.format_exception_only(type(e), e))
    finally:
        sys.stdout, sys.stderr, sys.stdin, builtins.input = saved
    return result, error
";

/// `(result_json, error)` from a helper call.
type Outcome = (Option<String>, Option<String>);

/// The worker and interpreter of the evaluation running on this thread.
#[derive(Clone, Copy)]
struct Session {
    worker: *mut Worker,
    interp: *const PythonInterpreter,
}

thread_local! {
    static SESSION: Cell<Option<Session>> = const { Cell::new(None) };
}

/// Puts the previous session back when an evaluation or a module call ends.
struct Restore(Option<Session>);

impl Drop for Restore {
    fn drop(&mut self) {
        SESSION.with(|session| session.set(self.0.take()));
    }
}

/// Run `f` with `worker` reachable from the `pipebridge` module.
fn attach_worker<R>(interp: &PythonInterpreter, worker: &mut Worker, f: impl FnOnce() -> R) -> R {
    let session = Session {
        worker: worker as *mut Worker,
        interp: interp as *const PythonInterpreter,
    };
    let _restore = Restore(SESSION.with(|cell| cell.replace(Some(session))));
    f()
}

/// Borrow the current session's worker. The session is taken out of the
/// cell while `f` runs; nested evaluations install their own.
fn with_worker<R>(f: impl FnOnce(&PythonInterpreter, &mut Worker) -> R) -> PyResult<R> {
    let session = SESSION
        .with(Cell::take)
        .ok_or_else(|| PyRuntimeError::new_err("pipebridge is only usable inside a worker evaluation"))?;
    let _restore = Restore(Some(session));
    // SAFETY: `attach_worker` installed both pointers from references that
    // outlive the evaluation, and the session stays out of the cell while
    // `f` holds them, so the worker has exactly one live borrow.
    let (interp, worker) = unsafe { (&*session.interp, &mut *session.worker) };
    Ok(f(interp, worker))
}

fn json_to_py(py: Python<'_>, value: &Value) -> PyResult<Py<PyAny>> {
    let text = serde_json::to_string(value).map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(py.import("json")?.call_method1("loads", (text,))?.unbind())
}

fn py_to_json(py: Python<'_>, object: &Bound<'_, PyAny>) -> PyResult<Value> {
    let text: String = py.import("json")?.call_method1("dumps", (object,))?.extract()?;
    serde_json::from_str(&text).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Call `target` in the host application and return its result.
#[pyfunction]
#[pyo3(signature = (target, *args))]
fn callback(py: Python<'_>, target: String, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
    let arguments = match py_to_json(py, args.as_any())? {
        Value::Array(arguments) => arguments,
        other => vec![other],
    };
    let invocation = CallbackInvocation { target, arguments };
    let reply = with_worker(|interp, worker| worker.callback(interp, Payload::Callback(invocation)))?;
    match reply.payload {
        Payload::Result(value) => json_to_py(py, &value),
        Payload::Error(text) => Err(PyRuntimeError::new_err(text)),
        other => Err(PyRuntimeError::new_err(format!("unexpected {} reply", other.tag()))),
    }
}

/// Show `prompt` on the console and wait for the next shell command.
#[pyfunction]
#[pyo3(signature = (prompt = String::new()))]
fn read_console(prompt: String) -> PyResult<String> {
    with_worker(|interp, worker| worker.read_console(interp, &prompt))?
        .map_err(|e| PyEOFError::new_err(e.to_string()))
}

#[pyfunction]
#[pyo3(signature = (text, is_err = false))]
fn write_console(text: &str, is_err: bool) -> PyResult<()> {
    with_worker(|_, worker| worker.write_console(text, is_err))
}

/// Forward a JSON-serializable graphics command to the console.
#[pyfunction]
fn graphics(py: Python<'_>, command: &Bound<'_, PyAny>) -> PyResult<()> {
    let command = py_to_json(py, command)?;
    with_worker(|_, worker| worker.push_graphics(command))
}

/// True once per management `break`.
#[pyfunction]
fn break_requested() -> PyResult<bool> {
    with_worker(|_, worker| worker.break_requested())
}

fn register_module(py: Python<'_>) -> PyResult<()> {
    let module = PyModule::new(py, "pipebridge")?;
    module.add_function(wrap_pyfunction!(callback, &module)?)?;
    module.add_function(wrap_pyfunction!(read_console, &module)?)?;
    module.add_function(wrap_pyfunction!(write_console, &module)?)?;
    module.add_function(wrap_pyfunction!(graphics, &module)?)?;
    module.add_function(wrap_pyfunction!(break_requested, &module)?)?;
    py.import("sys")?.getattr("modules")?.set_item("pipebridge", &module)?;
    Ok(())
}

/// Python interpreter driven by the worker loop.
pub struct PythonInterpreter {
    helpers: Py<PyModule>,
}

impl PythonInterpreter {
    pub fn new() -> Result<Self> {
        Python::attach(|py| {
            register_module(py).context("Failed to register the pipebridge module")?;
            let helpers = PyModule::from_code(py, HELPERS, c"pipebridge_helpers.py", c"pipebridge_helpers")
                .context("Failed to load interpreter helpers")?;
            Ok(Self {
                helpers: helpers.unbind(),
            })
        })
    }

    fn run(&self, worker: &mut Worker, helper: &str, args: (String, Option<String>)) -> Result<Outcome> {
        attach_worker(self, worker, || {
            Python::attach(|py| {
                let helpers = self.helpers.bind(py);
                let outcome = match args {
                    (first, Some(second)) => helpers.call_method1(helper, (first, second)),
                    (first, None) => helpers.call_method1(helper, (first,)),
                }
                .with_context(|| format!("Failed to call helper {}", helper))?
                .extract()
                .context("Failed to extract helper result")?;
                Ok(outcome)
            })
        })
    }

    /// Turn an evaluation outcome into a payload. A break that arrived
    /// during the evaluation has been delivered as `KeyboardInterrupt` and
    /// is consumed here.
    fn finish(&self, worker: &mut Worker, outcome: Result<Outcome>) -> Payload {
        if worker.break_requested() {
            info!("Evaluation interrupted by user break");
        }
        let (result, error) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Payload::Error(format!("{:#}", e)),
        };

        match (error, result) {
            (Some(error), _) => Payload::Error(error.trim_end().to_string()),
            (None, Some(json)) => match serde_json::from_str::<Value>(&json) {
                Ok(value) => Payload::Result(value),
                Err(e) => Payload::Error(format!("Result is not JSON: {}", e)),
            },
            (None, None) => Payload::Result(Value::Null),
        }
    }
}

impl Interpreter for PythonInterpreter {
    fn prompt(&self) -> String {
        ">>> ".to_string()
    }

    fn call_function(&self, worker: &mut Worker, call: &FunctionCall) -> Payload {
        debug!("Calling {}", call.function);
        let outcome = serde_json::to_string(&call.arguments)
            .context("Failed to serialize arguments")
            .and_then(|args| self.run(worker, "call", (call.function.clone(), Some(args))));
        self.finish(worker, outcome)
    }

    fn exec_code(&self, worker: &mut Worker, code: &CodeBlock) -> Payload {
        let outcome = self.run(worker, "exec_block", (code.text(), None));
        self.finish(worker, outcome)
    }

    fn eval_shell(&self, worker: &mut Worker, line: &str) {
        let outcome = self.run(worker, "eval_line", (line.to_string(), None));
        if let Payload::Error(error) = self.finish(worker, outcome) {
            worker.write_console(&format!("{}\n", error), true);
        }
    }

    fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        Some(Box::new(PythonInterrupt))
    }
}

/// Raises `KeyboardInterrupt` in the running Python code.
struct PythonInterrupt;

impl Interrupt for PythonInterrupt {
    fn interrupt(&self) {
        // SAFETY: PyErr_SetInterrupt only sets a flag and may be called
        // without holding the GIL.
        unsafe { pyo3::ffi::PyErr_SetInterrupt() };
    }
}
