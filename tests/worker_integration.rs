//! End-to-end tests: a worker running a scripted interpreter on its own
//! thread, driven through the front-end call engine and raw console
//! clients over Unix sockets in a temporary directory.
//!
//! # Running
//!
//! ```bash
//! cargo test --test worker_integration -- --nocapture
//! ```

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use pipebridge::interpreter::{Interpreter, Interrupt};
use pipebridge::ipc::{decode, encode, request_break, CallEngine, Endpoints, HostCallbacks, Retry};
use pipebridge::ipc::FRAME_ERROR_DIAGNOSTIC;
use pipebridge::message::{
    CallbackInvocation, CodeBlock, ConsoleOutput, Control, FunctionCall, Message, Payload,
};
use pipebridge::worker::{Exit, Worker, WorkerOptions};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interpreter whose functions exercise the worker API.
struct Scripted {
    interrupted: Arc<AtomicBool>,
    code: Mutex<Vec<String>>,
}

impl Interpreter for Scripted {
    fn call_function(&self, worker: &mut Worker, call: &FunctionCall) -> Payload {
        let first = call.arguments.first().cloned().unwrap_or(Value::Null);
        match call.function.as_str() {
            "echo" => Payload::Result(first),
            "print" => {
                worker.write_console(first.as_str().unwrap_or_default(), false);
                Payload::Result(Value::Null)
            }
            "ask_host" => {
                let invocation = CallbackInvocation {
                    target: first.as_str().unwrap_or_default().to_string(),
                    arguments: call.arguments[1..].to_vec(),
                };
                worker.callback(self, Payload::Callback(invocation)).payload
            }
            "read_line" => match worker.read_console(self, "nested> ") {
                Ok(line) => Payload::Result(json!(line)),
                Err(e) => Payload::Error(e.to_string()),
            },
            "depth" => Payload::Result(json!(worker.call_depth())),
            "graphics" => {
                worker.push_graphics(first);
                Payload::Result(Value::Null)
            }
            "check_break" => Payload::Result(json!(worker.break_requested())),
            "panic" => panic!("scripted failure"),
            other => Payload::Error(format!("no function {}", other)),
        }
    }

    fn exec_code(&self, _worker: &mut Worker, code: &CodeBlock) -> Payload {
        self.code.lock().unwrap().extend(code.lines.iter().cloned());
        Payload::Result(json!(code.lines.len()))
    }

    fn eval_shell(&self, worker: &mut Worker, line: &str) {
        worker.write_console(&format!("ran {}\n", line), false);
    }

    fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        Some(Box::new(Flag(Arc::clone(&self.interrupted))))
    }
}

struct Flag(Arc<AtomicBool>);

impl Interrupt for Flag {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Host side: answers `plain` directly and `nested` with a call back into
/// the worker.
#[derive(Default)]
struct RecordingHost {
    threads: Mutex<Vec<ThreadId>>,
    detached: AtomicUsize,
}

impl HostCallbacks for RecordingHost {
    fn on_callback(&self, engine: &CallEngine, call: &Message) -> Payload {
        self.threads.lock().unwrap().push(thread::current().id());
        let Payload::Callback(invocation) = &call.payload else {
            return Payload::Error("not a callback".into());
        };
        match invocation.target.as_str() {
            "nested" => engine.request(function("echo", vec![json!(5)])).payload,
            "depth" => engine.request(function("depth", vec![])).payload,
            _ => Payload::Result(json!("from host")),
        }
    }

    fn on_detached_callback(&self, _call: &Message) -> Payload {
        self.detached.fetch_add(1, Ordering::SeqCst);
        Payload::Result(json!("detached"))
    }
}

fn function(name: &str, arguments: Vec<Value>) -> Payload {
    Payload::FunctionCall(FunctionCall {
        function: name.into(),
        arguments,
    })
}

struct Harness {
    endpoints: Endpoints,
    exit: mpsc::Receiver<Exit>,
    interrupted: Arc<AtomicBool>,
    runtime: tokio::runtime::Runtime,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = Endpoints::new(dir.path(), name);
        let interrupted = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit) = mpsc::channel();

        let worker_endpoints = endpoints.clone();
        let flag = Arc::clone(&interrupted);
        thread::spawn(move || {
            let interp = Scripted {
                interrupted: flag,
                code: Mutex::new(Vec::new()),
            };
            let mut worker = Worker::start(&worker_endpoints, WorkerOptions::default()).expect("worker start");
            let exit = worker.serve(&interp).expect("worker serve");
            let _ = exit_tx.send(exit);
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        Self {
            endpoints,
            exit,
            interrupted,
            runtime,
            _dir: dir,
        }
    }

    fn engine(&self, host: Arc<RecordingHost>) -> CallEngine {
        let retry = Retry {
            attempts: 50,
            delay: Duration::from_millis(20),
        };
        CallEngine::connect(self.runtime.handle(), &self.endpoints, host, retry).expect("connect engine")
    }

    /// Raw client on the primary socket, landing on a secondary slot.
    fn secondary(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.endpoints.primary).expect("connect secondary");
        stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
        stream
    }

    fn wait_exit(&self) -> Exit {
        self.exit.recv_timeout(TEST_TIMEOUT).expect("worker exit")
    }
}

fn send(stream: &mut UnixStream, message: &Message) {
    stream.write_all(&encode(message).unwrap()).unwrap();
}

fn recv(stream: &mut UnixStream) -> Message {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes(header) as usize;
    let mut frame = header.to_vec();
    frame.resize(4 + len, 0);
    stream.read_exact(&mut frame[4..]).unwrap();
    decode(&frame).unwrap()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_function_call_and_code_block_roundtrip() {
    let harness = Harness::start("roundtrip");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let reply = engine.request(function("echo", vec![json!({"a": [1, 2]})]));
    assert_eq!(reply.payload, Payload::Result(json!({"a": [1, 2]})));

    let block: CodeBlock = ["x = 1", "y = 2"].into_iter().collect();
    let reply = engine.request(Payload::Code(block));
    assert_eq!(reply.payload, Payload::Result(json!(2)));

    let reply = engine.request(function("missing", vec![]));
    assert_eq!(reply.payload, Payload::Error("no function missing".into()));
}

#[test]
fn test_callback_runs_on_calling_thread_before_response() {
    let harness = Harness::start("reentrant");
    let host = Arc::new(RecordingHost::default());
    let engine = harness.engine(Arc::clone(&host));

    let reply = engine.request(function("ask_host", vec![json!("plain")]));

    assert_eq!(reply.payload, Payload::Result(json!("from host")));
    assert_eq!(*host.threads.lock().unwrap(), vec![thread::current().id()]);
    assert_eq!(host.detached.load(Ordering::SeqCst), 0);
}

#[test]
fn test_callback_may_call_back_into_worker() {
    let harness = Harness::start("nested-call");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let reply = engine.request(function("ask_host", vec![json!("nested")]));
    assert_eq!(reply.payload, Payload::Result(json!(5)));

    // The nested call ran at depth 2, inside the outer call.
    let reply = engine.request(function("ask_host", vec![json!("depth")]));
    assert_eq!(reply.payload, Payload::Result(json!(2)));
    assert!(!engine.in_call());
}

#[test]
fn test_callback_while_idle_runs_detached() {
    let harness = Harness::start("detached");
    let host = Arc::new(RecordingHost::default());
    let engine = harness.engine(Arc::clone(&host));

    assert!(engine.call(function("ask_host", vec![json!("plain")]), false).is_none());
    assert!(wait_until(|| host.detached.load(Ordering::SeqCst) == 1));
    assert!(host.threads.lock().unwrap().is_empty());

    // The worker is still serving.
    let reply = engine.request(function("echo", vec![json!(1)]));
    assert_eq!(reply.payload, Payload::Result(json!(1)));
}

#[test]
fn test_console_claim_flushes_buffered_output_in_order() {
    let harness = Harness::start("console");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let reply = engine.request(function("print", vec![json!("hello\n")]));
    assert_eq!(reply.payload, Payload::Result(Value::Null));

    let mut console = harness.secondary();
    send(&mut console, &Message::new(7, true, Payload::control(Control::Console)));

    assert_eq!(recv(&mut console).payload, Payload::Console(ConsoleOutput::Prompt("> ".into())));
    assert_eq!(recv(&mut console).payload, Payload::Console(ConsoleOutput::Text("hello\n".into())));
    assert_eq!(recv(&mut console), Message::response(7, Payload::Result(Value::Null)));

    // Output now goes straight to the console.
    engine.request(function("print", vec![json!("again\n")]));
    assert_eq!(recv(&mut console).payload, Payload::Console(ConsoleOutput::Text("again\n".into())));
}

#[test]
fn test_second_console_claim_keeps_first_console() {
    let harness = Harness::start("console-claim");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let mut first = harness.secondary();
    send(&mut first, &Message::new(1, true, Payload::control(Control::Console)));
    recv(&mut first); // prompt
    assert_eq!(recv(&mut first), Message::response(1, Payload::Result(Value::Null)));

    let mut second = harness.secondary();
    send(&mut second, &Message::new(2, true, Payload::control(Control::Console)));
    assert_eq!(recv(&mut second), Message::response(2, Payload::Result(Value::Null)));

    engine.request(function("print", vec![json!("still first\n")]));
    assert_eq!(
        recv(&mut first).payload,
        Payload::Console(ConsoleOutput::Text("still first\n".into()))
    );

    second.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    assert!(second.read(&mut [0u8; 1]).is_err());
}

#[test]
fn test_graphics_command_reaches_console() {
    let harness = Harness::start("graphics");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let mut console = harness.secondary();
    send(&mut console, &Message::new(1, true, Payload::control(Control::Console)));
    recv(&mut console); // prompt
    assert_eq!(recv(&mut console).id, 1);

    let command = json!({"op": "plot", "points": [1, 2, 3]});
    let reply = engine.request(function("graphics", vec![command.clone()]));
    assert_eq!(reply.payload, Payload::Result(Value::Null));
    assert_eq!(recv(&mut console).payload, Payload::Console(ConsoleOutput::Graphics(command)));
}

#[test]
fn test_break_request_is_consumed_once() {
    let harness = Harness::start("break-flag");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    harness
        .runtime
        .block_on(request_break(&harness.endpoints.management))
        .unwrap();
    assert!(wait_until(|| {
        engine.request(function("check_break", vec![])).payload == Payload::Result(json!(true))
    }));

    let reply = engine.request(function("check_break", vec![]));
    assert_eq!(reply.payload, Payload::Result(json!(false)));
}

#[test]
fn test_shell_command_from_console() {
    let harness = Harness::start("shell");
    let _engine = harness.engine(Arc::new(RecordingHost::default()));

    let mut console = harness.secondary();
    send(&mut console, &Message::new(1, true, Payload::control(Control::Console)));
    recv(&mut console); // prompt
    assert_eq!(recv(&mut console).id, 1);

    send(&mut console, &Message::new(2, true, Payload::ShellCommand("1 + 1".into())));
    assert_eq!(recv(&mut console).payload, Payload::Console(ConsoleOutput::Text("ran 1 + 1\n".into())));
    let prompt = recv(&mut console);
    assert_eq!(prompt.id, 2);
    assert_eq!(prompt.payload, Payload::Console(ConsoleOutput::Prompt("> ".into())));
}

#[test]
fn test_undecodable_frame_is_answered_and_channel_survives() {
    let harness = Harness::start("garbage");
    let _engine = harness.engine(Arc::new(RecordingHost::default()));
    let mut client = harness.secondary();

    let body = br#"{"id":3,"wait":true,"payload":{"bogus":1}}"#;
    let mut frame = (body.len() as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(body);
    client.write_all(&frame).unwrap();

    assert_eq!(recv(&mut client), Message::error(3, FRAME_ERROR_DIAGNOSTIC));

    send(&mut client, &Message::new(4, true, function("echo", vec![json!("x")])));
    assert_eq!(recv(&mut client), Message::response(4, Payload::Result(json!("x"))));
}

#[test]
fn test_panicking_call_becomes_error_response() {
    let harness = Harness::start("panic");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let reply = engine.request(function("panic", vec![]));
    assert_eq!(reply.payload, Payload::Error("scripted failure".into()));

    let reply = engine.request(function("echo", vec![json!(true)]));
    assert_eq!(reply.payload, Payload::Result(json!(true)));
}

#[test]
fn test_nested_prompt_resets_console_prompt() {
    let harness = Harness::start("reset-prompt");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let mut console = harness.secondary();
    send(&mut console, &Message::new(1, true, Payload::control(Control::Console)));
    recv(&mut console); // top-level prompt
    assert_eq!(recv(&mut console).id, 1);

    let caller = thread::spawn(move || engine.request(function("read_line", vec![])));

    assert_eq!(
        recv(&mut console).payload,
        Payload::Console(ConsoleOutput::Prompt("nested> ".into()))
    );
    send(&mut console, &Message::new(9, true, Payload::ShellCommand("typed".into())));
    assert_eq!(recv(&mut console), Message::new(9, false, Payload::control(Control::ResetPrompt)));
    // The top-level prompt is drawn again, not the nested one.
    assert_eq!(
        recv(&mut console),
        Message::new(9, false, Payload::Console(ConsoleOutput::Prompt("> ".into())))
    );

    let reply = caller.join().unwrap();
    assert_eq!(reply.payload, Payload::Result(json!("typed")));
}

#[test]
fn test_secondary_close_is_not_fatal() {
    let harness = Harness::start("secondary-close");
    let engine = harness.engine(Arc::new(RecordingHost::default()));

    let mut client = harness.secondary();
    send(&mut client, &Message::new(1, true, function("echo", vec![json!(1)])));
    assert_eq!(recv(&mut client).id, 1);
    drop(client);

    let reply = engine.request(function("echo", vec![json!(2)]));
    assert_eq!(reply.payload, Payload::Result(json!(2)));
    assert!(harness.exit.try_recv().is_err());
}

#[test]
fn test_primary_loss_stops_worker() {
    let harness = Harness::start("primary-loss");
    let engine = harness.engine(Arc::new(RecordingHost::default()));
    let reply = engine.request(function("echo", vec![json!(1)]));
    assert!(!reply.is_error());

    drop(engine);
    assert_eq!(harness.wait_exit(), Exit::PrimaryLost);
    assert_eq!(Exit::PrimaryLost.code(), 1);
}

#[test]
fn test_shutdown_is_acknowledged_and_broadcast() {
    let harness = Harness::start("shutdown");
    let engine = harness.engine(Arc::new(RecordingHost::default()));
    let mut client = harness.secondary();
    send(&mut client, &Message::new(1, true, function("echo", vec![json!(1)])));
    recv(&mut client);

    let reply = engine.request(Payload::control(Control::Shutdown));
    assert_eq!(reply.payload, Payload::Result(Value::Null));
    assert_eq!(recv(&mut client).control(), Some(Control::Shutdown));
    assert_eq!(harness.wait_exit(), Exit::Requested);
}

#[test]
fn test_management_break_interrupts_interpreter() {
    let harness = Harness::start("break");
    let _engine = harness.engine(Arc::new(RecordingHost::default()));

    let interrupted = Arc::clone(&harness.interrupted);
    // serve() installs the interrupt hook once it starts; retry until then.
    assert!(wait_until(|| {
        let _ = harness.runtime.block_on(request_break(&harness.endpoints.management));
        thread::sleep(Duration::from_millis(20));
        interrupted.load(Ordering::SeqCst)
    }));
}
