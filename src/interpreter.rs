//! Boundary between the worker and the embedded interpreter.
//!
//! The worker owns transport and dispatch; everything about evaluating code
//! lives behind [`Interpreter`]. Implementations receive the [`Worker`] so
//! they can write console output, issue callbacks, and read nested console
//! input while a call is executing.

use crate::message::{CodeBlock, FunctionCall, Payload};
use crate::worker::Worker;

/// Embedded interpreter driven by the worker loop.
pub trait Interpreter {
    /// Prompt shown for the next console read.
    fn prompt(&self) -> String {
        "> ".to_string()
    }

    /// Evaluate a function call; the returned payload is the response.
    fn call_function(&self, worker: &mut Worker, call: &FunctionCall) -> Payload;

    /// Execute a code block; the returned payload is the response.
    fn exec_code(&self, worker: &mut Worker, code: &CodeBlock) -> Payload;

    /// Evaluate one line of shell input. Output goes to the console.
    fn eval_shell(&self, worker: &mut Worker, line: &str);

    /// Housekeeping hook run when the worker loop is idle.
    fn tick(&self) {}

    /// Hook the management channel uses to interrupt evaluation.
    fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        None
    }
}

/// Asynchronous interrupt request, raised from an I/O thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}
