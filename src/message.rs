//! Message envelope shared by every endpoint.
//!
//! A [`Message`] is the unit of exchange on every channel. The payload is a
//! closed sum type: exactly one tag is active, and a frame whose payload
//! carries no recognized tag fails to decode.
//!
//! # Wire shape
//!
//! ```text
//! {"id":7,"wait":true,"payload":{"control_message":"console"}}
//! {"id":7,"payload":{"result":null}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transaction id used for unsolicited messages (console output, broadcasts).
pub const UNSOLICITED_ID: u32 = 0;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Transaction id, unique per originating endpoint.
    pub id: u32,
    /// The sender expects a correlated response.
    #[serde(default)]
    pub wait: bool,
    pub payload: Payload,
}

impl Message {
    pub fn new(id: u32, wait: bool, payload: Payload) -> Self {
        Self { id, wait, payload }
    }

    /// Fire-and-forget message that nobody answers.
    pub fn unsolicited(payload: Payload) -> Self {
        Self::new(UNSOLICITED_ID, false, payload)
    }

    /// Response correlated with request `id`.
    pub fn response(id: u32, payload: Payload) -> Self {
        Self::new(id, false, payload)
    }

    /// Error response correlated with request `id`.
    pub fn error(id: u32, text: impl Into<String>) -> Self {
        Self::response(id, Payload::Error(text.into()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error(_))
    }

    /// The control word carried by this message, if it is a control message.
    pub fn control(&self) -> Option<Control> {
        match &self.payload {
            Payload::ControlMessage(text) => Some(Control::parse(text)),
            _ => None,
        }
    }
}

/// Tagged payload. Unknown tags are decode errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    FunctionCall(FunctionCall),
    Code(CodeBlock),
    ShellCommand(String),
    ControlMessage(String),
    Callback(CallbackInvocation),
    Result(Value),
    Error(String),
    Console(ConsoleOutput),
}

impl Payload {
    pub fn control(control: Control) -> Self {
        Payload::ControlMessage(control.as_str().to_string())
    }

    /// Short tag name for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::FunctionCall(_) => "function_call",
            Payload::Code(_) => "code",
            Payload::ShellCommand(_) => "shell_command",
            Payload::ControlMessage(_) => "control_message",
            Payload::Callback(_) => "callback",
            Payload::Result(_) => "result",
            Payload::Error(_) => "error",
            Payload::Console(_) => "console",
        }
    }
}

/// Call a named function in the peer's interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Source lines executed as one block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeBlock {
    pub lines: Vec<String>,
}

impl CodeBlock {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl<S: Into<String>> FromIterator<S> for CodeBlock {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// A call from the worker back into the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackInvocation {
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Output pushed to the designated console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleOutput {
    Text(String),
    Err(String),
    Prompt(String),
    /// Opaque device/graphics command, forwarded untouched.
    Graphics(Value),
}

/// Control vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown,
    /// Claim the sending channel as the console.
    Console,
    /// Close the sending channel.
    Close,
    /// Interrupt the interpreter (management channel only).
    Break,
    /// Unwind notification after a nested call chain.
    ResetPrompt,
    Unknown,
}

impl Control {
    pub fn parse(text: &str) -> Self {
        match text {
            "shutdown" => Control::Shutdown,
            "console" => Control::Console,
            "close" => Control::Close,
            "break" => Control::Break,
            "reset-prompt" => Control::ResetPrompt,
            _ => Control::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Control::Shutdown => "shutdown",
            Control::Console => "console",
            Control::Close => "close",
            Control::Break => "break",
            Control::ResetPrompt => "reset-prompt",
            Control::Unknown => "unknown",
        }
    }
}
