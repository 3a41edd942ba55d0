//! Wire protocol for supervisor <-> bridge resource communication
//!
//! Every message is one line of UTF-8 JSON: a two element array `[type, payload]`
//! terminated by `\n`. There is no length prefix, acknowledgement or retry; delivery is
//! best-effort.

use fxdk_core::{FxdkError, ResourceCommand, Result};
use serde_json::Value;

/// Directive sent from the supervisor to the bridge resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Reconcile the resource list against the resources directory
    Refresh,
    Restart(String),
    Stop(String),
    Start(String),
    /// Request a resource state snapshot
    RequestState,
}

impl Directive {
    /// Message type on the wire
    pub fn message_type(&self) -> &'static str {
        match self {
            Directive::Refresh => "refresh",
            Directive::Restart(_) => "restart",
            Directive::Stop(_) => "stop",
            Directive::Start(_) => "start",
            Directive::RequestState => "state",
        }
    }

    /// Payload on the wire, `None` for directives without one
    pub fn payload(&self) -> Option<Value> {
        match self {
            Directive::Restart(name) | Directive::Stop(name) | Directive::Start(name) => {
                Some(Value::String(name.clone()))
            }
            Directive::Refresh | Directive::RequestState => None,
        }
    }
}

impl From<&ResourceCommand> for Directive {
    fn from(command: &ResourceCommand) -> Self {
        match command {
            ResourceCommand::Restart(name) => Directive::Restart(name.clone()),
            ResourceCommand::Stop(name) => Directive::Stop(name.clone()),
            ResourceCommand::Start(name) => Directive::Start(name.clone()),
            ResourceCommand::RequestState => Directive::RequestState,
        }
    }
}

/// Message received from the bridge resource
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Resource state snapshot, forwarded to observers untouched
    State(Value),
    /// Bridge resource finished booting
    Ready,
    /// Any other message type
    Unknown { message_type: String, payload: Value },
}

/// Serialize `[type, payload]` followed by the line terminator
pub fn encode_frame(message_type: &str, payload: Option<&Value>) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(&(message_type, payload))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one line into its `(type, payload)` pair.
///
/// A missing payload element reads as `null`.
pub fn decode_frame(line: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Array(mut items) = value else {
        return Err(FxdkError::ProtocolError(format!(
            "Expected [type, payload] array, got: {}",
            preview(line)
        )));
    };

    if items.is_empty() || items.len() > 2 {
        return Err(FxdkError::ProtocolError(format!(
            "Expected 1 or 2 elements, got {}",
            items.len()
        )));
    }

    let payload = if items.len() == 2 {
        items.pop().unwrap_or(Value::Null)
    } else {
        Value::Null
    };

    match items.pop() {
        Some(Value::String(message_type)) => Ok((message_type, payload)),
        other => Err(FxdkError::ProtocolError(format!(
            "Message type must be a string, got {:?}",
            other
        ))),
    }
}

/// Parse one line into a [`Notice`]
pub fn decode_notice(line: &str) -> Result<Notice> {
    let (message_type, payload) = decode_frame(line)?;
    Ok(match message_type.as_str() {
        "state" => Notice::State(payload),
        "ready" => Notice::Ready,
        _ => Notice::Unknown {
            message_type,
            payload,
        },
    })
}

/// Log-friendly prefix of a frame
pub(crate) fn preview(data: &str) -> String {
    data.chars().take(200).collect()
}
