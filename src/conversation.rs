use std::collections::HashSet;
use std::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::actions::Action;
use crate::error::AgentError;

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
}

/// Encoded image bytes plus their media type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Screenshot {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.data)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.to_base64())
    }
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screenshot")
            .field("media_type", &self.media_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

mod base64_bytes {
    use super::B64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        B64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    #[default]
    Unresolved,
    Acknowledged,
}

/// A warning the model attached to a directive; a human must acknowledge it
/// before the directive's result may be used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: Option<String>,
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub state: CheckState,
}

impl SafetyCheck {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: None,
            code: None,
            message: message.into(),
            state: CheckState::Unresolved,
        }
    }

    pub fn acknowledged(mut self) -> Self {
        self.state = CheckState::Acknowledged;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectiveKind {
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },
    ScreenAction {
        action: Action,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectiveCall {
    pub call_id: String,
    pub kind: DirectiveKind,
    #[serde(default)]
    pub pending_safety_checks: Vec<SafetyCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DirectiveResult {
    Tool {
        output: Value,
    },
    Screen {
        screenshot: Screenshot,
        current_url: Option<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectiveOutput {
    pub call_id: String,
    pub result: DirectiveResult,
    #[serde(default)]
    pub acknowledged_safety_checks: Vec<SafetyCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Content { text: String },
    Error { message: String },
    DirectiveCall(DirectiveCall),
    DirectiveOutput(DirectiveOutput),
    ImageContent(Screenshot),
}

/// One element of a turn's append-only history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub role: Role,
    pub payload: Payload,
}

impl ConversationItem {
    pub fn content(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            payload: Payload::Content { text: text.into() },
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::content(Role::User, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::content(Role::Agent, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::content(Role::System, text)
    }

    pub fn image(role: Role, screenshot: Screenshot) -> Self {
        Self {
            role,
            payload: Payload::ImageContent(screenshot),
        }
    }

    pub fn call(call: DirectiveCall) -> Self {
        Self {
            role: Role::Agent,
            payload: Payload::DirectiveCall(call),
        }
    }

    pub fn output(output: DirectiveOutput) -> Self {
        Self {
            role: Role::Agent,
            payload: Payload::DirectiveOutput(output),
        }
    }

    pub fn as_call(&self) -> Option<&DirectiveCall> {
        match &self.payload {
            Payload::DirectiveCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&DirectiveOutput> {
        match &self.payload {
            Payload::DirectiveOutput(output) => Some(output),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Content { text } => Some(text),
            _ => None,
        }
    }
}

/// Checks that `output` answers `call`.
pub fn link_output(call: &DirectiveCall, output: &DirectiveOutput) -> Result<(), AgentError> {
    if call.call_id != output.call_id {
        return Err(AgentError::UnlinkedOutput {
            call_id: call.call_id.clone(),
            output_id: output.call_id.clone(),
        });
    }
    Ok(())
}

/// Result text replayed to a provider for a call that never produced an output,
/// either because its action was skipped or because the turn stopped first.
pub const UNANSWERED_CALL: &str = "action not supported or not executed; no result is available";

/// Ids of every call answered somewhere in `items`.
pub fn answered_call_ids(items: &[ConversationItem]) -> HashSet<&str> {
    items
        .iter()
        .filter_map(ConversationItem::as_output)
        .map(|output| output.call_id.as_str())
        .collect()
}

/// The only success-termination predicate: an agent-authored text message.
pub fn is_terminal(item: &ConversationItem) -> bool {
    item.role == Role::Agent && matches!(item.payload, Payload::Content { .. })
}

/// One-line summary with image bytes left out, for debug logs.
impl fmt::Display for ConversationItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: ", self.role)?;
        match &self.payload {
            Payload::Content { text } => write!(f, "{text:?}"),
            Payload::Error { message } => write!(f, "error {message:?}"),
            Payload::ImageContent(image) => write!(f, "[image omitted: {} bytes]", image.data.len()),
            Payload::DirectiveCall(call) => match &call.kind {
                DirectiveKind::ToolCall { name, arguments } => {
                    write!(f, "call {} {name}({})", call.call_id, Value::Object(arguments.clone()))
                }
                DirectiveKind::ScreenAction { action } => {
                    write!(f, "call {} {:?}", call.call_id, action.verb)
                }
            },
            Payload::DirectiveOutput(output) => match &output.result {
                DirectiveResult::Tool { output: value } => {
                    write!(f, "output {} {value}", output.call_id)
                }
                DirectiveResult::Screen { screenshot, current_url } => write!(
                    f,
                    "output {} [image omitted: {} bytes] url={:?}",
                    output.call_id,
                    screenshot.data.len(),
                    current_url
                ),
                DirectiveResult::Failed { reason } => {
                    write!(f, "output {} failed: {reason}", output.call_id)
                }
            },
        }
    }
}
