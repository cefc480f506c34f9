//! Anthropic Messages API with the `computer_20250124` beta tool.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{send_json, ModelRequest, Provider, ProviderKind};
use crate::actions;
use crate::config::AnthropicConfig;
use crate::conversation::{
    answered_call_ids, ConversationItem, DirectiveCall, DirectiveKind, DirectiveOutput, DirectiveResult, Payload,
    Role, Screenshot, UNANSWERED_CALL,
};
use crate::error::ProviderError;
use crate::tools::DeclaredTools;

/// Name of the built-in screen tool in requests and `tool_use` blocks.
const COMPUTER_TOOL: &str = "computer";

// ========================= Wire types =========================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDecl>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<Block>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<Block>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

impl From<&Screenshot> for ImageSource {
    fn from(image: &Screenshot) -> Self {
        Self {
            kind: "base64",
            media_type: image.media_type.clone(),
            data: image.to_base64(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ToolDecl {
    Computer {
        #[serde(rename = "type")]
        kind: &'static str,
        name: &'static str,
        display_width_px: u32,
        display_height_px: u32,
        display_number: u32,
    },
    Function {
        name: String,
        description: String,
        input_schema: Value,
    },
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ReplyBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

// ========================= Encoding =========================

/// Appends to the previous message when the role repeats; the API wants strict alternation.
fn push_blocks(messages: &mut Vec<Message>, role: &'static str, blocks: Vec<Block>) {
    if blocks.is_empty() {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => messages.push(Message {
            role,
            content: blocks,
        }),
    }
}

fn text_block(text: String) -> Vec<Block> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Block::Text { text }]
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Agent => "assistant",
        Role::User | Role::System => "user",
    }
}

fn encode_call(call: &DirectiveCall) -> Block {
    let (name, input) = match &call.kind {
        DirectiveKind::ToolCall { name, arguments } => {
            (name.clone(), Value::Object(arguments.clone()))
        }
        DirectiveKind::ScreenAction { action } => {
            (COMPUTER_TOOL.to_string(), actions::anthropic::encode(action))
        }
    };
    Block::ToolUse {
        id: call.call_id.clone(),
        name,
        input,
    }
}

fn encode_output(output: &DirectiveOutput) -> Block {
    let (content, is_error) = match &output.result {
        DirectiveResult::Tool { output } => {
            let text = match output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (vec![Block::Text { text }], false)
        }
        DirectiveResult::Failed { reason } => (
            vec![Block::Text {
                text: reason.clone(),
            }],
            true,
        ),
        DirectiveResult::Screen {
            screenshot,
            current_url,
        } => {
            let text = match current_url {
                Some(url) => format!("Screenshot taken. Current URL: {url}"),
                None => "Screenshot taken successfully".to_string(),
            };
            (
                vec![
                    Block::Text { text },
                    Block::Image {
                        source: screenshot.into(),
                    },
                ],
                false,
            )
        }
    };
    Block::ToolResult {
        tool_use_id: output.call_id.clone(),
        content,
        is_error,
    }
}

/// Every `tool_use` needs a `tool_result` in the next user message, so calls
/// without an output get an error result once their batch ends.
fn answer_unanswered(messages: &mut Vec<Message>, unanswered: &mut Vec<String>) {
    let blocks = unanswered
        .drain(..)
        .map(|id| {
            debug!(call_id = %id, "replaying unanswered tool_use with an error result");
            Block::ToolResult {
                tool_use_id: id,
                content: vec![Block::Text {
                    text: UNANSWERED_CALL.to_string(),
                }],
                is_error: true,
            }
        })
        .collect();
    push_blocks(messages, "user", blocks);
}

/// Splits system text out of the conversation and encodes the rest as messages.
fn encode_conversation(conversation: &[ConversationItem]) -> (Option<String>, Vec<Message>) {
    let answered = answered_call_ids(conversation);
    let mut unanswered = Vec::new();
    let mut system = Vec::new();
    let mut messages = Vec::new();
    for item in conversation {
        if item.as_call().is_none() {
            answer_unanswered(&mut messages, &mut unanswered);
        }
        if item.role == Role::System {
            if let Payload::Content { text } = &item.payload {
                system.push(text.as_str());
                continue;
            }
        }
        match &item.payload {
            Payload::Content { text } => {
                push_blocks(&mut messages, role_name(item.role), text_block(text.clone()))
            }
            Payload::Error { message } => push_blocks(
                &mut messages,
                role_name(item.role),
                text_block(format!("Error: {message}")),
            ),
            Payload::ImageContent(image) => push_blocks(
                &mut messages,
                "user",
                vec![Block::Image {
                    source: image.into(),
                }],
            ),
            Payload::DirectiveCall(call) => {
                push_blocks(&mut messages, "assistant", vec![encode_call(call)]);
                if !answered.contains(call.call_id.as_str()) {
                    unanswered.push(call.call_id.clone());
                }
            }
            Payload::DirectiveOutput(output) => {
                push_blocks(&mut messages, "user", vec![encode_output(output)])
            }
        }
    }
    answer_unanswered(&mut messages, &mut unanswered);
    let system = (!system.is_empty()).then(|| system.join("\n"));
    (system, messages)
}

fn encode_tools(tools: &DeclaredTools) -> Vec<ToolDecl> {
    let screen = tools.screen.iter().map(|s| ToolDecl::Computer {
        kind: "computer_20250124",
        name: COMPUTER_TOOL,
        display_width_px: s.display_width,
        display_height_px: s.display_height,
        display_number: 1,
    });
    let functions = tools.functions.iter().map(|f| ToolDecl::Function {
        name: f.name.clone(),
        description: f.description.clone(),
        input_schema: f.parameters.clone(),
    });
    screen.chain(functions).collect()
}

// ========================= Decoding =========================

fn decode_reply(reply: MessagesReply) -> Vec<ConversationItem> {
    let mut items = Vec::with_capacity(reply.content.len());
    for block in reply.content {
        match block {
            ReplyBlock::Text { text } => items.push(ConversationItem::agent(text)),
            ReplyBlock::ToolUse { id, name, input } => {
                let kind = if name == COMPUTER_TOOL {
                    DirectiveKind::ScreenAction {
                        action: actions::anthropic::decode(&input),
                    }
                } else {
                    let arguments = match input {
                        Value::Object(map) => map,
                        Value::Null => Map::new(),
                        other => {
                            warn!(tool = %name, input = %other, "tool input is not an object, using empty set");
                            Map::new()
                        }
                    };
                    DirectiveKind::ToolCall { name, arguments }
                };
                items.push(ConversationItem::call(DirectiveCall {
                    call_id: id,
                    kind,
                    pending_safety_checks: Vec::new(),
                }));
            }
            ReplyBlock::Other => {}
        }
    }
    items
}

// ========================= Client =========================

#[derive(Clone)]
pub struct AnthropicProvider {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(cfg: AnthropicConfig) -> Result<Self, ProviderError> {
        if cfg.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey("Anthropic"));
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn create_response(
        &self,
        request: ModelRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationItem>, ProviderError> {
        let url = format!("{}/v1/messages", self.cfg.api_base.trim_end_matches('/'));
        let (system, messages) = encode_conversation(request.conversation);
        let body = MessagesRequest {
            model: request.model,
            max_tokens: self.cfg.max_tokens,
            system,
            messages,
            tools: encode_tools(request.tools),
        };
        let payload = serde_json::to_vec(&body)?;
        debug!(
            url = %url,
            bytes = payload.len(),
            messages = body.messages.len(),
            tools = body.tools.len(),
            "anthropic request"
        );

        let reply: MessagesReply = send_json(
            self.http
                .post(url)
                .header("x-api-key", &self.cfg.api_key)
                .header("anthropic-version", &self.cfg.version)
                .header("anthropic-beta", &self.cfg.beta)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload),
            cancel,
        )
        .await?;
        Ok(decode_reply(reply))
    }
}
