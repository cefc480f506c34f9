//! OpenAI Responses API with the `computer_use_preview` tool.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{send_json, ModelRequest, Provider, ProviderKind};
use crate::actions;
use crate::config::OpenAiConfig;
use crate::conversation::{
    answered_call_ids, ConversationItem, DirectiveCall, DirectiveKind, DirectiveOutput,
    DirectiveResult, Payload, Role, SafetyCheck, UNANSWERED_CALL,
};
use crate::error::ProviderError;
use crate::tools::DeclaredTools;

// ========================= Wire types =========================

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDecl>,
    truncation: &'a str,
    reasoning: Reasoning<'a>,
}

#[derive(Debug, Serialize)]
struct Reasoning<'a> {
    effort: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolDecl {
    ComputerUsePreview {
        display_width: u32,
        display_height: u32,
        environment: String,
    },
    Function {
        name: String,
        description: String,
        parameters: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    ComputerCall {
        call_id: String,
        action: Value,
        pending_safety_checks: Vec<WireSafetyCheck>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    ComputerCallOutput {
        call_id: String,
        acknowledged_safety_checks: Vec<WireSafetyCheck>,
        output: ScreenshotOutput,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String },
}

#[derive(Debug, Serialize)]
struct ScreenshotOutput {
    #[serde(rename = "type")]
    kind: &'static str,
    image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireSafetyCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

impl From<&SafetyCheck> for WireSafetyCheck {
    fn from(check: &SafetyCheck) -> Self {
        Self {
            id: check.id.clone(),
            code: check.code.clone(),
            message: check.message.clone(),
        }
    }
}

impl From<WireSafetyCheck> for SafetyCheck {
    fn from(wire: WireSafetyCheck) -> Self {
        SafetyCheck {
            id: wire.id,
            code: wire.code,
            ..SafetyCheck::new(wire.message)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    ComputerCall {
        call_id: String,
        #[serde(default)]
        action: Value,
        #[serde(default)]
        pending_safety_checks: Vec<WireSafetyCheck>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText { text: String },
    #[serde(other)]
    Other,
}

// ========================= Encoding =========================

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Agent => "assistant",
    }
}

fn text_message(role: Role, text: String) -> InputItem {
    let part = match role {
        Role::Agent => ContentPart::OutputText { text },
        _ => ContentPart::InputText { text },
    };
    InputItem::Message {
        role: role_name(role),
        content: vec![part],
    }
}

fn tool_output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_call(call: &DirectiveCall) -> InputItem {
    match &call.kind {
        DirectiveKind::ToolCall { name, arguments } => InputItem::FunctionCall {
            call_id: call.call_id.clone(),
            name: name.clone(),
            arguments: Value::Object(arguments.clone()).to_string(),
        },
        DirectiveKind::ScreenAction { action } => InputItem::ComputerCall {
            call_id: call.call_id.clone(),
            action: actions::openai::encode(action),
            pending_safety_checks: call.pending_safety_checks.iter().map(Into::into).collect(),
        },
    }
}

fn encode_output(output: &DirectiveOutput) -> InputItem {
    let call_id = output.call_id.clone();
    match &output.result {
        DirectiveResult::Tool { output } => InputItem::FunctionCallOutput {
            call_id,
            output: tool_output_text(output),
        },
        DirectiveResult::Failed { reason } => InputItem::FunctionCallOutput {
            call_id,
            output: format!("Error: {reason}"),
        },
        DirectiveResult::Screen {
            screenshot,
            current_url,
        } => InputItem::ComputerCallOutput {
            call_id,
            acknowledged_safety_checks: output
                .acknowledged_safety_checks
                .iter()
                .map(Into::into)
                .collect(),
            output: ScreenshotOutput {
                kind: "computer_screenshot",
                image_url: screenshot.data_url(),
                current_url: current_url.clone(),
            },
        },
    }
}

/// Replays the conversation as Responses input items. A call without an output
/// is rejected by the API, so unanswered `computer_call`s are left out and
/// unanswered `function_call`s get an error output.
fn encode_input(conversation: &[ConversationItem]) -> Vec<InputItem> {
    let answered = answered_call_ids(conversation);
    let mut input = Vec::with_capacity(conversation.len());
    for item in conversation {
        match &item.payload {
            Payload::Content { text } => input.push(text_message(item.role, text.clone())),
            Payload::Error { message } => {
                input.push(text_message(item.role, format!("Error: {message}")))
            }
            Payload::ImageContent(image) => input.push(InputItem::Message {
                role: "user",
                content: vec![ContentPart::InputImage {
                    image_url: image.data_url(),
                }],
            }),
            Payload::DirectiveCall(call) if !answered.contains(call.call_id.as_str()) => {
                match &call.kind {
                    DirectiveKind::ScreenAction { .. } => {
                        debug!(call_id = %call.call_id, "leaving unanswered computer_call out of replay");
                    }
                    DirectiveKind::ToolCall { .. } => {
                        input.push(encode_call(call));
                        input.push(InputItem::FunctionCallOutput {
                            call_id: call.call_id.clone(),
                            output: format!("Error: {UNANSWERED_CALL}"),
                        });
                    }
                }
            }
            Payload::DirectiveCall(call) => input.push(encode_call(call)),
            Payload::DirectiveOutput(output) => input.push(encode_output(output)),
        }
    }
    input
}

fn encode_tools(tools: &DeclaredTools) -> Vec<ToolDecl> {
    let screen = tools.screen.iter().map(|s| ToolDecl::ComputerUsePreview {
        display_width: s.display_width,
        display_height: s.display_height,
        environment: s.environment.clone(),
    });
    let functions = tools.functions.iter().map(|f| ToolDecl::Function {
        name: f.name.clone(),
        description: f.description.clone(),
        parameters: f.parameters.clone(),
    });
    screen.chain(functions).collect()
}

// ========================= Decoding =========================

fn parse_arguments(name: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str(raw) {
        Ok(args) => args,
        Err(err) => {
            warn!(tool = name, error = %err, "malformed function arguments, using empty set");
            Map::new()
        }
    }
}

fn decode_output(reply: ResponsesReply) -> Vec<ConversationItem> {
    let mut items = Vec::with_capacity(reply.output.len());
    for out in reply.output {
        match out {
            OutputItem::Message { content } => {
                let text: String = content
                    .into_iter()
                    .filter_map(|c| match c {
                        OutputContent::OutputText { text } => Some(text),
                        OutputContent::Other => None,
                    })
                    .collect();
                items.push(ConversationItem::agent(text));
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let arguments = parse_arguments(&name, &arguments);
                items.push(ConversationItem::call(DirectiveCall {
                    call_id,
                    kind: DirectiveKind::ToolCall { name, arguments },
                    pending_safety_checks: Vec::new(),
                }));
            }
            OutputItem::ComputerCall {
                call_id,
                action,
                pending_safety_checks,
            } => {
                items.push(ConversationItem::call(DirectiveCall {
                    call_id,
                    kind: DirectiveKind::ScreenAction {
                        action: actions::openai::decode(&action),
                    },
                    pending_safety_checks: pending_safety_checks
                        .into_iter()
                        .map(Into::into)
                        .collect(),
                }));
            }
            OutputItem::Other => {}
        }
    }
    items
}

// ========================= Client =========================

#[derive(Clone)]
pub struct OpenAiProvider {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(cfg: OpenAiConfig) -> Result<Self, ProviderError> {
        if cfg.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey("OpenAI"));
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn create_response(
        &self,
        request: ModelRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationItem>, ProviderError> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        let body = ResponsesRequest {
            model: request.model,
            input: encode_input(request.conversation),
            tools: encode_tools(request.tools),
            truncation: &self.cfg.truncation,
            reasoning: Reasoning {
                effort: &self.cfg.reasoning_effort,
            },
        };
        let payload = serde_json::to_vec(&body)?;
        debug!(
            url = %url,
            bytes = payload.len(),
            roles = ?request.conversation.iter().map(|i| i.role).collect::<Vec<_>>(),
            "openai request"
        );

        let reply: ResponsesReply = send_json(
            self.http
                .post(url)
                .bearer_auth(&self.cfg.api_key)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload),
            cancel,
        )
        .await?;
        Ok(decode_output(reply))
    }
}
