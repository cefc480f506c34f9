use std::str::FromStr;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionVerb, TYPE_SETTLE_MS};
use crate::computer::{Computer, BROWSER_ENVIRONMENT};
use crate::conversation::{
    DirectiveCall, DirectiveKind, DirectiveOutput, DirectiveResult, SafetyCheck, Screenshot,
};
use crate::error::{AgentError, ComputerError};
use crate::safety::{Blocklist, SafetyGate};
use crate::tools::ToolRegistry;

/// What to do with a screen action whose verb nothing can execute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownActionPolicy {
    /// Log and drop the directive; no output is produced and the turn continues.
    #[default]
    Skip,
    /// Terminate the turn with [`AgentError::UnknownAction`].
    Fail,
}

impl FromStr for UnknownActionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown action policy `{other}`, expected `skip` or `fail`")),
        }
    }
}

/// Executes one directive against the capability and function tools.
pub struct Dispatcher<'a> {
    pub computer: &'a dyn Computer,
    pub tools: &'a ToolRegistry,
    pub gate: &'a SafetyGate,
    pub blocklist: &'a Blocklist,
    pub unknown_actions: UnknownActionPolicy,
}

impl Dispatcher<'_> {
    /// `Ok(None)` means the directive was skipped and nothing should be appended.
    pub async fn handle(&self, call: &DirectiveCall) -> Result<Option<DirectiveOutput>, AgentError> {
        match &call.kind {
            DirectiveKind::ToolCall { name, arguments } => {
                Ok(Some(self.run_tool(&call.call_id, name, arguments).await))
            }
            DirectiveKind::ScreenAction { action } => {
                self.run_screen_action(&call.call_id, action, &call.pending_safety_checks)
                    .await
            }
        }
    }

    async fn run_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> DirectiveOutput {
        info!(call_id, tool = name, "function call");
        let result = match self.tools.get(name) {
            Some(tool) => match tool.call(arguments).await {
                Ok(output) => DirectiveResult::Tool { output },
                Err(err) => {
                    warn!(call_id, tool = name, error = %err, "function tool failed");
                    DirectiveResult::Failed {
                        reason: err.to_string(),
                    }
                }
            },
            None => {
                warn!(call_id, tool = name, "no such function tool, answering with placeholder");
                DirectiveResult::Tool {
                    output: json!({
                        "status": "unavailable",
                        "detail": format!("no tool named `{name}` is available"),
                    }),
                }
            }
        };
        DirectiveOutput {
            call_id: call_id.to_string(),
            result,
            acknowledged_safety_checks: Vec::new(),
        }
    }

    async fn run_screen_action(
        &self,
        call_id: &str,
        action: &Action,
        pending: &[SafetyCheck],
    ) -> Result<Option<DirectiveOutput>, AgentError> {
        info!(call_id, verb = action.verb_name(), "screen action");
        match self.execute(action).await {
            Ok(()) => {}
            Err(ComputerError::Unsupported(verb)) => match self.unknown_actions {
                UnknownActionPolicy::Skip => {
                    warn!(call_id, verb = %verb, "unsupported screen action skipped");
                    return Ok(None);
                }
                UnknownActionPolicy::Fail => return Err(AgentError::UnknownAction(verb)),
            },
            Err(err) => warn!(call_id, verb = action.verb_name(), error = %err, "screen action failed"),
        }

        let screenshot = Screenshot::png(self.computer.capture().await?);
        debug!(call_id, bytes = screenshot.data.len(), "captured screen");

        let acknowledged = self.gate.review(pending)?;

        let current_url = if self.computer.environment().await? == BROWSER_ENVIRONMENT {
            let url = self.computer.current_url().await?;
            debug!(call_id, url = %url, "current browser url");
            self.blocklist.check(&url)?;
            Some(url)
        } else {
            None
        };

        Ok(Some(DirectiveOutput {
            call_id: call_id.to_string(),
            result: DirectiveResult::Screen {
                screenshot,
                current_url,
            },
            acknowledged_safety_checks: acknowledged,
        }))
    }

    async fn execute(&self, action: &Action) -> Result<(), ComputerError> {
        let c = self.computer;
        let p = action.position;
        match &action.verb {
            ActionVerb::Click => c.pointer_click(p.x, p.y, action.button).await,
            ActionVerb::DoubleClick => c.pointer_double_click(p.x, p.y).await,
            ActionVerb::Move => c.pointer_move(p.x, p.y).await,
            ActionVerb::Drag => c.drag(&action.path).await,
            ActionVerb::Scroll => c.scroll(p.x, p.y, action.scroll_x, action.scroll_y).await,
            ActionVerb::Type => {
                c.type_text(&action.text).await?;
                c.wait(TYPE_SETTLE_MS).await
            }
            ActionVerb::KeyChord => {
                c.key_chord(&action.keys).await?;
                if let Some(ms) = action.settle_ms {
                    debug!(ms, "settling after shortcut");
                    c.wait(ms).await?;
                }
                Ok(())
            }
            ActionVerb::Wait => c.wait(action.duration_ms).await,
            ActionVerb::Screenshot => Ok(()),
            ActionVerb::Other(verb) => c.perform(verb, action).await,
        }
    }
}
