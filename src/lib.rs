pub mod actions;
pub mod agent;
pub mod browser;
pub mod computer;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod prompt;
pub mod providers;
pub mod safety;
pub mod snapshots;
pub mod tools;

pub use actions::{Action, ActionVerb, MouseButton, Point};
pub use agent::{Agent, StopHandle, Termination, TurnOutcome, TurnState, STOPPED_MESSAGE};
pub use browser::{BrowserConfig, ChromiumComputer};
pub use computer::{Computer, RecordingComputer};
pub use config::{AgentConfig, AnthropicConfig, OpenAiConfig};
pub use conversation::{
    ConversationItem, DirectiveCall, DirectiveKind, DirectiveOutput, DirectiveResult, Payload,
    Role, SafetyCheck, Screenshot,
};
pub use dispatch::UnknownActionPolicy;
pub use error::{AgentError, ComputerError, ProviderError};
pub use providers::{Provider, ProviderKind};
pub use safety::{Blocklist, SafetyGate};
pub use snapshots::{DiskScreenshotStore, ScreenshotStore};
pub use tools::{ApplicationControl, FunctionTool, ToolRegistry};
