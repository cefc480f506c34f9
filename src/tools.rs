//! External function tools the model may call alongside screen actions.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Name, description and JSON-schema parameters of one function tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Screen geometry and environment advertised to the provider's computer tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScreenSpec {
    pub display_width: u32,
    pub display_height: u32,
    pub environment: String,
}

/// Everything the model is told it may call during a turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeclaredTools {
    pub screen: Option<ScreenSpec>,
    pub functions: Vec<FunctionSpec>,
}

#[async_trait]
pub trait FunctionTool: Send + Sync {
    fn spec(&self) -> FunctionSpec;
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn FunctionTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, tool: Arc<dyn FunctionTool>) {
        let name = tool.spec().name;
        self.tools.retain(|t| t.spec().name != name);
        self.tools.push(tool);
    }

    pub fn with(mut self, tool: Arc<dyn FunctionTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FunctionTool>> {
        self.tools.iter().find(|t| t.spec().name == name)
    }

    pub fn specs(&self) -> Vec<FunctionSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }
}

// ========================= Application tools =========================

/// OS-level application switching, provided by the embedding application.
#[async_trait]
pub trait ApplicationControl: Send + Sync {
    async fn switch_to(&self, app_name: &str) -> Result<()>;
    async fn open(&self, app_name: &str) -> Result<()>;
    async fn active(&self) -> Result<String>;
}

fn app_name_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "app_name": { "type": "string", "description": description }
        },
        "required": ["app_name"],
        "additionalProperties": false,
    })
}

fn app_name(arguments: &Map<String, Value>) -> Result<&str> {
    arguments
        .get("app_name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("missing app_name"))
}

struct SwitchToApplication(Arc<dyn ApplicationControl>);
struct OpenApplication(Arc<dyn ApplicationControl>);
struct ActiveApplication(Arc<dyn ApplicationControl>);

#[async_trait]
impl FunctionTool for SwitchToApplication {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: "switch_to_application".into(),
            description: "Switch to a running application by name (e.g. 'Safari', 'Mail').".into(),
            parameters: app_name_schema("Name of the application to switch to"),
        }
    }

    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let name = app_name(arguments)?;
        self.0.switch_to(name).await?;
        Ok(json!({ "switched_to": name }))
    }
}

#[async_trait]
impl FunctionTool for OpenApplication {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: "open_application".into(),
            description: "Open or launch an application by name.".into(),
            parameters: app_name_schema("Name of the application to open"),
        }
    }

    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let name = app_name(arguments)?;
        self.0.open(name).await?;
        Ok(json!({ "opened": name }))
    }
}

#[async_trait]
impl FunctionTool for ActiveApplication {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: "get_active_application".into(),
            description: "Get the name of the currently focused application.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _arguments: &Map<String, Value>) -> Result<Value> {
        Ok(json!({ "active_application": self.0.active().await? }))
    }
}

/// `switch_to_application`, `open_application` and `get_active_application`.
pub fn application_tools(control: Arc<dyn ApplicationControl>) -> Vec<Arc<dyn FunctionTool>> {
    vec![
        Arc::new(SwitchToApplication(control.clone())),
        Arc::new(OpenApplication(control.clone())),
        Arc::new(ActiveApplication(control)),
    ]
}
