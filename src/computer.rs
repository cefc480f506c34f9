use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::actions::{Action, MouseButton, Point};
use crate::error::ComputerError;

pub const BROWSER_ENVIRONMENT: &str = "browser";

/// The screen the agent drives: capture plus pointer and keyboard injection.
///
/// One turn runs against one instance at a time; implementations may keep
/// state (cursor position, focused page) between calls.
#[async_trait]
pub trait Computer: Send + Sync {
    /// Encoded screen image (PNG).
    async fn capture(&self) -> Result<Vec<u8>, ComputerError>;
    async fn pointer_click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError>;
    async fn pointer_double_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn pointer_move(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn drag(&self, path: &[Point]) -> Result<(), ComputerError>;
    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError>;
    async fn type_text(&self, text: &str) -> Result<(), ComputerError>;
    async fn key_chord(&self, keys: &[String]) -> Result<(), ComputerError>;

    async fn wait(&self, ms: u64) -> Result<(), ComputerError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn dimensions(&self) -> Result<(u32, u32), ComputerError>;
    /// `"browser"`, `"mac"`, `"linux"`, ... Passed verbatim to providers.
    async fn environment(&self) -> Result<String, ComputerError>;
    /// Only meaningful when [`Computer::environment`] is `"browser"`.
    async fn current_url(&self) -> Result<String, ComputerError>;

    /// Extension point for verbs outside the fixed dispatch table.
    async fn perform(&self, verb: &str, _action: &Action) -> Result<(), ComputerError> {
        Err(ComputerError::Unsupported(verb.to_string()))
    }
}

// ========================= Recording helper =========================

/// One capability call as seen by [`RecordingComputer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputerCall {
    Capture,
    Click { x: i64, y: i64, button: MouseButton },
    DoubleClick { x: i64, y: i64 },
    Move { x: i64, y: i64 },
    Drag { path: Vec<Point> },
    Scroll { x: i64, y: i64, dx: i64, dy: i64 },
    Type { text: String },
    KeyChord { keys: Vec<String> },
    Wait { ms: u64 },
    CurrentUrl,
    Perform { verb: String },
}

type CallHook = Arc<dyn Fn(&ComputerCall) + Send + Sync>;

/// An in-memory capability that records every call and returns a fixed image.
///
/// Useful for dry runs and tests; `wait` returns immediately.
pub struct RecordingComputer {
    calls: Mutex<Vec<ComputerCall>>,
    image: Vec<u8>,
    environment: String,
    url: String,
    size: (u32, u32),
    capture_fails: bool,
    input_fails: bool,
    extra_verbs: Vec<String>,
    hook: Option<CallHook>,
}

impl Default for RecordingComputer {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            image: b"\x89PNG\r\n\x1a\n".to_vec(),
            environment: "desktop".to_string(),
            url: String::new(),
            size: (1280, 800),
            capture_fails: false,
            input_fails: false,
            extra_verbs: Vec::new(),
            hook: None,
        }
    }
}

impl RecordingComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports the `"browser"` environment with `url` as the current page.
    pub fn browser(url: impl Into<String>) -> Self {
        Self {
            environment: BROWSER_ENVIRONMENT.to_string(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = image;
        self
    }

    pub fn without_capture(mut self) -> Self {
        self.capture_fails = true;
        self
    }

    pub fn with_failing_input(mut self) -> Self {
        self.input_fails = true;
        self
    }

    /// Verbs accepted by [`Computer::perform`].
    pub fn with_extra_verb(mut self, verb: impl Into<String>) -> Self {
        self.extra_verbs.push(verb.into());
        self
    }

    /// Runs `hook` after every recorded call.
    pub fn on_call(mut self, hook: impl Fn(&ComputerCall) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<ComputerCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn capture_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ComputerCall::Capture))
            .count()
    }

    fn record(&self, call: ComputerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        if let Some(hook) = &self.hook {
            hook(&call);
        }
    }

    fn input(&self, call: ComputerCall) -> Result<(), ComputerError> {
        self.record(call);
        if self.input_fails {
            return Err(ComputerError::Input("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Computer for RecordingComputer {
    async fn capture(&self) -> Result<Vec<u8>, ComputerError> {
        self.record(ComputerCall::Capture);
        if self.capture_fails {
            return Err(ComputerError::CaptureUnavailable);
        }
        Ok(self.image.clone())
    }

    async fn pointer_click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.input(ComputerCall::Click { x, y, button })
    }

    async fn pointer_double_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.input(ComputerCall::DoubleClick { x, y })
    }

    async fn pointer_move(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.input(ComputerCall::Move { x, y })
    }

    async fn drag(&self, path: &[Point]) -> Result<(), ComputerError> {
        self.input(ComputerCall::Drag { path: path.to_vec() })
    }

    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        self.input(ComputerCall::Scroll { x, y, dx, dy })
    }

    async fn type_text(&self, text: &str) -> Result<(), ComputerError> {
        self.input(ComputerCall::Type { text: text.to_string() })
    }

    async fn key_chord(&self, keys: &[String]) -> Result<(), ComputerError> {
        self.input(ComputerCall::KeyChord { keys: keys.to_vec() })
    }

    async fn wait(&self, ms: u64) -> Result<(), ComputerError> {
        self.record(ComputerCall::Wait { ms });
        Ok(())
    }

    async fn dimensions(&self) -> Result<(u32, u32), ComputerError> {
        Ok(self.size)
    }

    async fn environment(&self) -> Result<String, ComputerError> {
        Ok(self.environment.clone())
    }

    async fn current_url(&self) -> Result<String, ComputerError> {
        self.record(ComputerCall::CurrentUrl);
        Ok(self.url.clone())
    }

    async fn perform(&self, verb: &str, _action: &Action) -> Result<(), ComputerError> {
        if !self.extra_verbs.iter().any(|v| v == verb) {
            return Err(ComputerError::Unsupported(verb.to_string()));
        }
        self.input(ComputerCall::Perform { verb: verb.to_string() })
    }
}
