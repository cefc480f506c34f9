//! Normalized screen actions and the two provider vocabularies that map onto them.
//!
//! Providers disagree on almost every detail of a screen action: OpenAI sends
//! `{type: "click", x, y, button}` while Anthropic sends
//! `{action: "left_click", coordinate: [x, y]}`; OpenAI scrolls by raw deltas,
//! Anthropic by direction and magnitude; OpenAI lists keys, Anthropic joins
//! them with `+`. Decoding here is total: every shape yields an [`Action`] with
//! all defaults applied, and malformed argument objects fall back to defaults.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

pub const DEFAULT_WAIT_MS: u64 = 1000;
pub const APP_SWITCHER_SETTLE_MS: u64 = 800;
/// Pause after typing so the text is rendered before the capture.
pub const TYPE_SETTLE_MS: u64 = 100;
pub const DEFAULT_SCROLL_MAGNITUDE: i64 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

impl MouseButton {
    /// Unrecognized names resolve to the left button.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "right" => MouseButton::Right,
            "middle" | "wheel" => MouseButton::Middle,
            "back" => MouseButton::Back,
            "forward" => MouseButton::Forward,
            _ => MouseButton::Left,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
            MouseButton::Back => "back",
            MouseButton::Forward => "forward",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    Click,
    DoubleClick,
    Move,
    Drag,
    Scroll,
    Type,
    KeyChord,
    Wait,
    Screenshot,
    /// A verb neither vocabulary table knows; resolved by the capability fallback.
    Other(String),
}

/// A verb plus a flat argument record. Fields a verb does not use keep their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub verb: ActionVerb,
    pub position: Point,
    pub button: MouseButton,
    pub text: String,
    pub keys: Vec<String>,
    pub scroll_x: i64,
    pub scroll_y: i64,
    pub path: Vec<Point>,
    pub duration_ms: u64,
    /// Extra wait after the action, for shortcuts that need time to take effect.
    pub settle_ms: Option<u64>,
}

impl Action {
    pub fn new(verb: ActionVerb) -> Self {
        Self {
            verb,
            position: Point::default(),
            button: MouseButton::Left,
            text: String::new(),
            keys: Vec::new(),
            scroll_x: 0,
            scroll_y: 0,
            path: Vec::new(),
            duration_ms: DEFAULT_WAIT_MS,
            settle_ms: None,
        }
    }

    pub fn click(x: i64, y: i64, button: MouseButton) -> Self {
        Self {
            position: Point::new(x, y),
            button,
            ..Self::new(ActionVerb::Click)
        }
    }

    pub fn key_chord(keys: Vec<String>) -> Self {
        let settle_ms = is_app_switcher(&keys).then_some(APP_SWITCHER_SETTLE_MS);
        Self {
            keys,
            settle_ms,
            ..Self::new(ActionVerb::KeyChord)
        }
    }

    pub fn verb_name(&self) -> &str {
        match &self.verb {
            ActionVerb::Click => "click",
            ActionVerb::DoubleClick => "double_click",
            ActionVerb::Move => "move",
            ActionVerb::Drag => "drag",
            ActionVerb::Scroll => "scroll",
            ActionVerb::Type => "type",
            ActionVerb::KeyChord => "key_chord",
            ActionVerb::Wait => "wait",
            ActionVerb::Screenshot => "screenshot",
            ActionVerb::Other(name) => name,
        }
    }
}

/// `cmd+space` style chords open the platform switcher and need time to settle.
fn is_app_switcher(keys: &[String]) -> bool {
    let lowered: Vec<String> = keys.iter().map(|k| k.trim().to_ascii_lowercase()).collect();
    let has_modifier = lowered
        .iter()
        .any(|k| matches!(k.as_str(), "cmd" | "command" | "meta" | "super"));
    has_modifier && lowered.iter().any(|k| k == "space")
}

/// Direction and magnitude to raw deltas. Unknown directions scroll down.
pub fn scroll_delta(direction: &str, magnitude: i64) -> (i64, i64) {
    match direction.to_ascii_lowercase().as_str() {
        "up" => (0, -magnitude),
        "left" => (-magnitude, 0),
        "right" => (magnitude, 0),
        _ => (0, magnitude),
    }
}

/// Splits `"cmd+shift+t"` into its keys. An empty string is an empty chord.
pub fn split_chord(text: &str) -> Vec<String> {
    text.split('+')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn coord(v: f64) -> i64 {
    v.round() as i64
}

fn decode_args<T>(provider: &str, verb: &str, raw: &Value) -> T
where
    T: for<'de> Deserialize<'de> + Default,
{
    match serde_json::from_value(raw.clone()) {
        Ok(args) => args,
        Err(err) => {
            warn!(provider, verb, error = %err, "malformed directive arguments, using defaults");
            T::default()
        }
    }
}

// ========================= OpenAI vocabulary =========================

#[derive(Debug, Default, Deserialize)]
struct WirePoint {
    x: f64,
    y: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenAiArgs {
    x: Option<f64>,
    y: Option<f64>,
    button: Option<String>,
    text: Option<String>,
    keys: Vec<String>,
    #[serde(alias = "scrollX")]
    scroll_x: Option<f64>,
    #[serde(alias = "scrollY")]
    scroll_y: Option<f64>,
    path: Vec<WirePoint>,
    ms: Option<u64>,
}

pub mod openai {
    use super::*;

    /// Decodes a `computer_call.action` object.
    pub fn decode(raw: &Value) -> Action {
        let kind = raw.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let args: OpenAiArgs = decode_args("openai", kind, raw);
        let position = Point::new(
            args.x.map(coord).unwrap_or(0),
            args.y.map(coord).unwrap_or(0),
        );
        match kind {
            "click" => Action::click(
                position.x,
                position.y,
                args.button.as_deref().map(MouseButton::parse).unwrap_or_default(),
            ),
            "double_click" => Action {
                position,
                ..Action::new(ActionVerb::DoubleClick)
            },
            "move" => Action {
                position,
                ..Action::new(ActionVerb::Move)
            },
            "drag" => Action {
                path: args
                    .path
                    .iter()
                    .map(|p| Point::new(coord(p.x), coord(p.y)))
                    .collect(),
                ..Action::new(ActionVerb::Drag)
            },
            "scroll" => Action {
                position,
                scroll_x: args.scroll_x.map(coord).unwrap_or(0),
                scroll_y: args.scroll_y.map(coord).unwrap_or(0),
                ..Action::new(ActionVerb::Scroll)
            },
            "type" => Action {
                text: args.text.unwrap_or_default(),
                ..Action::new(ActionVerb::Type)
            },
            "keypress" => Action::key_chord(args.keys),
            "wait" => Action {
                duration_ms: args.ms.unwrap_or(DEFAULT_WAIT_MS),
                ..Action::new(ActionVerb::Wait)
            },
            "screenshot" => Action::new(ActionVerb::Screenshot),
            other => Action {
                position,
                text: args.text.unwrap_or_default(),
                keys: args.keys,
                ..Action::new(ActionVerb::Other(other.to_string()))
            },
        }
    }

    /// Re-encodes a normalized action the way a `computer_call` carries it.
    pub fn encode(action: &Action) -> Value {
        let Point { x, y } = action.position;
        match &action.verb {
            ActionVerb::Click => {
                let button = match action.button {
                    MouseButton::Middle => "wheel",
                    other => other.as_str(),
                };
                json!({ "type": "click", "x": x, "y": y, "button": button })
            }
            ActionVerb::DoubleClick => json!({ "type": "double_click", "x": x, "y": y }),
            ActionVerb::Move => json!({ "type": "move", "x": x, "y": y }),
            ActionVerb::Drag => json!({ "type": "drag", "path": action.path }),
            ActionVerb::Scroll => json!({
                "type": "scroll",
                "x": x,
                "y": y,
                "scroll_x": action.scroll_x,
                "scroll_y": action.scroll_y,
            }),
            ActionVerb::Type => json!({ "type": "type", "text": action.text }),
            ActionVerb::KeyChord => json!({ "type": "keypress", "keys": action.keys }),
            ActionVerb::Wait => json!({ "type": "wait" }),
            ActionVerb::Screenshot => json!({ "type": "screenshot" }),
            ActionVerb::Other(name) => json!({ "type": name }),
        }
    }
}

// ========================= Anthropic vocabulary =========================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnthropicArgs {
    coordinate: Option<[f64; 2]>,
    start_coordinate: Option<[f64; 2]>,
    text: Option<String>,
    scroll_direction: Option<String>,
    scroll_amount: Option<f64>,
    duration: Option<f64>,
}

pub mod anthropic {
    use super::*;

    fn point(c: Option<[f64; 2]>) -> Point {
        c.map(|[x, y]| Point::new(coord(x), coord(y))).unwrap_or_default()
    }

    /// Decodes the `input` of a `computer` tool_use block.
    pub fn decode(raw: &Value) -> Action {
        let kind = raw.get("action").and_then(Value::as_str).unwrap_or("unknown");
        let args: AnthropicArgs = decode_args("anthropic", kind, raw);
        let position = point(args.coordinate);
        match kind {
            "left_click" | "click" => Action::click(position.x, position.y, MouseButton::Left),
            "right_click" => Action::click(position.x, position.y, MouseButton::Right),
            "middle_click" => Action::click(position.x, position.y, MouseButton::Middle),
            "double_click" => Action {
                position,
                ..Action::new(ActionVerb::DoubleClick)
            },
            "mouse_move" => Action {
                position,
                ..Action::new(ActionVerb::Move)
            },
            "left_click_drag" => Action {
                path: vec![point(args.start_coordinate), position],
                ..Action::new(ActionVerb::Drag)
            },
            "scroll" => {
                let magnitude = args
                    .scroll_amount
                    .map(coord)
                    .unwrap_or(DEFAULT_SCROLL_MAGNITUDE);
                let (dx, dy) =
                    scroll_delta(args.scroll_direction.as_deref().unwrap_or("down"), magnitude);
                Action {
                    position,
                    scroll_x: dx,
                    scroll_y: dy,
                    ..Action::new(ActionVerb::Scroll)
                }
            }
            "type" => Action {
                text: args.text.unwrap_or_default(),
                ..Action::new(ActionVerb::Type)
            },
            "key" => Action::key_chord(split_chord(args.text.as_deref().unwrap_or_default())),
            "wait" => Action {
                duration_ms: args
                    .duration
                    .map(|secs| (secs * 1000.0).round().max(0.0) as u64)
                    .unwrap_or(DEFAULT_WAIT_MS),
                ..Action::new(ActionVerb::Wait)
            },
            "screenshot" => Action::new(ActionVerb::Screenshot),
            other => Action {
                position,
                text: args.text.unwrap_or_default(),
                ..Action::new(ActionVerb::Other(other.to_string()))
            },
        }
    }

    /// Re-encodes a normalized action as `computer` tool input.
    pub fn encode(action: &Action) -> Value {
        let Point { x, y } = action.position;
        match &action.verb {
            ActionVerb::Click => {
                let name = match action.button {
                    MouseButton::Right => "right_click",
                    MouseButton::Middle => "middle_click",
                    _ => "left_click",
                };
                json!({ "action": name, "coordinate": [x, y] })
            }
            ActionVerb::DoubleClick => json!({ "action": "double_click", "coordinate": [x, y] }),
            ActionVerb::Move => json!({ "action": "mouse_move", "coordinate": [x, y] }),
            ActionVerb::Drag => {
                let start = action.path.first().copied().unwrap_or_default();
                let end = action.path.last().copied().unwrap_or_default();
                json!({
                    "action": "left_click_drag",
                    "start_coordinate": [start.x, start.y],
                    "coordinate": [end.x, end.y],
                })
            }
            ActionVerb::Scroll => {
                let (direction, amount) = match (action.scroll_x, action.scroll_y) {
                    (_, dy) if dy < 0 => ("up", -dy),
                    (_, dy) if dy > 0 => ("down", dy),
                    (dx, _) if dx < 0 => ("left", -dx),
                    (dx, _) => ("right", dx),
                };
                json!({
                    "action": "scroll",
                    "coordinate": [x, y],
                    "scroll_direction": direction,
                    "scroll_amount": amount,
                })
            }
            ActionVerb::Type => json!({ "action": "type", "text": action.text }),
            ActionVerb::KeyChord => json!({ "action": "key", "text": action.keys.join("+") }),
            ActionVerb::Wait => {
                json!({ "action": "wait", "duration": action.duration_ms as f64 / 1000.0 })
            }
            ActionVerb::Screenshot => json!({ "action": "screenshot" }),
            ActionVerb::Other(name) => json!({ "action": name }),
        }
    }
}
