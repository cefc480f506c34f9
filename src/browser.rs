use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::handler::Handler;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::actions::{MouseButton, Point};
use crate::computer::{Computer, BROWSER_ENVIRONMENT};
use crate::error::ComputerError;

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            width: 1280,
            height: 800,
        }
    }
}

// ========================= CDP driver =========================

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

fn drive_handler(mut handler: Handler) {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!(error = %err, "cdp handler event error");
            }
        }
    });
}

fn mouse(kind: DispatchMouseEventType, x: i64, y: i64) -> DispatchMouseEventParams {
    DispatchMouseEventParams::new(kind, x as f64, y as f64)
}

fn cdp_button(button: MouseButton) -> CdpButton {
    match button {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
        MouseButton::Back => CdpButton::Back,
        MouseButton::Forward => CdpButton::Forward,
    }
}

impl Browser {
    pub async fn launch(cfg: &BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Fresh profile per launch; Chromium refuses to share a locked profile dir.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("screenpilot-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.width, cfg.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, handler) = OxideBrowser::launch(bcfg).await?;
        drive_handler(handler);
        Self::open(browser, cfg).await
    }

    pub async fn connect(ws_url: &str, cfg: &BrowserConfig) -> Result<Self> {
        let (browser, handler) = OxideBrowser::connect(ws_url).await?;
        drive_handler(handler);
        Self::open(browser, cfg).await
    }

    async fn open(browser: OxideBrowser, cfg: &BrowserConfig) -> Result<Self> {
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let this = Self { page, _browser: browser };
        this.set_viewport(cfg.width, cfg.height).await?;
        Ok(this)
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page
            .move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await?;
        Ok(())
    }

    pub async fn click(&self, x: i64, y: i64, button: MouseButton, clicks: i64) -> Result<()> {
        self.move_mouse(x, y).await?;
        for kind in [
            DispatchMouseEventType::MousePressed,
            DispatchMouseEventType::MouseReleased,
        ] {
            let mut event = mouse(kind, x, y);
            event.button = Some(cdp_button(button));
            event.click_count = Some(clicks);
            self.page.execute(event).await?;
        }
        Ok(())
    }

    pub async fn wheel(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<()> {
        let mut event = mouse(DispatchMouseEventType::MouseWheel, x, y);
        event.delta_x = Some(dx as f64);
        event.delta_y = Some(dy as f64);
        self.page.execute(event).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams::new(text)).await?;
        Ok(())
    }

    /// Presses every key in order and releases them in reverse.
    pub async fn key_chord(&self, keys: &[String]) -> Result<()> {
        let defs: Vec<KeyDef> = keys.iter().map(|k| KeyDef::resolve(k)).collect();
        let modifiers = defs.iter().fold(0, |acc, d| acc | d.modifier);
        let plain_text = modifiers & !SHIFT == 0;
        for def in &defs {
            let kind = if plain_text && def.text.is_some() {
                DispatchKeyEventType::KeyDown
            } else {
                DispatchKeyEventType::RawKeyDown
            };
            let mut event = def.event(kind, modifiers);
            if plain_text {
                event.text = def.text.clone();
            }
            self.page.execute(event).await?;
        }
        for def in defs.iter().rev() {
            self.page
                .execute(def.event(DispatchKeyEventType::KeyUp, modifiers))
                .await?;
        }
        Ok(())
    }

    pub async fn drag_path(&self, points: &[Point]) -> Result<()> {
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            return Ok(());
        };
        self.move_mouse(first.x, first.y).await?;
        let mut down = mouse(DispatchMouseEventType::MousePressed, first.x, first.y);
        down.button = Some(CdpButton::Left);
        down.click_count = Some(1);
        self.page.execute(down).await?;
        for p in &points[1..] {
            let mut step = mouse(DispatchMouseEventType::MouseMoved, p.x, p.y);
            step.button = Some(CdpButton::Left);
            self.page.execute(step).await?;
        }
        let mut up = mouse(DispatchMouseEventType::MouseReleased, last.x, last.y);
        up.button = Some(CdpButton::Left);
        up.click_count = Some(1);
        self.page.execute(up).await?;
        Ok(())
    }

    /// PNG of the current viewport.
    pub async fn screenshot_png(&self, width: u32, height: u32) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    warn!("empty viewport, resetting metrics and retrying capture");
                    self.set_viewport(width, height).await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }
}

// ========================= Key mapping =========================

const ALT: i64 = 1;
const CTRL: i64 = 2;
const META: i64 = 4;
const SHIFT: i64 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
struct KeyDef {
    key: String,
    code: String,
    key_code: i64,
    modifier: i64,
    text: Option<String>,
}

impl KeyDef {
    fn named(key: &str, code: &str, key_code: i64) -> Self {
        Self {
            key: key.to_string(),
            code: code.to_string(),
            key_code,
            modifier: 0,
            text: None,
        }
    }

    fn modifier(key: &str, code: &str, key_code: i64, bit: i64) -> Self {
        Self {
            modifier: bit,
            ..Self::named(key, code, key_code)
        }
    }

    /// xdotool, DOM and macOS spellings all resolve to the same DOM key.
    fn resolve(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "enter" | "return" => Self {
                text: Some("\r".into()),
                ..Self::named("Enter", "Enter", 13)
            },
            "tab" => Self::named("Tab", "Tab", 9),
            "esc" | "escape" => Self::named("Escape", "Escape", 27),
            "backspace" => Self::named("Backspace", "Backspace", 8),
            "delete" | "del" => Self::named("Delete", "Delete", 46),
            "space" | " " => Self {
                text: Some(" ".into()),
                ..Self::named(" ", "Space", 32)
            },
            "up" | "arrowup" => Self::named("ArrowUp", "ArrowUp", 38),
            "down" | "arrowdown" => Self::named("ArrowDown", "ArrowDown", 40),
            "left" | "arrowleft" => Self::named("ArrowLeft", "ArrowLeft", 37),
            "right" | "arrowright" => Self::named("ArrowRight", "ArrowRight", 39),
            "home" => Self::named("Home", "Home", 36),
            "end" => Self::named("End", "End", 35),
            "pageup" | "page_up" => Self::named("PageUp", "PageUp", 33),
            "pagedown" | "page_down" => Self::named("PageDown", "PageDown", 34),
            "ctrl" | "control" => Self::modifier("Control", "ControlLeft", 17, CTRL),
            "shift" => Self::modifier("Shift", "ShiftLeft", 16, SHIFT),
            "alt" | "option" => Self::modifier("Alt", "AltLeft", 18, ALT),
            "cmd" | "command" | "meta" | "super" | "win" => {
                Self::modifier("Meta", "MetaLeft", 91, META)
            }
            _ => Self::character(name.trim()),
        }
    }

    fn character(name: &str) -> Self {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                let upper = c.to_ascii_uppercase();
                let code = if upper.is_ascii_alphabetic() {
                    format!("Key{upper}")
                } else if c.is_ascii_digit() {
                    format!("Digit{c}")
                } else {
                    String::new()
                };
                Self {
                    text: Some(c.to_string()),
                    ..Self::named(&c.to_string(), &code, upper as i64)
                }
            }
            // Function keys and anything else pass through by name.
            _ => Self::named(name, name, 0),
        }
    }

    fn event(&self, kind: DispatchKeyEventType, modifiers: i64) -> DispatchKeyEventParams {
        let mut event = DispatchKeyEventParams::new(kind);
        event.key = Some(self.key.clone());
        event.code = Some(self.code.clone());
        event.modifiers = Some(modifiers);
        if self.key_code != 0 {
            event.windows_virtual_key_code = Some(self.key_code);
        }
        event
    }
}

// ========================= Computer adapter =========================

/// A headless Chromium page as the agent's screen; the environment is `"browser"`.
pub struct ChromiumComputer {
    browser: Browser,
    size: (u32, u32),
}

fn input_err(e: anyhow::Error) -> ComputerError {
    ComputerError::Input(e.to_string())
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, ComputerError> {
        let browser = Browser::launch(&cfg)
            .await
            .map_err(|e| ComputerError::Other(e.to_string()))?;
        Ok(Self {
            browser,
            size: (cfg.width, cfg.height),
        })
    }

    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self, ComputerError> {
        let browser = Browser::connect(ws_url, &cfg)
            .await
            .map_err(|e| ComputerError::Other(e.to_string()))?;
        Ok(Self {
            browser,
            size: (cfg.width, cfg.height),
        })
    }

    pub async fn open_url(&self, url: &str) -> Result<(), ComputerError> {
        self.browser
            .goto(url)
            .await
            .map_err(|e| ComputerError::Other(e.to_string()))
    }
}

#[async_trait]
impl Computer for ChromiumComputer {
    async fn capture(&self) -> Result<Vec<u8>, ComputerError> {
        self.browser
            .screenshot_png(self.size.0, self.size.1)
            .await
            .map_err(|e| {
                warn!(error = %e, "screenshot failed");
                ComputerError::CaptureUnavailable
            })
    }

    async fn pointer_click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.browser.click(x, y, button, 1).await.map_err(input_err)
    }

    async fn pointer_double_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.browser
            .click(x, y, MouseButton::Left, 2)
            .await
            .map_err(input_err)
    }

    async fn pointer_move(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.browser.move_mouse(x, y).await.map_err(input_err)
    }

    async fn drag(&self, path: &[Point]) -> Result<(), ComputerError> {
        self.browser.drag_path(path).await.map_err(input_err)
    }

    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        self.browser.wheel(x, y, dx, dy).await.map_err(input_err)
    }

    async fn type_text(&self, text: &str) -> Result<(), ComputerError> {
        if text.is_empty() {
            return Ok(());
        }
        self.browser.type_text(text).await.map_err(input_err)
    }

    async fn key_chord(&self, keys: &[String]) -> Result<(), ComputerError> {
        self.browser.key_chord(keys).await.map_err(input_err)
    }

    async fn dimensions(&self) -> Result<(u32, u32), ComputerError> {
        Ok(self.size)
    }

    async fn environment(&self) -> Result<String, ComputerError> {
        Ok(BROWSER_ENVIRONMENT.to_string())
    }

    async fn current_url(&self) -> Result<String, ComputerError> {
        self.browser
            .url()
            .await
            .map_err(|e| ComputerError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_aliases_resolve_to_dom_keys() {
        assert_eq!(KeyDef::resolve("Return").key, "Enter");
        assert_eq!(KeyDef::resolve("ENTER").key, "Enter");
        assert_eq!(KeyDef::resolve("esc").key, "Escape");
        assert_eq!(KeyDef::resolve("cmd").modifier, META);
        assert_eq!(KeyDef::resolve("command").key, "Meta");
        assert_eq!(KeyDef::resolve("option").modifier, ALT);
        assert_eq!(KeyDef::resolve("ctrl").modifier, CTRL);
    }

    #[test]
    fn single_characters_carry_text_and_codes() {
        let a = KeyDef::resolve("a");
        assert_eq!(a.key, "a");
        assert_eq!(a.code, "KeyA");
        assert_eq!(a.key_code, 65);
        assert_eq!(a.text.as_deref(), Some("a"));
        assert_eq!(KeyDef::resolve("7").code, "Digit7");
    }

    #[test]
    fn unknown_names_pass_through() {
        let f5 = KeyDef::resolve("F5");
        assert_eq!(f5.key, "F5");
        assert_eq!(f5.key_code, 0);
        assert!(f5.text.is_none());
    }

    #[test]
    fn buttons_map_one_to_one() {
        assert_eq!(cdp_button(MouseButton::Right), CdpButton::Right);
        assert_eq!(cdp_button(MouseButton::Middle), CdpButton::Middle);
        assert_eq!(cdp_button(MouseButton::Back), CdpButton::Back);
    }
}
