use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use nanoid::nanoid;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::computer::Computer;
use crate::config::AgentConfig;
use crate::conversation::{
    is_terminal, link_output, ConversationItem, DirectiveCall, DirectiveResult,
};
use crate::dispatch::Dispatcher;
use crate::error::{AgentError, ProviderError};
use crate::providers::{self, ModelRequest, Provider};
use crate::safety::{Blocklist, SafetyGate};
use crate::snapshots::ScreenshotStore;
use crate::tools::{DeclaredTools, ScreenSpec, ToolRegistry};

/// Appended as the final agent message when a turn is stopped.
pub const STOPPED_MESSAGE: &str = "Agent execution was stopped.";

// ========================= Turn state =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Stopped,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnState {
    #[default]
    Idle,
    Running,
    AwaitingModel,
    ExecutingDirective,
    AwaitingSafetyAck,
    Terminated(Termination),
}

impl TurnState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TurnState::Running
                | TurnState::AwaitingModel
                | TurnState::ExecutingDirective
                | TurnState::AwaitingSafetyAck
        )
    }
}

/// How a turn ended when it did not fail. `items` holds everything appended during the turn.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Completed { items: Vec<ConversationItem> },
    Stopped { items: Vec<ConversationItem> },
}

impl TurnOutcome {
    pub fn items(&self) -> &[ConversationItem] {
        match self {
            TurnOutcome::Completed { items } | TurnOutcome::Stopped { items } => items,
        }
    }

    pub fn into_items(self) -> Vec<ConversationItem> {
        match self {
            TurnOutcome::Completed { items } | TurnOutcome::Stopped { items } => items,
        }
    }

    /// Text of the last item, the model's answer for a completed turn.
    pub fn final_text(&self) -> Option<&str> {
        self.items().last().and_then(ConversationItem::text)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, TurnOutcome::Stopped { .. })
    }
}

/// Cancels whichever turn is running on the agent it came from.
#[derive(Clone)]
pub struct StopHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Publishes the final state even when the turn future is dropped mid-flight.
struct TurnGuard<'a> {
    state: &'a watch::Sender<TurnState>,
    termination: Termination,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(TurnState::Terminated(self.termination));
    }
}

/// Conversation dump for debug logs, screenshots replaced by their size.
struct Transcript<'a>(&'a [ConversationItem]);

impl fmt::Display for Transcript<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            writeln!(f, "  [{i}] {item}")?;
        }
        Ok(())
    }
}

// ========================= Agent Core =========================

type ItemSink = Arc<dyn Fn(&ConversationItem) + Send + Sync>;

pub struct Agent {
    provider: Arc<dyn Provider>,
    computer: Arc<dyn Computer>,
    tools: ToolRegistry,
    gate: SafetyGate,
    blocklist: Blocklist,
    cfg: AgentConfig,
    on_item: Option<ItemSink>,
    screenshot_store: Option<Arc<dyn ScreenshotStore>>, // optional sink for screenshots
    cancel: Arc<Mutex<CancellationToken>>,
    state: Arc<watch::Sender<TurnState>>,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, computer: Arc<dyn Computer>, cfg: AgentConfig) -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        Self {
            provider,
            computer,
            tools: ToolRegistry::new(),
            gate: SafetyGate::default(),
            blocklist: Blocklist::new(&cfg.blocked_domains),
            cfg,
            on_item: None,
            screenshot_store: None,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            state: Arc::new(state),
        }
    }

    /// Provider and settings from the environment; see [`AgentConfig::default`].
    pub fn from_env(computer: Arc<dyn Computer>) -> Result<Self, ProviderError> {
        let cfg = AgentConfig::default();
        let provider = providers::from_env(cfg.provider)?;
        Ok(Self::new(provider, computer, cfg))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_safety_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    /// Called once per appended item, in append order.
    pub fn on_item(mut self, sink: impl Fn(&ConversationItem) + Send + Sync + 'static) -> Self {
        self.on_item = Some(Arc::new(sink));
        self
    }

    pub fn with_screenshot_store(mut self, store: Arc<dyn ScreenshotStore>) -> Self {
        self.screenshot_store = Some(store);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    /// Requests the running turn to stop. A no-op when idle.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Runs one turn over `history` until the model answers in text, the turn is
    /// stopped, or a fatal error occurs.
    pub async fn run_turn(
        &self,
        history: Vec<ConversationItem>,
    ) -> Result<TurnOutcome, AgentError> {
        let cancel = self.begin_turn()?;
        let mut guard = TurnGuard {
            state: &self.state,
            termination: Termination::Stopped,
        };

        let turn_id = nanoid!();
        let span = info_span!(
            "turn",
            turn_id = %turn_id,
            provider = %self.provider.kind(),
            model = %self.cfg.model
        );
        let result = self.drive(&turn_id, history, &cancel).instrument(span).await;

        guard.termination = match &result {
            Ok(TurnOutcome::Completed { .. }) => Termination::Success,
            Ok(TurnOutcome::Stopped { .. }) => Termination::Stopped,
            Err(_) => Termination::Error,
        };
        result
    }

    /// Installs a fresh token and publishes `Running` in one step, so any stop
    /// issued once the turn is observable lands on this turn's token.
    fn begin_turn(&self) -> Result<CancellationToken, AgentError> {
        let mut cancel = None;
        self.state.send_if_modified(|state| {
            if state.is_active() {
                return false;
            }
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = CancellationToken::new();
            cancel = Some(slot.clone());
            *state = TurnState::Running;
            true
        });
        cancel.ok_or(AgentError::TurnInProgress)
    }

    async fn drive(
        &self,
        turn_id: &str,
        history: Vec<ConversationItem>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let (display_width, display_height) = self.computer.dimensions().await?;
        let tools = DeclaredTools {
            screen: Some(ScreenSpec {
                display_width,
                display_height,
                environment: self.computer.environment().await?,
            }),
            functions: self.tools.specs(),
        };
        let gate = self.gate_reporting_state();
        let dispatcher = Dispatcher {
            computer: self.computer.as_ref(),
            tools: &self.tools,
            gate: &gate,
            blocklist: &self.blocklist,
            unknown_actions: self.cfg.unknown_actions,
        };

        let mut conversation = Vec::with_capacity(history.len() + 1);
        conversation.push(ConversationItem::system(self.cfg.system_prompt.clone()));
        conversation.extend(history);
        let turn_start = conversation.len();
        info!(history = turn_start - 1, "turn started");

        let mut iteration = 0usize;
        let mut captures = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(self.stopped(conversation, turn_start));
            }
            if let Some(max) = self.cfg.max_iterations {
                if iteration >= max {
                    warn!(max, "iteration limit reached");
                    return Err(AgentError::IterationLimit(max));
                }
            }
            iteration += 1;

            self.set_state(TurnState::AwaitingModel);
            debug!(iteration, "conversation:\n{}", Transcript(&conversation));
            let request = ModelRequest {
                model: &self.cfg.model,
                conversation: &conversation,
                tools: &tools,
            };
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Aborted),
                r = self.provider.create_response(request, cancel) => r,
            };
            let response = match response {
                Ok(items) => items,
                Err(ProviderError::Aborted) => {
                    info!(iteration, "model call aborted");
                    return Ok(self.stopped(conversation, turn_start));
                }
                Err(err) => return Err(err.into()),
            };
            if response.is_empty() {
                return Err(AgentError::NoModelOutput);
            }
            info!(iteration, items = response.len(), "model responded");

            let batch_start = conversation.len();
            for item in response {
                self.append(&mut conversation, item);
            }
            let calls: Vec<DirectiveCall> = conversation[batch_start..]
                .iter()
                .filter_map(|item| item.as_call().cloned())
                .collect();

            for call in calls {
                if cancel.is_cancelled() {
                    return Ok(self.stopped(conversation, turn_start));
                }
                self.set_state(TurnState::ExecutingDirective);
                let output = dispatcher.handle(&call).await?;
                if cancel.is_cancelled() {
                    info!(call_id = %call.call_id, "stopped during directive, output discarded");
                    return Ok(self.stopped(conversation, turn_start));
                }
                let Some(output) = output else {
                    continue;
                };
                link_output(&call, &output)?;
                if let DirectiveResult::Screen { screenshot, .. } = &output.result {
                    captures += 1;
                    if let Some(store) = &self.screenshot_store {
                        if let Err(err) = store.save(turn_id, captures, screenshot).await {
                            warn!(step = captures, error = %err, "failed to store screenshot");
                        }
                    }
                }
                self.append(&mut conversation, ConversationItem::output(output));
            }

            if conversation.last().is_some_and(is_terminal) {
                info!(iteration, "turn complete");
                return Ok(TurnOutcome::Completed {
                    items: conversation.split_off(turn_start),
                });
            }
            self.set_state(TurnState::Running);
        }
    }

    fn append(&self, conversation: &mut Vec<ConversationItem>, item: ConversationItem) {
        debug!(item = %item, "append");
        if let Some(sink) = &self.on_item {
            sink(&item);
        }
        conversation.push(item);
    }

    fn stopped(&self, mut conversation: Vec<ConversationItem>, turn_start: usize) -> TurnOutcome {
        info!("turn stopped");
        self.append(&mut conversation, ConversationItem::agent(STOPPED_MESSAGE));
        TurnOutcome::Stopped {
            items: conversation.split_off(turn_start),
        }
    }

    fn set_state(&self, state: TurnState) {
        self.state.send_replace(state);
    }

    /// The caller's gate, bracketed by `AwaitingSafetyAck` while it is consulted.
    fn gate_reporting_state(&self) -> SafetyGate {
        let inner = self.gate.clone();
        let state = self.state.clone();
        SafetyGate::new(move |message| {
            state.send_replace(TurnState::AwaitingSafetyAck);
            let acknowledged = inner.ask(message);
            state.send_replace(TurnState::ExecutingDirective);
            acknowledged
        })
    }
}
