//! Provider adapters: one contract, two wire protocols.

pub mod anthropic;
pub mod openai;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conversation::ConversationItem;
use crate::error::ProviderError;
use crate::tools::DeclaredTools;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    #[default]
    Anthropic,
}

impl ProviderKind {
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "computer-use-preview-2025-03-11",
            ProviderKind::Anthropic => "claude-sonnet-4-20250514",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        })
    }
}

/// Everything one model call needs. The conversation already starts with the system item.
#[derive(Clone, Copy, Debug)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub conversation: &'a [ConversationItem],
    pub tools: &'a DeclaredTools,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Items the model emitted in one response, in emission order.
    ///
    /// Fails with [`ProviderError::Aborted`] without touching the network when
    /// `cancel` is already set, and as soon as it fires mid-request.
    async fn create_response(
        &self,
        request: ModelRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationItem>, ProviderError>;
}

/// Builds the adapter for `kind` from its environment-backed default config.
pub fn from_env(kind: ProviderKind) -> Result<Arc<dyn Provider>, ProviderError> {
    Ok(match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(Default::default())?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(Default::default())?),
    })
}

/// Sends `request` and decodes a JSON body, racing the whole exchange against `cancel`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<T, ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Aborted);
    }
    let exchange = async {
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(status = status.as_u16(), bytes = text.len(), "provider response");
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(serde_json::from_str(&text)?)
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Aborted),
        result = exchange => result,
    }
}

// ========================= Scripted provider =========================

/// One canned reply of a [`ScriptedProvider`].
#[derive(Debug)]
pub enum ScriptStep {
    Reply(Vec<ConversationItem>),
    Fail(ProviderError),
    /// Never answers; resolves only through cancellation.
    Hang,
}

/// A provider that replays queued replies and records what it was sent.
///
/// Once the script is exhausted every call returns an empty reply.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    seen: Mutex<Vec<Vec<ConversationItem>>>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a script made only of replies.
    pub fn replies(replies: impl IntoIterator<Item = Vec<ConversationItem>>) -> Self {
        Self::new(replies.into_iter().map(ScriptStep::Reply))
    }

    /// Conversations received so far, one per call that reached the provider.
    pub fn requests(&self) -> Vec<Vec<ConversationItem>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::default()
    }

    async fn create_response(
        &self,
        request: ModelRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationItem>, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Aborted);
        }
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.conversation.to_vec());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(ScriptStep::Reply(items)) => Ok(items),
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::Hang) => {
                cancel.cancelled().await;
                Err(ProviderError::Aborted)
            }
            None => Ok(Vec::new()),
        }
    }
}
