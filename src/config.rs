use std::env;

use tracing::warn;

use crate::dispatch::UnknownActionPolicy;
use crate::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::providers::ProviderKind;
use crate::safety::DEFAULT_BLOCKED_DOMAINS;

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_base: String,         // e.g. "https://api.openai.com/v1"
    pub api_key: String,          // env OPENAI_API_KEY
    pub reasoning_effort: String, // "low" | "medium" | "high"
    pub truncation: String,       // "auto" keeps long screenshot histories under the context limit
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            reasoning_effort: "medium".into(),
            truncation: "auto".into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_base: String, // e.g. "https://api.anthropic.com"
    pub api_key: String,  // env ANTHROPIC_API_KEY, then CLAUDE_API_KEY
    pub max_tokens: u32,
    pub beta: String,
    pub version: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".into()),
            api_key: env::var("ANTHROPIC_API_KEY")
                .or_else(|_| env::var("CLAUDE_API_KEY"))
                .unwrap_or_default(),
            max_tokens: 4096,
            beta: "computer-use-2025-01-24".into(),
            version: "2023-06-01".into(),
        }
    }
}

/// Loop-level settings. The provider is fixed for the lifetime of an [`crate::Agent`].
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub system_prompt: String,
    pub unknown_actions: UnknownActionPolicy,
    pub blocked_domains: Vec<String>,
    /// `None` loops until the model answers in text or the turn is stopped.
    pub max_iterations: Option<usize>,
}

impl AgentConfig {
    /// Defaults for `provider`, ignoring the environment.
    pub fn for_provider(provider: ProviderKind) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            unknown_actions: UnknownActionPolicy::default(),
            blocked_domains: DEFAULT_BLOCKED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            max_iterations: None,
        }
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let provider = match var("SCREENPILOT_PROVIDER") {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(error = %err, "ignoring SCREENPILOT_PROVIDER");
                ProviderKind::default()
            }),
            None => ProviderKind::default(),
        };
        let mut cfg = Self::for_provider(provider);
        if let Some(model) = var("SCREENPILOT_MODEL").filter(|m| !m.trim().is_empty()) {
            cfg.model = model;
        }
        if let Some(raw) = var("SCREENPILOT_UNKNOWN_ACTIONS") {
            match raw.parse() {
                Ok(policy) => cfg.unknown_actions = policy,
                Err(err) => warn!(error = %err, "ignoring SCREENPILOT_UNKNOWN_ACTIONS"),
            }
        }
        if let Some(raw) = var("SCREENPILOT_MAX_ITERATIONS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => cfg.max_iterations = Some(n),
                _ => warn!(value = %raw, "ignoring SCREENPILOT_MAX_ITERATIONS"),
            }
        }
        cfg
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_target_anthropic() {
        let cfg = AgentConfig::from_vars(vars(&[]));
        assert_eq!(cfg.provider, ProviderKind::Anthropic);
        assert_eq!(cfg.model, "claude-sonnet-4-20250514");
        assert_eq!(cfg.unknown_actions, UnknownActionPolicy::Skip);
        assert_eq!(cfg.max_iterations, None);
        assert!(cfg.blocked_domains.iter().any(|d| d == "evilvideos.com"));
    }

    #[test]
    fn provider_switch_changes_default_model() {
        let cfg = AgentConfig::from_vars(vars(&[("SCREENPILOT_PROVIDER", "openai")]));
        assert_eq!(cfg.provider, ProviderKind::OpenAi);
        assert_eq!(cfg.model, "computer-use-preview-2025-03-11");
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let cfg = AgentConfig::from_vars(vars(&[
            ("SCREENPILOT_PROVIDER", "palm"),
            ("SCREENPILOT_MODEL", "claude-custom"),
            ("SCREENPILOT_UNKNOWN_ACTIONS", "FAIL"),
            ("SCREENPILOT_MAX_ITERATIONS", "zero"),
        ]));
        assert_eq!(cfg.provider, ProviderKind::Anthropic);
        assert_eq!(cfg.model, "claude-custom");
        assert_eq!(cfg.unknown_actions, UnknownActionPolicy::Fail);
        assert_eq!(cfg.max_iterations, None);
    }
}
