use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::conversation::SafetyCheck;
use crate::error::AgentError;

pub const DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "maliciousbook.com",
    "evilvideos.com",
    "darkwebforum.com",
    "shadytok.com",
    "suspiciouspins.com",
    "ilanbigio.com",
];

type Acknowledge = dyn Fn(&str) -> bool + Send + Sync;

/// Asks a human (through the supplied predicate) to acknowledge each pending check.
#[derive(Clone)]
pub struct SafetyGate {
    acknowledge: Arc<Acknowledge>,
}

impl SafetyGate {
    pub fn new(acknowledge: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            acknowledge: Arc::new(acknowledge),
        }
    }

    pub fn decline_all() -> Self {
        Self::new(|_| false)
    }

    pub fn acknowledge_all() -> Self {
        Self::new(|_| true)
    }

    pub fn ask(&self, message: &str) -> bool {
        (self.acknowledge)(message)
    }

    /// Returns the checks marked acknowledged, or fails on the first declined one.
    pub fn review(&self, checks: &[SafetyCheck]) -> Result<Vec<SafetyCheck>, AgentError> {
        let mut acknowledged = Vec::with_capacity(checks.len());
        for check in checks {
            if !self.ask(&check.message) {
                warn!(message = %check.message, "safety check declined");
                return Err(AgentError::UnacknowledgedSafetyCheck {
                    message: check.message.clone(),
                });
            }
            info!(message = %check.message, "safety check acknowledged");
            acknowledged.push(check.clone().acknowledged());
        }
        Ok(acknowledged)
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::decline_all()
    }
}

impl fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyGate").finish_non_exhaustive()
    }
}

/// Hosts the agent must never end up on. A host matches an entry exactly or as a subdomain.
#[derive(Clone, Debug)]
pub struct Blocklist {
    domains: Vec<String>,
}

impl Blocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Unparseable URLs and URLs without a host are not blocked.
    pub fn is_blocked(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn check(&self, url: &str) -> Result<(), AgentError> {
        if self.is_blocked(url) {
            warn!(url, "blocked destination");
            return Err(AgentError::BlockedDestination { url: url.to_string() });
        }
        Ok(())
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_DOMAINS)
    }
}
