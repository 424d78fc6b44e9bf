//! Named policy registry.
//!
//! Maps a policy name to its assembled [`Policy`]: the config, the retry executor built from it
//! and the circuit breaker owned by that name. Reads are lock-free through `ArcSwap`; writes copy
//! the map and swap it in, so a lookup never observes a half-updated registry.
//!
//! Registering a name that already exists replaces the old policy, breaker state included. The
//! last registration wins.

use crate::audit::AuditSink;
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::clock::Clock;
use crate::config::PolicyConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::sleeper::Sleeper;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("no resilience policy named '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One named policy: its config plus the retry executor and breaker built from it.
#[derive(Debug)]
pub struct Policy {
    name: String,
    config: PolicyConfig,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        config: PolicyConfig,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyPolicyName);
        }
        let retry = RetryPolicy::from_config(name.clone(), &config, sleeper, sink.clone())?;
        let breaker = CircuitBreaker::with_parts(name.clone(), config.breaker()?, clock, sink);
        Ok(Self { name, config, retry, breaker })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Name -> policy map shared by an orchestrator.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: ArcSwap<HashMap<String, Arc<Policy>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `policy` under its name, returning the policy it replaced.
    pub fn register(&self, policy: Policy) -> Option<Arc<Policy>> {
        let name = policy.name.clone();
        let policy = Arc::new(policy);
        let previous = self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.clone(), policy.clone());
            next
        });
        let replaced = previous.get(&name).cloned();
        if replaced.is_some() {
            tracing::warn!(policy = %name, "resilience policy replaced; last registration wins");
        } else {
            tracing::debug!(policy = %name, "resilience policy registered");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.load().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Policy>> {
        let previous = self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
        previous.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.load().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.load().is_empty()
    }

    /// Breaker state of every policy, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut entries: Vec<(String, CircuitSnapshot)> = self
            .policies
            .load()
            .iter()
            .map(|(name, policy)| (name.clone(), policy.breaker.snapshot()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn state(&self, name: &str) -> Result<CircuitState, RegistryError> {
        self.get(name)
            .map(|policy| policy.breaker.state())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Force the named breaker Closed.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let policy = self.get(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        policy.breaker.reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for policy in self.policies.load().values() {
            policy.breaker.reset();
        }
    }
}
