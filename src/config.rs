//! Configuration for the inference core
//!
//! Plain serde structs with sensible defaults; credentials come from the
//! environment. Everything here is handed to
//! [`crate::service::InferenceServiceBuilder`] at construction time; nothing
//! is read lazily at call time.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::{ModelDescriptor, Priority};
use crate::cache::CacheConfig;
use crate::monitor::SwitchRule;
use crate::provider::Provider;
use crate::resilience::{Backoff, RetryPolicy};
use crate::tool_loop::DEFAULT_MAX_ITERATIONS;

/// Retry settings in config form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::exponential(self.initial_delay, self.backoff_multiplier, self.max_delay),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }
}

/// API credentials and endpoint overrides, one slot per integrated vendor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderKeys {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
}

impl ProviderKeys {
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            groq_api_key: env::var("GROQ_API_KEY").ok(),
            deepseek_api_key: env::var("DEEPSEEK_API_KEY").ok(),
        }
    }
}

/// Top-level configuration for [`crate::service::InferenceService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Provider used when the caller does not pick one.
    pub default_provider: Provider,
    /// Balancer priority used when the caller does not pick one.
    pub default_priority: Priority,
    /// Deadline applied to each outbound call attempt.
    pub api_timeout: Duration,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    /// Tool-loop iteration cap.
    pub max_tool_iterations: usize,
    /// The balancer's model pool; the first entry is the overload fallback.
    pub pool: Vec<ModelDescriptor>,
    /// Rule table for the performance monitor.
    pub switch_rules: Vec<SwitchRule>,
    #[serde(default)]
    pub keys: ProviderKeys,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_provider: Provider::Gemini,
            default_priority: Priority::Balanced,
            api_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            max_tool_iterations: DEFAULT_MAX_ITERATIONS,
            pool: vec![
                ModelDescriptor::new("llama3.2:3b", 1.0, 10, 0.7),
                ModelDescriptor::new("llama3.2:1b", 1.5, 15, 0.5),
                ModelDescriptor::new("deepseek-r1:8b", 0.3, 5, 0.9),
            ],
            switch_rules: SwitchRule::default_rules(),
            keys: ProviderKeys::default(),
        }
    }
}

impl InferenceConfig {
    /// Defaults plus credentials from the environment.
    pub fn from_env() -> Self {
        Self {
            keys: ProviderKeys::from_env(),
            ..Self::default()
        }
    }
}
