//! Orchestrator configuration
//!
//! Defines all tunable parameters: probe and poll intervals, retry policy,
//! timeouts, and the provider and template definitions loaded from a JSON
//! file. Values come from environment variables with fallback to defaults.

use anyhow::Context;
use conduit_core::domain::provider::PipelineType;
use conduit_core::domain::template::Template;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Highest accepted priority value (least urgent)
pub const MAX_PRIORITY: i32 = 100;

/// Orchestrator configuration
///
/// All timeouts and intervals are configurable so tests can run the loops at
/// millisecond scale.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this orchestrator process
    pub instance_id: String,

    /// Postgres URL; the in-memory store is used when unset
    pub database_url: Option<String>,

    /// How often every provider is probed
    pub health_interval: Duration,

    /// Upper bound for a single health probe
    pub health_timeout: Duration,

    /// Consecutive failed probes before a provider is marked unhealthy
    pub health_failure_threshold: u32,

    /// Retries of `submit()` after the first attempt
    pub dispatch_retries: u32,

    /// First backoff delay between dispatch attempts; doubles each retry
    pub retry_base_delay: Duration,

    /// Backoff cap
    pub retry_max_delay: Duration,

    /// Upper bound for submit, status and cancel calls
    pub provider_call_timeout: Duration,

    /// How often in-flight executions are polled for status
    pub poll_interval: Duration,

    /// No stage progress for this long triggers a re-check
    pub stall_threshold: Duration,

    /// Longest the dispatcher sleeps when nothing can be dispatched
    pub idle_interval: Duration,

    /// Priority given to requests that do not set one
    pub default_priority: i32,

    pub providers: Vec<ProviderConfig>,

    pub templates: Vec<Template>,
}

/// Registration entry for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: String,
    pub capabilities: Vec<PipelineType>,
    pub endpoint: String,
    pub token: Option<String>,
    pub max_concurrent: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Layout of the JSON configuration file
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
    #[serde(default)]
    templates: Vec<Template>,
}

impl Config {
    /// Creates a configuration with defaults and no providers
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            database_url: None,
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            health_failure_threshold: 3,
            dispatch_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            provider_call_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(600),
            idle_interval: Duration::from_secs(5),
            default_priority: MAX_PRIORITY / 2,
            providers: Vec::new(),
            templates: Vec::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognised environment variables (all optional):
    /// - CONDUIT_INSTANCE_ID (default: random)
    /// - CONDUIT_CONFIG (path to the JSON provider/template file)
    /// - DATABASE_URL
    /// - HEALTH_INTERVAL, HEALTH_TIMEOUT (seconds, default: 30, 5)
    /// - HEALTH_FAILURE_THRESHOLD (default: 3)
    /// - DISPATCH_RETRIES (default: 3)
    /// - RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS (default: 500, 30000)
    /// - PROVIDER_CALL_TIMEOUT (seconds, default: 10)
    /// - POLL_INTERVAL (seconds, default: 10)
    /// - STALL_THRESHOLD (seconds, default: 600)
    /// - IDLE_INTERVAL (seconds, default: 5)
    /// - DEFAULT_PRIORITY (default: 50)
    pub fn from_env() -> anyhow::Result<Self> {
        let instance_id = std::env::var("CONDUIT_INSTANCE_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let defaults = Self::new(instance_id);

        let mut config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            health_interval: env_secs("HEALTH_INTERVAL").unwrap_or(defaults.health_interval),
            health_timeout: env_secs("HEALTH_TIMEOUT").unwrap_or(defaults.health_timeout),
            health_failure_threshold: env_parse("HEALTH_FAILURE_THRESHOLD")
                .unwrap_or(defaults.health_failure_threshold),
            dispatch_retries: env_parse("DISPATCH_RETRIES").unwrap_or(defaults.dispatch_retries),
            retry_base_delay: env_parse("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parse("RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            provider_call_timeout: env_secs("PROVIDER_CALL_TIMEOUT")
                .unwrap_or(defaults.provider_call_timeout),
            poll_interval: env_secs("POLL_INTERVAL").unwrap_or(defaults.poll_interval),
            stall_threshold: env_secs("STALL_THRESHOLD").unwrap_or(defaults.stall_threshold),
            idle_interval: env_secs("IDLE_INTERVAL").unwrap_or(defaults.idle_interval),
            default_priority: env_parse("DEFAULT_PRIORITY").unwrap_or(defaults.default_priority),
            ..defaults
        };

        if let Ok(path) = std::env::var("CONDUIT_CONFIG") {
            config = config.with_file(&path)?;
        }

        Ok(config)
    }

    /// Loads providers and templates from a JSON file
    pub fn with_file(self, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        self.with_file_contents(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parses providers and templates from JSON text
    pub fn with_file_contents(mut self, contents: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_json::from_str(contents)?;
        self.providers.extend(file.providers);
        self.templates.extend(file.templates);
        Ok(self)
    }

    /// Adds a provider entry
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_id.trim().is_empty() {
            anyhow::bail!("instance_id cannot be empty");
        }

        for (name, value) in [
            ("health_interval", self.health_interval),
            ("health_timeout", self.health_timeout),
            ("retry_base_delay", self.retry_base_delay),
            ("provider_call_timeout", self.provider_call_timeout),
            ("poll_interval", self.poll_interval),
            ("stall_threshold", self.stall_threshold),
            ("idle_interval", self.idle_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.retry_max_delay < self.retry_base_delay {
            anyhow::bail!("retry_max_delay must not be smaller than retry_base_delay");
        }

        if self.health_failure_threshold == 0 {
            anyhow::bail!("health_failure_threshold must be greater than 0");
        }

        if !(0..=MAX_PRIORITY).contains(&self.default_priority) {
            anyhow::bail!("default_priority must be between 0 and {}", MAX_PRIORITY);
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                anyhow::bail!("provider name cannot be empty");
            }

            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider name: {}", provider.name);
            }

            if !provider.endpoint.starts_with("http://") && !provider.endpoint.starts_with("https://")
            {
                anyhow::bail!(
                    "provider {} endpoint must start with http:// or https://",
                    provider.name
                );
            }

            if provider.capabilities.is_empty() {
                anyhow::bail!("provider {} declares no capabilities", provider.name);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}
