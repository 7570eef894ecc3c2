use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};
use crate::types::{LlmModel, LlmParams, Prompt};

/// Top-level Waypoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on node executions in one run (subgraph nodes included).
    #[serde(default = "default_max_agent_iterations")]
    pub max_agent_iterations: usize,
    /// Execute a batch of tool calls concurrently in prebuilt strategies.
    #[serde(default)]
    pub parallel_tools: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Identifier of the prompt each run starts from.
    #[serde(default = "default_prompt_id")]
    pub prompt_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_agent_iterations: default_max_agent_iterations(),
            parallel_tools: false,
            system_prompt: None,
            prompt_id: default_prompt_id(),
        }
    }
}

impl AgentConfig {
    /// The prompt every run starts from.
    pub fn initial_prompt(&self, params: LlmParams) -> Prompt {
        let prompt = Prompt::new(self.prompt_id.clone()).with_params(params);
        match &self.system_prompt {
            Some(system) => prompt.system(system.clone()),
            None => prompt,
        }
    }
}

fn default_max_agent_iterations() -> usize { 50 }
fn default_prompt_id() -> String { "agent".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_context_length")]
    pub context_length: u64,
}

fn default_provider() -> String { "openai".to_string() }
fn default_context_length() -> u64 { 128_000 }

impl ModelConfig {
    pub fn to_model(&self) -> LlmModel {
        LlmModel {
            provider: self.provider.clone(),
            id: self.model_id.clone(),
            context_length: self.context_length,
            supports_tools: true,
        }
    }

    pub fn to_params(&self) -> LlmParams {
        LlmParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tool_choice: None,
        }
    }
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

/// Lifecycle event pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Capacity of the broadcast tap for async subscribers.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize { 256 }

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WAYPOINT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WAYPOINT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "gpt-4.1"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.max_agent_iterations, 50);
        assert!(!config.agent.parallel_tools);
        assert!(config.agent.system_prompt.is_none());
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.events.broadcast_capacity, 256);
        assert!(config.fallback_models.is_empty());
    }

    #[test]
    fn test_initial_prompt_includes_system() {
        let agent = AgentConfig {
            system_prompt: Some("You are terse.".into()),
            ..Default::default()
        };
        let prompt = agent.initial_prompt(LlmParams::default());
        assert_eq!(prompt.id, "agent");
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].text(), "You are terse.");
    }

    #[test]
    fn test_model_config_conversion() {
        let cfg = ModelConfig {
            provider: "anthropic".into(),
            model_id: "claude".into(),
            max_tokens: Some(1024),
            temperature: Some(0.2),
            context_length: 200_000,
        };
        let model = cfg.to_model();
        assert_eq!(model.to_string(), "anthropic/claude");
        assert_eq!(model.context_length, 200_000);
        assert_eq!(cfg.to_params().max_tokens, Some(1024));
    }
}
