use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration, read from `~/.huddle/config.yml` by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub store: StoreConfig,
    /// Named model providers, keyed by the id used in `default_provider`.
    pub llm: HashMap<String, LlmProviderConfig>,
    pub default_provider: Option<String>,
    pub fallback_providers: Vec<String>,
    pub prompt: PromptConfig,
    pub tools: Vec<HttpToolConfig>,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap on model invocations per turn.
    pub max_rounds: usize,
    pub parallel_tools: bool,
    pub summarization: bool,
    /// Token count above which history gets condensed.
    pub token_budget: u32,
    pub keep_recent_messages: usize,
    pub tool_result_max_chars: usize,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            parallel_tools: true,
            summarization: true,
            token_budget: 20_000,
            keep_recent_messages: 6,
            tool_result_max_chars: 50_000,
            max_tokens: 4096,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; `~/.huddle/huddle.db` when unset.
    pub path: Option<PathBuf>,
    pub ttl_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: None,
            ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the key, consulted when `api_key` is unset.
    pub api_key_env: Option<String>,
    /// Set to `false` for endpoints that cannot do function calling.
    #[serde(default = "default_true")]
    pub supports_tools: bool,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider_kind(),
            model: None,
            base_url: None,
            api_key: None,
            api_key_env: None,
            supports_tools: true,
        }
    }
}

fn default_provider_kind() -> String {
    "openai".to_string()
}

fn default_true() -> bool {
    true
}

/// Knobs for the system prompt policy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub assistant_name: String,
    /// Tools to try first for open-ended requests, when present in the catalog.
    pub broad_tools: Vec<String>,
    pub platform_routes: Vec<PlatformRoute>,
    pub extra_instructions: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            assistant_name: "huddle".to_string(),
            broad_tools: [
                "gmail_list_messages",
                "gcal_list_events",
                "jira_search_issues",
                "slack_list_messages",
                "github_list_notifications",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            platform_routes: vec![
                PlatformRoute::new("email", &["my email", "my inbox"], &["gmail_", "outlook_mail_"]),
                PlatformRoute::new(
                    "calendar",
                    &["my calendar", "my meetings"],
                    &["gcal_", "outlook_calendar_"],
                ),
                PlatformRoute::new("jira", &["jira", "my tickets"], &["jira_"]),
                PlatformRoute::new("confluence", &["confluence", "the wiki"], &["confluence_"]),
                PlatformRoute::new("slack", &["slack"], &["slack_"]),
                PlatformRoute::new("github", &["github", "my pull requests"], &["github_"]),
            ],
            extra_instructions: None,
        }
    }
}

/// Phrases that pin a request to one platform's tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRoute {
    pub platform: String,
    pub phrases: Vec<String>,
    pub tool_prefixes: Vec<String>,
}

impl PlatformRoute {
    pub fn new(platform: &str, phrases: &[&str], tool_prefixes: &[&str]) -> Self {
        Self {
            platform: platform.to_string(),
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
            tool_prefixes: tool_prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// A platform wrapper reachable over HTTP, exposed to the model as a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: serde_json::Value,
    pub bearer_token_env: Option<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

fn default_tool_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
