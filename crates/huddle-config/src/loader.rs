use huddle_common::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::model::AppConfig;

const ENV_PREFIX: &str = "HUDDLE_";

/// Resolves an [`AppConfig`] from a config file, `.env`, and `HUDDLE_*` variables.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: Self::default_config_dir().join("config.yml"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.huddle`, or `./.huddle` when no home directory is known.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".huddle")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", path.display());
        }

        let mut config = if self.path.exists() {
            info!("loading config from {}", self.path.display());
            Self::parse_file(&self.path)?
        } else {
            info!(
                "no config file at {}, using defaults",
                self.path.display()
            );
            AppConfig::default()
        };

        let lookup = |key: &str| std::env::var(key).ok();
        config.apply_env_overrides(lookup)?;
        config.resolve_api_keys(lookup);
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("yml")
            .to_ascii_lowercase();

        match extension.as_str() {
            "toml" => toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display()))),
            "yml" | "yaml" => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config format '.{other}' (expected .yml, .yaml or .toml)"
            ))),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfig {
    /// Apply `HUDDLE_*` overrides on top of file values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(provider) = var("DEFAULT_PROVIDER") {
            self.default_provider = Some(provider);
        }
        if let Some(value) = var("MAX_ROUNDS") {
            self.agent.max_rounds = parse_override("MAX_ROUNDS", &value)?;
        }
        if let Some(value) = var("TOKEN_BUDGET") {
            self.agent.token_budget = parse_override("TOKEN_BUDGET", &value)?;
        }
        if let Some(value) = var("PARALLEL_TOOLS") {
            self.agent.parallel_tools = parse_override("PARALLEL_TOOLS", &value)?;
        }
        if let Some(value) = var("SUMMARIZATION") {
            self.agent.summarization = parse_override("SUMMARIZATION", &value)?;
        }
        if let Some(path) = var("DB_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Fill missing provider keys from `api_key_env` (or `OPENAI_API_KEY` for openai).
    pub fn resolve_api_keys(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (name, provider) in &mut self.llm {
            if provider.api_key.is_some() {
                continue;
            }
            let env_name = provider.api_key_env.clone().or_else(|| {
                (provider.provider == "openai").then(|| "OPENAI_API_KEY".to_string())
            });
            if let Some(env_name) = env_name {
                provider.api_key = lookup(&env_name).filter(|k| !k.is_empty());
                if provider.api_key.is_none() {
                    warn!("provider '{name}': environment variable {env_name} is not set");
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_rounds == 0 {
            return Err(Error::Config("agent.max_rounds must be at least 1".into()));
        }
        if self.agent.keep_recent_messages == 0 {
            return Err(Error::Config(
                "agent.keep_recent_messages must be at least 1".into(),
            ));
        }
        if self.agent.summarization && self.agent.token_budget == 0 {
            return Err(Error::Config(
                "agent.token_budget must be positive when summarization is enabled".into(),
            ));
        }
        if self.agent.tool_result_max_chars == 0 {
            return Err(Error::Config(
                "agent.tool_result_max_chars must be at least 1".into(),
            ));
        }

        for name in self.default_provider.iter().chain(&self.fallback_providers) {
            if !self.llm.contains_key(name) {
                return Err(Error::Config(format!(
                    "provider '{name}' is referenced but not configured under llm"
                )));
            }
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::Config(format!("duplicate tool name '{}'", tool.name)));
            }
        }

        Ok(())
    }

    /// Provider ids in the order they should be tried.
    pub fn provider_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        let primary = self.default_provider.clone().or_else(|| {
            let mut names: Vec<&String> = self.llm.keys().collect();
            names.sort();
            names.first().map(|name| (*name).clone())
        });
        if let Some(primary) = primary {
            order.push(primary);
        }
        for name in &self.fallback_providers {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!(
            "invalid value '{value}' for {ENV_PREFIX}{name}"
        ))
    })
}
