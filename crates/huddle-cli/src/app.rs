//! Wiring from [`AppConfig`] to a ready [`AgentRuntime`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use huddle_agents::{
    AgentRuntime, HttpTool, LlmProvider, OpenAiProvider, PlatformRoute, PromptPolicy,
    SummarizerPolicy, ToolCatalog, TurnPolicy,
};
use huddle_config::{
    AgentConfig, AppConfig, ConfigLoader, HttpToolConfig, PromptConfig, StoreBackend, StoreConfig,
};
use huddle_db::{ConversationStore, InMemoryConversationStore, SqliteConversationStore};
use tracing::{info, warn};

pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>> {
    let ttl = Duration::from_secs(config.ttl_hours.saturating_mul(3600));
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryConversationStore::new().with_ttl(ttl))),
        StoreBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| ConfigLoader::default_config_dir().join("huddle.db"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let store = SqliteConversationStore::open(&path)
                .with_context(|| format!("failed to open conversation store at {}", path.display()))?;
            info!("conversation store at {}", path.display());
            Ok(Arc::new(store.with_ttl(ttl)))
        }
    }
}

/// Build every configured provider, in the order they should be tried.
pub fn build_providers(config: &AppConfig) -> Result<Vec<Arc<dyn LlmProvider>>> {
    let mut names: Vec<String> = config.provider_order();
    let mut rest: Vec<&String> = config.llm.keys().filter(|k| !names.contains(k)).collect();
    rest.sort();
    names.extend(rest.into_iter().cloned());

    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    for name in names {
        let Some(provider_config) = config.llm.get(&name) else {
            continue;
        };
        match provider_config.provider.as_str() {
            "openai" => {}
            other => bail!("provider '{name}' has unsupported type '{other}'"),
        }
        let api_key = match (&provider_config.api_key, &provider_config.base_url) {
            (Some(key), _) => key.clone(),
            // Self-hosted compatible servers often run without auth.
            (None, Some(_)) => String::new(),
            (None, None) => {
                warn!("provider '{name}' has no API key; skipping");
                continue;
            }
        };

        let mut provider = OpenAiProvider::new(api_key, provider_config.base_url.clone())
            .with_id(name.as_str())
            .with_tool_support(provider_config.supports_tools);
        if let Some(model) = &provider_config.model {
            provider = provider.with_model(model.as_str());
        }
        providers.push(Arc::new(provider));
    }
    Ok(providers)
}

/// Build the HTTP tools whose credentials are available. A tool naming a token variable
/// that is unset is left out, like a platform the user never connected.
pub fn build_tools(
    configs: &[HttpToolConfig],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ToolCatalog> {
    let mut catalog = ToolCatalog::new();
    for tool_config in configs {
        let mut tool = HttpTool::new(
            tool_config.name.as_str(),
            tool_config.description.as_str(),
            tool_config.url.as_str(),
            tool_config.input_schema.clone(),
        )
        .with_timeout(Duration::from_secs(tool_config.timeout_secs))?;

        if let Some(var) = &tool_config.bearer_token_env {
            match lookup(var).filter(|token| !token.trim().is_empty()) {
                Some(token) => tool = tool.with_bearer_token(token),
                None => {
                    info!("{var} is not set; tool '{}' unavailable", tool_config.name);
                    continue;
                }
            }
        }
        catalog.register(Arc::new(tool))?;
    }
    Ok(catalog)
}

pub fn turn_policy(agent: &AgentConfig) -> TurnPolicy {
    TurnPolicy {
        max_rounds: agent.max_rounds,
        parallel_tools: agent.parallel_tools,
        tool_result_max_chars: agent.tool_result_max_chars,
        max_tokens: Some(agent.max_tokens),
        temperature: agent.temperature,
        model: String::new(),
        summarizer: SummarizerPolicy {
            enabled: agent.summarization,
            token_budget: agent.token_budget,
            keep_recent: agent.keep_recent_messages,
        },
    }
}

pub fn prompt_policy(prompt: &PromptConfig) -> PromptPolicy {
    PromptPolicy {
        assistant_name: prompt.assistant_name.clone(),
        broad_tools: prompt.broad_tools.clone(),
        platform_routes: prompt
            .platform_routes
            .iter()
            .map(|route| PlatformRoute {
                platform: route.platform.clone(),
                phrases: route.phrases.clone(),
                tool_prefixes: route.tool_prefixes.clone(),
            })
            .collect(),
        extra_instructions: prompt.extra_instructions.clone(),
    }
}

/// Register providers on a runtime and apply the default/fallback order from config.
pub fn register_providers(runtime: &AgentRuntime, config: &AppConfig) -> Result<()> {
    for provider in build_providers(config)? {
        runtime.register_provider(provider);
    }
    let order = config.provider_order();
    if let Some(primary) = order.first()
        && !runtime.set_default_provider_id(primary)
    {
        warn!("default provider '{primary}' is not available");
    }
    runtime.set_fallback_provider_ids(order.get(1..).unwrap_or_default());
    Ok(())
}

pub fn build_runtime(config: &AppConfig, store: Arc<dyn ConversationStore>) -> Result<AgentRuntime> {
    let mut runtime = AgentRuntime::new(store);
    register_providers(&runtime, config)?;
    runtime.set_tools(build_tools(&config.tools, |var| std::env::var(var).ok())?);
    runtime.set_policy(turn_policy(&config.agent));
    runtime.set_prompt_policy(prompt_policy(&config.prompt));
    Ok(runtime)
}
