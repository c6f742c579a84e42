use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use futures::future::join_all;
use huddle_common::{Error, Message, Result, TokenUsage, UserContext};
use huddle_db::ConversationStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::executor::{DEFAULT_TOOL_RESULT_MAX_CHARS, ToolExecutor};
use crate::normalize::{extract_usage, flatten_content};
use crate::progress::{Progress, ProgressEvent};
use crate::prompt::{PromptPolicy, build_system_prompt};
use crate::providers::{LlmProvider, LlmRequest, LlmResponse};
use crate::summarizer::{SummarizerPolicy, maybe_summarize};
use crate::tools::{Tool, ToolCatalog, ToolContext};

/// Maximum number of model rounds per turn unless configured otherwise.
pub const MAX_ROUNDS: usize = 10;

/// Knobs for one turn of the engine.
#[derive(Debug, Clone)]
pub struct TurnPolicy {
    pub max_rounds: usize,
    /// Run the calls of one assistant message concurrently.
    pub parallel_tools: bool,
    pub tool_result_max_chars: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Empty means the provider's default model.
    pub model: String,
    pub summarizer: SummarizerPolicy,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_rounds: MAX_ROUNDS,
            parallel_tools: true,
            tool_result_max_chars: DEFAULT_TOOL_RESULT_MAX_CHARS,
            max_tokens: Some(4096),
            temperature: None,
            model: String::new(),
            summarizer: SummarizerPolicy::default(),
        }
    }
}

/// One user message to process.
#[derive(Debug)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub input: String,
    pub user_context: Option<UserContext>,
    /// Overrides the runtime's registered tools for this turn.
    pub tools: Option<ToolCatalog>,
    pub progress: Progress,
    pub cancel: CancellationToken,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            input: input.into(),
            user_context: None,
            tools: None,
            progress: Progress::none(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user_context(mut self, user: UserContext) -> Self {
        self.user_context = Some(user);
        self
    }

    pub fn with_tools(mut self, tools: ToolCatalog) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without requesting tools.
    Completed,
    /// The round cap was hit while the model still wanted tools.
    RoundLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub rounds: usize,
    /// Sum over rounds that reported usage; `None` when no round did.
    pub usage: Option<TokenUsage>,
    pub stop_reason: StopReason,
    pub summarized: bool,
}

/// Drives conversations: provider routing, the tool loop and history persistence.
pub struct AgentRuntime {
    providers: RwLock<Vec<Arc<dyn LlmProvider>>>,
    default_provider: RwLock<Option<String>>,
    fallback_provider_ids: RwLock<Vec<String>>,
    store: Arc<dyn ConversationStore>,
    tools: ToolCatalog,
    policy: TurnPolicy,
    prompt_policy: PromptPolicy,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl AgentRuntime {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            default_provider: RwLock::new(None),
            fallback_provider_ids: RwLock::new(Vec::new()),
            store,
            tools: ToolCatalog::new(),
            policy: TurnPolicy::default(),
            prompt_policy: PromptPolicy::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn policy(&self) -> &TurnPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: TurnPolicy) {
        self.policy = policy;
    }

    pub fn set_prompt_policy(&mut self, policy: PromptPolicy) {
        self.prompt_policy = policy;
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        self.tools.register(tool)
    }

    /// Replace the default tool catalog.
    pub fn set_tools(&mut self, tools: ToolCatalog) {
        self.tools = tools;
    }

    pub fn tools(&self) -> &ToolCatalog {
        &self.tools
    }

    pub fn register_provider(&self, provider: Arc<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        info!("registered LLM provider: {}", id);
        {
            let mut default = write(&self.default_provider);
            if default.is_none() {
                *default = Some(id);
            }
        }
        write(&self.providers).push(provider);
    }

    pub fn get_provider(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        read(&self.providers)
            .iter()
            .find(|p| p.provider_id() == id)
            .cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.default_provider_id()
            .and_then(|id| self.get_provider(&id))
    }

    /// Return the IDs of all registered providers.
    pub fn provider_ids(&self) -> Vec<String> {
        read(&self.providers)
            .iter()
            .map(|p| p.provider_id().to_string())
            .collect()
    }

    /// Set the default provider by ID. Returns `true` if the provider exists.
    pub fn set_default_provider_id(&self, id: &str) -> bool {
        let exists = read(&self.providers).iter().any(|p| p.provider_id() == id);
        if exists {
            *write(&self.default_provider) = Some(id.to_string());
        }
        exists
    }

    pub fn default_provider_id(&self) -> Option<String> {
        read(&self.default_provider).clone()
    }

    /// Set the fallback provider chain (used when the primary provider fails).
    pub fn set_fallback_provider_ids(&self, ids: &[String]) {
        let mut deduped = Vec::new();
        for id in ids {
            let trimmed = id.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !deduped.iter().any(|existing: &String| existing == trimmed) {
                deduped.push(trimmed.to_string());
            }
        }
        *write(&self.fallback_provider_ids) = deduped;
    }

    pub fn fallback_provider_ids(&self) -> Vec<String> {
        read(&self.fallback_provider_ids).clone()
    }

    fn default_provider_chain(&self) -> Result<Vec<Arc<dyn LlmProvider>>> {
        let default_id = self
            .default_provider_id()
            .ok_or_else(|| Error::Gateway("no LLM provider configured".into()))?;

        let primary = self
            .get_provider(&default_id)
            .ok_or_else(|| Error::Gateway(format!("default provider '{default_id}' not found")))?;

        let mut providers = vec![primary];
        for fallback_id in self.fallback_provider_ids() {
            if providers.iter().any(|p| p.provider_id() == fallback_id) {
                continue;
            }
            if let Some(provider) = self.get_provider(&fallback_id) {
                providers.push(provider);
            } else {
                warn!(
                    "configured fallback provider '{}' is not registered; skipping",
                    fallback_id
                );
            }
        }

        Ok(providers)
    }

    /// The provider chain bound to a tool catalog. Fallbacks that cannot call tools are
    /// dropped; a primary that cannot is an error.
    fn tool_capable_chain(&self) -> Result<Vec<Arc<dyn LlmProvider>>> {
        let mut chain = self.default_provider_chain()?;
        if !chain[0].supports_tools() {
            return Err(Error::Gateway(format!(
                "provider '{}' does not support tool calling",
                chain[0].provider_id()
            )));
        }
        chain.retain(|provider| {
            let ok = provider.supports_tools();
            if !ok {
                warn!(
                    "fallback provider '{}' does not support tool calling; skipping",
                    provider.provider_id()
                );
            }
            ok
        });
        Ok(chain)
    }

    async fn complete_with_fallback(
        &self,
        providers: &[Arc<dyn LlmProvider>],
        request: &LlmRequest,
        start_index: usize,
    ) -> Result<(LlmResponse, usize)> {
        if providers.is_empty() {
            return Err(Error::Gateway("no LLM provider configured".into()));
        }

        let mut index = start_index.min(providers.len() - 1);
        loop {
            let provider = &providers[index];
            let provider_id = provider.provider_id().to_string();
            match provider.complete(request).await {
                Ok(response) => {
                    if index > start_index {
                        info!(
                            "using fallback provider '{}' after retryable primary failure",
                            provider_id
                        );
                    }
                    return Ok((response, index));
                }
                Err(err) => {
                    if !is_retryable_provider_error(&err) || index + 1 >= providers.len() {
                        return Err(gateway_error(err));
                    }

                    let next_provider = providers[index + 1].provider_id();
                    warn!(
                        "provider '{}' failed with retryable error ({}); trying fallback '{}'",
                        provider_id, err, next_provider
                    );
                    index += 1;
                }
            }
        }
    }

    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let providers: Vec<Arc<dyn LlmProvider>> = read(&self.providers).clone();
        let checks = providers.iter().map(|provider| async {
            let provider_id = provider.provider_id().to_string();
            let ok = provider.health_check().await.unwrap_or(false);
            (provider_id, ok)
        });

        join_all(checks).await
    }

    /// Process one user message to completion.
    ///
    /// Every message is written to the store as soon as it exists, so the stored log stays
    /// valid even when the turn fails or is cancelled midway. Tool failures are folded into
    /// the conversation; gateway, store, missing-tool and cancellation errors are returned.
    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id))]
    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let TurnRequest {
            conversation_id,
            input,
            user_context,
            tools,
            progress,
            cancel,
        } = request;
        let policy = &self.policy;
        let catalog = tools.unwrap_or_else(|| self.tools.clone());

        if catalog.is_empty() {
            return Err(Error::NoTools);
        }
        if policy.max_rounds == 0 {
            return Err(Error::Agent("max_rounds must be at least 1".into()));
        }
        if policy.summarizer.enabled && policy.summarizer.keep_recent == 0 {
            return Err(Error::Agent("summarizer keep_recent must be at least 1".into()));
        }
        let providers = self.tool_capable_chain()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let descriptors = catalog.descriptors();
        let store = self.store.as_ref();

        if store.get(&conversation_id).await?.is_empty() {
            let system = build_system_prompt(
                &descriptors,
                user_context.as_ref(),
                Utc::now(),
                &self.prompt_policy,
                policy.max_rounds,
            );
            store.append(&conversation_id, &system).await?;
        }
        store
            .append(&conversation_id, &Message::user(input))
            .await?;
        progress.emit(ProgressEvent::Status {
            message: "Working on your request".to_string(),
        });

        let context = ToolContext {
            conversation_id: conversation_id.clone(),
            user: user_context.unwrap_or_default(),
            cancel: cancel.clone(),
        };
        let executor = ToolExecutor::new(
            &catalog,
            &context,
            &progress,
            policy.tool_result_max_chars,
        );

        let mut total_usage: Option<TokenUsage> = None;
        let mut summarized = false;

        for round in 1..=policy.max_rounds {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            progress.emit(ProgressEvent::AiProcessing { round });

            let llm_request = LlmRequest {
                model: policy.model.clone(),
                messages: store.get(&conversation_id).await?,
                max_tokens: policy.max_tokens,
                temperature: policy.temperature,
                tools: descriptors.clone(),
            };
            let (response, provider_index) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.complete_with_fallback(&providers, &llm_request, 0) => result?,
            };

            let text = flatten_content(&response.content);
            let usage = extract_usage(response.usage.as_ref());
            let calls = response.tool_calls;
            store
                .append(
                    &conversation_id,
                    &Message::assistant(text.clone(), calls.clone(), usage),
                )
                .await?;

            if let Some(usage) = usage {
                let cumulative = total_usage.get_or_insert_with(TokenUsage::default);
                cumulative.accumulate(&usage);
                progress.emit(ProgressEvent::TokenUsage {
                    round,
                    usage,
                    cumulative: *cumulative,
                });
            }

            if policy.summarizer.enabled {
                match maybe_summarize(
                    store,
                    &conversation_id,
                    usage.as_ref(),
                    &policy.summarizer,
                    providers[provider_index].as_ref(),
                    &policy.model,
                    &cancel,
                )
                .await
                {
                    Ok(replaced) => summarized |= replaced,
                    Err(Error::Cancelled) => {}
                    Err(e) => return Err(e),
                }
            }

            if cancel.is_cancelled() {
                if !calls.is_empty() {
                    // Pending calls still get results so the stored log stays valid.
                    let batch = executor.execute(&calls, policy.parallel_tools).await;
                    for result in &batch.results {
                        store.append(&conversation_id, result).await?;
                    }
                }
                info!(round, "turn cancelled after model response");
                return Err(Error::Cancelled);
            }

            if calls.is_empty() {
                info!(round, "turn completed");
                return Ok(TurnOutcome {
                    text,
                    rounds: round,
                    usage: total_usage,
                    stop_reason: StopReason::Completed,
                    summarized,
                });
            }

            if round == policy.max_rounds {
                warn!(
                    "round limit of {} reached with {} pending tool calls",
                    policy.max_rounds,
                    calls.len()
                );
                let skipped = format!(
                    "Skipped: the limit of {} tool rounds was reached",
                    policy.max_rounds
                );
                for call in &calls {
                    store
                        .append(
                            &conversation_id,
                            &Message::tool_result(&call.id, &call.name, skipped.as_str(), true),
                        )
                        .await?;
                }
                progress.emit(ProgressEvent::Status {
                    message: format!("Stopped after {} rounds", policy.max_rounds),
                });
                return Ok(TurnOutcome {
                    text,
                    rounds: round,
                    usage: total_usage,
                    stop_reason: StopReason::RoundLimit,
                    summarized,
                });
            }

            let batch = executor.execute(&calls, policy.parallel_tools).await;
            for result in &batch.results {
                store.append(&conversation_id, result).await?;
            }
            if batch.cancelled {
                info!("turn cancelled during tool execution");
                return Err(Error::Cancelled);
            }
        }

        Err(Error::Agent(format!(
            "tool loop exceeded maximum of {} rounds",
            policy.max_rounds
        )))
    }
}

/// Errors from a model invocation are gateway failures unless already classified.
fn gateway_error(err: Error) -> Error {
    match err {
        Error::Gateway(_) | Error::Cancelled => err,
        other => Error::Gateway(other.to_string()),
    }
}

fn is_retryable_provider_error(error: &Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();

    if let Some(status) = extract_status_code(&message) {
        return matches!(status, 429 | 500 | 502 | 503);
    }

    let retryable_fragments = [
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "connection aborted",
        "temporarily unavailable",
        "dns error",
        "network error",
    ];

    retryable_fragments
        .iter()
        .any(|fragment| message.contains(fragment))
}

fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let after_marker = search_start + offset + marker.len();
            let digits: String = message[after_marker..]
                .trim_start()
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() >= 3
                && let Ok(status) = digits[..3].parse::<u16>()
            {
                return Some(status);
            }

            search_start = after_marker;
        }
    }
    None
}
