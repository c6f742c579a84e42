use async_trait::async_trait;
use huddle_agents::{
    AgentRuntime, LlmProvider, LlmRequest, LlmResponse, MessagePart, Progress, ProgressEvent,
    StopReason, SummarizerPolicy, Tool, ToolCatalog, ToolContext, ToolOutput, TurnPolicy,
    TurnRequest, Usage,
};
use huddle_common::{Error, Message, Result, ToolCall, validate_history};
use huddle_db::{ConversationStore, InMemoryConversationStore};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Replays scripted responses for tool-bound requests and answers summarization
/// requests (sent without tools) with a fixed summary.
struct ScriptedProvider {
    script: Mutex<VecDeque<std::result::Result<LlmResponse, String>>>,
    requests: Mutex<Vec<LlmRequest>>,
    summaries: Mutex<usize>,
    summary_delay: Mutex<Duration>,
}

impl ScriptedProvider {
    fn new(script: Vec<std::result::Result<LlmResponse, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            summaries: Mutex::new(0),
            summary_delay: Mutex::new(Duration::ZERO),
        })
    }

    fn delay_summaries(&self, delay: Duration) {
        *self.summary_delay.lock().unwrap() = delay;
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn summaries(&self) -> usize {
        *self.summaries.lock().unwrap()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        if request.tools.is_empty() {
            *self.summaries.lock().unwrap() += 1;
            let delay = *self.summary_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            return Ok(LlmResponse::text("scripted", "The user asked about their day."));
        }

        self.requests.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(Error::Gateway(message)),
            None => Ok(LlmResponse::text("scripted", "done")),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Sleeps for `ms` milliseconds when the input asks for it, then runs `run`.
struct FnTool {
    name: &'static str,
    run: fn(serde_json::Value) -> Result<String>,
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput> {
        if let Some(ms) = input.get("ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        (self.run)(input).map(ToolOutput::success)
    }
}

fn tool_a() -> Arc<dyn Tool> {
    Arc::new(FnTool {
        name: "A",
        run: |_| Ok("ok:A".to_string()),
    })
}

fn tool_b() -> Arc<dyn Tool> {
    Arc::new(FnTool {
        name: "B",
        run: |_| Err(Error::Tool("boom".to_string())),
    })
}

fn tag_tool() -> Arc<dyn Tool> {
    Arc::new(FnTool {
        name: "tag",
        run: |input| Ok(input["tag"].as_str().unwrap_or_default().to_string()),
    })
}

fn calls(calls: &[(&str, &str, serde_json::Value)]) -> LlmResponse {
    LlmResponse {
        content: MessagePart::Text(String::new()),
        tool_calls: calls
            .iter()
            .map(|(id, name, arguments)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
        model: "scripted".to_string(),
        usage: None,
        stop_reason: Some("tool_calls".to_string()),
    }
}

fn with_usage(mut response: LlmResponse, input: u32, output: u32) -> LlmResponse {
    response.usage = Some(Usage {
        input_tokens: Some(input),
        output_tokens: Some(output),
        total_tokens: None,
    });
    response
}

fn runtime(
    provider: Arc<ScriptedProvider>,
    tools: Vec<Arc<dyn Tool>>,
    policy: TurnPolicy,
) -> (AgentRuntime, Arc<InMemoryConversationStore>) {
    let store = Arc::new(InMemoryConversationStore::new());
    let mut runtime = AgentRuntime::new(store.clone());
    runtime.register_provider(provider);
    for tool in tools {
        runtime.register_tool(tool).unwrap();
    }
    runtime.set_policy(policy);
    (runtime, store)
}

fn no_summaries() -> TurnPolicy {
    TurnPolicy {
        summarizer: SummarizerPolicy {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn collect(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn failing_tool_is_contained_and_sibling_succeeds() {
    let provider = ScriptedProvider::new(vec![
        Ok(calls(&[("c1", "A", json!({})), ("c2", "B", json!({}))])),
        Ok(LlmResponse::text("scripted", "A worked, B did not")),
    ]);
    let (runtime, store) = runtime(provider.clone(), vec![tool_a(), tool_b()], no_summaries());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = runtime
        .process_turn(TurnRequest::new("conv", "check both").with_progress(Progress::new(Arc::new(tx))))
        .await
        .unwrap();

    assert_eq!(outcome.text, "A worked, B did not");
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.stop_reason, StopReason::Completed);

    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    assert_eq!(history.len(), 6);
    assert_eq!(history[3], Message::tool_result("c1", "A", "ok:A", false));
    assert_eq!(
        history[4],
        Message::tool_result("c2", "B", "Error executing B: boom", true)
    );

    let requests = provider.requests();
    let second = &requests[1];
    assert_eq!(second.messages.len(), 5);
    assert_eq!(second.messages[4].content(), "Error executing B: boom");

    let events = collect(&mut rx);
    assert!(events.iter().any(
        |e| matches!(e, ProgressEvent::ToolComplete { name, .. } if name == "A")
    ));
    assert!(events.iter().any(
        |e| matches!(e, ProgressEvent::ToolError { name, error, .. } if name == "B" && error == "boom")
    ));
    assert!(matches!(events[0], ProgressEvent::Status { .. }));
    assert!(matches!(events[1], ProgressEvent::AiProcessing { round: 1 }));
}

#[tokio::test]
async fn empty_catalog_fails_before_any_write() {
    let provider = ScriptedProvider::new(vec![]);
    let (runtime, store) = runtime(provider.clone(), vec![], TurnPolicy::default());

    let err = runtime
        .process_turn(TurnRequest::new("conv", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoTools));
    assert!(store.get("conv").await.unwrap().is_empty());
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn request_catalog_overrides_registered_tools() {
    let provider = ScriptedProvider::new(vec![Ok(LlmResponse::text("scripted", "hi"))]);
    let (runtime, _store) = runtime(provider.clone(), vec![tool_a()], no_summaries());

    let err = runtime
        .process_turn(TurnRequest::new("conv", "hello").with_tools(ToolCatalog::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoTools));

    let catalog = ToolCatalog::from_tools([tool_b()]).unwrap();
    runtime
        .process_turn(TurnRequest::new("conv", "hello").with_tools(catalog))
        .await
        .unwrap();
    let names: Vec<String> = provider.requests()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["B"]);
}

#[tokio::test]
async fn answer_without_tool_calls_takes_one_invocation() {
    let provider = ScriptedProvider::new(vec![Ok(with_usage(
        LlmResponse::text("scripted", "Nothing urgent today."),
        120,
        8,
    ))]);
    let (runtime, store) = runtime(provider.clone(), vec![tool_a()], no_summaries());

    let outcome = runtime
        .process_turn(TurnRequest::new("conv", "what's important today?"))
        .await
        .unwrap();

    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.text, "Nothing urgent today.");
    assert_eq!(outcome.usage.map(|u| u.total), Some(128));
    assert_eq!(provider.requests().len(), 1);

    let history = store.get("conv").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].is_system());
    assert!(history[0].content().contains("- A: test tool"));
    assert!(!history.iter().any(Message::is_tool_result));
}

#[tokio::test]
async fn results_follow_call_order_not_completion_order() {
    let provider = ScriptedProvider::new(vec![Ok(calls(&[
        ("c1", "tag", json!({"ms": 60, "tag": "first"})),
        ("c2", "tag", json!({"ms": 1, "tag": "second"})),
        ("c3", "missing", json!({})),
        ("c4", "tag", json!({"ms": 25, "tag": "fourth"})),
    ]))]);
    let (runtime, store) = runtime(provider, vec![tag_tool()], no_summaries());

    runtime
        .process_turn(TurnRequest::new("conv", "go"))
        .await
        .unwrap();

    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    let results: Vec<(&str, &str)> = history
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => Some((tool_call_id.as_str(), content.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![
            ("c1", "first"),
            ("c2", "second"),
            ("c3", "Tool missing not found"),
            ("c4", "fourth"),
        ]
    );
}

#[tokio::test]
async fn parallel_batch_runs_concurrently() {
    let provider = ScriptedProvider::new(vec![Ok(calls(&[
        ("c1", "tag", json!({"ms": 150, "tag": "a"})),
        ("c2", "tag", json!({"ms": 150, "tag": "b"})),
        ("c3", "tag", json!({"ms": 150, "tag": "c"})),
    ]))]);
    let (runtime, _store) = runtime(provider, vec![tag_tool()], no_summaries());

    let start = std::time::Instant::now();
    runtime
        .process_turn(TurnRequest::new("conv", "go"))
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn oversized_result_is_truncated_on_a_char_boundary() {
    let provider = ScriptedProvider::new(vec![Ok(calls(&[("c1", "big", json!({}))]))]);
    let big: Arc<dyn Tool> = Arc::new(FnTool {
        name: "big",
        run: |_| Ok("ü".repeat(80)),
    });
    let policy = TurnPolicy {
        tool_result_max_chars: 50,
        ..no_summaries()
    };
    let (runtime, store) = runtime(provider, vec![big], policy);

    runtime
        .process_turn(TurnRequest::new("conv", "go"))
        .await
        .unwrap();

    let history = store.get("conv").await.unwrap();
    let stored = history[3].content();
    assert!(stored.starts_with(&"ü".repeat(50)));
    assert!(!stored[..stored.find('\n').unwrap()].contains(&"ü".repeat(51)));
    assert!(stored.ends_with("[truncated: showing 50 of 80 characters]"));
}

#[tokio::test]
async fn round_limit_stops_the_loop_and_keeps_pairs() {
    let provider = ScriptedProvider::new(vec![
        Ok(calls(&[("c1", "A", json!({}))])),
        Ok(calls(&[("c2", "A", json!({}))])),
        Ok(calls(&[("c3", "A", json!({}))])),
    ]);
    let policy = TurnPolicy {
        max_rounds: 2,
        ..no_summaries()
    };
    let (runtime, store) = runtime(provider.clone(), vec![tool_a()], policy);

    let outcome = runtime
        .process_turn(TurnRequest::new("conv", "loop forever"))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::RoundLimit);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(provider.requests().len(), 2);

    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    match history.last().unwrap() {
        Message::ToolResult {
            tool_call_id,
            is_error,
            content,
            ..
        } => {
            assert_eq!(tool_call_id, "c2");
            assert!(*is_error);
            assert!(content.contains("limit of 2 tool rounds"));
        }
        other => panic!("expected skipped tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_aborts_pending_tools() {
    let provider = ScriptedProvider::new(vec![Ok(calls(&[
        ("c1", "tag", json!({"ms": 5000, "tag": "slow"})),
        ("c2", "A", json!({})),
    ]))]);
    let (runtime, store) = runtime(provider.clone(), vec![tag_tool(), tool_a()], no_summaries());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let start = std::time::Instant::now();
    let err = runtime
        .process_turn(TurnRequest::new("conv", "go").with_cancellation(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(provider.requests().len(), 1);

    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    assert_eq!(history[3].content(), "Tool execution cancelled");
    assert_eq!(history[4].content(), "ok:A");
}

#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let provider = ScriptedProvider::new(vec![]);
    let (runtime, store) = runtime(provider, vec![tool_a()], no_summaries());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runtime
        .process_turn(TurnRequest::new("conv", "go").with_cancellation(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(store.get("conv").await.unwrap().is_empty());
}

#[tokio::test]
async fn gateway_failure_leaves_no_assistant_message() {
    let provider = ScriptedProvider::new(vec![Err(
        "openai API error: status=401, body=bad key".to_string()
    )]);
    let (runtime, store) = runtime(provider, vec![tool_a()], no_summaries());

    let err = runtime
        .process_turn(TurnRequest::new("conv", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Gateway(_)));
    let history = store.get("conv").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history.iter().any(|m| matches!(m, Message::Assistant { .. })));
}

#[tokio::test]
async fn same_id_accumulates_and_ids_are_isolated() {
    let provider = ScriptedProvider::new(vec![
        Ok(LlmResponse::text("scripted", "one")),
        Ok(LlmResponse::text("scripted", "two")),
        Ok(LlmResponse::text("scripted", "three")),
    ]);
    let (runtime, store) = runtime(provider, vec![tool_a()], no_summaries());

    runtime
        .process_turn(TurnRequest::new("conv-1", "first"))
        .await
        .unwrap();
    let after_first = store.get("conv-1").await.unwrap();
    runtime
        .process_turn(TurnRequest::new("conv-1", "second"))
        .await
        .unwrap();
    runtime
        .process_turn(TurnRequest::new("conv-2", "other"))
        .await
        .unwrap();

    let history = store.get("conv-1").await.unwrap();
    assert_eq!(&history[..after_first.len()], after_first.as_slice());
    assert_eq!(history.len(), 5);
    assert_eq!(history.iter().filter(|m| m.is_system()).count(), 1);
    assert_eq!(history[3], Message::user("second"));

    let other = store.get("conv-2").await.unwrap();
    assert_eq!(other.len(), 3);
    assert_eq!(other[1], Message::user("other"));
}

#[tokio::test]
async fn summarization_keeps_history_valid() {
    let provider = ScriptedProvider::new(vec![
        Ok(with_usage(calls(&[("c1", "A", json!({}))]), 900, 20)),
        Ok(with_usage(LlmResponse::text("scripted", "all done"), 950, 10)),
    ]);
    let policy = TurnPolicy {
        summarizer: SummarizerPolicy {
            enabled: true,
            token_budget: 100,
            keep_recent: 1,
        },
        ..Default::default()
    };
    let (runtime, store) = runtime(provider.clone(), vec![tool_a()], policy);

    let outcome = runtime
        .process_turn(TurnRequest::new("conv", "summarize me"))
        .await
        .unwrap();

    assert!(outcome.summarized);
    assert_eq!(outcome.text, "all done");
    assert_eq!(provider.summaries(), 2);

    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    assert!(
        history[0]
            .content()
            .ends_with("Conversation summary:\nThe user asked about their day.")
    );
    assert_eq!(history.last().unwrap().content(), "all done");

    // The second model call saw the tool result next to its call.
    let requests = provider.requests();
    let second = &requests[1];
    validate_history(&second.messages).unwrap();
    assert!(second.messages.iter().any(Message::is_tool_result));
}

#[tokio::test]
async fn cancellation_interrupts_summarization() {
    let provider = ScriptedProvider::new(vec![Ok(with_usage(
        calls(&[("c1", "A", json!({}))]),
        900,
        20,
    ))]);
    provider.delay_summaries(Duration::from_secs(5));
    let policy = TurnPolicy {
        summarizer: SummarizerPolicy {
            enabled: true,
            token_budget: 100,
            keep_recent: 1,
        },
        ..Default::default()
    };
    let (runtime, store) = runtime(provider.clone(), vec![tool_a()], policy);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let start = std::time::Instant::now();
    let err = runtime
        .process_turn(TurnRequest::new("conv", "summarize me").with_cancellation(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(provider.summaries(), 1);
    assert_eq!(provider.requests().len(), 1);

    // No summary was written and the pending call was closed.
    let history = store.get("conv").await.unwrap();
    validate_history(&history).unwrap();
    assert!(!history[0].content().contains("Conversation summary:"));
    assert_eq!(history.len(), 4);
    assert_eq!(history[3].content(), "Tool execution cancelled");
}

#[tokio::test]
async fn zero_summary_tail_is_rejected_before_any_write() {
    let provider = ScriptedProvider::new(vec![]);
    let policy = TurnPolicy {
        summarizer: SummarizerPolicy {
            enabled: true,
            token_budget: 1,
            keep_recent: 0,
        },
        ..Default::default()
    };
    let (runtime, store) = runtime(provider.clone(), vec![tool_a()], policy);

    let err = runtime
        .process_turn(TurnRequest::new("conv", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Agent(_)));
    assert!(store.get("conv").await.unwrap().is_empty());
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn token_usage_events_accumulate() {
    let provider = ScriptedProvider::new(vec![
        Ok(with_usage(calls(&[("c1", "A", json!({}))]), 100, 10)),
        Ok(with_usage(LlmResponse::text("scripted", "ok"), 200, 20)),
    ]);
    let (runtime, _store) = runtime(provider, vec![tool_a()], no_summaries());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = runtime
        .process_turn(TurnRequest::new("conv", "go").with_progress(Progress::new(Arc::new(tx))))
        .await
        .unwrap();

    let cumulative: Vec<u32> = collect(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::TokenUsage { cumulative, .. } => Some(cumulative.total),
            _ => None,
        })
        .collect();
    assert_eq!(cumulative, vec![110, 330]);
    assert_eq!(outcome.usage.map(|u| u.input), Some(300));
}
