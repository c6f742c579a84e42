use futures::FutureExt;
use futures::future::join_all;
use huddle_common::{Message, ToolCall};
use huddle_security::redact_secrets;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::progress::{Progress, ProgressEvent};
use crate::tools::{Tool, ToolCatalog, ToolContext};

pub const DEFAULT_TOOL_RESULT_MAX_CHARS: usize = 50_000;

const CANCELLED_RESULT: &str = "Tool execution cancelled";

/// Outcome of one batch of tool calls.
#[derive(Debug)]
pub struct BatchResult {
    /// One `ToolResult` per call, in call order.
    pub results: Vec<Message>,
    pub cancelled: bool,
}

/// Runs the tool calls of one assistant message.
///
/// A panicking tool becomes a failed result. This relies on unwinding, so the
/// workspace profiles keep the default `panic = "unwind"`.
pub struct ToolExecutor<'a> {
    catalog: &'a ToolCatalog,
    context: &'a ToolContext,
    progress: &'a Progress,
    max_result_chars: usize,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(
        catalog: &'a ToolCatalog,
        context: &'a ToolContext,
        progress: &'a Progress,
        max_result_chars: usize,
    ) -> Self {
        Self {
            catalog,
            context,
            progress,
            max_result_chars,
        }
    }

    /// Execute every call and wait for all of them. Individual failures become error
    /// results and never abort the batch.
    pub async fn execute(&self, calls: &[ToolCall], parallel: bool) -> BatchResult {
        let results = if parallel {
            join_all(calls.iter().map(|call| self.run_call(call))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.run_call(call).await);
            }
            results
        };

        BatchResult {
            results,
            cancelled: self.cancel().is_cancelled(),
        }
    }

    fn cancel(&self) -> &CancellationToken {
        &self.context.cancel
    }

    async fn run_call(&self, call: &ToolCall) -> Message {
        if self.cancel().is_cancelled() {
            return Message::tool_result(&call.id, &call.name, CANCELLED_RESULT, true);
        }

        self.progress.emit(ProgressEvent::ToolStart {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let Some(tool) = self.catalog.get(&call.name) else {
            let content = format!("Tool {} not found", call.name);
            warn!("model requested unknown tool '{}'", call.name);
            self.progress.emit(ProgressEvent::ToolError {
                call_id: call.id.clone(),
                name: call.name.clone(),
                error: content.clone(),
            });
            return Message::tool_result(&call.id, &call.name, content, true);
        };

        if let Err(reason) = validate_arguments(&tool.input_schema(), &call.arguments) {
            return self.failure(call, &reason);
        }

        let started = Instant::now();
        let invocation = AssertUnwindSafe(self.invoke(tool.as_ref(), call)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel().cancelled() => None,
            outcome = invocation => Some(outcome),
        };

        match outcome {
            None => {
                self.progress.emit(ProgressEvent::ToolError {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    error: "cancelled".to_string(),
                });
                Message::tool_result(&call.id, &call.name, CANCELLED_RESULT, true)
            }
            Some(Ok(Ok(content))) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(tool = %call.name, duration_ms, "tool call completed");
                self.progress.emit(ProgressEvent::ToolComplete {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    duration_ms,
                });
                Message::tool_result(
                    &call.id,
                    &call.name,
                    truncate_result(&content, self.max_result_chars),
                    false,
                )
            }
            Some(Ok(Err(reason))) => self.failure(call, &reason),
            Some(Err(panic)) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                self.failure(call, &reason)
            }
        }
    }

    /// Invoke the tool, folding error outputs into `Err`.
    async fn invoke(&self, tool: &dyn Tool, call: &ToolCall) -> Result<String, String> {
        match tool.execute(self.context, call.arguments.clone()).await {
            Ok(output) if output.is_error => Err(output.content),
            Ok(output) => Ok(output.content),
            Err(e) => Err(e.to_string()),
        }
    }

    fn failure(&self, call: &ToolCall, reason: &str) -> Message {
        let reason = redact_secrets(reason);
        warn!(tool = %call.name, "tool call failed: {reason}");
        self.progress.emit(ProgressEvent::ToolError {
            call_id: call.id.clone(),
            name: call.name.clone(),
            error: reason.clone(),
        });
        let content = format!("Error executing {}: {reason}", call.name);
        Message::tool_result(
            &call.id,
            &call.name,
            truncate_result(&content, self.max_result_chars),
            true,
        )
    }
}

/// Check call arguments against the tool's JSON schema.
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("tool has an invalid input schema: {e}"))?;

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("invalid arguments: {}", errors.join("; ")))
    }
}

/// Cap `content` at `max_chars` characters, appending a visible marker when cut.
pub fn truncate_result(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => {
            let total = content.chars().count();
            format!(
                "{}\n\n[truncated: showing {max_chars} of {total} characters]",
                &content[..cut]
            )
        }
    }
}
