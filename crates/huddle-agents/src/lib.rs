pub mod executor;
pub mod normalize;
pub mod openai;
pub mod progress;
pub mod prompt;
pub mod providers;
pub mod runtime;
pub mod summarizer;
pub mod tools;

pub use openai::OpenAiProvider;
pub use progress::{Progress, ProgressEvent, ProgressSink};
pub use prompt::{PlatformRoute, PromptPolicy, build_system_prompt};
pub use providers::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, MessagePart, ToolDescriptor, Usage};
pub use runtime::{AgentRuntime, StopReason, TurnOutcome, TurnPolicy, TurnRequest};
pub use summarizer::SummarizerPolicy;
pub use tools::{HttpTool, Tool, ToolCatalog, ToolContext, ToolOutput};
