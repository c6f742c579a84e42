use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use huddle_common::{Message, UserContext};
use tracing::debug;

use crate::providers::ToolDescriptor;

const SUMMARY_MARKER: &str = "Conversation summary:\n";

/// Operating-policy inputs for the system prompt.
#[derive(Debug, Clone)]
pub struct PromptPolicy {
    pub assistant_name: String,
    pub broad_tools: Vec<String>,
    pub platform_routes: Vec<PlatformRoute>,
    pub extra_instructions: Option<String>,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            assistant_name: "huddle".to_string(),
            broad_tools: Vec::new(),
            platform_routes: Vec::new(),
            extra_instructions: None,
        }
    }
}

/// Phrasing that pins a request to the tools of one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRoute {
    pub platform: String,
    pub phrases: Vec<String>,
    pub tool_prefixes: Vec<String>,
}

/// Build the system message that opens every conversation.
pub fn build_system_prompt(
    tools: &[ToolDescriptor],
    user: Option<&UserContext>,
    now: DateTime<Utc>,
    policy: &PromptPolicy,
    max_rounds: usize,
) -> Message {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are {}, a workplace assistant. You answer questions by calling tools that read \
         the user's mail, calendar, issue tracker, wiki, chat and source hosting accounts.",
        policy.assistant_name
    ));

    let mut about = vec![format!("Current time: {}", render_time(now, user))];
    if let Some(name) = user.and_then(|u| u.display_name.as_deref()) {
        about.push(format!("You are talking to {name}."));
    }
    if let Some(id) = user.and_then(|u| u.platform_user_id.as_deref()) {
        about.push(format!(
            "Internal user id (pass to tools when needed, never mention it): {id}"
        ));
    }
    sections.push(about.join("\n"));

    let tool_lines: Vec<String> = tools
        .iter()
        .map(|tool| format!("- {}: {}", tool.name, tool.description))
        .collect();
    sections.push(format!("Available tools:\n{}", tool_lines.join("\n")));

    sections.push(operating_policy(tools, policy, max_rounds));

    if let Some(extra) = policy.extra_instructions.as_deref() {
        sections.push(extra.trim().to_string());
    }

    Message::system(sections.join("\n\n"))
}

fn render_time(now: DateTime<Utc>, user: Option<&UserContext>) -> String {
    let tz = user
        .and_then(|u| u.timezone.as_deref())
        .and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                debug!("unknown timezone '{name}', falling back to UTC");
                None
            }
        })
        .unwrap_or(Tz::UTC);

    now.with_timezone(&tz)
        .format(&format!("%A, %Y-%m-%d %H:%M ({})", tz.name()))
        .to_string()
}

fn operating_policy(tools: &[ToolDescriptor], policy: &PromptPolicy, max_rounds: usize) -> String {
    let has_tool = |name: &str| tools.iter().any(|t| t.name == name);
    let mut rules = vec![
        "- For vague requests such as \"what's new\" or \"what's important today\", look at \
         the most recent items first instead of running keyword searches."
            .to_string(),
    ];

    let broad: Vec<&str> = policy
        .broad_tools
        .iter()
        .map(String::as_str)
        .filter(|name| has_tool(name))
        .collect();
    if !broad.is_empty() {
        rules.push(format!(
            "- Start open-ended requests with these tools: {}.",
            broad.join(", ")
        ));
    }

    let mut routes = Vec::new();
    for route in &policy.platform_routes {
        let matching: Vec<&str> = tools
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| route.tool_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .collect();
        if matching.is_empty() || route.phrases.is_empty() {
            continue;
        }
        let phrases: Vec<String> = route.phrases.iter().map(|p| format!("\"{p}\"")).collect();
        routes.push(format!(
            "  - {} ({}): only {}",
            phrases.join(", "),
            route.platform,
            matching.join(", ")
        ));
    }
    if !routes.is_empty() {
        rules.push(format!(
            "- When the user names a platform, use only that platform's tools:\n{}",
            routes.join("\n")
        ));
    }

    rules.push(
        "- Never ask clarifying questions. Make a reasonable assumption, act on it and say \
         what you assumed."
            .to_string(),
    );
    rules.push(format!(
        "- Use at most {max_rounds} rounds of tool calls, then answer with what you have."
    ));
    rules.push(
        "- Never reveal internal identifiers such as record ids, thread ids or platform user ids."
            .to_string(),
    );

    format!("Operating policy:\n{}", rules.join("\n"))
}

/// Attach (or replace) the conversation summary section of a system message.
pub fn with_summary(system: &Message, summary: &str) -> Message {
    let (base, _) = split_summary(system.content());
    let summary = summary.trim();
    if base.is_empty() {
        Message::system(format!("{SUMMARY_MARKER}{summary}"))
    } else {
        Message::system(format!("{base}\n\n{SUMMARY_MARKER}{summary}"))
    }
}

/// Split system text into the base prompt and the previous summary, if any.
pub fn split_summary(content: &str) -> (&str, Option<&str>) {
    if let Some(rest) = content.strip_prefix(SUMMARY_MARKER) {
        return ("", Some(rest));
    }
    match content.rfind(&format!("\n\n{SUMMARY_MARKER}")) {
        Some(idx) => (
            &content[..idx],
            Some(&content[idx + 2 + SUMMARY_MARKER.len()..]),
        ),
        None => (content, None),
    }
}
