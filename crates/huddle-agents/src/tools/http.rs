use async_trait::async_trait;
use huddle_common::{Error, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::tools::{Tool, ToolContext, ToolOutput};

const MAX_ERROR_BODY_CHARS: usize = 500;

/// A platform wrapper reached over HTTP.
///
/// Each call POSTs the model's arguments as JSON to `url`; a 2xx response body becomes
/// the tool result. The conversation id and platform user id travel as headers.
pub struct HttpTool {
    name: String,
    description: String,
    url: String,
    input_schema: serde_json::Value,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        url: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            url: url.into(),
            input_schema,
            bearer_token: None,
            client: Client::new(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Tool(format!("failed to build http client: {e}")))?;
        Ok(self)
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    async fn execute(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput> {
        let mut request = self
            .client
            .post(&self.url)
            .header("X-Huddle-Conversation", &context.conversation_id)
            .json(&input);
        if let Some(user_id) = &context.user.platform_user_id {
            request = request.header("X-Huddle-User", user_id);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                "timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            Error::Tool(format!("{} {kind}: {e}", self.name))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Tool(format!("failed to read {} response: {e}", self.name)))?;
        debug!(tool = %self.name, %status, bytes = body.len(), "http tool responded");

        if !status.is_success() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(Error::Tool(format!(
                "{} returned status={}: {snippet}",
                self.name,
                status.as_u16()
            )));
        }

        Ok(ToolOutput::success(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::UserContext;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> ToolContext {
        ToolContext {
            conversation_id: "conv-9".into(),
            user: UserContext {
                platform_user_id: Some("U042".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn posts_arguments_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jira/search"))
            .and(header("X-Huddle-Conversation", "conv-9"))
            .and(header("X-Huddle-User", "U042"))
            .and(header("Authorization", "Bearer jira-token"))
            .and(body_json(json!({"jql": "assignee = currentUser()"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("PROJ-1: Fix login"))
            .mount(&server)
            .await;

        let tool = HttpTool::new(
            "jira_search_issues",
            "Search Jira issues",
            format!("{}/jira/search", server.uri()),
            json!({"type": "object"}),
        )
        .with_bearer_token("jira-token");

        let output = tool
            .execute(&context(), json!({"jql": "assignee = currentUser()"}))
            .await
            .unwrap();
        assert_eq!(output, ToolOutput::success("PROJ-1: Fix login"));
    }

    #[tokio::test]
    async fn non_success_status_is_tool_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let tool = HttpTool::new("slack_list_messages", "List Slack", server.uri(), json!({}));
        let err = tool.execute(&context(), json!({})).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "slack_list_messages returned status=502: upstream down"
        );
    }
}
