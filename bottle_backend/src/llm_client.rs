use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// One prompt for the completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_instruction: String,
    pub user_content: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Stateless adapter over an external text-completion service.
///
/// Implementations never retry and never return partial output: either the
/// full generated text or `ChatError::Service`.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> ChatResult<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url: api_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_url)
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> ChatResult<String> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system_instruction,
                },
                Message {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        let mut req = self.client.post(self.completions_url()).json(&body);

        // Local models usually run without a key
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ChatError::service(format!("failed to send completion request: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::service(format!("failed to read completion body: {}", e)))?;

        if !status.is_success() {
            return Err(ChatError::service(format!(
                "completion API returned {}: {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        parse_completion_body(&text)
    }
}

/// Extract the first choice's content from an OpenAI-style response body.
fn parse_completion_body(body: &str) -> ChatResult<String> {
    let completion: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        ChatError::service(format!("malformed completion response: {}", e))
    })?;

    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ChatError::service("completion response had no message content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice_content() {
        let body = r#"{"choices":[
            {"message":{"role":"assistant","content":"hello there"}},
            {"message":{"role":"assistant","content":"ignored"}}
        ]}"#;
        assert_eq!(parse_completion_body(body).unwrap(), "hello there");
    }

    #[test]
    fn missing_choices_is_service_error() {
        let err = parse_completion_body(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, ChatError::Service(_)));
    }

    #[test]
    fn null_content_is_service_error() {
        let err =
            parse_completion_body(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap_err();
        assert!(matches!(err, ChatError::Service(_)));
    }

    #[test]
    fn garbled_body_is_service_error() {
        let err = parse_completion_body(r#"{"choices":[{"mess"#).unwrap_err();
        assert!(matches!(err, ChatError::Service(_)));
    }

    #[test]
    fn request_body_carries_both_messages_and_sampling() {
        let body = ChatCompletionRequest {
            model: "gpt-4",
            messages: vec![
                Message {
                    role: "system",
                    content: "be kind",
                },
                Message {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.5,
            max_tokens: 150,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 150);
    }

    #[test]
    fn new_normalizes_url_and_blank_key() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".to_string(),
            Some("  ".to_string()),
            "llama3.2".to_string(),
            reqwest::Client::new(),
        );
        assert_eq!(
            client.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert!(client.api_key.is_none());
        assert_eq!(client.model(), "llama3.2");
    }
}
