//! Reasoning backend implementations and the retry policy.
//!
//! The engine talks to any [`ReasoningBackend`]; this module provides the
//! HTTP implementation against an OpenAI-compatible chat-completions
//! endpoint, plus [`complete_with_retry`], the single place transient
//! backend failures are retried with exponential backoff.

use std::time::Duration;

use autoanalyst_sdk::{BackendError, BoundedText, Purpose, ReasoningBackend};
use serde::{Deserialize, Serialize};

/// System prompts per purpose. Short on purpose: the budgeted context in
/// the user message carries the real information.
fn system_prompt(purpose: Purpose) -> &'static str {
    match purpose {
        Purpose::Plan | Purpose::Revise => {
            "You are an experienced data scientist planning analyses. \
             Respond with JSON exactly as instructed."
        }
        Purpose::Codegen | Purpose::Repair => {
            "You are an experienced data scientist writing analysis code. \
             Respond with Python code only."
        }
        Purpose::Interpret => {
            "You are an experienced data scientist interpreting analysis \
             results for a report."
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// OpenAI-compatible chat-completions backend.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl HttpBackend {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Timeout(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens: 4096,
        })
    }

    /// Plan and revision responses are parsed as JSON; ask the endpoint
    /// for JSON mode when the purpose wants it.
    fn wants_json(purpose: Purpose) -> bool {
        matches!(purpose, Purpose::Plan | Purpose::Revise)
    }
}

#[autoanalyst_sdk::async_trait]
impl ReasoningBackend for HttpBackend {
    async fn complete(
        &self,
        prompt: &BoundedText,
        purpose: Purpose,
    ) -> Result<String, BackendError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt(purpose).to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.as_str().to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
            response_format: Self::wants_json(purpose).then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(e.to_string())
                } else {
                    BackendError::Timeout(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => {
                return Err(BackendError::Auth(format!(
                    "backend returned {}",
                    status
                )))
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                return Err(BackendError::RateLimited { retry_after });
            }
            500..=599 => {
                return Err(BackendError::Timeout(format!(
                    "backend returned {}",
                    status
                )))
            }
            _ => {}
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BackendError::MalformedResponse("no choices in response".to_string()))
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
        }
    }
}

/// Call the backend, retrying transient failures (rate limit, timeout)
/// with exponential backoff. Auth and malformed-response failures surface
/// immediately - retrying those only burns budget.
pub async fn complete_with_retry(
    backend: &dyn ReasoningBackend,
    prompt: &BoundedText,
    purpose: Purpose,
    policy: RetryPolicy,
) -> Result<String, BackendError> {
    let mut backoff_ms = policy.initial_backoff_ms;
    let mut attempt = 0;
    loop {
        match backend.complete(prompt, purpose).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = match &e {
                    BackendError::RateLimited {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => Duration::from_millis(backoff_ms),
                };
                tokio::time::sleep(delay).await;
                backoff_ms = backoff_ms.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails transiently `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[autoanalyst_sdk::async_trait]
    impl ReasoningBackend for Flaky {
        async fn complete(
            &self,
            _prompt: &BoundedText,
            _purpose: Purpose,
        ) -> Result<String, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(BackendError::Timeout("flaky".into()))
            } else {
                Ok("ok".into())
            }
        }
    }

    struct AlwaysAuthError;

    #[autoanalyst_sdk::async_trait]
    impl ReasoningBackend for AlwaysAuthError {
        async fn complete(
            &self,
            _prompt: &BoundedText,
            _purpose: Purpose,
        ) -> Result<String, BackendError> {
            Err(BackendError::Auth("bad key".into()))
        }
    }

    fn prompt() -> BoundedText {
        BoundedText::fit("hello", 10)
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let backend = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let result = complete_with_retry(
            &backend,
            &prompt(),
            Purpose::Plan,
            RetryPolicy::new(3, 1),
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_ceiling() {
        let backend = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let result = complete_with_retry(
            &backend,
            &prompt(),
            Purpose::Plan,
            RetryPolicy::new(2, 1),
        )
        .await;
        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let backend = AlwaysAuthError;
        let result = complete_with_retry(
            &backend,
            &prompt(),
            Purpose::Codegen,
            RetryPolicy::new(5, 1),
        )
        .await;
        assert!(matches!(result, Err(BackendError::Auth(_))));
    }
}
