//! Gemini `generateContent` client
//!
//! Sends the prompt as the sole part of a single-turn request, with the API
//! key as the `key` query parameter. The key never appears in logs: reqwest
//! errors are stripped of their URL and scrubbed before they are stored.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::{Generation, Upstream, UpstreamFailure, UpstreamOutcome};

/// Placeholder text when a successful response carries no candidate text.
pub const NO_REPLY: &str = "No reply.";

/// Upper bound on how much of an unstructured error body is kept.
const MAX_RAW_MESSAGE_CHARS: usize = 512;

pub struct GeminiClient {
    client: reqwest::Client,
    url: String,
    api_key: Secret<String>,
    /// Per-request deadline. `None` waits as long as the upstream does.
    timeout: Option<Duration>,
    prompt_prefix: Option<String>,
}

impl GeminiClient {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: Secret<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
            timeout: None,
            prompt_prefix: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Instruction prepended to every prompt. Empty means none.
    pub fn with_prompt_prefix(mut self, prefix: Option<String>) -> Self {
        self.prompt_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    /// JSON body for one prompt.
    pub fn request_body(&self, prompt: &str) -> Value {
        let text = match &self.prompt_prefix {
            Some(prefix) => format!("{prefix}{prompt}"),
            None => prompt.to_string(),
        };
        json!({
            "contents": [
                { "parts": [ { "text": text } ] }
            ]
        })
    }

    fn endpoint(&self) -> Result<Url, UpstreamFailure> {
        Url::parse_with_params(&self.url, &[("key", self.api_key.expose().as_str())])
            .map_err(|e| UpstreamFailure::internal(format!("invalid upstream url: {e}")))
    }

    /// Error text safe to log and store.
    fn describe(&self, err: reqwest::Error) -> String {
        self.api_key.scrub(&err.without_url().to_string())
    }

    #[instrument(skip_all, fields(upstream = "gemini", prompt_chars = prompt.chars().count()))]
    async fn attempt(&self, prompt: &str) -> UpstreamOutcome {
        let url = match self.endpoint() {
            Ok(u) => u,
            Err(f) => return UpstreamOutcome::Failure(f),
        };
        let body = match serde_json::to_vec(&self.request_body(prompt)) {
            Ok(b) => b,
            Err(e) => {
                return UpstreamOutcome::Failure(UpstreamFailure::internal(format!(
                    "failed to encode request: {e}"
                )));
            }
        };

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return UpstreamOutcome::Failure(UpstreamFailure::internal(self.describe(e)));
            }
            Err(e) => return UpstreamOutcome::Failure(UpstreamFailure::network(self.describe(e))),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return UpstreamOutcome::Failure(UpstreamFailure::network(self.describe(e))),
        };

        if !status.is_success() {
            return UpstreamOutcome::Failure(parse_failure(status.as_u16(), &text));
        }

        // A 2xx body that is not JSON still counts as success; extraction
        // falls back to the placeholder.
        let payload: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        debug!(bytes = text.len(), "upstream response received");
        UpstreamOutcome::Success(extract_generation(&payload))
    }
}

impl Upstream for GeminiClient {
    fn id(&self) -> &str {
        "gemini"
    }

    fn generate<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = UpstreamOutcome> + Send + 'a>> {
        Box::pin(self.attempt(prompt))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Turn a non-2xx response into a failure, keeping the upstream status code
/// and message when the body is the upstream's error envelope (either a bare
/// object or a one-element array of them).
pub fn parse_failure(status: u16, body: &str) -> UpstreamFailure {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok().or_else(|| {
        serde_json::from_str::<Vec<ErrorEnvelope>>(body)
            .ok()
            .and_then(|v| v.into_iter().next())
    });

    match envelope {
        Some(env) => UpstreamFailure::http(
            status,
            env.error.status,
            env.error.message.unwrap_or_default(),
            true,
        ),
        None => {
            let raw: String = body.trim().chars().take(MAX_RAW_MESSAGE_CHARS).collect();
            UpstreamFailure::http(status, None, raw, false)
        }
    }
}

/// Pull text and usage out of a `generateContent` payload.
///
/// Total over any JSON value: missing text becomes `NO_REPLY`, missing
/// token counts become zero. Parts flagged as thoughts are skipped unless
/// nothing else is present.
pub fn extract_generation(payload: &Value) -> Generation {
    Generation {
        text: extract_text(payload).unwrap_or_else(|| NO_REPLY.to_string()),
        prompt_tokens: payload["usageMetadata"]["promptTokenCount"]
            .as_u64()
            .unwrap_or(0),
        completion_tokens: payload["usageMetadata"]["candidatesTokenCount"]
            .as_u64()
            .unwrap_or(0),
        attempts: 1,
    }
}

fn extract_text(payload: &Value) -> Option<String> {
    let parts = payload["candidates"][0]["content"]["parts"].as_array()?;

    let answer: Vec<&str> = parts
        .iter()
        .filter(|p| !p["thought"].as_bool().unwrap_or(false))
        .filter_map(|p| p["text"].as_str())
        .collect();
    if !answer.is_empty() {
        return Some(answer.concat());
    }

    let thoughts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    if thoughts.is_empty() {
        None
    } else {
        Some(thoughts.concat())
    }
}
