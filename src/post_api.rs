//! Web API client for rich message delivery.
//!
//! Messages that need formatting the realtime socket cannot express (links,
//! attachments, blocks) go out as one-shot authenticated POSTs instead of
//! stream frames. This path is independent of the stream connection state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::EventRecord;
use crate::stream::recent::RecentEvents;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production message-post endpoint.
pub const POST_MESSAGE_ENDPOINT: &str = "https://slack.com/api/chat.postMessage";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PostDefaults;

impl PostDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const JITTER: Duration = Duration::from_millis(250);
}

#[derive(Clone, Debug)]
pub struct PostClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for PostClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: PostDefaults::CONNECT_TIMEOUT,
            attempt_timeout: PostDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: PostDefaults::MAX_ATTEMPTS,
                backoff: PostDefaults::BACKOFF,
                jitter: PostDefaults::JITTER,
            },
        }
    }
}

/// One-shot authenticated message poster.
#[derive(Clone)]
pub struct PostClient {
    http: Client,
    token: SecretString,
    endpoint: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl PostClient {
    pub fn new(token: SecretString) -> Result<Self, PostError> {
        Self::with_options(token, PostClientOptions::default())
    }

    pub fn with_options(token: SecretString, options: PostClientOptions) -> Result<Self, PostError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(PostError::Transport)?;

        Ok(Self {
            http,
            token,
            endpoint: POST_MESSAGE_ENDPOINT.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Sets an explicit post endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Posts a fully built message envelope, forcing `as_user` on so the
    /// message is attributed to the authenticated bot identity.
    pub async fn post_message(&self, mut envelope: Value) -> Result<(), PostError> {
        let Some(fields) = envelope.as_object_mut() else {
            return Err(PostError::Parse(
                "message envelope must be a JSON object".to_string(),
            ));
        };
        fields.insert("as_user".to_string(), Value::Bool(true));

        let policy = self.retry_policy.clone();
        retry_async(
            &policy,
            |_| {
                let body = envelope.clone();
                async move { self.send_attempt(&body).await }
            },
            PostError::is_retryable,
        )
        .await
    }

    /// Fire-and-forget delivery: posts on a spawned task, recording failures
    /// in the recent-activity buffer instead of surfacing them.
    pub(crate) fn spawn_post(&self, envelope: Value, recent: Arc<Mutex<RecentEvents>>) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post_message(envelope).await {
                warn!(error = %err, "rich message post failed");
                if let Ok(mut recent) = recent.lock() {
                    recent.record(EventRecord::log_with_error(
                        "failed to post rich message",
                        Value::String(err.to_string()),
                    ));
                }
            }
        });
    }

    async fn send_attempt(&self, body: &Value) -> Result<(), PostError> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.attempt_timeout)
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(PostError::Transport)?;

        let status = response.status();
        let text = response.text().await.map_err(PostError::Transport)?;

        if !status.is_success() {
            return Err(PostError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_post_response(&text)
    }
}

/// Errors produced by the web API post path.
#[derive(Debug, Error)]
pub enum PostError {
    /// Request could not be sent or the response body could not be read.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Endpoint answered with a non-success HTTP status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Endpoint answered 200 but rejected the message (`ok: false`).
    #[error("post rejected: {code}")]
    Rejected { code: String },

    /// Response body did not match the expected envelope.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl PostError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Rejected { .. } | Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

fn parse_post_response(body: &str) -> Result<(), PostError> {
    let parsed: PostResponse = serde_json::from_str(body)
        .map_err(|err| PostError::Parse(format!("{err}. body={}", summarize_error_body(body))))?;

    if parsed.ok {
        Ok(())
    } else {
        Err(PostError::Rejected {
            code: parsed.error.unwrap_or_else(|| "unknown_error".to_string()),
        })
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
