// ABOUTME: Defines the Exchange, the immutable unit persisted for every AI-assistant round trip.
// ABOUTME: Also holds the Purpose tag that routes records into the chat or summaries area.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// What an exchange was made for. Known tags get their own variant; tags
/// written by newer callers are carried through verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Purpose {
    #[default]
    Chat,
    FileSummary,
    ModuleSummary,
    ProjectSummary,
    Note,
    Other(String),
}

impl Purpose {
    pub fn as_str(&self) -> &str {
        match self {
            Purpose::Chat => "CHAT",
            Purpose::FileSummary => "FILE_SUMMARY",
            Purpose::ModuleSummary => "MODULE_SUMMARY",
            Purpose::ProjectSummary => "PROJECT_SUMMARY",
            Purpose::Note => "NOTE",
            Purpose::Other(tag) => tag,
        }
    }

    /// Summary-like purposes are stored in the summaries area.
    pub fn is_summary(&self) -> bool {
        self.as_str().ends_with("_SUMMARY")
    }
}

impl From<&str> for Purpose {
    fn from(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "CHAT" => Purpose::Chat,
            "FILE_SUMMARY" => Purpose::FileSummary,
            "MODULE_SUMMARY" => Purpose::ModuleSummary,
            "PROJECT_SUMMARY" => Purpose::ProjectSummary,
            "NOTE" => Purpose::Note,
            _ => Purpose::Other(tag.to_string()),
        }
    }
}

impl From<String> for Purpose {
    fn from(tag: String) -> Self {
        Purpose::from(tag.as_str())
    }
}

impl From<Purpose> for String {
    fn from(purpose: Purpose) -> Self {
        purpose.as_str().to_string()
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The prompt side of an exchange, including sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// The provider's response body, kept exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponse {
    #[serde(default)]
    pub json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
}

impl TokenUsage {
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self {
            prompt_tokens: Some(prompt),
            completion_tokens: Some(completion),
            total_tokens: Some(prompt + completion),
        }
    }

    /// The total, falling back to prompt + completion when only the parts are known.
    pub fn resolved_total(&self) -> Option<i64> {
        self.total_tokens.or(match (self.prompt_tokens, self.completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        })
    }
}

/// One request/response round trip with an AI provider. Immutable once
/// appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub purpose: Purpose,
    #[serde(default)]
    pub request: ExchangeRequest,
    #[serde(default)]
    pub raw_response: RawResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl Exchange {
    /// Create a new exchange with a fresh ULID and the current time.
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        purpose: Purpose,
        input: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            conversation_id: None,
            purpose,
            request: ExchangeRequest {
                input: input.into(),
                ..ExchangeRequest::default()
            },
            raw_response: RawResponse::default(),
            token_usage: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_response(mut self, body: impl Into<String>, http_status: Option<u16>) -> Self {
        self.raw_response = RawResponse {
            json: body.into(),
            http_status,
        };
        self
    }
}
