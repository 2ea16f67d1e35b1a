// ABOUTME: On-disk log record shapes: the canonical writer form and a tolerant decoder for past formats.
// ABOUTME: Legacy token counts, bare response strings and epoch-millis timestamps normalize into one Exchange.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::exchange::{Exchange, ExchangeRequest, Purpose, RawResponse, TokenUsage};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no id")]
    MissingId,

    #[error("record has no usable content")]
    Empty,
}

/// Provider and model recorded for legacy lines that name neither.
pub const UNKNOWN: &str = "unknown";

/// Prefix of ids derived for records written without one.
pub const DERIVED_ID_PREFIX: &str = "line-";

const DERIVED_ID_HEX_LEN: usize = 24;

/// The line written to a log file: the exchange plus the project it belongs to,
/// so every record can be interpreted without outside context.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef<'a> {
    pub project_id: &'a str,
    pub project_name: &'a str,
    #[serde(flatten)]
    pub exchange: &'a Exchange,
}

impl<'a> RecordRef<'a> {
    pub fn new(exchange: &'a Exchange, project_id: &'a str, project_name: &'a str) -> Self {
        Self {
            project_id,
            project_name,
            exchange,
        }
    }

    pub fn to_line(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `rawResponse` was once written as the bare body string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawResponseShape {
    Structured(RawResponse),
    Bare(String),
}

/// Timestamps were once written as epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TimestampShape {
    Millis(i64),
    Text(String),
}

impl TimestampShape {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            TimestampShape::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            TimestampShape::Text(s) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|| s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let shape: Option<TimestampShape> = lenient(deserializer)?;
    Ok(shape.and_then(TimestampShape::resolve))
}

/// Decode a field on its own: a value of the wrong shape becomes `None`
/// instead of failing the whole record.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Like `lenient`, but blank strings count as absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let text: Option<String> = lenient(deserializer)?;
    Ok(text.filter(|t| !t.trim().is_empty()))
}

/// Where a line sits in the log tree: the directory holding the file, the
/// file name and the 1-based line number. Records written without an id get
/// one derived from this, so every pass over the same file assigns the same id.
/// The area directory is not part of it, so a file keeps its ids when moved
/// between areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOrigin<'a> {
    pub scope: &'a str,
    pub file_name: &'a str,
    pub line_no: usize,
}

impl<'a> LineOrigin<'a> {
    pub fn new(path: &'a Path, line_no: usize) -> Self {
        Self {
            scope: component(path.parent()),
            file_name: component(Some(path)),
            line_no,
        }
    }

    /// Stable id for an id-less line found at this origin.
    pub fn derived_id(&self, line: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scope.as_bytes());
        hasher.update(b"/");
        hasher.update(self.file_name.as_bytes());
        hasher.update(format!("#{}\n", self.line_no).as_bytes());
        hasher.update(line.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{DERIVED_ID_PREFIX}{}", &digest[..DERIVED_ID_HEX_LEN])
    }
}

fn component(path: Option<&Path>) -> &str {
    path.and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

/// Any record shape ever written to a log file. Every field is decoded
/// independently; a malformed field is dropped rather than failing the line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Never empty once decoded through `parse` or `parse_at`.
    #[serde(default, deserialize_with = "lenient_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub provider_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub model_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    purpose: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub request: Option<ExchangeRequest>,
    #[serde(default, deserialize_with = "lenient")]
    raw_response: Option<RawResponseShape>,
    #[serde(default, deserialize_with = "lenient")]
    pub token_usage: Option<TokenUsage>,
    /// Legacy single total-token field.
    #[serde(default, deserialize_with = "lenient")]
    pub tokens_used: Option<i64>,
    /// Legacy pre-parsed response text.
    #[serde(default, deserialize_with = "lenient_text")]
    pub response: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub note: Option<String>,
}

impl LogRecord {
    /// Decode a line that must carry its own id.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let record = Self::decode(line)?;
        if record.id.is_none() {
            return Err(RecordError::MissingId);
        }
        Ok(record)
    }

    /// Decode a line read from `origin`, deriving an id when it has none.
    pub fn parse_at(line: &str, origin: &LineOrigin<'_>) -> Result<Self, RecordError> {
        let mut record = Self::decode(line)?;
        if record.id.is_none() {
            record.id = Some(origin.derived_id(line));
        }
        Ok(record)
    }

    fn decode(line: &str) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(line)?;
        if !value.is_object() {
            return Err(RecordError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Reject records with no prompt, response body, legacy response text or note.
    pub fn ensure_content(self) -> Result<Self, RecordError> {
        let has_prompt = self
            .request
            .as_ref()
            .is_some_and(|r| !r.input.trim().is_empty());
        let has_body = self
            .raw_response()
            .is_some_and(|r| !r.json.trim().is_empty());
        if has_prompt || has_body || self.response.is_some() || self.note.is_some() {
            Ok(self)
        } else {
            Err(RecordError::Empty)
        }
    }

    pub fn raw_response(&self) -> Option<RawResponse> {
        self.raw_response.clone().map(|shape| match shape {
            RawResponseShape::Structured(raw) => raw,
            RawResponseShape::Bare(json) => RawResponse {
                json,
                http_status: None,
            },
        })
    }

    /// Token usage in canonical form; `tokensUsed` maps to the total when
    /// `tokenUsage` is absent.
    pub fn resolved_token_usage(&self) -> Option<TokenUsage> {
        self.token_usage.or_else(|| {
            self.tokens_used.map(|total| TokenUsage {
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: Some(total),
            })
        })
    }

    /// Best response text known without parsing the raw body: the legacy
    /// pre-parsed text, then the note.
    pub fn known_text(&self) -> Option<&str> {
        self.response.as_deref().or(self.note.as_deref())
    }

    /// Normalize into an Exchange. `fallback_time` stands in for a missing or
    /// unreadable timestamp.
    pub fn into_exchange(self, fallback_time: DateTime<Utc>) -> Exchange {
        let raw_response = self.raw_response().unwrap_or_default();
        let token_usage = self.resolved_token_usage();
        let purpose = match (self.purpose, &self.note) {
            (Some(tag), _) => Purpose::from(tag),
            (None, Some(_)) => Purpose::Note,
            (None, None) => Purpose::Chat,
        };
        let mut request = self.request.unwrap_or_default();
        if request.input.is_empty()
            && let Some(note) = self.note
        {
            request.input = note;
        }
        Exchange {
            id: self.id.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or(fallback_time),
            provider_id: self.provider_id.unwrap_or_else(|| UNKNOWN.to_string()),
            model_id: self.model_id.unwrap_or_else(|| UNKNOWN.to_string()),
            conversation_id: self.conversation_id,
            purpose,
            request,
            raw_response,
            token_usage,
        }
    }
}
