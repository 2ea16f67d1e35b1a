// ABOUTME: Index-side view of an exchange: identifying fields, token counts, enrichment and IDE context.
// ABOUTME: Also defines the MetadataFilter used to query the index without touching the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::Purpose;

/// Default row cap for metadata queries.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Metadata derived from the prompt and response text after ingest.
/// Every field stays `None` until enrichment has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetadata {
    pub has_code_block: Option<bool>,
    pub code_languages: Option<Vec<String>>,
    pub has_command: Option<bool>,
    pub has_stacktrace: Option<bool>,
    pub detected_topics: Option<Vec<String>>,
    pub file_paths: Option<Vec<String>>,
    pub duplicate_hash: Option<String>,
}

/// Editor/session state captured around the time of the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeContext {
    pub context_file: Option<String>,
    pub context_language: Option<String>,
    pub context_module: Option<String>,
    pub context_branch: Option<String>,
    pub open_files: Option<Vec<String>>,
}

/// One row of the `exchanges` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeMetadata {
    pub id: String,
    pub project_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub purpose: Purpose,
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub assistant_text: Option<String>,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub raw_file: String,
    pub raw_available: bool,
    pub derived: DerivedMetadata,
    pub ide_context: IdeContext,
}

/// Optional predicates for `query_metadata`. Unset fields do not constrain the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataFilter {
    pub project_id: Option<String>,
    pub purpose: Option<Purpose>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub raw_data_available: Option<bool>,
    pub has_flag: Option<String>,
    pub has_label: Option<String>,
    pub limit: usize,
}

impl Default for MetadataFilter {
    fn default() -> Self {
        Self {
            project_id: None,
            purpose: None,
            provider_id: None,
            model_id: None,
            after: None,
            before: None,
            raw_data_available: None,
            has_flag: None,
            has_label: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl MetadataFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }
}

/// Join a label/flag set into the comma-separated column form. Empty sets store NULL.
pub fn join_set(items: &[String]) -> Option<String> {
    let cleaned: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.join(","))
    }
}

/// Split a comma-separated column back into a set.
pub fn split_set(column: Option<&str>) -> Vec<String> {
    column
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split_sets() {
        let joined = join_set(&["bug".to_string(), " ".to_string(), "todo ".to_string()]);
        assert_eq!(joined.as_deref(), Some("bug,todo"));
        assert_eq!(split_set(joined.as_deref()), vec!["bug", "todo"]);
        assert_eq!(join_set(&[]), None);
        assert!(split_set(None).is_empty());
    }

    #[test]
    fn default_filter_has_limit() {
        let filter = MetadataFilter::for_project("p1");
        assert_eq!(filter.project_id.as_deref(), Some("p1"));
        assert_eq!(filter.limit, DEFAULT_QUERY_LIMIT);
        assert!(filter.purpose.is_none());
    }
}
