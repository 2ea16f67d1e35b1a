// ABOUTME: Row-level reads and writes for the projects and exchanges tables.
// ABOUTME: Shared by live saves, narrow enrichment updates, and the index rebuild.

use chrono::{DateTime, TimeZone, Utc};
use parley_core::metadata::{join_set, split_set};
use parley_core::{
    DerivedMetadata, Exchange, ExchangeMetadata, IdeContext, Project, Purpose, TokenUsage,
    analyze, extract_response_text, extract_token_usage,
};
use rusqlite::Row;

use crate::index::{IndexError, IndexSession};
use crate::sql_args;

/// Column list matching `map_metadata`.
pub const METADATA_COLUMNS: &str = "id, projectId, providerId, modelId, purpose, timestamp, \
    promptTokens, completionTokens, totalTokens, assistantText, flags, labels, rawFile, rawAvailable, \
    hasCodeBlock, codeLanguages, hasCommand, hasStacktrace, detectedTopics, filePaths, duplicateHash, \
    contextFile, contextLanguage, contextModule, contextBranch, openFiles";

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn optional_set(column: Option<String>) -> Option<Vec<String>> {
    column.map(|c| split_set(Some(&c)))
}

/// Map a row selected with `METADATA_COLUMNS`.
pub fn map_metadata(row: &Row<'_>) -> rusqlite::Result<ExchangeMetadata> {
    let purpose: String = row.get(4)?;
    let flags: Option<String> = row.get(10)?;
    let labels: Option<String> = row.get(11)?;
    Ok(ExchangeMetadata {
        id: row.get(0)?,
        project_id: row.get(1)?,
        provider_id: row.get(2)?,
        model_id: row.get(3)?,
        purpose: Purpose::from(purpose),
        timestamp: millis_to_datetime(row.get(5)?),
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        total_tokens: row.get(8)?,
        assistant_text: row.get(9)?,
        flags: split_set(flags.as_deref()),
        labels: split_set(labels.as_deref()),
        raw_file: row.get(12)?,
        raw_available: row.get(13)?,
        derived: DerivedMetadata {
            has_code_block: row.get(14)?,
            code_languages: optional_set(row.get(15)?),
            has_command: row.get(16)?,
            has_stacktrace: row.get(17)?,
            detected_topics: optional_set(row.get(18)?),
            file_paths: optional_set(row.get(19)?),
            duplicate_hash: row.get(20)?,
        },
        ide_context: IdeContext {
            context_file: row.get(21)?,
            context_language: row.get(22)?,
            context_module: row.get(23)?,
            context_branch: row.get(24)?,
            open_files: optional_set(row.get(25)?),
        },
    })
}

pub fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: millis_to_datetime(row.get(3)?),
        last_opened_at: millis_to_datetime(row.get(4)?),
        is_active: row.get(5)?,
    })
}

/// Insert a project, or bump `lastOpenedAt` if it is already registered.
pub fn upsert_project(s: &IndexSession<'_>, project: &Project) -> Result<(), IndexError> {
    s.execute(
        "INSERT INTO projects (id, name, path, createdAt, lastOpenedAt, isActive)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)
         ON CONFLICT(id) DO UPDATE SET
            lastOpenedAt = excluded.lastOpenedAt,
            isActive = 1",
        sql_args![
            &project.id,
            &project.name,
            &project.path,
            project.created_at,
            project.last_opened_at,
        ],
    )?;
    Ok(())
}

/// Register a project only if it is unknown. Returns whether a row was added.
pub fn ensure_project(s: &IndexSession<'_>, id: &str, name: &str, path: &str) -> Result<bool, IndexError> {
    let now = Utc::now();
    let inserted = s.execute(
        "INSERT OR IGNORE INTO projects (id, name, path, createdAt, lastOpenedAt, isActive)
         VALUES (?1, ?2, ?3, ?4, ?4, 1)",
        sql_args![id, name, path, now],
    )?;
    Ok(inserted > 0)
}

/// How an exchange row insert treats an existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Fail,
    Ignore,
}

/// Insert the base index row for an exchange. Token and derived columns stay NULL.
pub fn insert_exchange(
    s: &IndexSession<'_>,
    exchange: &Exchange,
    project_id: &str,
    raw_file: &str,
    assistant_text: Option<&str>,
    on_conflict: OnConflict,
) -> Result<usize, IndexError> {
    let verb = match on_conflict {
        OnConflict::Fail => "INSERT",
        OnConflict::Ignore => "INSERT OR IGNORE",
    };
    let sql = format!(
        "{verb} INTO exchanges (id, projectId, providerId, modelId, purpose, timestamp, assistantText, rawFile, rawAvailable)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)"
    );
    s.execute(
        &sql,
        sql_args![
            &exchange.id,
            project_id,
            &exchange.provider_id,
            &exchange.model_id,
            exchange.purpose.as_str(),
            exchange.timestamp,
            assistant_text,
            raw_file,
        ],
    )
}

pub fn write_token_usage(s: &IndexSession<'_>, id: &str, usage: &TokenUsage) -> Result<usize, IndexError> {
    s.execute(
        "UPDATE exchanges SET promptTokens = ?2, completionTokens = ?3, totalTokens = ?4 WHERE id = ?1",
        sql_args![id, usage.prompt_tokens, usage.completion_tokens, usage.resolved_total()],
    )
}

pub fn write_derived(s: &IndexSession<'_>, id: &str, derived: &DerivedMetadata) -> Result<usize, IndexError> {
    s.execute(
        "UPDATE exchanges SET hasCodeBlock = ?2, codeLanguages = ?3, hasCommand = ?4, hasStacktrace = ?5,
            detectedTopics = ?6, filePaths = ?7, duplicateHash = ?8
         WHERE id = ?1",
        sql_args![
            id,
            derived.has_code_block,
            derived.code_languages.as_deref().map(join_set_or_empty),
            derived.has_command,
            derived.has_stacktrace,
            derived.detected_topics.as_deref().map(join_set_or_empty),
            derived.file_paths.as_deref().map(join_set_or_empty),
            derived.duplicate_hash.as_deref(),
        ],
    )
}

pub fn write_ide_context(s: &IndexSession<'_>, id: &str, ctx: &IdeContext) -> Result<usize, IndexError> {
    s.execute(
        "UPDATE exchanges SET contextFile = ?2, contextLanguage = ?3, contextModule = ?4,
            contextBranch = ?5, openFiles = ?6
         WHERE id = ?1",
        sql_args![
            id,
            ctx.context_file.as_deref(),
            ctx.context_language.as_deref(),
            ctx.context_module.as_deref(),
            ctx.context_branch.as_deref(),
            ctx.open_files.as_deref().map(join_set_or_empty),
        ],
    )
}

pub fn write_assistant_text(s: &IndexSession<'_>, id: &str, text: &str) -> Result<usize, IndexError> {
    s.execute(
        "UPDATE exchanges SET assistantText = ?2 WHERE id = ?1",
        sql_args![id, text],
    )
}

/// An analyzed-but-empty set is stored as "" so it reads back as `Some(vec![])`
/// rather than "not analyzed yet".
fn join_set_or_empty(items: &[String]) -> String {
    join_set(items).unwrap_or_default()
}

/// Everything ingest-time parsing learns about an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub assistant_text: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub derived: DerivedMetadata,
}

impl Enrichment {
    /// Parse the response body and analyze the text. `known_text` and
    /// `known_usage` take priority over values re-derived from the body.
    pub fn compute(
        prompt: &str,
        raw_body: &str,
        known_text: Option<String>,
        known_usage: Option<TokenUsage>,
    ) -> Self {
        let assistant_text = known_text.or_else(|| extract_response_text(raw_body));
        let token_usage = known_usage.or_else(|| extract_token_usage(raw_body));
        let derived = analyze(prompt, assistant_text.as_deref().unwrap_or(""));
        Self {
            assistant_text,
            token_usage,
            derived,
        }
    }

    pub fn for_exchange(exchange: &Exchange) -> Self {
        Self::compute(
            &exchange.request.input,
            &exchange.raw_response.json,
            None,
            exchange.token_usage,
        )
    }
}
