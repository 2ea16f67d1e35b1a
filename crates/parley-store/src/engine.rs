// ABOUTME: StorageEngine facade: save-then-index writes, point reads, metadata queries and enrichment.
// ABOUTME: Owns the single-writer lock and drives rebuild and healing during initialization.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use parley_core::{
    DerivedMetadata, Exchange, ExchangeMetadata, IdeContext, LineOrigin, LogRecord, MetadataFilter, Project,
    Purpose, RecordRef, TokenUsage, extract_response_text,
};
use parley_core::metadata::{DEFAULT_QUERY_LIMIT, join_set};
use serde::Serialize;
use thiserror::Error;

use crate::config::{DEFAULT_INDEX_FILE, StoreConfig};
use crate::error::StoreError;
use crate::healing::{HealingService, HealingStats};
use crate::index::{IndexError, IndexSession, RelationalIndex, SqlValue};
use crate::jsonl::AppendLog;
use crate::paths::PathResolver;
use crate::rebuild::{RebuildService, RebuildStats};
use crate::rows::{self, Enrichment, METADATA_COLUMNS, OnConflict};
use crate::search::{InMemorySearch, TextSearch};
use crate::sql_args;

/// The only error a public engine operation returns. Every storage failure
/// is logged and turned into a sentinel value instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("storage engine is not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready,
}

/// What initialization found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub rebuild: RebuildStats,
    pub healing: HealingStats,
    pub searchable: usize,
}

/// Aggregate counts over the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub exchanges: i64,
    pub projects: i64,
    pub unavailable: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// State that exists once initialization has completed.
struct Ready {
    paths: PathResolver,
    index: RelationalIndex,
    write_lock: Mutex<()>,
    report: InitReport,
}

impl Ready {
    /// Serializes every log append and index write in the process.
    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The persistence facade. Construct it, call `initialize` once, then share
/// it (typically behind an `Arc`) with every caller.
pub struct StorageEngine {
    project: Project,
    index_file: String,
    search: Box<dyn TextSearch>,
    status: Mutex<EngineStatus>,
    ready: OnceLock<Ready>,
}

impl StorageEngine {
    /// Create an uninitialized engine for the given current project.
    pub fn new(project: Project) -> Self {
        Self {
            project,
            index_file: DEFAULT_INDEX_FILE.to_string(),
            search: Box::new(InMemorySearch::new()),
            status: Mutex::new(EngineStatus::Uninitialized),
            ready: OnceLock::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.project()).with_index_file(config.index_file.clone())
    }

    /// Replace the default in-memory search component.
    pub fn with_search(mut self, search: Box<dyn TextSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_index_file(mut self, index_file: impl Into<String>) -> Self {
        self.index_file = index_file.into();
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> Result<&Path, EngineError> {
        Ok(self.ready()?.paths.root())
    }

    fn ready(&self) -> Result<&Ready, EngineError> {
        self.ready.get().ok_or(EngineError::NotInitialized)
    }

    // ============================================
    // LIFECYCLE
    // ============================================

    /// Open the index under `root`, rebuild it from the logs, register the
    /// current project, load the search index, and heal misplaced files.
    /// Calling it again after success returns the first report.
    pub fn initialize(&self, root: &Path) -> Result<InitReport, StoreError> {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            match *status {
                EngineStatus::Ready => {
                    return Ok(self.ready.get().map(|r| r.report.clone()).unwrap_or_default());
                }
                EngineStatus::Initializing => return Err(StoreError::AlreadyInitializing),
                EngineStatus::Uninitialized => *status = EngineStatus::Initializing,
            }
        }

        tracing::info!(root = %root.display(), project_id = %self.project.id, "initializing storage engine");
        let result = self.bring_up(root);

        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(ready) => {
                let report = ready.report.clone();
                let _ = self.ready.set(ready);
                *status = EngineStatus::Ready;
                tracing::info!(
                    imported = report.rebuild.imported,
                    migrated = report.healing.migrated,
                    searchable = report.searchable,
                    "storage engine ready"
                );
                Ok(report)
            }
            Err(e) => {
                *status = EngineStatus::Uninitialized;
                tracing::error!(error = %e, "storage engine initialization failed");
                Err(e)
            }
        }
    }

    fn bring_up(&self, root: &Path) -> Result<Ready, StoreError> {
        let paths = PathResolver::new(root);
        paths.ensure_root_directories()?;
        let index = RelationalIndex::open(&root.join(&self.index_file))?;

        let rebuild = RebuildService::new(&paths, &index).run();

        index.with_session(|s| rows::upsert_project(s, &self.project))?;
        paths.ensure_project_directories(&self.project.id)?;

        let searchable = self.load_search(&paths, &index)?;
        let healing = HealingService::new(&paths, &index).run();

        Ok(Ready {
            paths,
            index,
            write_lock: Mutex::new(()),
            report: InitReport {
                rebuild,
                healing,
                searchable,
            },
        })
    }

    /// Feed every available record into the search component, scanning each
    /// log file once.
    fn load_search(&self, paths: &PathResolver, index: &RelationalIndex) -> Result<usize, StoreError> {
        self.search.clear();

        let rows = index.query(
            "SELECT id, projectId, rawFile, purpose, assistantText FROM exchanges WHERE rawAvailable = 1",
            sql_args![],
            |r| {
                let purpose: String = r.get(3)?;
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    Purpose::from(purpose),
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )?;

        let mut by_file: HashMap<PathBuf, HashMap<String, Option<String>>> = HashMap::new();
        for (id, project_id, raw_file, purpose, text) in rows {
            let path = paths.resolve_file(&project_id, &raw_file, &purpose);
            by_file.entry(path).or_default().insert(id, text);
        }

        let mut indexed = 0;
        for (path, wanted) in by_file {
            if !path.exists() {
                continue;
            }
            let scanned = AppendLog::scan(&path, |line_no, line| {
                if let Ok(record) = LogRecord::parse_at(line, &LineOrigin::new(&path, line_no))
                    && let Some(cached) = wanted.get(record.id())
                {
                    let exchange = record.into_exchange(Utc::now());
                    self.search.index(
                        &exchange.id,
                        exchange.timestamp,
                        &searchable_text(&exchange, cached.as_deref()),
                    );
                    indexed += 1;
                }
                true
            });
            if let Err(e) = scanned {
                tracing::warn!(file = %path.display(), error = %e, "could not load log file into search");
            }
        }
        Ok(indexed)
    }

    // ============================================
    // WRITES
    // ============================================

    /// Append the exchange to its partition file, then insert its index row
    /// with token and derived columns left NULL. Returns the id, or `None`
    /// if either step failed.
    pub fn save(&self, exchange: &Exchange, project: &Project) -> Result<Option<String>, EngineError> {
        let ready = self.ready()?;

        let result = {
            let _guard = ready.lock_writes();
            append_and_index(ready, exchange, project)
        };

        match result {
            Ok(raw_file) => {
                tracing::debug!(id = %exchange.id, project_id = %project.id, file = %raw_file, "exchange saved");
                self.search
                    .index(&exchange.id, exchange.timestamp, &searchable_text(exchange, None));
                Ok(Some(exchange.id.clone()))
            }
            Err(e) => {
                tracing::error!(id = %exchange.id, project_id = %project.id, error = %e, "save failed");
                Ok(None)
            }
        }
    }

    /// Save, then run ingest-time enrichment: parsed text, token usage and
    /// derived metadata. Enrichment failures leave the saved record intact.
    pub fn ingest(&self, exchange: &Exchange, project: &Project) -> Result<Option<String>, EngineError> {
        let Some(id) = self.save(exchange, project)? else {
            return Ok(None);
        };

        let enrichment = Enrichment::for_exchange(exchange);
        if let Some(text) = &enrichment.assistant_text {
            self.cache_parsed_text(&id, text)?;
        }
        if let Some(usage) = &enrichment.token_usage {
            self.update_token_usage(&id, usage)?;
        }
        self.update_derived_metadata(&id, &enrichment.derived)?;

        Ok(Some(id))
    }

    /// Replace the flag and/or label sets of a row. `None` leaves a set
    /// unchanged. Returns whether the row exists.
    pub fn update_metadata(
        &self,
        id: &str,
        flags: Option<&[String]>,
        labels: Option<&[String]>,
    ) -> Result<bool, EngineError> {
        self.write("update_metadata", id, |s| {
            s.execute(
                "UPDATE exchanges SET
                    flags = CASE WHEN ?2 THEN ?3 ELSE flags END,
                    labels = CASE WHEN ?4 THEN ?5 ELSE labels END
                 WHERE id = ?1",
                sql_args![
                    id,
                    flags.is_some(),
                    flags.and_then(join_set),
                    labels.is_some(),
                    labels.and_then(join_set),
                ],
            )
        })
    }

    pub fn update_token_usage(&self, id: &str, usage: &TokenUsage) -> Result<bool, EngineError> {
        self.write("update_token_usage", id, |s| rows::write_token_usage(s, id, usage))
    }

    pub fn update_derived_metadata(&self, id: &str, derived: &DerivedMetadata) -> Result<bool, EngineError> {
        self.write("update_derived_metadata", id, |s| rows::write_derived(s, id, derived))
    }

    pub fn update_ide_context(&self, id: &str, context: &IdeContext) -> Result<bool, EngineError> {
        self.write("update_ide_context", id, |s| rows::write_ide_context(s, id, context))
    }

    /// Store the assistant text parsed out of the raw response.
    pub fn cache_parsed_text(&self, id: &str, text: &str) -> Result<bool, EngineError> {
        self.write("cache_parsed_text", id, |s| rows::write_assistant_text(s, id, text))
    }

    /// Run a narrow index update under the write lock. Failure is logged and
    /// reported as `false`; the log record is already safe.
    fn write(
        &self,
        op: &str,
        id: &str,
        f: impl FnOnce(&IndexSession<'_>) -> Result<usize, IndexError>,
    ) -> Result<bool, EngineError> {
        let ready = self.ready()?;
        let _guard = ready.lock_writes();
        match ready.index.with_session(f) {
            Ok(changed) => {
                if changed == 0 {
                    tracing::debug!(op, id, "no index row to update");
                }
                Ok(changed > 0)
            }
            Err(e) => {
                tracing::warn!(op, id, error = %StoreError::from(e), "index update failed");
                Ok(false)
            }
        }
    }

    pub fn register_project(&self, project: &Project) -> Result<bool, EngineError> {
        let ready = self.ready()?;
        let _guard = ready.lock_writes();
        let result = ready
            .index
            .with_session(|s| rows::upsert_project(s, project))
            .map_err(StoreError::from)
            .and_then(|()| {
                ready
                    .paths
                    .ensure_project_directories(&project.id)
                    .map_err(StoreError::from)
            });
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!(project_id = %project.id, error = %e, "project registration failed");
                Ok(false)
            }
        }
    }

    /// Mark rows unavailable when the log file they point at is gone from
    /// both areas. Returns the number of rows newly marked.
    pub fn validate_availability(&self, project_id: &str) -> Result<usize, EngineError> {
        let ready = self.ready()?;
        match validate(ready, project_id) {
            Ok(marked) => {
                if marked > 0 {
                    tracing::warn!(project_id, marked, "rows marked unavailable");
                }
                Ok(marked)
            }
            Err(e) => {
                tracing::error!(project_id, error = %e, "availability validation failed");
                Ok(0)
            }
        }
    }

    /// Re-scan the logs into the index. Rows already present are left as is.
    pub fn rebuild_index(&self) -> Result<RebuildStats, EngineError> {
        let ready = self.ready()?;
        let _guard = ready.lock_writes();
        Ok(RebuildService::new(&ready.paths, &ready.index).run())
    }

    pub fn heal(&self) -> Result<HealingStats, EngineError> {
        let ready = self.ready()?;
        let _guard = ready.lock_writes();
        Ok(HealingService::new(&ready.paths, &ready.index).run())
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<bool, EngineError> {
        self.write("set_config", key, |s| {
            s.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                sql_args![key, value],
            )
        })
    }

    // ============================================
    // READS
    // ============================================

    /// Load the full exchange from its log file. `None` when the id is
    /// unknown, belongs to another project, or its file is unavailable.
    pub fn get(&self, id: &str, project_id: &str) -> Result<Option<Exchange>, EngineError> {
        let ready = self.ready()?;
        Ok(load_logged(ready, id, Some(project_id)))
    }

    pub fn metadata(&self, id: &str) -> Result<Option<ExchangeMetadata>, EngineError> {
        let ready = self.ready()?;
        let result = ready.index.query_one(
            &format!("SELECT {METADATA_COLUMNS} FROM exchanges WHERE id = ?1"),
            sql_args![id],
            rows::map_metadata,
        );
        Ok(result.unwrap_or_else(|e| {
            tracing::error!(id, error = %e, "metadata lookup failed");
            None
        }))
    }

    /// Query index rows only, newest first, bounded by `filter.limit`.
    pub fn query_metadata(&self, filter: &MetadataFilter) -> Result<Vec<ExchangeMetadata>, EngineError> {
        let ready = self.ready()?;
        let (sql, args) = build_metadata_query(filter);
        Ok(ready
            .index
            .query(&sql, &args, rows::map_metadata)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "metadata query failed");
                Vec::new()
            }))
    }

    /// Find ids through the search component, then load each full record.
    /// Matches whose records cannot be loaded are skipped.
    pub fn search_by_text(&self, query: &str, limit: usize) -> Result<Vec<Exchange>, EngineError> {
        let ready = self.ready()?;
        let ids = self.search.search(query, limit);
        Ok(ids
            .iter()
            .filter_map(|id| load_logged(ready, id, None))
            .collect())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        let ready = self.ready()?;
        Ok(ready
            .index
            .query(
                "SELECT id, name, path, createdAt, lastOpenedAt, isActive FROM projects
                 ORDER BY lastOpenedAt DESC, id",
                sql_args![],
                rows::map_project,
            )
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "project listing failed");
                Vec::new()
            }))
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let ready = self.ready()?;
        let result = ready.index.with_session(|s| {
            Ok::<_, IndexError>(EngineStats {
                exchanges: s.scalar("SELECT COUNT(*) FROM exchanges", sql_args![])?,
                projects: s.scalar("SELECT COUNT(*) FROM projects", sql_args![])?,
                unavailable: s.scalar("SELECT COUNT(*) FROM exchanges WHERE rawAvailable = 0", sql_args![])?,
                prompt_tokens: s.scalar("SELECT SUM(promptTokens) FROM exchanges", sql_args![])?,
                completion_tokens: s.scalar("SELECT SUM(completionTokens) FROM exchanges", sql_args![])?,
                total_tokens: s.scalar("SELECT SUM(totalTokens) FROM exchanges", sql_args![])?,
            })
        });
        Ok(result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "stats query failed");
            EngineStats::default()
        }))
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, EngineError> {
        let ready = self.ready()?;
        Ok(ready
            .index
            .query_one("SELECT value FROM config WHERE key = ?1", sql_args![key], |r| r.get(0))
            .unwrap_or_else(|e| {
                tracing::error!(key, error = %e, "config lookup failed");
                None
            }))
    }

    /// Report of the initialization run.
    pub fn init_report(&self) -> Result<InitReport, EngineError> {
        Ok(self.ready()?.report.clone())
    }
}

fn append_and_index(ready: &Ready, exchange: &Exchange, project: &Project) -> Result<String, StoreError> {
    if exchange.id.trim().is_empty() {
        return Err(StoreError::Malformed("exchange id is empty".to_string()));
    }

    let known = ready.index.query_one(
        "SELECT 1 FROM exchanges WHERE id = ?1",
        sql_args![exchange.id.as_str()],
        |r| r.get::<_, i64>(0),
    )?;
    if known.is_some() {
        return Err(StoreError::Constraint(format!("exchange {} already exists", exchange.id)));
    }

    ready.index.with_session(|s| rows::upsert_project(s, project))?;
    ready.paths.ensure_project_directories(&project.id)?;

    let path = ready.paths.current_file_for_purpose(&project.id, &exchange.purpose);
    let raw_file = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| StoreError::Malformed(format!("bad log path {}", path.display())))?;

    // The log is the source of truth: it is written before the index row.
    let mut log = AppendLog::open(&path)?;
    log.append(&RecordRef::new(exchange, &project.id, &project.name))?;

    ready.index.with_session(|s| {
        rows::insert_exchange(s, exchange, &project.id, &raw_file, None, OnConflict::Fail)
    })?;

    Ok(raw_file)
}

fn load_logged(ready: &Ready, id: &str, project_id: Option<&str>) -> Option<Exchange> {
    match load(ready, id, project_id) {
        Ok(exchange) => Some(exchange),
        Err(StoreError::NotFound(what)) => {
            tracing::debug!(id, what = %what, "exchange not found");
            None
        }
        Err(e) => {
            tracing::error!(id, error = %e, "exchange read failed");
            None
        }
    }
}

fn load(ready: &Ready, id: &str, project_id: Option<&str>) -> Result<Exchange, StoreError> {
    let row = ready.index.query_one(
        "SELECT projectId, rawFile, purpose, rawAvailable, timestamp FROM exchanges WHERE id = ?1",
        sql_args![id],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, bool>(3)?,
                r.get::<_, i64>(4)?,
            ))
        },
    )?;

    let Some((row_project, raw_file, purpose, available, timestamp)) = row else {
        return Err(StoreError::NotFound(format!("no index row for {id}")));
    };
    if let Some(expected) = project_id
        && expected != row_project
    {
        return Err(StoreError::NotFound(format!("{id} belongs to another project")));
    }
    if !available {
        return Err(StoreError::NotFound(format!("raw data for {id} is unavailable")));
    }

    let path = ready
        .paths
        .resolve_file(&row_project, &raw_file, &Purpose::from(purpose));
    if !path.exists() {
        return Err(StoreError::NotFound(format!("log file {} is missing", path.display())));
    }

    match AppendLog::find(&path, id)? {
        Some(record) => Ok(record.into_exchange(rows::millis_to_datetime(timestamp))),
        None => Err(StoreError::NotFound(format!("{id} not in {}", path.display()))),
    }
}

fn validate(ready: &Ready, project_id: &str) -> Result<usize, StoreError> {
    let referenced = ready.index.query(
        "SELECT DISTINCT rawFile, purpose FROM exchanges WHERE projectId = ?1 AND rawAvailable = 1",
        sql_args![project_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )?;

    let mut checked: HashSet<PathBuf> = HashSet::new();
    let missing: Vec<(String, String)> = referenced
        .into_iter()
        .filter(|(raw_file, purpose)| {
            let path = ready
                .paths
                .resolve_file(project_id, raw_file, &Purpose::from(purpose.as_str()));
            let exists = path.exists();
            if !exists && checked.insert(path.clone()) {
                tracing::warn!(project_id, file = %path.display(), "referenced log file is missing");
            }
            !exists
        })
        .collect();

    if missing.is_empty() {
        return Ok(0);
    }

    let _guard = ready.lock_writes();
    ready.index.transaction(|tx| {
        let mut marked = 0;
        for (raw_file, purpose) in &missing {
            marked += tx.execute(
                "UPDATE exchanges SET rawAvailable = 0
                 WHERE projectId = ?1 AND rawFile = ?2 AND purpose = ?3 AND rawAvailable = 1",
                sql_args![project_id, raw_file, purpose],
            )?;
        }
        Ok(marked)
    })
}

/// Build the dynamic predicate for a metadata query.
fn build_metadata_query(filter: &MetadataFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(project_id) = &filter.project_id {
        clauses.push("projectId = ?");
        args.push(project_id.into());
    }
    if let Some(purpose) = &filter.purpose {
        clauses.push("purpose = ?");
        args.push(purpose.as_str().into());
    }
    if let Some(provider_id) = &filter.provider_id {
        clauses.push("providerId = ?");
        args.push(provider_id.into());
    }
    if let Some(model_id) = &filter.model_id {
        clauses.push("modelId = ?");
        args.push(model_id.into());
    }
    if let Some(after) = filter.after {
        clauses.push("timestamp > ?");
        args.push(after.into());
    }
    if let Some(before) = filter.before {
        clauses.push("timestamp < ?");
        args.push(before.into());
    }
    if let Some(available) = filter.raw_data_available {
        clauses.push("rawAvailable = ?");
        args.push(available.into());
    }
    if let Some(flag) = &filter.has_flag {
        clauses.push("flags LIKE ? ESCAPE '\\'");
        args.push(like_pattern(flag).into());
    }
    if let Some(label) = &filter.has_label {
        clauses.push("labels LIKE ? ESCAPE '\\'");
        args.push(like_pattern(label).into());
    }

    let mut sql = format!("SELECT {METADATA_COLUMNS} FROM exchanges");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
    let limit = if filter.limit == 0 {
        DEFAULT_QUERY_LIMIT
    } else {
        filter.limit
    };
    args.push(limit.into());

    (sql, args)
}

/// Substring LIKE pattern with `%`, `_` and `\` escaped.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Text handed to the search component: the prompt plus the best available response text.
fn searchable_text(exchange: &Exchange, cached: Option<&str>) -> String {
    let response = cached
        .map(String::from)
        .or_else(|| extract_response_text(&exchange.raw_response.json))
        .unwrap_or_default();
    format!("{}\n{}", exchange.request.input, response)
}
