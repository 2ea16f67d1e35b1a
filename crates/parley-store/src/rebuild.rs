// ABOUTME: Reconstructs the relational index from the JSONL logs alone.
// ABOUTME: Tolerates malformed lines, legacy record shapes and duplicate ids across files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parley_core::{Exchange, LineOrigin, LogRecord, RecordError, TokenUsage};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::index::{IndexError, IndexSession, RelationalIndex};
use crate::jsonl::AppendLog;
use crate::paths::{LOG_EXTENSION, PathResolver};
use crate::rows::{self, Enrichment, OnConflict};

/// Project id used when neither the record nor its location names one.
pub const UNKNOWN_PROJECT: &str = "unknown";

/// Counters describing one rebuild pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub lines_read: usize,
    pub imported: usize,
    pub already_indexed: usize,
    pub skipped_unparseable: usize,
    pub skipped_no_content: usize,
    pub skipped_duplicate: usize,
    pub insert_errors: usize,
    pub enriched: usize,
    pub enrichment_errors: usize,
}

/// What a single log line turned out to be.
#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Imported { enriched: bool },
    AlreadyIndexed,
    Unparseable,
    NoContent,
    Duplicate,
    InsertFailed,
}

/// Fields salvaged from one log line, each extracted independently.
struct Salvaged {
    exchange: Exchange,
    project_id: String,
    project_name: String,
    project_path: String,
    assistant_text: Option<String>,
    token_usage: Option<TokenUsage>,
}

/// Scans every log file under the storage root and inserts any record not
/// yet present in the index. Safe to run on an empty root and safe to
/// repeat: rows are inserted with insert-or-ignore semantics.
pub struct RebuildService<'a> {
    paths: &'a PathResolver,
    index: &'a RelationalIndex,
}

impl<'a> RebuildService<'a> {
    pub fn new(paths: &'a PathResolver, index: &'a RelationalIndex) -> Self {
        Self { paths, index }
    }

    /// Every log file under the root, in path order so that "first
    /// occurrence wins" is deterministic.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let root = self.paths.root();
        if !root.exists() {
            return Vec::new();
        }
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == LOG_EXTENSION))
            .collect()
    }

    pub fn run(&self) -> RebuildStats {
        let mut stats = RebuildStats::default();
        let mut seen: HashSet<String> = HashSet::new();

        for file in self.log_files() {
            stats.files_scanned += 1;
            if let Err(e) = self.rebuild_file(&file, &mut seen, &mut stats) {
                stats.files_failed += 1;
                tracing::error!(file = %file.display(), error = %e, "rebuild of log file failed");
            }
        }

        tracing::info!(
            files = stats.files_scanned,
            lines = stats.lines_read,
            imported = stats.imported,
            already_indexed = stats.already_indexed,
            unparseable = stats.skipped_unparseable,
            no_content = stats.skipped_no_content,
            duplicates = stats.skipped_duplicate,
            enriched = stats.enriched,
            enrichment_errors = stats.enrichment_errors,
            "index rebuild complete"
        );
        stats
    }

    fn rebuild_file(
        &self,
        file: &Path,
        seen: &mut HashSet<String>,
        stats: &mut RebuildStats,
    ) -> Result<(), StoreError> {
        let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let modified = file_modified(file);
        let inferred_project = self.paths.infer_project_id(file);

        // Buffer lines first so the transaction does not span file reads.
        let mut lines: Vec<(usize, String)> = Vec::new();
        AppendLog::scan(file, |n, l| {
            lines.push((n, l.to_string()));
            true
        })?;

        self.index.transaction(|tx| {
            for (line_no, line) in &lines {
                stats.lines_read += 1;
                let outcome = import_line(
                    tx,
                    line,
                    &LineOrigin::new(file, *line_no),
                    modified,
                    inferred_project.as_deref(),
                    seen,
                );
                tracing::debug!(file = %file_name, line = *line_no, outcome = ?outcome, "rebuild line");
                match outcome {
                    LineOutcome::Imported { enriched } => {
                        stats.imported += 1;
                        if enriched {
                            stats.enriched += 1;
                        } else {
                            stats.enrichment_errors += 1;
                        }
                    }
                    LineOutcome::AlreadyIndexed => stats.already_indexed += 1,
                    LineOutcome::Unparseable => stats.skipped_unparseable += 1,
                    LineOutcome::NoContent => stats.skipped_no_content += 1,
                    LineOutcome::Duplicate => stats.skipped_duplicate += 1,
                    LineOutcome::InsertFailed => stats.insert_errors += 1,
                }
            }
            Ok(())
        })
    }
}

fn import_line(
    tx: &IndexSession<'_>,
    line: &str,
    origin: &LineOrigin<'_>,
    modified: DateTime<Utc>,
    inferred_project: Option<&str>,
    seen: &mut HashSet<String>,
) -> LineOutcome {
    let record = match LogRecord::parse_at(line, origin).and_then(LogRecord::ensure_content) {
        Ok(record) => record,
        Err(RecordError::Empty) => return LineOutcome::NoContent,
        Err(_) => return LineOutcome::Unparseable,
    };

    let salvaged = salvage(record, modified, inferred_project);
    if !seen.insert(salvaged.exchange.id.clone()) {
        return LineOutcome::Duplicate;
    }

    let inserted = rows::ensure_project(
        tx,
        &salvaged.project_id,
        &salvaged.project_name,
        &salvaged.project_path,
    )
    .and_then(|_| {
        rows::insert_exchange(
            tx,
            &salvaged.exchange,
            &salvaged.project_id,
            origin.file_name,
            salvaged.assistant_text.as_deref(),
            OnConflict::Ignore,
        )
    });

    match inserted {
        Ok(0) => LineOutcome::AlreadyIndexed,
        Ok(_) => LineOutcome::Imported {
            enriched: enrich(tx, &salvaged).is_ok(),
        },
        Err(e) => {
            tracing::warn!(id = %salvaged.exchange.id, error = %e, "rebuild insert failed");
            LineOutcome::InsertFailed
        }
    }
}

/// Run the same enrichment as live ingest. Failures are reported, not raised.
fn enrich(tx: &IndexSession<'_>, salvaged: &Salvaged) -> Result<(), IndexError> {
    let enrichment = Enrichment::compute(
        &salvaged.exchange.request.input,
        &salvaged.exchange.raw_response.json,
        salvaged.assistant_text.clone(),
        salvaged.token_usage,
    );
    let id = &salvaged.exchange.id;
    let result = write_enrichment(tx, id, &enrichment, salvaged.assistant_text.is_none());
    if let Err(e) = &result {
        tracing::warn!(id = %id, error = %e, "rebuild enrichment failed");
    }
    result
}

fn write_enrichment(
    tx: &IndexSession<'_>,
    id: &str,
    enrichment: &Enrichment,
    write_text: bool,
) -> Result<(), IndexError> {
    rows::write_derived(tx, id, &enrichment.derived)?;
    if let Some(usage) = &enrichment.token_usage {
        rows::write_token_usage(tx, id, usage)?;
    }
    if write_text && let Some(text) = &enrichment.assistant_text {
        rows::write_assistant_text(tx, id, text)?;
    }
    Ok(())
}

/// Apply the rebuild fallbacks to a decoded record: the project comes from
/// the record, then the directory layout, then `UNKNOWN_PROJECT`. The
/// exchange itself is normalized exactly as a point read would see it.
fn salvage(record: LogRecord, modified: DateTime<Utc>, inferred_project: Option<&str>) -> Salvaged {
    let project_id = record
        .project_id
        .clone()
        .or_else(|| inferred_project.map(String::from))
        .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
    let project_name = record
        .project_name
        .clone()
        .unwrap_or_else(|| project_id.clone());
    let project_path = record.project_path.clone().unwrap_or_default();
    // The raw body is re-parsed during enrichment.
    let assistant_text = record.known_text().map(String::from);
    let token_usage = record.resolved_token_usage();

    Salvaged {
        exchange: record.into_exchange(modified),
        project_id,
        project_name,
        project_path,
        assistant_text,
        token_usage,
    }
}

fn file_modified(file: &Path) -> DateTime<Utc> {
    fs::metadata(file)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{METADATA_COLUMNS, map_metadata};
    use crate::sql_args;
    use parley_core::{ExchangeMetadata, Purpose, RecordRef};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        paths: PathResolver,
        index: RelationalIndex,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path().join("root"));
        let index = RelationalIndex::open(&dir.path().join("root/parley.db")).unwrap();
        Fixture {
            _dir: dir,
            paths,
            index,
        }
    }

    fn write_lines(fx: &Fixture, relative: &str, lines: &[&str]) -> PathBuf {
        let path = fx.paths.root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).unwrap();
        path
    }

    fn count(fx: &Fixture) -> i64 {
        fx.index.scalar("SELECT COUNT(*) FROM exchanges", sql_args![]).unwrap()
    }

    fn row(fx: &Fixture, id: &str) -> ExchangeMetadata {
        fx.index
            .query_one(
                &format!("SELECT {METADATA_COLUMNS} FROM exchanges WHERE id = ?1"),
                sql_args![id],
                map_metadata,
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn empty_root_is_a_no_op() {
        let fx = fixture();
        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.files_scanned, 0);
        assert_eq!(stats.imported, 0);
        assert_eq!(count(&fx), 0);
    }

    #[test]
    fn tolerates_bad_and_empty_lines() {
        let fx = fixture();
        write_lines(
            &fx,
            "chat/p1/exchanges-2026-W07.jsonl",
            &[
                r#"{"id":"good","timestamp":"2026-02-11T10:00:00Z","providerId":"openai","modelId":"gpt-4o","purpose":"CHAT","request":{"input":"hi"},"rawResponse":{"json":"{\"choices\":[{\"message\":{\"content\":\"hello\"}}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}"}}"#,
                r#"{"id":"broken", "timestamp": "#,
                r#"{"id":"empty","timestamp":"2026-02-11T10:00:00Z"}"#,
            ],
        );

        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.lines_read, 3);
        assert_eq!(stats.imported, 1);
        assert_eq!(stats.skipped_unparseable, 1);
        assert_eq!(stats.skipped_no_content, 1);
        assert_eq!(stats.enriched, 1);
        assert_eq!(count(&fx), 1);

        let good = row(&fx, "good");
        assert_eq!(good.project_id, "p1");
        assert_eq!(good.raw_file, "exchanges-2026-W07.jsonl");
        assert_eq!(good.total_tokens, Some(8));
        assert_eq!(good.assistant_text.as_deref(), Some("hello"));
        assert!(good.derived.duplicate_hash.is_some());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let fx = fixture();
        write_lines(
            &fx,
            "chat/p1/exchanges-2026-W07.jsonl",
            &[
                r#"{"id":"a","request":{"input":"one"}}"#,
                r#"{"id":"b","request":{"input":"two"}}"#,
            ],
        );

        let first = RebuildService::new(&fx.paths, &fx.index).run();
        let before = row(&fx, "a");
        let second = RebuildService::new(&fx.paths, &fx.index).run();

        assert_eq!(first.imported, 2);
        assert_eq!(second.imported, 0);
        assert_eq!(second.already_indexed, 2);
        assert_eq!(count(&fx), 2);
        assert_eq!(row(&fx, "a"), before);
    }

    #[test]
    fn first_occurrence_of_an_id_wins() {
        let fx = fixture();
        write_lines(
            &fx,
            "chat/p1/exchanges-2026-W01.jsonl",
            &[r#"{"id":"dup","providerId":"first","request":{"input":"x"}}"#],
        );
        write_lines(
            &fx,
            "chat/p1/exchanges-2026-W02.jsonl",
            &[r#"{"id":"dup","providerId":"second","request":{"input":"x"}}"#],
        );

        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.imported, 1);
        assert_eq!(stats.skipped_duplicate, 1);
        let dup = row(&fx, "dup");
        assert_eq!(dup.provider_id, "first");
        assert_eq!(dup.raw_file, "exchanges-2026-W01.jsonl");
    }

    #[test]
    fn legacy_shapes_are_normalized() {
        let fx = fixture();
        write_lines(
            &fx,
            "summaries/p9/exchanges-2025-W50.jsonl",
            &[
                r#"{"id":"legacy","timestamp":1700000000000,"purpose":"FILE_SUMMARY","request":{"input":"summarize"},"response":"It parses files.","tokensUsed":120}"#,
                r#"{"id":"memo","note":"check the cache eviction"}"#,
                r#"{"request":{"input":"no id here"}}"#,
            ],
        );

        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.imported, 3);

        let legacy = row(&fx, "legacy");
        assert_eq!(legacy.purpose, Purpose::FileSummary);
        assert_eq!(legacy.total_tokens, Some(120));
        assert_eq!(legacy.prompt_tokens, None);
        assert_eq!(legacy.assistant_text.as_deref(), Some("It parses files."));
        assert_eq!(legacy.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(legacy.project_id, "p9");

        let memo = row(&fx, "memo");
        assert_eq!(memo.purpose, Purpose::Note);
        assert_eq!(memo.assistant_text.as_deref(), Some("check the cache eviction"));
    }

    #[test]
    fn id_less_lines_keep_their_ids_across_rebuilds() {
        let fx = fixture();
        let path = write_lines(
            &fx,
            "chat/p1/exchanges-2024-W03.jsonl",
            &[
                r#"{"timestamp":1705300000000,"request":{"input":"same prompt"},"tokensUsed":7}"#,
                r#"{"timestamp":1705300000000,"request":{"input":"same prompt"},"tokensUsed":7}"#,
            ],
        );

        let first = RebuildService::new(&fx.paths, &fx.index).run();
        let second = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(first.imported, 2);
        assert_eq!(second.imported, 0);
        assert_eq!(second.already_indexed, 2);
        assert_eq!(count(&fx), 2);

        let rows: Vec<ExchangeMetadata> = fx
            .index
            .query(&format!("SELECT {METADATA_COLUMNS} FROM exchanges"), sql_args![], map_metadata)
            .unwrap();
        for indexed in rows {
            // The row and a read from the log must describe the same exchange.
            let record = AppendLog::find(&path, &indexed.id).unwrap().unwrap();
            let logged = record.into_exchange(indexed.timestamp);
            assert_eq!(logged.id, indexed.id);
            assert_eq!(logged.provider_id, indexed.provider_id);
            assert_eq!(logged.model_id, indexed.model_id);
            assert_eq!(logged.provider_id, "unknown");
            assert_eq!(logged.purpose, indexed.purpose);
            assert_eq!(logged.timestamp, indexed.timestamp);
            assert_eq!(logged.token_usage.and_then(|u| u.total_tokens), indexed.total_tokens);
        }
    }

    #[test]
    fn failed_enrichment_keeps_the_row() {
        let fx = fixture();
        fx.index
            .execute(
                "CREATE TRIGGER block_updates BEFORE UPDATE ON exchanges BEGIN SELECT RAISE(ABORT, 'blocked'); END",
                sql_args![],
            )
            .unwrap();
        write_lines(
            &fx,
            "chat/p1/exchanges-2026-W07.jsonl",
            &[
                r#"{"id":"e1","request":{"input":"hi"},"rawResponse":{"json":"{\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}"}}"#,
            ],
        );

        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.imported, 1);
        assert_eq!(stats.enriched, 0);
        assert_eq!(stats.enrichment_errors, 1);
        assert_eq!(count(&fx), 1);
        let e1 = row(&fx, "e1");
        assert_eq!(e1.total_tokens, None);
        assert!(e1.derived.duplicate_hash.is_none());
    }

    #[test]
    fn record_project_id_beats_directory() {
        let fx = fixture();
        let ex = Exchange::new("openai", "gpt", Purpose::Chat, "hello").with_id("e1");
        let line = RecordRef::new(&ex, "real-project", "Real").to_line().unwrap();
        write_lines(&fx, "chat/elsewhere/exchanges-2026-W07.jsonl", &[&line]);

        RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(row(&fx, "e1").project_id, "real-project");
        let name: Option<String> = fx
            .index
            .query_one("SELECT name FROM projects WHERE id = 'real-project'", sql_args![], |r| r.get(0))
            .unwrap();
        assert_eq!(name.as_deref(), Some("Real"));
    }

    #[test]
    fn ignores_non_log_files() {
        let fx = fixture();
        write_lines(&fx, "chat/p1/readme.txt", &[r#"{"id":"x","request":{"input":"y"}}"#]);
        let stats = RebuildService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.files_scanned, 0);
    }
}
