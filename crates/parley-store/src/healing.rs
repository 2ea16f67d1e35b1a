// ABOUTME: Moves log files that an old routing defect wrote into the wrong area.
// ABOUTME: Copies, verifies, then removes the original; never deletes without a verified copy.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use parley_core::Purpose;
use serde::Serialize;

use crate::index::{IndexError, RelationalIndex};
use crate::paths::{Area, PathResolver};
use crate::sql_args;

/// Counters describing one healing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealingStats {
    pub examined: usize,
    pub migrated: usize,
    pub already_correct: usize,
    pub present_in_both: usize,
    pub missing: usize,
    pub failed: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Placement {
    Migrated,
    AlreadyCorrect,
    PresentInBoth,
    Missing,
}

pub struct HealingService<'a> {
    paths: &'a PathResolver,
    index: &'a RelationalIndex,
}

impl<'a> HealingService<'a> {
    pub fn new(paths: &'a PathResolver, index: &'a RelationalIndex) -> Self {
        Self { paths, index }
    }

    /// Examine every available file referenced by a non-chat row and move it
    /// into the area its purpose routes to. Failures are logged and counted.
    pub fn run(&self) -> HealingStats {
        let mut stats = HealingStats::default();

        let candidates = match self.candidates() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "healing could not list candidate files");
                stats.failed += 1;
                return stats;
            }
        };

        let mut visited: HashSet<(String, String, Area)> = HashSet::new();
        for (project_id, raw_file, purpose) in candidates {
            let area = Area::for_purpose(&purpose);
            if !visited.insert((project_id.clone(), raw_file.clone(), area)) {
                continue;
            }
            stats.examined += 1;

            match self.heal_file(&project_id, &raw_file, &purpose) {
                Ok(Placement::Migrated) => stats.migrated += 1,
                Ok(Placement::AlreadyCorrect) => stats.already_correct += 1,
                Ok(Placement::PresentInBoth) => stats.present_in_both += 1,
                Ok(Placement::Missing) => stats.missing += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(
                        project_id = %project_id,
                        file = %raw_file,
                        error = %e,
                        "log file migration failed; reads fall back to the old location"
                    );
                }
            }
        }

        tracing::info!(
            examined = stats.examined,
            migrated = stats.migrated,
            already_correct = stats.already_correct,
            present_in_both = stats.present_in_both,
            missing = stats.missing,
            failed = stats.failed,
            "healing pass complete"
        );
        stats
    }

    fn candidates(&self) -> Result<Vec<(String, String, Purpose)>, IndexError> {
        self.index.query(
            "SELECT DISTINCT projectId, rawFile, purpose FROM exchanges
             WHERE purpose != ?1 AND rawAvailable = 1
             ORDER BY projectId, rawFile",
            sql_args![Purpose::Chat.as_str()],
            |row| {
                let purpose: String = row.get(2)?;
                Ok((row.get(0)?, row.get(1)?, Purpose::from(purpose)))
            },
        )
    }

    fn heal_file(&self, project_id: &str, raw_file: &str, purpose: &Purpose) -> io::Result<Placement> {
        let correct = self.paths.expected_path(project_id, raw_file, purpose);
        let wrong = self.paths.alternate_path(project_id, raw_file, purpose);

        let placement = match (wrong.exists(), correct.exists()) {
            (true, false) => {
                migrate(&wrong, &correct)?;
                Placement::Migrated
            }
            (true, true) => Placement::PresentInBoth,
            (false, true) => Placement::AlreadyCorrect,
            (false, false) => Placement::Missing,
        };

        match placement {
            Placement::Migrated => tracing::info!(
                from = %wrong.display(),
                to = %correct.display(),
                "migrated misplaced log file"
            ),
            Placement::PresentInBoth => tracing::warn!(
                file = %raw_file,
                project_id,
                "log file exists in both areas; leaving both in place"
            ),
            Placement::Missing => tracing::debug!(file = %raw_file, project_id, "log file not on disk"),
            Placement::AlreadyCorrect => tracing::debug!(file = %raw_file, project_id, "log file correctly placed"),
        }
        Ok(placement)
    }
}

/// Copy `from` to `to`, verify the copy byte-for-byte, then remove `from`.
/// A failed verification removes the partial copy and leaves `from` untouched.
fn migrate(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::copy(from, to)?;

    let original = fs::read(from)?;
    let copied = fs::read(to)?;
    if original != copied {
        let _ = fs::remove_file(to);
        return Err(io::Error::other(format!(
            "copy of {} did not verify",
            from.display()
        )));
    }

    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{self, OnConflict};
    use parley_core::Exchange;
    use tempfile::TempDir;

    const FILE: &str = "exchanges-2026-W07.jsonl";

    struct Fixture {
        _dir: TempDir,
        paths: PathResolver,
        index: RelationalIndex,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path());
        let index = RelationalIndex::open(&dir.path().join("parley.db")).unwrap();
        paths.ensure_project_directories("p1").unwrap();
        Fixture {
            _dir: dir,
            paths,
            index,
        }
    }

    fn index_row(fx: &Fixture, id: &str, purpose: Purpose) {
        let ex = Exchange::new("p", "m", purpose, "x").with_id(id);
        fx.index
            .with_session(|s| {
                rows::ensure_project(s, "p1", "p1", "")?;
                rows::insert_exchange(s, &ex, "p1", FILE, None, OnConflict::Fail)
            })
            .unwrap();
    }

    #[test]
    fn migrates_summary_file_out_of_chat_area() {
        let fx = fixture();
        index_row(&fx, "s1", Purpose::FileSummary);
        let wrong = fx.paths.project_dir("p1", Area::Chat).join(FILE);
        fs::write(&wrong, "{\"id\":\"s1\"}\n").unwrap();

        let stats = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.migrated, 1);

        let correct = fx.paths.project_dir("p1", Area::Summaries).join(FILE);
        assert!(!wrong.exists());
        assert_eq!(fs::read_to_string(correct).unwrap(), "{\"id\":\"s1\"}\n");
    }

    #[test]
    fn second_run_is_a_no_op() {
        let fx = fixture();
        index_row(&fx, "s1", Purpose::ModuleSummary);
        fs::write(fx.paths.project_dir("p1", Area::Chat).join(FILE), "{}\n").unwrap();

        let first = HealingService::new(&fx.paths, &fx.index).run();
        let second = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(first.migrated, 1);
        assert_eq!(second.migrated, 0);
        assert_eq!(second.already_correct, 1);
    }

    #[test]
    fn correctly_placed_files_are_untouched() {
        let fx = fixture();
        index_row(&fx, "s1", Purpose::FileSummary);
        index_row(&fx, "c1", Purpose::Chat);
        let correct = fx.paths.project_dir("p1", Area::Summaries).join(FILE);
        fs::write(&correct, "{}\n").unwrap();

        let stats = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.examined, 1);
        assert_eq!(stats.migrated, 0);
        assert_eq!(stats.already_correct, 1);
        assert!(correct.exists());
    }

    #[test]
    fn files_in_both_areas_are_left_alone() {
        let fx = fixture();
        index_row(&fx, "s1", Purpose::FileSummary);
        let wrong = fx.paths.project_dir("p1", Area::Chat).join(FILE);
        let correct = fx.paths.project_dir("p1", Area::Summaries).join(FILE);
        fs::write(&wrong, "a\n").unwrap();
        fs::write(&correct, "b\n").unwrap();

        let stats = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.present_in_both, 1);
        assert_eq!(fs::read_to_string(wrong).unwrap(), "a\n");
        assert_eq!(fs::read_to_string(correct).unwrap(), "b\n");
    }

    #[test]
    fn notes_belong_in_the_chat_area() {
        let fx = fixture();
        index_row(&fx, "n1", Purpose::Note);
        let wrong = fx.paths.project_dir("p1", Area::Summaries).join(FILE);
        fs::write(&wrong, "{}\n").unwrap();

        let stats = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.migrated, 1);
        assert!(fx.paths.project_dir("p1", Area::Chat).join(FILE).exists());
    }

    #[test]
    fn missing_files_are_counted_not_failed() {
        let fx = fixture();
        index_row(&fx, "s1", Purpose::FileSummary);
        let stats = HealingService::new(&fx.paths, &fx.index).run();
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.failed, 0);
    }
}
