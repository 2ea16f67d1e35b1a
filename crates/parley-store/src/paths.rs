// ABOUTME: Maps (project, purpose, time) to weekly-partitioned log files in the chat or summaries area.
// ABOUTME: Resolves existing files with a fallback to the other area for records misrouted in the past.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use parley_core::Purpose;

/// Prefix of every log file name.
pub const LOG_KIND: &str = "exchanges";

/// Extension of every log file.
pub const LOG_EXTENSION: &str = "jsonl";

/// The two logical storage areas under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Chat,
    Summaries,
}

impl Area {
    pub fn for_purpose(purpose: &Purpose) -> Self {
        if purpose.is_summary() {
            Area::Summaries
        } else {
            Area::Chat
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Area::Chat => "chat",
            Area::Summaries => "summaries",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Area::Chat => Area::Summaries,
            Area::Summaries => Area::Chat,
        }
    }

    pub fn all() -> [Area; 2] {
        [Area::Chat, Area::Summaries]
    }
}

/// Computes every path the engine reads or writes under a storage root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn area_dir(&self, area: Area) -> PathBuf {
        self.root.join(area.dir_name())
    }

    pub fn project_dir(&self, project_id: &str, area: Area) -> PathBuf {
        self.area_dir(area).join(project_id)
    }

    /// Partition file name for the ISO week containing `at`,
    /// e.g. `exchanges-2026-W07.jsonl`.
    pub fn file_name_for(at: DateTime<Utc>) -> String {
        let week = at.iso_week();
        format!(
            "{}-{}-W{:02}.{}",
            LOG_KIND,
            week.year(),
            week.week(),
            LOG_EXTENSION
        )
    }

    pub fn file_for_purpose(&self, project_id: &str, purpose: &Purpose, at: DateTime<Utc>) -> PathBuf {
        self.project_dir(project_id, Area::for_purpose(purpose))
            .join(Self::file_name_for(at))
    }

    /// The active partition file for the current week.
    pub fn current_file_for_purpose(&self, project_id: &str, purpose: &Purpose) -> PathBuf {
        self.file_for_purpose(project_id, purpose, Utc::now())
    }

    pub fn expected_path(&self, project_id: &str, file_name: &str, purpose: &Purpose) -> PathBuf {
        self.project_dir(project_id, Area::for_purpose(purpose))
            .join(file_name)
    }

    pub fn alternate_path(&self, project_id: &str, file_name: &str, purpose: &Purpose) -> PathBuf {
        self.project_dir(project_id, Area::for_purpose(purpose).other())
            .join(file_name)
    }

    /// Locate a log file. Tries the area the purpose routes to, then the other
    /// area. When neither exists the expected path is returned and the caller
    /// treats it as not found.
    pub fn resolve_file(&self, project_id: &str, file_name: &str, purpose: &Purpose) -> PathBuf {
        let expected = self.expected_path(project_id, file_name, purpose);
        if expected.exists() {
            return expected;
        }

        let alternate = self.alternate_path(project_id, file_name, purpose);
        if alternate.exists() {
            tracing::debug!(
                project_id,
                file_name,
                purpose = %purpose,
                "log file found in fallback area"
            );
            return alternate;
        }

        expected
    }

    pub fn ensure_root_directories(&self) -> io::Result<()> {
        for area in Area::all() {
            fs::create_dir_all(self.area_dir(area))?;
        }
        Ok(())
    }

    pub fn ensure_project_directories(&self, project_id: &str) -> io::Result<()> {
        for area in Area::all() {
            fs::create_dir_all(self.project_dir(project_id, area))?;
        }
        Ok(())
    }

    /// Project id implied by a log file's location: `<root>/<area>/<projectId>/<file>`.
    pub fn infer_project_id(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let area = components.next()?.as_os_str().to_str()?;
        if !Area::all().iter().any(|a| a.dir_name() == area) {
            return None;
        }
        let project = components.next()?.as_os_str().to_str()?;
        components.next()?;
        Some(project.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn file_name_uses_iso_week_year() {
        // 2021-01-03 belongs to ISO week 53 of 2020.
        let at = Utc.with_ymd_and_hms(2021, 1, 3, 12, 0, 0).unwrap();
        assert_eq!(PathResolver::file_name_for(at), "exchanges-2020-W53.jsonl");

        let at = Utc.with_ymd_and_hms(2026, 2, 11, 0, 0, 0).unwrap();
        assert_eq!(PathResolver::file_name_for(at), "exchanges-2026-W07.jsonl");
    }

    #[test]
    fn purpose_routes_to_area() {
        let resolver = PathResolver::new("/data");
        let at = Utc.with_ymd_and_hms(2026, 2, 11, 0, 0, 0).unwrap();

        let chat = resolver.file_for_purpose("p1", &Purpose::Chat, at);
        assert_eq!(chat, PathBuf::from("/data/chat/p1/exchanges-2026-W07.jsonl"));

        let summary = resolver.file_for_purpose("p1", &Purpose::FileSummary, at);
        assert_eq!(summary, PathBuf::from("/data/summaries/p1/exchanges-2026-W07.jsonl"));

        let note = resolver.file_for_purpose("p1", &Purpose::Note, at);
        assert!(note.starts_with("/data/chat"));
    }

    #[test]
    fn resolve_prefers_expected_then_alternate() {
        let dir = TempDir::new().unwrap();
        let resolver = PathResolver::new(dir.path());
        resolver.ensure_project_directories("p1").unwrap();
        let name = "exchanges-2026-W07.jsonl";

        // Neither exists: expected path comes back.
        let resolved = resolver.resolve_file("p1", name, &Purpose::ModuleSummary);
        assert_eq!(resolved, resolver.expected_path("p1", name, &Purpose::ModuleSummary));
        assert!(!resolved.exists());

        // Only the wrong area has it.
        let wrong = resolver.project_dir("p1", Area::Chat).join(name);
        fs::write(&wrong, "{}\n").unwrap();
        assert_eq!(resolver.resolve_file("p1", name, &Purpose::ModuleSummary), wrong);

        // Both exist: expected wins.
        let right = resolver.project_dir("p1", Area::Summaries).join(name);
        fs::write(&right, "{}\n").unwrap();
        assert_eq!(resolver.resolve_file("p1", name, &Purpose::ModuleSummary), right);
    }

    #[test]
    fn ensure_directories_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let resolver = PathResolver::new(dir.path().join("root"));
        resolver.ensure_root_directories().unwrap();
        resolver.ensure_root_directories().unwrap();
        resolver.ensure_project_directories("abc").unwrap();
        resolver.ensure_project_directories("abc").unwrap();
        assert!(resolver.project_dir("abc", Area::Chat).is_dir());
        assert!(resolver.project_dir("abc", Area::Summaries).is_dir());
    }

    #[test]
    fn infers_project_from_layout() {
        let resolver = PathResolver::new("/data");
        let file = PathBuf::from("/data/summaries/abc123/exchanges-2026-W07.jsonl");
        assert_eq!(resolver.infer_project_id(&file).as_deref(), Some("abc123"));

        assert_eq!(resolver.infer_project_id(Path::new("/data/other/x/f.jsonl")), None);
        assert_eq!(resolver.infer_project_id(Path::new("/data/chat/f.jsonl")), None);
    }
}
