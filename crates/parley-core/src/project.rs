// ABOUTME: Defines the Project that exchanges belong to, identified by a hash of its filesystem location.
// ABOUTME: The same directory always yields the same project id across runs and machines.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the hex-encoded project id.
const PROJECT_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_opened_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Project {
    /// Build a project for a directory. The name defaults to the last path component.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "default".to_string());
        Self::named(path, name)
    }

    pub fn named(path: &Path, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: project_id_for(path),
            name: name.into(),
            path: normalize(path),
            created_at: now,
            last_opened_at: now,
            is_active: true,
        }
    }
}

/// Stable project id: the first 16 hex characters of SHA-256 over the normalized path.
pub fn project_id_for(path: &Path) -> String {
    let digest = Sha256::digest(normalize(path).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(PROJECT_ID_LEN);
    id
}

fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn project_id_is_stable_and_short() {
        let a = project_id_for(Path::new("/home/dev/work/app"));
        let b = project_id_for(Path::new("/home/dev/work/app"));
        assert_eq!(a, b);
        assert_eq!(a.len(), PROJECT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn trailing_separator_does_not_change_identity() {
        assert_eq!(
            project_id_for(Path::new("/srv/app/")),
            project_id_for(Path::new("/srv/app"))
        );
    }

    #[test]
    fn different_paths_get_different_ids() {
        assert_ne!(
            project_id_for(Path::new("/srv/app")),
            project_id_for(Path::new("/srv/other"))
        );
    }

    #[test]
    fn from_path_uses_directory_name() {
        let project = Project::from_path(&PathBuf::from("/srv/widgets"));
        assert_eq!(project.name, "widgets");
        assert_eq!(project.path, "/srv/widgets");
        assert!(project.is_active);
    }
}
