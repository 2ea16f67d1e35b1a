// ABOUTME: Pluggable free-text search over exchanges. The engine only asks it for matching ids.
// ABOUTME: InMemorySearch is the default: case-insensitive term matching, newest first.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// Discovers exchange ids for a free-text query. Implementations must be
/// safe to share across threads.
pub trait TextSearch: Send + Sync {
    /// Add or replace the searchable text for an exchange.
    fn index(&self, id: &str, timestamp: DateTime<Utc>, text: &str);

    /// Ids matching `query`, best match first, at most `limit`.
    fn search(&self, query: &str, limit: usize) -> Vec<String>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    timestamp: DateTime<Utc>,
    text: String,
}

/// Keeps lower-cased text per exchange in memory. A document matches when
/// it contains every whitespace-separated query term.
#[derive(Default)]
pub struct InMemorySearch {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemorySearch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextSearch for InMemorySearch {
    fn index(&self, id: &str, timestamp: DateTime<Utc>, text: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            id.to_string(),
            Entry {
                timestamp,
                text: text.to_lowercase(),
            },
        );
    }

    fn search(&self, query: &str, limit: usize) -> Vec<String> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<(&String, &Entry)> = entries
            .iter()
            .filter(|(_, e)| terms.iter().all(|t| e.text.contains(t.as_str())))
            .collect();
        hits.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then_with(|| a.0.cmp(b.0)));
        hits.into_iter().take(limit).map(|(id, _)| id.clone()).collect()
    }

    fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn all_terms_must_match() {
        let search = InMemorySearch::new();
        search.index("a", at(1), "How do I fix this Borrow Checker error?");
        search.index("b", at(2), "borrow a cup of sugar");

        assert_eq!(search.search("borrow checker", 10), vec!["a"]);
        assert_eq!(search.search("BORROW", 10), vec!["b", "a"]);
        assert!(search.search("   ", 10).is_empty());
    }

    #[test]
    fn results_are_newest_first_and_limited() {
        let search = InMemorySearch::new();
        for i in 0..5 {
            search.index(&format!("e{i}"), at(i), "rust");
        }
        assert_eq!(search.search("rust", 2), vec!["e4", "e3"]);
    }

    #[test]
    fn reindex_replaces_and_clear_empties() {
        let search = InMemorySearch::new();
        search.index("a", at(1), "old text");
        search.index("a", at(1), "new text");
        assert!(search.search("old", 10).is_empty());
        assert_eq!(search.len(), 1);

        search.clear();
        assert!(search.is_empty());
    }
}
