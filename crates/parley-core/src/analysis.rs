// ABOUTME: Derives searchable metadata from exchange text: code blocks, commands, stack traces, topics, paths.
// ABOUTME: Produces a duplicate-detection hash over the normalized prompt.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::metadata::DerivedMetadata;

const SHELL_LANGUAGES: &[&str] = &["bash", "sh", "shell", "zsh", "console", "powershell", "ps1", "cmd"];

const TOPICS: &[(&str, &[&str])] = &[
    ("testing", &["unit test", "assert", "#[test]", "pytest", "junit", "mock"]),
    ("debugging", &["error", "exception", "stack trace", "panic", "segfault", "debug"]),
    ("performance", &["performance", "latency", "slow", "optimiz", "benchmark", "profil"]),
    ("database", &["sql", "sqlite", "postgres", "query", "index", "migration"]),
    ("build", &["cargo", "gradle", "maven", "npm", "compile", "linker"]),
    ("git", &["git ", "commit", "rebase", "merge conflict", "branch"]),
    ("concurrency", &["thread", "mutex", "async", "deadlock", "race condition", "coroutine"]),
    ("security", &["vulnerab", "injection", "xss", "csrf", "auth", "secret"]),
    ("refactoring", &["refactor", "rename", "extract method", "clean up", "cleanup"]),
];

/// Analyze the prompt and response of an exchange.
pub fn analyze(prompt: &str, response: &str) -> DerivedMetadata {
    let combined = format!("{prompt}\n{response}");
    let fences = fence_languages(&combined);
    let has_code_block = !fences.is_empty() || combined.contains("```");

    let languages: Vec<String> = fences
        .iter()
        .filter(|l| !l.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let has_command = fences.iter().any(|l| SHELL_LANGUAGES.contains(&l.as_str()))
        || combined.lines().any(|l| l.trim_start().starts_with("$ "));

    DerivedMetadata {
        has_code_block: Some(has_code_block),
        code_languages: Some(languages),
        has_command: Some(has_command),
        has_stacktrace: Some(has_stacktrace(&combined)),
        detected_topics: Some(detect_topics(&combined)),
        file_paths: Some(file_paths(&combined)),
        duplicate_hash: Some(duplicate_hash(prompt)),
    }
}

/// SHA-256 of the whitespace-collapsed, lower-cased prompt.
pub fn duplicate_hash(prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Language tags of opening code fences, lower-cased; untagged fences yield "".
fn fence_languages(text: &str) -> Vec<String> {
    let mut languages = Vec::new();
    let mut inside = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            if !inside {
                let tag = rest.split_whitespace().next().unwrap_or("");
                languages.push(tag.to_ascii_lowercase());
            }
            inside = !inside;
        }
    }
    languages
}

fn has_stacktrace(text: &str) -> bool {
    let jvm_frames = text
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("at ") && t.contains('(') && t.ends_with(')')
        })
        .count();
    jvm_frames >= 2
        || text.contains("Traceback (most recent call last)")
        || text.contains("panicked at")
        || text.contains("stack backtrace:")
}

fn detect_topics(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOPICS
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

fn file_paths(text: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for token in text.split(|c: char| c.is_whitespace() || "`'\"()[]{}<>,;".contains(c)) {
        let token = token.trim_end_matches(['.', ':']);
        if looks_like_path(token) {
            paths.insert(token.to_string());
        }
    }
    paths.into_iter().collect()
}

fn looks_like_path(token: &str) -> bool {
    if token.len() < 3 || token.contains("://") {
        return false;
    }
    if !token.contains('/') && !token.contains('\\') {
        return false;
    }
    let last = token.rsplit(['/', '\\']).next().unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=6).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_code_blocks_and_languages() {
        let response = "Try this:\n```rust\nfn main() {}\n```\nand\n```python\nprint(1)\n```\n";
        let meta = analyze("how?", response);
        assert_eq!(meta.has_code_block, Some(true));
        assert_eq!(meta.code_languages, Some(vec!["python".to_string(), "rust".to_string()]));
        assert_eq!(meta.has_command, Some(false));
    }

    #[test]
    fn detects_shell_commands() {
        let meta = analyze("run it", "```bash\ncargo test\n```");
        assert_eq!(meta.has_command, Some(true));

        let meta = analyze("$ ls -la", "ok");
        assert_eq!(meta.has_command, Some(true));
    }

    #[test]
    fn detects_stacktraces() {
        let jvm = "Exception in thread \"main\" java.lang.NullPointerException\n\tat com.foo.Bar.baz(Bar.java:10)\n\tat com.foo.Main.main(Main.java:3)";
        assert_eq!(analyze(jvm, "").has_stacktrace, Some(true));
        assert_eq!(
            analyze("thread 'main' panicked at src/main.rs:2:5", "").has_stacktrace,
            Some(true)
        );
        assert_eq!(analyze("no trace here", "").has_stacktrace, Some(false));
    }

    #[test]
    fn extracts_file_paths() {
        let meta = analyze("look at src/lib.rs and `crates/core/Cargo.toml`.", "see https://x.io/a.html");
        assert_eq!(
            meta.file_paths,
            Some(vec!["crates/core/Cargo.toml".to_string(), "src/lib.rs".to_string()])
        );
    }

    #[test]
    fn detects_topics() {
        let meta = analyze("why is this sqlite query slow?", "");
        let topics = meta.detected_topics.unwrap();
        assert!(topics.contains(&"database".to_string()));
        assert!(topics.contains(&"performance".to_string()));
    }

    #[test]
    fn duplicate_hash_ignores_whitespace_and_case() {
        assert_eq!(duplicate_hash("Hello   World\n"), duplicate_hash("hello world"));
        assert_ne!(duplicate_hash("hello"), duplicate_hash("world"));
    }
}
