//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the conductor core:
//! - No blocking sleeps in library code; waiting happens on the tokio clock
//! - No UI framework dependencies in the core crate
//! - No `unwrap()`/`expect()` outside test code
//!
//! The helpers here walk the workspace sources; the rules live in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Root of the workspace
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under `dir`, sorted
#[must_use]
pub fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect();
    files.sort();
    files
}

/// Source text with the `#[cfg(test)]` module cut off
///
/// Test modules sit at the bottom of each file, so everything from the first
/// `#[cfg(test)]` on is dropped.
#[must_use]
pub fn production_code(source: &str) -> &str {
    match source.find("#[cfg(test)]") {
        Some(index) => &source[..index],
        None => source,
    }
}

/// A rule violation: file, 1-based line, offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the violation is in
    pub path: PathBuf,
    /// Line number
    pub line: usize,
    /// The line itself
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text.trim())
    }
}

/// Production lines under `dir` containing any of `needles`
///
/// Doc comments and line comments are skipped.
#[must_use]
pub fn find_in_production_code(dir: &Path, needles: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in rust_sources(dir) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (index, line) in production_code(&source).lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") {
                continue;
            }
            if needles.iter().any(|needle| line.contains(needle)) {
                violations.push(Violation {
                    path: path.clone(),
                    line: index + 1,
                    text: line.to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_code_drops_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        assert_eq!(production_code(source), "fn a() {}\n");
    }

    #[test]
    fn test_workspace_root_has_core() {
        assert!(workspace_root().join("conductor/core/src/lib.rs").exists());
    }
}
