//! Structural rules for `conductor/core`

use std::fs;

use architectural_enforcement::{find_in_production_code, workspace_root, Violation};

fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_no_blocking_sleep_in_core() {
    let src = workspace_root().join("conductor/core/src");
    let violations = find_in_production_code(&src, &["std::thread::sleep", "thread::sleep("]);
    assert!(
        violations.is_empty(),
        "blocking sleep in core:\n{}",
        report(&violations)
    );
}

#[test]
fn test_no_unwrap_or_expect_in_core() {
    let src = workspace_root().join("conductor/core/src");
    let violations = find_in_production_code(&src, &[".unwrap()", ".expect("]);
    assert!(
        violations.is_empty(),
        "unwrap/expect outside tests:\n{}",
        report(&violations)
    );
}

#[test]
fn test_core_uses_tokio_clock() {
    let src = workspace_root().join("conductor/core/src");
    let violations = find_in_production_code(&src, &["std::time::Instant"]);
    assert!(
        violations.is_empty(),
        "std::time::Instant bypasses the paused test clock:\n{}",
        report(&violations)
    );
}

#[test]
fn test_core_has_no_ui_dependencies() {
    let manifest = fs::read_to_string(workspace_root().join("conductor/core/Cargo.toml"))
        .expect("core manifest");
    for forbidden in ["ratatui", "crossterm", "clap", "tracing-subscriber"] {
        assert!(
            !manifest.contains(forbidden),
            "conductor/core must not depend on {forbidden}"
        );
    }
}
