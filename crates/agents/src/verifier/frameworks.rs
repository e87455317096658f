//! Test framework detection and output normalisation.

use neverdown_models::{TestCaseResult, TestOutcome};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static PYTEST_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\S+::\S+)\s+(PASSED|FAILED|SKIPPED|ERROR)").expect("regex compiles")
});

static PYTEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("regex compiles"));

static JEST_PASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"✓\s+(.+?)\s+\((\d+)\s*ms\)").expect("regex compiles"));

static JEST_FAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"✕\s+(.+)").expect("regex compiles"));

static UNITTEST_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\s+\(([^)]+)\)\s+\.\.\.\s+(ok|FAIL|ERROR|skipped)").expect("regex compiles")
});

/// Recognised test drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFramework {
    Pytest,
    Jest,
    Unittest,
}

impl TestFramework {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pytest => "pytest",
            Self::Jest => "jest",
            Self::Unittest => "unittest",
        }
    }

    /// Shell command executed inside the sandbox.
    #[must_use]
    pub fn command(self) -> Vec<&'static str> {
        match self {
            Self::Pytest => vec![
                "sh",
                "-c",
                "pip install -q -r requirements.txt 2>/dev/null; pip install -q pytest; python -m pytest -v --tb=short 2>&1",
            ],
            Self::Jest => vec!["sh", "-c", "npm ci && npm test 2>&1"],
            Self::Unittest => vec!["python", "-m", "unittest", "discover", "-v"],
        }
    }

    /// Normalise framework stdout into test records.
    #[must_use]
    pub fn parse_output(self, stdout: &str) -> Vec<TestCaseResult> {
        match self {
            Self::Pytest => parse_pytest(stdout),
            Self::Jest => parse_jest(stdout),
            Self::Unittest => parse_unittest(stdout),
        }
    }
}

/// Elect a test driver for the repository.
///
/// Order: root test-config manifests, then per-package manifests naming
/// the framework as a dev dependency, then conventionally named test
/// files. `None` means `no_tests`.
#[must_use]
pub fn detect(repo_path: &Path) -> Option<TestFramework> {
    // 1. Root manifests
    if repo_path.join("pytest.ini").exists() || repo_path.join("pyproject.toml").exists() {
        return Some(TestFramework::Pytest);
    }
    if repo_path.join("jest.config.js").exists() || repo_path.join("jest.config.ts").exists() {
        return Some(TestFramework::Jest);
    }

    // 2. Package manifest dev dependency
    if let Ok(raw) = std::fs::read_to_string(repo_path.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) {
            if pkg
                .get("devDependencies")
                .and_then(|d| d.get("jest"))
                .is_some()
            {
                return Some(TestFramework::Jest);
            }
        }
    }

    // 3. Conventional test files
    let mut has_pytest_files = false;
    let mut has_jest_files = false;
    let mut has_unittest_files = false;

    for entry in walkdir::WalkDir::new(repo_path)
        .max_depth(6)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "conftest.py" || (name.starts_with("test_") && name.ends_with(".py")) {
            has_pytest_files = true;
        } else if name.ends_with(".test.js") || name.ends_with(".test.ts") {
            has_jest_files = true;
        } else if name.ends_with("_test.py") {
            has_unittest_files = true;
        }
    }

    if has_pytest_files {
        return Some(TestFramework::Pytest);
    }
    if has_jest_files {
        return Some(TestFramework::Jest);
    }
    if has_unittest_files {
        return Some(TestFramework::Unittest);
    }

    None
}

fn parse_pytest(stdout: &str) -> Vec<TestCaseResult> {
    let mut tests: Vec<TestCaseResult> = PYTEST_CASE
        .captures_iter(stdout)
        .map(|caps| TestCaseResult {
            name: caps[1].to_string(),
            outcome: match &caps[2] {
                "PASSED" => TestOutcome::Passed,
                "FAILED" => TestOutcome::Failed,
                "SKIPPED" => TestOutcome::Skipped,
                _ => TestOutcome::Error,
            },
            duration_ms: 0,
            message: None,
        })
        .collect();

    // Quiet runs still print a summary line
    if tests.is_empty() {
        if let Some(caps) = PYTEST_SUMMARY.captures(stdout) {
            if caps[1].parse::<u32>().unwrap_or(0) > 0 {
                tests.push(TestCaseResult {
                    name: "pytest_summary".to_string(),
                    outcome: TestOutcome::Passed,
                    duration_ms: 0,
                    message: None,
                });
            }
        }
    }

    tests
}

fn parse_jest(stdout: &str) -> Vec<TestCaseResult> {
    let mut tests: Vec<TestCaseResult> = JEST_PASS
        .captures_iter(stdout)
        .map(|caps| TestCaseResult {
            name: caps[1].to_string(),
            outcome: TestOutcome::Passed,
            duration_ms: caps[2].parse().unwrap_or(0),
            message: None,
        })
        .collect();

    tests.extend(JEST_FAIL.captures_iter(stdout).map(|caps| TestCaseResult {
        name: caps[1].trim().to_string(),
        outcome: TestOutcome::Failed,
        duration_ms: 0,
        message: None,
    }));

    tests
}

fn parse_unittest(stdout: &str) -> Vec<TestCaseResult> {
    UNITTEST_CASE
        .captures_iter(stdout)
        .map(|caps| TestCaseResult {
            name: format!("{}.{}", &caps[2], &caps[1]),
            outcome: match &caps[3] {
                "ok" => TestOutcome::Passed,
                "FAIL" => TestOutcome::Failed,
                "skipped" => TestOutcome::Skipped,
                _ => TestOutcome::Error,
            },
            duration_ms: 0,
            message: None,
        })
        .collect()
}
