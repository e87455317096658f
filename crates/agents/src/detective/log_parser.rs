//! Multi-format log parsing and error categorisation.
//!
//! Three recognisers run over the raw log text: Python-style tracebacks,
//! JavaScript-style `at func (path:line:col)` stacks, and a generic
//! `ERROR:`-line fallback. The recogniser that attributes errors to file
//! paths wins. A JSON-lines mode handles structured logging output.

use neverdown_models::{ErrorInfo, FailureCategory};
use regex::Regex;
use std::sync::LazyLock;

static PYTHON_ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\w+(?:Error|Exception|Warning)): (.+)$").expect("regex compiles")
});

static PYTHON_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*File "([^"]+)", line (\d+), in (\w+)"#).expect("regex compiles")
});

static JS_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^((?:\w+)?Error): (.+)$").expect("regex compiles"));

static JS_STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s+at (?:(.+?) \()?((?:[A-Za-z]:)?[^:\s)]+):(\d+):\d+\)?$")
        .expect("regex compiles")
});

static GENERIC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:ERROR|Error|error|FATAL|Fatal|fatal)[:\s]+(.+)").expect("regex compiles")
});

static FILE_LINE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s:]+):(\d+)").expect("regex compiles"));

/// Path fragments that mark a frame as library code rather than user code.
const LIBRARY_MARKERS: &[&str] = &[
    "site-packages",
    "node_modules",
    "lib/python",
    "/usr/lib",
    "venv/",
    ".venv/",
    "anaconda",
    "miniconda",
];

/// Whether a path points into library code.
#[must_use]
pub fn is_library_path(path: &str) -> bool {
    LIBRARY_MARKERS.iter().any(|m| path.contains(m))
}

/// Stateless multi-format log parser.
pub struct LogParser;

impl LogParser {
    /// Extract errors from raw log content.
    ///
    /// Recognisers are preferred in order of how well they attribute
    /// errors to files: a parser that found paths beats one that did not.
    #[must_use]
    pub fn parse(content: &str) -> Vec<ErrorInfo> {
        let python_errors = Self::parse_python_traceback(content);
        let js_errors = Self::parse_js_stack(content);

        let python_has_paths = python_errors.iter().any(|e| e.file_path.is_some());
        let js_has_paths = js_errors.iter().any(|e| e.file_path.is_some());

        let errors = if python_has_paths {
            python_errors
        } else if js_has_paths {
            js_errors
        } else if !python_errors.is_empty() {
            python_errors
        } else {
            js_errors
        };

        if errors.is_empty() {
            return Self::parse_generic(content);
        }
        errors
    }

    fn parse_python_traceback(content: &str) -> Vec<ErrorInfo> {
        let mut errors = Vec::new();

        for caps in PYTHON_ERROR_LINE.captures_iter(content) {
            let whole = caps.get(0).expect("group 0");
            let kind = caps[1].to_string();
            let message = caps[2].to_string();

            let mut file_path = None;
            let mut line = None;
            let mut stack_trace = None;

            if let Some(stack_start) =
                content[..whole.start()].rfind("Traceback (most recent call last):")
            {
                let trace = &content[stack_start..whole.end()];
                stack_trace = Some(trace.to_string());

                let frames: Vec<_> = PYTHON_FRAME.captures_iter(trace).collect();

                // Most specific user frame: last frame outside library code
                for frame in frames.iter().rev() {
                    if !is_library_path(&frame[1]) {
                        file_path = Some(frame[1].to_string());
                        line = frame[2].parse::<u32>().ok();
                        break;
                    }
                }

                // No user frame: fall back to the innermost frame
                if file_path.is_none() {
                    if let Some(frame) = frames.last() {
                        file_path = Some(frame[1].to_string());
                        line = frame[2].parse::<u32>().ok();
                    }
                }
            }

            errors.push(ErrorInfo {
                kind,
                message,
                file_path,
                line,
                stack_trace,
            });
        }

        errors
    }

    fn parse_js_stack(content: &str) -> Vec<ErrorInfo> {
        let mut errors = Vec::new();

        for caps in JS_ERROR.captures_iter(content) {
            let whole = caps.get(0).expect("group 0");
            let kind = caps[1].to_string();
            let message = caps[2].to_string();

            let remaining = &content[whole.end()..];
            let frames: Vec<(String, u32)> = JS_STACK_FRAME
                .captures_iter(remaining)
                .take(20)
                .map(|f| (f[2].to_string(), f[3].parse::<u32>().unwrap_or(0)))
                .collect();

            let mut file_path = None;
            let mut line = None;
            for (path, frame_line) in &frames {
                if !path.contains("node_modules") {
                    file_path = Some(path.trim_start_matches('/').to_string());
                    line = Some(*frame_line);
                    break;
                }
            }
            if file_path.is_none() {
                if let Some((path, frame_line)) = frames.first() {
                    file_path = Some(path.trim_start_matches('/').to_string());
                    line = Some(*frame_line);
                }
            }

            let stack_trace = if frames.is_empty() {
                None
            } else {
                Some(remaining.chars().take(500).collect())
            };

            errors.push(ErrorInfo {
                kind,
                message,
                file_path,
                line,
                stack_trace,
            });
        }

        errors
    }

    fn parse_generic(content: &str) -> Vec<ErrorInfo> {
        let mut errors: Vec<ErrorInfo> = Vec::new();
        let mut seen_messages = std::collections::HashSet::new();

        for caps in GENERIC_ERROR.captures_iter(content) {
            let message = caps[1].trim().to_string();
            if !seen_messages.insert(message.clone()) {
                continue;
            }

            let (file_path, line) = FILE_LINE_TOKEN
                .captures(&message)
                .map_or((None, None), |fc| {
                    (Some(fc[1].to_string()), fc[2].parse::<u32>().ok())
                });

            errors.push(ErrorInfo {
                kind: "Error".to_string(),
                message,
                file_path,
                line,
                stack_trace: None,
            });
        }

        errors
    }

    /// Parse JSON-lines structured logs: one object per line, interpreted
    /// only at error-like levels.
    #[must_use]
    pub fn parse_json_lines(content: &str) -> Vec<ErrorInfo> {
        let mut errors = Vec::new();

        for raw in content.lines() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let Ok(data) = serde_json::from_str::<serde_json::Value>(raw) else {
                continue;
            };

            let level = data
                .get("level")
                .or_else(|| data.get("levelname"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            if !matches!(level.as_str(), "error" | "critical" | "fatal" | "exception") {
                continue;
            }

            let kind = string_field(&data, &["exception_type", "exc_type"])
                .unwrap_or_else(|| "Error".to_string());
            let message = string_field(&data, &["message", "msg", "error"]).unwrap_or_default();
            let file_path = string_field(&data, &["filename", "file", "pathname"]);
            let line = data
                .get("lineno")
                .or_else(|| data.get("line_number"))
                .or_else(|| data.get("line"))
                .and_then(value_as_u32);
            let stack_trace = string_field(&data, &["traceback", "stack_trace"]);

            errors.push(ErrorInfo {
                kind,
                message,
                file_path,
                line,
                stack_trace,
            });
        }

        errors
    }

    /// Assign a failure category from the error kind and message.
    #[must_use]
    pub fn categorize(error: &ErrorInfo) -> FailureCategory {
        let kind = error.kind.to_lowercase();
        let message = error.message.to_lowercase();

        if kind.contains("nameerror") {
            return FailureCategory::Name;
        }
        if kind.contains("typeerror") {
            return FailureCategory::Type;
        }
        if kind.contains("syntaxerror") {
            return FailureCategory::Syntax;
        }
        if kind.contains("importerror") || kind.contains("modulenotfounderror") {
            return FailureCategory::Import;
        }
        if kind.contains("attributeerror") || kind.contains("keyerror") || kind.contains("indexerror")
        {
            return FailureCategory::Logic;
        }

        if ["database", "sql", "postgres", "mysql", "mongo"]
            .iter()
            .any(|db| kind.contains(db))
        {
            return FailureCategory::Database;
        }
        if message.contains("connection") || message.contains("connect") {
            return FailureCategory::Connection;
        }
        if kind.contains("timeout") || message.contains("timeout") {
            return FailureCategory::Timeout;
        }
        if kind.contains("permission") || message.contains("permission denied") {
            return FailureCategory::Permission;
        }
        if message.contains("config") || message.contains("configuration") {
            return FailureCategory::ConfigMismatch;
        }
        if message.contains("environment") || message.contains(" env ") {
            return FailureCategory::ConfigMismatch;
        }
        if message.contains("dependency") || message.contains("incompatible version") {
            return FailureCategory::DependencyVersion;
        }

        FailureCategory::Logic
    }
}

fn string_field(data: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        data.get(k).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        })
    })
}

fn value_as_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON_TRACE: &str = r#"Some log preamble
Traceback (most recent call last):
  File "/usr/lib/python3.11/runpy.py", line 196, in _run_module_as_main
    return _run_code(code, main_globals, None)
  File "backend/app.py", line 42, in handle_request
    return render(PORT)
  File "/venv/lib/site-packages/flask/app.py", line 2548, in render
    raise err
NameError: name 'PORT' is not defined
"#;

    #[test]
    fn test_python_traceback_elects_user_frame() {
        let errors = LogParser::parse(PYTHON_TRACE);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.kind, "NameError");
        assert_eq!(error.message, "name 'PORT' is not defined");
        // The most specific user frame wins over the inner site-packages frame
        assert_eq!(error.file_path.as_deref(), Some("backend/app.py"));
        assert_eq!(error.line, Some(42));
        assert!(error.stack_trace.is_some());
    }

    #[test]
    fn test_python_all_library_frames_falls_back_to_innermost() {
        let trace = "Traceback (most recent call last):\n  File \"/usr/lib/python3/a.py\", line 1, in f\n    x\n  File \"/venv/lib/site-packages/b.py\", line 9, in g\n    y\nValueError: bad\n";
        let errors = LogParser::parse(trace);
        assert_eq!(errors[0].file_path.as_deref(), Some("/venv/lib/site-packages/b.py"));
        assert_eq!(errors[0].line, Some(9));
    }

    #[test]
    fn test_js_stack_skips_node_modules() {
        let log = "Error: PORT is not defined\n    at Object.<anonymous> (/app/node_modules/express/lib/router.js:12:3)\n    at handle (/backend/index.js:15:10)\n";
        let errors = LogParser::parse(log);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file_path.as_deref(), Some("backend/index.js"));
        assert_eq!(errors[0].line, Some(15));
    }

    #[test]
    fn test_generic_fallback_extracts_path_token() {
        let log = "2026-01-01 ERROR: failed to open config src/main.rs:88 during boot\n";
        let errors = LogParser::parse(log);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file_path.as_deref(), Some("src/main.rs"));
        assert_eq!(errors[0].line, Some(88));
    }

    #[test]
    fn test_generic_deduplicates_messages() {
        let log = "ERROR: disk full\nERROR: disk full\nERROR: disk full\n";
        let errors = LogParser::parse(log);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_json_lines_only_error_levels() {
        let log = concat!(
            "{\"level\": \"info\", \"message\": \"booted\"}\n",
            "{\"level\": \"error\", \"message\": \"boom\", \"filename\": \"svc/worker.py\", \"lineno\": 7}\n",
            "not json at all\n",
        );
        let errors = LogParser::parse_json_lines(log);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file_path.as_deref(), Some("svc/worker.py"));
        assert_eq!(errors[0].line, Some(7));
    }

    #[test]
    fn test_json_lines_string_lineno() {
        let log = "{\"level\": \"critical\", \"msg\": \"x\", \"line\": \"33\"}\n";
        let errors = LogParser::parse_json_lines(log);
        assert_eq!(errors[0].line, Some(33));
    }

    fn err(kind: &str, message: &str) -> ErrorInfo {
        ErrorInfo {
            kind: kind.to_string(),
            message: message.to_string(),
            file_path: None,
            line: None,
            stack_trace: None,
        }
    }

    #[test]
    fn test_categorization_ruleset() {
        assert_eq!(
            LogParser::categorize(&err("NameError", "name 'PORT' is not defined")),
            FailureCategory::Name
        );
        assert_eq!(
            LogParser::categorize(&err("TypeError", "cannot read property")),
            FailureCategory::Type
        );
        assert_eq!(
            LogParser::categorize(&err("SyntaxError", "unexpected token")),
            FailureCategory::Syntax
        );
        assert_eq!(
            LogParser::categorize(&err("ModuleNotFoundError", "no module named requests")),
            FailureCategory::Import
        );
        assert_eq!(
            LogParser::categorize(&err("TimeoutError", "operation timed out")),
            FailureCategory::Timeout
        );
        assert_eq!(
            LogParser::categorize(&err("OperationalError", "could not timeout")),
            FailureCategory::Timeout
        );
        assert_eq!(
            LogParser::categorize(&err("PostgresError", "relation missing")),
            FailureCategory::Database
        );
        assert_eq!(
            LogParser::categorize(&err("OSError", "connection refused")),
            FailureCategory::Connection
        );
        assert_eq!(
            LogParser::categorize(&err("PermissionError", "cannot write")),
            FailureCategory::Permission
        );
        assert_eq!(
            LogParser::categorize(&err("RuntimeError", "missing configuration value")),
            FailureCategory::ConfigMismatch
        );
        assert_eq!(
            LogParser::categorize(&err("KeyError", "'user_id'")),
            FailureCategory::Logic
        );
        assert_eq!(
            LogParser::categorize(&err("RuntimeError", "something odd")),
            FailureCategory::Logic
        );
    }
}
