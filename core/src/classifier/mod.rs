//! Error Classifier — maps raw tool output + exit code to a
//! `ClassifiedError`.
//!
//! The rule table is an ordered list of (category, pattern, extractor)
//! entries; the first pattern to match wins. Order encodes the specificity
//! hierarchy `syntax → type → import → runtime → assertion → timeout →
//! permission → resource → network`, the same shape as the teacher's
//! `feedback::error_parser` rule table, generalized from rustc-specific
//! categories to this system's generic taxonomy.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{ClassifiedError, ErrorCategory};

struct Rule {
    category: ErrorCategory,
    pattern: &'static LazyLock<Regex>,
}

static SYNTAX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)SyntaxError|Unexpected token|Parse error|unterminated").unwrap()
});
static TYPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TypeError:|is not a function|is not assignable to type").unwrap());
static IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Cannot find module|ModuleNotFoundError|Cannot resolve|Module not found").unwrap()
});
static RUNTIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ReferenceError:|undefined is not|is not defined|null pointer|panicked at").unwrap()
});
static ASSERTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)AssertionError|expect\(.*\)\.to|Expected[:\s].*Received|assertion failed").unwrap()
});
static TIMEOUT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed? ?out|Timeout exceeded|exceeded timeout").unwrap());
static PERMISSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission denied|EACCES|not permitted|access is denied").unwrap()
});
static RESOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ENOSPC|out of memory|too many open files|EMFILE|resource exhausted").unwrap()
});
static NETWORK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ECONNREFUSED|ETIMEDOUT|network error|fetch failed|DNS").unwrap()
});

static LOCATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:at .*?\()?([^\s():]+\.[a-zA-Z0-9]+):(\d+):(\d+)\)?").unwrap()
});
static EXPECTED_ACTUAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Expected[:\s]+(.*?)\n.*?(?:Received|Actual)[:\s]+(.*?)(?:\n|$)").unwrap()
});
static MISSING_MODULE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:Cannot find module|Cannot resolve|Module not found.*resolve) ['"]([^'"]+)['"]"#).unwrap()
});

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule { category: ErrorCategory::Syntax, pattern: &SYNTAX_PATTERN },
        Rule { category: ErrorCategory::Type, pattern: &TYPE_PATTERN },
        Rule { category: ErrorCategory::Import, pattern: &IMPORT_PATTERN },
        Rule { category: ErrorCategory::Runtime, pattern: &RUNTIME_PATTERN },
        Rule { category: ErrorCategory::Assertion, pattern: &ASSERTION_PATTERN },
        Rule { category: ErrorCategory::Timeout, pattern: &TIMEOUT_PATTERN },
        Rule { category: ErrorCategory::Permission, pattern: &PERMISSION_PATTERN },
        Rule { category: ErrorCategory::Resource, pattern: &RESOURCE_PATTERN },
        Rule { category: ErrorCategory::Network, pattern: &NETWORK_PATTERN },
    ]
});

/// An "error start" line: the shape `analyze_multiple` splits blocks on.
static ERROR_START_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:[A-Za-z]+Error:|FAIL\b|✗|×)").unwrap()
});

fn extract_location(stderr: &str) -> (Option<String>, Option<u32>, Option<u32>) {
    match LOCATION_PATTERN.captures(stderr) {
        Some(caps) => (
            Some(caps[1].to_string()),
            caps[2].parse().ok(),
            caps[3].parse().ok(),
        ),
        None => (None, None, None),
    }
}

fn extract_expected_actual(stderr: &str) -> (Option<String>, Option<String>) {
    match EXPECTED_ACTUAL_PATTERN.captures(stderr) {
        Some(caps) => (
            Some(caps[1].trim().to_string()),
            Some(caps[2].trim().to_string()),
        ),
        None => (None, None),
    }
}

fn extract_suggestion(category: ErrorCategory, stderr: &str) -> Option<String> {
    match category {
        ErrorCategory::Import => MISSING_MODULE_PATTERN
            .captures(stderr)
            .map(|caps| format!("install or fix the import path for `{}`", &caps[1])),
        _ => None,
    }
}

/// Classify a single block of raw tool output.
pub fn classify(stderr: &str, exit_code: i32) -> ClassifiedError {
    let category = RULES
        .iter()
        .find(|rule| rule.pattern.is_match(stderr))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::Unknown);

    let (file, line, column) = extract_location(stderr);
    let (expected, actual) = if category == ErrorCategory::Assertion {
        extract_expected_actual(stderr)
    } else {
        (None, None)
    };
    let suggestion = extract_suggestion(category, stderr);

    let message = stderr.lines().next().unwrap_or(stderr).trim().to_string();

    let _ = exit_code; // exit code doesn't currently discriminate any rule; kept for contract parity.

    ClassifiedError {
        category,
        message,
        file,
        line,
        column,
        expected,
        actual,
        suggestion,
        original_error: stderr.to_string(),
    }
}

/// Partition `stderr` into blocks at "error start" lines and classify each
/// independently; if none match, classify the whole blob as one error.
pub fn analyze_multiple(stderr: &str, exit_code: i32) -> Vec<ClassifiedError> {
    let starts: Vec<usize> = ERROR_START_PATTERN
        .find_iter(stderr)
        .map(|m| m.start())
        .collect();

    if starts.is_empty() {
        return vec![classify(stderr, exit_code)];
    }

    let mut blocks = Vec::new();
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(stderr.len());
        blocks.push(&stderr[start..end]);
    }
    blocks.into_iter().map(|b| classify(b, exit_code)).collect()
}

/// The prompt fragment to splice into a Fixer prompt for this category.
pub fn get_fix_strategy(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Syntax => "Fix the syntax error so the file parses. Do not change unrelated logic.",
        ErrorCategory::Type => "Resolve the type error by correcting the mismatched type, not by casting it away.",
        ErrorCategory::Import => "Fix the import: correct the module path or add the missing dependency reference.",
        ErrorCategory::Runtime => "Fix the runtime error: guard against the undefined/null value or reference that caused it.",
        ErrorCategory::Assertion => "The test failed an assertion. If the implementation is wrong, fix it; only touch the test if its expectation is incorrect.",
        ErrorCategory::Timeout => "The operation exceeded its time budget. Reduce unnecessary blocking work or unbounded loops.",
        ErrorCategory::Permission => "Fix the permission error: the code is writing/reading somewhere it should not, or needs a different mode.",
        ErrorCategory::Resource => "Fix the resource exhaustion: release handles, avoid unbounded buffers, or reduce concurrent usage.",
        ErrorCategory::Network => "Fix the network failure: handle the unreachable endpoint or add appropriate retry/backoff.",
        ErrorCategory::Unknown => "Diagnose the failure from the raw output and apply the most conservative fix that addresses it.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_error_beats_runtime_pattern_on_overlapping_text() {
        // S7: "TypeError: Cannot read property 'x' of undefined" must be
        // `type`, not `runtime`, because the type rule precedes the
        // runtime rule and `undefined` alone would also satisfy it.
        let err = classify("TypeError: Cannot read property 'x' of undefined", 1);
        assert_eq!(err.category, ErrorCategory::Type);
    }

    #[test]
    fn unmatched_text_classifies_as_unknown() {
        let err = classify("something inexplicable happened", 1);
        assert_eq!(err.category, ErrorCategory::Unknown);
    }

    #[test]
    fn classification_is_deterministic_for_any_input() {
        // Invariant 7: category is determined solely by stderr.
        let a = classify("ECONNREFUSED at socket", 1);
        let b = classify("ECONNREFUSED at socket", 137);
        assert_eq!(a.category, b.category);
        assert_eq!(a.category, ErrorCategory::Network);
    }

    #[test]
    fn extracts_file_line_column() {
        let err = classify("Error: boom\n  at build (src/foo.ts:12:5)", 1);
        assert_eq!(err.file.as_deref(), Some("src/foo.ts"));
        assert_eq!(err.line, Some(12));
        assert_eq!(err.column, Some(5));
    }

    #[test]
    fn analyze_multiple_splits_on_error_starts() {
        let stderr = "TypeError: first\nmore context\nReferenceError: second\nmore";
        let errors = analyze_multiple(stderr, 1);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].category, ErrorCategory::Type);
        assert_eq!(errors[1].category, ErrorCategory::Runtime);
    }

    #[test]
    fn analyze_multiple_falls_back_to_single_block() {
        let errors = analyze_multiple("no recognizable marker here", 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn import_suggestion_names_the_missing_module() {
        let err = classify("Cannot find module 'left-pad'", 1);
        assert_eq!(err.category, ErrorCategory::Import);
        assert!(err.suggestion.unwrap().contains("left-pad"));
    }
}
