//! Test output summarization.
//!
//! Extracts a short human-readable summary from the well-known runner
//! formats (Jest, pytest, unittest). Anything unrecognized keeps its raw
//! output in the stage log and reports `"unparsed"` here, so a format
//! drift never hides a passing or failing suite.

use regex::Regex;
use std::sync::OnceLock;

fn jest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Tests:\s+(?:(\d+)\s+failed,\s+)?(\d+)\s+passed,\s+(\d+)\s+total").unwrap()
    })
}

fn pytest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+passed(?:,\s+(\d+)\s+failed)?").unwrap())
}

fn pytest_failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+failed(?:,\s+(\d+)\s+passed)?").unwrap())
}

fn unittest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Ran\s+(\d+)\s+tests?\s+in").unwrap())
}

/// Parse a summary string out of test runner output.
pub fn parse_test_summary(output: &str) -> String {
    // Jest: "Tests:       32 passed, 32 total" / "Tests: 1 failed, 31 passed, 32 total"
    if let Some(caps) = jest_re().captures(output) {
        let passed = &caps[2];
        let total = &caps[3];
        return match caps.get(1) {
            Some(failed) => format!("{} failed, {passed} passed, {total} total", failed.as_str()),
            None => format!("{passed} passed, {total} total"),
        };
    }

    // pytest: "==== 12 passed in 0.34s ====" / "2 failed, 10 passed"
    if let Some(caps) = pytest_failed_re().captures(output) {
        let failed = &caps[1];
        return match caps.get(2) {
            Some(passed) => format!("{failed} failed, {} passed", passed.as_str()),
            None => format!("{failed} failed"),
        };
    }
    if let Some(caps) = pytest_re().captures(output) {
        return format!("{} passed", &caps[1]);
    }

    // unittest: "Ran 5 tests in 0.002s" followed by OK / FAILED
    if let Some(caps) = unittest_re().captures(output) {
        let ran = &caps[1];
        if output.contains("\nOK") || output.ends_with("OK") {
            return format!("{ran} passed, {ran} total");
        }
        return format!("{ran} ran, failures present");
    }

    "unparsed".to_string()
}
