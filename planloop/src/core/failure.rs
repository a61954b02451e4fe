//! Parsing of agent-authored failure reports.
//!
//! Agents that cannot finish a task end their final message with a block like:
//!
//! ```text
//! FAILED: could not wire the migration
//! Requirements:
//! - schema v2 is deployed
//! Problems:
//! - the v1 table is still referenced
//! Possible solutions:
//! - drop the view first
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub summary: String,
    pub requirements: String,
    pub problems: String,
    pub solutions: String,
}

static FAILED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*FAILED:[ \t]*(.*)$").expect("FAILED regex is valid")
});

#[derive(Clone, Copy)]
enum Section {
    Preamble,
    Requirements,
    Problems,
    Solutions,
}

/// Extract a failure report from `text`, if the last `FAILED:` marker is present.
pub fn parse_failure_report(text: &str) -> Option<FailureDetails> {
    let marker = FAILED_LINE.captures_iter(text).last()?;
    let whole = marker.get(0)?;
    let mut details = FailureDetails {
        summary: marker.get(1).map(|m| m.as_str().trim().to_string())?,
        ..FailureDetails::default()
    };

    let mut section = Section::Preamble;
    let mut preamble = Vec::new();
    for line in text[whole.end()..].lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("requirements:") {
            section = Section::Requirements;
            push_line(&mut details.requirements, after_colon(trimmed));
            continue;
        }
        if lower.starts_with("problems:") {
            section = Section::Problems;
            push_line(&mut details.problems, after_colon(trimmed));
            continue;
        }
        if lower.starts_with("possible solutions:") || lower.starts_with("solutions:") {
            section = Section::Solutions;
            push_line(&mut details.solutions, after_colon(trimmed));
            continue;
        }
        match section {
            Section::Preamble => preamble.push(trimmed),
            Section::Requirements => push_line(&mut details.requirements, trimmed),
            Section::Problems => push_line(&mut details.problems, trimmed),
            Section::Solutions => push_line(&mut details.solutions, trimmed),
        }
    }

    if details.summary.is_empty() {
        details.summary = preamble
            .into_iter()
            .find(|line| !line.is_empty())
            .unwrap_or("agent reported failure")
            .to_string();
    }
    Some(details)
}

fn after_colon(line: &str) -> &str {
    line.split_once(':').map_or("", |(_, rest)| rest.trim())
}

fn push_line(buf: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}
