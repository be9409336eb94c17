//! Bot review body parsing.
//!
//! Review bots emit structured findings of the form:
//!
//! ```text
//! File: src/handlers/payment.ts
//! Line: 42
//! Issue: unvalidated amount before charge
//! Confidence Score: 4/5
//! ```
//!
//! The confidence is normalized to a 0–5 scale regardless of the bot's own
//! denominator.

use std::sync::OnceLock;

use regex::Regex;

/// One structured finding from a review body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewFinding {
    pub file: String,
    pub line: Option<u64>,
    pub description: String,
    /// Normalized 0–5.
    pub confidence: Option<u8>,
}

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*File:\s*(.+?)\s*$").expect("valid regex"))
}

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Line:\s*(\d+)\s*$").expect("valid regex"))
}

fn issue_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Issue:\s*(.+?)\s*$").expect("valid regex"))
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*Confidence Score:\s*(\d+)\s*/\s*(\d+)\s*$").expect("valid regex")
    })
}

/// Parse a structured finding. Absent `File:` means no finding.
#[must_use]
pub fn parse_review_body(body: &str) -> Option<ReviewFinding> {
    let file = file_re().captures(body)?.get(1)?.as_str().to_string();
    let line = line_re()
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let description = issue_re()
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    Some(ReviewFinding {
        file,
        line,
        description,
        confidence: parse_confidence(body),
    })
}

/// Normalize `Confidence Score: n/m` to `round(5·n/m)`, clamped to 0–5.
/// Missing score or a zero denominator yields no confidence.
#[must_use]
pub fn parse_confidence(body: &str) -> Option<u8> {
    let captures = confidence_re().captures(body)?;
    let numerator: f64 = captures.get(1)?.as_str().parse().ok()?;
    let denominator: f64 = captures.get(2)?.as_str().parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(((5.0 * numerator / denominator).round() as i64).clamp(0, 5) as u8)
}
