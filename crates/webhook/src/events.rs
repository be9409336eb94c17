//! Event kinds and per-kind payload validation.
//!
//! Each kind has a declarative list of required fields. Validation walks
//! the parsed document and reports the first missing or mistyped path, so
//! a 400 can say exactly which field was wrong.

use serde_json::Value;

/// Webhook event kinds Squire understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PullRequest,
    IssueComment,
    PullRequestReview,
    PullRequestReviewComment,
    CheckRun,
}

impl EventKind {
    /// Map the event header value; unknown kinds return `None` and are
    /// accepted without action.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "pull_request" => Some(Self::PullRequest),
            "issue_comment" => Some(Self::IssueComment),
            "pull_request_review" => Some(Self::PullRequestReview),
            "pull_request_review_comment" => Some(Self::PullRequestReviewComment),
            "check_run" => Some(Self::CheckRun),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PullRequest => "pull_request",
            Self::IssueComment => "issue_comment",
            Self::PullRequestReview => "pull_request_review",
            Self::PullRequestReviewComment => "pull_request_review_comment",
            Self::CheckRun => "check_run",
        }
    }

    /// Dot paths that must be present (and of the right type) for this
    /// kind. A trailing `#` marks a numeric field; everything else must be
    /// a string.
    const fn required_paths(self) -> &'static [&'static str] {
        match self {
            Self::PullRequest => &["action", "pull_request.html_url", "pull_request.number#"],
            Self::IssueComment => &[
                "action",
                "issue.html_url",
                "issue.number#",
                "comment.body",
                "comment.user.login",
            ],
            Self::PullRequestReview => &[
                "action",
                "pull_request.html_url",
                "pull_request.number#",
                "review.user.login",
                "review.state",
            ],
            Self::PullRequestReviewComment => &[
                "action",
                "pull_request.html_url",
                "pull_request.number#",
                "comment.body",
                "comment.user.login",
            ],
            Self::CheckRun => &["action", "check_run.name", "repository.full_name"],
        }
    }
}

/// A payload failed schema validation; the message names the bad path.
#[derive(Debug, thiserror::Error)]
#[error("invalid payload: missing or invalid field {path}")]
pub struct ValidationError {
    pub path: String,
}

/// Validate a parsed payload against the kind's required fields.
pub fn validate(kind: EventKind, body: &Value) -> Result<(), ValidationError> {
    for spec in kind.required_paths() {
        let (path, numeric) = spec
            .strip_suffix('#')
            .map_or((*spec, false), |p| (p, true));

        let value = lookup(body, path).ok_or_else(|| ValidationError {
            path: path.to_string(),
        })?;

        let ok = if numeric {
            value.is_u64() || value.is_i64()
        } else {
            value.is_string()
        };
        if !ok {
            return Err(ValidationError {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

/// Walk a dot-separated path through nested objects.
#[must_use]
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// String at `path`, if present.
#[must_use]
pub fn lookup_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    lookup(value, path).and_then(Value::as_str)
}

/// Unsigned integer at `path`, if present.
#[must_use]
pub fn lookup_u64(value: &Value, path: &str) -> Option<u64> {
    lookup(value, path).and_then(Value::as_u64)
}

/// Boolean at `path`, if present.
#[must_use]
pub fn lookup_bool(value: &Value, path: &str) -> Option<bool> {
    lookup(value, path).and_then(Value::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_pull_request_payload_passes() {
        let body = json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/owner/r/pull/1",
                "number": 1,
                "merged": true,
            },
            "repository": { "full_name": "owner/r" },
        });
        assert!(validate(EventKind::PullRequest, &body).is_ok());
    }

    #[test]
    fn missing_field_names_the_path() {
        let body = json!({
            "action": "closed",
            "pull_request": { "number": 1 },
        });
        let err = validate(EventKind::PullRequest, &body).unwrap_err();
        assert_eq!(err.path, "pull_request.html_url");
        assert!(err.to_string().contains("pull_request.html_url"));
    }

    #[test]
    fn mistyped_field_names_the_path() {
        let body = json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/owner/r/pull/1",
                "number": "one",
            },
        });
        let err = validate(EventKind::PullRequest, &body).unwrap_err();
        assert_eq!(err.path, "pull_request.number");
    }

    #[test]
    fn check_run_requires_repository() {
        let body = json!({
            "action": "completed",
            "check_run": { "name": "tests", "conclusion": "failure" },
        });
        let err = validate(EventKind::CheckRun, &body).unwrap_err();
        assert_eq!(err.path, "repository.full_name");
    }

    #[test]
    fn unknown_kinds_map_to_none() {
        assert_eq!(EventKind::from_header("push"), None);
        assert_eq!(EventKind::from_header("ping"), None);
        assert_eq!(
            EventKind::from_header("check_run"),
            Some(EventKind::CheckRun)
        );
    }
}
