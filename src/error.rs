//! API error taxonomy and wire envelopes.
//!
//! Every failure that can cross the HTTP boundary is a variant of
//! [`ApiError`] with a stable machine-readable code. The wire shape is
//! controlled by the `errorformat` query parameter: the default envelope is
//!
//! ```json
//! { "errors": [{ "code": "unsupportedwiki", "text": "...", "module": "dispatch" }],
//!   "docref": "..." }
//! ```
//!
//! while `errorformat=raw` replaces `text` with `key` + `params`, and
//! `errorformat=bc` flattens the first error to `{ "code": ..., "info": ... }`.
//!
//! Validation failures fail fast at the boundary; failures inside background
//! jobs are captured by the task engine and only surface through this module
//! when the client polls (`task-uncaught-generic`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Documentation pointer included in every error envelope.
const DOCREF: &str = "See https://meta.wikimedia.org/wiki/Special:MyLanguage/API:Main_page for API usage.";

/// Errors that can surface on the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested dbname is unknown to the site registry or marked
    /// non-global.
    #[error("the wiki {0:?} is not supported by this tool")]
    UnsupportedWiki(String),

    /// The revision endpoint was called without any revision ids.
    #[error("the 'revisions' parameter must be set and non-empty")]
    RevisionsMissing,

    /// A revision id did not parse as an integer.
    #[error("invalid integer value {0:?} in 'revisions'")]
    BadInteger(String),

    /// The bounded GET path was asked for more ids than it allows.
    #[error("at most {0} revisions may be requested per call; use the POST endpoint for more")]
    MethodLimited(usize),

    /// The talk-page filter is empty or a regex that does not compile.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// The raw title violates the wiki's legal-title-character set.
    #[error("the title {0:?} contains illegal characters")]
    BadTitle(String),

    /// Task id unknown, or the task has already been swept.
    #[error("no task with this id exists (it may have expired)")]
    TaskMissing,

    /// The task exists but has not finished yet.
    #[error("the task has not finished; poll its progress endpoint")]
    TaskUnfinished,

    /// The task worker raised; the captured message is wrapped.
    #[error("the task failed: {0}")]
    TaskUncaught(String),

    /// A queued revision batch did not resolve within the wall-clock budget.
    #[error("the revision expander did not resolve within {timeout_secs}s; still pending: {pending:?}")]
    ExpanderTimeout {
        timeout_secs: u64,
        pending: Vec<u64>,
    },

    /// The upstream catalogue or API could not be fetched or parsed.
    #[error("the upstream service is unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The replica host failed the hosted-environment safety gate.
    #[error("refusing to connect to replica host {0:?}")]
    ConnectionRefused(String),

    /// Fallback for everything else.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable code for the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::UnsupportedWiki(_) => "unsupportedwiki",
            ApiError::RevisionsMissing => "revisions-missing",
            ApiError::BadInteger(_) => "badinteger",
            ApiError::MethodLimited(_) => "method-limited",
            ApiError::InvalidFilter(_) => "invalidfilter",
            ApiError::BadTitle(_) => "badtitle",
            ApiError::TaskMissing => "task-missing",
            ApiError::TaskUnfinished => "task-unfinished",
            ApiError::TaskUncaught(_) => "task-uncaught-generic",
            ApiError::ExpanderTimeout { .. } => "expander-timeout",
            ApiError::UpstreamUnavailable(_) => "upstream-unavailable",
            ApiError::ConnectionRefused(_) => "connection-refused",
            ApiError::Generic(_) => "generic-error",
        }
    }

    /// HTTP status this error maps to on the default (validation) surface.
    ///
    /// Task-spawn endpoints report `unsupportedwiki` as 400 rather than 422;
    /// [`ApiFailure::with_status`] overrides the status for those paths.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::UnsupportedWiki(_)
            | ApiError::RevisionsMissing
            | ApiError::BadInteger(_)
            | ApiError::BadTitle(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::MethodLimited(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            ApiError::TaskMissing => StatusCode::NOT_FOUND,
            ApiError::TaskUnfinished => StatusCode::CONFLICT,
            ApiError::TaskUncaught(_)
            | ApiError::ExpanderTimeout { .. }
            | ApiError::UpstreamUnavailable(_)
            | ApiError::ConnectionRefused(_)
            | ApiError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured parameters for `errorformat=raw`.
    fn params(&self) -> Vec<serde_json::Value> {
        match self {
            ApiError::UnsupportedWiki(dbname) => vec![dbname.clone().into()],
            ApiError::BadInteger(value) => vec![value.clone().into()],
            ApiError::MethodLimited(limit) => vec![(*limit).into()],
            ApiError::InvalidFilter(reason) => vec![reason.clone().into()],
            ApiError::BadTitle(title) => vec![title.clone().into()],
            ApiError::TaskUncaught(message) => vec![message.clone().into()],
            ApiError::ExpanderTimeout { pending, .. } => {
                vec![serde_json::json!(pending)]
            }
            _ => Vec::new(),
        }
    }
}

/// Wire shape selector, from the `errorformat` query parameter.
///
/// `Text`, `Wikitext`, and `Plaintext` share the human-readable envelope;
/// they differ upstream only in comment markup, which this tool does not
/// produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFormat {
    #[default]
    Text,
    Wikitext,
    Plaintext,
    Raw,
    Bc,
}

impl ErrorFormat {
    /// Parses the `errorformat` query value; unknown values fall back to the
    /// default envelope.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("wikitext") => ErrorFormat::Wikitext,
            Some("plaintext") => ErrorFormat::Plaintext,
            Some("raw") => ErrorFormat::Raw,
            Some("bc") => ErrorFormat::Bc,
            _ => ErrorFormat::Text,
        }
    }
}

/// An [`ApiError`] paired with the response shape the client asked for.
///
/// Handlers return `Result<_, ApiFailure>`; the conversion to an HTTP
/// response happens exactly once, here.
#[derive(Debug)]
pub struct ApiFailure {
    pub error: ApiError,
    pub format: ErrorFormat,
    status_override: Option<StatusCode>,
}

impl ApiFailure {
    pub fn new(error: ApiError, format: ErrorFormat) -> Self {
        Self {
            error,
            format,
            status_override: None,
        }
    }

    /// Overrides the HTTP status while keeping the error body unchanged.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status_override = Some(status);
        self
    }

    /// Renders the error body in the selected format.
    pub fn body(&self) -> serde_json::Value {
        let code = self.error.code();
        match self.format {
            ErrorFormat::Bc => serde_json::json!({
                "code": code,
                "info": self.error.to_string(),
                "docref": DOCREF,
            }),
            ErrorFormat::Raw => serde_json::json!({
                "errors": [{
                    "code": code,
                    "key": code,
                    "params": self.error.params(),
                    "module": "dispatch",
                }],
                "docref": DOCREF,
            }),
            ErrorFormat::Text | ErrorFormat::Wikitext | ErrorFormat::Plaintext => {
                serde_json::json!({
                    "errors": [{
                        "code": code,
                        "text": self.error.to_string(),
                        "module": "dispatch",
                    }],
                    "docref": DOCREF,
                })
            }
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.status_override.unwrap_or_else(|| self.error.status());
        if status.is_server_error() {
            tracing::error!(code = self.error.code(), error = %self.error, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::RevisionsMissing.code(), "revisions-missing");
        assert_eq!(ApiError::BadInteger("abc".into()).code(), "badinteger");
        assert_eq!(ApiError::MethodLimited(50).code(), "method-limited");
        assert_eq!(ApiError::TaskMissing.code(), "task-missing");
        assert_eq!(
            ApiError::TaskUncaught("boom".into()).code(),
            "task-uncaught-generic"
        );
        assert_eq!(
            ApiError::Generic(anyhow::anyhow!("x")).code(),
            "generic-error"
        );
    }

    #[test]
    fn statuses_match_surface_contract() {
        assert_eq!(
            ApiError::MethodLimited(50).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::RevisionsMissing.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::TaskMissing.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::TaskUnfinished.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::ExpanderTimeout { timeout_secs: 10, pending: vec![] }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn default_envelope_shape() {
        let failure = ApiFailure::new(
            ApiError::UnsupportedWiki("testwiki".into()),
            ErrorFormat::Text,
        );
        let body = failure.body();
        let errors = body["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], "unsupportedwiki");
        assert_eq!(errors[0]["module"], "dispatch");
        assert!(errors[0]["text"].as_str().unwrap().contains("testwiki"));
        assert!(body["docref"].is_string());
    }

    #[test]
    fn bc_format_flattens() {
        let failure = ApiFailure::new(ApiError::TaskMissing, ErrorFormat::Bc);
        let body = failure.body();
        assert_eq!(body["code"], "task-missing");
        assert!(body["info"].is_string());
        assert!(body.get("errors").is_none());
    }

    #[test]
    fn raw_format_carries_params() {
        let failure = ApiFailure::new(
            ApiError::BadInteger("abc".into()),
            ErrorFormat::Raw,
        );
        let body = failure.body();
        let error = &body["errors"][0];
        assert_eq!(error["key"], "badinteger");
        assert_eq!(error["params"][0], "abc");
    }

    #[test]
    fn unknown_format_falls_back() {
        assert_eq!(ErrorFormat::parse(Some("nonsense")), ErrorFormat::Text);
        assert_eq!(ErrorFormat::parse(None), ErrorFormat::Text);
        assert_eq!(ErrorFormat::parse(Some("bc")), ErrorFormat::Bc);
    }
}
