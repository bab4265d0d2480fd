use std::path::PathBuf;

use serde::Serialize;
use specgen_core::error::{ParseError, RenderError};
use thiserror::Error;

/// Top-level failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Parse,
    Generation,
    Filesystem,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Generation => write!(f, "generation"),
            ErrorKind::Filesystem => write!(f, "filesystem"),
        }
    }
}

/// A single failed call to the generative backend (HTTP, decoding, timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmErrorKind {
    Api,
    Validation,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::Api => write!(f, "api"),
            LlmErrorKind::Validation => write!(f, "validation"),
        }
    }
}

/// Refinement gave up on a test case.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} error: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// One entry per failed attempt, oldest first.
    pub details: Vec<String>,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("test case '{case}' could not be rendered: {source}")]
    Render {
        case: String,
        #[source]
        source: RenderError,
    },

    #[error("refinement failed for test case '{case}': {source}")]
    Refinement {
        case: String,
        #[source]
        source: LlmError,
    },

    #[error("refinement task did not finish: {reason}")]
    Task { reason: String },

    #[error("failed to {action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GenerateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::Parse(_) => ErrorKind::Parse,
            GenerateError::Render { .. }
            | GenerateError::Refinement { .. }
            | GenerateError::Task { .. } => ErrorKind::Generation,
            GenerateError::Filesystem { .. } => ErrorKind::Filesystem,
        }
    }

    /// Structured diagnostics for the failure, when there are any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GenerateError::Parse(e) => e.details.clone().map(serde_json::Value::String),
            GenerateError::Refinement { case, source } => Some(serde_json::json!({
                "case": case,
                "llmError": source,
            })),
            GenerateError::Render { case, .. } => Some(serde_json::json!({ "case": case })),
            GenerateError::Task { .. } => None,
            GenerateError::Filesystem { path, .. } => {
                Some(serde_json::json!({ "path": path.display().to_string() }))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refinement_error_message_carries_backend_text() {
        let err = GenerateError::Refinement {
            case: "drag".into(),
            source: LlmError {
                kind: LlmErrorKind::Api,
                message: "LLM API returned 529: overloaded".into(),
                details: vec![],
            },
        };
        assert_eq!(err.kind(), ErrorKind::Generation);
        assert!(err.to_string().contains("529: overloaded"));
        assert_eq!(err.details().unwrap()["llmError"]["kind"], "api");
    }

    #[test]
    fn parse_errors_map_to_parse_kind() {
        let err: GenerateError = ParseError::new("missing required field `testCases`").into();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(err.to_string().contains("Invalid YAML"));
    }
}
