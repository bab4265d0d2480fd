use thiserror::Error;

/// A spec document that could not be turned into a `TestSpecDocument`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid YAML spec: {message}")]
pub struct ParseError {
    pub message: String,
    pub details: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template {template} needs `{placeholder}` but case '{case}' does not provide it")]
    MissingPlaceholder {
        template: String,
        placeholder: String,
        case: String,
    },
}
