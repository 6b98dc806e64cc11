use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same operation against the same page can help.
    /// A page or browser that went away is recovered by recreating the
    /// session, never by retrying in place.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::SessionClosed(_) | Error::Config(_) => false,
            Error::Api(e) => e.code != Some(ErrorCode::SessionInitFailed),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing error class, mirrored into the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ServerError,
    InvalidRequestError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerError => "server_error",
            Self::InvalidRequestError => "invalid_request_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SelectorNotFound,
    SessionInitFailed,
    InputSurfaceMissing,
    ResponseTimeout,
    CaptureReplyFailed,
    StreamBridgeFailed,
    InvalidReply,
    EnterContextFailed,
    ProjectLinkMissing,
    SessionBusy,
    UpstreamTimeout,
    InvalidMessages,
    InvalidMessageItem,
    InvalidRole,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelectorNotFound => "selector_not_found",
            Self::SessionInitFailed => "session_init_failed",
            Self::InputSurfaceMissing => "input_surface_missing",
            Self::ResponseTimeout => "response_timeout",
            Self::CaptureReplyFailed => "capture_reply_failed",
            Self::StreamBridgeFailed => "stream_bridge_failed",
            Self::InvalidReply => "invalid_reply",
            Self::EnterContextFailed => "enter_context_failed",
            Self::ProjectLinkMissing => "project_link_missing",
            Self::SessionBusy => "session_busy",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::InvalidMessages => "invalid_messages",
            Self::InvalidMessageItem => "invalid_message_item",
            Self::InvalidRole => "invalid_role",
        }
    }

    /// Default HTTP status for the code: 504 for timeouts, 502 for upstream
    /// failures, 4xx for caller mistakes and 500 otherwise.
    pub fn default_status(&self) -> u16 {
        match self {
            Self::ResponseTimeout | Self::CaptureReplyFailed | Self::UpstreamTimeout => 504,
            Self::InvalidReply | Self::EnterContextFailed | Self::StreamBridgeFailed => 502,
            Self::SessionBusy => 409,
            Self::InvalidMessages | Self::InvalidMessageItem | Self::InvalidRole => 400,
            Self::SelectorNotFound
            | Self::SessionInitFailed
            | Self::InputSurfaceMissing
            | Self::ProjectLinkMissing => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniform error shape handed to the HTTP layer:
/// `{ type, code, status, param, details }` plus a human readable message.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorType,
    pub code: Option<ErrorCode>,
    pub status: u16,
    pub param: Option<String>,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let kind = match code.default_status() {
            400..=499 if code != ErrorCode::SessionBusy => ErrorType::InvalidRequestError,
            _ => ErrorType::ServerError,
        };
        Self {
            message: message.into(),
            kind,
            code: Some(code),
            status: code.default_status(),
            param: None,
            details: None,
        }
    }

    /// A server error without a taxonomy code.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorType::ServerError,
            code: None,
            status: 500,
            param: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == Some(code)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Api(e) => e,
            Error::SelectorNotFound(selector) => {
                ApiError::new(ErrorCode::SelectorNotFound, format!("Element not found: {}", selector))
                    .with_param(selector)
            }
            Error::Timeout(msg) => ApiError::internal(format!("Timeout: {}", msg)).with_status(504),
            Error::Cdp(msg) => ApiError::internal(format!("CDP error: {}", msg)).with_status(502),
            Error::SessionClosed(msg) => {
                ApiError::new(ErrorCode::SessionInitFailed, format!("Browser session lost: {}", msg))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let err = ApiError::new(ErrorCode::ResponseTimeout, "Response not completed in time");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["type"], "server_error");
        assert_eq!(v["code"], "response_timeout");
        assert_eq!(v["status"], 504);
        assert!(v["param"].is_null());
        assert!(v["details"].is_null());
    }

    #[test]
    fn test_selector_not_found_keeps_param() {
        let api: ApiError = Error::SelectorNotFound("#prompt-textarea".into()).into();
        assert!(api.is(ErrorCode::SelectorNotFound));
        assert_eq!(api.param.as_deref(), Some("#prompt-textarea"));
        assert_eq!(api.status, 500);
    }

    #[test]
    fn test_validation_codes_are_request_errors() {
        let api = ApiError::new(ErrorCode::InvalidRole, "bad role");
        assert_eq!(api.kind, ErrorType::InvalidRequestError);
        assert_eq!(api.status, 400);
        let busy = ApiError::new(ErrorCode::SessionBusy, "busy");
        assert_eq!(busy.kind, ErrorType::ServerError);
    }

    #[test]
    fn test_session_closed_is_not_transient() {
        assert!(!Error::SessionClosed("gone".into()).is_transient());
        assert!(Error::SelectorNotFound("a".into()).is_transient());
        assert!(Error::Cdp("timeout".into()).is_transient());
    }
}
