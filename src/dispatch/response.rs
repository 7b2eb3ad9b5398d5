use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidParameters,
    NotFound,
    PermissionDenied,
    RateLimitExceeded,
    InternalError,
    NotImplemented,
    UnknownCommand,
    CircuitOpen,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// One reply line. `data` and `error` are left out when empty.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub status: Status,
    pub command: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Envelope {
    pub fn success(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: Status::Success,
            command: command.to_owned(),
            message: message.into(),
            data,
            error: None,
        }
    }
    pub fn error(command: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            command: command.to_owned(),
            message: message.into(),
            data: None,
            error: Some(code),
        }
    }
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to encode reply to {}: {e}", self.command);
            concat!(
                r#"{"status":"error","command":"unknown","#,
                r#""message":"internal error","error":"internalError"}"#,
            )
            .to_owned()
        })
    }
}
