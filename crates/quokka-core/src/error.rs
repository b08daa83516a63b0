use thiserror::Error;

/// MongoDB-compatible error codes reported in command replies.
///
/// Only the codes the gateway actually produces are listed; everything else
/// surfaces as [`ErrorCode::InternalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    TypeMismatch,
    NamespaceNotFound,
    CommandNotFound,
    NotImplemented,
    RegexOptions,
}

impl ErrorCode {
    /// Numeric code as reported in the `code` field of an error reply.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::NotImplemented => 238,
            ErrorCode::RegexOptions => 51075,
        }
    }

    /// Symbolic name as reported in the `codeName` field of an error reply.
    pub fn code_name(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::RegexOptions => "RegexOptions",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed binary input. The offset points at the byte where decoding
    /// gave up, relative to the start of the document or message body.
    #[error("decode error at byte {offset}: {message}")]
    Decode { offset: usize, message: String },

    #[error("document of {len} bytes exceeds the {max} byte limit")]
    DocumentTooLarge { len: usize, max: usize },

    #[error("json decode error: {0}")]
    Json(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// A command failure with a MongoDB-compatible code; rendered to the
    /// client as `{ok: 0, errmsg, code, codeName}` by the router.
    #[error("{1}")]
    Command(ErrorCode, String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn command(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Command(code, message.into())
    }

    /// The code used when this error is reported in a command reply.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Command(code, _) => *code,
            Error::Decode { .. } | Error::Json(_) | Error::DocumentTooLarge { .. } => {
                ErrorCode::FailedToParse
            }
            Error::Validation(_) => ErrorCode::BadValue,
            Error::Storage(_) | Error::Io(_) => ErrorCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
