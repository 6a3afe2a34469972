use std::fmt;

/// Coarse classification of every failure the pipeline can report.
///
/// The kind alone is often too coarse to act on (e.g. `Backend` covers every
/// kernel fault), so it always travels together with a message inside
/// [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    FileNotFound,
    InvalidDtype,
    InvalidAttribute,
    UnsupportedOperator,
    DimensionMismatch,
    VariableNotFound,
    IndexOutOfRange,
    JsonParse,
    InvalidBackendName,
    FailedToConfigureOperator,
    Backend,
    DuplicateVariable,
    UnsupportedRank,
    UseAfterDispose,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Parse => "parse_error",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::InvalidDtype => "invalid_dtype",
            ErrorKind::InvalidAttribute => "invalid_attribute",
            ErrorKind::UnsupportedOperator => "unsupported_operator",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::VariableNotFound => "variable_not_found",
            ErrorKind::IndexOutOfRange => "index_out_of_range",
            ErrorKind::JsonParse => "json_parse_error",
            ErrorKind::InvalidBackendName => "invalid_backend_name",
            ErrorKind::FailedToConfigureOperator => "failed_to_configure_operator",
            ErrorKind::Backend => "backend_error",
            ErrorKind::DuplicateVariable => "duplicate_variable",
            ErrorKind::UnsupportedRank => "unsupported_rank",
            ErrorKind::UseAfterDispose => "use_after_dispose",
            ErrorKind::Unknown => "unknown_error",
        };
        write!(f, "{}", s)
    }
}

/// All errors that can occur within Vole.
///
/// Each variant carries the message describing the failure site, so the kind
/// and its detail are always obtained together.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed serialized graph.
    #[error("parse error: {0}")]
    Parse(String),

    /// The graph file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid dtype: {0}")]
    InvalidDtype(String),

    /// A required attribute is missing or has the wrong type.
    #[error("invalid attribute '{attribute}' on {op_type} node: {reason}")]
    InvalidAttribute {
        op_type: String,
        attribute: String,
        reason: String,
    },

    /// No inference rule or kernel exists for the operator.
    #[error("unsupported operator '{op_type}': {reason}")]
    UnsupportedOperator { op_type: String, reason: String },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error("index out of range: index {index} for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("json parse error: {0}")]
    JsonParse(String),

    #[error("invalid backend name: '{0}'")]
    InvalidBackendName(String),

    /// The backend rejected its configuration.
    #[error("failed to configure backend '{backend}': {reason}")]
    FailedToConfigureOperator { backend: String, reason: String },

    /// Any fault raised while a kernel executes.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("variable '{0}' already exists")]
    DuplicateVariable(String),

    #[error("unsupported rank {rank} for '{name}' (supported: {supported})")]
    UnsupportedRank {
        name: String,
        rank: usize,
        supported: String,
    },

    /// An operation was attempted on a disposed handle.
    #[error("{0} used after dispose")]
    UseAfterDispose(&'static str),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn backend(s: impl Into<String>) -> Self {
        Error::Backend(s.into())
    }

    pub fn dim_mismatch(s: impl Into<String>) -> Self {
        Error::DimensionMismatch(s.into())
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Error::VariableNotFound(name.into())
    }

    pub fn invalid_attribute(
        op_type: impl Into<String>,
        attribute: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidAttribute {
            op_type: op_type.into(),
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_op(op_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedOperator {
            op_type: op_type.into(),
            reason: reason.into(),
        }
    }

    /// The kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) => ErrorKind::Parse,
            Error::FileNotFound(_) => ErrorKind::FileNotFound,
            Error::InvalidDtype(_) => ErrorKind::InvalidDtype,
            Error::InvalidAttribute { .. } => ErrorKind::InvalidAttribute,
            Error::UnsupportedOperator { .. } => ErrorKind::UnsupportedOperator,
            Error::DimensionMismatch(_) => ErrorKind::DimensionMismatch,
            Error::VariableNotFound(_) => ErrorKind::VariableNotFound,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Error::JsonParse(_) => ErrorKind::JsonParse,
            Error::InvalidBackendName(_) => ErrorKind::InvalidBackendName,
            Error::FailedToConfigureOperator { .. } => ErrorKind::FailedToConfigureOperator,
            Error::Backend(_) => ErrorKind::Backend,
            Error::DuplicateVariable(_) => ErrorKind::DuplicateVariable,
            Error::UnsupportedRank { .. } => ErrorKind::UnsupportedRank,
            Error::UseAfterDispose(_) => ErrorKind::UseAfterDispose,
            Error::Msg(_) => ErrorKind::Unknown,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonParse(e.to_string())
    }
}

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message_travel_together() {
        let e = Error::InvalidBackendName("nonexistent".into());
        assert_eq!(e.kind(), ErrorKind::InvalidBackendName);
        assert_eq!(e.to_string(), "invalid backend name: 'nonexistent'");
    }

    #[test]
    fn test_msg_is_unknown() {
        assert_eq!(Error::msg("boom").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::JsonParse);
    }
}
