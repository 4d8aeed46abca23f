use thiserror::Error;

/// Stable catalog of failure kinds surfaced to callers across the messaging
/// substrate (connection, client, broker and dispatch layers).
///
/// Mirrors the `KARABO_ERROR_CODE_*` family the original C++ uses as
/// `boost::system::error_code` values: a small, closed, serializable set
/// rather than an open hierarchy of exception types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    Success,
    WrongProtocol,
    ConnectionRefused,
    NotConnected,
    AlreadyConnected,
    OperationCanceled,
    TimedOut,
    IoError,
    CreateChannelError,
    CreateQueueError,
    BindQueueError,
    CreateConsumerError,
    CreateExchangeError,
    UnbindQueueError,
    MessageDrop,
    LogicError,
    NetworkError,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::WrongProtocol => "wrong protocol",
            ErrorCode::ConnectionRefused => "connection refused",
            ErrorCode::NotConnected => "not connected",
            ErrorCode::AlreadyConnected => "already connected",
            ErrorCode::OperationCanceled => "operation canceled",
            ErrorCode::TimedOut => "timed out",
            ErrorCode::IoError => "io error",
            ErrorCode::CreateChannelError => "create channel error",
            ErrorCode::CreateQueueError => "create queue error",
            ErrorCode::BindQueueError => "bind queue error",
            ErrorCode::CreateConsumerError => "create consumer error",
            ErrorCode::CreateExchangeError => "create exchange error",
            ErrorCode::UnbindQueueError => "unbind queue error",
            ErrorCode::MessageDrop => "message dropped",
            ErrorCode::LogicError => "logic error",
            ErrorCode::NetworkError => "network error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error type. Carries an [`ErrorCode`] plus a human-readable
/// message and, where available, the underlying cause.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct KaraboError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl KaraboError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), source: None }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { code, message: message.into(), source: Some(Box::new(source)) }
    }
}

pub type Result<T> = std::result::Result<T, KaraboError>;
