use thiserror::Error;

use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum XApiParseError {
    #[error("failed to parse xen timestamp")]
    TimestampParseError(#[from] chrono::ParseError),
    #[error("unknown power state '{0}'")]
    PowerStateParseError(String),
}

/// Errors reported by the control-plane (XML-RPC) side of the API.
#[derive(Debug, Error)]
pub enum XApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("xapi failure [{code}]: {}", details.join("; "))]
    Failure { code: String, details: Vec<String> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{class} '{ident}' not found")]
    NotFound { class: &'static str, ident: String },
    #[error("failed to parse xapi value: {0}")]
    Parse(#[from] XApiParseError),
}

impl From<reqwest::Error> for XApiError {
    fn from(e: reqwest::Error) -> Self {
        XApiError::Transport(e.to_string())
    }
}

impl From<RpcError> for XApiError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Fault { code, message } => XApiError::Failure {
                code: code.to_string(),
                details: vec![message],
            },
            other => XApiError::Transport(other.to_string()),
        }
    }
}

/// Errors raised by a bulk streaming transfer. The variants line up with
/// the failure categories reported per VM: XenAPI, HTTP, Storage, Generic.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] XApiError),
    #[error("http error: {0}")]
    Http(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// ENOSPC aborts the whole pool run instead of being retried.
    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            TransferError::Io(e)
                if e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Io(_) => !self.is_out_of_space(),
            TransferError::Http(_) => true,
            TransferError::Api(_) | TransferError::Cancelled => false,
        }
    }
}
