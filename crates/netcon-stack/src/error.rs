use thiserror::Error;

/// Cross-backend error taxonomy. Backends map their native failures onto these variants so callers
/// never see backend-specific codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum StackError {
    #[error("no such connection")]
    InvalidConnection,
    #[error("address already in use")]
    AddressInUse,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("timed out")]
    Timeout,
    #[error("connection aborted by peer")]
    ProtocolAborted,
    #[error("unsupported socket type")]
    Unsupported,
}

impl StackError {
    /// Linux errno number reported to the application for this error.
    pub fn errno(self) -> i32 {
        match self {
            StackError::InvalidConnection => 9,
            StackError::AddressInUse => 98,
            StackError::OutOfMemory => 12,
            StackError::InvalidArgument => 22,
            StackError::NotConnected => 107,
            StackError::AlreadyConnected => 106,
            StackError::HostUnreachable => 101,
            StackError::Timeout => 110,
            StackError::ProtocolAborted => 111,
            StackError::Unsupported => 94,
        }
    }
}
