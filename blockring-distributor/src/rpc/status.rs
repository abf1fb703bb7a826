use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

use rkyv::{Archive, Deserialize, Serialize};

use crate::storage::StorageError;

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, PartialEq, Eq)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(PartialEq, Eq, Debug))]
/// Status information around the cause of a storage request failing.
///
/// This includes a generic status code and message.
pub struct Status {
    /// The generic error code of the request.
    pub code: ErrorCode,
    /// The display message for the error.
    pub message: String,
}

impl Status {
    /// The key does not exist on the replica.
    pub fn not_found(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.to_string(),
        }
    }

    /// The replica's local store has no space left.
    pub fn out_of_space(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::OutOfSpace,
            message: msg.to_string(),
        }
    }

    /// The replica's local store failed to complete the operation.
    pub fn io_failure(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::IoFailure,
            message: msg.to_string(),
        }
    }

    /// The key or payload was rejected by validation.
    pub fn invalid_key(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::InvalidKey,
            message: msg.to_string(),
        }
    }

    /// The replica, or the local node, is shutting down.
    pub fn shutting_down() -> Self {
        Self {
            code: ErrorCode::ShuttingDown,
            message: "The node is shutting down.".to_string(),
        }
    }

    /// An internal error occurred while processing the message.
    pub fn internal(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: msg.to_string(),
        }
    }

    /// The provided message data is invalid or unable to be deserialized
    /// by the server processing it.
    pub fn invalid() -> Self {
        Self {
            code: ErrorCode::InvalidPayload,
            message: "Invalid message payload was provided to be deserialized."
                .to_string(),
        }
    }

    /// The message body is larger than the server accepts.
    pub fn payload_too_large(limit: usize) -> Self {
        Self {
            code: ErrorCode::InvalidPayload,
            message: format!("The message body exceeds the {limit} byte limit."),
        }
    }

    /// The replica's copy of the shard is being refreshed.
    pub fn not_ready(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::NotReady,
            message: msg.to_string(),
        }
    }

    /// The connection is closed or interrupted during the operation.
    pub fn connection(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::ConnectionError,
            message: msg.to_string(),
        }
    }

    /// The operation took too long to be completed and was aborted.
    pub fn timeout() -> Self {
        Self {
            code: ErrorCode::Timeout,
            message: "The operation took to long to be completed.".to_string(),
        }
    }

    /// Returns if the failure is caused by the transport rather than the replica.
    ///
    /// Only these failures are worth retrying against the same peer.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::ConnectionError | ErrorCode::Timeout)
    }
}

impl From<StorageError> for Status {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound => Status::not_found(error),
            StorageError::OutOfSpace => Status::out_of_space(error),
            StorageError::Closed => Status::shutting_down(),
            StorageError::Io(_) => Status::io_failure(error),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl Error for Status {}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Copy, Clone, PartialEq, Eq, Debug)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(Debug, PartialEq, Eq))]
/// A generic error code describing the high level reason why the request failed.
pub enum ErrorCode {
    /// The key does not exist on the replica.
    NotFound,
    /// The replica's local store has no space left.
    OutOfSpace,
    /// The replica's local store failed to complete the operation.
    IoFailure,
    /// The key or payload was rejected by validation.
    InvalidKey,
    /// The node is shutting down.
    ShuttingDown,
    /// The provided message data is invalid or unable to be deserialized
    /// by the server processing it.
    InvalidPayload,
    /// The connection is closed or interrupted during the operation.
    ConnectionError,
    /// The operation took too long to be completed and was aborted.
    Timeout,
    /// An internal error occurred while processing the message.
    InternalError,
    /// The replica's copy of a shard is being refreshed and cannot be relied on yet.
    NotReady,
}
