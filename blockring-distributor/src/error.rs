use std::fmt::{Display, Formatter};
use std::io;

use thiserror::Error;

use crate::core::PeerAddress;
use crate::metadata::MetadataError;
use crate::ring::RingError;
use crate::rpc::{ErrorCode, Status};
use crate::storage::StorageError;

#[derive(Debug, Error)]
/// The public error taxonomy of the distributor.
pub enum DistributorError {
    #[error("The requested key does not exist on any replica.")]
    NotFound,

    #[error("No replica was able to serve the request: {0}")]
    PeerUnavailable(ReplicaFailures),

    #[error("Write quorum was not met, {acknowledged} of the required {required} replicas acknowledged: {failures}")]
    QuorumFailed {
        required: usize,
        acknowledged: usize,
        failures: ReplicaFailures,
    },

    #[error("A failure occurred within the local store: {0}")]
    LocalIo(#[from] StorageError),

    #[error("The distributor has been shut down.")]
    ShuttingDown,

    #[error("The metadata service is unavailable: {0}")]
    MetadataUnavailable(#[from] MetadataError),

    #[error("The ring is invalid: {0}")]
    Ring(#[from] RingError),

    #[error("The request was rejected before being sent: {0}")]
    InvalidRequest(String),

    #[error("Failed to bind the storage server: {0}")]
    Bind(io::Error),
}

#[derive(Debug, Clone)]
/// A single replica which failed to serve a request.
pub struct ReplicaFailure {
    pub peer: PeerAddress,
    pub status: Status,
}

#[derive(Debug, Clone, Default)]
/// Every replica which failed during a single fan-out call and why.
pub struct ReplicaFailures(Vec<ReplicaFailure>);

impl ReplicaFailures {
    pub(crate) fn push(&mut self, peer: PeerAddress, status: Status) {
        self.0.push(ReplicaFailure { peer, status });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaFailure> {
        self.0.iter()
    }

    /// Returns if every failed replica reported the key as missing.
    pub(crate) fn all_not_found(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|failure| failure.status.code == ErrorCode::NotFound)
    }

    /// Returns if any replica reported the distributor as shutting down.
    pub(crate) fn any_shutting_down(&self) -> bool {
        self.0
            .iter()
            .any(|failure| failure.status.code == ErrorCode::ShuttingDown)
    }
}

impl Display for ReplicaFailures {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "[]");
        }

        write!(f, "[")?;
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({})", failure.peer, failure.status)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_display_every_peer() {
        let mut failures = ReplicaFailures::default();
        failures.push(
            PeerAddress::new("peer-a", "127.0.0.1:1".parse().unwrap()),
            Status::timeout(),
        );
        failures.push(
            PeerAddress::new("peer-b", "127.0.0.1:2".parse().unwrap()),
            Status::not_found("missing"),
        );

        let rendered = failures.to_string();
        assert!(rendered.contains("peer-a@127.0.0.1:1"));
        assert!(rendered.contains("peer-b@127.0.0.1:2"));
        assert!(!failures.all_not_found());
    }

    #[test]
    fn test_all_not_found() {
        let mut failures = ReplicaFailures::default();
        assert!(!failures.all_not_found());

        failures.push(
            PeerAddress::new("peer-a", "127.0.0.1:1".parse().unwrap()),
            Status::not_found("missing"),
        );
        assert!(failures.all_not_found());
    }
}
