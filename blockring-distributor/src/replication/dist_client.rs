use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;

use crate::config::DistributorConfig;
use crate::core::PeerAddress;
use crate::error::{DistributorError, ReplicaFailures};
use crate::rpc::services::StorageServer;
use crate::rpc::{RpcNetwork, Status, StorageReply, StorageRequest};
use crate::statistics::{incr, DistributorStatistics};

/// Fans storage operations out to the replicas of a key.
///
/// If this node is itself a replica the call is handled by the local
/// storage server directly rather than going over the network.
pub(crate) struct DistClient {
    local_uuid: String,
    local: Arc<StorageServer>,
    network: RpcNetwork,
    timeout: Duration,
    attempts: usize,
    backoff: Duration,
    closed: watch::Sender<bool>,
    statistics: DistributorStatistics,
}

impl DistClient {
    pub(crate) fn new(
        local_uuid: String,
        local: Arc<StorageServer>,
        network: RpcNetwork,
        config: &DistributorConfig,
        statistics: DistributorStatistics,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            local_uuid,
            local,
            network,
            timeout: config.rpc_timeout,
            attempts: config.rpc_attempts.max(1),
            backoff: config.retry_backoff,
            closed,
            statistics,
        }
    }

    #[inline]
    pub(crate) fn network(&self) -> &RpcNetwork {
        &self.network
    }

    /// Cancels every in-flight fan-out and rejects any new ones.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the client has been closed.
    async fn cancelled(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return;
            }

            // The sender lives as long as `self` so this never errors.
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sends a request to a single replica.
    ///
    /// Transport failures are retried a bounded number of times, failures
    /// reported by the replica itself are returned immediately.
    pub(crate) async fn call(
        &self,
        peer: &PeerAddress,
        request: &StorageRequest,
    ) -> Result<StorageReply, Status> {
        if peer.uuid == self.local_uuid {
            return self.local.handle(request.clone()).await;
        }

        let client = self.network.get_or_connect(peer.addr);
        let mut attempt = 1;
        loop {
            match client.send(request, self.timeout).await {
                Ok(reply) => return Ok(reply),
                Err(status) if status.is_transient() && attempt < self.attempts => {
                    debug!(
                        target_peer = %peer,
                        attempt = attempt,
                        error = %status,
                        "Replica call failed, retrying.",
                    );
                    attempt += 1;
                    let delay = jittered(self.backoff);
                    tokio::time::sleep(delay).await;
                },
                Err(status) => return Err(status),
            }
        }
    }

    /// Sends a read to every replica concurrently and returns the first success.
    ///
    /// The remaining calls are cancelled once a replica has answered.
    pub(crate) async fn read(
        &self,
        replicas: Vec<PeerAddress>,
        request: StorageRequest,
    ) -> Result<StorageReply, DistributorError> {
        if self.is_closed() {
            return Err(DistributorError::ShuttingDown);
        }

        let fanout = async {
            let request = &request;
            let mut failures = ReplicaFailures::default();
            let mut requests = replicas
                .into_iter()
                .map(|peer| async move {
                    let result = self.call(&peer, request).await;
                    (peer, result)
                })
                .collect::<FuturesUnordered<_>>();

            while let Some((peer, result)) = requests.next().await {
                match result {
                    Ok(reply) => return Ok(reply),
                    Err(status) => {
                        incr(&self.statistics.num_replica_failures);
                        debug!(
                            target_peer = %peer,
                            request = request.name(),
                            error = %status,
                            "Replica failed to serve read.",
                        );
                        failures.push(peer, status);
                    },
                }
            }

            if failures.all_not_found() {
                Err(DistributorError::NotFound)
            } else if failures.any_shutting_down() && self.is_closed() {
                Err(DistributorError::ShuttingDown)
            } else {
                Err(DistributorError::PeerUnavailable(failures))
            }
        };

        tokio::select! {
            result = fanout => result,
            _ = self.cancelled() => Err(DistributorError::ShuttingDown),
        }
    }

    /// Sends a write to every replica concurrently and waits for all of them.
    ///
    /// Returns the number of replicas which acknowledged the write if it
    /// meets the given quorum.
    pub(crate) async fn write(
        &self,
        replicas: Vec<PeerAddress>,
        request: StorageRequest,
        quorum: usize,
    ) -> Result<usize, DistributorError> {
        if self.is_closed() {
            return Err(DistributorError::ShuttingDown);
        }

        let num_replicas = replicas.len();
        let fanout = async {
            let request = &request;
            let mut acknowledged = 0;
            let mut failures = ReplicaFailures::default();
            let mut requests = replicas
                .into_iter()
                .map(|peer| async move {
                    let result = self.call(&peer, request).await;
                    (peer, result)
                })
                .collect::<FuturesUnordered<_>>();

            while let Some((peer, result)) = requests.next().await {
                match result {
                    Ok(_) => {
                        acknowledged += 1;
                    },
                    Err(status) => {
                        incr(&self.statistics.num_replica_failures);
                        warn!(
                            target_peer = %peer,
                            request = request.name(),
                            error = %status,
                            "Replica failed to acknowledge write.",
                        );
                        failures.push(peer, status);
                    },
                }
            }

            (acknowledged, failures)
        };

        let (acknowledged, failures) = tokio::select! {
            result = fanout => result,
            _ = self.cancelled() => return Err(DistributorError::ShuttingDown),
        };

        if acknowledged >= quorum {
            if !failures.is_empty() {
                warn!(
                    acknowledged = acknowledged,
                    replicas = num_replicas,
                    failures = %failures,
                    "Write met quorum but is under-replicated until the next rebalance.",
                );
            }
            return Ok(acknowledged);
        }

        incr(&self.statistics.num_quorum_failures);
        error!(
            acknowledged = acknowledged,
            required = quorum,
            failures = %failures,
            "Write failed to reach quorum.",
        );

        Err(DistributorError::QuorumFailed {
            required: quorum,
            acknowledged,
            failures,
        })
    }
}

/// Spreads retries of concurrent callers by up to half the backoff.
fn jittered(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.5);
    backoff.mul_f64(factor)
}
