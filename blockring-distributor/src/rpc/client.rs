use std::net::SocketAddr;
use std::time::Duration;

use http::{Method, Request, StatusCode};
use hyper::client::HttpConnector;
use hyper::{Body, Client};

use super::messages::{decode, encode};
use super::{Status, StorageReply, StorageRequest, STORAGE_PATH};

#[derive(Clone)]
/// A client for a single peer's storage server.
///
/// This is cheap to clone, connections are pooled by the underlying
/// HTTP/2 client.
pub(crate) struct PeerClient {
    http: Client<HttpConnector, Body>,
    addr: SocketAddr,
    uri: String,
}

impl PeerClient {
    pub(crate) fn new(http: Client<HttpConnector, Body>, addr: SocketAddr) -> Self {
        Self {
            http,
            addr,
            uri: format!("http://{addr}{STORAGE_PATH}"),
        }
    }

    /// Sends a request to the peer and waits for its reply.
    ///
    /// The whole exchange, including connecting, is bounded by `timeout`.
    pub(crate) async fn send(
        &self,
        request: &StorageRequest,
        timeout: Duration,
    ) -> Result<StorageReply, Status> {
        match tokio::time::timeout(timeout, self.send_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(Status::timeout()),
        }
    }

    async fn send_inner(&self, request: &StorageRequest) -> Result<StorageReply, Status> {
        trace!(target_peer = %self.addr, request = request.name(), "Sending request.");
        let buffer = encode(request)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.as_str())
            .body(Body::from(buffer.into_vec()))
            .map_err(Status::internal)?;

        let response = self.http.request(request).await.map_err(Status::connection)?;
        let (parts, body) = response.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .map_err(Status::connection)?;

        match parts.status {
            StatusCode::OK => decode::<StorageReply>(&body),
            StatusCode::BAD_REQUEST => Err(decode::<Status>(&body)?),
            other => Err(Status::internal(format!(
                "Peer responded with unexpected status {other}"
            ))),
        }
    }
}
