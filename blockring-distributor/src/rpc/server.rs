use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{Method, Request, Response, StatusCode};
use hyper::body::HttpBody;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Body;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::messages::{decode, encode};
use super::services::StorageServer;
use super::{Status, StorageReply, StorageRequest, STORAGE_PATH};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running peer facing storage server.
pub(crate) struct RpcServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RpcServer {
    /// Binds to the given address and starts serving storage requests.
    pub(crate) fn listen(
        bind_addr: SocketAddr,
        service: Arc<StorageServer>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let builder = hyper::Server::from_tcp(listener)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let make_service = make_service_fn(move |socket: &AddrStream| {
            let remote_addr = socket.remote_addr();
            let service = service.clone();

            async move {
                let handler =
                    move |req| handle_connection(req, service.clone(), remote_addr);
                Ok::<_, Infallible>(service_fn(handler))
            }
        });

        let (shutdown, signal) = oneshot::channel::<()>();
        let server = builder
            .tcp_nodelay(true)
            .http2_only(true)
            .http2_adaptive_window(true)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = signal.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = ?e, "Server failed to handle requests.");
            }
        });

        info!(listen_addr = %local_addr, "Storage server is listening.");

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new requests and waits for in-flight requests to finish.
    ///
    /// Connections which are still open after a short grace period are dropped.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(());

        let mut handle = self.handle;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!(listen_addr = %self.local_addr, "Storage server did not drain in time, aborting.");
            handle.abort();
        }
    }
}

async fn handle_connection(
    req: Request<Body>,
    service: Arc<StorageServer>,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let (parts, body) = req.into_parts();

    if parts.method != Method::POST || parts.uri.path() != STORAGE_PATH {
        let status = Status::internal(format!("Unknown endpoint {}", parts.uri.path()));
        return Ok(into_response(Err(status)));
    }

    let body = match read_body(body, service.max_request_size()).await {
        Ok(body) => body,
        Err(status) => {
            warn!(error = %status, remote_addr = %remote_addr, "Failed to read request body.");
            return Ok(into_response(Err(status)));
        },
    };

    let result = match decode::<StorageRequest>(&body) {
        Ok(request) => {
            trace!(remote_addr = %remote_addr, request = request.name(), "Handling request.");
            service.handle(request).await
        },
        Err(status) => Err(status),
    };

    Ok(into_response(result))
}

/// Buffers a request body, rejecting it as soon as it exceeds `limit` bytes.
async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, Status> {
    if body.size_hint().lower() > limit as u64 {
        return Err(Status::payload_too_large(limit));
    }

    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(Status::connection)?;
        if buffer.len() + chunk.len() > limit {
            return Err(Status::payload_too_large(limit));
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}

fn into_response(result: Result<StorageReply, Status>) -> Response<Body> {
    let (code, buffer) = match result {
        Ok(reply) => (StatusCode::OK, encode(&reply)),
        Err(status) => (StatusCode::BAD_REQUEST, encode(&status)),
    };

    match buffer {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer.into_vec()));
            (*response.status_mut()) = code;
            response
        },
        Err(e) => {
            error!(error = ?e, "Failed to serialize response.");
            let mut response = Response::new(Body::empty());
            (*response.status_mut()) = StatusCode::INTERNAL_SERVER_ERROR;
            response
        },
    }
}

#[cfg(test)]
mod tests {
    use hyper::Client;

    use super::*;
    use crate::core::BlockId;
    use crate::rpc::{ErrorCode, PeerClient};
    use crate::storage::{MemoryBlockStore, MemoryINodeStore};

    #[tokio::test]
    async fn test_oversized_requests_are_rejected_unread() {
        let _ = tracing_subscriber::fmt::try_init();

        let service = Arc::new(StorageServer::new(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(MemoryINodeStore::default()),
            16,
        ));
        let addr = test_helper::get_unused_addr();
        let server = RpcServer::listen(addr, service.clone()).expect("Start server");

        let http = Client::builder().http2_only(true).build_http();
        let client = PeerClient::new(http, server.local_addr());
        let timeout = Duration::from_secs(2);

        let id = BlockId::new(1, 1, 0);
        let oversized = StorageRequest::PutBlock {
            id,
            data: vec![7; service.max_request_size() + 1],
        };
        let status = client
            .send(&oversized, timeout)
            .await
            .expect_err("Request should be rejected");
        assert_eq!(status.code, ErrorCode::InvalidPayload);

        // Slightly too large blocks still reach the handler's own validation.
        let too_big = StorageRequest::PutBlock {
            id,
            data: vec![7; 17],
        };
        let status = client
            .send(&too_big, timeout)
            .await
            .expect_err("Block should be rejected");
        assert_eq!(status.code, ErrorCode::InvalidKey);

        let fits = StorageRequest::PutBlock {
            id,
            data: vec![7; 16],
        };
        assert_eq!(
            client.send(&fits, timeout).await.expect("Put block"),
            StorageReply::Ack
        );

        server.shutdown().await;
    }
}
