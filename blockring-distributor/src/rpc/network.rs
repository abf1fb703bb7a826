use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::client::HttpConnector;
use hyper::{Body, Client};
use parking_lot::RwLock;

use super::PeerClient;

#[derive(Clone)]
/// A collection of peer clients which share a single pooled HTTP/2 client.
pub(crate) struct RpcNetwork {
    http: Client<HttpConnector, Body>,
    clients: Arc<RwLock<HashMap<SocketAddr, PeerClient>>>,
}

impl Default for RpcNetwork {
    fn default() -> Self {
        let http = Client::builder().http2_only(true).build_http();
        Self {
            http,
            clients: Default::default(),
        }
    }
}

impl RpcNetwork {
    /// Gets the existing client for a peer or creates a new one.
    pub(crate) fn get_or_connect(&self, addr: SocketAddr) -> PeerClient {
        {
            let guard = self.clients.read();
            if let Some(client) = guard.get(&addr) {
                return client.clone();
            }
        }

        trace!(addr = %addr, "Connect client to network.");
        let client = PeerClient::new(self.http.clone(), addr);
        self.clients
            .write()
            .entry(addr)
            .or_insert(client)
            .clone()
    }

    /// Removes a peer's client from the network.
    pub(crate) fn disconnect(&self, addr: SocketAddr) {
        self.clients.write().remove(&addr);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clients_are_reused() {
        let network = RpcNetwork::default();
        let a = "127.0.0.1:8001".parse().unwrap();
        let b = "127.0.0.1:8002".parse().unwrap();

        network.get_or_connect(a);
        network.get_or_connect(a);
        network.get_or_connect(b);
        assert_eq!(network.len(), 2);

        network.disconnect(a);
        assert_eq!(network.len(), 1);
    }
}
