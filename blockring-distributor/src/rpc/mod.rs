//! The peer to peer storage RPC surface.
//!
//! Every request is a single HTTP/2 `POST` to [STORAGE_PATH] carrying an
//! archived [StorageRequest]. A successful request is answered with `200` and
//! an archived [StorageReply], a failed request with `400` and an archived
//! [Status].

mod client;
mod messages;
mod network;
mod server;
pub(crate) mod services;
mod status;

pub(crate) use client::PeerClient;
pub use messages::{StorageReply, StorageRequest};
pub(crate) use network::RpcNetwork;
pub(crate) use server::RpcServer;
pub use status::{ErrorCode, Status};

/// The path every storage request is sent to.
pub const STORAGE_PATH: &str = "/blockring/storage";
