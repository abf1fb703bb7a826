pub(crate) mod storage_impl;

pub use storage_impl::StorageServer;
