//! SPDK Storage Engine
//!
//! JSON-RPC transport, typed client and the idempotent service the pool
//! builder drives.

pub mod client;
pub mod jsonrpc;
pub mod service;

pub use client::SpdkClient;
pub use jsonrpc::{
    RpcConnector, RpcConnectorRef, RpcTransport, RpcTransportRef, UnixSocketConnector,
    UnixSocketTransport,
};
pub use service::{bdev_name_for_path, SpdkService};
