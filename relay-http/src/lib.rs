//! HTTP/RPC gateway and outbound RPC client. Sole owner of the `axum`
//! dependency in the workspace.

pub mod client;
pub mod gateway;
pub mod response;

pub use client::RpcClient;
pub use gateway::{build_router, HttpGatewayConfig};
pub use response::{sanitize_filename, Redirect, StreamResponse};
