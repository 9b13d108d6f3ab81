//! HTTP gateway: server lifecycle, routing, and the upstream proxy.

pub mod proxy;
pub mod router;
pub mod server;

pub use server::Gateway;
