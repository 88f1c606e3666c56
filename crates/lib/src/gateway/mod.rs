//! Gateway: exposes local serial devices to WebSocket clients.
//!
//! Single port serves HTTP (health) and WebSocket (`/ws`). Each connection owns its own
//! session registry; closing the connection closes every port it opened.

mod connection;
mod devices;
mod registry;
mod server;

pub use connection::Connection;
pub use devices::{DeviceGateway, GatewayError, SessionEvent};
pub use registry::{Session, SessionId, SessionRegistry};
pub use server::{run_gateway, serve};
