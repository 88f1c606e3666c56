//! serialnet core library: serial ports tunneled over WebSocket.
//!
//! The gateway side exposes local devices (real or simulated); the client side opens them
//! remotely as [`client::RemotePort`]s. Both speak the JSON protocol in [`protocol`].

pub mod client;
pub mod config;
pub mod device;
pub mod gateway;
pub mod protocol;
