//! Gateway client for inknode.
//!
//! Dials the gateway over a websocket (optionally through an overlay-network
//! stream), performs the challenge/connect handshake with a signed device
//! identity, services `node.invoke.request` frames, and reconnects with
//! exponential backoff when the link drops.

pub mod client;
pub mod device_token;
pub mod error;
pub mod identity;
pub mod node;
pub mod transport;

pub use client::{Client, Config, InvokeHandler, RegisteredHook};
pub use error::ClientError;
pub use identity::{build_device_auth_payload, DeviceIdentity};
pub use node::{default_registration, NodeRegistration};
