//! Overlay-network seam.
//!
//! Only two contracts are consumed from the external overlay client: dialing
//! a stream into the mesh for the gateway websocket, and bringing the link
//! back up after a wake. A plain-TCP implementation stands in when no
//! overlay client is wired up.

use std::{io, time::Duration};

use {anyhow::Result, async_trait::async_trait, tokio::net::TcpStream};

use inknode_gateway::transport::{RawStream, StreamDialer};

#[async_trait]
pub trait OverlayNet: StreamDialer {
    /// Block until the overlay link is usable again, bounded by `timeout`.
    /// The gateway reconnect depends on this completing.
    async fn up(&self, timeout: Duration) -> Result<()>;
}

pub struct TcpOverlay;

#[async_trait]
impl StreamDialer for TcpOverlay {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn RawStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl OverlayNet for TcpOverlay {
    async fn up(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
