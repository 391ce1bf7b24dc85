use crate::error::Result;
use crate::protocol::StatePacket;
use std::net::SocketAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};

const MAX_DATAGRAM: usize = 65536;

/// UDP endpoint for inbound state packets
///
/// No authentication: any datagram that reaches the socket is trusted.
pub struct Receiver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl Receiver {
    /// Bind the listening socket
    ///
    /// Failure here means the environment is unusable and should be treated
    /// as fatal by the caller.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("Listening for state packets on udp://{}", socket.local_addr()?);
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next datagram that decodes
    ///
    /// Read errors and malformed datagrams are logged and skipped.
    pub async fn recv(&mut self) -> StatePacket {
        loop {
            let (len, peer) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("UDP read error: {}", e);
                    continue;
                }
            };
            match StatePacket::decode(&self.buf[..len]) {
                Ok(packet) => return packet,
                Err(e) => tracing::warn!("Dropping malformed packet from {}: {}", peer, e),
            }
        }
    }
}
