//! Wake-on-LAN.

use super::MacAddress;
use anyhow::Context;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::info;

/// Length of a magic packet: six `0xff` bytes followed by the target's hardware address sixteen
/// times.
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Builds the magic packet for `mac`.
pub fn magic_packet(mac: MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xffu8; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac.octets());
    }
    packet
}

/// Sends wake-up requests.
#[async_trait]
pub trait WakeTransmitter: Send + Sync {
    async fn wake(&self, mac: MacAddress) -> anyhow::Result<()>;
}

/// Broadcasts magic packets over UDP.
#[derive(Clone, Debug)]
pub struct UdpWake {
    pub broadcast: Ipv4Addr,
    pub port: u16,
}

impl Default for UdpWake {
    fn default() -> Self {
        Self {
            broadcast: Ipv4Addr::BROADCAST,
            port: 9,
        }
    }
}

#[async_trait]
impl WakeTransmitter for UdpWake {
    async fn wake(&self, mac: MacAddress) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to open a UDP socket for wake-on-LAN")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on the wake-on-LAN socket")?;
        let target = SocketAddrV4::new(self.broadcast, self.port);
        socket
            .send_to(&magic_packet(mac), target)
            .await
            .with_context(|| format!("failed to send magic packet to {target}"))?;
        info!(%mac, %target, "sent wake-on-LAN packet");
        Ok(())
    }
}
