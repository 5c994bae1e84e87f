use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::node::MacAddress;

pub const MAGIC_PACKET_LEN: usize = 102;
const WOL_PORT: u16 = 9;

/// Standard wake-on-LAN frame: six 0xFF bytes followed by the MAC repeated
/// sixteen times.
pub fn magic_packet(mac: MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for repeat in 0..16 {
        packet[6 + repeat * 6..6 + (repeat + 1) * 6].copy_from_slice(&octets);
    }
    packet
}

/// Broadcast a magic packet for the node. Fire-and-forget: failures are
/// logged and swallowed, a node that cannot be woken still gets a normal
/// connect attempt.
pub async fn wake(mac: MacAddress) {
    let target: SocketAddr = (std::net::Ipv4Addr::BROADCAST, WOL_PORT).into();
    if let Err(err) = send_magic_packet(mac, target).await {
        tracing::warn!(
            target = "farmhand::wol",
            mac = %mac,
            error = %err,
            "wake-on-lan packet not sent"
        );
    } else {
        tracing::debug!(target = "farmhand::wol", mac = %mac, "wake-on-lan packet sent");
    }
}

pub(crate) async fn send_magic_packet(
    mac: MacAddress,
    target: SocketAddr,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.send_to(&magic_packet(mac), target).await?;
    Ok(())
}
