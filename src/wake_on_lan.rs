// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use canonical_error::{invalid_argument_error, unavailable_error, CanonicalError};
use log::info;

pub const WAKE_ON_LAN_PORT: u16 = 9;
pub const MAGIC_PACKET_SIZE: usize = 6 + 16 * 6;

/// Parses "00:c0:08:87:35:db" or "00-C0-08-87-35-DB".
pub fn parse_mac(mac: &str) -> Result<[u8; 6], CanonicalError> {
    let bad_mac = || invalid_argument_error(format!("Invalid MAC address {:?}", mac).as_str());
    let parts: Vec<&str> = mac.trim().split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(bad_mac());
    }
    let mut bytes = [0u8; 6];
    for (byte, part) in bytes.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(bad_mac());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| bad_mac())?;
    }
    Ok(bytes)
}

/// Six 0xFF bytes followed by the MAC repeated 16 times.
pub fn magic_packet(mac: &[u8; 6]) -> [u8; MAGIC_PACKET_SIZE] {
    let mut packet = [0xFFu8; MAGIC_PACKET_SIZE];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(mac);
    }
    packet
}

/// Sends the magic packet for `mac` to `target`, normally the broadcast
/// address on port 9.
pub fn send_magic_packet_to(mac: &[u8; 6], target: SocketAddr) -> Result<(), CanonicalError> {
    let io_error = |e: std::io::Error| {
        unavailable_error(format!("Wake on LAN to {} failed: {}", target, e).as_str())
    };
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(io_error)?;
    socket.set_broadcast(true).map_err(io_error)?;
    socket.send_to(&magic_packet(mac), target).map_err(io_error)?;
    Ok(())
}

/// Wakes the mount with the given MAC address.
pub fn wake(mac: &str) -> Result<(), CanonicalError> {
    let mac_bytes = parse_mac(mac)?;
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, WAKE_ON_LAN_PORT));
    send_magic_packet_to(&mac_bytes, target)?;
    info!("Sent wake on LAN packet to {}", mac);
    Ok(())
}
