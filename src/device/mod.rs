mod tun;

pub use self::tun::Tun;

#[cfg(test)]
pub use self::mock::MockDevice;

use std::io;
use std::os::fd::AsFd;

use tracing::{trace, warn};

use crate::error::{BridgeError, Result};

/// Read buffer size for one device packet. Large enough for any IP packet.
pub const MAX_PACKET_SIZE: usize = 65_536;

/// A packet-oriented network device.
///
/// Each `recv` yields exactly one packet and each `send` carries exactly one.
/// Implementations are expected to be non-blocking and to report an empty
/// device as `io::ErrorKind::WouldBlock`.
pub trait Device: AsFd {
    /// Interface name, for logging
    fn name(&self) -> &str;

    /// Receive a packet from the device
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send a packet to the device
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// What happened to a packet handed to [`write_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Dropped,
}

/// Reads one packet, returning `None` once the device has nothing more.
pub fn read_packet(device: &dyn Device, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match device.recv(buf) {
            Ok(0) => return Ok(None),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BridgeError::DeviceIo(e)),
        }
    }
}

/// Writes one packet in a single device write.
///
/// A packet the device cannot take right now, or one the kernel rejects as
/// malformed, is dropped. Any other failure is fatal to the bridge.
pub fn write_packet(device: &dyn Device, packet: &[u8]) -> Result<WriteOutcome> {
    loop {
        match device.send(packet) {
            Ok(n) if n == packet.len() => {
                trace!("{} <- {}", device.name(), describe(packet));
                return Ok(WriteOutcome::Written);
            }
            Ok(n) => {
                warn!(
                    "short write to {}: {} of {} bytes",
                    device.name(),
                    n,
                    packet.len()
                );
                return Ok(WriteOutcome::Dropped);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("{} busy, dropping {} byte packet", device.name(), packet.len());
                return Ok(WriteOutcome::Dropped);
            }
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!(
                    "{} rejected packet ({}): {}",
                    device.name(),
                    describe(packet),
                    e
                );
                return Ok(WriteOutcome::Dropped);
            }
            Err(e) => return Err(BridgeError::DeviceIo(e)),
        }
    }
}

/// One-line summary of a raw IP packet for trace output.
pub fn describe(packet: &[u8]) -> String {
    use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};

    match packet.first().map(|b| b >> 4) {
        Some(4) => match Ipv4HeaderSlice::from_slice(packet) {
            Ok(ip) => format!(
                "IPv4 {} → {} proto={} ({} bytes)",
                ip.source_addr(),
                ip.destination_addr(),
                ip.protocol().0,
                packet.len()
            ),
            Err(_) => format!("malformed IPv4 ({} bytes)", packet.len()),
        },
        Some(6) => match Ipv6HeaderSlice::from_slice(packet) {
            Ok(ip) => format!(
                "IPv6 {} → {} next={} ({} bytes)",
                ip.source_addr(),
                ip.destination_addr(),
                ip.next_header().0,
                packet.len()
            ),
            Err(_) => format!("malformed IPv6 ({} bytes)", packet.len()),
        },
        _ => format!("non-IP ({} bytes)", packet.len()),
    }
}
