use crate::device::Device;
use crate::error::{BridgeError, Result};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use tracing::info;

// Tun wraps a real tun device
pub struct Tun {
    device: tun_tap::Iface,
}

impl Tun {
    /// Opens `/dev/net/tun` and attaches it to interface `name` in raw IP
    /// mode (`IFF_TUN | IFF_NO_PI`), non-blocking.
    pub fn open(name: &str) -> Result<Self> {
        let unavailable = |source: io::Error| BridgeError::DeviceUnavailable {
            name: name.to_string(),
            source,
        };

        let device = tun_tap::Iface::without_packet_info(name, tun_tap::Mode::Tun)
            .map_err(unavailable)?;
        device.set_non_blocking().map_err(unavailable)?;

        info!("Opened TUN device {}", device.name());
        Ok(Self { device })
    }
}

impl AsFd for Tun {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is owned by `self.device` and stays open for
        // as long as `self` is borrowed.
        unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) }
    }
}

impl Device for Tun {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.device.send(buf) // Direct passthrough
    }
}
