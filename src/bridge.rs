//! The event loop tying the TUN device to local clients.
//!
//! One thread polls the device, the listener and every client socket, then
//! services whatever is ready:
//!
//! ```text
//!   device readable   : TUN ──► encode ──► every session (best effort)
//!   client readable   : session ──► decode ──► TUN
//!   listener readable : accept ──► registry
//! ```

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::config::{BridgeConfig, ReadMode};
use crate::device::{self, Device, Tun, MAX_PACKET_SIZE};
use crate::error::{CloseReason, Result};
use crate::listener::Listener;
use crate::registry::SessionRegistry;
use crate::session::{ClientSession, Disposition, SessionId, SessionStats};

/// Log a flow milestone every this many device packets.
const PACKET_MILESTONE: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Running,
}

/// Running totals for the life of the bridge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Packets read from the TUN device.
    pub packets_from_device: u64,
    /// Client packets the device accepted.
    pub packets_to_device: u64,
    /// Packets dropped at the device: unframeable reads and rejected writes.
    pub device_drops: u64,
    /// Frames dropped because a client's socket was full.
    pub fanout_drops: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Device,
    Listener,
    Client(SessionId),
}

pub struct Bridge {
    device: Option<Box<dyn Device>>,
    listener: Listener,
    registry: SessionRegistry,
    state: BridgeState,
    stop: Arc<AtomicBool>,
    stats: BridgeStats,
    // totals of sessions already closed
    retired: SessionStats,
    read_mode: ReadMode,
    read_budget: usize,
    poll_timeout_ms: u16,
    packet_buf: Vec<u8>,
}

impl Bridge {
    /// Opens the TUN device and binds the local channel described by
    /// `config`.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let device = Tun::open(&config.tun_name)?;
        let listener = Listener::bind(
            &config.socket_path,
            config.socket_mode,
            config.socket_buffer_size,
        )?;
        Ok(Self::new(Box::new(device), listener, config))
    }

    pub fn new(device: Box<dyn Device>, listener: Listener, config: &BridgeConfig) -> Self {
        Self {
            device: Some(device),
            listener,
            registry: SessionRegistry::new(),
            state: BridgeState::Stopped,
            stop: Arc::new(AtomicBool::new(false)),
            stats: BridgeStats::default(),
            retired: SessionStats::default(),
            read_mode: config.device_read_mode,
            read_budget: config.client_read_budget,
            poll_timeout_ms: config.poll_timeout_ms,
            packet_buf: vec![0u8; MAX_PACKET_SIZE],
        }
    }

    /// Flag that makes [`run`](Self::run) return after its current
    /// iteration. Safe to set from a signal handler or another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_device_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn stats(&self) -> BridgeStats {
        let mut totals = self.retired;
        for session in self.registry.iter() {
            let s = session.stats();
            totals.packets_forwarded += s.packets_forwarded;
            totals.frames_received += s.frames_received;
            totals.frames_dropped += s.frames_dropped;
        }
        BridgeStats {
            packets_to_device: totals.packets_forwarded,
            device_drops: self.stats.device_drops
                + (totals.frames_received - totals.packets_forwarded),
            fanout_drops: totals.frames_dropped,
            ..self.stats
        }
    }

    /// Runs until the stop flag is set or a fatal error occurs. Either way
    /// the bridge is shut down before this returns.
    pub fn run(&mut self) -> Result<()> {
        self.state = BridgeState::Running;
        info!("Running...");

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.poll_once() {
                error!("Fatal: {}", e);
                break Err(e);
            }
        };

        self.shutdown();
        result
    }

    /// Waits up to the poll timeout for readiness and services everything
    /// that became ready.
    pub fn poll_once(&mut self) -> Result<()> {
        for (source, events) in self.wait()? {
            match source {
                Source::Listener => self.accept_clients(),
                Source::Device => self.read_device()?,
                Source::Client(id) => self.service_client(id, events)?,
            }
        }
        Ok(())
    }

    fn wait(&self) -> Result<Vec<(Source, PollFlags)>> {
        let mut sources = Vec::with_capacity(self.registry.len() + 2);
        let mut fds = Vec::with_capacity(self.registry.len() + 2);

        if let Some(device) = &self.device {
            sources.push(Source::Device);
            fds.push(PollFd::new(device.as_fd(), PollFlags::POLLIN));
        }
        if let Some(fd) = self.listener.poll_fd() {
            sources.push(Source::Listener);
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        for session in self.registry.iter() {
            let mut events = PollFlags::POLLIN;
            if session.wants_write() {
                events |= PollFlags::POLLOUT;
            }
            sources.push(Source::Client(session.id()));
            fds.push(PollFd::new(session.as_fd(), events));
        }

        match poll(&mut fds, self.poll_timeout_ms) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(sources
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(source, fd)| {
                fd.revents()
                    .filter(|r| !r.is_empty())
                    .map(|r| (source, r))
            })
            .collect())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some(stream)) => {
                    let id = self.registry.insert(stream);
                    self.stats.connections += 1;
                    info!(
                        "Client #{} connected ({} total)",
                        id,
                        self.registry.len()
                    );
                }
                Ok(None) => return,
                Err(e) => {
                    // e.g. EMFILE; the connection stays queued for a later try
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn read_device(&mut self) -> Result<()> {
        loop {
            let Some(dev) = self.device.as_deref() else {
                return Ok(());
            };
            let Some(n) = device::read_packet(dev, &mut self.packet_buf)? else {
                return Ok(());
            };
            let packet = &self.packet_buf[..n];
            trace!("{} -> {}", dev.name(), device::describe(packet));

            self.stats.packets_from_device += 1;
            if self.stats.packets_from_device % PACKET_MILESTONE == 0 {
                info!(
                    "{} packets from {} ({} clients)",
                    self.stats.packets_from_device,
                    dev.name(),
                    self.registry.len()
                );
            }

            match codec::encode(packet) {
                Ok(frame) => self.fan_out(&frame),
                Err(e) => {
                    warn!("dropping device packet: {}", e);
                    self.stats.device_drops += 1;
                }
            }

            if self.read_mode == ReadMode::Single {
                return Ok(());
            }
        }
    }

    fn fan_out(&mut self, frame: &[u8]) {
        let report = self.registry.broadcast(frame);
        if report.dropped > 0 {
            trace!("frame dropped for {} busy client(s)", report.dropped);
        }
        for (session, reason) in report.closed {
            self.retire(session, &reason);
        }
    }

    fn service_client(&mut self, id: SessionId, events: PollFlags) -> Result<()> {
        // may already be gone if a broadcast earlier in this pass closed it
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };

        if events.contains(PollFlags::POLLOUT) {
            if let Err(reason) = session.flush() {
                self.close_session(id, reason);
                return Ok(());
            }
        }

        let disposition = if events.contains(PollFlags::POLLIN) {
            let Some(device) = self.device.as_deref() else {
                return Ok(());
            };
            session.on_readable(device, self.read_budget, &mut self.packet_buf)?
        } else if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        {
            Disposition::Closed(CloseReason::HangUp)
        } else {
            Disposition::WouldBlock
        };

        match disposition {
            Disposition::Continue | Disposition::WouldBlock => {}
            Disposition::Closed(reason) => self.close_session(id, reason),
        }
        Ok(())
    }

    fn close_session(&mut self, id: SessionId, reason: CloseReason) {
        if let Some(session) = self.registry.remove(id) {
            self.retire(session, &reason);
        }
    }

    fn retire(&mut self, session: ClientSession, reason: &CloseReason) {
        match reason {
            CloseReason::PeerClosed => debug!("Client #{}: {}", session.id(), reason),
            _ => warn!("Client #{}: {}", session.id(), reason),
        }
        self.absorb(session.stats());
        drop(session);
        info!("Client disconnected ({} remaining)", self.registry.len());
    }

    fn absorb(&mut self, s: SessionStats) {
        self.retired.frames_received += s.frames_received;
        self.retired.packets_forwarded += s.packets_forwarded;
        self.retired.frames_sent += s.frames_sent;
        self.retired.frames_dropped += s.frames_dropped;
    }

    /// Closes the device, every client and the listener, and removes the
    /// socket file. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        self.state = BridgeState::Stopped;
        if self.device.is_none() && self.registry.is_empty() && !self.listener.is_open() {
            return;
        }

        if let Some(device) = self.device.take() {
            debug!("Closing {}", device.name());
        }
        let sessions: Vec<ClientSession> = self.registry.drain().collect();
        for session in sessions {
            self.absorb(session.stats());
        }
        self.listener.close();

        let stats = self.stats();
        info!(
            "Stopped (processed {} packets, {} to device, {} fan-out drops, {} device drops)",
            stats.packets_from_device,
            stats.packets_to_device,
            stats.fanout_drops,
            stats.device_drops
        );
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
