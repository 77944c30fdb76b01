use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use tracing::{debug, trace};

use crate::codec::FrameDecoder;
use crate::device::{self, Device, WriteOutcome};
use crate::error::{CloseReason, Result};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Result of servicing a readable session.
#[derive(Debug)]
pub enum Disposition {
    /// Read budget spent; there may be more to read next iteration.
    Continue,
    /// Drained for now.
    WouldBlock,
    /// The session is finished and must be removed.
    Closed(CloseReason),
}

/// Result of offering one frame to a session.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Part of the frame went out; the rest is held until writable.
    Partial,
    Dropped,
    Closed(CloseReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames decoded from the client.
    pub frames_received: u64,
    /// Of those, packets the device accepted.
    pub packets_forwarded: u64,
    /// Frames handed to the socket, fully or partially.
    pub frames_sent: u64,
    /// Frames dropped because the socket was full.
    pub frames_dropped: u64,
}

/// One connected local client.
pub struct ClientSession {
    id: SessionId,
    stream: UnixStream,
    decoder: FrameDecoder,
    state: SessionState,
    // unwritten tail of at most one frame
    pending: Vec<u8>,
    stats: SessionStats,
}

impl ClientSession {
    pub fn new(id: SessionId, stream: UnixStream) -> Self {
        Self {
            id,
            stream,
            decoder: FrameDecoder::new(),
            state: SessionState::Connected,
            pending: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether a partially written frame is waiting for the socket.
    pub fn wants_write(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Reads what the client has sent, forwarding each complete frame to
    /// `device`.
    ///
    /// At most `budget` socket reads are made so one busy client cannot
    /// starve the rest of the loop. `scratch` is the read buffer.
    ///
    /// Only a device failure is returned as `Err`; everything scoped to this
    /// client ends up as `Disposition::Closed`.
    pub fn on_readable(
        &mut self,
        device: &dyn Device,
        budget: usize,
        scratch: &mut [u8],
    ) -> Result<Disposition> {
        if self.state == SessionState::Disconnected {
            return Ok(Disposition::WouldBlock);
        }

        let mut reads = 0;
        while reads < budget {
            let n = match self.stream.read(scratch) {
                Ok(0) => return Ok(self.disconnect(CloseReason::PeerClosed)),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Disposition::WouldBlock)
                }
                Err(e) => return Ok(self.disconnect(CloseReason::Io(e))),
            };
            reads += 1;

            let mut input = &scratch[..n];
            while !input.is_empty() {
                match self.decoder.decode(&mut input) {
                    Ok(Some(packet)) => {
                        self.stats.frames_received += 1;
                        if device::write_packet(device, &packet)? == WriteOutcome::Written {
                            self.stats.packets_forwarded += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Ok(self.disconnect(CloseReason::Protocol(e))),
                }
            }
        }

        trace!("client #{} read budget exhausted", self.id);
        Ok(Disposition::Continue)
    }

    /// Offers one encoded frame to the client without blocking.
    ///
    /// If the socket cannot take any of it the frame is dropped. If it takes
    /// only part, the remainder is kept so the stream stays aligned on frame
    /// boundaries, and later frames are dropped until it has been flushed.
    pub fn send(&mut self, frame: &[u8]) -> SendOutcome {
        if self.state == SessionState::Disconnected {
            return SendOutcome::Dropped;
        }

        if self.wants_write() {
            if let Err(reason) = self.flush() {
                return SendOutcome::Closed(reason);
            }
            if self.wants_write() {
                self.stats.frames_dropped += 1;
                return SendOutcome::Dropped;
            }
        }

        loop {
            match self.stream.write(frame) {
                Ok(n) if n == frame.len() => {
                    self.stats.frames_sent += 1;
                    return SendOutcome::Sent;
                }
                Ok(0) => {
                    self.stats.frames_dropped += 1;
                    return SendOutcome::Dropped;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&frame[n..]);
                    self.stats.frames_sent += 1;
                    return SendOutcome::Partial;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stats.frames_dropped += 1;
                    return SendOutcome::Dropped;
                }
                Err(e) => {
                    self.state = SessionState::Disconnected;
                    return SendOutcome::Closed(CloseReason::Io(e));
                }
            }
        }
    }

    /// Writes as much of the pending tail as the socket will take.
    pub fn flush(&mut self) -> std::result::Result<(), CloseReason> {
        let had_pending = self.wants_write();
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.state = SessionState::Disconnected;
                    return Err(CloseReason::Io(e));
                }
            }
        }
        if had_pending && self.pending.is_empty() {
            debug!("client #{} caught up", self.id);
        }
        Ok(())
    }

    fn disconnect(&mut self, reason: CloseReason) -> Disposition {
        self.state = SessionState::Disconnected;
        Disposition::Closed(reason)
    }
}

impl AsFd for ClientSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
