use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;

use crate::error::CloseReason;
use crate::session::{ClientSession, SendOutcome, SessionId};

/// Outcome of one broadcast pass.
#[derive(Default)]
pub struct Broadcast {
    pub delivered: usize,
    pub dropped: usize,
    /// Sessions that failed during the pass, already taken out of the
    /// registry. Dropping them closes their sockets.
    pub closed: Vec<(ClientSession, CloseReason)>,
}

/// The connected clients, in accept order.
///
/// Owned by the event loop; sessions leave only through [`remove`],
/// [`broadcast`] or [`drain`], each of which hands the session back so its
/// socket is closed exactly once when it is dropped.
///
/// [`remove`]: SessionRegistry::remove
/// [`broadcast`]: SessionRegistry::broadcast
/// [`drain`]: SessionRegistry::drain
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Vec<ClientSession>,
    next_id: SessionId,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted stream and returns its session id.
    pub fn insert(&mut self, stream: UnixStream) -> SessionId {
        debug_assert!(
            !self
                .sessions
                .iter()
                .any(|s| s.as_fd().as_raw_fd() == stream.as_raw_fd()),
            "descriptor registered twice"
        );
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.push(ClientSession::new(id, stream));
        id
    }

    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        let index = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(index))
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter()
    }

    /// Offers `frame` to every session.
    ///
    /// Every session present when the pass starts is visited exactly once.
    /// Failed sessions are only removed after the pass completes.
    pub fn broadcast(&mut self, frame: &[u8]) -> Broadcast {
        let mut report = Broadcast::default();
        let mut failed = Vec::new();

        for session in self.sessions.iter_mut() {
            match session.send(frame) {
                SendOutcome::Sent | SendOutcome::Partial => report.delivered += 1,
                SendOutcome::Dropped => report.dropped += 1,
                SendOutcome::Closed(reason) => failed.push((session.id(), reason)),
            }
        }

        for (id, reason) in failed {
            if let Some(session) = self.remove(id) {
                report.closed.push((session, reason));
            }
        }
        report
    }

    /// Removes every session, leaving the registry empty.
    pub fn drain(&mut self) -> std::vec::Drain<'_, ClientSession> {
        self.sessions.drain(..)
    }
}
