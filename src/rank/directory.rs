use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::EntityMessenger;
use crate::message::{EntityAddr, Message};
use crate::network::{ConnId, Receiver, Sender};
use crate::AppResult;

/// Messages and callers waiting on one outstanding lookup.
#[derive(Debug, Default)]
pub(crate) struct PendingLookup {
    pub messages: Vec<Message>,
    pub waiters: Vec<oneshot::Sender<AppResult<u32>>>,
}

#[derive(Debug)]
pub(crate) enum ConnKind {
    Sender(Arc<Sender>),
    Receiver(Arc<Receiver>),
}

/// One live or retired connection task.
#[derive(Debug)]
pub(crate) struct ConnSlot {
    pub kind: ConnKind,
    pub handle: JoinHandle<()>,
}

/// Routing state of a rank. Every field is guarded by the rank's single
/// directory lock.
#[derive(Debug, Default)]
pub(crate) struct Directory {
    pub entity_rank: HashMap<EntityAddr, u32>,
    pub rank_addr: HashMap<u32, SocketAddr>,
    /// registered but not ready, with messages held until `ready()`
    pub unready: HashMap<EntityAddr, Vec<Message>>,
    pub waiting_for_lookup: HashMap<EntityAddr, PendingLookup>,
    /// address -> correlation id of the one outstanding lookup
    pub looking_up: HashMap<EntityAddr, u64>,
    pub local: HashMap<EntityAddr, Arc<EntityMessenger>>,
    pub rank_sender: HashMap<u32, Arc<Sender>>,
    pub connections: HashMap<ConnId, ConnSlot>,
    pub sender_reap_queue: Vec<ConnId>,
    pub receiver_reap_queue: Vec<ConnId>,
    /// session -> highest sequence dispatched
    pub sessions: HashMap<u64, u64>,
    /// latest session seen from each peer rank
    pub rank_sessions: HashMap<u32, u64>,
    /// receiver currently reading each session
    pub session_receivers: HashMap<u64, Arc<Receiver>>,
    /// times each rank was declared failed since it was last reached
    pub rank_failures: HashMap<u32, u32>,
    pub stopping: bool,
}

impl Directory {
    pub fn receivers(&self) -> impl Iterator<Item = &Arc<Receiver>> {
        self.connections.values().filter_map(|slot| match &slot.kind {
            ConnKind::Receiver(receiver) => Some(receiver),
            ConnKind::Sender(_) => None,
        })
    }

    pub fn senders(&self) -> impl Iterator<Item = &Arc<Sender>> {
        self.connections.values().filter_map(|slot| match &slot.kind {
            ConnKind::Sender(sender) => Some(sender),
            ConnKind::Receiver(_) => None,
        })
    }

    /// Returns false for a frame that is not newer than the last one
    /// dispatched from the same session; such a frame is a retransmission or
    /// arrived on a connection that has already been replaced.
    pub fn accept_sequence(&mut self, session: u64, seq: u64) -> bool {
        let last = self.sessions.entry(session).or_insert(0);
        if seq <= *last {
            return false;
        }
        *last = seq;
        true
    }

    /// Remembers the current session of a peer rank and forgets the
    /// sequence state of the session it replaces.
    pub fn note_session(&mut self, from_rank: u32, session: u64) {
        if let Some(old) = self.rank_sessions.insert(from_rank, session) {
            if old != session {
                self.sessions.remove(&old);
            }
        }
    }

    /// Drops the sequence state of every session `conn_id` was the current
    /// reader of. A session that already moved to a newer connection keeps
    /// its state.
    pub fn forget_receiver(&mut self, conn_id: ConnId) {
        let ended: Vec<u64> = self
            .session_receivers
            .iter()
            .filter(|(_, receiver)| receiver.conn_id() == conn_id)
            .map(|(session, _)| *session)
            .collect();
        for session in ended {
            self.session_receivers.remove(&session);
            self.sessions.remove(&session);
        }
    }

    /// Forgets every entity placed on `rank` so the next message to any of
    /// them is looked up again.
    pub fn forget_rank(&mut self, rank: u32) -> usize {
        let before = self.entity_rank.len();
        self.entity_rank.retain(|_, r| *r != rank);
        before - self.entity_rank.len()
    }
}
