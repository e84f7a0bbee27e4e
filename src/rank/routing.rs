use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::directory::{ConnKind, ConnSlot, Directory};
use super::{Messenger, Rank};
use crate::message::{ControlMessage, EntityAddr, LookupStatus, Message};
use crate::network::{Receiver, Sender};
use crate::{AppError, AppResult};

impl Rank {
    /// Routes a message from any local producer. Never blocks on the network;
    /// a message for an entity of unknown placement is held until the namer
    /// answers.
    pub fn submit_message(&self, msg: Message) {
        let to_self = {
            let mut dir = self.dir.lock();
            if dir.stopping {
                debug!(dest = %msg.dest, "rank stopping, dropping message");
                return;
            }
            self.route_locked(&mut dir, msg)
        };
        if let Some(msg) = to_self {
            self.dispatch(msg);
        }
    }

    /// Core routing decision, made under the directory lock. Returns the
    /// message when it is addressed to this rank's own control endpoint and
    /// has to be dispatched after the lock is released.
    pub(crate) fn route_locked(&self, dir: &mut Directory, msg: Message) -> Option<Message> {
        let my_rank = self.my_rank();
        let dest = msg.dest;

        let dest_rank = if dest.is_rank() {
            if dest.num() == my_rank {
                return Some(msg);
            }
            dest.num()
        } else if let Some(held) = dir.unready.get_mut(&dest) {
            held.push(msg);
            return None;
        } else if let Some(local) = dir.local.get(&dest) {
            local.queue_message(msg);
            return None;
        } else if let Some(rank) = dir.entity_rank.get(&dest) {
            *rank
        } else {
            dir.waiting_for_lookup
                .entry(dest)
                .or_default()
                .messages
                .push(msg);
            self.lookup_locked(dir, dest);
            return None;
        };

        if dest_rank == my_rank {
            // placement says here but the entity is gone
            warn!(%dest, "dropping message for an entity no longer on this rank");
            dir.entity_rank.remove(&dest);
            return None;
        }

        match self.connect_rank_locked(dir, dest_rank) {
            Some(sender) => {
                if let Err(e) = sender.send(msg) {
                    warn!(dest_rank, "dropping message: {}", e);
                }
            }
            None => warn!(%dest, dest_rank, "dropping message for a rank with no known address"),
        }
        None
    }

    /// Returns the sender for `rank`, creating it on first use.
    pub fn connect_rank(&self, rank: u32) -> AppResult<Arc<Sender>> {
        let mut dir = self.dir.lock();
        if dir.stopping {
            return Err(AppError::ShuttingDown);
        }
        self.connect_rank_locked(&mut dir, rank).ok_or_else(|| {
            AppError::IllegalStateError(format!("rank {} has no known address", rank))
        })
    }

    fn connect_rank_locked(&self, dir: &mut Directory, rank: u32) -> Option<Arc<Sender>> {
        if let Some(sender) = dir.rank_sender.get(&rank) {
            return Some(sender.clone());
        }
        if dir.stopping {
            return None;
        }
        let socket_addr = *dir.rank_addr.get(&rank)?;
        let this = self.this.upgrade()?;
        let conn_id = self.next_conn_id();
        let (sender, handle) = Sender::start(conn_id, rank, socket_addr, &this);
        dir.rank_sender.insert(rank, sender.clone());
        dir.connections.insert(
            conn_id,
            ConnSlot {
                kind: ConnKind::Sender(sender.clone()),
                handle,
            },
        );
        debug!(rank, addr = %socket_addr, conn_id, "sender created");
        Some(sender)
    }

    pub(crate) fn spawn_receiver(&self, socket: TcpStream, peer: SocketAddr) {
        let mut dir = self.dir.lock();
        if dir.stopping {
            debug!(%peer, "rank stopping, refusing connection");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let conn_id = self.next_conn_id();
        let (receiver, handle) = Receiver::start(conn_id, socket, peer, &this);
        dir.connections.insert(
            conn_id,
            ConnSlot {
                kind: ConnKind::Receiver(receiver),
                handle,
            },
        );
        debug!(%peer, conn_id, "receiver created");
    }

    /// Starts resolving `addr` unless its placement is already known.
    pub fn lookup(&self, addr: EntityAddr) {
        let mut dir = self.dir.lock();
        if dir.stopping || dir.entity_rank.contains_key(&addr) {
            return;
        }
        self.lookup_locked(&mut dir, addr);
    }

    /// Asks the namer where `addr` lives, unless a lookup for it is already
    /// outstanding.
    fn lookup_locked(&self, dir: &mut Directory, addr: EntityAddr) {
        if dir.looking_up.contains_key(&addr) {
            trace!(%addr, "lookup already outstanding");
            return;
        }
        let tid = self.next_tid();
        dir.looking_up.insert(addr, tid);
        debug!(%addr, tid, "looking up");

        let request = ControlMessage::LookupRequest { tid, addr }
            .into_message(EntityAddr::rank(self.my_rank()), EntityAddr::NAMER);
        if self.route_locked(dir, request).is_some() {
            warn!(%addr, "lookup request routed back to this rank");
        }

        let rank = self.this.clone();
        let timeout = self.config.lookup_timeout();
        self.runtime.spawn(async move {
            time::sleep(timeout).await;
            if let Some(rank) = rank.upgrade() {
                rank.expire_lookup(addr, tid);
            }
        });
    }

    /// Gives up on lookup `tid` if it is still the outstanding one for `addr`.
    pub(crate) fn expire_lookup(&self, addr: EntityAddr, tid: u64) {
        let pending = {
            let mut dir = self.dir.lock();
            if dir.looking_up.get(&addr) != Some(&tid) {
                return;
            }
            dir.looking_up.remove(&addr);
            dir.waiting_for_lookup.remove(&addr)
        };
        let Some(pending) = pending else {
            return;
        };
        warn!(
            %addr,
            tid,
            dropped = pending.messages.len(),
            "lookup timed out"
        );
        for waiter in pending.waiters {
            let _ = waiter.send(Err(AppError::Timeout(format!("lookup of {}", addr))));
        }
    }

    /// Returns the rank `addr` lives on, asking the namer if necessary.
    pub async fn resolve(&self, addr: EntityAddr) -> AppResult<u32> {
        let rx = {
            let mut dir = self.dir.lock();
            if dir.stopping {
                return Err(AppError::ShuttingDown);
            }
            if let Some(rank) = dir.entity_rank.get(&addr) {
                return Ok(*rank);
            }
            let (tx, rx) = oneshot::channel();
            dir.waiting_for_lookup
                .entry(addr)
                .or_default()
                .waiters
                .push(tx);
            self.lookup_locked(&mut dir, addr);
            rx
        };
        rx.await.map_err(|_| AppError::ShuttingDown)?
    }

    /// Hands an incoming message to its local destination.
    pub fn dispatch(&self, msg: Message) {
        let control = {
            let mut dir = self.dir.lock();
            self.dispatch_locked(&mut dir, msg)
        };
        if let Some(msg) = control {
            self.handle_rank_control(msg);
        }
    }

    fn dispatch_locked(&self, dir: &mut Directory, msg: Message) -> Option<Message> {
        if msg.dest.is_rank() {
            return Some(msg);
        }
        if let Some(held) = dir.unready.get_mut(&msg.dest) {
            held.push(msg);
        } else if let Some(local) = dir.local.get(&msg.dest) {
            local.queue_message(msg);
        } else {
            warn!(
                dest = %msg.dest,
                source = %msg.source,
                msg_type = msg.msg_type,
                "dropping message for an entity not on this rank"
            );
        }
        None
    }

    /// Entry point of receivers. Frames not newer than the last one seen from
    /// their session are duplicates of something already dispatched.
    pub(crate) fn deliver(&self, session: u64, seq: u64, msg: Message) {
        let control = {
            let mut dir = self.dir.lock();
            if !dir.accept_sequence(session, seq) {
                debug!(session, seq, source = %msg.source, "dropping duplicate frame");
                return;
            }
            self.dispatch_locked(&mut dir, msg)
        };
        if let Some(msg) = control {
            self.handle_rank_control(msg);
        }
    }

    /// Records which receiver now reads `session`. Returns the receiver it
    /// replaces when the sender reconnected.
    pub(crate) fn note_session(
        &self,
        from_rank: Option<u32>,
        session: u64,
        receiver: &Arc<Receiver>,
    ) -> Option<Arc<Receiver>> {
        let mut dir = self.dir.lock();
        if let Some(from_rank) = from_rank {
            dir.note_session(from_rank, session);
        }
        dir.session_receivers
            .insert(session, receiver.clone())
            .filter(|previous| previous.conn_id() != receiver.conn_id())
    }

    /// Clears the failure count of a rank once a sender got through to it.
    pub(crate) fn rank_reachable(&self, rank: u32) {
        let mut dir = self.dir.lock();
        if dir.rank_failures.remove(&rank).is_some() {
            debug!(rank, "rank reachable again");
        }
    }

    /// Records the address of a rank the namer has just admitted.
    pub(crate) fn learn_rank(&self, rank: u32, addr: SocketAddr) {
        if rank != self.my_rank() {
            self.dir.lock().rank_addr.insert(rank, addr);
        }
    }

    fn handle_rank_control(&self, msg: Message) {
        let control = match ControlMessage::try_from(&msg) {
            Ok(control) => control,
            Err(e) => {
                warn!(source = %msg.source, msg_type = msg.msg_type, "bad control message: {}", e);
                return;
            }
        };
        match control {
            ControlMessage::ConnectAck { tid, .. } | ControlMessage::RegisterAck { tid, .. } => {
                self.complete_reply(tid, control)
            }
            ControlMessage::LookupReply { tid, addr, status } => {
                self.handle_lookup_reply(tid, addr, status)
            }
            other => warn!(?other, "unexpected control message for the rank endpoint"),
        }
    }

    fn handle_lookup_reply(&self, tid: u64, addr: EntityAddr, status: LookupStatus) {
        match status {
            LookupStatus::Deferred => {
                debug!(%addr, tid, "lookup deferred until the entity starts");
            }
            LookupStatus::Found { rank, socket } => {
                let mut to_self = Vec::new();
                let waiters = {
                    let mut dir = self.dir.lock();
                    if dir.looking_up.get(&addr) == Some(&tid) {
                        dir.looking_up.remove(&addr);
                    }
                    if rank != self.my_rank() {
                        dir.rank_addr.insert(rank, socket);
                        dir.entity_rank.insert(addr, rank);
                    }
                    let pending = dir.waiting_for_lookup.remove(&addr).unwrap_or_default();
                    debug!(%addr, rank, flushed = pending.messages.len(), "lookup resolved");
                    for msg in pending.messages {
                        if let Some(msg) = self.route_locked(&mut dir, msg) {
                            to_self.push(msg);
                        }
                    }
                    pending.waiters
                };
                for waiter in waiters {
                    let _ = waiter.send(Ok(rank));
                }
                for msg in to_self {
                    self.dispatch(msg);
                }
            }
            LookupStatus::NotFound => {
                let pending = {
                    let mut dir = self.dir.lock();
                    if dir.looking_up.get(&addr) == Some(&tid) {
                        dir.looking_up.remove(&addr);
                    }
                    dir.entity_rank.remove(&addr);
                    dir.waiting_for_lookup.remove(&addr).unwrap_or_default()
                };
                warn!(%addr, dropped = pending.messages.len(), "lookup found no such entity");
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(AppError::NotFound(addr)));
                }
            }
        }
    }

    /// Declares the destination of `sender` failed. The sender leaves the
    /// table, every placement on that rank is forgotten and the undelivered
    /// messages are routed again, which looks their destinations up anew.
    /// A rank that keeps failing without ever being reached has its messages
    /// dropped instead.
    pub(crate) fn fail_rank(&self, sender: &Sender, retained: Vec<Message>) {
        let dest_rank = sender.dest_rank();
        let mut kicked = Vec::new();
        let mut to_self = Vec::new();
        {
            let mut dir = self.dir.lock();
            if matches!(dir.rank_sender.get(&dest_rank), Some(s) if s.conn_id() == sender.conn_id())
            {
                dir.rank_sender.remove(&dest_rank);
            }
            let mut messages = retained;
            messages.extend(sender.close_and_drain());
            if dir.stopping {
                if !messages.is_empty() {
                    warn!(dest_rank, dropped = messages.len(), "rank stopping, dropping messages");
                }
                return;
            }

            let forgotten = dir.forget_rank(dest_rank);
            let failures = dir.rank_failures.entry(dest_rank).or_insert(0);
            *failures += 1;
            let give_up = *failures > self.config.sender.max_reroutes;
            info!(
                dest_rank,
                forgotten,
                failures = *failures,
                pending = messages.len(),
                "rank declared failed"
            );
            for addr in sender.entities() {
                if let Some(local) = dir.local.get(&addr) {
                    kicked.push(local.clone());
                }
            }
            if give_up {
                // the namer keeps placing these addresses on the dead rank
                if !messages.is_empty() {
                    warn!(
                        dest_rank,
                        dropped = messages.len(),
                        "rank keeps failing, dropping its messages"
                    );
                }
                messages.clear();
            }
            for msg in messages {
                if msg.dest.is_rank() {
                    warn!(dest = %msg.dest, msg_type = msg.msg_type, "dropping control message for a failed rank");
                    continue;
                }
                if let Some(msg) = self.route_locked(&mut dir, msg) {
                    to_self.push(msg);
                }
            }
        }
        for entity in kicked {
            entity.callback_kick();
        }
        for msg in to_self {
            self.dispatch(msg);
        }
    }
}
