use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Dispatcher, Rank};
use crate::message::{
    AddrRequest, ControlMessage, EntityAddr, EntityType, LookupStatus, Message, RegisterResult,
};

/// A reply and the rank whose control endpoint it goes to.
type Reply = (u32, ControlMessage);

/// Bookkeeping of the namer: rank numbers, placements and the lookups
/// deferred until their address starts.
#[derive(Debug)]
pub(crate) struct NamerState {
    next_rank: u32,
    rank_addr: BTreeMap<u32, SocketAddr>,
    rank_by_addr: HashMap<SocketAddr, u32>,
    next_instance: HashMap<EntityType, u32>,
    entity_rank: HashMap<EntityAddr, u32>,
    /// registered, not yet ready
    unstarted: HashSet<EntityAddr>,
    retired: HashSet<EntityAddr>,
    /// address -> (requesting rank, tid), at most one entry per rank
    waiting: HashMap<EntityAddr, Vec<(u32, u64)>>,
    lookups: u64,
}

impl NamerState {
    pub fn new(host_addr: SocketAddr) -> NamerState {
        NamerState {
            next_rank: 1,
            rank_addr: BTreeMap::from([(0, host_addr)]),
            rank_by_addr: HashMap::from([(host_addr, 0)]),
            next_instance: HashMap::new(),
            entity_rank: HashMap::from([(EntityAddr::NAMER, 0)]),
            unstarted: HashSet::new(),
            retired: HashSet::new(),
            waiting: HashMap::new(),
            lookups: 0,
        }
    }

    /// Assigns the next rank number. A rank that reconnects from the same
    /// listen address keeps its number.
    pub fn handle_connect(&mut self, tid: u64, listen_addr: SocketAddr) -> (u32, Reply) {
        let rank = match self.rank_by_addr.get(&listen_addr) {
            Some(rank) => *rank,
            None => {
                let rank = self.next_rank;
                self.next_rank += 1;
                self.rank_addr.insert(rank, listen_addr);
                self.rank_by_addr.insert(listen_addr, rank);
                info!(rank, %listen_addr, "rank admitted");
                rank
            }
        };
        let ranks = self.rank_addr.iter().map(|(r, a)| (*r, *a)).collect();
        (rank, (rank, ControlMessage::ConnectAck { tid, rank, ranks }))
    }

    pub fn handle_register(&mut self, tid: u64, rank: u32, request: AddrRequest) -> Reply {
        let result = match request {
            AddrRequest::Any(kind) if !kind.is_registrable() => {
                RegisterResult::AlreadyRegistered(EntityAddr::new(kind, 0))
            }
            AddrRequest::Any(kind) => {
                let next = self.next_instance.entry(kind).or_insert(0);
                let mut addr = EntityAddr::new(kind, *next);
                while self.entity_rank.contains_key(&addr) || self.retired.contains(&addr) {
                    *next += 1;
                    addr = EntityAddr::new(kind, *next);
                }
                *next += 1;
                self.place(addr, rank);
                RegisterResult::Registered(addr)
            }
            AddrRequest::Exact(addr) => {
                if !addr.kind().is_registrable() || self.entity_rank.contains_key(&addr) {
                    RegisterResult::AlreadyRegistered(addr)
                } else {
                    self.retired.remove(&addr);
                    let next = self.next_instance.entry(addr.kind()).or_insert(0);
                    if addr.num() >= *next {
                        *next = addr.num().saturating_add(1);
                    }
                    self.place(addr, rank);
                    RegisterResult::Registered(addr)
                }
            }
        };
        debug!(?result, rank, "register");
        (rank, ControlMessage::RegisterAck { tid, result })
    }

    fn place(&mut self, addr: EntityAddr, rank: u32) {
        self.entity_rank.insert(addr, rank);
        self.unstarted.insert(addr);
    }

    pub fn handle_lookup(&mut self, from_rank: u32, tid: u64, addr: EntityAddr) -> Reply {
        self.lookups += 1;
        let status = if self.unstarted.contains(&addr) || !self.entity_rank.contains_key(&addr)
        {
            if self.retired.contains(&addr) {
                LookupStatus::NotFound
            } else {
                // a rank asks again after its own lookup expired; only the
                // latest tid is still awaited there
                let waiters = self.waiting.entry(addr).or_default();
                waiters.retain(|(rank, _)| *rank != from_rank);
                waiters.push((from_rank, tid));
                LookupStatus::Deferred
            }
        } else {
            self.status_of(&addr)
        };
        debug!(%addr, from_rank, ?status, "lookup");
        (from_rank, ControlMessage::LookupReply { tid, addr, status })
    }

    pub fn handle_started(&mut self, addr: EntityAddr) -> Vec<Reply> {
        if !self.unstarted.remove(&addr) {
            warn!(%addr, "started an address that is not waiting to start");
        }
        let status = self.status_of(&addr);
        self.flush_waiting(addr, status)
    }

    pub fn handle_unregister(&mut self, addr: EntityAddr) -> Vec<Reply> {
        self.entity_rank.remove(&addr);
        self.unstarted.remove(&addr);
        self.retired.insert(addr);
        debug!(%addr, "retired");
        self.flush_waiting(addr, LookupStatus::NotFound)
    }

    fn flush_waiting(&mut self, addr: EntityAddr, status: LookupStatus) -> Vec<Reply> {
        self.waiting
            .remove(&addr)
            .unwrap_or_default()
            .into_iter()
            .map(|(rank, tid)| (rank, ControlMessage::LookupReply { tid, addr, status }))
            .collect()
    }

    fn status_of(&self, addr: &EntityAddr) -> LookupStatus {
        self.entity_rank
            .get(addr)
            .and_then(|rank| {
                self.rank_addr
                    .get(rank)
                    .map(|socket| LookupStatus::Found {
                        rank: *rank,
                        socket: *socket,
                    })
            })
            .unwrap_or(LookupStatus::NotFound)
    }

    pub fn lookups(&self) -> u64 {
        self.lookups
    }
}

/// The namer entity, `namer0` on rank 0.
pub struct Namer {
    rank: Weak<Rank>,
    state: Mutex<NamerState>,
}

impl Namer {
    pub(crate) fn new(rank: Weak<Rank>, host_addr: SocketAddr) -> Namer {
        Namer {
            rank,
            state: Mutex::new(NamerState::new(host_addr)),
        }
    }

    /// Lookup requests received since the namer started.
    pub fn lookups_received(&self) -> u64 {
        self.state.lock().lookups()
    }

    fn reply(&self, rank: &Rank, replies: Vec<Reply>) {
        for (dest_rank, control) in replies {
            rank.submit_message(control.into_message(EntityAddr::NAMER, EntityAddr::rank(dest_rank)));
        }
    }
}

impl Dispatcher for Namer {
    fn dispatch(&self, msg: Message) {
        let Some(rank) = self.rank.upgrade() else {
            return;
        };
        let control = match ControlMessage::try_from(&msg) {
            Ok(control) => control,
            Err(e) => {
                warn!(source = %msg.source, msg_type = msg.msg_type, "namer ignoring message: {}", e);
                return;
            }
        };
        let replies = match control {
            ControlMessage::ConnectRequest { tid, listen_addr } => {
                let (new_rank, reply) = self.state.lock().handle_connect(tid, listen_addr);
                // the reply is routed by rank number
                rank.learn_rank(new_rank, listen_addr);
                vec![reply]
            }
            ControlMessage::RegisterRequest { tid, rank: on, request } => {
                vec![self.state.lock().handle_register(tid, on, request)]
            }
            ControlMessage::LookupRequest { tid, addr } => {
                if !msg.source.is_rank() {
                    warn!(source = %msg.source, "lookup request not sent by a rank");
                    return;
                }
                vec![self.state.lock().handle_lookup(msg.source.num(), tid, addr)]
            }
            ControlMessage::Started { addr } => self.state.lock().handle_started(addr),
            ControlMessage::Unregister { addr } => self.state.lock().handle_unregister(addr),
            other => {
                warn!(?other, "namer ignoring reply message");
                return;
            }
        };
        self.reply(&rank, replies);
    }
}

impl std::fmt::Debug for Namer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namer").field("state", &*self.state.lock()).finish()
    }
}
