//! The per-process router.
//!
//! A `Rank` owns the directory of where every known entity lives, the
//! senders and receivers connecting it to other ranks, and the mailboxes of
//! the entities registered on it. Rank 0 also hosts the namer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

pub use entity::{Dispatcher, EntityMessenger, EntityState, Messenger};
pub use namer::Namer;

use crate::message::{
    AddrRequest, ControlMessage, EntityAddr, RegisterResult, RANK_UNASSIGNED,
};
use crate::network::Accepter;
use crate::{AppError, AppResult, MessengerConfig, Shutdown};
use directory::Directory;

mod directory;
mod entity;
mod namer;
mod reaper;
mod routing;

/// Point-in-time counters of a rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankStats {
    pub rank: Option<u32>,
    pub senders: usize,
    pub receivers: usize,
    /// live plus retired-but-not-reaped connection tasks
    pub connections: usize,
    pub reaped: u64,
    pub local_entities: usize,
    pub known_entities: usize,
    pub pending_lookups: usize,
    /// inbound sessions with sequence state
    pub sessions: usize,
    /// lookup requests received by the namer, when this rank hosts it
    pub namer_lookups: Option<u64>,
}

pub struct Rank {
    config: Arc<MessengerConfig>,
    my_rank: AtomicU32,
    listen_addr: SocketAddr,
    dir: Mutex<Directory>,
    /// register and connect round trips waiting for their reply, by tid
    pending: DashMap<u64, oneshot::Sender<ControlMessage>>,
    next_tid: AtomicU64,
    next_conn_id: AtomicU64,
    namer: OnceLock<Arc<Namer>>,
    notify_shutdown: broadcast::Sender<()>,
    reap_notify: Notify,
    /// number of registered application entities, for `wait()`
    entity_count: watch::Sender<usize>,
    runtime: Handle,
    /// accepter and reaper
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reaped: AtomicU64,
    this: Weak<Rank>,
}

impl Rank {
    /// Binds the listener and joins the cluster.
    ///
    /// Without a configured namer address this process becomes rank 0 and
    /// hosts the namer. Otherwise it introduces itself to the namer and waits
    /// for its rank number and the current rank table. A bind failure is
    /// fatal and not retried.
    #[tracing::instrument(skip(config), fields(listen = %config.listen_address()))]
    pub async fn start(config: MessengerConfig) -> AppResult<Arc<Rank>> {
        config.validate()?;
        let config = Arc::new(config);
        let listen_address = config.listen_address();

        let listener = match TcpListener::bind(listen_address.as_str()).await {
            Ok(listener) => listener,
            Err(cause) => {
                error!(
                    "Failed to bind rank to address: {} - Error: {}",
                    listen_address, cause
                );
                return Err(AppError::Bind {
                    addr: listen_address,
                    cause,
                });
            }
        };
        let listen_addr = listener.local_addr()?;
        info!("rank binding to {} for listening", listen_addr);

        let namer_addr = config.namer_addr()?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (entity_count, _) = watch::channel(0);

        let rank = Arc::new_cyclic(|this| Rank {
            config,
            my_rank: AtomicU32::new(RANK_UNASSIGNED),
            listen_addr,
            dir: Mutex::new(Directory::default()),
            pending: DashMap::new(),
            next_tid: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
            namer: OnceLock::new(),
            notify_shutdown,
            reap_notify: Notify::new(),
            entity_count,
            runtime: Handle::current(),
            tasks: Mutex::new(Vec::new()),
            reaped: AtomicU64::new(0),
            this: this.clone(),
        });

        let accepter = Accepter::new(listener, &rank)?;
        let accepter_handle = rank.runtime.spawn(accepter.run());
        let reaper_handle = rank.spawn_reaper();
        rank.tasks.lock().extend([accepter_handle, reaper_handle]);

        let joined = match namer_addr {
            None => rank.host_namer(),
            Some(addr) => rank.join_cluster(addr).await,
        };
        if let Err(e) = joined {
            error!("rank startup failed: {}", e);
            rank.shutdown().await;
            return Err(e);
        }
        Ok(rank)
    }

    fn host_namer(&self) -> AppResult<()> {
        self.my_rank.store(0, Ordering::Release);
        {
            let mut dir = self.dir.lock();
            dir.rank_addr.insert(0, self.listen_addr);
            dir.entity_rank.insert(EntityAddr::NAMER, 0);
        }
        let namer = Arc::new(Namer::new(self.this.clone(), self.listen_addr));
        let messenger = self.create_entity(EntityAddr::NAMER);
        messenger.set_dispatcher(namer.clone());
        messenger.ready()?;
        let _ = self.namer.set(namer);
        info!(addr = %self.listen_addr, "hosting namer as rank 0");
        Ok(())
    }

    async fn join_cluster(&self, namer_addr: SocketAddr) -> AppResult<()> {
        {
            let mut dir = self.dir.lock();
            dir.rank_addr.insert(0, namer_addr);
            dir.entity_rank.insert(EntityAddr::NAMER, 0);
        }
        let tid = self.next_tid();
        let reply = self.expect_reply(tid);
        let request = ControlMessage::ConnectRequest {
            tid,
            listen_addr: self.listen_addr,
        };
        self.submit_message(
            request.into_message(EntityAddr::rank(RANK_UNASSIGNED), EntityAddr::NAMER),
        );

        let what = format!("connect to namer at {}", namer_addr);
        match self
            .await_reply(tid, reply, self.config.connect_timeout(), what)
            .await?
        {
            ControlMessage::ConnectAck { rank, ranks, .. } => {
                self.my_rank.store(rank, Ordering::Release);
                let mut dir = self.dir.lock();
                for (r, addr) in ranks {
                    if r != rank {
                        dir.rank_addr.insert(r, addr);
                    }
                }
                info!(rank, known_ranks = dir.rank_addr.len(), "joined cluster");
                Ok(())
            }
            other => Err(AppError::IllegalStateError(format!(
                "unexpected reply to connect request: {:?}",
                other
            ))),
        }
    }

    /// Registers an entity with the namer and returns its messenger, not yet
    /// ready. Messages for it are held until `EntityMessenger::ready`.
    #[tracing::instrument(skip(self, request), fields(rank = self.my_rank()))]
    pub async fn register_entity(
        &self,
        request: impl Into<AddrRequest>,
    ) -> AppResult<Arc<EntityMessenger>> {
        let request = request.into();
        if self.is_stopping() {
            return Err(AppError::ShuttingDown);
        }
        if !request.kind().is_registrable() {
            return Err(AppError::InvalidValue(format!(
                "{} entities are owned by the messaging layer",
                request.kind().name()
            )));
        }
        let my_rank = self
            .assigned_rank()
            .ok_or_else(|| AppError::IllegalStateError("rank has no number yet".to_string()))?;

        let tid = self.next_tid();
        let reply = self.expect_reply(tid);
        let message = ControlMessage::RegisterRequest {
            tid,
            rank: my_rank,
            request,
        };
        self.submit_message(message.into_message(EntityAddr::rank(my_rank), EntityAddr::NAMER));

        let what = format!("registration of {:?}", request);
        match self
            .await_reply(tid, reply, self.config.register_timeout(), what)
            .await?
        {
            ControlMessage::RegisterAck {
                result: RegisterResult::Registered(addr),
                ..
            } => {
                info!(%addr, "entity registered");
                Ok(self.create_entity(addr))
            }
            ControlMessage::RegisterAck {
                result: RegisterResult::AlreadyRegistered(addr),
                ..
            } => Err(AppError::AlreadyRegistered(addr)),
            other => Err(AppError::IllegalStateError(format!(
                "unexpected reply to register request: {:?}",
                other
            ))),
        }
    }

    fn create_entity(&self, addr: EntityAddr) -> Arc<EntityMessenger> {
        let messenger = EntityMessenger::new(addr, self.this.clone(), self.runtime.clone());
        let my_rank = self.my_rank();
        {
            let mut dir = self.dir.lock();
            dir.local.insert(addr, messenger.clone());
            dir.entity_rank.insert(addr, my_rank);
            dir.unready.entry(addr).or_default();
        }
        if addr.kind().is_registrable() {
            self.entity_count.send_modify(|count| *count += 1);
        }
        messenger
    }

    /// Moves a registered entity to live dispatch: hands it whatever was held
    /// for it and tells the namer it can be found.
    pub(crate) fn entity_ready(&self, addr: EntityAddr) -> AppResult<()> {
        {
            let mut dir = self.dir.lock();
            let held = dir.unready.remove(&addr).ok_or_else(|| {
                AppError::IllegalStateError(format!("{} is not waiting to become ready", addr))
            })?;
            let Some(messenger) = dir.local.get(&addr) else {
                return Err(AppError::IllegalStateError(format!(
                    "{} is not registered on this rank",
                    addr
                )));
            };
            if !held.is_empty() {
                debug!(%addr, held = held.len(), "flushing messages held until ready");
            }
            messenger.queue_messages(held);
        }
        if addr != EntityAddr::NAMER {
            let started = ControlMessage::Started { addr };
            self.submit_message(started.into_message(addr, EntityAddr::NAMER));
        }
        Ok(())
    }

    /// Removes the entity from this rank and the namer and stops its
    /// dispatch task once the mailbox is drained.
    pub fn unregister_entity(&self, entity: &EntityMessenger) {
        let addr = entity.addr();
        let dropped = {
            let mut dir = self.dir.lock();
            let registered = matches!(
                dir.local.get(&addr),
                Some(current) if std::ptr::eq(Arc::as_ptr(current), entity)
            );
            if !registered {
                drop(dir);
                debug!(%addr, "unregister of an entity that is not registered here");
                entity.close_mailbox();
                return;
            }
            dir.local.remove(&addr);
            dir.entity_rank.remove(&addr);
            dir.unready.remove(&addr).map_or(0, |held| held.len())
        };
        if dropped > 0 {
            warn!(%addr, dropped, "dropping messages held for an entity that never became ready");
        }
        entity.close_mailbox();

        if addr != EntityAddr::NAMER && !self.is_stopping() {
            let unregister = ControlMessage::Unregister { addr };
            self.submit_message(
                unregister.into_message(EntityAddr::rank(self.my_rank()), EntityAddr::NAMER),
            );
        }
        if addr.kind().is_registrable() {
            self.entity_count
                .send_modify(|count| *count = count.saturating_sub(1));
        }
        info!(%addr, "entity unregistered");
    }

    /// Resolves once no application entity is registered on this rank.
    pub async fn wait(&self) {
        let mut count = self.entity_count.subscribe();
        loop {
            if *count.borrow_and_update() == 0 {
                return;
            }
            if count.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops the accepter, every sender and receiver, and closes all local
    /// mailboxes. Returns after the connection tasks have been reaped.
    pub async fn shutdown(&self) {
        let (senders, receivers, entities, dropped) = {
            let mut dir = self.dir.lock();
            if dir.stopping {
                return;
            }
            dir.stopping = true;
            let senders: Vec<_> = dir.senders().cloned().collect();
            let receivers: Vec<_> = dir.receivers().cloned().collect();
            let entities: Vec<_> = dir.local.drain().map(|(_, e)| e).collect();
            dir.rank_sender.clear();
            dir.looking_up.clear();
            // waiters see their channel close
            let waiting: usize = dir
                .waiting_for_lookup
                .drain()
                .map(|(_, pending)| pending.messages.len())
                .sum();
            let held: usize = dir.unready.drain().map(|(_, held)| held.len()).sum();
            (senders, receivers, entities, waiting + held)
        };
        info!(rank = self.my_rank(), "rank shutting down");
        if dropped > 0 {
            warn!(dropped, "dropping messages still waiting for lookup or ready");
        }

        let _ = self.notify_shutdown.send(());
        for sender in &senders {
            sender.stop();
        }
        for receiver in &receivers {
            receiver.stop();
        }
        for entity in &entities {
            entity.close_mailbox();
        }
        self.pending.clear();
        self.entity_count.send_modify(|count| *count = 0);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("rank task failed: {}", e);
            }
        }

        // the reaper is gone, finish its work here
        for _ in 0..200 {
            self.reap().await;
            if self.dir.lock().connections.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let left = self.dir.lock().connections.len();
        if left > 0 {
            warn!(left, "connection tasks still running after shutdown");
        }
        info!(rank = self.my_rank(), "rank shutdown complete");
    }

    /// Tears down the current connection to `rank`. The sender reconnects
    /// and resumes with the messages it still holds.
    pub fn reset_connection(&self, rank: u32) -> AppResult<()> {
        let dir = self.dir.lock();
        match dir.rank_sender.get(&rank) {
            Some(sender) => {
                info!(rank, "resetting connection");
                sender.reset();
                Ok(())
            }
            None => Err(AppError::IllegalStateError(format!(
                "no sender for rank {}",
                rank
            ))),
        }
    }

    pub fn stats(&self) -> RankStats {
        let dir = self.dir.lock();
        RankStats {
            rank: self.assigned_rank(),
            senders: dir.rank_sender.len(),
            receivers: dir.receivers().count(),
            connections: dir.connections.len(),
            reaped: self.reaped.load(Ordering::Relaxed),
            local_entities: dir
                .local
                .keys()
                .filter(|addr| addr.kind().is_registrable())
                .count(),
            known_entities: dir.entity_rank.len(),
            pending_lookups: dir.looking_up.len(),
            sessions: dir.sessions.len(),
            namer_lookups: self.namer.get().map(|namer| namer.lookups_received()),
        }
    }

    /// Logs the directory at debug level.
    pub fn show_dir(&self) {
        let dir = self.dir.lock();
        debug!(rank = self.my_rank(), "directory:");
        let mut ranks: Vec<_> = dir.rank_addr.iter().collect();
        ranks.sort();
        for (rank, addr) in ranks {
            debug!("  rank {} at {}", rank, addr);
        }
        let mut entities: Vec<_> = dir.entity_rank.iter().collect();
        entities.sort();
        for (addr, rank) in entities {
            let place = if dir.local.contains_key(addr) {
                "local"
            } else {
                "remote"
            };
            debug!("  {} on rank {} ({})", addr, rank, place);
        }
    }

    pub fn my_rank(&self) -> u32 {
        self.my_rank.load(Ordering::Acquire)
    }

    pub fn assigned_rank(&self) -> Option<u32> {
        let rank = self.my_rank();
        (rank != RANK_UNASSIGNED).then_some(rank)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn config(&self) -> &Arc<MessengerConfig> {
        &self.config
    }

    /// The namer, when this rank hosts it.
    pub fn namer(&self) -> Option<&Arc<Namer>> {
        self.namer.get()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.dir.lock().stopping
    }

    fn next_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn expect_reply(&self, tid: u64) -> oneshot::Receiver<ControlMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tid, tx);
        rx
    }

    async fn await_reply(
        &self,
        tid: u64,
        reply: oneshot::Receiver<ControlMessage>,
        timeout: Duration,
        what: String,
    ) -> AppResult<ControlMessage> {
        match time::timeout(timeout, reply).await {
            Ok(Ok(control)) => Ok(control),
            Ok(Err(_)) => Err(AppError::ShuttingDown),
            Err(_) => {
                self.pending.remove(&tid);
                warn!(tid, "timed out waiting for {}", what);
                Err(AppError::Timeout(what))
            }
        }
    }

    fn complete_reply(&self, tid: u64, control: ControlMessage) {
        let orphan = match self.pending.remove(&tid) {
            Some((_, tx)) => match tx.send(control) {
                Ok(()) => return,
                Err(control) => control,
            },
            None => control,
        };
        debug!(tid, "reply for a request nobody waits for");
        self.release_orphan(orphan);
    }

    /// A registration whose caller timed out or went away still placed its
    /// address on the namer. Nobody will ever own it, so hand it back.
    fn release_orphan(&self, control: ControlMessage) {
        let ControlMessage::RegisterAck {
            result: RegisterResult::Registered(addr),
            ..
        } = control
        else {
            return;
        };
        if self.is_stopping() {
            return;
        }
        warn!(%addr, "releasing address of an abandoned registration");
        let unregister = ControlMessage::Unregister { addr };
        self.submit_message(
            unregister.into_message(EntityAddr::rank(self.my_rank()), EntityAddr::NAMER),
        );
    }
}

impl std::fmt::Debug for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rank")
            .field("rank", &self.assigned_rank())
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}
