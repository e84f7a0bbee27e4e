use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::{ConnId, Connection, Hello};
use crate::message::{EntityAddr, Message};
use crate::rank::Rank;
use crate::service::SenderConfig;
use crate::{AppError, AppResult, MessengerConfig, Shutdown};

/// Outbound half of the link to one destination rank.
///
/// Producers append to a FIFO queue; a single task drains it over a lazily
/// established connection. Messages that could not be written are kept at the
/// head of the queue and written again after reconnecting.
#[derive(Debug)]
pub struct Sender {
    conn_id: ConnId,
    dest_rank: u32,
    socket_addr: SocketAddr,
    session: u64,
    queue_tx: async_channel::Sender<Message>,
    queue_rx: async_channel::Receiver<Message>,
    entities: Mutex<HashSet<EntityAddr>>,
    done: AtomicBool,
    stop_notify: Notify,
    reset_notify: Notify,
}

impl Sender {
    /// Creates the sender and spawns its task. The caller owns the returned
    /// handle; the task never joins itself.
    pub(crate) fn start(
        conn_id: ConnId,
        dest_rank: u32,
        socket_addr: SocketAddr,
        rank: &Arc<Rank>,
    ) -> (Arc<Sender>, JoinHandle<()>) {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let sender = Arc::new(Sender {
            conn_id,
            dest_rank,
            socket_addr,
            session: rand::random(),
            queue_tx,
            queue_rx: queue_rx.clone(),
            entities: Mutex::new(HashSet::new()),
            done: AtomicBool::new(false),
            stop_notify: Notify::new(),
            reset_notify: Notify::new(),
        });
        let task = SenderTask {
            sender: sender.clone(),
            queue_rx,
            rank: Arc::downgrade(rank),
            config: rank.config().clone(),
            retained: VecDeque::new(),
            next_seq: 1,
            conn: None,
            failures: 0,
            shutdown: rank.subscribe_shutdown(),
        };
        let handle = rank.runtime().spawn(task.run());
        (sender, handle)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn dest_rank(&self) -> u32 {
        self.dest_rank
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Local entities that have routed messages through this sender.
    pub fn entities(&self) -> Vec<EntityAddr> {
        self.entities.lock().iter().copied().collect()
    }

    pub fn send(&self, msg: Message) -> AppResult<()> {
        self.entities.lock().insert(msg.source);
        self.queue_tx
            .try_send(msg)
            .map_err(|e| AppError::ChannelSendError(format!("sender to rank {}: {}", self.dest_rank, e)))
    }

    /// Appends a batch; the batch keeps its order relative to other sends
    /// from the same producer.
    pub fn send_all(&self, msgs: impl IntoIterator<Item = Message>) -> AppResult<()> {
        for msg in msgs {
            self.send(msg)?;
        }
        Ok(())
    }

    /// Asks the task to stop. Queued messages are dropped; the task closes the
    /// socket and hands itself to the reaper.
    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);
        self.queue_tx.close();
        self.stop_notify.notify_one();
    }

    /// Drops the current socket; the task reconnects and resumes with the
    /// messages it still holds.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Closes the queue and returns whatever the task has not picked up yet.
    pub(crate) fn close_and_drain(&self) -> Vec<Message> {
        self.done.store(true, Ordering::Release);
        self.queue_tx.close();
        let mut left = Vec::new();
        while let Ok(msg) = self.queue_rx.try_recv() {
            left.push(msg);
        }
        self.stop_notify.notify_one();
        left
    }
}

pub(crate) fn backoff_delay(config: &SenderConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = config
        .backoff_min_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_max_ms);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

async fn peer_closed(conn: Option<&mut Connection>) {
    match conn {
        Some(conn) => {
            if let Err(e) = conn.wait_closed().await {
                trace!("connection error while idle: {}", e);
            }
        }
        None => std::future::pending().await,
    }
}

enum Wake {
    Stop,
    Reset,
}

struct SenderTask {
    sender: Arc<Sender>,
    queue_rx: async_channel::Receiver<Message>,
    rank: Weak<Rank>,
    config: Arc<MessengerConfig>,
    /// stamped with their sequence number, oldest first
    retained: VecDeque<(u64, Message)>,
    next_seq: u64,
    conn: Option<Connection>,
    failures: u32,
    shutdown: Shutdown,
}

impl SenderTask {
    async fn run(mut self) {
        let dest_rank = self.sender.dest_rank;
        debug!(dest_rank, conn_id = self.sender.conn_id, "sender started");
        let escalated = self.run_loop().await;

        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        if !escalated {
            while let Ok(msg) = self.queue_rx.try_recv() {
                self.retain(msg);
            }
            if !self.retained.is_empty() {
                warn!(
                    dest_rank,
                    dropped = self.retained.len(),
                    "sender stopped with undelivered messages"
                );
            }
        }
        debug!(dest_rank, conn_id = self.sender.conn_id, "sender exited");
        if let Some(rank) = self.rank.upgrade() {
            rank.retire_sender(self.sender.conn_id);
        }
    }

    /// Returns true when the destination was declared failed and the retained
    /// messages were handed back to the rank.
    async fn run_loop(&mut self) -> bool {
        loop {
            if self.sender.is_done() || self.shutdown.is_shutdown() {
                return false;
            }

            if self.retained.is_empty() {
                tokio::select! {
                    res = self.queue_rx.recv() => match res {
                        Ok(msg) => self.retain(msg),
                        Err(_) => return false,
                    },
                    _ = self.sender.stop_notify.notified() => return false,
                    _ = self.sender.reset_notify.notified() => {
                        self.drop_connection("reset requested").await;
                        continue;
                    }
                    _ = peer_closed(self.conn.as_mut()) => {
                        self.drop_connection("peer closed").await;
                        continue;
                    }
                    _ = self.shutdown.recv() => return false,
                }
            }
            while let Ok(msg) = self.queue_rx.try_recv() {
                self.retain(msg);
            }

            if self.conn.is_none() {
                match self.connect().await {
                    Ok(conn) => {
                        self.conn = Some(conn);
                        if let Some(rank) = self.rank.upgrade() {
                            rank.rank_reachable(self.sender.dest_rank);
                        }
                    }
                    Err(Some(e)) => {
                        self.failures += 1;
                        warn!(
                            dest_rank = self.sender.dest_rank,
                            addr = %self.sender.socket_addr,
                            failures = self.failures,
                            "connect failed: {}",
                            e
                        );
                        if self.should_escalate() {
                            self.escalate();
                            return true;
                        }
                        let delay = backoff_delay(&self.config.sender, self.failures);
                        match self.sleep(delay).await {
                            Some(Wake::Stop) => return false,
                            Some(Wake::Reset) | None => continue,
                        }
                    }
                    Err(None) => return false,
                }
            }

            match self.drain().await {
                Some(Wake::Stop) => return false,
                Some(Wake::Reset) => self.drop_connection("reset requested").await,
                None => {}
            }
        }
    }

    fn retain(&mut self, msg: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.retained.push_back((seq, msg));
    }

    fn should_escalate(&self) -> bool {
        // the namer host is the one rank that can not be re-resolved
        self.sender.dest_rank != 0 && self.failures >= self.config.sender.max_connect_attempts
    }

    fn escalate(&mut self) {
        let retained: Vec<Message> = self.retained.drain(..).map(|(_, msg)| msg).collect();
        info!(
            dest_rank = self.sender.dest_rank,
            retained = retained.len(),
            "rank unreachable, handing messages back for re-resolution"
        );
        if let Some(rank) = self.rank.upgrade() {
            rank.fail_rank(&self.sender, retained);
        }
    }

    /// `Err(None)` means the sender was stopped while connecting.
    async fn connect(&mut self) -> Result<Connection, Option<AppError>> {
        let addr = self.sender.socket_addr;
        let timeout = self.config.connect_timeout();
        let socket = tokio::select! {
            res = time::timeout(timeout, TcpStream::connect(addr)) => match res {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => return Err(Some(e.into())),
                Err(_) => return Err(Some(AppError::Timeout(format!("connect to {}", addr)))),
            },
            _ = self.sender.stop_notify.notified() => return Err(None),
            _ = self.shutdown.recv() => return Err(None),
        };
        socket.set_nodelay(true).map_err(|e| Some(e.into()))?;
        let mut conn = Connection::new(
            socket,
            addr,
            self.config.network.conn_read_buffer_size,
            self.config.network.max_frame_size,
        );
        let from_rank = self.rank.upgrade().and_then(|rank| rank.assigned_rank());
        let hello = Hello {
            from_rank,
            session: self.sender.session,
        };
        conn.write_hello(&hello).await.map_err(Some)?;
        info!(dest_rank = self.sender.dest_rank, %addr, "connected");
        Ok(conn)
    }

    /// Writes retained messages in order until the buffer is empty or the
    /// connection fails. A message leaves the buffer only once written.
    async fn drain(&mut self) -> Option<Wake> {
        while let Some((seq, msg)) = self.retained.front() {
            let conn = self.conn.as_mut()?;
            let res = tokio::select! {
                res = conn.write_message(*seq, msg) => res,
                _ = self.sender.stop_notify.notified() => return Some(Wake::Stop),
                _ = self.sender.reset_notify.notified() => return Some(Wake::Reset),
                _ = self.shutdown.recv() => return Some(Wake::Stop),
            };
            match res {
                Ok(()) => {
                    trace!(dest_rank = self.sender.dest_rank, seq, "message written");
                    self.retained.pop_front();
                    self.failures = 0;
                }
                Err(AppError::FrameTooLarge(size)) => {
                    warn!(
                        dest_rank = self.sender.dest_rank,
                        size, "dropping message larger than the frame limit"
                    );
                    self.retained.pop_front();
                }
                Err(e) => {
                    warn!(
                        dest_rank = self.sender.dest_rank,
                        "write failed, will reconnect: {}", e
                    );
                    self.failures += 1;
                    self.conn = None;
                    return None;
                }
            }
        }
        None
    }

    async fn sleep(&mut self, delay: Duration) -> Option<Wake> {
        tokio::select! {
            _ = time::sleep(delay) => None,
            _ = self.sender.stop_notify.notified() => Some(Wake::Stop),
            _ = self.sender.reset_notify.notified() => Some(Wake::Reset),
            _ = self.shutdown.recv() => Some(Wake::Stop),
        }
    }

    async fn drop_connection(&mut self, reason: &str) {
        if let Some(conn) = self.conn.take() {
            debug!(dest_rank = self.sender.dest_rank, reason, "dropping connection");
            conn.close().await;
        }
    }
}
