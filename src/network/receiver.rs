use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use super::{ConnId, Connection, Frame};
use crate::rank::Rank;
use crate::{AppError, AppResult, Shutdown};

/// Inbound half of a connection: reads frames from one accepted socket and
/// hands each message to the rank.
#[derive(Debug)]
pub struct Receiver {
    conn_id: ConnId,
    peer: SocketAddr,
    done: AtomicBool,
    stop_notify: Notify,
    finished: AtomicBool,
    finished_notify: Notify,
}

impl Receiver {
    pub(crate) fn start(
        conn_id: ConnId,
        socket: TcpStream,
        peer: SocketAddr,
        rank: &Arc<Rank>,
    ) -> (Arc<Receiver>, JoinHandle<()>) {
        let receiver = Arc::new(Receiver {
            conn_id,
            peer,
            done: AtomicBool::new(false),
            stop_notify: Notify::new(),
            finished: AtomicBool::new(false),
            finished_notify: Notify::new(),
        });
        let network = &rank.config().network;
        let conn = Connection::new(
            socket,
            peer,
            network.conn_read_buffer_size,
            network.max_frame_size,
        );
        let task = ReceiverTask {
            receiver: receiver.clone(),
            conn,
            rank: Arc::downgrade(rank),
            shutdown: rank.subscribe_shutdown(),
        };
        let handle = rank.runtime().spawn(task.run());
        (receiver, handle)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Resolves once the task has dispatched its last frame.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.finished_notify.notified();
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Closes the socket from our side; the task notices and retires itself.
    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);
        self.stop_notify.notify_one();
    }
}

struct ReceiverTask {
    receiver: Arc<Receiver>,
    conn: Connection,
    rank: Weak<Rank>,
    shutdown: Shutdown,
}

impl ReceiverTask {
    async fn run(mut self) {
        let peer = self.receiver.peer;
        let conn_id = self.receiver.conn_id;
        debug!(%peer, conn_id, "receiver started");
        match self.read_loop().await {
            Ok(()) => debug!(%peer, conn_id, "receiver closed"),
            Err(e) if e.is_transport() => debug!(%peer, conn_id, "receiver connection lost: {}", e),
            Err(e) => warn!(%peer, conn_id, "receiver failed: {}", e),
        }
        self.receiver.done.store(true, Ordering::Release);
        self.receiver.finished.store(true, Ordering::Release);
        self.receiver.finished_notify.notify_waiters();
        if let Some(rank) = self.rank.upgrade() {
            rank.retire_receiver(conn_id);
        }
    }

    async fn read_loop(&mut self) -> AppResult<()> {
        let hello = match self.next_frame().await? {
            Some(Frame::Hello(hello)) => hello,
            Some(Frame::Message { .. }) => {
                return Err(AppError::MalformedFrame(
                    "connection did not start with a hello".to_string(),
                ))
            }
            None => return Ok(()),
        };
        trace!(peer = %self.receiver.peer, ?hello, "hello received");
        let Some(rank) = self.rank.upgrade() else {
            return Ok(());
        };
        let previous = rank.note_session(hello.from_rank, hello.session, &self.receiver);
        let timeout = rank.config().connect_timeout();
        drop(rank);
        if let Some(previous) = previous {
            // frames of a reconnected session must not overtake the ones
            // still buffered on the connection it replaces
            debug!(peer = %self.receiver.peer, previous = previous.conn_id(), "waiting for replaced connection to drain");
            if time::timeout(timeout, previous.wait_finished()).await.is_err() {
                warn!(peer = %self.receiver.peer, "replaced connection did not drain in time");
            }
        }

        loop {
            match self.next_frame().await? {
                Some(Frame::Message { seq, message }) => {
                    let Some(rank) = self.rank.upgrade() else {
                        return Ok(());
                    };
                    rank.deliver(hello.session, seq, message);
                }
                Some(Frame::Hello(_)) => {
                    return Err(AppError::MalformedFrame("unexpected second hello".to_string()))
                }
                None => return Ok(()),
            }
        }
    }

    /// `None` on a clean close, a stop request or rank shutdown.
    async fn next_frame(&mut self) -> AppResult<Option<Frame>> {
        if self.receiver.is_done() {
            return Ok(None);
        }
        tokio::select! {
            res = self.conn.read_frame() => res,
            _ = self.receiver.stop_notify.notified() => Ok(None),
            _ = self.shutdown.recv() => Ok(None),
        }
    }
}
