use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Rank;
use crate::message::{EntityAddr, Message};
use crate::{AppError, AppResult};

/// Application side of an entity: receives every message addressed to it,
/// one at a time and in arrival order, on the entity's dispatch task.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, msg: Message);

    /// A rank this entity was sending to has been declared failed and its
    /// undelivered messages were routed again.
    fn kick(&self) {}
}

impl<F> Dispatcher for F
where
    F: Fn(Message) + Send + Sync,
{
    fn dispatch(&self, msg: Message) {
        self(msg)
    }
}

/// What an entity can do with the messaging layer.
pub trait Messenger: Send + Sync {
    /// Stamps the message with this entity as source and routes it to
    /// `dest`. Never blocks on the network.
    fn send_message(&self, msg: Message, dest: EntityAddr, from_port: u32, port: u32)
        -> AppResult<()>;

    /// Unregisters the entity; dispatch stops after the mailbox drains.
    fn shutdown(&self) -> AppResult<()>;

    fn callback_kick(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Registered, messages are held until `ready()`.
    RegisteredNotReady,
    Ready,
    /// Unregistered; the dispatch task drains what is already queued.
    Stopping,
    Stopped,
}

pub struct EntityMessenger {
    addr: EntityAddr,
    rank: Weak<Rank>,
    runtime: Handle,
    mailbox_tx: async_channel::Sender<Message>,
    mailbox_rx: async_channel::Receiver<Message>,
    dispatcher: Mutex<Option<Arc<dyn Dispatcher>>>,
    state: Mutex<EntityState>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EntityMessenger {
    pub(crate) fn new(addr: EntityAddr, rank: Weak<Rank>, runtime: Handle) -> Arc<EntityMessenger> {
        let (mailbox_tx, mailbox_rx) = async_channel::unbounded();
        Arc::new(EntityMessenger {
            addr,
            rank,
            runtime,
            mailbox_tx,
            mailbox_rx,
            dispatcher: Mutex::new(None),
            state: Mutex::new(EntityState::RegisteredNotReady),
            dispatch_handle: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> EntityAddr {
        self.addr
    }

    pub fn state(&self) -> EntityState {
        *self.state.lock()
    }

    /// Messages queued for dispatch but not yet handed to the dispatcher.
    pub fn pending(&self) -> usize {
        self.mailbox_rx.len()
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    /// Starts dispatch. Messages that arrived since registration are
    /// delivered first, in arrival order.
    pub fn ready(&self) -> AppResult<()> {
        let dispatcher = self.dispatcher.lock().clone().ok_or_else(|| {
            AppError::IllegalStateError(format!("{} has no dispatcher", self.addr))
        })?;
        {
            let mut state = self.state.lock();
            if *state != EntityState::RegisteredNotReady {
                return Err(AppError::IllegalStateError(format!(
                    "{} can not become ready while {:?}",
                    self.addr, *state
                )));
            }
            *state = EntityState::Ready;
        }

        let mailbox = self.mailbox_rx.clone();
        let addr = self.addr;
        let handle = self.runtime.spawn(async move {
            debug!(%addr, "dispatch started");
            while let Ok(msg) = mailbox.recv().await {
                dispatcher.dispatch(msg);
            }
            debug!(%addr, "dispatch exited");
        });
        *self.dispatch_handle.lock() = Some(handle);

        let rank = self.rank.upgrade().ok_or(AppError::ShuttingDown)?;
        rank.entity_ready(self.addr)
    }

    pub(crate) fn queue_message(&self, msg: Message) {
        if self.mailbox_tx.try_send(msg).is_err() {
            warn!(addr = %self.addr, "mailbox closed, dropping message");
        }
    }

    pub(crate) fn queue_messages(&self, msgs: impl IntoIterator<Item = Message>) {
        for msg in msgs {
            self.queue_message(msg);
        }
    }

    /// No new messages are accepted; the dispatch task ends once it has
    /// handed out what is already queued.
    pub(crate) fn close_mailbox(&self) {
        self.mailbox_tx.close();
        let mut state = self.state.lock();
        if self.dispatch_handle.lock().is_none() {
            let dropped = self.mailbox_rx.len();
            while self.mailbox_rx.try_recv().is_ok() {}
            if dropped > 0 {
                warn!(addr = %self.addr, dropped, "entity stopped before dispatch began");
            }
            *state = EntityState::Stopped;
        } else if *state != EntityState::Stopped {
            *state = EntityState::Stopping;
        }
    }

    /// Waits for the dispatch task to finish after `shutdown`.
    pub async fn join(&self) {
        let handle = self.dispatch_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(addr = %self.addr, "dispatch task failed: {}", e);
            }
        }
        if self.mailbox_tx.is_closed() {
            *self.state.lock() = EntityState::Stopped;
        }
    }
}

impl Messenger for EntityMessenger {
    fn send_message(
        &self,
        mut msg: Message,
        dest: EntityAddr,
        from_port: u32,
        port: u32,
    ) -> AppResult<()> {
        if matches!(self.state(), EntityState::Stopping | EntityState::Stopped) {
            return Err(AppError::ShuttingDown);
        }
        msg.source = self.addr;
        msg.source_port = from_port;
        msg.dest = dest;
        msg.dest_port = port;
        let rank = self.rank.upgrade().ok_or(AppError::ShuttingDown)?;
        rank.submit_message(msg);
        Ok(())
    }

    fn shutdown(&self) -> AppResult<()> {
        if matches!(self.state(), EntityState::Stopping | EntityState::Stopped) {
            return Ok(());
        }
        match self.rank.upgrade() {
            Some(rank) => rank.unregister_entity(self),
            None => self.close_mailbox(),
        }
        Ok(())
    }

    fn callback_kick(&self) {
        let dispatcher = self.dispatcher.lock().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.kick();
        }
    }
}

impl std::fmt::Debug for EntityMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMessenger")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
