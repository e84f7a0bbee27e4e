use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace};

use super::Rank;
use crate::network::ConnId;

impl Rank {
    /// Called by a sender task on its way out. The slot stays in the
    /// connection table until the reaper has joined the task.
    pub(crate) fn retire_sender(&self, conn_id: ConnId) {
        {
            let mut dir = self.dir.lock();
            dir.rank_sender.retain(|_, sender| sender.conn_id() != conn_id);
            dir.sender_reap_queue.push(conn_id);
        }
        trace!(conn_id, "sender retired");
        self.reap_notify.notify_one();
    }

    pub(crate) fn retire_receiver(&self, conn_id: ConnId) {
        {
            let mut dir = self.dir.lock();
            dir.forget_receiver(conn_id);
            dir.receiver_reap_queue.push(conn_id);
        }
        trace!(conn_id, "receiver retired");
        self.reap_notify.notify_one();
    }

    /// Joins and frees every retired connection task. Returns how many were
    /// reaped.
    pub(crate) async fn reap(&self) -> usize {
        let handles: Vec<(ConnId, JoinHandle<()>)> = {
            let mut dir = self.dir.lock();
            let mut retired = std::mem::take(&mut dir.sender_reap_queue);
            retired.append(&mut dir.receiver_reap_queue);
            retired
                .into_iter()
                .filter_map(|conn_id| dir.connections.remove(&conn_id).map(|slot| (conn_id, slot.handle)))
                .collect()
        };

        let reaped = handles.len();
        for (conn_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(conn_id, "connection task failed: {}", e);
            }
        }
        if reaped > 0 {
            self.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
            debug!(reaped, "reaped connection tasks");
        }
        reaped
    }

    /// Background task that reaps on every retirement and on a fixed
    /// interval.
    pub(crate) fn spawn_reaper(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let mut shutdown = self.subscribe_shutdown();
        let interval = self.config.reap_interval();
        self.runtime.spawn(async move {
            debug!("reaper started");
            loop {
                let Some(rank) = this.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = rank.reap_notify.notified() => {}
                    _ = time::sleep(interval) => {}
                }
                rank.reap().await;
            }
            debug!("reaper exited");
        })
    }
}
