use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::rank::Rank;
use crate::{AppError, AppResult, Shutdown};

/// Accept loop of a rank. Every accepted socket becomes a receiver.
#[derive(Debug)]
pub struct Accepter {
    listener: TcpListener,
    listen_addr: SocketAddr,
    rank: Weak<Rank>,
    shutdown: Shutdown,
}

impl Accepter {
    pub(crate) fn new(listener: TcpListener, rank: &Arc<Rank>) -> AppResult<Accepter> {
        let listen_addr = listener.local_addr()?;
        Ok(Accepter {
            listener,
            listen_addr,
            rank: Arc::downgrade(rank),
            shutdown: rank.subscribe_shutdown(),
        })
    }

    /// Runs until the rank shuts down. Dropping the listener on return is what
    /// closes the listening socket.
    pub(crate) async fn run(mut self) {
        info!(addr = %self.listen_addr, "accepter listening");
        loop {
            let accepted = tokio::select! {
                res = accept(&self.listener) => res,
                _ = self.shutdown.recv() => {
                    debug!("accepter received shutdown signal");
                    break;
                }
            };
            match accepted {
                Ok((socket, peer)) => {
                    let Some(rank) = self.rank.upgrade() else {
                        break;
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(%peer, "set_nodelay failed: {}", e);
                    }
                    rank.spawn_receiver(socket, peer);
                }
                Err(err) => {
                    error!(cause = %err, "failed to accept");
                    break;
                }
            }
        }
        debug!(addr = %self.listen_addr, "accepter exited");
    }
}

async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
                error!("accept error, retrying in {}s: {}", backoff, err);
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
