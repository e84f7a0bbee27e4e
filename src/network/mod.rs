//! Network Module Implementation
//!
//! Transport between ranks, built on tokio's async I/O primitives:
//! - `Accepter`: listens on the rank's address and spawns a receiver per socket
//! - `Receiver`: reads frames from one inbound socket
//! - `Sender`: owns the outbound queue and connection to one destination rank
//! - `Connection` / `FrameCodec`: length delimited, checksummed framing
//!
//! Senders and receivers never destroy themselves; when their task ends they
//! retire into the rank's reap queues.

pub use accepter::Accepter;
pub use connection::Connection;
pub use frame::{Frame, FrameCodec, Hello, FRAME_HEADER_LEN};
pub use receiver::Receiver;
pub use sender::Sender;

mod accepter;
mod connection;
mod frame;
mod receiver;
mod sender;

/// Slot id of a sender or receiver in the rank's connection table.
pub type ConnId = u64;
