use bytes::Bytes;

use super::{EntityAddr, RANK_UNASSIGNED};

/// Message types below this value belong to the namer protocol.
pub const MSG_TYPE_USER_BASE: u32 = 64;

pub const MSG_NS_CONNECT: u32 = 1;
pub const MSG_NS_CONNECTACK: u32 = 2;
pub const MSG_NS_REGISTER: u32 = 3;
pub const MSG_NS_REGISTERACK: u32 = 4;
pub const MSG_NS_STARTED: u32 = 5;
pub const MSG_NS_UNREGISTER: u32 = 6;
pub const MSG_NS_LOOKUP: u32 = 7;
pub const MSG_NS_LOOKUPREPLY: u32 = 8;

/// A typed message travelling between entities.
///
/// A message is owned by exactly one party at a time: the producer, a queue,
/// or the consumer that dispatches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: EntityAddr,
    pub source_port: u32,
    pub dest: EntityAddr,
    pub dest_port: u32,
    pub msg_type: u32,
    pub payload: Bytes,
}

impl Message {
    /// Creates an unaddressed message; `send_message` stamps the addresses.
    pub fn new(msg_type: u32, payload: impl Into<Bytes>) -> Message {
        Message {
            source: EntityAddr::rank(RANK_UNASSIGNED),
            source_port: 0,
            dest: EntityAddr::rank(RANK_UNASSIGNED),
            dest_port: 0,
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn with_route(mut self, source: EntityAddr, dest: EntityAddr) -> Message {
        self.source = source;
        self.dest = dest;
        self
    }

    pub fn is_control(&self) -> bool {
        self.msg_type < MSG_TYPE_USER_BASE
    }
}
