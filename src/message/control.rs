use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::envelope::*;
use super::wire::{ensure, get_entity_addr, get_socket_addr, put_entity_addr, put_socket_addr};
use super::{AddrRequest, EntityAddr, EntityType, Message};
use crate::{AppError, AppResult};

/// Outcome of a register request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Registered(EntityAddr),
    AlreadyRegistered(EntityAddr),
}

/// Outcome of a lookup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Found { rank: u32, socket: SocketAddr },
    /// The namer queued the request until the address starts.
    Deferred,
    NotFound,
}

/// The namer protocol. Requests travel to `namer0`, replies to the
/// requesting rank's control endpoint. `tid` correlates a reply with its
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ConnectRequest {
        tid: u64,
        listen_addr: SocketAddr,
    },
    ConnectAck {
        tid: u64,
        rank: u32,
        ranks: Vec<(u32, SocketAddr)>,
    },
    RegisterRequest {
        tid: u64,
        rank: u32,
        request: AddrRequest,
    },
    RegisterAck {
        tid: u64,
        result: RegisterResult,
    },
    Started {
        addr: EntityAddr,
    },
    Unregister {
        addr: EntityAddr,
    },
    LookupRequest {
        tid: u64,
        addr: EntityAddr,
    },
    LookupReply {
        tid: u64,
        addr: EntityAddr,
        status: LookupStatus,
    },
}

impl ControlMessage {
    pub fn msg_type(&self) -> u32 {
        match self {
            ControlMessage::ConnectRequest { .. } => MSG_NS_CONNECT,
            ControlMessage::ConnectAck { .. } => MSG_NS_CONNECTACK,
            ControlMessage::RegisterRequest { .. } => MSG_NS_REGISTER,
            ControlMessage::RegisterAck { .. } => MSG_NS_REGISTERACK,
            ControlMessage::Started { .. } => MSG_NS_STARTED,
            ControlMessage::Unregister { .. } => MSG_NS_UNREGISTER,
            ControlMessage::LookupRequest { .. } => MSG_NS_LOOKUP,
            ControlMessage::LookupReply { .. } => MSG_NS_LOOKUPREPLY,
        }
    }

    pub fn into_message(self, source: EntityAddr, dest: EntityAddr) -> Message {
        let msg_type = self.msg_type();
        Message::new(msg_type, self.encode()).with_route(source, dest)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            ControlMessage::ConnectRequest { tid, listen_addr } => {
                buf.put_u64(*tid);
                put_socket_addr(&mut buf, listen_addr);
            }
            ControlMessage::ConnectAck { tid, rank, ranks } => {
                buf.put_u64(*tid);
                buf.put_u32(*rank);
                buf.put_u32(ranks.len() as u32);
                for (r, addr) in ranks {
                    buf.put_u32(*r);
                    put_socket_addr(&mut buf, addr);
                }
            }
            ControlMessage::RegisterRequest { tid, rank, request } => {
                buf.put_u64(*tid);
                buf.put_u32(*rank);
                match request {
                    AddrRequest::Any(kind) => {
                        buf.put_u8(0);
                        buf.put_u8(kind.code());
                    }
                    AddrRequest::Exact(addr) => {
                        buf.put_u8(1);
                        put_entity_addr(&mut buf, addr);
                    }
                }
            }
            ControlMessage::RegisterAck { tid, result } => {
                buf.put_u64(*tid);
                match result {
                    RegisterResult::Registered(addr) => {
                        buf.put_u8(0);
                        put_entity_addr(&mut buf, addr);
                    }
                    RegisterResult::AlreadyRegistered(addr) => {
                        buf.put_u8(1);
                        put_entity_addr(&mut buf, addr);
                    }
                }
            }
            ControlMessage::Started { addr } | ControlMessage::Unregister { addr } => {
                put_entity_addr(&mut buf, addr);
            }
            ControlMessage::LookupRequest { tid, addr } => {
                buf.put_u64(*tid);
                put_entity_addr(&mut buf, addr);
            }
            ControlMessage::LookupReply { tid, addr, status } => {
                buf.put_u64(*tid);
                put_entity_addr(&mut buf, addr);
                match status {
                    LookupStatus::Found { rank, socket } => {
                        buf.put_u8(0);
                        buf.put_u32(*rank);
                        put_socket_addr(&mut buf, socket);
                    }
                    LookupStatus::Deferred => buf.put_u8(1),
                    LookupStatus::NotFound => buf.put_u8(2),
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(msg_type: u32, payload: &Bytes) -> AppResult<ControlMessage> {
        let mut buf = payload.clone();
        let control = match msg_type {
            MSG_NS_CONNECT => {
                ensure(&buf, 8, "connect request")?;
                ControlMessage::ConnectRequest {
                    tid: buf.get_u64(),
                    listen_addr: get_socket_addr(&mut buf)?,
                }
            }
            MSG_NS_CONNECTACK => {
                ensure(&buf, 16, "connect ack")?;
                let tid = buf.get_u64();
                let rank = buf.get_u32();
                let count = buf.get_u32() as usize;
                // every entry takes at least 4 + 7 bytes
                if count > buf.remaining() / 11 {
                    return Err(AppError::MalformedFrame(format!(
                        "connect ack claims {} ranks in {} bytes",
                        count,
                        buf.remaining()
                    )));
                }
                let mut ranks = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure(&buf, 4, "rank table entry")?;
                    let r = buf.get_u32();
                    ranks.push((r, get_socket_addr(&mut buf)?));
                }
                ControlMessage::ConnectAck { tid, rank, ranks }
            }
            MSG_NS_REGISTER => {
                ensure(&buf, 13, "register request")?;
                let tid = buf.get_u64();
                let rank = buf.get_u32();
                let request = match buf.get_u8() {
                    0 => {
                        ensure(&buf, 1, "entity type")?;
                        let code = buf.get_u8();
                        AddrRequest::Any(EntityType::from_code(code).ok_or_else(|| {
                            AppError::MalformedFrame(format!("unknown entity type {}", code))
                        })?)
                    }
                    1 => AddrRequest::Exact(get_entity_addr(&mut buf)?),
                    other => {
                        return Err(AppError::MalformedFrame(format!(
                            "unknown register request kind {}",
                            other
                        )))
                    }
                };
                ControlMessage::RegisterRequest { tid, rank, request }
            }
            MSG_NS_REGISTERACK => {
                ensure(&buf, 9, "register ack")?;
                let tid = buf.get_u64();
                let status = buf.get_u8();
                let addr = get_entity_addr(&mut buf)?;
                let result = match status {
                    0 => RegisterResult::Registered(addr),
                    1 => RegisterResult::AlreadyRegistered(addr),
                    other => {
                        return Err(AppError::MalformedFrame(format!(
                            "unknown register status {}",
                            other
                        )))
                    }
                };
                ControlMessage::RegisterAck { tid, result }
            }
            MSG_NS_STARTED => ControlMessage::Started {
                addr: get_entity_addr(&mut buf)?,
            },
            MSG_NS_UNREGISTER => ControlMessage::Unregister {
                addr: get_entity_addr(&mut buf)?,
            },
            MSG_NS_LOOKUP => {
                ensure(&buf, 8, "lookup request")?;
                ControlMessage::LookupRequest {
                    tid: buf.get_u64(),
                    addr: get_entity_addr(&mut buf)?,
                }
            }
            MSG_NS_LOOKUPREPLY => {
                ensure(&buf, 8, "lookup reply")?;
                let tid = buf.get_u64();
                let addr = get_entity_addr(&mut buf)?;
                ensure(&buf, 1, "lookup status")?;
                let status = match buf.get_u8() {
                    0 => {
                        ensure(&buf, 4, "lookup rank")?;
                        let rank = buf.get_u32();
                        LookupStatus::Found {
                            rank,
                            socket: get_socket_addr(&mut buf)?,
                        }
                    }
                    1 => LookupStatus::Deferred,
                    2 => LookupStatus::NotFound,
                    other => {
                        return Err(AppError::MalformedFrame(format!(
                            "unknown lookup status {}",
                            other
                        )))
                    }
                };
                ControlMessage::LookupReply { tid, addr, status }
            }
            other => {
                return Err(AppError::MalformedFrame(format!(
                    "message type {} is not a control message",
                    other
                )))
            }
        };
        if buf.has_remaining() {
            return Err(AppError::MalformedFrame(format!(
                "{} trailing bytes after control message {}",
                buf.remaining(),
                msg_type
            )));
        }
        Ok(control)
    }
}

impl TryFrom<&Message> for ControlMessage {
    type Error = AppError;

    fn try_from(msg: &Message) -> AppResult<ControlMessage> {
        ControlMessage::decode(msg.msg_type, &msg.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_ack_carries_rank_table() {
        let ack = ControlMessage::ConnectAck {
            tid: 9,
            rank: 2,
            ranks: vec![
                (0, "127.0.0.1:6789".parse().unwrap()),
                (1, "[::1]:6800".parse().unwrap()),
            ],
        };
        let msg = ack.clone().into_message(EntityAddr::NAMER, EntityAddr::rank(2));
        assert_eq!(msg.msg_type, MSG_NS_CONNECTACK);
        assert!(msg.is_control());
        assert_eq!(ControlMessage::try_from(&msg).unwrap(), ack);
    }

    #[test]
    fn test_lookup_reply_statuses() {
        let addr = EntityAddr::new(EntityType::Osd, 4);
        for status in [
            LookupStatus::Found {
                rank: 3,
                socket: "10.1.2.3:7000".parse().unwrap(),
            },
            LookupStatus::Deferred,
            LookupStatus::NotFound,
        ] {
            let reply = ControlMessage::LookupReply { tid: 1, addr, status };
            let decoded = ControlMessage::decode(MSG_NS_LOOKUPREPLY, &reply.encode()).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let request = ControlMessage::RegisterRequest {
            tid: 5,
            rank: 1,
            request: AddrRequest::Exact(EntityAddr::new(EntityType::Mds, 0)),
        };
        let payload = request.encode();
        let truncated = payload.slice(..payload.len() - 2);
        assert!(matches!(
            ControlMessage::decode(MSG_NS_REGISTER, &truncated),
            Err(AppError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut payload = BytesMut::from(
            &ControlMessage::Started {
                addr: EntityAddr::new(EntityType::Mon, 1),
            }
            .encode()[..],
        );
        payload.put_u8(0);
        assert!(ControlMessage::decode(MSG_NS_STARTED, &payload.freeze()).is_err());
    }

    #[test]
    fn test_user_type_is_not_control() {
        assert!(ControlMessage::decode(MSG_TYPE_USER_BASE, &Bytes::new()).is_err());
    }
}
