//! Primitive encoders shared by the control protocol and the frame codec.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use super::{EntityAddr, EntityType};
use crate::{AppError, AppResult};

pub(crate) fn ensure(buf: &impl Buf, needed: usize, what: &str) -> AppResult<()> {
    if buf.remaining() < needed {
        return Err(AppError::MalformedFrame(format!(
            "{} needs {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn put_entity_addr(buf: &mut BytesMut, addr: &EntityAddr) {
    buf.put_u8(addr.kind().code());
    buf.put_u32(addr.num());
}

pub(crate) fn get_entity_addr(buf: &mut impl Buf) -> AppResult<EntityAddr> {
    ensure(buf, 5, "entity address")?;
    let code = buf.get_u8();
    let kind = EntityType::from_code(code)
        .ok_or_else(|| AppError::MalformedFrame(format!("unknown entity type {}", code)))?;
    Ok(EntityAddr::new(kind, buf.get_u32()))
}

pub(crate) fn put_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

pub(crate) fn get_socket_addr(buf: &mut impl Buf) -> AppResult<SocketAddr> {
    ensure(buf, 1, "socket address family")?;
    let ip = match buf.get_u8() {
        4 => {
            ensure(buf, 4, "ipv4 address")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            ensure(buf, 16, "ipv6 address")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(AppError::MalformedFrame(format!(
                "unknown address family {}",
                family
            )))
        }
    };
    ensure(buf, 2, "port")?;
    Ok(SocketAddr::new(ip, buf.get_u16()))
}
