//! Addresses, messages and the namer control protocol.

pub use address::{AddrRequest, EntityAddr, EntityType, RANK_UNASSIGNED};
pub use control::{ControlMessage, LookupStatus, RegisterResult};
pub use envelope::*;

mod address;
mod control;
mod envelope;
pub(crate) mod wire;
