//! Archived payloads of the membership handshake.
//!
//! `rkyv` expands `Archive` derives into generated archived structs that inherit `#[allow(missing_docs)]`.
//! Only the enter request and its acknowledgement carry structured payloads; every other
//! message fits in the fixed frame header.
#![allow(missing_docs)]

use rkyv::{
    api::high::{access, to_bytes, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Serialize,
};

use crate::ids::{EnterRequest, Role};
use crate::wire::WireError;

/// Schema version of the handshake payloads.
pub const SCHEMA_VERSION_V1: u8 = 1;

/// Enter request as it travels to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize)]
#[rkyv(
    attr(
        allow(missing_docs),
        doc = "Archived representation of `EnterRequestV1`."
    ),
    bytecheck()
)]
pub struct EnterRequestV1 {
    pub world_index: u32,
    pub abi: u32,
    pub pid: i32,
    pub role: u8,
}

/// Master's verdict on an enter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize)]
#[rkyv(
    attr(allow(missing_docs), doc = "Archived representation of `EnterAckV1`."),
    bytecheck()
)]
pub struct EnterAckV1 {
    pub status: u8,
    pub abi: u32,
}

/// Outcome carried by [`EnterAckV1::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterStatus {
    Ok,
    VersionMismatch,
    Refused,
}

impl EnterStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            EnterStatus::Ok => 0,
            EnterStatus::VersionMismatch => 1,
            EnterStatus::Refused => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => EnterStatus::Ok,
            1 => EnterStatus::VersionMismatch,
            _ => EnterStatus::Refused,
        }
    }
}

/// Serialises an enter request.
pub fn encode_enter(request: &EnterRequest) -> Result<Vec<u8>, WireError> {
    serialize(&EnterRequestV1 {
        world_index: request.world_index,
        abi: request.abi,
        pid: request.pid,
        role: request.role.to_wire(),
    })
}

/// Validates and decodes an enter request.
pub fn decode_enter(payload: &[u8]) -> Result<EnterRequest, WireError> {
    let aligned = aligned_copy(payload);
    let archived = archived_root::<EnterRequestV1>(&aligned)?;
    let role = Role::from_wire(archived.role)
        .ok_or_else(|| WireError::Payload(format!("unknown role {}", archived.role)))?;
    Ok(EnterRequest {
        world_index: archived.world_index.to_native(),
        abi: archived.abi.to_native(),
        pid: archived.pid.to_native(),
        role,
    })
}

/// Serialises an acknowledgement.
pub fn encode_ack(status: EnterStatus, abi: u32) -> Result<Vec<u8>, WireError> {
    serialize(&EnterAckV1 {
        status: status.to_wire(),
        abi,
    })
}

/// Validates and decodes an acknowledgement into `(status, master abi)`.
pub fn decode_ack(payload: &[u8]) -> Result<(EnterStatus, u32), WireError> {
    let aligned = aligned_copy(payload);
    let archived = archived_root::<EnterAckV1>(&aligned)?;
    Ok((
        EnterStatus::from_wire(archived.status),
        archived.abi.to_native(),
    ))
}

fn serialize<T>(value: &T) -> Result<Vec<u8>, WireError>
where
    T: Archive,
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, Error>>,
{
    to_bytes::<Error>(value)
        .map(|aligned| aligned.into_vec())
        .map_err(|err| WireError::Payload(format!("serialize failure: {err}")))
}

// Frame payloads start at a 4-byte boundary; archives want their own alignment.
fn aligned_copy(payload: &[u8]) -> AlignedVec {
    let mut aligned = AlignedVec::new();
    aligned.extend_from_slice(payload);
    aligned
}

fn archived_root<T>(payload: &[u8]) -> Result<&rkyv::Archived<T>, WireError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, Error>>,
{
    access::<T::Archived, Error>(payload)
        .map_err(|err| WireError::Payload(format!("validation failure: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_request_survives_the_wire() {
        let request = EnterRequest {
            world_index: 3,
            abi: 46,
            pid: 4242,
            role: Role::Slave,
        };
        let bytes = encode_enter(&request).unwrap();
        assert_eq!(decode_enter(&bytes).unwrap(), request);
    }

    #[test]
    fn ack_reports_master_abi() {
        let bytes = encode_ack(EnterStatus::VersionMismatch, 45).unwrap();
        assert_eq!(
            decode_ack(&bytes).unwrap(),
            (EnterStatus::VersionMismatch, 45)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_ack(&[1, 2]),
            Err(WireError::Payload(_))
        ));
    }
}
