//! Control protocol wire format.
//!
//! Requests are `[tag:1][payload]`. Name-bearing requests carry a 16-bit
//! little-endian length followed by that many name bytes, no terminator.
//! Handle-bearing requests carry a 32-bit little-endian handle. Information
//! packets (tags >= 100) are `[tag:1][total_len:1][payload]` where the
//! length byte counts the whole packet including itself and the tag.
//!
//! Builders return the reservation error instead of aborting so the
//! connection can take its out-of-memory close path.

use std::collections::TryReserveError;

use crate::control::handle::Handle;
use crate::supervisor::{ServiceEvent, ServiceState};

/// Request packet tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReqTag {
    FindService = 0,
    LoadService = 1,
    StartService = 2,
    StopService = 3,
    UnpinService = 4,
    UnloadService = 5,
    ListServices = 6,
    Shutdown = 7,
}

impl ReqTag {
    #[must_use]
    pub fn from_u8(tag: u8) -> Option<ReqTag> {
        match tag {
            0 => Some(ReqTag::FindService),
            1 => Some(ReqTag::LoadService),
            2 => Some(ReqTag::StartService),
            3 => Some(ReqTag::StopService),
            4 => Some(ReqTag::UnpinService),
            5 => Some(ReqTag::UnloadService),
            6 => Some(ReqTag::ListServices),
            7 => Some(ReqTag::Shutdown),
            _ => None,
        }
    }

    /// Buffered bytes needed before this packet's full size is known:
    /// name-bearing requests need the length field first, the rest are
    /// fixed-size.
    #[must_use]
    pub fn header_len(self) -> usize {
        match self {
            ReqTag::FindService | ReqTag::LoadService => NAME_REQ_HEADER,
            ReqTag::StartService
            | ReqTag::StopService
            | ReqTag::UnpinService
            | ReqTag::UnloadService => HANDLE_REQ_LEN,
            ReqTag::ListServices | ReqTag::Shutdown => 1,
        }
    }
}

/// Information packet tags; all >= 100 by protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InfoTag {
    Ack = 100,
    Nak = 101,
    BadRequest = 102,
    NoService = 103,
    ServiceRecord = 104,
    ServiceInfo = 105,
    ListDone = 106,
    LoadFailed = 107,
    ServiceEvent = 108,
    RollbackDone = 109,
    OutOfMemory = 110,
}

/// Tag plus 16-bit name length.
pub const NAME_REQ_HEADER: usize = 3;
/// Tag plus 32-bit handle.
pub const HANDLE_REQ_LEN: usize = 5;
/// Tag plus total-length byte.
pub const INFO_HEADER: usize = 2;
/// Largest information packet the one-byte length can describe.
pub const MAX_INFO_LEN: usize = u8::MAX as usize;

/// The out-of-memory indicator, preencoded: the OOM close path must not
/// allocate.
pub const OOM_PACKET: [u8; INFO_HEADER] = [InfoTag::OutOfMemory as u8, INFO_HEADER as u8];

fn info_packet(tag: InfoTag, payload: &[u8]) -> Result<Vec<u8>, TryReserveError> {
    let total = INFO_HEADER + payload.len();
    debug_assert!(total <= MAX_INFO_LEN);
    let mut pkt = Vec::new();
    pkt.try_reserve_exact(total)?;
    pkt.push(tag as u8);
    pkt.push(total as u8);
    pkt.extend_from_slice(payload);
    Ok(pkt)
}

/// A payload-free information packet (Ack, Nak, errors, ListDone).
///
/// # Errors
///
/// Returns the reservation error under memory pressure.
pub fn empty_info(tag: InfoTag) -> Result<Vec<u8>, TryReserveError> {
    info_packet(tag, &[])
}

/// Reply to a successful find/load: service state plus the fresh handle.
///
/// # Errors
///
/// Returns the reservation error under memory pressure.
pub fn service_record(state: ServiceState, handle: Handle) -> Result<Vec<u8>, TryReserveError> {
    let mut payload = [0u8; 5];
    payload[0] = state as u8;
    payload[1..5].copy_from_slice(&handle.raw().to_le_bytes());
    info_packet(InfoTag::ServiceRecord, &payload)
}

/// Service event broadcast for one handle: `[handle:4][event_code:1]`.
///
/// # Errors
///
/// Returns the reservation error under memory pressure.
pub fn service_event(handle: Handle, event: ServiceEvent) -> Result<Vec<u8>, TryReserveError> {
    let mut payload = [0u8; 5];
    payload[..4].copy_from_slice(&handle.raw().to_le_bytes());
    payload[4] = event.code();
    info_packet(InfoTag::ServiceEvent, &payload)
}

/// One service listing entry: `[state:1][name bytes]`. Names longer than
/// the packet can carry are truncated at a character boundary; the packet
/// limit is not a name-length limit elsewhere in the protocol.
///
/// # Errors
///
/// Returns the reservation error under memory pressure.
pub fn service_info(state: ServiceState, name: &str) -> Result<Vec<u8>, TryReserveError> {
    let max_name = MAX_INFO_LEN - INFO_HEADER - 1;
    let mut cut = name.len().min(max_name);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let name = &name.as_bytes()[..cut];

    let total = INFO_HEADER + 1 + name.len();
    let mut pkt = Vec::new();
    pkt.try_reserve_exact(total)?;
    pkt.push(InfoTag::ServiceInfo as u8);
    pkt.push(total as u8);
    pkt.push(state as u8);
    pkt.extend_from_slice(name);
    Ok(pkt)
}
