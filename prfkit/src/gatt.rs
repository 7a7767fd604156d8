//! Messages exchanged with the GATT and GAP tasks of the vendor stack.
//!
//! Server profiles receive [`GattEvent::Write`] when a peer writes one of their attributes and
//! answer with [`GattReq::WriteRsp`]. Notifications and indications always carry the value
//! currently stored in the attribute database, so a profile updates the value first and then
//! asks GATT to send it.
//!
//! Client profiles drive discovery, reads and writes with the remaining request variants.
//!
//! [`GattEvent::Write`]: enum.GattEvent.html#variant.Write
//! [`GattReq::WriteRsp`]: enum.GattReq.html#variant.WriteRsp

use crate::{
    att::{AttHandle, Properties, Status, Value},
    kernel::ConHdl,
    uuid::{AttUuid, Uuid16},
};

/// Inbound event from GATT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// A peer wrote an attribute owned by the receiving task.
    Write {
        conhdl: ConHdl,
        handle: AttHandle,
        value: Value,
        /// Whether the peer expects a write response.
        response: bool,
        /// Whether this is the last fragment of the write.
        last: bool,
    },
    /// A notification has been sent.
    NotifyCmp {
        conhdl: ConHdl,
        handle: AttHandle,
        status: Status,
    },
    /// The peer confirmed an indication (or the indication failed).
    HandleValueCfm {
        conhdl: ConHdl,
        handle: AttHandle,
        status: Status,
    },

    /// A service matching a discovery request.
    ServiceFound {
        conhdl: ConHdl,
        uuid: AttUuid,
        start: AttHandle,
        end: AttHandle,
    },
    /// A characteristic in the discovered range.
    CharFound {
        conhdl: ConHdl,
        uuid: AttUuid,
        decl: AttHandle,
        value: AttHandle,
        props: Properties,
    },
    /// A descriptor in the discovered range.
    DescFound {
        conhdl: ConHdl,
        uuid: Uuid16,
        handle: AttHandle,
    },
    /// The running discovery procedure is over.
    DiscoveryCmp { conhdl: ConHdl, status: Status },
    /// Answer to a `Read` request.
    ReadRsp {
        conhdl: ConHdl,
        handle: AttHandle,
        value: Value,
    },
    /// A `Read` or `Write` request failed, or a write completed.
    Cmp { conhdl: ConHdl, status: Status },
    /// The peer sent a notification or indication.
    PeerValue {
        conhdl: ConHdl,
        handle: AttHandle,
        value: Value,
        indication: bool,
    },
}

impl GattEvent {
    /// The connection the event belongs to.
    pub fn conhdl(&self) -> ConHdl {
        match self {
            GattEvent::Write { conhdl, .. }
            | GattEvent::NotifyCmp { conhdl, .. }
            | GattEvent::HandleValueCfm { conhdl, .. }
            | GattEvent::ServiceFound { conhdl, .. }
            | GattEvent::CharFound { conhdl, .. }
            | GattEvent::DescFound { conhdl, .. }
            | GattEvent::DiscoveryCmp { conhdl, .. }
            | GattEvent::ReadRsp { conhdl, .. }
            | GattEvent::Cmp { conhdl, .. }
            | GattEvent::PeerValue { conhdl, .. } => *conhdl,
        }
    }
}

/// Outbound request to GATT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattReq {
    /// Notify the stored value of `handle`.
    Notify { conhdl: ConHdl, handle: AttHandle },
    /// Indicate the stored value of `handle`.
    Indicate { conhdl: ConHdl, handle: AttHandle },
    /// Answer a peer write.
    WriteRsp {
        conhdl: ConHdl,
        handle: AttHandle,
        status: Status,
    },

    /// Discover the primary services with the given UUID.
    DiscoverService { conhdl: ConHdl, uuid: Uuid16 },
    /// Discover all characteristics in a handle range.
    DiscoverChars {
        conhdl: ConHdl,
        start: AttHandle,
        end: AttHandle,
    },
    /// Discover all descriptors in a handle range.
    DiscoverDescs {
        conhdl: ConHdl,
        start: AttHandle,
        end: AttHandle,
    },
    Read { conhdl: ConHdl, handle: AttHandle },
    Write {
        conhdl: ConHdl,
        handle: AttHandle,
        value: Value,
        response: bool,
    },
}

/// Disconnection complete event from GAP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub conhdl: ConHdl,
    pub reason: u8,
}
