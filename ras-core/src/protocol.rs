//! Ranging Service protocol: channels, RAS-CP opcodes and response codes, feature bits.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection identifier. A non-owning back-reference: the connection itself is owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u16);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The six logical channels of the service. In GATT terms, one characteristic each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Read-only feature bitfield.
    Features,
    /// Real-time ranging data (notify/indicate).
    RealtimeData,
    /// On-demand ranging data segments (notify/indicate).
    OnDemandData,
    /// RAS control point (write + indicate).
    ControlPoint,
    /// Ranging data ready (read/notify/indicate).
    RecordReady,
    /// Ranging data overwritten (read/notify/indicate).
    RecordOverwritten,
}

/// Feature bit: real-time ranging data supported.
pub const FEATURE_REALTIME: u32 = 1 << 0;
/// Feature bit: retrieve lost ranging data segments supported.
pub const FEATURE_RETRIEVE_LOST_SEGMENTS: u32 = 1 << 1;
/// Feature bit: abort operation supported.
pub const FEATURE_ABORT_OPERATION: u32 = 1 << 2;
/// Feature bit: filter ranging data supported.
pub const FEATURE_FILTER: u32 = 1 << 3;

/// RAS-CP command opcodes (requester to responder).
pub mod opcode {
    pub const GET_RECORD: u8 = 0x00;
    pub const ACK_RECORD: u8 = 0x01;
    pub const RETRIEVE_LOST_SEGMENTS: u8 = 0x02;
    pub const ABORT_OPERATION: u8 = 0x03;
    pub const SET_FILTER: u8 = 0x04;
}

/// RAS-CP response opcodes (responder to requester).
pub mod rsp_opcode {
    pub const COMPLETE_RECORD: u8 = 0x00;
    pub const COMPLETE_LOST_SEGMENTS: u8 = 0x01;
    pub const RESPONSE_CODE: u8 = 0x02;
}

/// Response code carried by a `ResponseCode` RAS-CP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Success,
    OpcodeNotSupported,
    InvalidParameter,
    SuccessPersisted,
    AbortUnsuccessful,
    ProcedureNotCompleted,
    ServerBusy,
    NoRecordsFound,
}

impl ResponseCode {
    pub fn to_u8(self) -> u8 {
        match self {
            ResponseCode::Success => 0x01,
            ResponseCode::OpcodeNotSupported => 0x02,
            ResponseCode::InvalidParameter => 0x03,
            ResponseCode::SuccessPersisted => 0x04,
            ResponseCode::AbortUnsuccessful => 0x05,
            ResponseCode::ProcedureNotCompleted => 0x06,
            ResponseCode::ServerBusy => 0x07,
            ResponseCode::NoRecordsFound => 0x08,
        }
    }

    /// Parse a wire value. 0x00 and 0x09..=0xFF are reserved.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => ResponseCode::Success,
            0x02 => ResponseCode::OpcodeNotSupported,
            0x03 => ResponseCode::InvalidParameter,
            0x04 => ResponseCode::SuccessPersisted,
            0x05 => ResponseCode::AbortUnsuccessful,
            0x06 => ResponseCode::ProcedureNotCompleted,
            0x07 => ResponseCode::ServerBusy,
            0x08 => ResponseCode::NoRecordsFound,
            _ => return None,
        })
    }
}

/// RAS-CP command written by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RascpCommand {
    GetRecord { ranging_counter: u16 },
    AckRecord { ranging_counter: u16 },
    RetrieveLostSegments {
        ranging_counter: u16,
        first_segment: u8,
        last_segment: u8,
    },
    AbortOperation,
    SetFilter { filter: u16 },
}

/// RAS-CP response indicated by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RascpResponse {
    CompleteRecord { ranging_counter: u16 },
    CompleteLostSegments {
        ranging_counter: u16,
        first_segment: u8,
        last_segment: u8,
    },
    ResponseCode(ResponseCode),
}

/// One unit handed to the transport. Serializable so a host can carry it over any link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pdu {
    /// Responder to requester: notification or indication on a channel.
    Notify { channel: Channel, payload: Vec<u8> },
    /// Requester to responder: write to a channel (the control point).
    Write { channel: Channel, payload: Vec<u8> },
    /// Requester to responder: enable or disable notifications on a channel.
    Subscribe { channel: Channel, enable: bool },
    /// Requester to responder: read a channel value.
    ReadRequest { channel: Channel },
    /// Responder to requester: value of a read. Empty when the channel is not readable.
    ReadResponse { channel: Channel, value: Vec<u8> },
    /// Responder to requester: outcome of a `Subscribe`.
    SubscribeResponse { channel: Channel, accepted: bool },
}

impl Pdu {
    pub fn channel(&self) -> Channel {
        match self {
            Pdu::Notify { channel, .. }
            | Pdu::Write { channel, .. }
            | Pdu::Subscribe { channel, .. }
            | Pdu::ReadRequest { channel }
            | Pdu::ReadResponse { channel, .. }
            | Pdu::SubscribeResponse { channel, .. } => *channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_values() {
        for v in 0x01..=0x08u8 {
            let code = ResponseCode::from_u8(v).unwrap();
            assert_eq!(code.to_u8(), v);
        }
        assert_eq!(ResponseCode::from_u8(0x00), None);
        assert_eq!(ResponseCode::from_u8(0x09), None);
    }
}
