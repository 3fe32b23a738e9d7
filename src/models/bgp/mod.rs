/*!
BGP-4 message models (RFC 4271), plus ROUTE-REFRESH (RFC 2918).
*/
pub mod attributes;
pub mod capabilities;
pub mod fsm;

use crate::models::{Afi, RawPrefix, Safi};
use attributes::{MpNlri, PathAttribute};
use bytes::Bytes;
use capabilities::BgpCapability;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::BTreeMap;

/// Marker + length + type.
pub const BGP_HEADER_LEN: usize = 19;
/// Upper bound on a BGP message, header included.
pub const BGP_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum BgpMessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

/// NOTIFICATION error codes (RFC 4271 §6).
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum NotifErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
}

/// OPEN message error subcodes (RFC 4271 §6.2, RFC 5492 for code 7).
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7,
}

/// UPDATE message error subcodes (RFC 4271 §6.3).
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BgpMessage {
    Open(BgpOpen),
    Update(BgpUpdate),
    Notification(BgpNotification),
    Keepalive,
    RouteRefresh(BgpRouteRefresh),
}

impl BgpMessage {
    pub fn msg_type(&self) -> BgpMessageType {
        match self {
            BgpMessage::Open(_) => BgpMessageType::Open,
            BgpMessage::Update(_) => BgpMessageType::Update,
            BgpMessage::Notification(_) => BgpMessageType::Notification,
            BgpMessage::Keepalive => BgpMessageType::Keepalive,
            BgpMessage::RouteRefresh(_) => BgpMessageType::RouteRefresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpOpen {
    pub version: u8,
    /// AS number as sent in the fixed OPEN field (2 octets on the wire;
    /// AS_TRANS when the real AS needs 4 octets).
    pub asn: u32,
    pub hold_time: u16,
    pub bgp_id: u32,
    pub capabilities: Vec<BgpCapability>,
}

impl BgpOpen {
    /// The 4-octet AS from the capability when advertised, the fixed field
    /// otherwise.
    pub fn effective_asn(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|c| c.four_octet_asn())
            .unwrap_or(self.asn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpNotification {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgpRouteRefresh {
    pub afi: Afi,
    pub safi: Safi,
}

/// Structured form of an UPDATE.
///
/// Non-multiprotocol attributes live in a map keyed by attribute code;
/// a later copy of a code replaces an earlier one. MP_REACH / MP_UNREACH
/// blocks are pulled out with their NLRI bytes separated from the rest of
/// the attribute, which is what the labeling engine needs. `asn_len`
/// records the AS number width the attribute bytes were parsed or built
/// with, so the AS_PATH can be re-encoded at a different width later.
#[derive(Debug, Clone, PartialEq)]
pub struct BgpUpdate {
    pub asn_len: crate::models::AsnLength,
    pub withdrawn: Vec<RawPrefix>,
    pub attributes: BTreeMap<u8, PathAttribute>,
    pub mp_reach: Vec<MpNlri>,
    pub mp_unreach: Vec<MpNlri>,
    pub announced: Vec<RawPrefix>,
}

impl Default for BgpUpdate {
    fn default() -> Self {
        BgpUpdate {
            asn_len: crate::models::AsnLength::Bits32,
            withdrawn: Vec::new(),
            attributes: BTreeMap::new(),
            mp_reach: Vec::new(),
            mp_unreach: Vec::new(),
            announced: Vec::new(),
        }
    }
}

impl BgpUpdate {
    pub fn attr(&self, code: u8) -> Option<&PathAttribute> {
        self.attributes.get(&code)
    }

    /// True when the message moves no reachability information at all.
    pub fn is_empty(&self) -> bool {
        self.withdrawn.is_empty()
            && self.announced.is_empty()
            && self.mp_reach.is_empty()
            && self.mp_unreach.is_empty()
    }
}
