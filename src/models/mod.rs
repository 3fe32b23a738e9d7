/*!
Data models for everything that crosses a module boundary: network
primitives, BGP messages, MRT records, and the internal BMF envelope.
*/
pub mod bgp;
pub mod bmf;
pub mod mrt;
pub mod network;

pub use bgp::attributes::{AsPath, AsPathSegment, AttrFlags, AttrType, MpNlri, PathAttribute};
pub use bgp::capabilities::{BgpCapability, BgpCapabilityCode};
pub use bgp::fsm::{BgpState, FsmEvent};
pub use bgp::{
    BgpMessage, BgpMessageType, BgpNotification, BgpOpen, BgpRouteRefresh, BgpUpdate,
    NotifErrorCode, OpenErrorSubcode, UpdateErrorSubcode,
};
pub use bmf::{Bmf, BmfType, StateChange, BMF_HEADER_LEN, BMF_MAX_MSG_LEN};
pub use mrt::{
    Bgp4MpMessage, Bgp4MpType, MrtEntryType, MrtHeader, PeerIndexEntry, PeerIndexTable,
    RibEntry, RibEntryHeader, TableDumpV2Type, MRT_HEADER_LEN, MRT_MAX_PAYLOAD,
    MRT_MAX_TABLE_PAYLOAD,
};
pub use network::{Afi, AsnLength, RawPrefix, Safi, AS_TRANS};
