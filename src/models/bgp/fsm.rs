use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};

/// BGP finite state machine states (RFC 4271 §8), extended with two
/// collector-local terminal states: `MrtEstablished` for sessions whose
/// identity was synthesised from an MRT feed and which never exchange
/// control messages, and `Error` for sessions torn down by the operator.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum BgpState {
    Idle = 1,
    Connect = 2,
    Active = 3,
    OpenSent = 4,
    OpenConfirm = 5,
    Established = 6,
    MrtEstablished = 7,
    Error = 8,
}

impl BgpState {
    /// States in which the session owns live routing tables.
    pub fn is_established(&self) -> bool {
        matches!(self, BgpState::Established | BgpState::MrtEstablished)
    }
}

impl Display for BgpState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BgpState::Idle => "Idle",
            BgpState::Connect => "Connect",
            BgpState::Active => "Active",
            BgpState::OpenSent => "OpenSent",
            BgpState::OpenConfirm => "OpenConfirm",
            BgpState::Established => "Established",
            BgpState::MrtEstablished => "MrtEstablished",
            BgpState::Error => "Error",
        };
        write!(f, "{name}")
    }
}

/// Events driving the state machine. The numeric value doubles as the
/// reason code carried in FSM_STATE_CHANGE records.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum FsmEvent {
    None = 0,
    ManualStart = 1,
    ManualStop = 2,
    ConnectRetryTimerExpire = 3,
    HoldTimerExpire = 4,
    KeepaliveTimerExpire = 5,
    TcpConnectionConfirmed = 6,
    TcpConnectionFails = 7,
    BgpOpen = 8,
    BgpOpenMsgErr = 9,
    BgpHeaderErr = 10,
    NotifMsgVerErr = 11,
    NotifMsg = 12,
    KeepAliveMsg = 13,
    UpdateMsg = 14,
    UpdateMsgErr = 15,
    UnsupportedCapability = 16,
}
