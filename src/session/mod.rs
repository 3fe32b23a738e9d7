/*!
Per-peer session state shared across threads.

The owning peer thread drives the FSM and the socket; every other thread
(labeling, periodic, MRT ingest, control) touches a session only through
the registry, typed atomic setters, and the RIB lock.
*/
pub mod fsm;
pub mod peer;
pub mod registry;

use crate::labeling::{Label, RibTable};
use crate::models::bgp::capabilities::CapabilityRequirement;
use crate::models::{AsnLength, BgpCapability, BgpState, FsmEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub use registry::SessionRegistry;

/// Hard cap on concurrently allocated session ids.
pub const MAX_SESSION_IDS: usize = 1024;

/// What the labeling engine does with a session's updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LabelAction {
    /// Forward without touching any table.
    NoAction,
    /// Maintain the RIB and append labels.
    #[default]
    Label,
    /// Maintain the RIB but emit no labels.
    StoreRibOnly,
}

/// Configuration a session runs with, frozen at session creation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub local_as: u32,
    pub local_bgp_id: u32,
    pub local_hold_time: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    /// Zero means "accept whatever AS the peer states".
    pub remote_as: u32,
    pub remote_min_hold_time: u16,
    /// Collector address for sessions synthesised from an MRT feed.
    pub collector_addr: Option<IpAddr>,
    pub md5_password: Option<String>,
    pub label_action: LabelAction,
    /// Operator consent for sending ROUTE-REFRESH to this peer.
    pub route_refresh_action: bool,
    /// Accept inbound connections instead of dialing out.
    pub passive: bool,
    pub connect_retry_secs: u64,
    pub announce_capabilities: Vec<BgpCapability>,
    pub capability_requirements: Vec<CapabilityRequirement>,
    pub prefix_table_buckets: usize,
    pub attr_table_buckets: usize,
    pub max_collision: u16,
}

impl SessionConfig {
    /// Whether this side advertises the 4-octet AS capability.
    pub fn announces_four_octet_as(&self) -> bool {
        self.announce_capabilities
            .iter()
            .any(|c| c.four_octet_asn().is_some())
    }
}

/// Counter block, updated by the owning threads through atomics so status
/// sweeps never take a lock.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub connect_retry_count: AtomicU32,
    pub session_down_count: AtomicU32,
    pub last_down_time: AtomicI64,
    pub establish_time: AtomicI64,
    pub last_route_refresh: AtomicI64,
    pub messages_received: AtomicU64,
    pub ann_new: AtomicU64,
    pub ann_duplicate: AtomicU64,
    pub ann_spath: AtomicU64,
    pub ann_dpath: AtomicU64,
    pub wdr_new: AtomicU64,
    pub wdr_duplicate: AtomicU64,
    pub prefix_count: AtomicU64,
    pub attr_count: AtomicU64,
    pub memory_used: AtomicU64,
}

impl SessionStats {
    pub fn record_label(&self, label: Label) {
        let counter = match label {
            Label::AnnNew => &self.ann_new,
            Label::AnnDuplicate => &self.ann_duplicate,
            Label::AnnSpath => &self.ann_spath,
            Label::AnnDpath => &self.ann_dpath,
            Label::WdrNew => &self.wdr_new,
            Label::WdrDuplicate => &self.wdr_duplicate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_table_sizes(&self, prefixes: usize, attrs: usize, memory: u64) {
        self.prefix_count.store(prefixes as u64, Ordering::Relaxed);
        self.attr_count.store(attrs as u64, Ordering::Relaxed);
        self.memory_used.store(memory, Ordering::Relaxed);
    }

    pub fn record_down(&self, now: i64) {
        self.session_down_count.fetch_add(1, Ordering::Relaxed);
        self.last_down_time.store(now, Ordering::Relaxed);
        self.establish_time.store(0, Ordering::Relaxed);
    }
}

/// One peering (or MRT-synthesised) session.
pub struct Session {
    pub id: u16,
    pub config: SessionConfig,
    pub stats: SessionStats,
    pub rib: RwLock<Option<RibTable>>,
    state: AtomicU8,
    reason: AtomicU16,
    asn_len_octets: AtomicU8,
    route_refresh_flag: AtomicBool,
    last_action: AtomicI64,
    peer_capabilities: RwLock<Vec<BgpCapability>>,
}

impl Session {
    pub fn new(id: u16, config: SessionConfig) -> Session {
        Session {
            id,
            config,
            stats: SessionStats::default(),
            rib: RwLock::new(None),
            state: AtomicU8::new(BgpState::Idle.into()),
            reason: AtomicU16::new(FsmEvent::None.into()),
            asn_len_octets: AtomicU8::new(2),
            route_refresh_flag: AtomicBool::new(false),
            last_action: AtomicI64::new(chrono::Utc::now().timestamp()),
            peer_capabilities: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> BgpState {
        BgpState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(BgpState::Error)
    }

    pub fn reason(&self) -> FsmEvent {
        FsmEvent::try_from(self.reason.load(Ordering::Acquire)).unwrap_or(FsmEvent::None)
    }

    pub fn set_state(&self, state: BgpState, reason: FsmEvent) {
        self.state.store(state.into(), Ordering::Release);
        self.reason.store(reason.into(), Ordering::Release);
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    pub fn asn_len(&self) -> AsnLength {
        match self.asn_len_octets.load(Ordering::Acquire) {
            4 => AsnLength::Bits32,
            _ => AsnLength::Bits16,
        }
    }

    pub fn set_asn_len(&self, asn_len: AsnLength) {
        self.asn_len_octets
            .store(asn_len.octets() as u8, Ordering::Release);
    }

    /// Ask the peer thread to send a ROUTE-REFRESH; consulted at the top
    /// of the FSM loop.
    pub fn set_route_refresh_flag(&self) {
        self.route_refresh_flag.store(true, Ordering::Release);
    }

    pub fn take_route_refresh_flag(&self) -> bool {
        self.route_refresh_flag.swap(false, Ordering::AcqRel)
    }

    pub fn touch(&self) {
        self.last_action
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_action(&self) -> i64 {
        self.last_action.load(Ordering::Relaxed)
    }

    pub fn set_peer_capabilities(&self, caps: Vec<BgpCapability>) {
        *self.peer_capabilities.write() = caps;
    }

    /// Whether the peer advertised ROUTE-REFRESH support.
    pub fn peer_supports_route_refresh(&self) -> bool {
        self.peer_capabilities
            .read()
            .iter()
            .any(|c| c.is_route_refresh())
    }

    /// Seconds since this session reached Established, zero otherwise.
    pub fn uptime(&self, now: i64) -> i64 {
        let established = self.stats.establish_time.load(Ordering::Relaxed);
        if established > 0 && self.is_established() {
            now - established
        } else {
            0
        }
    }

    /// Build the per-session tables with the configured sizes. Called on
    /// the transition into Established.
    pub fn create_tables(&self) {
        let mut rib = self.rib.write();
        *rib = Some(RibTable::new(
            self.config.prefix_table_buckets,
            self.config.attr_table_buckets,
            self.config.max_collision,
        ));
    }

    /// Drop the per-session tables in one swap; every prefix, attribute
    /// and path they own goes with them.
    pub fn release_tables(&self) {
        let mut rib = self.rib.write();
        *rib = None;
        self.stats.set_table_sizes(0, 0, 0);
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_addr: IpAddr::from([0, 0, 0, 0]),
            local_port: 179,
            local_as: 0,
            local_bgp_id: 0,
            local_hold_time: 180,
            remote_addr: IpAddr::from([0, 0, 0, 0]),
            remote_port: 179,
            remote_as: 0,
            remote_min_hold_time: 3,
            collector_addr: None,
            md5_password: None,
            label_action: LabelAction::Label,
            route_refresh_action: false,
            passive: false,
            connect_retry_secs: 120,
            announce_capabilities: Vec::new(),
            capability_requirements: Vec::new(),
            prefix_table_buckets: 4096,
            attr_table_buckets: 4096,
            max_collision: 100,
        }
    }
}
