/*!
MRT feed parser: drains a feed's backlog one message at a time, binds each
decoded message to a session, and enqueues it as though it had arrived
over a live peering.

The parser keeps a two-message window: the previous successfully parsed
message is submitted only once the current one also parses. Adjacent
messages often share a framing fault, so a corrupt current message takes
the held previous message down with it.
*/
use crate::error::ParserError;
use crate::models::{
    Afi, AsnLength, AttrFlags, AttrType, Bgp4MpType, Bmf, BmfType, MrtEntryType, MrtHeader,
    MpNlri, PeerIndexTable, RawPrefix, Safi, MRT_MAX_TABLE_PAYLOAD,
};
use crate::mrt::backlog::{Backlog, BacklogRead};
use crate::mrt::MrtStats;
use crate::parser::mrt::{parse_bgp4mp, parse_peer_index_table, parse_rib_entries};
use crate::parser::ReadUtils;
use crate::queue::QueueWriter;
use crate::session::registry::SessionRegistry;
use crate::session::LabelAction;
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Backlog shared between a feed's socket reader and its parser thread.
pub struct FeedShared {
    pub backlog: Mutex<Backlog>,
    pub data_ready: Condvar,
    /// Set by the socket reader when the feed hangs up; the parser drains
    /// the backlog and exits.
    pub closed: std::sync::atomic::AtomicBool,
}

impl FeedShared {
    pub fn new() -> Arc<FeedShared> {
        Arc::new(FeedShared {
            backlog: Mutex::new(Backlog::new()),
            data_ready: Condvar::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

/// A message waiting in the two-message window.
struct Pending {
    bmf: Bmf,
    peer_asn: u32,
    peer_ip: IpAddr,
    asn_len: AsnLength,
}

pub struct FeedParser {
    pub shared: Arc<FeedShared>,
    pub registry: Arc<SessionRegistry>,
    pub peer_queue: QueueWriter<Bmf>,
    pub shutdown: Arc<Shutdown>,
    pub collector_addr: IpAddr,
    pub label_action: LabelAction,
    pub stats: Arc<MrtStats>,
}

impl FeedParser {
    pub fn run(mut self) {
        info!("MRT parser started for collector {}", self.collector_addr);
        let mut peer_index: Option<PeerIndexTable> = None;
        let mut window: Option<Pending> = None;

        loop {
            if self.shutdown.is_set() {
                break;
            }
            let outcome = {
                let mut backlog = self.shared.backlog.lock();
                match backlog.read(MRT_MAX_TABLE_PAYLOAD) {
                    BacklogRead::Empty => {
                        if self.shared.closed.load(Ordering::Acquire) {
                            break;
                        }
                        backlog.shrink();
                        let _ = self
                            .shared
                            .data_ready
                            .wait_for(&mut backlog, THREAD_CHECK_INTERVAL);
                        continue;
                    }
                    other => other,
                }
            };

            match outcome {
                BacklogRead::Message { header, body } => {
                    if let Err(e) =
                        self.handle_message(&header, body, &mut peer_index, &mut window)
                    {
                        warn!("MRT message dropped: {e}");
                        self.stats.messages_corrupt.fetch_add(1, Ordering::Relaxed);
                    }
                }
                BacklogRead::Corrupt => {
                    self.stats.messages_corrupt.fetch_add(1, Ordering::Relaxed);
                    if window.take().is_some() {
                        debug!("discarding previously parsed message next to corruption");
                    }
                    let mut backlog = self.shared.backlog.lock();
                    if !backlog.fast_forward() {
                        warn!("MRT feed resynchronisation failed; backlog drained");
                    }
                }
                BacklogRead::TooLarge(len) => {
                    warn!("MRT message of {len} bytes exceeds the parser limit; skipped");
                    // consume it through a throwaway read at the larger cap
                    let mut backlog = self.shared.backlog.lock();
                    let _ = backlog.read(usize::MAX);
                }
                BacklogRead::Empty => unreachable!("handled under the lock"),
            }
        }

        // the window survives only until feed teardown
        if let Some(pending) = window.take() {
            self.submit(pending);
        }
        info!("MRT parser exiting for collector {}", self.collector_addr);
    }

    fn handle_message(
        &mut self,
        header: &MrtHeader,
        body: Bytes,
        peer_index: &mut Option<PeerIndexTable>,
        window: &mut Option<Pending>,
    ) -> Result<(), ParserError> {
        match MrtEntryType::try_from(header.entry_type) {
            Ok(MrtEntryType::Bgp4Mp) => {
                let subtype = Bgp4MpType::try_from(header.entry_subtype).map_err(|_| {
                    ParserError::ParseError(format!(
                        "unknown BGP4MP subtype {}",
                        header.entry_subtype
                    ))
                })?;
                let message = match parse_bgp4mp(subtype, body)? {
                    Some(message) => message,
                    None => return Ok(()), // state change, nothing to carry
                };
                if message.is_keepalive() {
                    // header-only BGP payload; the window stays as it is
                    debug!("MRT feed keepalive from AS{}", message.peer_asn);
                    return Ok(());
                }
                let asn_len = match subtype {
                    Bgp4MpType::MessageAs4 => AsnLength::Bits32,
                    _ => AsnLength::Bits16,
                };
                let mut bmf =
                    Bmf::with_timestamp(0, BmfType::MsgFromPeer, header.timestamp);
                bmf.append(&message.bgp_bytes)?;
                let current = Pending {
                    bmf,
                    peer_asn: message.peer_asn,
                    peer_ip: message.peer_ip,
                    asn_len,
                };
                if let Some(previous) = window.replace(current) {
                    self.submit(previous);
                }
                Ok(())
            }
            Ok(MrtEntryType::TableDumpV2) => {
                self.handle_table_dump(header, body, peer_index)
            }
            Err(_) => Err(ParserError::ParseError(format!(
                "unknown MRT entry type {}",
                header.entry_type
            ))),
        }
    }

    fn handle_table_dump(
        &mut self,
        header: &MrtHeader,
        body: Bytes,
        peer_index: &mut Option<PeerIndexTable>,
    ) -> Result<(), ParserError> {
        let subtype =
            crate::models::TableDumpV2Type::try_from(header.entry_subtype).map_err(|_| {
                ParserError::ParseError(format!(
                    "unknown TABLE_DUMP_V2 subtype {}",
                    header.entry_subtype
                ))
            })?;
        if subtype == crate::models::TableDumpV2Type::PeerIndexTable {
            let table = parse_peer_index_table(body)?;
            info!(
                "peer index table: collector {:#010x}, {} peers",
                table.collector_bgp_id,
                table.peers.len()
            );
            *peer_index = Some(table);
            return Ok(());
        }

        let rib = parse_rib_entries(subtype, body)?;
        let index = peer_index.as_ref().ok_or_else(|| {
            ParserError::ParseError("RIB entries before any PEER_INDEX_TABLE".to_string())
        })?;

        for entry in &rib.entries {
            let peer = match index.peers.get(entry.peer_index as usize) {
                Some(peer) => peer,
                None => {
                    warn!("RIB entry references unknown peer {}", entry.peer_index);
                    continue;
                }
            };
            let (attrs, nlri) =
                synthesize_update_parts(entry.attributes.clone(), &rib.header.prefix)?;
            let raw = crate::parser::bgp::messages::build_raw_update(&attrs, &nlri);
            let mut bmf =
                Bmf::with_timestamp(0, BmfType::MsgFromPeer, entry.originated_time);
            bmf.append(&raw)?;
            self.submit(Pending {
                bmf,
                peer_asn: peer.asn,
                peer_ip: peer.ip,
                asn_len: AsnLength::Bits32,
            });
        }
        Ok(())
    }

    /// Bind a session id and enqueue; identity comes from the
    /// (peer AS, peer address, collector address) tuple.
    fn submit(&self, pending: Pending) {
        let session = match self.registry.find_or_create_mrt(
            pending.peer_asn,
            pending.peer_ip,
            self.collector_addr,
            self.label_action,
            pending.asn_len,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "no session for MRT peer AS{} {}: {e}",
                    pending.peer_asn, pending.peer_ip
                );
                return;
            }
        };
        let mut bmf = pending.bmf;
        bmf.session_id = session.id;
        session
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        self.stats.messages_parsed.fetch_add(1, Ordering::Relaxed);
        self.peer_queue.write(Arc::new(bmf));
    }
}

/// Turn one RIB entry into the attribute and NLRI sections of a synthetic
/// UPDATE.
///
/// TABLE_DUMP_V2 stores MP_REACH as next-hop-only (RFC 6396 §4.3.4); for
/// non-IPv4-unicast prefixes that attribute is rebuilt in its RFC 4760
/// shape with the entry's prefix as NLRI. IPv4 unicast prefixes travel in
/// the plain NLRI section instead.
pub fn synthesize_update_parts(
    mut attrs: Bytes,
    prefix: &RawPrefix,
) -> Result<(Bytes, Bytes), ParserError> {
    let v4_unicast = prefix.afi == Afi::Ipv4 && prefix.safi == Safi::Unicast;
    let mut out = BytesMut::new();
    let mut saw_mp_reach = false;

    while attrs.remaining() >= 3 {
        let flags = AttrFlags::from_bits_retain(attrs.read_u8()?);
        let code = attrs.read_u8()?;
        let len = if flags.contains(AttrFlags::EXTENDED) {
            attrs.read_u16()? as usize
        } else {
            attrs.read_u8()? as usize
        };
        let mut value = attrs.read_n_bytes(len)?;

        match AttrType::from(code) {
            AttrType::MP_REACHABLE_NLRI => {
                saw_mp_reach = true;
                if v4_unicast {
                    // the next hop for v4 unicast lives in NEXT_HOP
                    continue;
                }
                let next_hop_len = value.read_u8()? as usize;
                let next_hop = value.read_n_bytes(next_hop_len)?;
                let block = MpNlri {
                    reachable: true,
                    afi: prefix.afi,
                    safi: prefix.safi,
                    next_hop,
                    prefixes: vec![prefix.clone()],
                };
                block.to_attribute().encode(&mut out);
            }
            AttrType::MP_UNREACHABLE_NLRI => continue,
            _ => {
                let attr =
                    crate::models::PathAttribute::new(flags, code, value);
                attr.encode(&mut out);
            }
        }
    }

    let mut nlri = BytesMut::new();
    if v4_unicast {
        prefix.encode(&mut nlri);
    } else if !saw_mp_reach {
        // no stored next hop at all; still announce the prefix
        let block = MpNlri {
            reachable: true,
            afi: prefix.afi,
            safi: prefix.safi,
            next_hop: Bytes::new(),
            prefixes: vec![prefix.clone()],
        };
        block.to_attribute().encode(&mut out);
    }

    Ok((out.freeze(), nlri.freeze()))
}
