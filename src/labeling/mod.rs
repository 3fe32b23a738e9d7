/*!
Labeling engine: the single consumer of the peer queue.

Each `MSG_FROM_PEER` record carrying an UPDATE is parsed, applied to the
owning session's RIB, and forwarded to the labeled queue with one
classification byte appended per prefix, in the order the prefixes were
processed.
*/
pub mod store;
pub mod transfer;

use crate::models::{AttrType, BgpMessage, BgpUpdate, Bmf, BmfType, PathAttribute};
use crate::parser::bgp::parse_bgp_message;
use crate::queue::{QueueReader, QueueWriter, ReadOutcome};
use crate::session::registry::SessionRegistry;
use crate::session::{LabelAction, Session};
use crate::shutdown::Shutdown;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use std::sync::Arc;

pub use store::{AttrId, PathId, PrefixId, RibTable};

/// Classification byte appended to a labeled record, one per prefix.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum Label {
    AnnNew = 1,
    AnnDuplicate = 2,
    AnnSpath = 3,
    AnnDpath = 4,
    WdrNew = 5,
    WdrDuplicate = 6,
}

/// An update's attribute section normalised for the attribute table:
/// the AS_PATH value bytes, and the remaining attributes as basic
/// attributes followed by the NLRI-less MP_REACH headers.
pub struct NormalizedAttrs {
    pub as_path: Bytes,
    pub attr_bytes: Bytes,
    pub basic_len: usize,
}

/// Rebuild the attribute buffer the way the attribute table keys on it:
/// every non-path, non-MP attribute in ascending code order, then each
/// MP_REACH re-serialised with its NLRI stripped and its length field
/// reflecting the stripped form.
pub fn normalize_attrs(update: &BgpUpdate) -> NormalizedAttrs {
    let as_path = update
        .attr(AttrType::AS_PATH.into())
        .map(|attr| attr.value.clone())
        .unwrap_or_default();

    let mut basic = BytesMut::new();
    for attr in update.attributes.values() {
        if attr.attr_type() == AttrType::AS_PATH {
            continue;
        }
        attr.encode(&mut basic);
    }
    let basic_len = basic.len();

    for block in &update.mp_reach {
        let header_only = PathAttribute::new(
            crate::models::AttrFlags::OPTIONAL,
            block.attr_code(),
            block.encode_header().freeze(),
        );
        header_only.encode(&mut basic);
    }

    NormalizedAttrs {
        as_path,
        attr_bytes: basic.freeze(),
        basic_len,
    }
}

/// Apply one parsed UPDATE to a session's RIB, returning the labels in
/// processing order: IPv4 withdrawals, the MP blocks in wire order, then
/// IPv4 announcements.
pub fn apply_update(
    table: &mut RibTable,
    update: &BgpUpdate,
    timestamp: u32,
) -> SmallVec<[Label; 16]> {
    let mut labels: SmallVec<[Label; 16]> = SmallVec::new();
    let mut searched: Option<AttrId> = None;

    for prefix in &update.withdrawn {
        labels.push(table.apply_unreachable(prefix));
    }

    let normalized = normalize_attrs(update);
    let mut resolve = |table: &mut RibTable, searched: &mut Option<AttrId>| -> AttrId {
        match *searched {
            Some(id) => id,
            None => {
                let id = table.search_attr(
                    &normalized.as_path,
                    normalized.attr_bytes.clone(),
                    normalized.basic_len,
                );
                *searched = Some(id);
                id
            }
        }
    };

    for block in &update.mp_unreach {
        for prefix in &block.prefixes {
            labels.push(table.apply_unreachable(prefix));
        }
    }
    for block in &update.mp_reach {
        let attr_id = resolve(table, &mut searched);
        for prefix in &block.prefixes {
            labels.push(table.apply_reachable(prefix, attr_id, timestamp));
        }
    }
    if !update.announced.is_empty() {
        let attr_id = resolve(table, &mut searched);
        for prefix in &update.announced {
            labels.push(table.apply_reachable(prefix, attr_id, timestamp));
        }
    }

    if let Some(attr_id) = searched {
        table.drop_if_unreferenced(attr_id);
    }
    labels
}

/// The labeling thread: drain the peer queue until shutdown.
pub fn run(
    shutdown: Arc<Shutdown>,
    registry: Arc<SessionRegistry>,
    reader: QueueReader<Bmf>,
    labeled: QueueWriter<Bmf>,
) {
    info!("labeling thread started");
    loop {
        if shutdown.is_set() {
            break;
        }
        match reader.read() {
            ReadOutcome::Item(bmf) => handle_record(&registry, &labeled, bmf),
            ReadOutcome::Empty => continue, // woken by queue shutdown
            ReadOutcome::Cancelled => break,
        }
    }
    info!("labeling thread exiting");
}

fn handle_record(registry: &SessionRegistry, labeled: &QueueWriter<Bmf>, bmf: Arc<Bmf>) {
    if bmf.bmf_type != BmfType::MsgFromPeer {
        // status, lifecycle and state-change records pass through untouched
        labeled.write(bmf);
        return;
    }

    let session = match registry.get(bmf.session_id) {
        Some(session) => session,
        None => {
            warn!("record for unknown session {}; forwarding unlabeled", bmf.session_id);
            forward_as_labeled(labeled, &bmf, &[]);
            return;
        }
    };

    let message = match parse_bgp_message(
        Bytes::copy_from_slice(bmf.payload()),
        session.asn_len(),
    ) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                "session {}: undecodable message in labeling stage: {e}",
                session.id
            );
            forward_as_labeled(labeled, &bmf, &[]);
            return;
        }
    };

    let update = match message {
        BgpMessage::Update(update) => update,
        _ => {
            // keepalives and control messages carry no prefixes to label
            forward_as_labeled(labeled, &bmf, &[]);
            return;
        }
    };

    match session.config.label_action {
        LabelAction::NoAction => forward_as_labeled(labeled, &bmf, &[]),
        action => {
            let labels = label_against_session(&session, &update, bmf.timestamp);
            match action {
                LabelAction::StoreRibOnly => forward_as_labeled(labeled, &bmf, &[]),
                _ => {
                    let raw: SmallVec<[u8; 16]> =
                        labels.iter().map(|&l| u8::from(l)).collect();
                    forward_as_labeled(labeled, &bmf, &raw);
                }
            }
        }
    }
}

fn label_against_session(
    session: &Session,
    update: &BgpUpdate,
    timestamp: u32,
) -> SmallVec<[Label; 16]> {
    let mut rib = session.rib.write();
    let table = match rib.as_mut() {
        Some(table) => table,
        None => {
            debug!("session {} has no RIB; update ignored", session.id);
            return SmallVec::new();
        }
    };
    let labels = apply_update(table, update, timestamp);
    for &label in &labels {
        session.stats.record_label(label);
    }
    session
        .stats
        .set_table_sizes(table.prefix_count(), table.attr_count(), table.memory_used());
    labels
}

fn forward_as_labeled(labeled: &QueueWriter<Bmf>, original: &Bmf, labels: &[u8]) {
    let mut record = original.clone();
    record.bmf_type = BmfType::MsgLabeled;
    if !labels.is_empty() {
        if let Err(e) = record.append(labels) {
            warn!("label bytes dropped: {e}");
        }
    }
    labeled.write(Arc::new(record));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Afi, AsnLength, AttrFlags, MpNlri, RawPrefix, Safi};
    use crate::parser::bgp::messages::build_raw_update;

    fn parse_update(raw: Bytes) -> BgpUpdate {
        match parse_bgp_message(raw, AsnLength::Bits16).unwrap() {
            BgpMessage::Update(update) => update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    fn announce(prefix_bytes: &[u8], as_path_value: &[u8]) -> BgpUpdate {
        let mut attrs = BytesMut::new();
        PathAttribute::new(AttrFlags::TRANSITIVE, 1, Bytes::from_static(&[0])).encode(&mut attrs);
        PathAttribute::new(
            AttrFlags::TRANSITIVE,
            2,
            Bytes::copy_from_slice(as_path_value),
        )
        .encode(&mut attrs);
        PathAttribute::new(
            AttrFlags::TRANSITIVE,
            3,
            Bytes::from_static(&[10, 0, 0, 1]),
        )
        .encode(&mut attrs);
        parse_update(build_raw_update(&attrs, prefix_bytes))
    }

    fn withdraw(prefix_bytes: &[u8]) -> BgpUpdate {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&crate::parser::bgp::BGP_MARKER);
        let body_len = 19 + 2 + 2 + prefix_bytes.len();
        raw.extend_from_slice(&(body_len as u16).to_be_bytes());
        raw.extend_from_slice(&[2]); // UPDATE
        raw.extend_from_slice(&(prefix_bytes.len() as u16).to_be_bytes());
        raw.extend_from_slice(prefix_bytes);
        raw.extend_from_slice(&[0, 0]); // no attributes
        parse_update(raw.freeze())
    }

    #[test]
    fn test_announce_then_withdraw() {
        let mut table = RibTable::new(64, 64, 16);
        let ann = announce(&[8, 10], &[2, 1, 0, 1]); // 10.0.0.0/8, path {1}
        let labels = apply_update(&mut table, &ann, 100);
        assert_eq!(labels.as_slice(), &[Label::AnnNew]);

        let wdr = withdraw(&[8, 10]);
        let labels = apply_update(&mut table, &wdr, 200);
        assert_eq!(labels.as_slice(), &[Label::WdrNew]);

        assert_eq!(table.prefix_count(), 0);
        assert_eq!(table.attr_count(), 0);
        assert_eq!(table.path_count(), 0);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_identical_reannouncement_is_duplicate() {
        let mut table = RibTable::new(64, 64, 16);
        let ann = announce(&[8, 10], &[2, 1, 0, 1]);
        assert_eq!(apply_update(&mut table, &ann, 100).as_slice(), &[Label::AnnNew]);
        assert_eq!(
            apply_update(&mut table, &ann, 200).as_slice(),
            &[Label::AnnDuplicate]
        );
        assert_eq!(table.prefix_count(), 1);
        assert_eq!(table.attr_count(), 1);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_new_path_is_dpath_and_frees_old_node() {
        let mut table = RibTable::new(64, 64, 16);
        let first = announce(&[8, 10], &[2, 1, 0, 1]); // path {1}
        apply_update(&mut table, &first, 100);
        let second = announce(&[8, 10], &[2, 2, 0, 1, 0, 2]); // path {1 2}
        assert_eq!(
            apply_update(&mut table, &second, 200).as_slice(),
            &[Label::AnnDpath]
        );
        assert_eq!(table.attr_count(), 1);
        assert_eq!(table.path_count(), 1);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_withdraw_of_unknown_prefix_is_duplicate() {
        let mut table = RibTable::new(64, 64, 16);
        let wdr = withdraw(&[8, 10]);
        assert_eq!(
            apply_update(&mut table, &wdr, 100).as_slice(),
            &[Label::WdrDuplicate]
        );
    }

    #[test]
    fn test_labels_follow_prefix_order_within_update() {
        let mut table = RibTable::new(64, 64, 16);
        let seed = announce(&[8, 10], &[2, 1, 0, 1]); // install 10.0.0.0/8
        apply_update(&mut table, &seed, 50);

        // one update announcing both a known and a new prefix
        let both = announce(&[8, 10, 16, 192, 0], &[2, 1, 0, 1]);
        let labels = apply_update(&mut table, &both, 100);
        assert_eq!(labels.as_slice(), &[Label::AnnDuplicate, Label::AnnNew]);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_mp_reach_prefixes_are_applied() {
        let mut table = RibTable::new(64, 64, 16);
        let mut attrs = BytesMut::new();
        PathAttribute::new(
            AttrFlags::TRANSITIVE,
            2,
            Bytes::from_static(&[2, 1, 0, 1]),
        )
        .encode(&mut attrs);
        let block = MpNlri {
            reachable: true,
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
            next_hop: Bytes::from_static(&[0; 16]),
            prefixes: vec![RawPrefix::new(
                Afi::Ipv6,
                Safi::Unicast,
                32,
                &[0x20, 0x01, 0x0d, 0xb8],
            )],
        };
        block.to_attribute().encode(&mut attrs);
        let update = parse_update(build_raw_update(&attrs, &[]));
        assert_eq!(update.mp_reach.len(), 1);

        let labels = apply_update(&mut table, &update, 100);
        assert_eq!(labels.as_slice(), &[Label::AnnNew]);
        assert_eq!(table.prefix_count(), 1);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_normalize_strips_nlri_from_mp_reach() {
        let mut attrs = BytesMut::new();
        PathAttribute::new(AttrFlags::TRANSITIVE, 2, Bytes::from_static(&[2, 1, 0, 1]))
            .encode(&mut attrs);
        let block = MpNlri {
            reachable: true,
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
            next_hop: Bytes::new(),
            prefixes: vec![RawPrefix::new(
                Afi::Ipv6,
                Safi::Unicast,
                32,
                &[0x20, 0x01, 0x0d, 0xb8],
            )],
        };
        block.to_attribute().encode(&mut attrs);
        let update = parse_update(build_raw_update(&attrs, &[]));

        let normalized = normalize_attrs(&update);
        assert_eq!(normalized.as_path, Bytes::from_static(&[2, 1, 0, 1]));
        assert_eq!(normalized.basic_len, 0);
        // header-only MP_REACH: flag, code, len, afi(2), safi, nh len, reserved
        assert_eq!(normalized.attr_bytes.len(), 3 + 5);
    }
}
