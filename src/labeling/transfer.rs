/*!
Table transfer: re-emit a session's RIB as synthetic UPDATE messages.

For every attribute record, one or more UPDATEs are built that together
carry each prefix currently referencing that record. Prefixes of the
IPv4/unicast family travel in the plain NLRI section; every other family
rides a rebuilt MP_REACH whose length grows as prefixes are appended.
When a message would exceed the BGP size cap it is flushed and a fresh
one is started with the same attribute prelude.
*/
use crate::labeling::store::{AttrId, RibTable};
use crate::models::bgp::{BGP_HEADER_LEN, BGP_MAX_MESSAGE_LEN};
use crate::models::{
    Afi, AttrFlags, AttrType, Bmf, BmfType, MpNlri, PathAttribute, RawPrefix, Safi,
};
use crate::parser::bgp::messages::build_raw_update;
use crate::parser::ReadUtils;
use crate::queue::QueueWriter;
use crate::session::Session;
use bytes::{Bytes, BytesMut};
use log::{error, info};
use std::sync::Arc;

/// Emit the whole RIB of `session` to the labeled queue as TABLE_TRANSFER
/// records, bracketed by TABLE_START and TABLE_STOP markers. Returns the
/// number of UPDATE messages emitted.
pub fn send_rib_table(session: &Session, labeled: &QueueWriter<Bmf>) -> usize {
    let start = Bmf::new(session.id, BmfType::TableStart);
    labeled.write(Arc::new(start));

    let mut emitted = 0;
    {
        let rib = session.rib.read();
        if let Some(table) = rib.as_ref() {
            for attr_id in table.attr_ids() {
                emitted += send_attr_node(table, attr_id, session.id, labeled);
            }
        }
    }

    let stop = Bmf::new(session.id, BmfType::TableStop);
    labeled.write(Arc::new(stop));
    info!(
        "session {}: table transfer emitted {} update messages",
        session.id, emitted
    );
    emitted
}

/// Emit every prefix referencing one attribute record. Returns the number
/// of messages written.
pub fn send_attr_node(
    table: &RibTable,
    attr_id: AttrId,
    session_id: u16,
    labeled: &QueueWriter<Bmf>,
) -> usize {
    let attr = match table.attr(attr_id) {
        Some(attr) => attr,
        None => return 0,
    };
    let path = match table.path(attr.path) {
        Some(path) => path,
        None => {
            error!("attribute record without a live AS path; skipped");
            return 0;
        }
    };

    // the attribute prelude every emitted message shares: AS_PATH plus
    // the stored basic attributes
    let mut prelude = BytesMut::new();
    if !path.bytes.is_empty() {
        PathAttribute::new(
            AttrFlags::TRANSITIVE,
            AttrType::AS_PATH.into(),
            path.bytes.clone(),
        )
        .encode(&mut prelude);
    }
    prelude.extend_from_slice(&attr.attr_bytes[..attr.basic_len]);
    let prelude = prelude.freeze();

    // resolve the prefixes referencing this record, split by family
    let mut v4_unicast: Vec<&RawPrefix> = Vec::new();
    let mut mp_families: Vec<(Afi, Safi, Vec<&RawPrefix>)> = Vec::new();
    for &prefix_id in &attr.back_refs {
        let record = match table.prefix(prefix_id) {
            Some(record) => record,
            None => {
                error!("stale back reference during table transfer; skipped");
                continue;
            }
        };
        let key = &record.key;
        if key.afi == Afi::Ipv4 && key.safi == Safi::Unicast {
            v4_unicast.push(key);
        } else {
            match mp_families
                .iter_mut()
                .find(|(afi, safi, _)| *afi == key.afi && *safi == key.safi)
            {
                Some((_, _, list)) => list.push(key),
                None => mp_families.push((key.afi, key.safi, vec![key])),
            }
        }
    }

    // the stored MP_REACH headers carry the next hop per family
    let mp_headers = parse_mp_headers(&attr.attr_bytes[attr.basic_len..]);

    let room = BGP_MAX_MESSAGE_LEN - BGP_HEADER_LEN - 2 - 2 - prelude.len();
    let mut emitted = 0;

    let mut mp_scratch: Vec<MpNlri> = Vec::new();
    let mut mp_used = 0usize;
    let mut nlri_scratch = BytesMut::new();

    let mut flush = |mp: &mut Vec<MpNlri>, nlri: &mut BytesMut, emitted: &mut usize| {
        if mp.is_empty() && nlri.is_empty() {
            return;
        }
        let mut attrs = BytesMut::new();
        attrs.extend_from_slice(&prelude);
        for block in mp.iter() {
            block.to_attribute().encode(&mut attrs);
        }
        let raw = build_raw_update(&attrs, nlri);
        let mut bmf = Bmf::new(session_id, BmfType::TableTransfer);
        if bmf.append(&raw).is_err() {
            error!("table transfer message exceeded the record cap; dropped");
        } else {
            labeled.write(Arc::new(bmf));
            *emitted += 1;
        }
        mp.clear();
        nlri.clear();
    };

    for (afi, safi, prefixes) in &mp_families {
        let next_hop = mp_headers
            .iter()
            .find(|h| h.afi == *afi && h.safi == *safi)
            .map(|h| h.next_hop.clone())
            .unwrap_or_default();
        // afi + safi + next hop length + next hop + reserved, plus the
        // attribute framing
        let block_overhead = 3 + 2 + 1 + 1 + next_hop.len() + 1;
        let mut block = MpNlri {
            reachable: true,
            afi: *afi,
            safi: *safi,
            next_hop: next_hop.clone(),
            prefixes: Vec::new(),
        };
        let mut block_used = block_overhead;
        for prefix in prefixes {
            let need = prefix.encoded_len();
            if mp_used + block_used + need + nlri_scratch.len() > room {
                if !block.prefixes.is_empty() {
                    mp_scratch.push(block.clone());
                }
                flush(&mut mp_scratch, &mut nlri_scratch, &mut emitted);
                mp_used = 0;
                block.prefixes.clear();
                block_used = block_overhead;
            }
            block.prefixes.push((*prefix).clone());
            block_used += need;
        }
        if !block.prefixes.is_empty() {
            mp_scratch.push(block);
            mp_used += block_used;
        }
    }

    for prefix in &v4_unicast {
        let need = prefix.encoded_len();
        if mp_used + nlri_scratch.len() + need > room {
            flush(&mut mp_scratch, &mut nlri_scratch, &mut emitted);
            mp_used = 0;
        }
        prefix.encode(&mut nlri_scratch);
    }

    flush(&mut mp_scratch, &mut nlri_scratch, &mut emitted);
    emitted
}

struct MpHeader {
    afi: Afi,
    safi: Safi,
    next_hop: Bytes,
}

/// Walk the NLRI-less MP_REACH attribute records stored after the basic
/// attributes, extracting the per-family next hops.
fn parse_mp_headers(data: &[u8]) -> Vec<MpHeader> {
    let mut headers = Vec::new();
    let mut buf = Bytes::copy_from_slice(data);
    while buf.len() >= 3 {
        let flags = match buf.read_u8() {
            Ok(f) => AttrFlags::from_bits_retain(f),
            Err(_) => break,
        };
        let code = match buf.read_u8() {
            Ok(c) => c,
            Err(_) => break,
        };
        let len = if flags.contains(AttrFlags::EXTENDED) {
            match buf.read_u16() {
                Ok(l) => l as usize,
                Err(_) => break,
            }
        } else {
            match buf.read_u8() {
                Ok(l) => l as usize,
                Err(_) => break,
            }
        };
        let mut value = match buf.read_n_bytes(len) {
            Ok(v) => v,
            Err(_) => break,
        };
        if AttrType::from(code) != AttrType::MP_REACHABLE_NLRI {
            continue;
        }
        let afi = match value.read_afi() {
            Ok(afi) => afi,
            Err(_) => continue,
        };
        let safi = match value.read_u8() {
            Ok(s) => Safi::from(s),
            Err(_) => continue,
        };
        let next_hop = match value.read_u8() {
            Ok(nh_len) => match value.read_n_bytes(nh_len as usize) {
                Ok(nh) => nh,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        headers.push(MpHeader {
            afi,
            safi,
            next_hop,
        });
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{apply_update, normalize_attrs};
    use crate::models::{AsnLength, BgpMessage};
    use crate::parser::bgp::parse_bgp_message;
    use crate::queue::{Queue, ReaderMode};

    fn install(table: &mut RibTable, prefixes: &[(u8, Vec<u8>)], as_path: &[u8]) {
        let mut attrs = BytesMut::new();
        PathAttribute::new(AttrFlags::TRANSITIVE, 1, Bytes::from_static(&[0]))
            .encode(&mut attrs);
        PathAttribute::new(AttrFlags::TRANSITIVE, 2, Bytes::copy_from_slice(as_path))
            .encode(&mut attrs);
        PathAttribute::new(AttrFlags::TRANSITIVE, 3, Bytes::from_static(&[10, 0, 0, 1]))
            .encode(&mut attrs);
        // announce in batches so each message stays under the size cap
        for chunk in prefixes.chunks(100) {
            let mut nlri = BytesMut::new();
            for (bits, addr) in chunk {
                RawPrefix::new(Afi::Ipv4, Safi::Unicast, *bits, addr).encode(&mut nlri);
            }
            let raw = build_raw_update(&attrs, &nlri);
            let update = match parse_bgp_message(raw, AsnLength::Bits16).unwrap() {
                BgpMessage::Update(u) => u,
                other => panic!("expected update, got {other:?}"),
            };
            apply_update(table, &update, 100);
        }
    }

    #[test]
    fn test_transfer_reemits_every_prefix() {
        let mut table = RibTable::new(64, 64, 16);
        install(
            &mut table,
            &[(8, vec![10]), (16, vec![172, 16]), (24, vec![192, 0, 2])],
            &[2, 1, 0, 1],
        );

        let queue = Queue::new("labeled", 64);
        let reader = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let writer = queue.writer();

        let ids = table.attr_ids();
        assert_eq!(ids.len(), 1);
        let emitted = send_attr_node(&table, ids[0], 9, &writer);
        assert_eq!(emitted, 1);

        let record = match reader.read() {
            crate::queue::ReadOutcome::Item(r) => r,
            other => panic!("expected record, got {other:?}"),
        };
        assert_eq!(record.bmf_type, BmfType::TableTransfer);
        assert_eq!(record.session_id, 9);

        let update = match parse_bgp_message(
            Bytes::copy_from_slice(record.payload()),
            AsnLength::Bits16,
        )
        .unwrap()
        {
            BgpMessage::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        let mut announced: Vec<String> =
            update.announced.iter().map(|p| p.to_string()).collect();
        announced.sort();
        assert_eq!(
            announced,
            vec!["10.0.0.0/8", "172.16.0.0/16", "192.0.2.0/24"]
        );
        // the prelude carried the original AS path
        let normalized = normalize_attrs(&update);
        assert_eq!(normalized.as_path, Bytes::from_static(&[2, 1, 0, 1]));
    }

    #[test]
    fn test_transfer_splits_when_message_would_overflow() {
        let mut table = RibTable::new(4096, 64, u16::MAX);
        // enough /24s to overflow a single 4096-byte message
        let mut prefixes = Vec::new();
        for a in 0..8u8 {
            for b in 0..150u8 {
                prefixes.push((24u8, vec![10, a, b]));
            }
        }
        install(&mut table, &prefixes, &[2, 1, 0, 1]);

        let queue = Queue::new("labeled", 64);
        let reader = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let writer = queue.writer();
        let ids = table.attr_ids();
        let emitted = send_attr_node(&table, ids[0], 3, &writer);
        assert!(emitted > 1, "expected a flush, got {emitted} message(s)");

        // every prefix came back exactly once
        let mut seen = std::collections::HashSet::new();
        for _ in 0..emitted {
            let record = match reader.read() {
                crate::queue::ReadOutcome::Item(r) => r,
                other => panic!("expected record, got {other:?}"),
            };
            assert!(record.payload().len() <= BGP_MAX_MESSAGE_LEN);
            let update = match parse_bgp_message(
                Bytes::copy_from_slice(record.payload()),
                AsnLength::Bits16,
            )
            .unwrap()
            {
                BgpMessage::Update(u) => u,
                other => panic!("expected update, got {other:?}"),
            };
            for prefix in &update.announced {
                assert!(seen.insert(prefix.to_string()));
            }
        }
        assert_eq!(seen.len(), prefixes.len());
    }
}
