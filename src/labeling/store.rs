/*!
Per-session routing state: the prefix table and the attribute table.

Both tables are arena-allocated index stores. A prefix record points at
exactly one attribute record; an attribute record keeps the reverse edge
as a vector of prefix ids, whose length is the reference count. AS_PATH
bytes are interned in a third arena and shared by attribute records that
differ only in their non-path attributes.
*/
use crate::models::RawPrefix;
use bytes::Bytes;
use log::error;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem::size_of;

pub type PrefixId = usize;
pub type AttrId = usize;
pub type PathId = usize;

/// Slab with stable indices and free-list reuse.
struct Arena<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    fn new() -> Arena<T> {
        Arena {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, item: T) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.items[idx] = Some(item);
                idx
            }
            None => {
                self.items.push(Some(item));
                self.items.len() - 1
            }
        }
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let item = self.items.get_mut(idx)?.take();
        if item.is_some() {
            self.free.push(idx);
        }
        item
    }

    fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)?.as_ref()
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.items.get_mut(idx)?.as_mut()
    }

    fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| item.as_ref().map(|i| (idx, i)))
    }
}

pub struct PrefixRecord {
    pub key: RawPrefix,
    pub attr: AttrId,
    /// Timestamp of the announcement that installed or refreshed this
    /// prefix.
    pub last_updated: u32,
}

pub struct AttrRecord {
    pub path: PathId,
    /// Basic attributes followed by the NLRI-less MP_REACH header.
    pub attr_bytes: Bytes,
    /// Length of the basic-attribute part of `attr_bytes`.
    pub basic_len: usize,
    bucket: usize,
    pub back_refs: Vec<PrefixId>,
}

pub struct PathRecord {
    pub bytes: Bytes,
    /// Per-bucket identifier, stable for the life of the record.
    pub path_num: u16,
    refcount: u32,
}

/// One session's RIB: interlocked prefix and attribute tables.
pub struct RibTable {
    prefixes: Arena<PrefixRecord>,
    prefix_buckets: Vec<Vec<PrefixId>>,
    attrs: Arena<AttrRecord>,
    attr_buckets: Vec<Vec<AttrId>>,
    paths: Arena<PathRecord>,
    max_collision: u16,
    prefix_max_chain: u16,
    attr_max_chain: u16,
    memory_used: u64,
}

fn hash_to_bucket<H: Hash>(value: &H, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % buckets as u64) as usize
}

impl RibTable {
    pub fn new(prefix_buckets: usize, attr_buckets: usize, max_collision: u16) -> RibTable {
        RibTable {
            prefixes: Arena::new(),
            prefix_buckets: vec![Vec::new(); prefix_buckets.max(1)],
            attrs: Arena::new(),
            attr_buckets: vec![Vec::new(); attr_buckets.max(1)],
            paths: Arena::new(),
            max_collision,
            prefix_max_chain: 0,
            attr_max_chain: 0,
            memory_used: 0,
        }
    }

    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }

    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used
    }

    pub fn attr(&self, id: AttrId) -> Option<&AttrRecord> {
        self.attrs.get(id)
    }

    pub fn path(&self, id: PathId) -> Option<&PathRecord> {
        self.paths.get(id)
    }

    pub fn prefix(&self, id: PrefixId) -> Option<&PrefixRecord> {
        self.prefixes.get(id)
    }

    /// Ids of every live attribute record; table transfer walks these.
    pub fn attr_ids(&self) -> Vec<AttrId> {
        self.attrs.iter().map(|(id, _)| id).collect()
    }

    fn find_prefix(&self, key: &RawPrefix) -> Option<PrefixId> {
        let bucket = hash_to_bucket(key, self.prefix_buckets.len());
        self.prefix_buckets[bucket]
            .iter()
            .copied()
            .find(|&id| self.prefixes.get(id).map(|p| &p.key) == Some(key))
    }

    /// Resolve or insert the attribute record for an update's AS_PATH and
    /// normalised attribute bytes.
    ///
    /// Reuse rules: an existing record with identical path and identical
    /// attribute bytes is returned as-is; identical path but different
    /// attribute bytes shares the interned AS_PATH; otherwise a fresh
    /// AS_PATH is interned with a per-bucket id one greater than the
    /// largest seen in that bucket.
    pub fn search_attr(&mut self, as_path: &[u8], attr_bytes: Bytes, basic_len: usize) -> AttrId {
        let bucket = hash_to_bucket(&as_path, self.attr_buckets.len());

        let mut share_path: Option<PathId> = None;
        let mut max_path_num: u16 = 0;
        for &attr_id in &self.attr_buckets[bucket] {
            let attr = self.attrs.get(attr_id).expect("bucket holds live attrs");
            let path = self.paths.get(attr.path).expect("attr holds live path");
            if path.bytes.as_ref() == as_path {
                if attr.attr_bytes == attr_bytes && attr.basic_len == basic_len {
                    return attr_id;
                }
                share_path = Some(attr.path);
            }
            max_path_num = max_path_num.max(path.path_num);
        }

        let path_id = match share_path {
            Some(path_id) => {
                self.paths
                    .get_mut(path_id)
                    .expect("shared path is live")
                    .refcount += 1;
                path_id
            }
            None => {
                self.memory_used += (size_of::<PathRecord>() + as_path.len()) as u64;
                self.paths.insert(PathRecord {
                    bytes: Bytes::copy_from_slice(as_path),
                    path_num: max_path_num + 1,
                    refcount: 1,
                })
            }
        };

        self.memory_used += (size_of::<AttrRecord>() + attr_bytes.len()) as u64;
        let attr_id = self.attrs.insert(AttrRecord {
            path: path_id,
            attr_bytes,
            basic_len,
            bucket,
            back_refs: Vec::new(),
        });
        self.attr_buckets[bucket].push(attr_id);
        self.attr_max_chain = self
            .attr_max_chain
            .max(self.attr_buckets[bucket].len() as u16);
        if self.attr_max_chain > self.max_collision {
            error!("maximum collision reached in the attribute table");
        }
        attr_id
    }

    /// Install or refresh a reachable prefix, classifying the announcement.
    pub fn apply_reachable(
        &mut self,
        key: &RawPrefix,
        attr_id: AttrId,
        timestamp: u32,
    ) -> super::Label {
        let bucket = hash_to_bucket(key, self.prefix_buckets.len());
        let existing = self.prefix_buckets[bucket]
            .iter()
            .copied()
            .find(|&id| self.prefixes.get(id).map(|p| &p.key) == Some(key));

        match existing {
            None => {
                self.memory_used +=
                    (size_of::<PrefixRecord>() + key.addr.len() + size_of::<PrefixId>()) as u64;
                let prefix_id = self.prefixes.insert(PrefixRecord {
                    key: key.clone(),
                    attr: attr_id,
                    last_updated: timestamp,
                });
                self.prefix_buckets[bucket].push(prefix_id);
                self.prefix_max_chain = self
                    .prefix_max_chain
                    .max(self.prefix_buckets[bucket].len() as u16);
                if self.prefix_max_chain > self.max_collision {
                    error!("maximum collision reached in the prefix table");
                }
                self.attach(prefix_id, attr_id);
                super::Label::AnnNew
            }
            Some(prefix_id) => {
                let (old_attr, _) = {
                    let record = self.prefixes.get(prefix_id).expect("bucket holds live ids");
                    (record.attr, record.last_updated)
                };
                if old_attr == attr_id {
                    self.prefixes
                        .get_mut(prefix_id)
                        .expect("record is live")
                        .last_updated = timestamp;
                    return super::Label::AnnDuplicate;
                }

                let old_path = self.attrs.get(old_attr).map(|a| a.path);
                let new_path = self.attrs.get(attr_id).map(|a| a.path);
                let label = if old_path != new_path {
                    super::Label::AnnDpath
                } else {
                    super::Label::AnnSpath
                };

                self.detach(prefix_id, old_attr);
                {
                    let record = self.prefixes.get_mut(prefix_id).expect("record is live");
                    record.attr = attr_id;
                    record.last_updated = timestamp;
                }
                self.attach(prefix_id, attr_id);
                label
            }
        }
    }

    /// Withdraw a prefix, classifying the withdrawal.
    pub fn apply_unreachable(&mut self, key: &RawPrefix) -> super::Label {
        let bucket = hash_to_bucket(key, self.prefix_buckets.len());
        let position = self.prefix_buckets[bucket]
            .iter()
            .position(|&id| self.prefixes.get(id).map(|p| &p.key) == Some(key));

        let position = match position {
            None => return super::Label::WdrDuplicate,
            Some(p) => p,
        };
        let prefix_id = self.prefix_buckets[bucket].remove(position);
        let record = self
            .prefixes
            .remove(prefix_id)
            .expect("bucket held a live id");
        self.memory_used = self.memory_used.saturating_sub(
            (size_of::<PrefixRecord>() + record.key.addr.len() + size_of::<PrefixId>()) as u64,
        );
        self.detach(prefix_id, record.attr);
        super::Label::WdrNew
    }

    /// Drop a zero-reference attribute record if the caller's update left
    /// one behind (an announcement whose prefixes all failed to install).
    pub fn drop_if_unreferenced(&mut self, attr_id: AttrId) {
        let unreferenced = self
            .attrs
            .get(attr_id)
            .map(|a| a.back_refs.is_empty())
            .unwrap_or(false);
        if unreferenced {
            self.remove_attr(attr_id);
        }
    }

    fn attach(&mut self, prefix_id: PrefixId, attr_id: AttrId) {
        match self.attrs.get_mut(attr_id) {
            Some(attr) => attr.back_refs.push(prefix_id),
            None => error!("attach to a non-existent attribute record"),
        }
    }

    /// Remove the back reference and release the attribute record once
    /// nothing points at it. Removal happens in the same pass that drops
    /// the last reference.
    fn detach(&mut self, prefix_id: PrefixId, attr_id: AttrId) {
        let empty = match self.attrs.get_mut(attr_id) {
            Some(attr) => {
                match attr.back_refs.iter().position(|&id| id == prefix_id) {
                    Some(pos) => {
                        attr.back_refs.swap_remove(pos);
                    }
                    None => {
                        error!("prefix back reference missing from attribute record");
                        return;
                    }
                }
                attr.back_refs.is_empty()
            }
            None => {
                error!("detach from a non-existent attribute record");
                return;
            }
        };
        if empty {
            self.remove_attr(attr_id);
        }
    }

    fn remove_attr(&mut self, attr_id: AttrId) {
        let attr = match self.attrs.get(attr_id) {
            Some(attr) => attr,
            None => {
                error!("removing a non-existent attribute record");
                return;
            }
        };
        if !attr.back_refs.is_empty() {
            error!("removing an attribute record with a non-zero reference count");
            return;
        }
        let bucket = attr.bucket;
        let path_id = attr.path;

        if let Some(pos) = self.attr_buckets[bucket].iter().position(|&id| id == attr_id) {
            self.attr_buckets[bucket].swap_remove(pos);
        }
        let attr = self.attrs.remove(attr_id).expect("checked above");
        self.memory_used = self
            .memory_used
            .saturating_sub((size_of::<AttrRecord>() + attr.attr_bytes.len()) as u64);

        let release_path = match self.paths.get_mut(path_id) {
            Some(path) => {
                path.refcount -= 1;
                path.refcount == 0
            }
            None => {
                error!("attribute record referenced a non-existent AS path");
                false
            }
        };
        if release_path {
            if let Some(path) = self.paths.remove(path_id) {
                self.memory_used = self
                    .memory_used
                    .saturating_sub((size_of::<PathRecord>() + path.bytes.len()) as u64);
            }
        }
    }

    /// Cross-check the interlocked structures; used by tests and the
    /// debug dump.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut back_ref_total = 0usize;
        for (attr_id, attr) in self.attrs.iter() {
            if attr.back_refs.is_empty() {
                return Err(format!("attribute {attr_id} has no references"));
            }
            if !self.attr_buckets[attr.bucket].contains(&attr_id) {
                return Err(format!("attribute {attr_id} missing from its bucket"));
            }
            back_ref_total += attr.back_refs.len();
            for &prefix_id in &attr.back_refs {
                match self.prefixes.get(prefix_id) {
                    Some(prefix) if prefix.attr == attr_id => {}
                    _ => {
                        return Err(format!(
                            "attribute {attr_id} back reference {prefix_id} is stale"
                        ))
                    }
                }
            }
        }
        if back_ref_total != self.prefixes.len() {
            return Err(format!(
                "{} back references for {} prefixes",
                back_ref_total,
                self.prefixes.len()
            ));
        }
        for (prefix_id, prefix) in self.prefixes.iter() {
            let attr = self
                .prefixes
                .get(prefix_id)
                .map(|p| p.attr)
                .expect("iterating live records");
            match self.attrs.get(attr) {
                Some(record) if record.back_refs.contains(&prefix_id) => {}
                _ => return Err(format!("prefix {} has a stale attribute edge", prefix.key)),
            }
        }
        let mut path_refs = std::collections::HashMap::new();
        for (_, attr) in self.attrs.iter() {
            *path_refs.entry(attr.path).or_insert(0u32) += 1;
        }
        for (path_id, path) in self.paths.iter() {
            if path_refs.get(&path_id).copied().unwrap_or(0) != path.refcount {
                return Err(format!("path {path_id} refcount drifted"));
            }
        }
        if path_refs.len() != self.paths.len() {
            return Err("orphaned AS path records".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::Label;
    use crate::models::{Afi, Safi};

    fn prefix(bits: u8, addr: &[u8]) -> RawPrefix {
        RawPrefix::new(Afi::Ipv4, Safi::Unicast, bits, addr)
    }

    fn table() -> RibTable {
        RibTable::new(64, 64, 16)
    }

    #[test]
    fn test_announce_then_withdraw_empties_everything() {
        let mut table = table();
        let attr = table.search_attr(&[2, 1, 0, 1], Bytes::from_static(&[0x40, 0x01, 0x01, 0x00]), 4);
        let key = prefix(8, &[10]);
        assert_eq!(table.apply_reachable(&key, attr, 100), Label::AnnNew);
        table.check_consistency().unwrap();
        assert_eq!(table.apply_unreachable(&key), Label::WdrNew);
        assert_eq!(table.prefix_count(), 0);
        assert_eq!(table.attr_count(), 0);
        assert_eq!(table.path_count(), 0);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_duplicate_announcement() {
        let mut table = table();
        let key = prefix(8, &[10]);
        let attr = table.search_attr(&[2, 1, 0, 1], Bytes::new(), 0);
        assert_eq!(table.apply_reachable(&key, attr, 100), Label::AnnNew);
        let attr_again = table.search_attr(&[2, 1, 0, 1], Bytes::new(), 0);
        assert_eq!(attr, attr_again);
        assert_eq!(table.apply_reachable(&key, attr_again, 200), Label::AnnDuplicate);
        assert_eq!(table.prefix_count(), 1);
        assert_eq!(table.attr_count(), 1);
        // the duplicate refreshed the stored timestamp
        let prefix_id = table.find_prefix(&key).unwrap();
        assert_eq!(table.prefix(prefix_id).unwrap().last_updated, 200);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_different_path_reannouncement() {
        let mut table = table();
        let key = prefix(8, &[10]);
        let attr_one = table.search_attr(&[2, 1, 0, 1], Bytes::new(), 0);
        assert_eq!(table.apply_reachable(&key, attr_one, 100), Label::AnnNew);

        let attr_two = table.search_attr(&[2, 2, 0, 1, 0, 2], Bytes::new(), 0);
        assert_eq!(table.apply_reachable(&key, attr_two, 200), Label::AnnDpath);
        // the old node lost its last reference and is gone; one path remains
        assert_eq!(table.attr_count(), 1);
        assert_eq!(table.path_count(), 1);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_same_path_different_attrs_shares_the_path() {
        let mut table = table();
        let key_a = prefix(8, &[10]);
        let key_b = prefix(8, &[11]);
        let as_path = [2u8, 1, 0, 1];
        let attr_one = table.search_attr(&as_path, Bytes::from_static(&[1]), 1);
        table.apply_reachable(&key_a, attr_one, 100);
        let attr_two = table.search_attr(&as_path, Bytes::from_static(&[2]), 1);
        assert_ne!(attr_one, attr_two);
        assert_eq!(table.apply_reachable(&key_b, attr_two, 100), Label::AnnNew);
        // two attribute records share one interned path
        assert_eq!(table.attr_count(), 2);
        assert_eq!(table.path_count(), 1);
        table.check_consistency().unwrap();

        // moving key_a over to attr_two keeps the path alive
        assert_eq!(table.apply_reachable(&key_a, attr_two, 150), Label::AnnSpath);
        assert_eq!(table.attr_count(), 1);
        assert_eq!(table.path_count(), 1);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_withdraw_of_absent_prefix_is_duplicate() {
        let mut table = table();
        assert_eq!(table.apply_unreachable(&prefix(8, &[10])), Label::WdrDuplicate);
    }

    #[test]
    fn test_drop_if_unreferenced() {
        let mut table = table();
        let attr = table.search_attr(&[2, 1, 0, 1], Bytes::new(), 0);
        table.drop_if_unreferenced(attr);
        assert_eq!(table.attr_count(), 0);
        assert_eq!(table.path_count(), 0);
    }

    #[test]
    fn test_memory_accounting_returns_to_zero() {
        let mut table = table();
        let key = prefix(24, &[192, 0, 2]);
        let attr = table.search_attr(&[2, 1, 0, 1], Bytes::from_static(&[9, 9]), 2);
        table.apply_reachable(&key, attr, 1);
        assert!(table.memory_used() > 0);
        table.apply_unreachable(&key);
        assert_eq!(table.memory_used(), 0);
    }
}
