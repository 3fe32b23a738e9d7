/*!
Chain-owner cache: loop detection for feed-of-feeds deployments.

Every upstream monitor stamps its records with its 32-bit identifier and
a sequence number. Seeing our own identifier, or a stale sequence for a
known owner, means the record has looped back and must be dropped.
Entries age out after a configured lifetime.
*/
use log::debug;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ChainOwner {
    monitor_id: u32,
    sequence: u32,
    owner: u16,
    last_seen: Instant,
}

/// Verdict for one observed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerdict {
    Fresh,
    /// Already seen at this or a later sequence: a loop.
    Looped,
}

pub struct ChainCache {
    /// Our own persisted monitor identifier; records carrying it are
    /// always loops.
    local_id: u32,
    lifetime: Duration,
    entries: Mutex<Vec<ChainOwner>>,
}

impl ChainCache {
    pub fn new(local_id: u32, lifetime: Duration) -> ChainCache {
        ChainCache {
            local_id,
            lifetime,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Record an observation and classify it. `owner` is the feed thread
    /// that saw the record, kept for the status report.
    pub fn observe(&self, monitor_id: u32, sequence: u32, owner: u16) -> ChainVerdict {
        if monitor_id == self.local_id {
            debug!("chain record carries our own monitor id {monitor_id:#010x}");
            return ChainVerdict::Looped;
        }
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.monitor_id == monitor_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.owner = owner;
                if sequence <= entry.sequence {
                    return ChainVerdict::Looped;
                }
                entry.sequence = sequence;
                ChainVerdict::Fresh
            }
            None => {
                entries.push(ChainOwner {
                    monitor_id,
                    sequence,
                    owner,
                    last_seen: Instant::now(),
                });
                ChainVerdict::Fresh
            }
        }
    }

    /// Drop entries older than the configured lifetime; returns how many
    /// were removed.
    pub fn age(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let lifetime = self.lifetime;
        entries.retain(|e| e.last_seen.elapsed() < lifetime);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("chain cache aged out {removed} owner(s)");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// (monitor id, sequence, owner) triples for CHAINS_STATUS.
    pub fn snapshot(&self) -> Vec<(u32, u32, u16)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.monitor_id, e.sequence, e.owner))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_id_always_loops() {
        let cache = ChainCache::new(7, Duration::from_secs(60));
        assert_eq!(cache.observe(7, 1, 0), ChainVerdict::Looped);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sequence_must_advance() {
        let cache = ChainCache::new(7, Duration::from_secs(60));
        assert_eq!(cache.observe(9, 5, 0), ChainVerdict::Fresh);
        assert_eq!(cache.observe(9, 5, 0), ChainVerdict::Looped);
        assert_eq!(cache.observe(9, 4, 0), ChainVerdict::Looped);
        assert_eq!(cache.observe(9, 6, 0), ChainVerdict::Fresh);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_aging_removes_idle_owners() {
        let cache = ChainCache::new(7, Duration::from_millis(10));
        cache.observe(9, 1, 0);
        cache.observe(11, 1, 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.age(), 2);
        assert!(cache.is_empty());
    }
}
