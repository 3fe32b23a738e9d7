/*!
Bounded multi-reader queue fabric.

Each queue is a fixed ring of slots shared by one producer and any number
of independently-paced consumers. A slot carries a bitmap of the readers
that still have to release it; the item is retired when the last bit
clears. The producer blocks while the slowest reader still owns the slot
it is about to overwrite, which is the back-pressure path from a stalled
subscriber all the way up to the peer socket.
*/
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Ring capacity used for every pipeline queue.
pub const QUEUE_CAPACITY: usize = 16384;
/// Slot bitmaps are a machine word; reader ids stay below this.
pub const MAX_QUEUE_READERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Item(Arc<T>),
    /// Nothing new for this reader (non-blocking mode, or shutdown while
    /// a blocking read was parked).
    Empty,
    /// The reader was cancelled; no further items will be delivered.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Written, and some reader now lags a full ring behind: the caller
    /// should apply upstream back-pressure.
    NowFull,
    /// Dropped: no registered readers, or the queue is shutting down.
    Dropped,
}

struct Slot<T> {
    item: Option<Arc<T>>,
    /// Bit per reader id that has not yet released this slot.
    pending: u64,
}

struct ReaderState {
    cursor: u64,
    read_count: u64,
    cancelled: bool,
    mode: ReaderMode,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    /// Sequence number of the next write.
    head: u64,
    readers: Vec<Option<ReaderState>>,
    items_written: u64,
    shutdown: bool,
}

pub struct Queue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    readable: Condvar,
    writable: Condvar,
}

/// Point-in-time accounting for QUEUES_STATUS reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub name: String,
    pub capacity: usize,
    pub items_written: u64,
    pub readers: Vec<ReaderStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStatus {
    pub id: usize,
    pub unread: u64,
    pub read_count: u64,
}

impl<T> Queue<T> {
    pub fn new(name: &str, capacity: usize) -> Arc<Queue<T>> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            item: None,
            pending: 0,
        });
        Arc::new(Queue {
            name: name.to_string(),
            capacity,
            inner: Mutex::new(Inner {
                slots,
                head: 0,
                readers: Vec::new(),
                items_written: 0,
                shutdown: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writer(self: &Arc<Self>) -> QueueWriter<T> {
        QueueWriter {
            queue: Arc::clone(self),
        }
    }

    /// Register a consumer. The reader starts at the current write position
    /// and sees only items enqueued after registration. Ids are dense and
    /// reused after a reader is dropped.
    pub fn add_reader(self: &Arc<Self>, mode: ReaderMode) -> Option<QueueReader<T>> {
        let mut inner = self.inner.lock();
        let id = match inner.readers.iter().position(|r| r.is_none()) {
            Some(free) => free,
            None => {
                if inner.readers.len() >= MAX_QUEUE_READERS {
                    warn!("queue {}: reader limit reached", self.name);
                    return None;
                }
                inner.readers.push(None);
                inner.readers.len() - 1
            }
        };
        let cursor = inner.head;
        inner.readers[id] = Some(ReaderState {
            cursor,
            read_count: 0,
            cancelled: false,
            mode,
        });
        debug!("queue {}: registered reader {}", self.name, id);
        Some(QueueReader {
            queue: Arc::clone(self),
            id,
        })
    }

    fn write(&self, item: Arc<T>) -> WriteOutcome {
        let mut inner = self.inner.lock();

        let mask = reader_mask(&inner.readers);
        if mask == 0 || inner.shutdown {
            // nobody will ever release the slot; retire the item here
            return WriteOutcome::Dropped;
        }

        let idx = (inner.head % self.capacity as u64) as usize;
        while inner.slots[idx].pending != 0 && !inner.shutdown {
            self.writable.wait(&mut inner);
        }
        if inner.shutdown {
            return WriteOutcome::Dropped;
        }

        // recompute: a reader may have been cancelled while we waited
        let mask = reader_mask(&inner.readers);
        if mask == 0 {
            return WriteOutcome::Dropped;
        }

        inner.slots[idx].item = Some(item);
        inner.slots[idx].pending = mask;
        inner.head += 1;
        inner.items_written += 1;

        let head = inner.head;
        let max_lag = inner
            .readers
            .iter()
            .flatten()
            .filter(|r| !r.cancelled)
            .map(|r| head - r.cursor)
            .max()
            .unwrap_or(0);

        self.readable.notify_all();
        if max_lag >= self.capacity as u64 {
            WriteOutcome::NowFull
        } else {
            WriteOutcome::Written
        }
    }

    fn read(&self, id: usize) -> ReadOutcome<T> {
        let mut inner = self.inner.lock();
        loop {
            let (cursor, mode, cancelled) = match &inner.readers[id] {
                Some(r) => (r.cursor, r.mode, r.cancelled),
                None => return ReadOutcome::Cancelled,
            };
            if cancelled {
                return ReadOutcome::Cancelled;
            }
            if cursor < inner.head {
                let idx = (cursor % self.capacity as u64) as usize;
                let item = inner.slots[idx]
                    .item
                    .clone()
                    .expect("pending slot holds an item");
                inner.slots[idx].pending &= !(1u64 << id);
                if inner.slots[idx].pending == 0 {
                    inner.slots[idx].item = None;
                    self.writable.notify_all();
                }
                let reader = inner.readers[id].as_mut().expect("reader exists");
                reader.cursor += 1;
                reader.read_count += 1;
                return ReadOutcome::Item(item);
            }
            if inner.shutdown {
                return ReadOutcome::Empty;
            }
            if mode == ReaderMode::NonBlocking {
                return ReadOutcome::Empty;
            }
            self.readable.wait(&mut inner);
        }
    }

    fn cancel_reader(&self, id: usize) {
        let mut inner = self.inner.lock();
        if let Some(Some(reader)) = inner.readers.get_mut(id) {
            reader.cancelled = true;
        } else {
            return;
        }
        release_reader_slots(&mut inner, id);
        debug!("queue {}: cancelled reader {}", self.name, id);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn unregister_reader(&self, id: usize) {
        let mut inner = self.inner.lock();
        if inner.readers.get_mut(id).map(|r| r.take()).is_none() {
            return;
        }
        release_reader_slots(&mut inner, id);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Unread count for one reader: write cursor minus reader cursor.
    pub fn unread(&self, id: usize) -> u64 {
        let inner = self.inner.lock();
        match &inner.readers[id] {
            Some(r) => inner.head - r.cursor,
            None => 0,
        }
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        QueueStatus {
            name: self.name.clone(),
            capacity: self.capacity,
            items_written: inner.items_written,
            readers: inner
                .readers
                .iter()
                .enumerate()
                .filter_map(|(id, r)| {
                    r.as_ref().map(|r| ReaderStatus {
                        id,
                        unread: inner.head - r.cursor,
                        read_count: r.read_count,
                    })
                })
                .collect(),
        }
    }

    /// Stop the queue: parked writers drop their item, parked blocking
    /// readers return `Empty` once drained.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

fn reader_mask(readers: &[Option<ReaderState>]) -> u64 {
    let mut mask = 0u64;
    for (id, reader) in readers.iter().enumerate() {
        if let Some(r) = reader {
            if !r.cancelled {
                mask |= 1u64 << id;
            }
        }
    }
    mask
}

fn release_reader_slots<T>(inner: &mut Inner<T>, id: usize) {
    let bit = 1u64 << id;
    for slot in inner.slots.iter_mut() {
        if slot.pending & bit != 0 {
            slot.pending &= !bit;
            if slot.pending == 0 {
                slot.item = None;
            }
        }
    }
}

/// Producer handle. One producer per queue is assumed; nothing enforces
/// it, but write-side fairness is untested beyond that.
pub struct QueueWriter<T> {
    queue: Arc<Queue<T>>,
}

impl<T> QueueWriter<T> {
    pub fn write(&self, item: Arc<T>) -> WriteOutcome {
        self.queue.write(item)
    }

    pub fn queue(&self) -> &Arc<Queue<T>> {
        &self.queue
    }
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        QueueWriter {
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Consumer handle; dropping it cancels and unregisters the reader so a
/// dead subscriber can never stall the ring.
pub struct QueueReader<T> {
    queue: Arc<Queue<T>>,
    id: usize,
}

impl<T> QueueReader<T> {
    pub fn read(&self) -> ReadOutcome<T> {
        self.queue.read(self.id)
    }

    pub fn unread(&self) -> u64 {
        self.queue.unread(self.id)
    }

    pub fn cancel(&self) {
        self.queue.cancel_reader(self.id);
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> Drop for QueueReader<T> {
    fn drop(&mut self) {
        self.queue.cancel_reader(self.id);
        self.queue.unregister_reader(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_single_reader() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 8);
        let writer = queue.writer();
        let reader = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        for i in 0..5u32 {
            assert_eq!(writer.write(Arc::new(i)), WriteOutcome::Written);
        }
        for i in 0..5u32 {
            match reader.read() {
                ReadOutcome::Item(v) => assert_eq!(*v, i),
                other => panic!("expected item, got {other:?}"),
            }
        }
        assert_eq!(reader.read(), ReadOutcome::Empty);
    }

    #[test]
    fn test_readers_have_independent_cursors() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 8);
        let writer = queue.writer();
        let fast = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let slow = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        for i in 0..4u32 {
            writer.write(Arc::new(i));
        }
        for i in 0..4u32 {
            match fast.read() {
                ReadOutcome::Item(v) => assert_eq!(*v, i),
                other => panic!("expected item, got {other:?}"),
            }
        }
        assert_eq!(fast.unread(), 0);
        assert_eq!(slow.unread(), 4);
        match slow.read() {
            ReadOutcome::Item(v) => assert_eq!(*v, 0),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[test]
    fn test_item_retired_after_last_reader() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 4);
        let writer = queue.writer();
        let a = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let b = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let item = Arc::new(42u32);
        writer.write(Arc::clone(&item));
        assert_eq!(Arc::strong_count(&item), 2); // ours + the slot
        let got_a = match a.read() {
            ReadOutcome::Item(v) => v,
            other => panic!("expected item, got {other:?}"),
        };
        assert_eq!(Arc::strong_count(&item), 3); // ours + slot + a's copy
        let got_b = match b.read() {
            ReadOutcome::Item(v) => v,
            other => panic!("expected item, got {other:?}"),
        };
        // both readers released the slot, so its reference is gone
        assert_eq!(Arc::strong_count(&item), 3); // ours + the two reader copies
        drop(got_a);
        drop(got_b);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn test_writer_blocks_on_stalled_reader_until_cancel() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 2);
        let writer = queue.writer();
        let live = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        let stalled = queue.add_reader(ReaderMode::NonBlocking).unwrap();

        writer.write(Arc::new(0));
        assert_eq!(writer.write(Arc::new(1)), WriteOutcome::NowFull);
        // live reader keeps up, stalled one never reads
        match live.read() {
            ReadOutcome::Item(v) => assert_eq!(*v, 0),
            other => panic!("expected item, got {other:?}"),
        }
        match live.read() {
            ReadOutcome::Item(v) => assert_eq!(*v, 1),
            other => panic!("expected item, got {other:?}"),
        }

        let blocked_writer = writer.clone();
        let handle = thread::spawn(move || blocked_writer.write(Arc::new(2)));
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished(), "writer should block on the stalled reader");

        stalled.cancel();
        let outcome = handle.join().unwrap();
        assert_ne!(outcome, WriteOutcome::Dropped);
        // the live reader continues in order with no gaps
        match live.read() {
            ReadOutcome::Item(v) => assert_eq!(*v, 2),
            other => panic!("expected item, got {other:?}"),
        }
        assert_eq!(stalled.read(), ReadOutcome::Cancelled);
    }

    #[test]
    fn test_blocking_reader_wakes_on_write() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 4);
        let writer = queue.writer();
        let reader = queue.add_reader(ReaderMode::Blocking).unwrap();
        let handle = thread::spawn(move || reader.read());
        thread::sleep(Duration::from_millis(20));
        writer.write(Arc::new(7));
        match handle.join().unwrap() {
            ReadOutcome::Item(v) => assert_eq!(*v, 7),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[test]
    fn test_unread_accounting() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 8);
        let writer = queue.writer();
        let reader = queue.add_reader(ReaderMode::NonBlocking).unwrap();
        for i in 0..6u32 {
            writer.write(Arc::new(i));
        }
        assert_eq!(reader.unread(), 6);
        reader.read();
        reader.read();
        assert_eq!(reader.unread(), 4);
        let status = queue.status();
        assert_eq!(status.items_written, 6);
        assert_eq!(status.readers[0].read_count, 2);
    }

    #[test]
    fn test_write_without_readers_is_dropped() {
        let queue: Arc<Queue<u32>> = Queue::new("test", 4);
        let writer = queue.writer();
        assert_eq!(writer.write(Arc::new(1)), WriteOutcome::Dropped);
    }
}
