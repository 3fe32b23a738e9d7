/*!
MRT ingest: a TCP listener accepting feed connections from routing
daemons or upstream collectors. Each feed gets a socket-reader thread
filling a [`backlog::Backlog`] and a parser thread draining it into the
peer queue.
*/
pub mod backlog;
pub mod process;

use crate::models::Bmf;
use crate::queue::QueueWriter;
use crate::session::registry::SessionRegistry;
use crate::session::LabelAction;
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use log::{debug, info, warn};
use parking_lot::Mutex;
use process::{FeedParser, FeedShared};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Counters reported in MRT_STATUS records.
#[derive(Debug, Default)]
pub struct MrtStats {
    pub feeds_active: AtomicUsize,
    pub feeds_total: AtomicUsize,
    pub bytes_received: AtomicU64,
    pub messages_parsed: AtomicU64,
    pub messages_corrupt: AtomicU64,
    pub messages_dropped: AtomicU64,
}

pub struct MrtControl {
    pub shutdown: Arc<Shutdown>,
    pub registry: Arc<SessionRegistry>,
    pub peer_queue: QueueWriter<Bmf>,
    pub listen_addr: SocketAddr,
    pub label_action: LabelAction,
    pub stats: Arc<MrtStats>,
    feed_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MrtControl {
    pub fn new(
        shutdown: Arc<Shutdown>,
        registry: Arc<SessionRegistry>,
        peer_queue: QueueWriter<Bmf>,
        listen_addr: SocketAddr,
        label_action: LabelAction,
    ) -> Arc<MrtControl> {
        Arc::new(MrtControl {
            shutdown,
            registry,
            peer_queue,
            listen_addr,
            label_action,
            stats: Arc::new(MrtStats::default()),
            feed_threads: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and run the accept loop until shutdown. Returns
    /// once every feed thread has been joined.
    pub fn run_listener(self: Arc<Self>) {
        let listener = match TcpListener::bind(self.listen_addr) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("MRT listener cannot bind {}: {e}", self.listen_addr);
                return;
            }
        };
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        info!("MRT listener on {}", self.listen_addr);

        while !self.shutdown.is_set() {
            match listener.accept() {
                Ok((stream, remote)) => {
                    info!("MRT feed connected from {remote}");
                    self.spawn_feed(stream, remote);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
                Err(e) => {
                    warn!("MRT accept failed: {e}");
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
            }
        }

        let threads = std::mem::take(&mut *self.feed_threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        info!("MRT listener exiting");
    }

    /// One feed: a reader thread pumping the socket into the backlog and
    /// a parser thread draining it. The feed's remote address is the
    /// collector identity for every session it synthesises.
    fn spawn_feed(&self, stream: TcpStream, remote: SocketAddr) {
        let shared = FeedShared::new();
        self.stats.feeds_active.fetch_add(1, Ordering::Relaxed);
        self.stats.feeds_total.fetch_add(1, Ordering::Relaxed);

        let parser = FeedParser {
            shared: Arc::clone(&shared),
            registry: Arc::clone(&self.registry),
            peer_queue: self.peer_queue.clone(),
            shutdown: Arc::clone(&self.shutdown),
            collector_addr: remote.ip(),
            label_action: self.label_action,
            stats: Arc::clone(&self.stats),
        };
        let parser_handle = std::thread::Builder::new()
            .name(format!("mrt-parse-{remote}"))
            .spawn(move || parser.run())
            .expect("spawn MRT parser thread");

        let reader_shared = shared;
        let reader_shutdown = Arc::clone(&self.shutdown);
        let reader_stats = Arc::clone(&self.stats);
        let reader_handle = std::thread::Builder::new()
            .name(format!("mrt-read-{remote}"))
            .spawn(move || {
                feed_socket_reader(stream, remote, reader_shared, reader_shutdown, &reader_stats);
            })
            .expect("spawn MRT reader thread");

        let mut threads = self.feed_threads.lock();
        threads.push(parser_handle);
        threads.push(reader_handle);
    }
}

fn feed_socket_reader(
    mut stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<FeedShared>,
    shutdown: Arc<Shutdown>,
    stats: &MrtStats,
) {
    stream.set_read_timeout(Some(THREAD_CHECK_INTERVAL)).ok();
    let mut buf = [0u8; 16384];
    loop {
        if shutdown.is_set() {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("MRT feed {remote} closed");
                break;
            }
            Ok(n) => {
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                let dropped = {
                    let mut backlog = shared.backlog.lock();
                    backlog.write(&buf[..n])
                };
                if dropped > 0 {
                    stats
                        .messages_dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                }
                shared.data_ready.notify_all();
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("MRT feed {remote} read error: {e}");
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.data_ready.notify_all();
    stats.feeds_active.fetch_sub(1, Ordering::Relaxed);
    debug!("MRT reader for {remote} exiting");
}
