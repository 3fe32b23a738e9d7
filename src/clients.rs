/*!
Subscriber fan-out: two TCP listeners (live updates and RIB transfers),
one writer thread and one queue reader per connected client.

The stream format itself is an external concern; this module frames each
record through the [`wire`] seam and owns only connection lifecycle and
back-pressure (a stalled client stalls its own reader, and the queue
fabric pushes back from there).
*/
use crate::models::{Bmf, BmfType};
use crate::queue::{Queue, QueueReader, ReadOutcome, ReaderMode};
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Token every subscriber stream opens with.
pub const STREAM_OPEN_TOKEN: &[u8] = b"<xml>";

/// The opaque record encoder the subscriber stream uses. The daemon
/// treats the output as a black box; only the framing below is fixed.
pub mod wire {
    use super::*;
    use bytes::{BufMut, BytesMut};

    /// Serialise one record for a subscriber: the 16-byte envelope header
    /// followed by the payload. Subscribers read the length from the
    /// header to find the next record.
    pub fn frame(bmf: &Bmf) -> BytesMut {
        let mut out = BytesMut::with_capacity(crate::models::BMF_HEADER_LEN + bmf.len());
        out.put_u32(bmf.timestamp);
        out.put_u32(bmf.precision_time.unwrap_or(0));
        out.put_u16(bmf.session_id);
        out.put_u16(bmf.bmf_type.into());
        out.put_u32(bmf.len() as u32);
        out.put_slice(bmf.payload());
        out
    }
}

/// Which queue a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Updates,
    Rib,
}

impl StreamKind {
    /// Records a subscriber of this kind receives.
    fn wants(&self, bmf_type: BmfType) -> bool {
        match self {
            StreamKind::Updates => !matches!(bmf_type, BmfType::TableTransfer),
            StreamKind::Rib => matches!(
                bmf_type,
                BmfType::TableTransfer
                    | BmfType::TableStart
                    | BmfType::TableStop
                    | BmfType::SessionStatus
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientsConfig {
    pub updates_listen: SocketAddr,
    pub rib_listen: SocketAddr,
    pub max_clients: usize,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        ClientsConfig {
            updates_listen: "0.0.0.0:50001".parse().expect("static address"),
            rib_listen: "0.0.0.0:50002".parse().expect("static address"),
            max_clients: 32,
        }
    }
}

pub struct ClientServer {
    pub shutdown: Arc<Shutdown>,
    pub labeled_queue: Arc<Queue<Bmf>>,
    pub config: ClientsConfig,
    /// Shared with the control surface, which may raise or lower it at
    /// runtime.
    max_clients: Arc<AtomicUsize>,
    active_clients: Arc<AtomicUsize>,
    client_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientServer {
    pub fn new(
        shutdown: Arc<Shutdown>,
        labeled_queue: Arc<Queue<Bmf>>,
        config: ClientsConfig,
    ) -> Arc<ClientServer> {
        let max_clients = Arc::new(AtomicUsize::new(config.max_clients));
        Arc::new(ClientServer {
            shutdown,
            labeled_queue,
            config,
            max_clients,
            active_clients: Arc::new(AtomicUsize::new(0)),
            client_threads: Mutex::new(Vec::new()),
        })
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn max_clients_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_clients)
    }

    /// Accept loop for one listener kind; runs until shutdown and joins
    /// its writer threads on the way out.
    pub fn run_listener(self: Arc<Self>, kind: StreamKind) {
        let addr = match kind {
            StreamKind::Updates => self.config.updates_listen,
            StreamKind::Rib => self.config.rib_listen,
        };
        let listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("client listener cannot bind {addr}: {e}");
                return;
            }
        };
        listener.set_nonblocking(true).expect("nonblocking listener");
        info!("{kind:?} subscriber listener on {addr}");

        while !self.shutdown.is_set() {
            match listener.accept() {
                Ok((stream, remote)) => {
                    if self.active_clients.load(Ordering::Relaxed)
                        >= self.max_clients.load(Ordering::Relaxed)
                    {
                        warn!("subscriber limit reached; refusing {remote}");
                        drop(stream);
                        continue;
                    }
                    let reader = match self.labeled_queue.add_reader(ReaderMode::Blocking) {
                        Some(reader) => reader,
                        None => {
                            warn!("no queue reader available; refusing {remote}");
                            continue;
                        }
                    };
                    info!("{kind:?} subscriber connected from {remote}");
                    self.active_clients.fetch_add(1, Ordering::Relaxed);
                    let shutdown = Arc::clone(&self.shutdown);
                    let counter = Arc::clone(&self.active_clients);
                    let handle = std::thread::Builder::new()
                        .name(format!("client-{remote}"))
                        .spawn(move || {
                            client_writer(stream, remote, kind, reader, shutdown);
                            counter.fetch_sub(1, Ordering::Relaxed);
                        })
                        .expect("spawn client writer thread");
                    self.client_threads.lock().push(handle);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
                Err(e) => {
                    warn!("subscriber accept failed: {e}");
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
            }
        }

        let threads = std::mem::take(&mut *self.client_threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        info!("{kind:?} subscriber listener exiting");
    }
}

/// One subscriber: emit the opening token, then every matching record in
/// arrival order. Any write failure tears the subscriber down, which
/// releases its queue reader and with it any back-pressure it held.
fn client_writer(
    mut stream: TcpStream,
    remote: SocketAddr,
    kind: StreamKind,
    reader: QueueReader<Bmf>,
    shutdown: Arc<Shutdown>,
) {
    if let Err(e) = stream.write_all(STREAM_OPEN_TOKEN) {
        warn!("subscriber {remote}: cannot open stream: {e}");
        return;
    }

    loop {
        if shutdown.is_set() {
            break;
        }
        match reader.read() {
            ReadOutcome::Item(bmf) => {
                if !kind.wants(bmf.bmf_type) {
                    continue;
                }
                let framed = wire::frame(&bmf);
                if let Err(e) = stream.write_all(&framed) {
                    warn!("subscriber {remote}: write failed, dropping: {e}");
                    break;
                }
            }
            ReadOutcome::Empty => continue, // woken by shutdown
            ReadOutcome::Cancelled => break,
        }
    }
    info!("subscriber {remote} disconnected");
    // the reader handle drops here, cancelling and unregistering it
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut bmf = Bmf::with_timestamp(7, BmfType::MsgLabeled, 1_600_000_000);
        bmf.append(&[0xAA, 0xBB]).unwrap();
        let framed = wire::frame(&bmf);
        assert_eq!(framed.len(), crate::models::BMF_HEADER_LEN + 2);
        assert_eq!(&framed[0..4], &1_600_000_000u32.to_be_bytes());
        assert_eq!(&framed[8..10], &7u16.to_be_bytes());
        assert_eq!(&framed[10..12], &u16::from(BmfType::MsgLabeled).to_be_bytes());
        assert_eq!(&framed[12..16], &2u32.to_be_bytes());
        assert_eq!(&framed[16..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_stream_kind_filters() {
        assert!(StreamKind::Updates.wants(BmfType::MsgLabeled));
        assert!(!StreamKind::Updates.wants(BmfType::TableTransfer));
        assert!(StreamKind::Rib.wants(BmfType::TableTransfer));
        assert!(!StreamKind::Rib.wants(BmfType::MsgLabeled));
    }
}
