/*!
Process context: owns the queues, the registry, the chain cache and every
module's threads. Modules are started leaves-first so no producer ever
writes into a queue without its consumer attached, and stopped in the
fixed order control → peers → MRT → labeling → periodic → clients, each
joined before the next is signalled.
*/
use crate::chains::ChainCache;
use crate::clients::{ClientServer, StreamKind};
use crate::config::Config;
use crate::control::ControlServer;
use crate::models::{Bmf, BmfType};
use crate::mrt::MrtControl;
use crate::queue::{Queue, QueueWriter, ReaderMode, QUEUE_CAPACITY};
use crate::session::peer::PeerThread;
use crate::session::registry::SessionRegistry;
use crate::shutdown::Shutdown;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One module's cancellation token and threads.
struct Module {
    name: &'static str,
    shutdown: Arc<Shutdown>,
    threads: Vec<JoinHandle<()>>,
}

impl Module {
    fn new(name: &'static str) -> Module {
        Module {
            name,
            shutdown: Shutdown::new(),
            threads: Vec::new(),
        }
    }

    fn signal(&self) {
        self.shutdown.signal();
    }

    fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("a {} thread panicked", self.name);
            }
        }
        info!("{} module stopped", self.name);
    }
}

pub struct Daemon {
    pub registry: Arc<SessionRegistry>,
    pub chains: Arc<ChainCache>,
    pub peer_queue: Arc<Queue<Bmf>>,
    pub labeled_queue: Arc<Queue<Bmf>>,
    peer_writer: QueueWriter<Bmf>,
    control: Module,
    peers: Module,
    mrt: Module,
    label: Module,
    periodic: Module,
    clients: Module,
}

impl Daemon {
    /// Bring the whole pipeline up.
    pub fn start(config: &Config, monitor_id: u32) -> Daemon {
        let registry = SessionRegistry::new();
        let chains = Arc::new(ChainCache::new(
            monitor_id,
            Duration::from_secs(config.chains.cache_entry_lifetime),
        ));
        let peer_queue: Arc<Queue<Bmf>> = Queue::new("peer", QUEUE_CAPACITY);
        let labeled_queue: Arc<Queue<Bmf>> = Queue::new("labeled", QUEUE_CAPACITY);
        let peer_writer = peer_queue.writer();

        // labeling first: it must be reading before any producer writes
        let mut label = Module::new("labeling");
        {
            let reader = peer_queue
                .add_reader(ReaderMode::Blocking)
                .expect("labeling reader");
            let shutdown = Arc::clone(&label.shutdown);
            let registry = Arc::clone(&registry);
            let labeled = labeled_queue.writer();
            label.threads.push(
                std::thread::Builder::new()
                    .name("labeling".to_string())
                    .spawn(move || crate::labeling::run(shutdown, registry, reader, labeled))
                    .expect("spawn labeling thread"),
            );
        }

        let mut start_record = Bmf::new(0, BmfType::BgpmonStart);
        start_record
            .append(&monitor_id.to_be_bytes())
            .expect("monitor id fits");
        peer_writer.write(Arc::new(start_record));

        // subscriber listeners
        let mut clients = Module::new("clients");
        let max_clients_handle;
        {
            let server = ClientServer::new(
                Arc::clone(&clients.shutdown),
                Arc::clone(&labeled_queue),
                config.clients.clone(),
            );
            max_clients_handle = server.max_clients_handle();
            for kind in [StreamKind::Updates, StreamKind::Rib] {
                let server = Arc::clone(&server);
                clients.threads.push(
                    std::thread::Builder::new()
                        .name(format!("clients-{kind:?}"))
                        .spawn(move || server.run_listener(kind))
                        .expect("spawn client listener"),
                );
            }
        }

        // peer sessions and, when any peer is passive, the shared listener
        let mut peers = Module::new("peers");
        {
            let mut inbound_map: HashMap<IpAddr, mpsc::Sender<TcpStream>> = HashMap::new();
            let mut listen_addr: Option<SocketAddr> = None;
            for entry in &config.peers {
                let session_config = entry.to_session_config(&config.labeling);
                let session = match registry.create_peer_session(session_config) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!("peer {} not started: {e}", entry.remote_addr);
                        continue;
                    }
                };
                let (sender, receiver) = mpsc::channel();
                if entry.passive {
                    inbound_map.insert(entry.remote_addr, sender);
                    listen_addr
                        .get_or_insert(SocketAddr::new(entry.local_addr, entry.local_port));
                }
                let thread = PeerThread {
                    session,
                    peer_queue: peer_writer.clone(),
                    shutdown: Arc::clone(&peers.shutdown),
                    inbound: receiver,
                };
                peers.threads.push(
                    std::thread::Builder::new()
                        .name(format!("peer-{}", entry.remote_addr))
                        .spawn(move || thread.run())
                        .expect("spawn peer thread"),
                );
            }
            if let Some(addr) = listen_addr {
                let shutdown = Arc::clone(&peers.shutdown);
                let map = Arc::new(Mutex::new(inbound_map));
                peers.threads.push(
                    std::thread::Builder::new()
                        .name("peer-listener".to_string())
                        .spawn(move || peer_listener(addr, map, shutdown))
                        .expect("spawn peer listener"),
                );
            }
        }

        // MRT ingest
        let mut mrt = Module::new("mrt");
        {
            let control = MrtControl::new(
                Arc::clone(&mrt.shutdown),
                Arc::clone(&registry),
                peer_writer.clone(),
                config.mrt.listen,
                config.mrt.label_action,
            );
            mrt.threads.push(
                std::thread::Builder::new()
                    .name("mrt-listener".to_string())
                    .spawn(move || control.run_listener())
                    .expect("spawn MRT listener"),
            );
        }

        // periodic sweeps
        let mut periodic = Module::new("periodic");
        {
            let tasks = Arc::new(crate::periodic::Periodic {
                config: config.periodic.clone(),
                shutdown: Arc::clone(&periodic.shutdown),
                registry: Arc::clone(&registry),
                labeled: labeled_queue.writer(),
                chains: Arc::clone(&chains),
            });
            periodic.threads = tasks.spawn();
        }

        // operator control surface
        let mut control = Module::new("control");
        {
            let server = Arc::new(ControlServer {
                shutdown: Arc::clone(&control.shutdown),
                registry: Arc::clone(&registry),
                chains: Arc::clone(&chains),
                queues: vec![Arc::clone(&peer_queue), Arc::clone(&labeled_queue)],
                labeled: labeled_queue.writer(),
                max_clients: max_clients_handle,
                listen_addr: config.control.listen,
            });
            control.threads.push(
                std::thread::Builder::new()
                    .name("control".to_string())
                    .spawn(move || server.run())
                    .expect("spawn control listener"),
            );
        }

        info!("bgpmon started with monitor id {monitor_id:#010x}");
        Daemon {
            registry,
            chains,
            peer_queue,
            labeled_queue,
            peer_writer,
            control,
            peers,
            mrt,
            label,
            periodic,
            clients,
        }
    }

    /// Ordered teardown. A stop record enters the pipeline first so
    /// subscribers see the end of the stream, then modules are signalled
    /// and joined producers-first.
    pub fn stop(self) {
        info!("bgpmon shutting down");
        self.peer_writer
            .write(Arc::new(Bmf::new(0, BmfType::BgpmonStop)));

        self.control.signal();
        self.control.join();

        self.peers.signal();
        self.peers.join();

        self.mrt.signal();
        self.mrt.join();

        // wake the labeling reader out of its blocking read
        self.label.signal();
        self.peer_queue.shutdown();
        self.label.join();

        self.periodic.signal();
        self.periodic.join();

        self.clients.signal();
        self.labeled_queue.shutdown();
        self.clients.join();

        info!("bgpmon stopped");
    }
}

/// Shared listener for passive peers: an inbound connection is matched to
/// its session by remote address and handed to that session's thread.
fn peer_listener(
    addr: SocketAddr,
    sessions: Arc<Mutex<HashMap<IpAddr, mpsc::Sender<TcpStream>>>>,
    shutdown: Arc<Shutdown>,
) {
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("peer listener cannot bind {addr}: {e}");
            return;
        }
    };
    listener.set_nonblocking(true).expect("nonblocking listener");
    info!("peer listener on {addr}");

    while !shutdown.is_set() {
        match listener.accept() {
            Ok((stream, remote)) => {
                let map = sessions.lock();
                match map.get(&remote.ip()) {
                    Some(sender) => {
                        if sender.send(stream).is_err() {
                            warn!("session thread for {} is gone", remote.ip());
                        }
                    }
                    None => {
                        warn!("connection from unconfigured peer {remote}; refused");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(crate::shutdown::THREAD_CHECK_INTERVAL);
            }
            Err(e) => {
                warn!("peer accept failed: {e}");
                shutdown.wait_timeout(crate::shutdown::THREAD_CHECK_INTERVAL);
            }
        }
    }
    info!("peer listener exiting");
}
