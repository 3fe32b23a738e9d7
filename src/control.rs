/*!
Control listener: a line-oriented command stream for operators.

This is the daemon-side socket only; the interactive shell around it is
out of scope. One thread per connection, one line per command, one line
(or a short block) per reply.
*/
use crate::chains::ChainCache;
use crate::labeling::transfer::send_rib_table;
use crate::models::Bmf;
use crate::queue::{Queue, QueueWriter};
use crate::session::registry::SessionRegistry;
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use log::{info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct ControlServer {
    pub shutdown: Arc<Shutdown>,
    pub registry: Arc<SessionRegistry>,
    pub chains: Arc<ChainCache>,
    pub queues: Vec<Arc<Queue<Bmf>>>,
    pub labeled: QueueWriter<Bmf>,
    pub max_clients: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    pub listen_addr: SocketAddr,
}

impl ControlServer {
    pub fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(self.listen_addr) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("control listener cannot bind {}: {e}", self.listen_addr);
                return;
            }
        };
        listener.set_nonblocking(true).expect("nonblocking listener");
        info!("control listener on {}", self.listen_addr);

        let mut threads = Vec::new();
        while !self.shutdown.is_set() {
            match listener.accept() {
                Ok((stream, remote)) => {
                    info!("control connection from {remote}");
                    let server = Arc::clone(&self);
                    threads.push(
                        std::thread::Builder::new()
                            .name(format!("control-{remote}"))
                            .spawn(move || server.serve(stream))
                            .expect("spawn control thread"),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
                Err(e) => {
                    warn!("control accept failed: {e}");
                    self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                }
            }
        }
        for handle in threads {
            let _ = handle.join();
        }
        info!("control listener exiting");
    }

    fn serve(&self, stream: TcpStream) {
        stream.set_read_timeout(Some(THREAD_CHECK_INTERVAL)).ok();
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!("control connection unusable: {e}");
                return;
            }
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            if self.shutdown.is_set() {
                break;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let reply = self.dispatch(line.trim());
                    if writer.write_all(reply.as_bytes()).is_err()
                        || writer.write_all(b"\n").is_err()
                    {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("control read failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, command: &str) -> String {
        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("show"), Some("sessions"), None) => {
                let mut out = String::new();
                for session in self.registry.all_sessions() {
                    out.push_str(&format!(
                        "session {} peer {}:{} AS{} state {} prefixes {}\n",
                        session.id,
                        session.config.remote_addr,
                        session.config.remote_port,
                        session.config.remote_as,
                        session.state(),
                        session.stats.prefix_count.load(Ordering::Relaxed),
                    ));
                }
                if out.is_empty() {
                    out.push_str("no sessions\n");
                }
                out.pop();
                out
            }
            (Some("show"), Some("session"), Some(id)) => match self.lookup(id) {
                Ok(session) => format!(
                    "session {} state {} uptime {}s nann {} dann {} spath {} dpath {} with {} dwith {} memory {}",
                    session.id,
                    session.state(),
                    session.uptime(chrono::Utc::now().timestamp()),
                    session.stats.ann_new.load(Ordering::Relaxed),
                    session.stats.ann_duplicate.load(Ordering::Relaxed),
                    session.stats.ann_spath.load(Ordering::Relaxed),
                    session.stats.ann_dpath.load(Ordering::Relaxed),
                    session.stats.wdr_new.load(Ordering::Relaxed),
                    session.stats.wdr_duplicate.load(Ordering::Relaxed),
                    session.stats.memory_used.load(Ordering::Relaxed),
                ),
                Err(reply) => reply,
            },
            (Some("refresh"), Some(id), None) => match self.lookup(id) {
                Ok(session) => {
                    let emitted = send_rib_table(&session, &self.labeled);
                    session.set_route_refresh_flag();
                    format!("refresh scheduled: {emitted} message(s) emitted")
                }
                Err(reply) => reply,
            },
            (Some("show"), Some("chains"), None) => {
                let mut out = format!("monitor id {:#010x}\n", self.chains.local_id());
                for (monitor_id, sequence, owner) in self.chains.snapshot() {
                    out.push_str(&format!(
                        "owner {monitor_id:#010x} sequence {sequence} via {owner}\n"
                    ));
                }
                out.pop();
                out
            }
            (Some("show"), Some("queues"), None) => {
                let mut out = String::new();
                for queue in &self.queues {
                    let status = queue.status();
                    out.push_str(&format!(
                        "queue {} written {}",
                        status.name, status.items_written
                    ));
                    for reader in &status.readers {
                        out.push_str(&format!(
                            " reader{}[unread {} read {}]",
                            reader.id, reader.unread, reader.read_count
                        ));
                    }
                    out.push('\n');
                }
                if out.is_empty() {
                    out.push_str("no queues\n");
                }
                out.pop();
                out
            }
            (Some("delete"), Some("session"), Some(id)) => match id.parse::<u16>() {
                Ok(id) if self.registry.destroy(id) => format!("session {id} deleted"),
                Ok(id) => format!("error: no session {id}"),
                Err(_) => "error: bad session id".to_string(),
            },
            (Some("set"), Some("max-clients"), Some(n)) => match n.parse::<usize>() {
                Ok(n) => {
                    self.max_clients.store(n, Ordering::Relaxed);
                    format!("max clients set to {n}")
                }
                Err(_) => "error: bad client count".to_string(),
            },
            (Some("quit"), None, None) => "bye".to_string(),
            (Some(""), ..) | (None, ..) => String::new(),
            _ => format!("error: unknown command '{command}'"),
        }
    }

    fn lookup(&self, id: &str) -> Result<Arc<crate::session::Session>, String> {
        let id: u16 = id.parse().map_err(|_| "error: bad session id".to_string())?;
        self.registry
            .get(id)
            .ok_or_else(|| format!("error: no session {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use crate::session::SessionConfig;

    fn server() -> Arc<ControlServer> {
        let queue: Arc<Queue<Bmf>> = Queue::new("labeled", 16);
        Arc::new(ControlServer {
            shutdown: Shutdown::new(),
            registry: SessionRegistry::new(),
            chains: Arc::new(ChainCache::new(7, std::time::Duration::from_secs(60))),
            queues: vec![Arc::clone(&queue)],
            labeled: queue.writer(),
            max_clients: Arc::new(std::sync::atomic::AtomicUsize::new(32)),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        })
    }

    #[test]
    fn test_set_max_clients() {
        let server = server();
        assert_eq!(server.dispatch("set max-clients 5"), "max clients set to 5");
        assert_eq!(server.max_clients.load(Ordering::Relaxed), 5);
        assert!(server.dispatch("set max-clients many").starts_with("error"));
    }

    #[test]
    fn test_show_chains_and_queues() {
        let server = server();
        server.chains.observe(9, 1, 0);
        let chains = server.dispatch("show chains");
        assert!(chains.contains("monitor id 0x00000007"));
        assert!(chains.contains("owner 0x00000009"));
        let queues = server.dispatch("show queues");
        assert!(queues.contains("queue labeled"));
    }

    #[test]
    fn test_show_sessions_empty() {
        let server = server();
        assert_eq!(server.dispatch("show sessions"), "no sessions");
    }

    #[test]
    fn test_show_and_delete_session() {
        let server = server();
        let session = server
            .registry
            .create_peer_session(SessionConfig::default())
            .unwrap();
        assert!(server.dispatch("show sessions").contains("session 0"));
        assert!(server
            .dispatch(&format!("show session {}", session.id))
            .contains("state Idle"));
        assert_eq!(server.dispatch("delete session 0"), "session 0 deleted");
        assert_eq!(server.dispatch("delete session 0"), "error: no session 0");
    }

    #[test]
    fn test_unknown_command() {
        let server = server();
        assert!(server.dispatch("frobnicate").starts_with("error"));
    }
}
