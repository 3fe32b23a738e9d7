/*!
Periodic scheduler: three cooperating tasks on the shutdown-check
cadence.

The route-refresh sweep spreads one full RIB re-emission per session
evenly across `route_refresh_interval`, sending the ceiling share for
the remainder seconds and the floor share afterwards so the labeled
queue never takes the whole table at once.
*/
use crate::chains::ChainCache;
use crate::labeling::transfer::send_rib_table;
use crate::models::{Bmf, BmfType};
use crate::queue::QueueWriter;
use crate::session::registry::SessionRegistry;
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PeriodicConfig {
    /// Seconds over which every established session is refreshed once.
    /// Zero disables the sweep.
    pub route_refresh_interval: u64,
    /// Seconds between status record batches.
    pub status_message_interval: u64,
    /// Seconds between chain cache aging passes.
    pub cache_expiration_interval: u64,
    /// Operator master switch for sending real ROUTE-REFRESH messages.
    pub route_refresh_enabled: bool,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        PeriodicConfig {
            route_refresh_interval: 7200,
            status_message_interval: 60,
            cache_expiration_interval: 60,
            route_refresh_enabled: false,
        }
    }
}

pub struct Periodic {
    pub config: PeriodicConfig,
    pub shutdown: Arc<Shutdown>,
    pub registry: Arc<SessionRegistry>,
    pub labeled: QueueWriter<Bmf>,
    pub chains: Arc<ChainCache>,
}

impl Periodic {
    /// Start the three scheduler threads.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let refresh = Arc::clone(&self);
        handles.push(
            std::thread::Builder::new()
                .name("periodic-refresh".to_string())
                .spawn(move || refresh.route_refresh_loop())
                .expect("spawn route refresh thread"),
        );
        let status = Arc::clone(&self);
        handles.push(
            std::thread::Builder::new()
                .name("periodic-status".to_string())
                .spawn(move || status.status_loop())
                .expect("spawn status thread"),
        );
        let aging = self;
        handles.push(
            std::thread::Builder::new()
                .name("periodic-cache".to_string())
                .spawn(move || aging.cache_aging_loop())
                .expect("spawn cache aging thread"),
        );
        handles
    }

    fn route_refresh_loop(&self) {
        info!("periodic route refresh thread started");
        while !self.shutdown.is_set() {
            let sessions = self.registry.established_sessions();
            let count = sessions.len() as u64;
            let interval = self.config.route_refresh_interval;
            if count == 0 || interval == 0 {
                self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
                continue;
            }

            // spread the refreshes over the interval: with more seconds
            // than sessions each session gets its own slot; otherwise the
            // first (count % interval) slots carry the ceiling share and
            // the rest the floor
            let (slot, ceil_sends, floor_sends) = sweep_shape(count, interval);
            let mut extra = if interval >= count { 0 } else { count % interval };
            let tail_sleep = if interval >= count { interval % count } else { 0 };
            debug!(
                "route refresh sweep: {count} session(s), {floor_sends}-{ceil_sends}/slot of {slot}s"
            );

            let mut sent = 0u64;
            let mut next = 0usize;
            'sweep: while next < sessions.len() {
                let sends = if extra > 0 {
                    extra -= 1;
                    ceil_sends
                } else {
                    floor_sends
                };
                for _ in 0..sends.max(1) {
                    if next >= sessions.len() {
                        break;
                    }
                    let session = &sessions[next];
                    next += 1;
                    if self.shutdown.is_set() {
                        break 'sweep;
                    }
                    if !session.config.route_refresh_action {
                        continue;
                    }
                    debug!("session {}: scheduled table refresh", session.id);
                    send_rib_table(session, &self.labeled);
                    if session.uptime(chrono::Utc::now().timestamp()) as u64 > interval
                        && self.config.route_refresh_enabled
                        && session.peer_supports_route_refresh()
                    {
                        session.set_route_refresh_flag();
                    }
                    sent += 1;
                }
                if self.shutdown.wait_timeout(Duration::from_secs(slot)) {
                    break 'sweep;
                }
            }
            if sent == 0 {
                // nothing eligible this pass; idle one tick
                self.shutdown.wait_timeout(THREAD_CHECK_INTERVAL);
            } else if tail_sleep > 0 {
                self.shutdown.wait_timeout(Duration::from_secs(tail_sleep));
            }
        }
        info!("periodic route refresh thread exiting");
    }

    fn status_loop(&self) {
        info!("periodic status thread started");
        let interval = Duration::from_secs(self.config.status_message_interval.max(1));
        while !self.shutdown.wait_timeout(interval) {
            for session in self.registry.all_sessions() {
                let bmf = Bmf::new(session.id, BmfType::SessionStatus);
                self.labeled.write(Arc::new(bmf));
            }
            self.labeled
                .write(Arc::new(Bmf::new(0, BmfType::QueuesStatus)));
            self.labeled
                .write(Arc::new(Bmf::new(0, BmfType::ChainsStatus)));
            self.labeled.write(Arc::new(Bmf::new(0, BmfType::MrtStatus)));
            debug!("status records enqueued");
        }
        info!("periodic status thread exiting");
    }

    fn cache_aging_loop(&self) {
        info!("periodic cache aging thread started");
        let interval = Duration::from_secs(self.config.cache_expiration_interval.max(1));
        while !self.shutdown.wait_timeout(interval) {
            let removed = self.chains.age();
            if removed > 0 {
                warn!("expired {removed} chain owner cache entr(ies)");
            }
        }
        info!("periodic cache aging thread exiting");
    }
}

/// Shape of one sweep: `(seconds per slot, ceiling sends, floor sends)`.
/// The first `count % interval` slots carry the ceiling share.
pub fn sweep_shape(session_count: u64, interval: u64) -> (u64, u64, u64) {
    if session_count == 0 || interval == 0 {
        return (0, 0, 0);
    }
    if interval >= session_count {
        (interval / session_count, 1, 1)
    } else {
        (
            1,
            (session_count + interval - 1) / interval,
            session_count / interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_shape_more_seconds_than_sessions() {
        // 4 sessions over 3600s: one refresh every 900s
        assert_eq!(sweep_shape(4, 3600), (900, 1, 1));
    }

    #[test]
    fn test_sweep_shape_more_sessions_than_seconds() {
        // 10 sessions over 4s: ceil(10/4)=3 sends in the first 2 slots,
        // floor(10/4)=2 in the rest
        assert_eq!(sweep_shape(10, 4), (1, 3, 2));
    }

    #[test]
    fn test_sweep_shape_disabled() {
        assert_eq!(sweep_shape(0, 3600), (0, 0, 0));
        assert_eq!(sweep_shape(5, 0), (0, 0, 0));
    }
}
