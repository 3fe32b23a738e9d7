use crate::error::MonitorError;
use crate::models::{AsnLength, BgpState, FsmEvent};
use crate::session::{LabelAction, Session, SessionConfig, MAX_SESSION_IDS};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Global id ↔ session index plus the tuple lookups the MRT ingest needs.
///
/// Ids are dense small integers; a freed id is reused only after the
/// session is fully destroyed. Creation and destruction serialise on one
/// lock; field access on a live session goes through the `Session`
/// atomics.
pub struct SessionRegistry {
    slots: Mutex<Vec<Option<Arc<Session>>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry {
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::default())
    }

    fn allocate_locked(
        slots: &mut Vec<Option<Arc<Session>>>,
        config: SessionConfig,
    ) -> Result<Arc<Session>, MonitorError> {
        let id = match slots.iter().position(|s| s.is_none()) {
            Some(free) => free,
            None => {
                if slots.len() >= MAX_SESSION_IDS {
                    return Err(MonitorError::SessionLimit);
                }
                slots.push(None);
                slots.len() - 1
            }
        };
        let session = Arc::new(Session::new(id as u16, config));
        slots[id] = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Register a session for a configured peer; it starts in Idle.
    pub fn create_peer_session(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<Session>, MonitorError> {
        let mut slots = self.slots.lock();
        let session = Self::allocate_locked(&mut slots, config)?;
        info!(
            "created session {} for peer {}:{}",
            session.id, session.config.remote_addr, session.config.remote_port
        );
        Ok(session)
    }

    pub fn get(&self, id: u16) -> Option<Arc<Session>> {
        self.slots.lock().get(id as usize)?.clone()
    }

    /// Full six-tuple lookup used when a live feed re-announces a session.
    #[allow(clippy::too_many_arguments)]
    pub fn find_session(
        &self,
        peer_as: u32,
        local_as: u32,
        peer_port: u16,
        local_port: u16,
        peer_ip: IpAddr,
        local_ip: IpAddr,
    ) -> Option<Arc<Session>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|s| {
                s.config.remote_as == peer_as
                    && s.config.local_as == local_as
                    && s.config.remote_port == peer_port
                    && s.config.local_port == local_port
                    && s.config.remote_addr == peer_ip
                    && s.config.local_addr == local_ip
            })
            .cloned()
    }

    /// One atomic check-then-insert under the registry lock: the identity
    /// of an MRT-fed session is its (peer AS, peer address, collector
    /// address) tuple.
    pub fn find_or_create_mrt(
        &self,
        peer_as: u32,
        peer_ip: IpAddr,
        collector_ip: IpAddr,
        label_action: LabelAction,
        asn_len: AsnLength,
    ) -> Result<Arc<Session>, MonitorError> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.iter().flatten().find(|s| {
            s.config.remote_as == peer_as
                && s.config.remote_addr == peer_ip
                && s.config.collector_addr == Some(collector_ip)
        }) {
            return Ok(Arc::clone(existing));
        }
        let session = Self::allocate_locked(
            &mut slots,
            SessionConfig {
                remote_addr: peer_ip,
                remote_as: peer_as,
                collector_addr: Some(collector_ip),
                label_action,
                ..SessionConfig::default()
            },
        )?;
        session.set_asn_len(asn_len);
        session.create_tables();
        session.set_state(BgpState::MrtEstablished, FsmEvent::None);
        session
            .stats
            .establish_time
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        debug!(
            "MRT ingest bound session {} to (AS{}, {}, {})",
            session.id, peer_as, peer_ip, collector_ip
        );
        Ok(session)
    }

    /// Remove a session; its id becomes reusable and all table memory is
    /// released with it.
    pub fn destroy(&self, id: u16) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(id as usize).and_then(|s| s.take()) {
            Some(session) => {
                session.release_tables();
                info!("destroyed session {id}");
                true
            }
            None => {
                warn!("destroy of unknown session {id}");
                false
            }
        }
    }

    pub fn established_sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| s.is_established())
            .cloned()
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
