/*!
Per-peer I/O thread: one thread owns the socket and drives the RFC 4271
state machine for its session. All timers are absolute deadlines; the
socket read timeout is the minimum remaining deadline, capped so the
shutdown flag is observed at least once a second.
*/
use crate::models::bgp::{BGP_HEADER_LEN, BGP_MAX_MESSAGE_LEN};
use crate::models::{
    BgpMessage, BgpNotification, BgpRouteRefresh, BgpState, Bmf, BmfType, FsmEvent,
    NotifErrorCode, StateChange, Afi, Safi,
};
use crate::parser::bgp::{encode_bgp_message, parse_bgp_message, parse_bgp_message_header};
use crate::queue::QueueWriter;
use crate::session::fsm::{jitter, local_open, validate_open, OpenRejection};
use crate::session::Session;
use crate::shutdown::{Shutdown, THREAD_CHECK_INTERVAL};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Setting a TCP MD5 signature key is platform plumbing this crate keeps
/// behind a seam. A configured password on a build without support is
/// fatal at session startup.
fn md5_supported() -> bool {
    false
}

fn apply_md5_option(_stream: &TcpStream, _password: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "TCP MD5 signatures are not supported on this build",
    ))
}

/// Everything a peer thread needs besides its session.
pub struct PeerThread {
    pub session: Arc<Session>,
    pub peer_queue: QueueWriter<Bmf>,
    pub shutdown: Arc<Shutdown>,
    /// Inbound connections matched to this session by the peer listener.
    pub inbound: Receiver<TcpStream>,
}

struct Timers {
    hold_deadline: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    hold_interval: Duration,
    keepalive_interval: Duration,
}

impl Timers {
    fn disabled() -> Timers {
        Timers {
            hold_deadline: None,
            keepalive_deadline: None,
            hold_interval: Duration::ZERO,
            keepalive_interval: Duration::ZERO,
        }
    }

    fn from_negotiated(hold_time: u16, keepalive_secs: u64) -> Timers {
        if hold_time == 0 {
            return Timers::disabled();
        }
        let hold = Duration::from_secs(hold_time as u64);
        let keepalive = Duration::from_secs(keepalive_secs);
        let now = Instant::now();
        Timers {
            hold_deadline: Some(now + hold),
            keepalive_deadline: Some(now + keepalive),
            hold_interval: hold,
            keepalive_interval: keepalive,
        }
    }

    fn reset_hold(&mut self) {
        if !self.hold_interval.is_zero() {
            self.hold_deadline = Some(Instant::now() + self.hold_interval);
        }
    }

    fn reset_keepalive(&mut self) {
        if !self.keepalive_interval.is_zero() {
            self.keepalive_deadline = Some(Instant::now() + self.keepalive_interval);
        }
    }

    /// Time until the nearest deadline, capped at the shutdown check tick.
    fn read_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = THREAD_CHECK_INTERVAL;
        for deadline in [self.hold_deadline, self.keepalive_deadline].into_iter().flatten() {
            let remaining = deadline.saturating_duration_since(now);
            if remaining < timeout {
                timeout = remaining;
            }
        }
        timeout.max(Duration::from_millis(10))
    }
}

impl PeerThread {
    /// Thread entry: drive the session until shutdown.
    pub fn run(self) {
        info!(
            "session {}: peer thread started for {}:{}",
            self.session.id, self.session.config.remote_addr, self.session.config.remote_port
        );
        if self.session.config.md5_password.is_some() && !md5_supported() {
            error!(
                "session {}: TCP MD5 configured but unsupported; session disabled",
                self.session.id
            );
            self.transition(BgpState::Error, FsmEvent::ManualStop);
            self.shutdown.wait();
            return;
        }
        self.transition(BgpState::Idle, FsmEvent::ManualStart);

        while !self.shutdown.is_set() {
            // Idle: wait out the (jittered) connect-retry interval
            let nominal = Duration::from_secs(self.session.config.connect_retry_secs);
            let retries = self.session.stats.connect_retry_count.load(Ordering::Relaxed);
            let backoff = if retries == 0 { Duration::ZERO } else { jitter(nominal) };
            if self.shutdown.wait_timeout(backoff) {
                break;
            }

            let stream = match self.obtain_connection() {
                Some(stream) => stream,
                None => {
                    self.session
                        .stats
                        .connect_retry_count
                        .fetch_add(1, Ordering::Relaxed);
                    self.transition(BgpState::Idle, FsmEvent::TcpConnectionFails);
                    continue;
                }
            };

            match self.run_connection(stream) {
                Ok(()) => {}
                Err(event) => {
                    self.session
                        .stats
                        .connect_retry_count
                        .fetch_add(1, Ordering::Relaxed);
                    self.session_down(event);
                }
            }
        }
        self.session_down(FsmEvent::ManualStop);
        info!("session {}: peer thread exiting", self.session.id);
    }

    /// Get a TCP stream: dial out, or wait for the listener to hand one in.
    fn obtain_connection(&self) -> Option<TcpStream> {
        if self.session.config.passive {
            self.transition(BgpState::Active, FsmEvent::None);
            loop {
                if self.shutdown.is_set() {
                    return None;
                }
                match self.inbound.recv_timeout(THREAD_CHECK_INTERVAL) {
                    Ok(stream) => return Some(stream),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            }
        }

        self.transition(BgpState::Connect, FsmEvent::None);
        let remote = SocketAddr::new(
            self.session.config.remote_addr,
            self.session.config.remote_port,
        );
        match TcpStream::connect_timeout(&remote, THREAD_CHECK_INTERVAL * 5) {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!("session {}: connect to {} failed: {}", self.session.id, remote, e);
                self.transition(BgpState::Active, FsmEvent::TcpConnectionFails);
                None
            }
        }
    }

    /// One TCP connection's lifetime: OPEN exchange, then the Established
    /// loop. An error return names the event that takes the FSM down.
    fn run_connection(&self, stream: TcpStream) -> Result<(), FsmEvent> {
        let session = &self.session;
        if let Some(password) = &session.config.md5_password {
            if let Err(e) = apply_md5_option(&stream, password) {
                error!("session {}: cannot arm TCP MD5: {e}", session.id);
                return Err(FsmEvent::TcpConnectionFails);
            }
        }
        stream.set_nodelay(true).ok();

        self.transition(BgpState::Connect, FsmEvent::TcpConnectionConfirmed);

        let mut stream = stream;
        // send our OPEN
        let open = local_open(&session.config);
        self.send(&mut stream, &BgpMessage::Open(open))?;
        self.transition(BgpState::OpenSent, FsmEvent::None);

        // await the peer's OPEN under the large hold time
        let mut timers = Timers::disabled();
        let open_deadline = Instant::now() + Duration::from_secs(240);
        let negotiated = loop {
            let message = self.read_message(&mut stream, &timers)?;
            match message {
                Some(BgpMessage::Open(peer_open)) => {
                    match validate_open(&session.config, &peer_open) {
                        Ok(negotiated) => {
                            session.set_peer_capabilities(peer_open.capabilities.clone());
                            session.set_asn_len(negotiated.asn_len);
                            break negotiated;
                        }
                        Err(rejection) => {
                            self.refuse_open(&mut stream, &rejection);
                            return Err(rejection.event);
                        }
                    }
                }
                Some(BgpMessage::Notification(notification)) => {
                    warn!(
                        "session {}: NOTIFICATION during OPEN: {}/{}",
                        session.id, notification.error_code, notification.error_subcode
                    );
                    return Err(FsmEvent::NotifMsg);
                }
                Some(other) => {
                    warn!(
                        "session {}: unexpected {:?} in OpenSent",
                        session.id,
                        other.msg_type()
                    );
                    self.notify(&mut stream, NotifErrorCode::FiniteStateMachineError, 0, &[]);
                    return Err(FsmEvent::BgpHeaderErr);
                }
                None => {
                    if self.shutdown.is_set() {
                        return Err(FsmEvent::ManualStop);
                    }
                    if Instant::now() >= open_deadline {
                        self.notify(&mut stream, NotifErrorCode::HoldTimerExpired, 0, &[]);
                        return Err(FsmEvent::HoldTimerExpire);
                    }
                }
            }
        };

        self.send(&mut stream, &BgpMessage::Keepalive)?;
        self.transition(BgpState::OpenConfirm, FsmEvent::BgpOpen);

        // await the peer's first KEEPALIVE
        timers = Timers::from_negotiated(negotiated.hold_time, negotiated.keepalive_secs);
        loop {
            let message = self.read_message(&mut stream, &timers)?;
            match message {
                Some(BgpMessage::Keepalive) => break,
                Some(BgpMessage::Notification(notification)) => {
                    warn!(
                        "session {}: NOTIFICATION in OpenConfirm: {}/{}",
                        session.id, notification.error_code, notification.error_subcode
                    );
                    return Err(FsmEvent::NotifMsg);
                }
                Some(other) => {
                    warn!(
                        "session {}: unexpected {:?} in OpenConfirm",
                        session.id,
                        other.msg_type()
                    );
                    self.notify(&mut stream, NotifErrorCode::FiniteStateMachineError, 0, &[]);
                    return Err(FsmEvent::BgpHeaderErr);
                }
                None => {
                    if self.shutdown.is_set() {
                        return Err(FsmEvent::ManualStop);
                    }
                    if self.hold_expired(&timers) {
                        self.notify(&mut stream, NotifErrorCode::HoldTimerExpired, 0, &[]);
                        return Err(FsmEvent::HoldTimerExpire);
                    }
                }
            }
        }

        // Established: tables exist from here until the session drops
        session.create_tables();
        session
            .stats
            .establish_time
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        session.stats.connect_retry_count.store(0, Ordering::Relaxed);
        self.transition(BgpState::Established, FsmEvent::KeepAliveMsg);

        timers.reset_hold();
        timers.reset_keepalive();
        self.established_loop(&mut stream, &mut timers)
    }

    fn established_loop(
        &self,
        stream: &mut TcpStream,
        timers: &mut Timers,
    ) -> Result<(), FsmEvent> {
        let session = &self.session;
        loop {
            if self.shutdown.is_set() {
                self.notify(stream, NotifErrorCode::Cease, 0, &[]);
                return Err(FsmEvent::ManualStop);
            }

            // the periodic module asks for route refresh via a flag
            if session.take_route_refresh_flag() {
                if session.peer_supports_route_refresh() && session.config.route_refresh_action {
                    let refresh = BgpRouteRefresh {
                        afi: Afi::Ipv4,
                        safi: Safi::Unicast,
                    };
                    self.send(stream, &BgpMessage::RouteRefresh(refresh))?;
                    session
                        .stats
                        .last_route_refresh
                        .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                    info!("session {}: ROUTE-REFRESH sent", session.id);
                } else {
                    debug!(
                        "session {}: route refresh requested but not negotiated",
                        session.id
                    );
                }
            }

            if let Some(deadline) = timers.keepalive_deadline {
                if Instant::now() >= deadline {
                    self.send(stream, &BgpMessage::Keepalive)?;
                    timers.reset_keepalive();
                }
            }
            if self.hold_expired(timers) {
                warn!("session {}: hold timer expired", session.id);
                self.notify(stream, NotifErrorCode::HoldTimerExpired, 0, &[]);
                return Err(FsmEvent::HoldTimerExpire);
            }

            let message = match self.read_raw(stream, timers)? {
                Some(raw) => raw,
                None => continue,
            };
            session.touch();
            session
                .stats
                .messages_received
                .fetch_add(1, Ordering::Relaxed);
            timers.reset_hold();

            match parse_bgp_message_header(&message) {
                Ok((msg_type, _)) => match msg_type {
                    crate::models::BgpMessageType::Update => {
                        let mut bmf = Bmf::new(session.id, BmfType::MsgFromPeer);
                        if bmf.append(&message).is_err() {
                            warn!("session {}: oversized update dropped", session.id);
                            continue;
                        }
                        self.peer_queue.write(Arc::new(bmf));
                    }
                    crate::models::BgpMessageType::Keepalive => {
                        debug!("session {}: keepalive", session.id);
                    }
                    crate::models::BgpMessageType::Notification => {
                        match parse_bgp_message(Bytes::copy_from_slice(&message), session.asn_len())
                        {
                            Ok(BgpMessage::Notification(notification)) => warn!(
                                "session {}: NOTIFICATION {}/{}",
                                session.id, notification.error_code, notification.error_subcode
                            ),
                            _ => warn!("session {}: malformed NOTIFICATION", session.id),
                        }
                        return Err(FsmEvent::NotifMsg);
                    }
                    crate::models::BgpMessageType::RouteRefresh => {
                        // a collector keeps no adj-RIB-out to resend
                        debug!("session {}: peer requested route refresh", session.id);
                    }
                    crate::models::BgpMessageType::Open => {
                        self.notify(stream, NotifErrorCode::FiniteStateMachineError, 0, &[]);
                        return Err(FsmEvent::BgpHeaderErr);
                    }
                },
                Err(e) => {
                    warn!("session {}: header error: {e}", session.id);
                    self.notify(stream, NotifErrorCode::MessageHeaderError, 0, &[]);
                    return Err(FsmEvent::BgpHeaderErr);
                }
            }
        }
    }

    /// Read one framed BGP message; `Ok(None)` means the read timed out
    /// and the caller should service timers and the shutdown flag.
    fn read_raw(
        &self,
        stream: &mut TcpStream,
        timers: &Timers,
    ) -> Result<Option<Vec<u8>>, FsmEvent> {
        stream.set_read_timeout(Some(timers.read_timeout())).ok();
        let mut header = [0u8; BGP_HEADER_LEN];
        match stream.read(&mut header) {
            Ok(0) => {
                debug!("session {}: peer closed the connection", self.session.id);
                return Err(FsmEvent::TcpConnectionFails);
            }
            Ok(mut n) => {
                // a short header read is completed under the same timeout;
                // fewer bytes than declared is fatal to the session
                while n < BGP_HEADER_LEN {
                    match stream.read(&mut header[n..]) {
                        Ok(0) => return Err(FsmEvent::TcpConnectionFails),
                        Ok(more) => n += more,
                        Err(e) => {
                            warn!("session {}: short header read: {e}", self.session.id);
                            return Err(FsmEvent::TcpConnectionFails);
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => {
                warn!("session {}: read error: {e}", self.session.id);
                return Err(FsmEvent::TcpConnectionFails);
            }
        }

        let (_, declared) = parse_bgp_message_header(&header).map_err(|e| {
            warn!("session {}: bad message header: {e}", self.session.id);
            FsmEvent::BgpHeaderErr
        })?;
        let mut message = vec![0u8; declared];
        message[..BGP_HEADER_LEN].copy_from_slice(&header);
        if declared > BGP_HEADER_LEN {
            if let Err(e) = stream.read_exact(&mut message[BGP_HEADER_LEN..]) {
                warn!(
                    "session {}: read {} of {} declared bytes: {e}",
                    self.session.id,
                    BGP_HEADER_LEN,
                    declared
                );
                return Err(FsmEvent::TcpConnectionFails);
            }
        }
        debug_assert!(message.len() <= BGP_MAX_MESSAGE_LEN);
        Ok(Some(message))
    }

    /// Read and fully parse one message (OPEN exchange path).
    fn read_message(
        &self,
        stream: &mut TcpStream,
        timers: &Timers,
    ) -> Result<Option<BgpMessage>, FsmEvent> {
        match self.read_raw(stream, timers)? {
            None => Ok(None),
            Some(raw) => {
                match parse_bgp_message(Bytes::from(raw), self.session.asn_len()) {
                    Ok(message) => Ok(Some(message)),
                    Err(e) => {
                        warn!("session {}: undecodable message: {e}", self.session.id);
                        Err(FsmEvent::BgpHeaderErr)
                    }
                }
            }
        }
    }

    fn hold_expired(&self, timers: &Timers) -> bool {
        matches!(timers.hold_deadline, Some(deadline) if Instant::now() >= deadline)
    }

    fn send(&self, stream: &mut TcpStream, message: &BgpMessage) -> Result<(), FsmEvent> {
        let bytes = encode_bgp_message(message, self.session.asn_len());
        stream.write_all(&bytes).map_err(|e| {
            warn!("session {}: write failed: {e}", self.session.id);
            FsmEvent::TcpConnectionFails
        })
    }

    fn notify(&self, stream: &mut TcpStream, code: NotifErrorCode, subcode: u8, data: &[u8]) {
        let notification = BgpNotification {
            error_code: code.into(),
            error_subcode: subcode,
            data: Bytes::copy_from_slice(data),
        };
        let bytes = encode_bgp_message(
            &BgpMessage::Notification(notification),
            self.session.asn_len(),
        );
        if let Err(e) = stream.write_all(&bytes) {
            debug!("session {}: NOTIFICATION not sent: {e}", self.session.id);
        }
    }

    fn refuse_open(&self, stream: &mut TcpStream, rejection: &OpenRejection) {
        warn!(
            "session {}: OPEN refused: {}",
            self.session.id, rejection.reason
        );
        self.notify(stream, rejection.code, rejection.subcode, &[]);
    }

    /// Record a transition: update the shared state, log it, and push an
    /// FSM_STATE_CHANGE record through the pipeline.
    fn transition(&self, new_state: BgpState, event: FsmEvent) {
        let old_state = self.session.state();
        if old_state == new_state && event == FsmEvent::None {
            return;
        }
        self.session.set_state(new_state, event);
        debug!(
            "session {}: {} -> {} ({:?})",
            self.session.id, old_state, new_state, event
        );
        let change = StateChange {
            old_state: u8::from(old_state) as u16,
            new_state: u8::from(new_state) as u16,
            reason: event.into(),
        };
        let mut bmf = Bmf::new(self.session.id, BmfType::FsmStateChange);
        if bmf.append(&change.encode()).is_ok() {
            self.peer_queue.write(Arc::new(bmf));
        }
    }

    /// Leave any of the open or established states for Idle, releasing the
    /// tables and recording the down event.
    fn session_down(&self, event: FsmEvent) {
        let state = self.session.state();
        if matches!(
            state,
            BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established
        ) {
            self.session
                .stats
                .record_down(chrono::Utc::now().timestamp());
            self.session.release_tables();
        }
        self.transition(BgpState::Idle, event);
    }
}
