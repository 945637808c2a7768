//! The per-endpoint [`Context`]: owns the socket, the connection registry, the shared queues,
//! and the single `update` tick that drives everything else.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::{clamp_thread_interval, AuthPolicy, ContextConfig, Role};
use crate::connection::{AckOutcome, ConnectionPhase, ConnectionState, ModeTransition, SendIntent};
use crate::crypto::{self, KeyPair};
use crate::error::{ErrorKind, NetworkError, NetworkResult};
use crate::event::{Event, EventQueue};
use crate::identity::ConnectionId;
use crate::log::{LogLevel, LogSink};
use crate::packet::{
    self, ConnectBody, ConnectPacket, DataPacket, Header, Packet, PacketFlags, MAX_DATAGRAM_SIZE,
};
use crate::queue::{OutboundPayload, ReceivedPayload, ReceivedQueue, SendQueue};
use crate::registry::ConnectionRegistry;

enum Intent {
    Connect {
        peer: ConnectionId,
        want_auth: bool,
        pinned_pk: Option<[u8; crypto::PUBLIC_KEY_SIZE]>,
    },
    Disconnect {
        peer: ConnectionId,
        drop_all_with_addr: bool,
    },
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// One UDP/IPv6 endpoint: socket, peer registry, queues, and the logging/auth/config policy
/// that governs them. Embedders hold this behind an `Arc`, matching this lineage's move away
/// from a type-erased raw handle (§9 redesign notes): validity is "you're holding a live
/// `Arc<Context>`", not a runtime magic-number check.
pub struct Context {
    socket: std::net::UdpSocket,
    local_port: u16,
    role: Role,

    protocol_id: AtomicU32,
    auth_enabled: AtomicBool,
    auth_policy_strict: AtomicBool,
    accept_new_connections: AtomicBool,
    emit_events: AtomicBool,

    log: LogSink,
    identity_keys: Mutex<Option<KeyPair>>,
    whitelist: RwLock<HashSet<[u8; crypto::PUBLIC_KEY_SIZE]>>,
    rng: Mutex<StdRng>,

    registry: Mutex<ConnectionRegistry>,
    send_queue: SendQueue,
    received_queue: ReceivedQueue,
    event_queue: EventQueue,
    intents: Mutex<VecDeque<Intent>>,

    worker: Mutex<Option<WorkerHandle>>,
}

impl Context {
    /// Opens a dual-stack IPv6 UDP socket bound to `listen_addr:listen_port`, non-blocking,
    /// and returns a ready-to-drive Context. Pass port `0` to let the OS assign one; read it
    /// back with [`Context::local_port`].
    pub fn init(
        listen_addr: Ipv6Addr,
        listen_port: u16,
        config: ContextConfig,
    ) -> NetworkResult<Arc<Context>> {
        let (socket, bound_port) = build_socket(listen_addr, listen_port)?;

        if config.auth_enabled && config.role == Role::Server {
            // Server-side auth doesn't require a configured keypair up front: one is generated
            // lazily per connection if none is set. Nothing to validate eagerly here.
        }

        let log = LogSink::terminal(config.log_level);
        let rng = StdRng::seed_from_u64(seed_from_wall_clock());

        let ctx = Arc::new(Context {
            socket,
            local_port: bound_port,
            role: config.role,
            protocol_id: AtomicU32::new(config.protocol_id),
            auth_enabled: AtomicBool::new(config.auth_enabled),
            auth_policy_strict: AtomicBool::new(config.auth_policy == AuthPolicy::Strict),
            accept_new_connections: AtomicBool::new(config.accept_new_connections),
            emit_events: AtomicBool::new(config.emit_events),
            log,
            identity_keys: Mutex::new(None),
            whitelist: RwLock::new(HashSet::new()),
            rng: Mutex::new(rng),
            registry: Mutex::new(ConnectionRegistry::new()),
            send_queue: SendQueue::new(),
            received_queue: ReceivedQueue::new(),
            event_queue: EventQueue::new(),
            intents: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
        });

        ctx.log_event(LogLevel::Info, |log| {
            slog::info!(log, "context initialized"; "port" => bound_port, "role" => format!("{:?}", ctx.role))
        });

        Ok(ctx)
    }

    /// Like [`Context::init`], but immediately starts a dedicated worker thread driving `update`.
    pub fn init_threaded(
        listen_addr: Ipv6Addr,
        listen_port: u16,
        config: ContextConfig,
        interval_ms: Option<u64>,
    ) -> NetworkResult<Arc<Context>> {
        let ctx = Context::init(listen_addr, listen_port, config)?;
        ctx.enable_threaded(interval_ms.unwrap_or(crate::config::DEFAULT_THREAD_INTERVAL_MS));
        Ok(ctx)
    }

    /// Starts the worker thread if it is not already running. Idempotent.
    pub fn enable_threaded(self: &Arc<Self>, interval_ms: u64) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        let interval = Duration::from_millis(clamp_thread_interval(interval_ms));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let ctx = Arc::clone(self);

        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let tick_start = Instant::now();
                ctx.update();
                let elapsed = tick_start.elapsed();
                if elapsed < interval {
                    thread::sleep(interval - elapsed);
                }
            }
        });

        *worker = Some(WorkerHandle { stop, thread });
    }

    /// Stops the worker thread if running, blocking until it exits. Idempotent.
    pub fn disable_threaded(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::Relaxed);
            let _ = handle.thread.join();
        }
    }

    #[inline]
    pub fn is_threaded(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Stops any worker thread. The socket and queues are released when the last `Arc<Context>`
    /// is dropped.
    pub fn destroy(&self) {
        self.disable_threaded();
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Runs one tick: drains intents, ages/times out connections, promotes queued user sends,
    /// decides and performs each connection's send, finalizes deletions, then receives at most
    /// one datagram. A no-op to call manually while threaded.
    pub fn update(&self) {
        if self.is_threaded() {
            return;
        }
        self.tick();
    }

    fn tick(&self) {
        let now = Instant::now();
        self.drain_intents();
        self.age_and_timeout_connections(now);
        self.promote_sends();
        self.drive_connection_sends(now);
        self.finalize_deletions();
        self.receive_one_datagram(now);
    }

    // ---- tick phases ----------------------------------------------------------------

    fn drain_intents(&self) {
        let mut intents = self.intents.lock().unwrap();
        let mut registry = self.registry.lock().unwrap();

        while let Some(intent) = intents.pop_front() {
            match intent {
                Intent::Connect { peer, want_auth, pinned_pk } => {
                    if registry.contains(&peer) {
                        continue;
                    }
                    let mut state = ConnectionState::new_initiating(peer);
                    state.set_auth_enabled(want_auth || pinned_pk.is_some());
                    if let Some(pk) = pinned_pk {
                        state.set_expected_peer_pk(pk);
                    }
                    registry.insert(peer, state);
                }
                Intent::Disconnect { peer, drop_all_with_addr } => {
                    if drop_all_with_addr {
                        registry.stage_deletion_by_address(peer);
                    } else {
                        registry.stage_deletion(peer);
                    }
                    if let Some(state) = registry.get_mut(&peer) {
                        if state.phase() != ConnectionPhase::Initiating {
                            state.set_phase(ConnectionPhase::DisconnectPending);
                        }
                    }
                }
            }
        }
    }

    fn age_and_timeout_connections(&self, now: Instant) {
        let mut registry = self.registry.lock().unwrap();
        let timed_out: Vec<ConnectionId> = registry
            .identities()
            .copied()
            .filter(|id| {
                registry
                    .get(id)
                    .map(|s| s.phase() != ConnectionPhase::Initiating && s.is_timed_out(now))
                    .unwrap_or(false)
            })
            .collect();

        for identity in timed_out {
            self.log_event(LogLevel::Verbose, |log| {
                slog::debug!(log, "connection timed out"; "peer" => identity.to_string())
            });
            registry.stage_deletion(identity);
        }
    }

    fn promote_sends(&self) {
        let mut registry = self.registry.lock().unwrap();
        let mut deferred = Vec::new();

        while let Some(item) = self.send_queue.pop() {
            match registry.get_mut(&item.to) {
                Some(state) if state.phase() == ConnectionPhase::Established => {
                    if let Err(data) = state.queue_send(item.data) {
                        self.log_event(LogLevel::Warning, |log| {
                            slog::warn!(log, "per-connection send queue full, retrying on a later tick"; "peer" => item.to.to_string())
                        });
                        deferred.push(OutboundPayload { to: item.to, data });
                    }
                }
                Some(_) => deferred.push(item),
                None => {
                    self.log_event(LogLevel::Warning, |log| {
                        slog::warn!(log, "dropping queued send to unknown connection"; "peer" => item.to.to_string())
                    });
                }
            }
        }

        for item in deferred {
            self.send_queue.push(item);
        }
    }

    fn drive_connection_sends(&self, now: Instant) {
        let protocol_id = self.protocol_id.load(Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap();
        let identities: Vec<ConnectionId> = registry.identities().copied().collect();

        for identity in identities {
            if registry.is_staged_for_deletion(&identity) {
                let still_initiating = registry
                    .get(&identity)
                    .map(|s| s.phase() == ConnectionPhase::Initiating)
                    .unwrap_or(true);
                if still_initiating {
                    continue;
                }
            }

            let Some(state) = registry.get_mut(&identity) else {
                continue;
            };
            let intent = state.decide_send(now);

            match intent {
                SendIntent::Nothing => {}
                SendIntent::HandshakeRequest { with_auth } => {
                    self.send_handshake_request(state, protocol_id, with_auth, now);
                }
                SendIntent::Heartbeat => {
                    self.send_data_packet(state, protocol_id, &[], false, false, now);
                }
                SendIntent::Payload { checked, resending, data } => {
                    self.send_data_packet(state, protocol_id, &data, checked, resending, now);
                }
                SendIntent::Disconnect => {
                    self.send_disconnect(state, protocol_id, now);
                }
            }
        }
    }

    fn finalize_deletions(&self) {
        let removed = self.registry.lock().unwrap().process_deletions();
        for (identity, _state) in removed {
            self.emit_event(Event::Disconnected(identity));
        }
    }

    fn receive_one_datagram(&self, now: Instant) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => return,
        };

        let SocketAddr::V6(from_v6) = from else {
            return;
        };
        let sender = ConnectionId::new(*from_v6.ip(), from_v6.scope_id(), from_v6.port());

        let protocol_id = self.protocol_id.load(Ordering::Relaxed);
        let packet = match packet::decode(&buf[..len], protocol_id) {
            Ok(packet) => packet,
            Err(_) => {
                self.log_event(LogLevel::Verbose, |log| {
                    slog::debug!(log, "dropped malformed or mismatched datagram"; "from" => sender.to_string())
                });
                return;
            }
        };

        match packet {
            Packet::Connect(connect) => self.handle_connect_packet(sender, connect, now),
            Packet::Data(data) => self.handle_data_packet(sender, data, now),
        }
    }

    fn handle_connect_packet(&self, sender: ConnectionId, connect: ConnectPacket, now: Instant) {
        if connect.header.flags.ping {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains(&sender) {
                registry.stage_deletion(sender);
            }
            return;
        }

        let existing_phase = self.registry.lock().unwrap().get(&sender).map(|s| s.phase());

        match existing_phase {
            Some(ConnectionPhase::Initiating) => self.handle_handshake_reply(sender, connect, now),
            None => self.handle_handshake_request(sender, connect, now),
            _ => {
                self.log_event(LogLevel::Verbose, |log| {
                    slog::debug!(log, "dropped stray connect packet for an active connection"; "from" => sender.to_string())
                });
            }
        }
    }

    fn handle_handshake_request(&self, sender: ConnectionId, connect: ConnectPacket, now: Instant) {
        if !self.accept_new_connections.load(Ordering::Relaxed) {
            return;
        }

        let strict = self.auth_policy_strict.load(Ordering::Relaxed);
        let server_auth_enabled = self.auth_enabled.load(Ordering::Relaxed);

        let (client_authed, client_pk, verify_message) = match connect.body {
            ConnectBody::NoAuth => (false, None, None),
            ConnectBody::ClientAuth { client_pk, verify_message } => {
                (true, Some(client_pk), Some(verify_message))
            }
            ConnectBody::ServerAuth { .. } => return,
        };

        if strict && client_authed != server_auth_enabled {
            let err = NetworkError::Fatal(ErrorKind::AuthPolicyViolation);
            self.log_event(LogLevel::Info, |log| {
                slog::info!(log, "dropping connect request"; "from" => sender.to_string(), "reason" => err.to_string())
            });
            return;
        }

        if let Some(pk) = client_pk {
            let whitelist = self.whitelist.read().unwrap();
            if !whitelist.is_empty() && !whitelist.contains(&pk) {
                self.log_event(LogLevel::Info, |log| {
                    slog::info!(log, "rejecting connect from non-whitelisted key"; "from" => sender.to_string())
                });
                return;
            }
        }

        let mut state = ConnectionState::new_established(sender, 0, now);
        state.set_auth_enabled(server_auth_enabled && client_authed);
        if let Some(pk) = client_pk {
            state.set_peer_pk(pk);
        }

        let reply_body = if client_authed && server_auth_enabled {
            let keys = self.resolve_local_keys(&mut state);
            let signature = keys.sign(verify_message.as_deref().unwrap_or(&[]));
            ConnectBody::ServerAuth { server_pk: keys.public_key(), signature }
        } else {
            ConnectBody::NoAuth
        };

        let connection_id = {
            let mut registry = self.registry.lock().unwrap();
            let mut rng = self.rng.lock().unwrap();
            let Some(connection_id) = registry.draw_unique_connection_id(&mut *rng) else {
                return;
            };
            drop(rng);

            state.set_connection_id(connection_id);
            registry.insert(sender, state);
            registry.bind_connection_id(sender, connection_id);
            connection_id
        };

        let header = Header {
            protocol_id: self.protocol_id.load(Ordering::Relaxed),
            connection_id,
            flags: PacketFlags::connect_packet(),
            seq: 0,
            rseq: 0,
            ack: 0,
        };
        if let Ok(bytes) = packet::encode_connect(&ConnectPacket { header, body: reply_body }) {
            let _ = self.send_raw(&bytes, sender);
        }

        self.emit_event(Event::Connected(sender));
    }

    fn handle_handshake_reply(&self, sender: ConnectionId, connect: ConnectPacket, now: Instant) {
        let strict = self.auth_policy_strict.load(Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap();
        let Some(state) = registry.get_mut(&sender) else {
            let err = NetworkError::Fatal(ErrorKind::UnknownIdentity);
            self.log_event(LogLevel::Verbose, |log| {
                slog::debug!(log, "dropped handshake reply"; "from" => sender.to_string(), "reason" => err.to_string())
            });
            return;
        };
        if state.phase() != ConnectionPhase::Initiating {
            return;
        }

        match connect.body {
            ConnectBody::NoAuth => {
                if strict && state.auth_enabled() {
                    return;
                }
                state.set_auth_enabled(false);
            }
            ConnectBody::ServerAuth { server_pk, signature } => {
                if let Some(expected) = state.expected_peer_pk() {
                    if expected != &server_pk {
                        return;
                    }
                }
                let Some(message) = state.pending_verify_message().map(|m| m.to_vec()) else {
                    return;
                };
                if !crypto::verify(&server_pk, &message, &signature) {
                    return;
                }
                state.set_peer_pk(server_pk);
                state.lock_peer_pk();
            }
            ConnectBody::ClientAuth { .. } => return,
        }

        state.set_connection_id(connect.header.connection_id);
        state.mark_established(now);
        drop(registry);
        self.emit_event(Event::Connected(sender));
    }

    fn handle_data_packet(&self, sender: ConnectionId, data: DataPacket, now: Instant) {
        let mut registry = self.registry.lock().unwrap();
        let Some(state) = registry.get_mut(&sender) else {
            let err = NetworkError::Fatal(ErrorKind::UnknownIdentity);
            self.log_event(LogLevel::Verbose, |log| {
                slog::debug!(log, "dropped data packet"; "from" => sender.to_string(), "reason" => err.to_string())
            });
            return;
        };
        if state.phase() != ConnectionPhase::Established {
            return;
        }

        match &data.signature {
            Some(_) => {
                let verification = state
                    .peer_pk()
                    .ok_or(NetworkError::Fatal(ErrorKind::SignatureInvalid))
                    .and_then(|pk| packet::verify_data_signature(&data, pk));
                if let Err(err) = verification {
                    self.log_event(LogLevel::Info, |log| {
                        slog::info!(log, "dropped data packet"; "from" => sender.to_string(), "reason" => err.to_string())
                    });
                    return;
                }
            }
            None => {
                if state.auth_enabled() {
                    return;
                }
            }
        }

        match state.update_ack_window(data.header.seq) {
            AckOutcome::TooOld => {
                let err = NetworkError::Fatal(ErrorKind::SequenceStale);
                self.log_event(LogLevel::Verbose, |log| {
                    slog::debug!(log, "dropped data packet"; "from" => sender.to_string(), "reason" => err.to_string())
                });
                return;
            }
            AckOutcome::Duplicate => return,
            AckOutcome::Accepted | AckOutcome::AcceptedOutOfOrder => {}
        }

        state.process_peer_feedback(data.header.rseq, data.header.ack, now);
        state.touch_received(now);
        let transition = state.update_mode(now);

        if !data.payload.is_empty() {
            self.received_queue.push(ReceivedPayload { from: sender, data: data.payload });
        }

        drop(registry);

        if let Some(transition) = transition {
            match transition {
                ModeTransition::ToGood => self.emit_event(Event::GoodMode(sender)),
                ModeTransition::ToBad => self.emit_event(Event::BadMode(sender)),
            }
        }
    }

    // ---- sending helpers --------------------------------------------------------------

    fn resolve_local_keys(&self, state: &mut ConnectionState) -> KeyPair {
        if let Some(keys) = state.local_keys() {
            return keys.clone();
        }
        if let Some(keys) = self.identity_keys.lock().unwrap().as_ref() {
            let cloned = keys.clone();
            state.set_local_keys(cloned.clone());
            return cloned;
        }
        let generated = {
            let mut rng = self.rng.lock().unwrap();
            KeyPair::generate(&mut *rng)
        };
        state.set_local_keys(generated.clone());
        generated
    }

    fn send_handshake_request(
        &self,
        state: &mut ConnectionState,
        protocol_id: u32,
        with_auth: bool,
        now: Instant,
    ) {
        let identity = state.identity();
        let seq = state.commit_send(false, None, None, now);

        let body = if with_auth {
            let keys = self.resolve_local_keys(state);
            let verify_message = Utc::now().to_rfc3339().into_bytes();
            state.set_pending_verify_message(verify_message.clone());
            ConnectBody::ClientAuth { client_pk: keys.public_key(), verify_message }
        } else {
            ConnectBody::NoAuth
        };

        let header = Header {
            protocol_id,
            connection_id: 0,
            flags: PacketFlags::connect_packet(),
            seq,
            rseq: 0,
            ack: 0,
        };

        if let Ok(bytes) = packet::encode_connect(&ConnectPacket { header, body }) {
            let _ = self.send_raw(&bytes, identity);
        }
    }

    fn send_data_packet(
        &self,
        state: &mut ConnectionState,
        protocol_id: u32,
        payload: &[u8],
        checked: bool,
        resending: bool,
        now: Instant,
    ) {
        let identity = state.identity();
        let stored_payload = if checked { Some(payload.to_vec()) } else { None };
        let seq = state.commit_send(checked, stored_payload, None, now);

        let header = Header {
            protocol_id,
            connection_id: state.connection_id().unwrap_or(0),
            flags: PacketFlags { connect: false, ping: false, no_rec_chk: !checked, resending },
            seq,
            rseq: state.rseq(),
            ack: state.ack_bitfield(),
        };

        let signing_key = if state.auth_enabled() { state.local_keys() } else { None };
        match packet::encode_data(&header, payload, signing_key) {
            Ok(bytes) => {
                let _ = self.send_raw(&bytes, identity);
            }
            Err(_) => {
                self.log_event(LogLevel::Warning, |log| {
                    slog::warn!(log, "dropped outbound payload exceeding max datagram size"; "peer" => identity.to_string())
                });
            }
        }
    }

    fn send_disconnect(&self, state: &mut ConnectionState, protocol_id: u32, now: Instant) {
        let identity = state.identity();
        let header = Header {
            protocol_id,
            connection_id: state.connection_id().unwrap_or(0),
            flags: PacketFlags::request_disconnect(),
            seq: state.commit_send(false, None, None, now),
            rseq: state.rseq(),
            ack: state.ack_bitfield(),
        };

        if let Ok(bytes) = packet::encode_connect(&ConnectPacket { header, body: ConnectBody::NoAuth }) {
            let _ = self.send_raw(&bytes, identity);
        }
    }

    fn send_raw(&self, bytes: &[u8], to: ConnectionId) -> NetworkResult<()> {
        let addr = SocketAddr::V6(SocketAddrV6::new(to.addr, to.port, 0, to.scope_id));
        self.socket.send_to(bytes, addr)?;
        Ok(())
    }

    fn emit_event(&self, event: Event) {
        if self.emit_events.load(Ordering::Relaxed) {
            self.event_queue.push(event);
        }
    }

    fn log_event(&self, level: LogLevel, f: impl FnOnce(&slog::Logger)) {
        if self.log.enabled(level) {
            f(self.log.logger());
        }
    }

    fn push_intent(&self, intent: Intent) {
        self.intents.lock().unwrap().push_back(intent);
    }

    // ---- public API surface (§6) -------------------------------------------------------

    pub fn client_initiate_connection(&self, peer: ConnectionId, want_auth: bool) {
        self.push_intent(Intent::Connect { peer, want_auth, pinned_pk: None });
    }

    pub fn client_initiate_connection_pinned(
        &self,
        peer: ConnectionId,
        expected_peer_pk: [u8; crypto::PUBLIC_KEY_SIZE],
    ) {
        self.push_intent(Intent::Connect {
            peer,
            want_auth: true,
            pinned_pk: Some(expected_peer_pk),
        });
    }

    pub fn drop_connection(&self, peer: ConnectionId, drop_all_with_addr: bool) {
        self.push_intent(Intent::Disconnect { peer, drop_all_with_addr });
    }

    pub fn has_connection(&self, peer: ConnectionId) -> bool {
        self.registry.lock().unwrap().contains(&peer)
    }

    pub fn list_connected(&self) -> Vec<ConnectionId> {
        self.registry.lock().unwrap().identities().copied().collect()
    }

    pub fn queue_send(&self, peer: ConnectionId, data: Vec<u8>) {
        self.send_queue.push(OutboundPayload { to: peer, data });
    }

    #[inline]
    pub fn get_queue_send_size(&self) -> usize {
        self.send_queue.len()
    }

    pub fn get_queued_size(&self, peer: ConnectionId) -> Option<usize> {
        self.registry.lock().unwrap().get(&peer).map(|s| s.queued_send_len())
    }

    #[inline]
    pub fn get_max_queued_size() -> usize {
        crate::queue::MAX_PENDING_SEND
    }

    pub fn get_received(&self) -> Option<ReceivedPayload> {
        self.received_queue.pop()
    }

    pub fn get_event(&self) -> Option<Event> {
        self.event_queue.pop()
    }

    pub fn set_protocol_id(&self, id: u32) {
        self.protocol_id.store(id, Ordering::Relaxed);
    }

    pub fn get_protocol_id(&self) -> u32 {
        self.protocol_id.load(Ordering::Relaxed)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.log.set_level(level);
    }

    pub fn get_log_level(&self) -> LogLevel {
        self.log.level()
    }

    pub fn set_accept_new_connections(&self, enabled: bool) {
        self.accept_new_connections.store(enabled, Ordering::Relaxed);
    }

    pub fn get_accept_new_connections(&self) -> bool {
        self.accept_new_connections.load(Ordering::Relaxed)
    }

    pub fn set_emit_events(&self, enabled: bool) {
        self.emit_events.store(enabled, Ordering::Relaxed);
    }

    pub fn get_emit_events(&self) -> bool {
        self.emit_events.load(Ordering::Relaxed)
    }

    pub fn set_auth_policy(&self, policy: AuthPolicy) {
        self.auth_policy_strict.store(policy == AuthPolicy::Strict, Ordering::Relaxed);
    }

    pub fn get_auth_policy(&self) -> AuthPolicy {
        if self.auth_policy_strict.load(Ordering::Relaxed) {
            AuthPolicy::Strict
        } else {
            AuthPolicy::Fallback
        }
    }

    pub fn set_identity_keys(&self, keys: KeyPair) {
        *self.identity_keys.lock().unwrap() = Some(keys);
    }

    pub fn set_identity_keys_from_secret(&self, secret: &[u8; crypto::SECRET_KEY_SIZE]) {
        *self.identity_keys.lock().unwrap() = Some(KeyPair::from_secret(secret));
    }

    pub fn unset_identity_keys(&self) {
        *self.identity_keys.lock().unwrap() = None;
    }

    pub fn whitelist_add(&self, pk: [u8; crypto::PUBLIC_KEY_SIZE]) {
        self.whitelist.write().unwrap().insert(pk);
    }

    pub fn whitelist_has(&self, pk: &[u8; crypto::PUBLIC_KEY_SIZE]) -> bool {
        self.whitelist.read().unwrap().contains(pk)
    }

    pub fn whitelist_remove(&self, pk: &[u8; crypto::PUBLIC_KEY_SIZE]) {
        self.whitelist.write().unwrap().remove(pk);
    }

    pub fn whitelist_clear(&self) {
        self.whitelist.write().unwrap().clear();
    }
}

fn build_socket(addr: Ipv6Addr, port: u16) -> NetworkResult<(std::net::UdpSocket, u16)> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|_| NetworkError::Fatal(ErrorKind::SocketCreate))?;
    socket
        .set_only_v6(false)
        .map_err(|_| NetworkError::Fatal(ErrorKind::SocketCreate))?;

    let bind_addr: SockAddr = SocketAddrV6::new(addr, port, 0, 0).into();
    socket.bind(&bind_addr).map_err(|_| NetworkError::Fatal(ErrorKind::SocketBind))?;
    socket
        .set_nonblocking(true)
        .map_err(|_| NetworkError::Fatal(ErrorKind::SocketNonBlocking))?;

    let bound_port = socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket_ipv6())
        .map(|addr| addr.port())
        .unwrap_or(port);

    Ok((socket.into(), bound_port))
}

fn seed_from_wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_binds_and_reads_back_an_ephemeral_port() {
        let config = ContextConfig::new(Role::Server, false);
        let ctx = Context::init(Ipv6Addr::LOCALHOST, 0, config).unwrap();
        assert_ne!(ctx.local_port(), 0);
        assert!(!ctx.is_threaded());
    }

    #[test]
    fn threaded_enable_disable_is_idempotent() {
        let config = ContextConfig::new(Role::Server, false);
        let ctx = Context::init(Ipv6Addr::LOCALHOST, 0, config).unwrap();

        ctx.enable_threaded(4);
        ctx.enable_threaded(4);
        assert!(ctx.is_threaded());

        ctx.disable_threaded();
        ctx.disable_threaded();
        assert!(!ctx.is_threaded());
    }

    #[test]
    fn has_connection_is_false_until_handshake_processed() {
        let config = ContextConfig::new(Role::Client, false);
        let ctx = Context::init(Ipv6Addr::LOCALHOST, 0, config).unwrap();
        let peer = ConnectionId::from_socket(Ipv6Addr::LOCALHOST, 40000);

        ctx.client_initiate_connection(peer, false);
        assert!(!ctx.has_connection(peer));

        ctx.update();
        assert!(ctx.has_connection(peer));
    }

    #[test]
    fn whitelist_round_trips() {
        let config = ContextConfig::new(Role::Server, true);
        let ctx = Context::init(Ipv6Addr::LOCALHOST, 0, config).unwrap();
        let pk = [9u8; crypto::PUBLIC_KEY_SIZE];

        assert!(!ctx.whitelist_has(&pk));
        ctx.whitelist_add(pk);
        assert!(ctx.whitelist_has(&pk));
        ctx.whitelist_remove(&pk);
        assert!(!ctx.whitelist_has(&pk));
    }
}
