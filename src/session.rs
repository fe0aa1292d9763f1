//! The `Session` facade: the single entry point a host drives once per
//! frame, owning the connection table, the engine state, and the callback
//! surface into the emulator core.
//!
//! Everything below this module is pure or transport-agnostic; `Session` is
//! where sockets, the dispatcher, the sync engine, and the delta-frame ring
//! actually meet.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};

use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Mode};
use crate::dispatcher::{self, ConnId, Effect, EngineState, Role, SelfMode};
use crate::error::{DispatchOutcome, NetplayError, SessionEvent};
use crate::frame::{FrameNumber, InputWords, PlayerIndex, MAX_NICK_LEN, MAX_PASSWORD_LEN};
use crate::socket_buffer::SocketBuffer;
use crate::sync_engine::{self, StallTracker};
use crate::wire::command::make_input_flags;
use crate::wire::{decode_header, encode, id, Command, HEADER_LEN};

/// Engine-internal bits the host core may not implement correctly yet, or
/// never will.
pub mod quirks {
    /// The core cannot save/load state at all; rollback degrades to pure
    /// input-delay (the engine never attempts a rewind).
    pub const NO_SAVESTATES: u32 = 1 << 0;
    /// `core_serialize_size` is unknown until the core has run a few frames.
    pub const INITIALIZATION: u32 = 1 << 1;
    /// Saved state is byte-order dependent; never exchanged cross-endian.
    pub const ENDIAN_DEPENDENT: u32 = 1 << 2;
    /// Saved state is only meaningful on an identical host platform.
    pub const PLATFORM_DEPENDENT: u32 = 1 << 3;
    /// The core's state must never cross the wire at all.
    pub const NO_TRANSMISSION: u32 = 1 << 4;
}

/// The callback surface the session calls into once per frame.
///
/// Implemented by the host embedding the engine; everything the emulator
/// core itself does (actually running, actually serializing) is opaque
/// beyond this trait.
pub trait NetplayCallbacks {
    /// Runs the emulator core forward exactly one frame, consuming whatever
    /// input is currently resident for this frame.
    fn core_run(&mut self);

    /// Serializes the core's full state into `buf` (cleared first).
    /// Returns `false` on a transient failure (e.g. quirk
    /// [`quirks::INITIALIZATION`] and the core hasn't finished booting);
    /// the caller retries on a later frame rather than treating it as fatal.
    fn core_serialize(&mut self, buf: &mut Vec<u8>) -> bool;

    /// Restores the core's full state from `buf`.
    fn core_deserialize(&mut self, buf: &[u8]);

    /// The local controller input for the frame about to be simulated.
    fn poll_input(&mut self) -> InputWords;

    /// Compresses a savestate buffer before it goes out on the wire.
    fn compress(&mut self, input: &[u8]) -> Vec<u8>;

    /// Decompresses a savestate buffer received over the wire.
    fn decompress(&mut self, input: &[u8]) -> Vec<u8>;
}

/// Construction-time parameters for [`Session::new_server`]/[`Session::new_client`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This peer's own nickname, exchanged during the handshake.
    pub nick: String,
    /// Shared cleartext password; empty disables the PRE_PASSWORD phase.
    pub password: String,
    /// How many frames of input delay to absorb before stalling.
    pub delay_frames: u32,
    /// How often (in frames) to emit a CRC audit; `0` disables it.
    pub check_frames: u32,
    /// [`quirks`] bitset describing what the embedded core can and can't do.
    pub quirks: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            nick: String::new(),
            password: String::new(),
            delay_frames: 0,
            check_frames: 0,
            quirks: 0,
        }
    }
}

/// Reserved, engine-internal command ids used only during the handshake
/// phase, kept out of [`crate::wire::command`]'s table since the exact
/// credential exchange format is otherwise left to the host.
mod handshake_id {
    pub const NICK: u32 = 0xff00;
    pub const PASSWORD: u32 = 0xff01;
}

/// The star-topology session facade: one server instance talks to many
/// client connections, one client instance talks to exactly one server
/// connection, but both drive the same `pre_frame`/`post_frame` loop.
pub struct Session<C: NetplayCallbacks> {
    role: Role,
    nick: String,
    password: String,
    delay_frames: u32,
    check_frames: u32,
    quirks: u32,
    state: EngineState,
    connections: Vec<Connection<TcpStream>>,
    listener: Option<TcpListener>,
    callbacks: C,
    events: VecDeque<SessionEvent>,
    stall: StallTracker,
    state_size: Option<usize>,
}

impl<C: NetplayCallbacks> Session<C> {
    /// Starts a server: binds `port` (use [`crate::frame::DEFAULT_PORT`]
    /// unless the host has a reason to pick another) and accepts client
    /// connections from every subsequent `pre_frame` call.
    pub fn new_server(port: u16, config: SessionConfig, callbacks: C) -> Result<Self, NetplayError> {
        Self::validate_config(&config)?;
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!(port, "netplay server listening");
        Ok(Session {
            role: Role::Server,
            nick: config.nick,
            password: config.password,
            delay_frames: config.delay_frames,
            check_frames: config.check_frames,
            quirks: config.quirks,
            state: EngineState::new(Role::Server, config.delay_frames, config.check_frames),
            connections: Vec::new(),
            listener: Some(listener),
            callbacks,
            events: VecDeque::new(),
            stall: StallTracker::new(),
            state_size: None,
        })
    }

    /// Connects to a server at `host:port` and begins its handshake
    /// immediately (nick, then password if configured).
    pub fn new_client(host: &str, port: u16, config: SessionConfig, callbacks: C) -> Result<Self, NetplayError> {
        Self::validate_config(&config)?;
        let stream = TcpStream::connect((host, port))?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let mut conn = Connection::new(stream);
        conn.queue_send(&encode(handshake_id::NICK, config.nick.as_bytes()));
        if !config.password.is_empty() {
            conn.queue_send(&encode(handshake_id::PASSWORD, config.password.as_bytes()));
        }
        conn.advance_handshake(Mode::PreNick);
        conn.advance_handshake(Mode::PreSync);
        conn.flush_send(true)?;
        info!(host, port, "connecting to netplay server");
        Ok(Session {
            role: Role::Client,
            nick: config.nick,
            password: config.password,
            delay_frames: config.delay_frames,
            check_frames: config.check_frames,
            quirks: config.quirks,
            state: EngineState::new(Role::Client, config.delay_frames, config.check_frames),
            connections: vec![conn],
            listener: None,
            callbacks,
            events: VecDeque::new(),
            stall: StallTracker::new(),
            state_size: None,
        })
    }

    fn validate_config(config: &SessionConfig) -> Result<(), NetplayError> {
        if config.nick.len() > MAX_NICK_LEN {
            return Err(NetplayError::NickTooLong { len: config.nick.len() });
        }
        if config.password.len() > MAX_PASSWORD_LEN {
            return Err(NetplayError::PasswordTooLong { len: config.password.len() });
        }
        Ok(())
    }

    /// Releases every connection. Rust's ownership already tears everything
    /// down when a `Session` is dropped; this exists so the API reads the
    /// same as an explicit free/destroy call.
    pub fn free(self) {}

    /// Drains and returns every [`SessionEvent`] queued since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// The player slot this peer itself occupies, or `None` if spectating.
    #[must_use]
    pub fn self_player(&self) -> Option<PlayerIndex> {
        self.state.self_player
    }

    /// Whether this peer itself is playing rather than spectating.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state.self_mode == SelfMode::Playing
    }

    /// Read-only access to the engine's rollback bookkeeping: pointers, the
    /// delta-frame ring, and the player table. Mainly useful for hosts (and
    /// tests) that want to inspect exactly what was predicted or resimulated
    /// for a given frame.
    #[must_use]
    pub fn engine_state(&self) -> &EngineState {
        &self.state
    }

    /// Server only: swaps which connected player is "player 0" going
    /// forward, effective one frame from now.
    pub fn flip_players(&mut self) {
        if self.role != Role::Server {
            return;
        }
        let flip_frame = self.state.pointers.self_frame_count + 1;
        let payload = Command::FlipPlayers { flip_frame }.encode_payload();
        let framed = encode(id::FLIP_PLAYERS, &payload);
        for conn in &mut self.connections {
            if conn.active() {
                conn.queue_send(&framed);
            }
        }
    }

    /// Client only: asks the server to put this peer in a player slot. The
    /// server replies with MODE once the request is granted, or NAK if no
    /// slot is free.
    pub fn request_play(&mut self) {
        if self.role != Role::Client {
            return;
        }
        self.connections[0].queue_send(&encode(id::PLAY, &[]));
    }

    /// Client only: asks the server to move this peer to spectator mode.
    pub fn request_spectate(&mut self) {
        if self.role != Role::Client {
            return;
        }
        self.connections[0].queue_send(&encode(id::SPECTATE, &[]));
    }

    /// Marks this side paused and broadcasts PAUSE to every connection
    /// immediately. A no-op if already paused.
    pub fn pause(&mut self) {
        if self.state.local_paused {
            return;
        }
        self.state.local_paused = true;
        let framed = encode(id::PAUSE, &[]);
        for conn in &mut self.connections {
            if conn.active() {
                conn.queue_send(&framed);
            }
        }
    }

    /// Clears this side's pause flag and, if no connection is still paused,
    /// broadcasts RESUME. RESUME only goes out once no connection is paused
    /// and the local side is not paused either.
    pub fn resume(&mut self) {
        if !self.state.local_paused {
            return;
        }
        self.state.local_paused = false;
        if self.state.remote_paused {
            return;
        }
        let framed = encode(id::RESUME, &[]);
        for conn in &mut self.connections {
            if conn.active() {
                conn.queue_send(&framed);
            }
        }
    }

    /// Hangs up every connection, on either side of the topology.
    pub fn disconnect(&mut self) {
        let framed = encode(id::DISCONNECT, &[]);
        for idx in 0..self.connections.len() {
            if self.connections[idx].active() {
                self.connections[idx].queue_send(&framed);
                let _ = self.connections[idx].flush_send(false);
            }
        }
        for idx in 0..self.connections.len() {
            self.hangup(idx);
        }
        self.state.self_mode = SelfMode::None;
    }

    /// Step 1 of the per-frame loop: accept new connections (server), and
    /// ensure the current ring slot holds a saved state and the locally
    /// captured input.
    pub fn pre_frame(&mut self) -> Result<(), NetplayError> {
        if self.role == Role::Server {
            self.accept_incoming()?;
        }

        let ptr = self.state.pointers.self_ptr;
        let frame = self.state.pointers.self_frame_count;
        self.capture_state_into(ptr, frame);

        let input = self.callbacks.poll_input();
        self.state.ring.slot_mut(ptr).set_self_state(input);
        Ok(())
    }

    /// Captures `core_serialize` into `ptr`/`frame`, spinning the core
    /// forward up to 60 times first if quirk [`quirks::INITIALIZATION`] is
    /// set and the state size is still unknown.
    fn capture_state_into(&mut self, ptr: usize, frame: FrameNumber) {
        self.state.ring.ready(ptr, frame);
        if self.quirks & quirks::INITIALIZATION != 0 && self.state_size.is_none() {
            for _ in 0..60 {
                let mut probe = Vec::new();
                if self.callbacks.core_serialize(&mut probe) {
                    self.state_size = Some(probe.len());
                    *self.state.ring.slot_mut(ptr).state_mut() = probe;
                    return;
                }
                self.callbacks.core_run();
            }
            warn!("core never became serializable after 60 initialization steps");
            return;
        }
        let mut buf = Vec::new();
        if self.callbacks.core_serialize(&mut buf) {
            if self.state_size.is_none() {
                self.state_size = Some(buf.len());
            }
            *self.state.ring.slot_mut(ptr).state_mut() = buf;
        }
    }

    /// Steps 2-6 of the per-frame loop: drain the network, stall if the
    /// delay window is exceeded, simulate and run one frame, handle any
    /// pending rollback, and emit a periodic CRC audit.
    pub fn post_frame(&mut self) -> Result<(), NetplayError> {
        self.drain(false)?;

        loop {
            let reads = self.state.players.connected_reads();
            let unread = sync_engine::unread_frame_count(&reads, self.state.pointers.server_frame_count);
            self.state.pointers.unread_frame_count = unread;
            if !sync_engine::should_stall(self.state.pointers.self_frame_count, unread, self.delay_frames) {
                self.stall.reset();
                break;
            }
            if self.state.remote_paused {
                self.drain(true)?;
                continue;
            }
            trace!(frame = %self.state.pointers.self_frame_count, "stalling");
            match self.stall.retry(self.state.pointers.self_frame_count) {
                Ok(()) => self.drain(true)?,
                Err(e) => {
                    warn!(error = %e, "stall exhausted");
                    return Err(e);
                }
            }
        }

        self.simulate_and_advance();

        if self.state.force_rewind {
            self.rewind();
        }

        if self.check_frames > 0 && self.state.pointers.self_frame_count.as_u32() % self.check_frames == 0 {
            self.emit_crc();
        }

        if !self.state.pending_savestate_requests.is_empty() {
            let requesters: Vec<ConnId> = std::mem::take(&mut self.state.pending_savestate_requests);
            for conn in requesters {
                self.send_savestate(conn);
            }
        }

        for idx in 0..self.connections.len() {
            if self.connections[idx].active() {
                let _ = self.connections[idx].flush_send(false);
            }
        }

        Ok(())
    }

    /// Simulates one frame: predicts any still-missing input for connected
    /// players, runs the core, emits this frame's input to the network, and
    /// advances `self_ptr`/`self_frame_count` plus `other_ptr` (if the frame
    /// just simulated turned out fully real).
    fn simulate_and_advance(&mut self) {
        let ptr = self.state.pointers.self_ptr;
        let connected = self.state.players.connected_players();
        self.predict_missing_input(ptr, &connected);
        self.callbacks.core_run();
        self.broadcast_cur_input();

        self.state.pointers.self_ptr = self.state.ring.next_ptr(ptr);
        self.state.pointers.self_frame_count += 1;

        let fully_real = sync_engine::slot_is_fully_real(&self.state.ring, ptr, &connected);
        sync_engine::advance_other_if_fully_real(&mut self.state.pointers, &self.state.ring, fully_real);
        if fully_real {
            if let Some(conn) = sync_engine::resolve_parked_crc(&mut self.state.ring, ptr, &connected) {
                self.request_savestate_from(conn);
            }
        }
    }

    /// Sends REQUEST_SAVESTATE to `conn` only, used when a parked CRC audit
    /// turns out to mismatch once resimulation reaches it — the peer that
    /// reported the mismatching CRC is the one that needs to reload, not
    /// every connection.
    fn request_savestate_from(&mut self, conn: ConnId) {
        warn!(%conn, "parked CRC mismatch detected on resimulation, requesting savestate");
        if let Some(connection) = self.connections.get_mut(conn) {
            if connection.active() {
                connection.queue_send(&encode(id::REQUEST_SAVESTATE, &[]));
            }
        }
    }

    fn predict_missing_input(&mut self, ptr: usize, connected: &[PlayerIndex]) {
        let prev_ptr = self.state.ring.prev_ptr(ptr);
        for player in connected {
            if self.state.ring.slot(ptr).have_real(*player) {
                continue;
            }
            let previous = *self.state.ring.slot(prev_ptr).effective_input(*player);
            let already = self.state.ring.slot(ptr).was_simulated(*player);
            self.state.ring.slot_mut(ptr).simulate_input(*player, &previous, already);
            self.state.ring.slot_mut(ptr).mark_simulated(*player);
        }
    }

    /// Rewinds to `other_ptr`/`other_frame_count` and silently re-runs
    /// `simulate_and_advance` until `self_frame_count` catches back up to
    /// where it was before the rollback was triggered.
    fn rewind(&mut self) {
        let target = self.state.pointers.self_frame_count;
        let restore_ptr = sync_engine::begin_rewind(&mut self.state.pointers);
        self.state.force_rewind = false;
        let state_bytes = self.state.ring.slot(restore_ptr).state().to_vec();
        self.callbacks.core_deserialize(&state_bytes);
        debug!(target = %target, restored_from = %self.state.pointers.self_frame_count, "rolling back");

        while self.state.pointers.self_frame_count < target {
            let ptr = self.state.pointers.self_ptr;
            let frame = self.state.pointers.self_frame_count;
            self.capture_state_into(ptr, frame);
            let connected = self.state.players.connected_players();
            self.predict_missing_input(ptr, &connected);
            self.callbacks.core_run();
            self.state.pointers.self_ptr = self.state.ring.next_ptr(ptr);
            self.state.pointers.self_frame_count += 1;
            let fully_real = sync_engine::slot_is_fully_real(&self.state.ring, ptr, &connected);
            sync_engine::advance_other_if_fully_real(&mut self.state.pointers, &self.state.ring, fully_real);
            if fully_real {
                if let Some(conn) = sync_engine::resolve_parked_crc(&mut self.state.ring, ptr, &connected) {
                    self.request_savestate_from(conn);
                }
            }
        }
    }

    fn emit_crc(&mut self) {
        let ptr = self.state.ring.prev_ptr(self.state.pointers.self_ptr);
        let frame = FrameNumber::new(self.state.pointers.self_frame_count.as_u32() - 1);
        let crc = self.state.ring.slot(ptr).crc(&self.state.players.connected_players());
        trace!(%frame, crc, "emitting CRC audit");
        let payload = Command::Crc { frame, crc }.encode_payload();
        let framed = encode(id::CRC, &payload);
        for conn in &mut self.connections {
            if conn.active() {
                conn.queue_send(&framed);
            }
        }
    }

    fn send_savestate(&mut self, conn: ConnId) {
        if !self.connections[conn].active() {
            return;
        }
        let ptr = self.state.pointers.self_ptr;
        let frame = self.state.pointers.self_frame_count;
        let raw = self.state.ring.slot(ptr).state().to_vec();
        let compressed = self.callbacks.compress(&raw);
        let payload = Command::LoadSavestate {
            frame,
            uncompressed_size: raw.len() as u32,
            compressed,
        }
        .encode_payload();
        debug!(conn, %frame, "sending savestate recovery");
        self.connections[conn].queue_send(&encode(id::LOAD_SAVESTATE, &payload));
    }

    /// Broadcasts this frame's INPUT (or NOINPUT) records to every connected
    /// peer.
    fn broadcast_cur_input(&mut self) {
        if self.role == Role::Server {
            for idx in 0..self.connections.len() {
                if self.connections[idx].active() && self.connections[idx].mode().is_connected() {
                    self.send_cur_input_to(idx);
                }
            }
        }

        if self.state.self_mode == SelfMode::Playing {
            if let Some(player) = self.state.self_player {
                let ptr = self.state.pointers.self_ptr;
                let self_state = self.state.ring.slot(ptr).self_state();
                let payload = Command::Input {
                    frame: self.state.pointers.self_frame_count,
                    player_or_flags: make_input_flags(player, self.role == Role::Server),
                    state: self_state,
                }
                .encode_payload();
                let framed = encode(id::INPUT, &payload);
                for conn in &mut self.connections {
                    if conn.active() && conn.mode().is_connected() {
                        conn.queue_send(&framed);
                    }
                }
            }
        }
    }

    /// Server only: `send_cur_input(conn)` for a single connection. Relays
    /// every other connected player's real input at the current frame, then
    /// NOINPUT if the server itself isn't playing. Used both by
    /// [`Session::broadcast_cur_input`] each frame and immediately upon a
    /// connection completing its handshake.
    fn send_cur_input_to(&mut self, idx: ConnId) {
        let ptr = self.state.pointers.self_ptr;
        let frame = self.state.pointers.self_frame_count;
        let connected = self.state.players.connected_players();
        let conn_player = self.connections[idx].player();
        for player in &connected {
            if Some(*player) == conn_player {
                continue;
            }
            if let Some(input) = self.state.ring.slot(ptr).real_input(*player) {
                let payload = Command::Input {
                    frame,
                    player_or_flags: make_input_flags(*player, false),
                    state: *input,
                }
                .encode_payload();
                self.connections[idx].queue_send(&encode(id::INPUT, &payload));
            }
        }
        if self.state.self_mode != SelfMode::Playing {
            let payload = Command::NoInput { frame }.encode_payload();
            self.connections[idx].queue_send(&encode(id::NOINPUT, &payload));
        }
    }

    fn accept_incoming(&mut self) -> Result<(), NetplayError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    let mut conn = Connection::new(stream);
                    conn.advance_handshake(Mode::PreNick);
                    self.connections.push(conn);
                    debug!(%addr, "accepted connection");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pulls and processes every complete command currently buffered on
    /// every active connection. `blocking` only affects outgoing flushes
    /// (used from the stall loop, never while parsing).
    fn drain(&mut self, blocking: bool) -> Result<(), NetplayError> {
        if self.role == Role::Server {
            self.accept_incoming()?;
        }
        for idx in 0..self.connections.len() {
            if !self.connections[idx].active() {
                continue;
            }
            if let Err(e) = self.connections[idx].fill_recv() {
                if e.kind() != ErrorKind::WouldBlock {
                    self.hangup(idx);
                    continue;
                }
            }
            self.poll_connection(idx);
            if self.connections[idx].active() {
                let _ = self.connections[idx].flush_send(blocking);
            }
        }
        Ok(())
    }

    fn poll_connection(&mut self, idx: ConnId) {
        loop {
            if !self.connections[idx].active() {
                return;
            }
            let Some((cmd, payload)) = try_decode_envelope(self.connections[idx].recv_buf()) else {
                return;
            };
            let mode = self.connections[idx].mode();
            if mode.is_handshaking() {
                self.handle_handshake(idx, mode, cmd, &payload);
                continue;
            }
            match Command::decode(cmd, &payload) {
                Ok(Command::LoadSavestate { frame, uncompressed_size, compressed }) if self.role == Role::Client => {
                    self.apply_recovery_savestate(idx, frame, uncompressed_size, &compressed);
                }
                Ok(command) => self.dispatch_connected(idx, command),
                Err(reason) => {
                    trace!(conn = idx, reason, "protocol violation, hanging up");
                    self.hangup(idx);
                }
            }
        }
    }

    fn dispatch_connected(&mut self, idx: ConnId, command: Command) {
        if matches!(command, Command::Pause | Command::Resume) {
            let pause = matches!(command, Command::Pause);
            self.connections[idx].set_paused(pause);
            self.state.remote_paused = self.connections.iter().any(|conn| conn.paused());
        }
        let conn_player = self.connections[idx].player();
        let last_player = self.connections[idx].last_player();
        let (outcome, effects) = dispatcher::dispatch(&mut self.state, idx, conn_player, last_player, command);
        self.apply_effects(effects);
        if matches!(outcome, DispatchOutcome::ProtocolViolation { .. }) {
            self.hangup(idx);
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, payload } => {
                    if self.connections[to].active() {
                        self.connections[to].queue_send(&payload);
                    }
                }
                Effect::Broadcast { except, payload } => {
                    for (i, conn) in self.connections.iter_mut().enumerate() {
                        if Some(i) != except && conn.active() {
                            conn.queue_send(&payload);
                        }
                    }
                }
                Effect::Hangup(idx) => self.hangup(idx),
                Effect::Emit(event) => self.events.push_back(event),
                Effect::AssignPlayer { conn, player } => {
                    if self.connections[conn].active() {
                        self.connections[conn].assign_player(player);
                    }
                }
                Effect::AssignSpectator { conn } => {
                    if self.connections[conn].active() {
                        self.connections[conn].assign_spectator();
                    }
                }
            }
        }
    }

    fn hangup(&mut self, idx: ConnId) {
        if !self.connections[idx].active() {
            return;
        }
        let freed = self.connections[idx].hangup();
        if let Some(player) = freed {
            self.state.players.disconnect(player);
        }
        info!(conn = idx, player = ?freed, "connection hung up");
        self.events.push_back(SessionEvent::PeerDisconnected { player: freed });
        if self.role == Role::Client {
            self.state.self_mode = SelfMode::None;
            self.events.push_back(SessionEvent::LocalDisconnected);
        }
    }

    fn handle_handshake(&mut self, idx: ConnId, mode: Mode, cmd: u32, payload: &[u8]) {
        match (mode, cmd) {
            (Mode::PreNick, handshake_id::NICK) => {
                if payload.len() > MAX_NICK_LEN {
                    self.hangup(idx);
                    return;
                }
                let nick = String::from_utf8_lossy(payload).into_owned();
                self.connections[idx].set_nick(nick);
                if self.password.is_empty() {
                    self.connections[idx].advance_handshake(Mode::PreSync);
                    self.begin_state_transfer(idx);
                } else {
                    self.connections[idx].advance_handshake(Mode::PrePassword);
                }
            }
            (Mode::PrePassword, handshake_id::PASSWORD) => {
                if payload.len() > MAX_PASSWORD_LEN {
                    self.hangup(idx);
                    return;
                }
                let password = String::from_utf8_lossy(payload).into_owned();
                if password != self.password {
                    warn!(conn = idx, "password mismatch during handshake");
                    self.connections[idx].queue_send(&encode(id::NAK, &[]));
                    let _ = self.connections[idx].flush_send(true);
                    self.hangup(idx);
                    return;
                }
                self.connections[idx].advance_handshake(Mode::PreSync);
                self.begin_state_transfer(idx);
            }
            (Mode::PreSync, cmd) if cmd == id::LOAD_SAVESTATE => {
                if let Ok(Command::LoadSavestate { frame, uncompressed_size, compressed }) = Command::decode(cmd, payload) {
                    self.apply_initial_savestate(idx, frame, uncompressed_size, &compressed);
                } else {
                    self.hangup(idx);
                }
            }
            _ => {
                warn!(conn = idx, cmd, ?mode, "unexpected command during handshake");
                self.hangup(idx);
            }
        }
    }

    /// Server side: sends the peer its initial savestate, completing the
    /// sender's half of the PRE_SYNC -> SPECTATING transition immediately
    /// (the receiver transitions once it applies the state).
    fn begin_state_transfer(&mut self, idx: ConnId) {
        let ptr = self.state.pointers.self_ptr;
        let frame = self.state.pointers.self_frame_count;
        let raw = self.state.ring.slot(ptr).state().to_vec();
        let compressed = self.callbacks.compress(&raw);
        let payload = Command::LoadSavestate {
            frame,
            uncompressed_size: raw.len() as u32,
            compressed,
        }
        .encode_payload();
        self.connections[idx].queue_send(&encode(id::LOAD_SAVESTATE, &payload));
        let _ = self.connections[idx].flush_send(true);
        self.connections[idx].advance_handshake(Mode::Spectating);
        self.send_cur_input_to(idx);
        let _ = self.connections[idx].flush_send(true);
        info!(conn = idx, nick = self.connections[idx].nick(), "peer synced as spectator");
        self.events.push_back(SessionEvent::PeerConnected { player: None });
    }

    /// Client side: applies the server's initial savestate and completes
    /// its own PRE_SYNC -> SPECTATING transition. Rejects (NAKs and hangs
    /// up) if the decompressed payload doesn't match `uncompressed_size`,
    /// rather than loading a truncated or oversized buffer into the core.
    fn apply_initial_savestate(&mut self, idx: ConnId, frame: FrameNumber, uncompressed_size: u32, compressed: &[u8]) {
        let raw = self.callbacks.decompress(compressed);
        if raw.len() != uncompressed_size as usize {
            warn!(
                conn = idx,
                expected = uncompressed_size,
                actual = raw.len(),
                "initial savestate size mismatch, rejecting"
            );
            self.connections[idx].queue_send(&encode(id::NAK, &[]));
            let _ = self.connections[idx].flush_send(true);
            self.hangup(idx);
            return;
        }
        self.callbacks.core_deserialize(&raw);
        self.state_size = Some(raw.len());
        let ptr = 0;
        self.state.ring.ready(ptr, frame);
        *self.state.ring.slot_mut(ptr).state_mut() = raw;
        self.state.pointers.self_ptr = ptr;
        self.state.pointers.self_frame_count = frame;
        self.state.pointers.other_ptr = ptr;
        self.state.pointers.other_frame_count = frame;
        self.state.pointers.server_ptr = ptr;
        self.state.pointers.server_frame_count = frame;
        self.connections[idx].advance_handshake(Mode::Spectating);
        info!(%frame, "synced initial state from server");
    }

    /// Client side: applies a CRC-divergence recovery savestate pushed by
    /// the server outside the handshake. Rejects (NAKs and hangs up) if the
    /// decompressed payload doesn't match `uncompressed_size`, rather than
    /// loading a truncated or oversized buffer into the core.
    fn apply_recovery_savestate(&mut self, idx: ConnId, frame: FrameNumber, uncompressed_size: u32, compressed: &[u8]) {
        let raw = self.callbacks.decompress(compressed);
        if raw.len() != uncompressed_size as usize {
            warn!(
                conn = idx,
                expected = uncompressed_size,
                actual = raw.len(),
                "recovery savestate size mismatch, rejecting"
            );
            self.connections[idx].queue_send(&encode(id::NAK, &[]));
            let _ = self.connections[idx].flush_send(true);
            self.hangup(idx);
            return;
        }
        self.callbacks.core_deserialize(&raw);
        let ptr = self
            .state
            .ring
            .find_frame(self.state.pointers.self_ptr, frame)
            .unwrap_or(self.state.pointers.self_ptr);
        self.state.ring.ready(ptr, frame);
        *self.state.ring.slot_mut(ptr).state_mut() = raw;
        self.state.pointers.self_frame_count = frame;
        self.state.pointers.self_ptr = ptr;
        self.state.pointers.other_ptr = ptr;
        self.state.pointers.other_frame_count = frame;
        self.state.force_rewind = false;
        info!(%frame, "applied desync recovery savestate");
        self.events.push_back(SessionEvent::DesyncRecovering { frame });
    }
}

/// Peeks one full envelope (header + payload) out of `buf` without
/// consuming it until the whole thing has arrived, then flushes it.
fn try_decode_envelope(buf: &mut SocketBuffer) -> Option<(u32, Vec<u8>)> {
    let header_bytes = buf.peek(HEADER_LEN)?;
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&header_bytes);
    let (cmd, size) = decode_header(&header);
    let total = HEADER_LEN + size as usize;
    let full = buf.peek(total)?;
    buf.recv_flush(total);
    Some((cmd, full[HEADER_LEN..].to_vec()))
}
