//! Command dispatch: decoded commands mutate engine state and produce
//! [`Effect`]s for the caller (who owns the connection table) to carry out.
//!
//! Dispatch functions never touch sockets directly — [`crate::session::Session`]
//! owns every [`crate::connection::Connection`] and applies the `Effect`s
//! this module returns. That keeps the command-handling rules (this file)
//! testable without a live socket.

use crate::delta_frame::DeltaFrameRing;
use crate::error::{DispatchOutcome, SessionEvent};
use crate::frame::{FrameNumber, PlayerIndex, MAX_USERS};
use crate::sync_engine::Pointers;
use crate::wire::command::{input_is_from_server, input_player, make_input_flags, mode_player};
use crate::wire::{encode, id, Command, MODE_BIT_PLAYING, MODE_BIT_YOU};

/// Which side of the star topology this engine instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The hub: authority and relay for every client.
    Server,
    /// A leaf, connected to exactly one server.
    Client,
}

/// This peer's own playing/spectating status, mirroring
/// [`crate::connection::Mode`]'s CONNECTED states but scoped to "am I
/// playing", not "is this particular link up".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfMode {
    /// Not yet assigned, or no longer assigned, a player slot.
    Spectating,
    /// Occupying `self_player`.
    Playing,
    /// No session at all (used only before `new` or after `disconnect`).
    None,
}

/// Opaque handle identifying one live connection, scoped to whatever
/// collection [`crate::session::Session`] stores its connections in.
pub type ConnId = usize;

/// An effect dispatch wants the caller to carry out, since this module
/// never holds the connection table itself.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a framed message to one connection.
    Send {
        /// Which connection.
        to: ConnId,
        /// The already-framed bytes.
        payload: Vec<u8>,
    },
    /// Send a framed message to every connection except `except` (or every
    /// connection, if `except` is `None`).
    Broadcast {
        /// Connection to skip, typically the sender.
        except: Option<ConnId>,
        /// The already-framed bytes.
        payload: Vec<u8>,
    },
    /// Hang up a connection (protocol violation, NAK, or explicit DISCONNECT).
    Hangup(ConnId),
    /// Surface an event to the host via `drain_events`.
    Emit(SessionEvent),
    /// Record that `conn`'s [`crate::connection::Connection`] now occupies
    /// `player`, mirroring the assignment just made in [`PlayerTable`].
    /// Dispatch only owns `EngineState`, not the connection table, so the
    /// caller applies this to the actual `Connection`.
    AssignPlayer {
        /// Which connection.
        conn: ConnId,
        /// The player slot it now occupies.
        player: PlayerIndex,
    },
    /// The mirror of [`Effect::AssignPlayer`] for SPECTATE.
    AssignSpectator {
        /// Which connection.
        conn: ConnId,
    },
}

/// Per-player bookkeeping that, on a client, spans multiple logical players
/// relayed over the single server connection — so it lives on the engine,
/// not on any one [`crate::connection::Connection`]: a mapping from player
/// index to `(read_ptr, read_frame_count)`.
#[derive(Debug, Clone, Copy)]
struct PlayerRead {
    read_ptr: usize,
    read_frame_count: FrameNumber,
}

/// Tracks `connected_players` plus each connected player's read pointer.
#[derive(Debug, Clone)]
pub struct PlayerTable {
    connected: [bool; MAX_USERS],
    reads: [PlayerRead; MAX_USERS],
}

impl PlayerTable {
    /// An empty table: no players connected.
    #[must_use]
    pub fn new() -> Self {
        PlayerTable {
            connected: [false; MAX_USERS],
            reads: [PlayerRead {
                read_ptr: 0,
                read_frame_count: FrameNumber::ZERO,
            }; MAX_USERS],
        }
    }

    /// Whether `player` is currently in `connected_players`.
    #[must_use]
    pub fn is_connected(&self, player: PlayerIndex) -> bool {
        self.connected[player.as_usize()]
    }

    /// Adds `player`, seeding its read pointer.
    pub fn connect(&mut self, player: PlayerIndex, ptr: usize, frame_count: FrameNumber) {
        self.connected[player.as_usize()] = true;
        self.reads[player.as_usize()] = PlayerRead {
            read_ptr: ptr,
            read_frame_count: frame_count,
        };
    }

    /// Removes `player` from `connected_players`.
    pub fn disconnect(&mut self, player: PlayerIndex) {
        self.connected[player.as_usize()] = false;
    }

    /// The read pointer/frame-count for `player`.
    #[must_use]
    pub fn read_frame_count(&self, player: PlayerIndex) -> FrameNumber {
        self.reads[player.as_usize()].read_frame_count
    }

    /// The ring slot index `player`'s next INPUT should land in.
    #[must_use]
    pub fn read_ptr(&self, player: PlayerIndex) -> usize {
        self.reads[player.as_usize()].read_ptr
    }

    /// Advances `player`'s read pointer by one accepted INPUT.
    pub fn advance(&mut self, player: PlayerIndex, next_ptr: usize) {
        let entry = &mut self.reads[player.as_usize()];
        entry.read_ptr = next_ptr;
        entry.read_frame_count += 1;
    }

    /// `(player, read_frame_count)` for every connected player, for
    /// [`crate::sync_engine::unread_frame_count`].
    #[must_use]
    pub fn connected_reads(&self) -> Vec<(PlayerIndex, FrameNumber)> {
        (0..MAX_USERS)
            .filter(|&i| self.connected[i])
            .map(|i| {
                let p = PlayerIndex::new(i as u8);
                (p, self.read_frame_count(p))
            })
            .collect()
    }

    /// All currently connected players, ascending.
    #[must_use]
    pub fn connected_players(&self) -> Vec<PlayerIndex> {
        (0..MAX_USERS)
            .filter(|&i| self.connected[i])
            .map(|i| PlayerIndex::new(i as u8))
            .collect()
    }

    /// The lowest player index not currently connected, if any.
    #[must_use]
    pub fn lowest_free(&self) -> Option<PlayerIndex> {
        (0..MAX_USERS).find(|&i| !self.connected[i]).map(|i| PlayerIndex::new(i as u8))
    }
}

impl Default for PlayerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything [`dispatch`] needs to mutate, gathered so call sites don't
/// thread a dozen `&mut` parameters — everything but the connection table
/// and callback surface, which stay on [`crate::session::Session`].
pub struct EngineState {
    /// Server or client.
    pub role: Role,
    /// This peer's own playing/spectating status.
    pub self_mode: SelfMode,
    /// This peer's own player slot, if `self_mode == Playing`.
    pub self_player: Option<PlayerIndex>,
    /// Pointer/frame-count bookkeeping.
    pub pointers: Pointers,
    /// The frame storage ring.
    pub ring: DeltaFrameRing,
    /// `connected_players` plus per-player read state.
    pub players: PlayerTable,
    /// Toggled by FLIP_PLAYERS.
    pub flip: bool,
    /// The frame at which the last flip takes effect.
    pub flip_frame: FrameNumber,
    /// Set when a rollback to `other_ptr` is due.
    pub force_rewind: bool,
    /// Connections that sent REQUEST_SAVESTATE and are owed a LOAD_SAVESTATE
    /// once the current frame finishes.
    pub pending_savestate_requests: Vec<ConnId>,
    /// How many frames of lookahead `delay_frames` permits before stalling.
    pub delay_frames: u32,
    /// How often (in frames) a CRC audit is emitted; 0 disables it.
    pub check_frames: u32,
    /// True iff this side has sent PAUSE without a matching RESUME.
    pub local_paused: bool,
    /// True iff any connection has sent PAUSE without RESUME.
    pub remote_paused: bool,
}

impl EngineState {
    /// Builds the initial state for a session with ring size `2*delay_frames+1`.
    #[must_use]
    pub fn new(role: Role, delay_frames: u32, check_frames: u32) -> Self {
        let buffer_size = 2 * delay_frames as usize + 1;
        EngineState {
            role,
            self_mode: SelfMode::Spectating,
            self_player: None,
            pointers: Pointers::new(),
            ring: DeltaFrameRing::new(buffer_size),
            players: PlayerTable::new(),
            flip: false,
            flip_frame: FrameNumber::ZERO,
            force_rewind: false,
            pending_savestate_requests: Vec::new(),
            delay_frames,
            check_frames,
            local_paused: false,
            remote_paused: false,
        }
    }
}

fn nak(reason: &'static str) -> (DispatchOutcome, Vec<Effect>) {
    (DispatchOutcome::ProtocolViolation { reason }, vec![encode_nak()])
}

fn encode_nak() -> Effect {
    // The caller substitutes the real `to`; placeholder replaced by dispatch().
    Effect::Send {
        to: usize::MAX,
        payload: encode(id::NAK, &[]),
    }
}

fn fix_nak_target(effects: Vec<Effect>, conn: ConnId) -> Vec<Effect> {
    effects
        .into_iter()
        .map(|e| match e {
            Effect::Send { to, payload } if to == usize::MAX => Effect::Send { to: conn, payload },
            other => other,
        })
        .collect()
}

/// Handles one decoded command arriving on `conn`.
///
/// `conn_player` is the player slot `conn` is assigned to, if PLAYING.
/// `last_player` is the most recent player slot `conn` has ever occupied
/// (slot 0 if never), used to acknowledge SPECTATE even when `conn_player`
/// is already `None`. Returns the dispatch outcome plus any effects the
/// caller must apply.
pub fn dispatch(
    state: &mut EngineState,
    conn: ConnId,
    conn_player: Option<PlayerIndex>,
    last_player: PlayerIndex,
    cmd: Command,
) -> (DispatchOutcome, Vec<Effect>) {
    let (outcome, effects) = dispatch_inner(state, conn, conn_player, last_player, cmd);
    (outcome, fix_nak_target(effects, conn))
}

fn dispatch_inner(
    state: &mut EngineState,
    conn: ConnId,
    conn_player: Option<PlayerIndex>,
    last_player: PlayerIndex,
    cmd: Command,
) -> (DispatchOutcome, Vec<Effect>) {
    match cmd {
        Command::Ack => (DispatchOutcome::Handled, vec![]),
        Command::Nak => (DispatchOutcome::ProtocolViolation { reason: "peer sent NAK" }, vec![]),
        Command::Disconnect => (DispatchOutcome::Handled, vec![Effect::Hangup(conn)]),
        Command::Input {
            frame,
            player_or_flags,
            state: words,
        } => dispatch_input(state, conn, conn_player, frame, player_or_flags, words),
        Command::NoInput { frame } => dispatch_noinput(state, frame),
        Command::FlipPlayers { flip_frame } => dispatch_flip_players(state, flip_frame),
        Command::Spectate => dispatch_spectate(state, conn, conn_player, last_player),
        Command::Play => dispatch_play(state, conn),
        Command::Mode { frame, flags_and_player } => dispatch_mode(state, frame, flags_and_player),
        Command::Crc { frame, crc } => dispatch_crc(state, conn, frame, crc),
        Command::RequestSavestate => {
            state.pending_savestate_requests.push(conn);
            (DispatchOutcome::Handled, vec![])
        }
        Command::LoadSavestate {
            frame,
            uncompressed_size,
            compressed,
        } => dispatch_load_savestate(state, conn, conn_player, frame, uncompressed_size, &compressed),
        Command::Pause => dispatch_pause(state, conn, true),
        Command::Resume => dispatch_pause(state, conn, false),
    }
}

fn dispatch_input(
    state: &mut EngineState,
    conn: ConnId,
    conn_player: Option<PlayerIndex>,
    frame: FrameNumber,
    player_or_flags: u32,
    words: crate::frame::InputWords,
) -> (DispatchOutcome, Vec<Effect>) {
    let player = match state.role {
        // Server ignores the wire value and trusts the connection's own slot.
        Role::Server => match conn_player {
            Some(p) => p,
            None => return nak("INPUT from a connection with no assigned player"),
        },
        Role::Client => match PlayerIndex::checked_new(input_player(player_or_flags)) {
            Some(p) => p,
            None => return nak("INPUT player index out of range"),
        },
    };

    if !state.players.is_connected(player) {
        return nak("INPUT for a player not in connected_players");
    }

    let expected = state.players.read_frame_count(player);
    if frame < expected {
        return (DispatchOutcome::DuplicateDropped, vec![]);
    }
    if frame > expected {
        return nak("INPUT arrived out of order");
    }

    let ptr = state.players.read_ptr(player);
    if !state.ring.slot_mut(ptr).set_real_input(player, words) {
        return (DispatchOutcome::DuplicateDropped, vec![]);
    }
    let next_ptr = state.ring.next_ptr(ptr);
    state.players.advance(player, next_ptr);

    if state.role == Role::Client && input_is_from_server(player_or_flags) {
        state.pointers.server_ptr = state.ring.next_ptr(state.pointers.server_ptr);
        state.pointers.server_frame_count += 1;
    }

    let mut effects = vec![];
    if state.role == Role::Server {
        let in_servers_future = i64::from(frame.as_u32()) > i64::from(state.pointers.self_frame_count.as_u32());
        if !in_servers_future {
            let payload = Command::Input {
                frame,
                player_or_flags: make_input_flags(player, false),
                state: words,
            }
            .encode_payload();
            effects.push(Effect::Broadcast {
                except: Some(conn),
                payload: encode(id::INPUT, &payload),
            });
        }
    }
    (DispatchOutcome::Handled, effects)
}

fn dispatch_noinput(state: &mut EngineState, frame: FrameNumber) -> (DispatchOutcome, Vec<Effect>) {
    if state.role != Role::Client {
        return nak("NOINPUT is server-to-client only");
    }
    if frame != state.pointers.server_frame_count {
        return nak("NOINPUT frame mismatch");
    }
    state.pointers.server_ptr = state.ring.next_ptr(state.pointers.server_ptr);
    state.pointers.server_frame_count += 1;
    (DispatchOutcome::Handled, vec![])
}

fn dispatch_flip_players(state: &mut EngineState, flip_frame: FrameNumber) -> (DispatchOutcome, Vec<Effect>) {
    if state.role != Role::Client {
        return nak("FLIP_PLAYERS is server-to-client only");
    }
    if flip_frame < state.pointers.server_frame_count {
        return nak("FLIP_PLAYERS frame is stale");
    }
    state.flip = !state.flip;
    state.flip_frame = flip_frame;
    if flip_frame < state.pointers.self_frame_count {
        state.force_rewind = true;
    }
    (DispatchOutcome::Handled, vec![])
}

fn dispatch_spectate(
    state: &mut EngineState,
    conn: ConnId,
    conn_player: Option<PlayerIndex>,
    last_player: PlayerIndex,
) -> (DispatchOutcome, Vec<Effect>) {
    if state.role != Role::Server {
        return nak("SPECTATE is client-to-server only");
    }
    let mut effects = vec![];
    if let Some(player) = conn_player {
        let frame_count = state.players.read_frame_count(player);
        state.players.disconnect(player);
        let payload = Command::Mode {
            frame: frame_count,
            flags_and_player: player.as_u32(),
        }
        .encode_payload();
        effects.push(Effect::Broadcast {
            except: Some(conn),
            payload: encode(id::MODE, &payload),
        });
        effects.push(Effect::Emit(SessionEvent::PeerDisconnected { player: Some(player) }));
    }
    // Tell the sender even if it was already spectating or never played: the
    // original netplay_cmd handler acks SPECTATE unconditionally, using
    // connection->player, which persists across a PLAYING->SPECTATING move.
    let acked_player = conn_player.unwrap_or(last_player);
    let you_payload = Command::Mode {
        frame: FrameNumber::ZERO,
        flags_and_player: MODE_BIT_YOU | acked_player.as_u32(),
    }
    .encode_payload();
    effects.push(Effect::Send {
        to: conn,
        payload: encode(id::MODE, &you_payload),
    });
    effects.push(Effect::AssignSpectator { conn });
    (DispatchOutcome::Handled, effects)
}

fn dispatch_play(state: &mut EngineState, conn: ConnId) -> (DispatchOutcome, Vec<Effect>) {
    if state.role != Role::Server {
        return nak("PLAY is client-to-server only");
    }
    let Some(player) = state.players.lowest_free() else {
        return nak("no free player slot");
    };
    let next_frame = state.pointers.self_frame_count + 1;
    let ptr = state.ring.next_ptr(state.pointers.self_ptr);
    state.players.connect(player, ptr, next_frame);

    let broadcast_payload = Command::Mode {
        frame: next_frame,
        flags_and_player: MODE_BIT_PLAYING | player.as_u32(),
    }
    .encode_payload();
    let you_payload = Command::Mode {
        frame: next_frame,
        flags_and_player: MODE_BIT_PLAYING | MODE_BIT_YOU | player.as_u32(),
    }
    .encode_payload();

    (
        DispatchOutcome::Handled,
        vec![
            Effect::Broadcast {
                except: Some(conn),
                payload: encode(id::MODE, &broadcast_payload),
            },
            Effect::Send {
                to: conn,
                payload: encode(id::MODE, &you_payload),
            },
            Effect::Emit(SessionEvent::PeerConnected { player: Some(player) }),
            Effect::AssignPlayer { conn, player },
        ],
    )
}

fn dispatch_mode(state: &mut EngineState, frame: FrameNumber, flags_and_player: u32) -> (DispatchOutcome, Vec<Effect>) {
    if state.role != Role::Client {
        return nak("MODE is server-to-client only");
    }
    let Some(player) = PlayerIndex::checked_new(mode_player(flags_and_player)) else {
        return nak("MODE player index out of range");
    };
    if frame < state.pointers.self_frame_count {
        state.force_rewind = true;
    }

    let is_you = flags_and_player & MODE_BIT_YOU != 0;
    let becoming_playing = flags_and_player & MODE_BIT_PLAYING != 0;

    if is_you {
        if becoming_playing {
            if frame != state.pointers.server_frame_count {
                return nak("MODE(YOU, PLAYING) frame mismatch with server_frame_count");
            }
            state.self_mode = SelfMode::Playing;
            state.self_player = Some(player);

            let mode_changed = Effect::Emit(SessionEvent::LocalModeChanged { player: Some(player) });
            if frame <= state.pointers.self_frame_count {
                let mut ptr = state.pointers.server_ptr;
                let mut f = state.pointers.server_frame_count;
                let mut effects = vec![mode_changed];
                while f < state.pointers.self_frame_count {
                    let self_state = state.ring.slot(ptr).self_state();
                    state.ring.slot_mut(ptr).set_real_input(player, self_state);
                    let payload = Command::Input {
                        frame: f,
                        player_or_flags: make_input_flags(player, false),
                        state: self_state,
                    }
                    .encode_payload();
                    effects.push(Effect::Broadcast {
                        except: None,
                        payload: encode(id::INPUT, &payload),
                    });
                    ptr = state.ring.next_ptr(ptr);
                    f += 1;
                }
                return (DispatchOutcome::Handled, effects);
            }

            let mut ptr = state.pointers.self_ptr;
            let mut f = state.pointers.self_frame_count;
            while f < frame {
                state.ring.slot_mut(ptr).zero_self_state();
                ptr = state.ring.next_ptr(ptr);
                f += 1;
            }
            return (DispatchOutcome::Handled, vec![mode_changed]);
        }
        if state.self_mode != SelfMode::Spectating {
            return nak("MODE(YOU, SPECTATING) while not already spectating");
        }
        state.self_mode = SelfMode::Spectating;
        state.self_player = None;
        return (
            DispatchOutcome::Handled,
            vec![Effect::Emit(SessionEvent::LocalModeChanged { player: None })],
        );
    }

    if becoming_playing {
        state.players.connect(player, state.pointers.server_ptr, state.pointers.server_frame_count);
        (
            DispatchOutcome::Handled,
            vec![Effect::Emit(SessionEvent::PeerConnected { player: Some(player) })],
        )
    } else {
        state.players.disconnect(player);
        (
            DispatchOutcome::Handled,
            vec![Effect::Emit(SessionEvent::PeerDisconnected { player: Some(player) })],
        )
    }
}

fn dispatch_crc(state: &mut EngineState, conn: ConnId, frame: FrameNumber, crc: u32) -> (DispatchOutcome, Vec<Effect>) {
    let Some(ptr) = state.ring.find_frame(state.pointers.self_ptr, frame) else {
        return (DispatchOutcome::Handled, vec![]);
    };
    if frame <= state.pointers.other_frame_count {
        let local = state.ring.slot(ptr).crc(&state.players.connected_players());
        if local != crc {
            return (
                DispatchOutcome::Handled,
                vec![Effect::Send {
                    to: conn,
                    payload: encode(id::REQUEST_SAVESTATE, &[]),
                }],
            );
        }
        (DispatchOutcome::Handled, vec![])
    } else {
        state.ring.slot_mut(ptr).park_remote_crc(conn, crc);
        (DispatchOutcome::Handled, vec![])
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_load_savestate(
    state: &mut EngineState,
    conn: ConnId,
    conn_player: Option<PlayerIndex>,
    frame: FrameNumber,
    _uncompressed_size: u32,
    compressed: &[u8],
) -> (DispatchOutcome, Vec<Effect>) {
    // `_uncompressed_size` is validated by the session against its known
    // state size, which this module doesn't have access to.
    let Some(player) = conn_player else {
        return nak("LOAD_SAVESTATE from a non-playing connection");
    };
    if frame != state.players.read_frame_count(player) {
        return nak("LOAD_SAVESTATE frame mismatch");
    }
    let ptr = state.players.read_ptr(player);
    state.ring.slot_mut(ptr).state_mut().clear();
    state.ring.slot_mut(ptr).state_mut().extend_from_slice(compressed);

    if frame > state.pointers.self_frame_count {
        state.pointers.self_frame_count = FrameNumber::new(frame.as_u32() - 1);
        state.pointers.self_ptr = state.ring.prev_ptr(ptr);
    }
    for other in state.players.connected_players() {
        if other == player {
            continue;
        }
        if frame > state.players.read_frame_count(other) {
            state.players.connect(other, ptr, frame);
        }
    }
    state.pointers.other_ptr = ptr;
    state.pointers.other_frame_count = frame;
    state.force_rewind = true;
    (DispatchOutcome::Handled, vec![Effect::Emit(SessionEvent::DesyncRecovering { frame })])
}

fn dispatch_pause(state: &mut EngineState, conn: ConnId, pause: bool) -> (DispatchOutcome, Vec<Effect>) {
    // The caller (Session) tracks per-connection paused flags and recomputes
    // `remote_paused` before calling dispatch; we only decide what to
    // broadcast. PAUSE always forwards immediately; RESUME only forwards once
    // every connection (and the local side) has cleared its pause.
    if !pause && (state.remote_paused || state.local_paused) {
        return (DispatchOutcome::Handled, vec![]);
    }
    let cmd_id = if pause { id::PAUSE } else { id::RESUME };
    (
        DispatchOutcome::Handled,
        vec![Effect::Broadcast {
            except: Some(conn),
            payload: encode(cmd_id, &[]),
        }],
    )
}
