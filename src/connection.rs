//! Per-peer connection: handshake state machine plus its socket buffers.

use std::io::{Read, Write};

use crate::frame::PlayerIndex;
use crate::socket_buffer::SocketBuffer;

/// Connection FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Just accepted/connected; no handshake traffic processed yet.
    Init,
    /// Waiting for the peer's nick.
    PreNick,
    /// Waiting for the shared password (only reached if one is configured).
    PrePassword,
    /// Waiting for the initial state transfer to complete.
    PreSync,
    /// Handshake complete, not occupying a player slot.
    Spectating,
    /// Handshake complete, occupying `player`.
    Playing,
    /// Terminal: the connection is closed and must not be reused.
    None,
}

impl Mode {
    /// Whether this mode is one of the INIT/PRE_* handshake phases, in
    /// which only handshake commands are legal.
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        matches!(self, Mode::Init | Mode::PreNick | Mode::PrePassword | Mode::PreSync)
    }

    /// Whether the connection has completed its handshake (spectating or playing).
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Mode::Spectating | Mode::Playing)
    }
}

/// One peer link: the server holds many, a client holds exactly one
/// (to the server).
pub struct Connection<S> {
    stream: S,
    active: bool,
    mode: Mode,
    player: Option<PlayerIndex>,
    /// The most recent player slot this connection occupied, retained across
    /// a PLAYING->SPECTATING transition the way the original `connection->player`
    /// field is never reset — so a spectate acknowledgement can still name the
    /// player the sender used to be, or the default slot 0 if it never played.
    last_player: PlayerIndex,
    paused: bool,
    nick: String,
    send_buf: SocketBuffer,
    recv_buf: SocketBuffer,
}

impl<S> Connection<S>
where
    S: Read + Write,
{
    /// Wraps a freshly accepted/connected stream in `Mode::Init`.
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            active: true,
            mode: Mode::Init,
            player: None,
            last_player: PlayerIndex::new(0),
            paused: false,
            nick: String::new(),
            send_buf: SocketBuffer::new(),
            recv_buf: SocketBuffer::new(),
        }
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn active(&self) -> bool {
        self.active
    }

    /// Current FSM state.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The assigned player slot, if `mode() == Playing`.
    #[must_use]
    pub fn player(&self) -> Option<PlayerIndex> {
        self.player
    }

    /// The most recent player slot this connection occupied, or slot 0 if it
    /// never played. Unlike [`Connection::player`], this survives a
    /// PLAYING->SPECTATING transition, so a sender can always be told which
    /// player it used to be (or still defaults to) in a MODE(YOU) reply.
    #[must_use]
    pub fn last_player(&self) -> PlayerIndex {
        self.last_player
    }

    /// Whether this connection has sent PAUSE without a matching RESUME.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Sets the pause flag.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// The peer's nickname, once received.
    #[must_use]
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Records the peer's nickname during handshake.
    pub fn set_nick(&mut self, nick: String) {
        self.nick = nick;
    }

    /// Pulls newly arrived bytes from the underlying stream into the recv ring.
    pub fn fill_recv(&mut self) -> std::io::Result<()> {
        self.recv_buf.fill_from(&mut self.stream)
    }

    /// Shared access to the recv ring, for the dispatcher to parse commands from.
    pub fn recv_buf(&mut self) -> &mut SocketBuffer {
        &mut self.recv_buf
    }

    /// Queues an already-framed command for sending.
    pub fn queue_send(&mut self, framed: &[u8]) {
        self.send_buf.send(framed);
    }

    /// Flushes queued sends to the socket. `blocking=true` is only used from
    /// the stall loop.
    pub fn flush_send(&mut self, blocking: bool) -> std::io::Result<()> {
        self.send_buf.send_flush(&mut self.stream, blocking)
    }

    /// Advances the handshake. Returns the new mode.
    pub fn advance_handshake(&mut self, next: Mode) -> Mode {
        debug_assert!(
            self.mode.is_handshaking() || matches!(self.mode, Mode::Spectating | Mode::Playing),
            "cannot advance handshake from a terminal connection"
        );
        self.mode = next;
        self.mode
    }

    /// Transitions into PLAYING and records the assigned player.
    pub fn assign_player(&mut self, player: PlayerIndex) {
        self.mode = Mode::Playing;
        self.player = Some(player);
        self.last_player = player;
    }

    /// Transitions into SPECTATING and releases any assigned player.
    pub fn assign_spectator(&mut self) {
        self.mode = Mode::Spectating;
        self.player = None;
    }

    /// Closes the connection: the socket is considered gone, mode becomes
    /// terminal, and any assigned player slot is released by returning it
    /// to the caller.
    pub fn hangup(&mut self) -> Option<PlayerIndex> {
        self.active = false;
        self.mode = Mode::None;
        self.player.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn dummy() -> Connection<Cursor<Vec<u8>>> {
        Connection::new(Cursor::new(Vec::new()))
    }

    #[test]
    fn a_fresh_connection_starts_in_init() {
        let conn = dummy();
        assert_eq!(conn.mode(), Mode::Init);
        assert!(conn.mode().is_handshaking());
        assert!(conn.active());
    }

    #[test]
    fn handshake_progresses_through_pre_states_into_connected() {
        let mut conn = dummy();
        conn.advance_handshake(Mode::PreNick);
        conn.advance_handshake(Mode::PreSync);
        conn.advance_handshake(Mode::Spectating);
        assert!(conn.mode().is_connected());
        assert!(!conn.mode().is_handshaking());
    }

    #[test]
    fn assign_player_transitions_to_playing() {
        let mut conn = dummy();
        conn.advance_handshake(Mode::Spectating);
        conn.assign_player(PlayerIndex::new(2));
        assert_eq!(conn.mode(), Mode::Playing);
        assert_eq!(conn.player(), Some(PlayerIndex::new(2)));
    }

    #[test]
    fn assign_spectator_releases_the_player_slot() {
        let mut conn = dummy();
        conn.assign_player(PlayerIndex::new(1));
        conn.assign_spectator();
        assert_eq!(conn.mode(), Mode::Spectating);
        assert_eq!(conn.player(), None);
    }

    #[test]
    fn last_player_survives_a_move_back_to_spectating() {
        let mut conn = dummy();
        assert_eq!(conn.last_player(), PlayerIndex::new(0));
        conn.assign_player(PlayerIndex::new(4));
        conn.assign_spectator();
        assert_eq!(conn.player(), None);
        assert_eq!(conn.last_player(), PlayerIndex::new(4));
    }

    #[test]
    fn hangup_is_terminal_and_returns_the_freed_player() {
        let mut conn = dummy();
        conn.assign_player(PlayerIndex::new(4));
        let freed = conn.hangup();
        assert_eq!(freed, Some(PlayerIndex::new(4)));
        assert_eq!(conn.mode(), Mode::None);
        assert!(!conn.active());
    }
}
