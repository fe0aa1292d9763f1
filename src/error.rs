//! Error types for the netplay engine.
//!
//! Transient I/O never surfaces an `Err` (it is retried), protocol
//! violations are handled per-connection (NAK + hangup, never a
//! session-level error), and only resource failure in
//! [`crate::session::Session::new`] and stall exhaustion in
//! [`crate::session::Session::post_frame`] produce a `NetplayError`.

use std::error::Error;
use std::fmt::{self, Display};

use crate::frame::{FrameNumber, PlayerIndex};

/// Errors the session surfaces to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayError {
    /// `nick` exceeded [`crate::frame::MAX_NICK_LEN`] bytes.
    NickTooLong {
        /// The length the caller supplied.
        len: usize,
    },
    /// `password` exceeded [`crate::frame::MAX_PASSWORD_LEN`] bytes.
    PasswordTooLong {
        /// The length the caller supplied.
        len: usize,
    },
    /// The underlying socket could not be created or bound.
    SocketSetupFailed {
        /// Description of the underlying OS error.
        context: String,
    },
    /// The stall loop exhausted [`crate::frame::MAX_RETRIES`] with no peer
    /// holding PAUSE.
    StallExhausted {
        /// The frame the engine was stalled on.
        frame: FrameNumber,
    },
    /// A player index outside `0..MAX_USERS` was used where a valid one was required.
    InvalidPlayer {
        /// The offending raw index.
        index: u32,
    },
    /// An internal invariant was violated; if you see this, it's a bug.
    Internal {
        /// Description of what went wrong.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NickTooLong { len } => write!(
                f,
                "nick is {len} bytes, exceeds {} byte limit",
                crate::frame::MAX_NICK_LEN
            ),
            Self::PasswordTooLong { len } => write!(
                f,
                "password is {len} bytes, exceeds {} byte limit",
                crate::frame::MAX_PASSWORD_LEN
            ),
            Self::SocketSetupFailed { context } => write!(f, "socket setup failed: {context}"),
            Self::StallExhausted { frame } => write!(
                f,
                "stalled at frame {frame} for {} consecutive retries with no peer paused",
                crate::frame::MAX_RETRIES
            ),
            Self::InvalidPlayer { index } => write!(f, "player index {index} is out of range"),
            Self::Internal { context } => write!(f, "internal error: {context}"),
        }
    }
}

impl Error for NetplayError {}

impl From<std::io::Error> for NetplayError {
    fn from(err: std::io::Error) -> Self {
        NetplayError::SocketSetupFailed {
            context: err.to_string(),
        }
    }
}

/// The outcome of dispatching one decoded command.
///
/// Distinguishes "handled, keep the connection" from "protocol violation,
/// NAK and hang up" without forcing every dispatch call site to construct
/// a full [`NetplayError`] for what is, per spec, a per-connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command was valid and applied.
    Handled,
    /// The command was a duplicate and was silently dropped.
    DuplicateDropped,
    /// The command violated the protocol; the sender should be NAK'd and hung up.
    ProtocolViolation {
        /// Short machine-readable reason, useful for tests and logs.
        reason: &'static str,
    },
}

/// A player-relevant event the host should learn about, pulled with
/// [`crate::session::Session::drain_events`].
///
/// This is not the UI message queue a host may already keep — it is the
/// minimal signal the engine itself must produce so the host has something
/// to hand to that external queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection finished its handshake and is spectating or playing.
    PeerConnected {
        /// The player index, if the peer became a player.
        player: Option<PlayerIndex>,
    },
    /// A connection was hung up, voluntarily or due to an error.
    PeerDisconnected {
        /// The player index that was freed, if any.
        player: Option<PlayerIndex>,
    },
    /// The local client lost its only connection (to the server) and is
    /// continuing the simulation without network.
    LocalDisconnected,
    /// A CRC mismatch triggered a state-transfer recovery.
    DesyncRecovering {
        /// The frame at which the mismatch was detected.
        frame: FrameNumber,
    },
    /// Client only: this peer's own MODE changed in response to its own
    /// PLAY/SPECTATE request.
    /// Unlike [`SessionEvent::PeerConnected`]/[`SessionEvent::PeerDisconnected`],
    /// which report *other* peers, this is how the host learns its own
    /// request was granted.
    LocalModeChanged {
        /// The player slot now held, or `None` if now spectating.
        player: Option<PlayerIndex>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_mention_the_offending_value() {
        let err = NetplayError::NickTooLong { len: 40 };
        assert!(err.to_string().contains("40"));

        let err = NetplayError::StallExhausted {
            frame: FrameNumber::new(7),
        };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn io_error_converts_to_socket_setup_failed() {
        let io_err = std::io::Error::other("boom");
        let err: NetplayError = io_err.into();
        assert!(matches!(err, NetplayError::SocketSetupFailed { .. }));
    }
}
