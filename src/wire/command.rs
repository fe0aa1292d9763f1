//! Command ids and payload (de)serialization.

use crate::frame::{FrameNumber, InputWords, PlayerIndex, INPUT_WORDS};
use crate::wire::codec::{push_u32, read_u32};

/// High bit of INPUT's second word: set iff the frame originated from the
/// server player.
pub const INPUT_BIT_SERVER: u32 = 1 << 31;

/// MODE payload bit: the addressed player is now playing (else spectating).
pub const MODE_BIT_PLAYING: u32 = 1 << 16;

/// MODE payload bit: the addressed peer is the subject of this MODE message.
pub const MODE_BIT_YOU: u32 = 1 << 17;

/// Numeric command ids.
pub mod id {
    pub const ACK: u32 = 0x0000;
    pub const NAK: u32 = 0x0001;
    pub const DISCONNECT: u32 = 0x0002;
    pub const INPUT: u32 = 0x0003;
    pub const NOINPUT: u32 = 0x0004;
    pub const FLIP_PLAYERS: u32 = 0x0005;
    pub const SPECTATE: u32 = 0x0006;
    pub const PLAY: u32 = 0x0007;
    pub const MODE: u32 = 0x0008;
    pub const CRC: u32 = 0x0009;
    pub const REQUEST_SAVESTATE: u32 = 0x000a;
    pub const LOAD_SAVESTATE: u32 = 0x000b;
    pub const PAUSE: u32 = 0x000c;
    pub const RESUME: u32 = 0x000d;
}

/// A fully decoded command and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Acknowledgement; ignored on receipt.
    Ack,
    /// Fatal for the connection that receives it.
    Nak,
    /// Graceful hangup.
    Disconnect,
    /// `u32 frame, u32 player_or_flags, u32 state[W]`.
    Input {
        /// Frame this input belongs to.
        frame: FrameNumber,
        /// Low bits: player index (server ignores this and uses the sender's
        /// assigned player). High bit: [`INPUT_BIT_SERVER`].
        player_or_flags: u32,
        /// The `W` input words.
        state: InputWords,
    },
    /// `u32 frame` — server to client only.
    NoInput {
        /// The frame for which the server has no local input.
        frame: FrameNumber,
    },
    /// `u32 flip_frame` — server to client only.
    FlipPlayers {
        /// The frame at which the flip takes effect.
        flip_frame: FrameNumber,
    },
    /// Client to server: "put me in spectator mode".
    Spectate,
    /// Client to server: "put me in a player slot".
    Play,
    /// `u32 frame, u32 flags_and_player` — server to client.
    Mode {
        /// See §4.2: "frame at which mode changed" or "end-of-input frame".
        frame: FrameNumber,
        /// Low 16 bits: player index. Bits: [`MODE_BIT_PLAYING`], [`MODE_BIT_YOU`].
        flags_and_player: u32,
    },
    /// `u32 frame, u32 crc`.
    Crc {
        /// The frame being audited.
        frame: FrameNumber,
        /// The sender's CRC for that frame.
        crc: u32,
    },
    /// Empty payload: "please send me a savestate".
    RequestSavestate,
    /// `u32 frame, u32 uncompressed_size, compressed_bytes`.
    LoadSavestate {
        /// The frame the savestate is for.
        frame: FrameNumber,
        /// Size of the state once decompressed.
        uncompressed_size: u32,
        /// The compressed state bytes.
        compressed: Vec<u8>,
    },
    /// Mark the connection paused.
    Pause,
    /// Mark the connection resumed.
    Resume,
}

impl Command {
    /// The numeric command id this variant encodes as.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Command::Ack => id::ACK,
            Command::Nak => id::NAK,
            Command::Disconnect => id::DISCONNECT,
            Command::Input { .. } => id::INPUT,
            Command::NoInput { .. } => id::NOINPUT,
            Command::FlipPlayers { .. } => id::FLIP_PLAYERS,
            Command::Spectate => id::SPECTATE,
            Command::Play => id::PLAY,
            Command::Mode { .. } => id::MODE,
            Command::Crc { .. } => id::CRC,
            Command::RequestSavestate => id::REQUEST_SAVESTATE,
            Command::LoadSavestate { .. } => id::LOAD_SAVESTATE,
            Command::Pause => id::PAUSE,
            Command::Resume => id::RESUME,
        }
    }

    /// Serializes the payload (without the outer `cmd`/`payload_size` header).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Command::Ack
            | Command::Nak
            | Command::Disconnect
            | Command::Spectate
            | Command::Play
            | Command::RequestSavestate
            | Command::Pause
            | Command::Resume => {}
            Command::Input {
                frame,
                player_or_flags,
                state,
            } => {
                push_u32(&mut out, frame.as_u32());
                push_u32(&mut out, *player_or_flags);
                for word in state {
                    push_u32(&mut out, *word);
                }
            }
            Command::NoInput { frame } => push_u32(&mut out, frame.as_u32()),
            Command::FlipPlayers { flip_frame } => push_u32(&mut out, flip_frame.as_u32()),
            Command::Mode {
                frame,
                flags_and_player,
            } => {
                push_u32(&mut out, frame.as_u32());
                push_u32(&mut out, *flags_and_player);
            }
            Command::Crc { frame, crc } => {
                push_u32(&mut out, frame.as_u32());
                push_u32(&mut out, *crc);
            }
            Command::LoadSavestate {
                frame,
                uncompressed_size,
                compressed,
            } => {
                push_u32(&mut out, frame.as_u32());
                push_u32(&mut out, *uncompressed_size);
                out.extend_from_slice(compressed);
            }
        }
        out
    }

    /// Decodes a command from its `cmd` id and raw `payload` bytes.
    ///
    /// Returns `Err(reason)` on a payload-size mismatch, which the caller
    /// should treat as a protocol violation and reject with NAK.
    pub fn decode(cmd: u32, payload: &[u8]) -> Result<Command, &'static str> {
        match cmd {
            id::ACK if payload.is_empty() => Ok(Command::Ack),
            id::NAK if payload.is_empty() => Ok(Command::Nak),
            id::DISCONNECT if payload.is_empty() => Ok(Command::Disconnect),
            id::SPECTATE if payload.is_empty() => Ok(Command::Spectate),
            id::PLAY if payload.is_empty() => Ok(Command::Play),
            id::REQUEST_SAVESTATE if payload.is_empty() => Ok(Command::RequestSavestate),
            id::PAUSE if payload.is_empty() => Ok(Command::Pause),
            id::RESUME if payload.is_empty() => Ok(Command::Resume),
            id::INPUT => {
                if payload.len() != 4 + 4 + INPUT_WORDS * 4 {
                    return Err("INPUT payload size mismatch");
                }
                let frame = FrameNumber::new(read_u32(payload, 0));
                let player_or_flags = read_u32(payload, 4);
                let mut state = [0u32; INPUT_WORDS];
                for (i, word) in state.iter_mut().enumerate() {
                    *word = read_u32(payload, 8 + i * 4);
                }
                Ok(Command::Input {
                    frame,
                    player_or_flags,
                    state,
                })
            }
            id::NOINPUT => {
                if payload.len() != 4 {
                    return Err("NOINPUT payload size mismatch");
                }
                Ok(Command::NoInput {
                    frame: FrameNumber::new(read_u32(payload, 0)),
                })
            }
            id::FLIP_PLAYERS => {
                if payload.len() != 4 {
                    return Err("FLIP_PLAYERS payload size mismatch");
                }
                Ok(Command::FlipPlayers {
                    flip_frame: FrameNumber::new(read_u32(payload, 0)),
                })
            }
            id::MODE => {
                if payload.len() != 8 {
                    return Err("MODE payload size mismatch");
                }
                Ok(Command::Mode {
                    frame: FrameNumber::new(read_u32(payload, 0)),
                    flags_and_player: read_u32(payload, 4),
                })
            }
            id::CRC => {
                if payload.len() != 8 {
                    return Err("CRC payload size mismatch");
                }
                Ok(Command::Crc {
                    frame: FrameNumber::new(read_u32(payload, 0)),
                    crc: read_u32(payload, 4),
                })
            }
            id::LOAD_SAVESTATE => {
                if payload.len() < 8 {
                    return Err("LOAD_SAVESTATE payload too short");
                }
                Ok(Command::LoadSavestate {
                    frame: FrameNumber::new(read_u32(payload, 0)),
                    uncompressed_size: read_u32(payload, 4),
                    compressed: payload[8..].to_vec(),
                })
            }
            id::ACK
            | id::NAK
            | id::DISCONNECT
            | id::SPECTATE
            | id::PLAY
            | id::REQUEST_SAVESTATE
            | id::PAUSE
            | id::RESUME => Err("expected empty payload"),
            _ => Err("unknown command id"),
        }
    }
}

/// Extracts the player index from an INPUT command's `player_or_flags`
/// word, masking off [`INPUT_BIT_SERVER`].
#[must_use]
pub fn input_player(player_or_flags: u32) -> u32 {
    player_or_flags & !INPUT_BIT_SERVER
}

/// Whether an INPUT command's `player_or_flags` word has the server bit set.
#[must_use]
pub fn input_is_from_server(player_or_flags: u32) -> bool {
    player_or_flags & INPUT_BIT_SERVER != 0
}

/// Builds the `player_or_flags` word for an outgoing INPUT command.
#[must_use]
pub fn make_input_flags(player: PlayerIndex, from_server: bool) -> u32 {
    player.as_u32() | if from_server { INPUT_BIT_SERVER } else { 0 }
}

/// Extracts the player index from a MODE command's `flags_and_player` word.
#[must_use]
pub fn mode_player(flags_and_player: u32) -> u32 {
    flags_and_player & 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_roundtrips_through_encode_decode() {
        let cmd = Command::Input {
            frame: FrameNumber::new(100),
            player_or_flags: make_input_flags(PlayerIndex::new(2), true),
            state: [0x1234, 0x5678, 0x9abc],
        };
        let payload = cmd.encode_payload();
        let decoded = Command::decode(id::INPUT, &payload).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn input_size_mismatch_is_a_protocol_violation() {
        let result = Command::decode(id::INPUT, &[0, 0, 0, 0]);
        assert!(result.is_err());
    }

    #[test]
    fn input_bit_server_roundtrips() {
        let flags = make_input_flags(PlayerIndex::new(5), true);
        assert!(input_is_from_server(flags));
        assert_eq!(input_player(flags), 5);

        let flags = make_input_flags(PlayerIndex::new(5), false);
        assert!(!input_is_from_server(flags));
        assert_eq!(input_player(flags), 5);
    }

    #[test]
    fn mode_payload_roundtrips() {
        let cmd = Command::Mode {
            frame: FrameNumber::new(42),
            flags_and_player: MODE_BIT_PLAYING | MODE_BIT_YOU | 3,
        };
        let payload = cmd.encode_payload();
        let decoded = Command::decode(id::MODE, &payload).unwrap();
        assert_eq!(decoded, cmd);
        if let Command::Mode { flags_and_player, .. } = decoded {
            assert_eq!(mode_player(flags_and_player), 3);
            assert_ne!(flags_and_player & MODE_BIT_PLAYING, 0);
            assert_ne!(flags_and_player & MODE_BIT_YOU, 0);
        }
    }

    #[test]
    fn empty_payload_commands_reject_nonempty_payload() {
        assert!(Command::decode(id::ACK, &[1]).is_err());
        assert!(Command::decode(id::PLAY, &[1, 2]).is_err());
    }

    #[test]
    fn unknown_command_id_is_rejected() {
        assert!(Command::decode(0xffff_ffff, &[]).is_err());
    }

    #[test]
    fn load_savestate_roundtrips_with_compressed_bytes() {
        let cmd = Command::LoadSavestate {
            frame: FrameNumber::new(7),
            uncompressed_size: 1024,
            compressed: vec![1, 2, 3, 4, 5],
        };
        let payload = cmd.encode_payload();
        let decoded = Command::decode(id::LOAD_SAVESTATE, &payload).unwrap();
        assert_eq!(decoded, cmd);
    }
}
