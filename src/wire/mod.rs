//! Wire protocol: outer envelope framing plus per-command payloads.

pub mod codec;
pub mod command;

pub use codec::{decode_header, encode, Envelope, HEADER_LEN};
pub use command::{
    id, input_is_from_server, input_player, make_input_flags, mode_player, Command,
    INPUT_BIT_SERVER, MODE_BIT_PLAYING, MODE_BIT_YOU,
};
