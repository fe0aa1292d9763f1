//! Length-prefixed command framing.
//!
//! Every command on the wire is `u32 cmd | u32 payload_size | payload`, all
//! integers big-endian. This module only handles the outer envelope;
//! [`crate::wire::command`] knows how to interpret each command's payload.

/// Size in bytes of the `cmd` + `payload_size` header.
pub const HEADER_LEN: usize = 8;

/// A decoded envelope: command id, and the raw payload bytes (already
/// validated to be exactly `payload_size` bytes long).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The `u32` command id (see [`crate::wire::command::Command`]).
    pub cmd: u32,
    /// The raw payload bytes.
    pub payload: Vec<u8>,
}

/// Encodes `cmd` and `payload` into a single big-endian framed buffer.
#[must_use]
pub fn encode(cmd: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&cmd.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Attempts to decode one envelope's header from `header_bytes` (exactly
/// [`HEADER_LEN`] bytes), returning `(cmd, payload_size)`.
#[must_use]
pub fn decode_header(header_bytes: &[u8; HEADER_LEN]) -> (u32, u32) {
    let cmd = u32::from_be_bytes([header_bytes[0], header_bytes[1], header_bytes[2], header_bytes[3]]);
    let payload_size = u32::from_be_bytes([header_bytes[4], header_bytes[5], header_bytes[6], header_bytes[7]]);
    (cmd, payload_size)
}

/// Reads a big-endian `u32` out of `bytes` at `offset`.
#[must_use]
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Appends `value` to `out` as a big-endian `u32`.
pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}
