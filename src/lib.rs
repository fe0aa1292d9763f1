//! # netplay-engine
//!
//! A transport-owning, deterministic-lockstep rollback netcode engine for
//! emulator frontends, built around a star topology: one peer runs as the
//! server/hub, every other peer connects to it as a client.
//!
//! The engine drives a cooperative, single-threaded per-frame loop
//! ([`Session::pre_frame`] / [`Session::post_frame`]) over non-blocking TCP,
//! delaying and predicting missing input, rolling back and resimulating on
//! arrival of real input that invalidates a prediction, and auditing
//! determinism across peers with periodic state checksums.
//!
//! The host embeds the engine by implementing [`NetplayCallbacks`] against
//! its own emulator core and driving a [`Session`] once per frame; everything
//! below that (wire framing, the connection state machine, the delta-frame
//! ring, rollback bookkeeping) is owned by this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod checksum;
pub mod connection;
pub mod delta_frame;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod hash;
pub mod session;
pub mod socket_buffer;
pub mod sync_engine;
pub mod wire;

#[doc(hidden)]
pub mod test_config;

pub use connection::{Connection, Mode};
pub use delta_frame::{DeltaFrame, DeltaFrameRing};
pub use dispatcher::{ConnId, Effect, EngineState, PlayerTable, Role, SelfMode};
pub use error::{DispatchOutcome, NetplayError, SessionEvent};
pub use frame::{
    FrameNumber, InputWords, PlayerIndex, DEFAULT_PORT, DIRECTION_MASK, INPUT_WORDS, MAX_NICK_LEN, MAX_PASSWORD_LEN,
    MAX_RETRIES, MAX_USERS, RETRY_MS,
};
pub use session::{quirks, NetplayCallbacks, Session, SessionConfig};
pub use sync_engine::{Pointers, StallTracker};
pub use wire::command::id;
pub use wire::{decode_header, encode, Command, Envelope, HEADER_LEN};
