//! Common test infrastructure shared across integration tests.
//!
//! `stub_callbacks` provides a minimal [`netplay_engine::NetplayCallbacks`]
//! implementation over an in-memory emulator stand-in, suitable for driving
//! a real [`netplay_engine::Session`] over loopback TCP the way a host
//! frontend would.
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::stub_callbacks::{StubCallbacks, StubCore};
//! ```

pub mod stub_callbacks;

/// Installs a `tracing` subscriber that prints to stderr, so the engine's
/// `trace!`/`debug!`/`warn!` calls are visible under `cargo test -- --nocapture`.
/// Safe to call from every test: `try_init` is a no-op once a subscriber is
/// already set for the process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
