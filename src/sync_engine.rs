//! Pointer arithmetic, rollback/resimulation bookkeeping, and stall logic.
//! The wire-facing part of the per-frame loop (draining commands, emitting
//! INPUT) lives in [`crate::dispatcher`]; this module is the pure
//! state-machine core that both the dispatcher and [`crate::session`] drive.

use std::thread;
use std::time::Duration;

use crate::delta_frame::DeltaFrameRing;
use crate::error::NetplayError;
use crate::frame::{FrameNumber, PlayerIndex, MAX_RETRIES, RETRY_MS};

/// The pointer/frame-count bookkeeping for rollback, minus the per-player
/// `read_ptr`/`read_frame_count` map (that lives on
/// [`crate::connection::Connection`], one per peer).
#[derive(Debug, Clone, Copy)]
pub struct Pointers {
    /// Next ring slot to be written by local simulation.
    pub self_ptr: usize,
    /// Number of frames locally simulated so far.
    pub self_frame_count: FrameNumber,
    /// Next slot to be resimulated during/after a rollback.
    pub other_ptr: usize,
    /// Frames resimulated with fully real input so far.
    pub other_frame_count: FrameNumber,
    /// The lagging-most read pointer across `connected_players` (stall gate).
    pub unread_ptr: usize,
    /// `min` over players in `connected_players` of their `read_frame_count`,
    /// additionally lower-bounded by `server_frame_count` on a client with
    /// no connected players.
    pub unread_frame_count: FrameNumber,
    /// Client only: the server's own read pointer/frame count.
    pub server_ptr: usize,
    /// Client only: frames of server ("player None" / the server's own
    /// player) input received so far.
    pub server_frame_count: FrameNumber,
}

impl Pointers {
    /// The starting pointer state for a brand new session: everything at
    /// frame zero, slot zero.
    #[must_use]
    pub fn new() -> Self {
        Pointers {
            self_ptr: 0,
            self_frame_count: FrameNumber::ZERO,
            other_ptr: 0,
            other_frame_count: FrameNumber::ZERO,
            unread_ptr: 0,
            unread_frame_count: FrameNumber::ZERO,
            server_ptr: 0,
            server_frame_count: FrameNumber::ZERO,
        }
    }
}

impl Default for Pointers {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes `unread_frame_count`.
///
/// `reads` is `(player, read_frame_count)` for every player in
/// `connected_players`. When `reads` is empty (a client with no connected
/// players — e.g. still only talking to the server) the bound falls back to
/// `server_frame_count`.
#[must_use]
pub fn unread_frame_count(reads: &[(PlayerIndex, FrameNumber)], server_frame_count: FrameNumber) -> FrameNumber {
    reads
        .iter()
        .map(|(_, count)| *count)
        .min()
        .unwrap_or(server_frame_count)
}

/// Whether the engine must stall rather than advance `self_frame_count`:
/// the network hasn't covered input as far back as
/// `self_frame_count - delay_frames`.
#[must_use]
pub fn should_stall(self_frame_count: FrameNumber, unread_frame_count: FrameNumber, delay_frames: u32) -> bool {
    i64::from(unread_frame_count.as_u32()) <= i64::from(self_frame_count.as_u32()) - i64::from(delay_frames)
}

/// Tracks consecutive stall retries and decides when to give up.
#[derive(Debug, Default)]
pub struct StallTracker {
    retries: u32,
}

impl StallTracker {
    /// A fresh tracker with zero retries recorded.
    #[must_use]
    pub fn new() -> Self {
        StallTracker { retries: 0 }
    }

    /// Records one failed re-drain attempt, sleeping `RETRY_MS` first.
    ///
    /// Returns `Err` once [`MAX_RETRIES`] consecutive retries have elapsed
    /// and `remote_paused` is false. A caller who observes `remote_paused`
    /// should not call this at all — an indefinitely paused stall never
    /// exhausts.
    pub fn retry(&mut self, stalled_frame: FrameNumber) -> Result<(), NetplayError> {
        thread::sleep(Duration::from_millis(RETRY_MS));
        self.retries += 1;
        if self.retries >= MAX_RETRIES {
            return Err(NetplayError::StallExhausted { frame: stalled_frame });
        }
        Ok(())
    }

    /// Resets the retry counter once the stall resolves.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Current consecutive-retry count.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Begins a rollback: snaps `self_ptr`/`self_frame_count` back to
/// `other_ptr`/`other_frame_count`.
///
/// Returns the ring slot index the caller must restore the emulator's state
/// from. Does not itself touch the emulator or the ring — that's
/// [`crate::session::Session`]'s job, since it owns the callback surface.
pub fn begin_rewind(pointers: &mut Pointers) -> usize {
    pointers.self_ptr = pointers.other_ptr;
    pointers.self_frame_count = pointers.other_frame_count;
    pointers.self_ptr
}

/// Advances `other_ptr`/`other_frame_count` by one slot once that slot has
/// been resimulated with fully real input for every connected player. Does
/// nothing (pins `other_ptr`) if `fully_real` is false.
pub fn advance_other_if_fully_real(pointers: &mut Pointers, ring: &DeltaFrameRing, fully_real: bool) {
    if fully_real {
        pointers.other_ptr = ring.next_ptr(pointers.other_ptr);
        pointers.other_frame_count += 1;
    }
}

/// Whether every player in `connected_players` has real input recorded in
/// the ring slot at `ptr` — the condition that lets `other_ptr` advance.
#[must_use]
pub fn slot_is_fully_real(ring: &DeltaFrameRing, ptr: usize, connected_players: &[PlayerIndex]) -> bool {
    let slot = ring.slot(ptr);
    connected_players.iter().all(|p| slot.have_real(*p))
}

/// Resolves a CRC parked earlier by [`crate::dispatcher::dispatch_crc`]
/// (received before our own resimulation reached that frame) now that
/// `other_ptr` has advanced past it: the reported CRC was stored on the
/// slot, and is re-checked here once resimulation reaches that frame.
///
/// Returns the connection the CRC came from if a mismatch was found,
/// meaning the caller should request a savestate from that peer. Returns
/// `None` if no CRC was parked for this slot, or if it matched.
#[must_use]
pub fn resolve_parked_crc(ring: &mut DeltaFrameRing, ptr: usize, connected_players: &[PlayerIndex]) -> Option<usize> {
    let (conn, reported) = ring.slot_mut(ptr).take_pending_remote_crc()?;
    let local = ring.slot(ptr).crc(connected_players);
    (local != reported).then_some(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_frame_count_takes_the_minimum_across_players() {
        let reads = vec![
            (PlayerIndex::new(0), FrameNumber::new(10)),
            (PlayerIndex::new(1), FrameNumber::new(7)),
        ];
        assert_eq!(unread_frame_count(&reads, FrameNumber::new(0)), FrameNumber::new(7));
    }

    #[test]
    fn unread_frame_count_falls_back_to_server_frame_count_with_no_players() {
        assert_eq!(unread_frame_count(&[], FrameNumber::new(42)), FrameNumber::new(42));
    }

    #[test]
    fn should_stall_when_network_lags_beyond_delay_window() {
        assert!(should_stall(FrameNumber::new(20), FrameNumber::new(16), 3));
        assert!(!should_stall(FrameNumber::new(20), FrameNumber::new(18), 3));
    }

    #[test]
    fn begin_rewind_snaps_self_to_other() {
        let mut pointers = Pointers::new();
        pointers.other_ptr = 2;
        pointers.other_frame_count = FrameNumber::new(97);
        pointers.self_ptr = 5;
        pointers.self_frame_count = FrameNumber::new(100);
        let restored_from = begin_rewind(&mut pointers);
        assert_eq!(restored_from, 2);
        assert_eq!(pointers.self_ptr, 2);
        assert_eq!(pointers.self_frame_count, FrameNumber::new(97));
    }

    #[test]
    fn other_ptr_advances_only_when_fully_real() {
        let mut ring = DeltaFrameRing::new(4);
        ring.ready(0, FrameNumber::new(0));
        ring.slot_mut(0).set_real_input(PlayerIndex::new(0), [1, 0, 0]);
        let mut pointers = Pointers::new();

        let fully_real = slot_is_fully_real(&ring, 0, &[PlayerIndex::new(0)]);
        assert!(fully_real);
        advance_other_if_fully_real(&mut pointers, &ring, fully_real);
        assert_eq!(pointers.other_ptr, 1);
        assert_eq!(pointers.other_frame_count, FrameNumber::new(1));

        let not_fully_real = slot_is_fully_real(&ring, 0, &[PlayerIndex::new(0), PlayerIndex::new(1)]);
        assert!(!not_fully_real);
        let before = pointers.other_ptr;
        advance_other_if_fully_real(&mut pointers, &ring, not_fully_real);
        assert_eq!(pointers.other_ptr, before);
    }

    #[test]
    fn stall_tracker_exhausts_after_max_retries() {
        let mut tracker = StallTracker::new();
        let frame = FrameNumber::new(5);
        for _ in 0..MAX_RETRIES - 1 {
            assert!(tracker.retry(frame).is_ok());
        }
        assert!(tracker.retry(frame).is_err());
    }

    #[test]
    fn resolve_parked_crc_detects_a_mismatch_once_checked() {
        let mut ring = DeltaFrameRing::new(4);
        ring.ready(0, FrameNumber::new(0));
        ring.slot_mut(0).set_real_input(PlayerIndex::new(0), [1, 0, 0]);
        let local = ring.slot(0).crc(&[PlayerIndex::new(0)]);

        ring.slot_mut(0).park_remote_crc(3, local.wrapping_add(1));
        assert_eq!(resolve_parked_crc(&mut ring, 0, &[PlayerIndex::new(0)]), Some(3));

        // Taken once; a second check with nothing parked is a no-op.
        assert_eq!(resolve_parked_crc(&mut ring, 0, &[PlayerIndex::new(0)]), None);
    }

    #[test]
    fn resolve_parked_crc_matches_cleanly() {
        let mut ring = DeltaFrameRing::new(4);
        ring.ready(0, FrameNumber::new(0));
        ring.slot_mut(0).set_real_input(PlayerIndex::new(0), [1, 0, 0]);
        let local = ring.slot(0).crc(&[PlayerIndex::new(0)]);
        ring.slot_mut(0).park_remote_crc(3, local);
        assert_eq!(resolve_parked_crc(&mut ring, 0, &[PlayerIndex::new(0)]), None);
    }

    #[test]
    fn stall_tracker_reset_clears_progress() {
        let mut tracker = StallTracker::new();
        tracker.retry(FrameNumber::new(1)).unwrap();
        tracker.retry(FrameNumber::new(1)).unwrap();
        tracker.reset();
        assert_eq!(tracker.retries(), 0);
    }
}
