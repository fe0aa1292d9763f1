//! The delta-frame ring buffer: per-slot saved state plus per-player input.
//!
//! The ring is index-based rather than pointer-based, so a slot is
//! identified by a `usize` that the [`crate::sync_engine`] module walks with
//! [`DeltaFrameRing::next_ptr`]/[`DeltaFrameRing::prev_ptr`].

use crate::checksum::crc32_of_parts;
use crate::frame::{FrameNumber, PlayerIndex, InputWords, DIRECTION_MASK, MAX_USERS};

/// One slot of the ring: a saved state plus the per-player input rows that
/// were real, simulated, and (for the local player) locally captured.
#[derive(Debug, Clone)]
pub struct DeltaFrame {
    used: bool,
    frame: FrameNumber,
    state: Vec<u8>,
    real_input: [InputWords; MAX_USERS],
    have_real: [bool; MAX_USERS],
    simulated_input: [InputWords; MAX_USERS],
    simulated_before: [bool; MAX_USERS],
    self_state: InputWords,
    have_local: bool,
    /// A CRC reported by a peer for this frame, parked until our own
    /// resimulation reaches it, alongside the connection that reported it
    /// so a mismatch can be resolved against that peer specifically.
    pending_remote_crc: Option<(usize, u32)>,
}

impl DeltaFrame {
    fn empty() -> Self {
        DeltaFrame {
            used: false,
            frame: FrameNumber::ZERO,
            state: Vec::new(),
            real_input: [[0; 3]; MAX_USERS],
            have_real: [false; MAX_USERS],
            simulated_input: [[0; 3]; MAX_USERS],
            simulated_before: [false; MAX_USERS],
            self_state: [0; 3],
            have_local: false,
            pending_remote_crc: None,
        }
    }

    /// The logical frame number this slot currently holds, if `used`.
    #[must_use]
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Whether this slot has been initialized for its current `frame`.
    #[must_use]
    pub fn used(&self) -> bool {
        self.used
    }

    /// The raw saved emulator state for this slot.
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// Mutable access to the raw saved state buffer, e.g. for
    /// `core_serialize`/decompression-in-place to write into.
    pub fn state_mut(&mut self) -> &mut Vec<u8> {
        &mut self.state
    }

    /// Whether real (authoritative) input has arrived for `player` in this slot.
    #[must_use]
    pub fn have_real(&self, player: PlayerIndex) -> bool {
        self.have_real[player.as_usize()]
    }

    /// The real input for `player`, if it has arrived.
    #[must_use]
    pub fn real_input(&self, player: PlayerIndex) -> Option<&InputWords> {
        if self.have_real[player.as_usize()] {
            Some(&self.real_input[player.as_usize()])
        } else {
            None
        }
    }

    /// Whatever input should currently be used for simulation: real if it
    /// has arrived, otherwise the last-simulated prediction.
    #[must_use]
    pub fn effective_input(&self, player: PlayerIndex) -> &InputWords {
        if self.have_real[player.as_usize()] {
            &self.real_input[player.as_usize()]
        } else {
            &self.simulated_input[player.as_usize()]
        }
    }

    /// Records real input for `player` at this slot.
    ///
    /// Returns `false` if real input was already recorded for this
    /// `(frame, player)` pair — callers should treat that as a duplicate.
    pub fn set_real_input(&mut self, player: PlayerIndex, input: InputWords) -> bool {
        let idx = player.as_usize();
        if self.have_real[idx] {
            return false;
        }
        self.real_input[idx] = input;
        self.have_real[idx] = true;
        true
    }

    /// Fills in a prediction for `player` when real input hasn't arrived yet.
    ///
    /// `previous` is the same player's input from the prior slot. On the
    /// very first prediction for a frame the whole word is copied; on
    /// resimulation (`already_simulated`) only the button bits are copied
    /// from the previous real input, preserving the predicted directions.
    /// Duration is right in the predicted stream, press-count is not, and
    /// re-triggering buttons on every resimulation pass would be audible.
    pub fn simulate_input(&mut self, player: PlayerIndex, previous: &InputWords, already_simulated: bool) {
        let idx = player.as_usize();
        if already_simulated {
            let predicted_dirs = self.simulated_input[idx][0] & DIRECTION_MASK;
            self.simulated_input[idx][0] = predicted_dirs | (previous[0] & !DIRECTION_MASK);
        } else {
            self.simulated_input[idx] = *previous;
        }
    }

    /// Whether `simulate_input` has already run for `player` on this slot —
    /// the caller's cue to pass `already_simulated = true` on a later
    /// resimulation pass triggered by rollback.
    #[must_use]
    pub fn was_simulated(&self, player: PlayerIndex) -> bool {
        self.simulated_before[player.as_usize()]
    }

    /// Marks `player` as simulated on this slot.
    pub fn mark_simulated(&mut self, player: PlayerIndex) {
        self.simulated_before[player.as_usize()] = true;
    }

    /// The locally captured controller state for this slot.
    #[must_use]
    pub fn self_state(&self) -> InputWords {
        self.self_state
    }

    /// Records the locally captured controller state.
    pub fn set_self_state(&mut self, input: InputWords) {
        self.self_state = input;
        self.have_local = true;
    }

    /// Whether local input has been captured into this slot.
    #[must_use]
    pub fn have_local(&self) -> bool {
        self.have_local
    }

    /// Zeroes local input but still marks it captured, so the slot isn't
    /// mistaken for one awaiting capture.
    pub fn zero_self_state(&mut self) {
        self.self_state = [0; 3];
        self.have_local = true;
    }

    /// Parks a CRC reported by `conn` for later comparison once our own
    /// resimulation reaches this frame.
    pub fn park_remote_crc(&mut self, conn: usize, crc: u32) {
        self.pending_remote_crc = Some((conn, crc));
    }

    /// Takes the parked remote CRC and its reporting connection, if any.
    pub fn take_pending_remote_crc(&mut self) -> Option<(usize, u32)> {
        self.pending_remote_crc.take()
    }

    /// Computes the CRC over the saved state plus each connected player's
    /// real input, in ascending player-index order.
    #[must_use]
    pub fn crc(&self, connected_players: &[PlayerIndex]) -> u32 {
        let mut ordered: Vec<PlayerIndex> = connected_players.to_vec();
        ordered.sort_by_key(PlayerIndex::as_usize);
        let input_bytes: Vec<[u8; 12]> = ordered
            .iter()
            .map(|p| {
                let words = self.effective_input(*p);
                let mut bytes = [0u8; 12];
                for (i, word) in words.iter().enumerate() {
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
                }
                bytes
            })
            .collect();
        crc32_of_parts(
            std::iter::once(self.state.as_slice()).chain(input_bytes.iter().map(|b| b.as_slice())),
        )
    }
}

/// Per-frame storage ring, sized `B = 2*D + 1`.
///
/// Lazily (re)initializes a slot the first time `self_ptr` reaches it, or
/// when the ring wraps back onto a stale slot for a new frame.
#[derive(Debug, Clone)]
pub struct DeltaFrameRing {
    slots: Vec<DeltaFrame>,
}

impl DeltaFrameRing {
    /// Builds a ring of `buffer_size` slots (`buffer_size = 2*delay_frames + 1`).
    ///
    /// `delay_frames = 0` yields a ring of size 1: the engine stays correct
    /// but cannot roll back, since there is never a second slot holding a
    /// pre-divergence state.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "ring must hold at least one slot");
        DeltaFrameRing {
            slots: (0..buffer_size).map(|_| DeltaFrame::empty()).collect(),
        }
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring is empty (never true for a correctly constructed ring).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `(ptr + 1) mod B`.
    #[must_use]
    pub fn next_ptr(&self, ptr: usize) -> usize {
        (ptr + 1) % self.slots.len()
    }

    /// `(ptr + B - 1) mod B`.
    #[must_use]
    pub fn prev_ptr(&self, ptr: usize) -> usize {
        (ptr + self.slots.len() - 1) % self.slots.len()
    }

    /// Shared access to a slot.
    #[must_use]
    pub fn slot(&self, ptr: usize) -> &DeltaFrame {
        &self.slots[ptr]
    }

    /// Mutable access to a slot.
    pub fn slot_mut(&mut self, ptr: usize) -> &mut DeltaFrame {
        &mut self.slots[ptr]
    }

    /// Lazily (re)initializes `ptr` for `frame`, if it isn't already ready.
    ///
    /// Returns `true` once the slot is ready for `frame`. Reinitializing
    /// resets `have_real`/`have_local` and clears any parked CRC; it does
    /// *not* write the saved state — the caller supplies that via
    /// `slot_mut().state_mut()` after the core's `serialize` callback
    /// succeeds (serialization failure is transient, so callers should
    /// retry next frame rather than treat the slot as ready).
    pub fn ready(&mut self, ptr: usize, frame: FrameNumber) -> bool {
        let slot = &mut self.slots[ptr];
        if slot.used && slot.frame == frame {
            return true;
        }
        slot.used = true;
        slot.frame = frame;
        slot.have_real = [false; MAX_USERS];
        slot.have_local = false;
        slot.simulated_before = [false; MAX_USERS];
        slot.pending_remote_crc = None;
        true
    }

    /// Searches backward from `start` for a `used` slot holding `frame`.
    #[must_use]
    pub fn find_frame(&self, start: usize, frame: FrameNumber) -> Option<usize> {
        let len = self.slots.len();
        let mut ptr = start;
        for _ in 0..len {
            let slot = &self.slots[ptr];
            if slot.used && slot.frame == frame {
                return Some(ptr);
            }
            ptr = self.prev_ptr(ptr);
        }
        None
    }
}
