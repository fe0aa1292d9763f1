//! A minimal [`NetplayCallbacks`] implementation for exercising [`Session`]
//! over real loopback TCP without an actual emulator core.
//!
//! `StubCore` is the "emulator": its whole state is a running FNV-1a hash of
//! every input word it has ever consumed, so two peers that simulate the
//! same input sequence end up with identical state, and a peer that
//! resimulates after a rollback converges back to the same hash once it
//! replays the same inputs. That's exactly the property the CRC audit and
//! rollback logic need to exercise in tests.

use std::cell::RefCell;
use std::rc::Rc;

use netplay_engine::hash::fnv1a_hash;
use netplay_engine::{InputWords, NetplayCallbacks};

/// Test double for the thing a real emulator core would be.
#[derive(Debug, Clone, Default)]
pub struct StubCore {
    /// Running hash of every input word simulated so far.
    pub state: u64,
    /// Number of frames `core_run` has been called.
    pub frames_run: u32,
    /// The input handed to `core_run` on the most recent call.
    pub last_input: InputWords,
}

impl StubCore {
    fn absorb(&mut self, input: InputWords) {
        self.state = fnv1a_hash(&(self.state, input));
        self.frames_run += 1;
        self.last_input = input;
    }
}

/// A handle onto a [`StubCore`] shared with the [`StubCallbacks`] a
/// [`netplay_engine::Session`] has taken ownership of, so tests can still
/// observe what the core did after handing the callbacks off.
#[derive(Debug, Clone, Default)]
pub struct StubHandle(Rc<RefCell<StubCore>>);

impl StubHandle {
    /// A snapshot of the core's state right now.
    #[must_use]
    pub fn core(&self) -> StubCore {
        self.0.borrow().clone()
    }

    /// Perturbs the core's state hash without changing its input history,
    /// simulating a real desync (e.g. a platform-dependent rounding
    /// difference) for tests that need to inject one deliberately.
    pub fn corrupt(&self) {
        self.0.borrow_mut().state ^= 0xdead_beef_dead_beef;
    }
}

/// Wraps a [`StubCore`] plus a canned sequence of local inputs, one per
/// frame, so tests can script deterministic input without a real controller.
pub struct StubCallbacks {
    core: Rc<RefCell<StubCore>>,
    scripted_inputs: Vec<InputWords>,
    next_input: usize,
}

impl StubCallbacks {
    /// A stub whose local player always reports `[0, 0, 0]`.
    #[must_use]
    pub fn new() -> Self {
        StubCallbacks {
            core: Rc::new(RefCell::new(StubCore::default())),
            scripted_inputs: Vec::new(),
            next_input: 0,
        }
    }

    /// A stub that reports each entry of `inputs` in turn, then repeats the
    /// last one forever once exhausted.
    #[must_use]
    pub fn scripted(inputs: Vec<InputWords>) -> Self {
        StubCallbacks {
            core: Rc::new(RefCell::new(StubCore::default())),
            scripted_inputs: inputs,
            next_input: 0,
        }
    }

    /// A handle that outlives this struct's move into a [`netplay_engine::Session`].
    #[must_use]
    pub fn handle(&self) -> StubHandle {
        StubHandle(Rc::clone(&self.core))
    }
}

impl Default for StubCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl NetplayCallbacks for StubCallbacks {
    fn core_run(&mut self) {
        let input = self.core.borrow().last_input;
        self.core.borrow_mut().absorb(input);
    }

    fn core_serialize(&mut self, buf: &mut Vec<u8>) -> bool {
        let core = self.core.borrow();
        buf.clear();
        buf.extend_from_slice(&core.state.to_be_bytes());
        buf.extend_from_slice(&core.frames_run.to_be_bytes());
        true
    }

    fn core_deserialize(&mut self, buf: &[u8]) {
        if buf.len() < 12 {
            return;
        }
        let mut core = self.core.borrow_mut();
        core.state = u64::from_be_bytes(buf[0..8].try_into().unwrap_or_default());
        core.frames_run = u32::from_be_bytes(buf[8..12].try_into().unwrap_or_default());
    }

    fn poll_input(&mut self) -> InputWords {
        let input = self
            .scripted_inputs
            .get(self.next_input)
            .copied()
            .or_else(|| self.scripted_inputs.last().copied())
            .unwrap_or([0, 0, 0]);
        self.next_input += 1;
        self.core.borrow_mut().last_input = input;
        input
    }

    fn compress(&mut self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }

    fn decompress(&mut self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}
