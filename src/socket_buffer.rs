//! Reliable, non-blocking send/recv byte rings atop one stream socket.
//!
//! These buffers are transport-agnostic: they're driven by a closure that
//! performs the actual `read`/`write` syscall, so they can be exercised in
//! unit tests against an in-memory duplex pipe instead of a live socket.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// A pair of ring buffers for one non-blocking stream connection.
///
/// Parsing never consumes from `recv_buf` until a full envelope is known to
/// be buffered: [`SocketBuffer::peek`] copies out candidate bytes without
/// removing them, and only [`SocketBuffer::recv_flush`] commits a command by
/// draining it. A short read just means the caller peeks again next poll —
/// there's no cursor to rewind, since nothing was ever taken out early.
pub struct SocketBuffer {
    recv_buf: VecDeque<u8>,
    send_buf: VecDeque<u8>,
}

impl SocketBuffer {
    /// Creates empty send/recv rings.
    #[must_use]
    pub fn new() -> Self {
        SocketBuffer {
            recv_buf: VecDeque::new(),
            send_buf: VecDeque::new(),
        }
    }

    /// Pulls whatever bytes are currently available from `reader` into the
    /// recv ring, without blocking. `WouldBlock` is treated as "nothing new".
    pub fn fill_from(&mut self, reader: &mut impl Read) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.recv_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Copies out the first `n` buffered bytes without consuming them, for
    /// variable-length framing (read the 8-byte header, decide how much more
    /// the full envelope needs, peek again). Returns `None` if fewer than
    /// `n` bytes are currently buffered.
    #[must_use]
    pub fn peek(&self, n: usize) -> Option<Vec<u8>> {
        if self.recv_buf.len() < n {
            return None;
        }
        Some(self.recv_buf.iter().take(n).copied().collect())
    }

    /// Commits a successfully parsed command: removes its bytes from the ring.
    pub fn recv_flush(&mut self, n: usize) {
        self.recv_buf.drain(..n);
    }

    /// Queues `data` for sending.
    pub fn send(&mut self, data: &[u8]) {
        self.send_buf.extend(data);
    }

    /// Pushes as much of the send ring as `writer` will accept.
    ///
    /// If `blocking` is true, retries on `WouldBlock` until the ring drains
    /// (used only from the stall loop).
    pub fn send_flush(&mut self, writer: &mut impl Write, blocking: bool) -> io::Result<()> {
        loop {
            if self.send_buf.is_empty() {
                return Ok(());
            }
            let (front, _) = self.send_buf.as_slices();
            match writer.write(front) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if blocking {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        continue;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes currently queued to send but not yet flushed.
    #[must_use]
    pub fn pending_send(&self) -> usize {
        self.send_buf.len()
    }

    /// Bytes currently buffered for receive but not yet parsed.
    #[must_use]
    pub fn pending_recv(&self) -> usize {
        self.recv_buf.len()
    }
}

impl Default for SocketBuffer {
    fn default() -> Self {
        Self::new()
    }
}
