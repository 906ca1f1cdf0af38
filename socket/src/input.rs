//! Receive buffer between the coordinator and the application reader.

use {
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        io,
        time::{Duration, Instant},
    },
};

#[derive(Debug, Default)]
struct InputState {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    offset: usize,
    len: usize,
    closed: bool,
    aborted: bool,
}

/// Bytes received in order, waiting for the application.
///
/// The coordinator pushes payloads and eventually closes the pipe; the
/// application side blocks in [`InputBuffer::read`]. A closed pipe still
/// yields every buffered byte before reporting end-of-stream.
#[derive(Debug)]
pub struct InputBuffer {
    state: Mutex<InputState>,
    readable: Condvar,
    cap: Option<usize>,
}

/// Outcome of one [`InputBuffer::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    /// The buffer was at its cap before this read and is below it now.
    pub drained_below_cap: bool,
}

impl InputBuffer {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            state: Mutex::new(InputState::default()),
            readable: Condvar::new(),
            cap,
        }
    }

    /// Append in-order payload bytes. Ignored once the pipe is closed.
    pub fn push(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.len = state.len.saturating_add(bytes.len());
        state.chunks.push_back(bytes);
        self.readable.notify_all();
    }

    /// No more bytes will arrive. Readers see end-of-stream after draining.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.readable.notify_all();
    }

    /// The connection was lost without a close handshake. Readers get an
    /// error after draining.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.aborted = true;
        self.readable.notify_all();
    }

    /// Drop everything buffered and reopen. Used when a connection attempt
    /// is reset before it was ever established.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = InputState::default();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_at_cap(&self) -> bool {
        let len = self.state.lock().len;
        self.cap.is_some_and(|cap| len >= cap)
    }

    /// Block until at least one byte is available or the pipe is closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        self.read_inner(buf, None)
    }

    /// Like [`InputBuffer::read`] but gives up after `timeout` with
    /// [`io::ErrorKind::TimedOut`].
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        self.read_inner(buf, Some(timeout))
    }

    fn read_inner(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome> {
        let empty = ReadOutcome {
            bytes: 0,
            drained_below_cap: false,
        };
        if buf.is_empty() {
            return Ok(empty);
        }
        let deadline = timeout.map(|timeout| {
            Instant::now()
                .checked_add(timeout)
                .unwrap_or_else(Instant::now)
        });
        let mut state = self.state.lock();
        while state.len == 0 {
            if state.aborted {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "virtual connection lost",
                ));
            }
            if state.closed {
                return Ok(empty);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                    self.readable.wait_until(&mut state, deadline);
                }
                None => self.readable.wait(&mut state),
            }
        }

        let was_at_cap = self.cap.is_some_and(|cap| state.len >= cap);
        let mut copied = 0usize;
        while copied < buf.len() {
            let offset = state.offset;
            let Some(front) = state.chunks.front() else {
                break;
            };
            let available = &front[offset..];
            let n = available.len().min(buf.len().saturating_sub(copied));
            buf[copied..copied.saturating_add(n)].copy_from_slice(&available[..n]);
            copied = copied.saturating_add(n);
            if n == available.len() {
                state.chunks.pop_front();
                state.offset = 0;
            } else {
                state.offset = offset.saturating_add(n);
            }
        }
        state.len = state.len.saturating_sub(copied);
        let below_cap = self.cap.is_some_and(|cap| state.len < cap);
        Ok(ReadOutcome {
            bytes: copied,
            drained_below_cap: was_at_cap && below_cap,
        })
    }
}
