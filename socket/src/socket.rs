//! Application-facing virtual socket.

use {
    crate::{
        brain::{BrainHandle, BrainService},
        command::DataPacket,
        entry::EntryState,
        error::{RelinkError, Result},
        input::InputBuffer,
        triplet::ConnKey,
    },
    log::*,
    parking_lot::Mutex,
    std::{
        fmt, io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
};

#[derive(Debug, Default)]
struct SendSide {
    next_packet_id: u64,
    closed: bool,
}

struct SocketInner {
    service: Arc<BrainService>,
    key: ConnKey,
    input: Arc<InputBuffer>,
    send: Mutex<SendSide>,
    closed: AtomicBool,
    max_packet_payload: usize,
}

impl SocketInner {
    fn brain(&self) -> &BrainHandle {
        self.service.handle()
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.brain().on_local_close(self.key);
        }
    }
}

/// One end of a resilient byte stream.
///
/// Bytes written are delivered to the peer exactly once and in order, even
/// when the links underneath come and go. `VirtualSocket` is cheap to clone;
/// the connection is closed by [`VirtualSocket::close`] or when the last
/// clone is dropped. Closing waits for nothing: the close handshake runs in
/// the background and still delivers everything written before it.
#[derive(Clone)]
pub struct VirtualSocket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("key", &self.inner.key)
            .finish()
    }
}

impl VirtualSocket {
    pub(crate) fn new(
        service: Arc<BrainService>,
        key: ConnKey,
        input: Arc<InputBuffer>,
        max_packet_payload: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                service,
                key,
                input,
                send: Mutex::new(SendSide::default()),
                closed: AtomicBool::new(false),
                max_packet_payload,
            }),
        }
    }

    pub fn key(&self) -> ConnKey {
        self.inner.key
    }

    /// Current protocol state; `None` once the connection is forgotten.
    pub fn state(&self) -> Option<EntryState> {
        self.inner.brain().entry_state(self.inner.key).ok().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.brain().is_closed(self.inner.key)
    }

    pub fn is_established_or_closing(&self) -> bool {
        self.inner.brain().is_established_or_closing(self.inner.key)
    }

    /// The peer finished sending (or the connection was lost) and every byte
    /// it sent has been buffered.
    pub fn is_input_pipe_closed(&self) -> bool {
        self.inner.input.is_closed()
    }

    /// Bytes received and not read yet.
    pub fn available(&self) -> usize {
        self.inner.input.len()
    }

    /// Queue all of `buf` for the peer. Returns once the coordinator owns the
    /// bytes, not when they are delivered. Works while the connection is
    /// recovering; fails once it is closing.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelinkError::ConnectionClosed);
        }
        let mut send = self.inner.send.lock();
        if send.closed {
            return Err(RelinkError::ConnectionClosed);
        }
        for chunk in buf.chunks(self.inner.max_packet_payload) {
            let packet = DataPacket {
                packet_id: send.next_packet_id,
                payload: chunk.to_vec(),
            };
            if let Err(e) = self.inner.brain().on_data_sent(self.inner.key, packet) {
                send.closed = true;
                return Err(e);
            }
            send.next_packet_id = send.next_packet_id.saturating_add(1);
        }
        Ok(buf.len())
    }

    /// Read whatever is available, blocking until at least one byte is.
    /// Returns 0 at end of stream.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_inner(buf, None)
    }

    /// Like [`VirtualSocket::recv`] with an upper bound on the wait.
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.recv_inner(buf, Some(timeout))
    }

    fn recv_inner(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelinkError::ConnectionClosed);
        }
        let outcome = match timeout {
            Some(timeout) => self.inner.input.read_timeout(buf, timeout)?,
            None => self.inner.input.read(buf)?,
        };
        if outcome.drained_below_cap {
            let _ = self.inner.brain().on_flush(self.inner.key);
        }
        Ok(outcome.bytes)
    }

    /// Ask the coordinator to put buffered packets and pending acks on the
    /// wire now.
    pub fn flush(&self) -> Result<()> {
        self.inner.brain().on_flush(self.inner.key)
    }

    /// Start the close handshake. A second close is an error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(RelinkError::ConnectionClosed);
        }
        debug!("Socket {}: close", self.inner.key);
        self.inner.send.lock().closed = true;
        self.inner.brain().on_local_close(self.inner.key)
    }

    /// A [`std::io::Read`] view of the receive side.
    pub fn input_stream(&self) -> InputStream {
        InputStream {
            socket: self.clone(),
        }
    }

    /// A [`std::io::Write`] view of the send side.
    pub fn output_stream(&self) -> OutputStream {
        OutputStream {
            socket: self.clone(),
        }
    }
}

impl io::Read for &VirtualSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.recv(buf)?)
    }
}

impl io::Write for &VirtualSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.send(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(VirtualSocket::flush(self)?)
    }
}

impl io::Read for VirtualSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl io::Write for VirtualSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

/// Receive half of a [`VirtualSocket`].
#[derive(Debug, Clone)]
pub struct InputStream {
    socket: VirtualSocket,
}

impl io::Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }
}

/// Send half of a [`VirtualSocket`].
#[derive(Debug, Clone)]
pub struct OutputStream {
    socket: VirtualSocket,
}

impl OutputStream {
    pub fn close(&self) -> Result<()> {
        self.socket.close()
    }
}

impl io::Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.socket).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &self.socket)
    }
}
