//! Plain TCP transport built on `std::net`.
//!
//! Each relink link is one TCP connection. Nagle is disabled because the
//! link layer already batches whole frames into single writes.

use {
    crate::{split_host_port, ByteStream, LinkAcceptor, Transport},
    log::{debug, warn},
    std::{
        io::{self, Read, Write},
        net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// [`Transport`] over real TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for TcpTransport {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn ByteStream>> {
        let (host, port) = split_host_port(addr)?;
        let stream = TcpStream::connect((host.as_str(), port))?;
        debug!("tcp dial {} -> {:?}", addr, stream.peer_addr());
        Ok(Box::new(TcpByteStream::new(stream)?))
    }

    fn listen(&self, addr: &str) -> io::Result<Box<dyn LinkAcceptor>> {
        let (host, port) = split_host_port(addr)?;
        let bind_addr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, addr.to_string()))?;
        Ok(Box::new(TcpAcceptor::bind(bind_addr)?))
    }
}

/// A TCP connection wrapped as a [`ByteStream`].
pub struct TcpByteStream {
    stream: TcpStream,
    peer: String,
    closed: Arc<AtomicBool>,
}

impl TcpByteStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            stream,
            peer,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Read for TcpByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.closed.store(true, Ordering::Release);
        }
        Ok(n)
    }
}

impl Write for TcpByteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ByteStream for TcpByteStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn ByteStream>> {
        Ok(Box::new(Self {
            stream: self.stream.try_clone()?,
            peer: self.peer.clone(),
            closed: self.closed.clone(),
        }))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("tcp shutdown {}: {}", self.peer, e);
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

/// Accepts inbound TCP connections.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        debug!("tcp listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl LinkAcceptor for TcpAcceptor {
    fn accept(&self) -> io::Result<Box<dyn ByteStream>> {
        loop {
            let (stream, from) = self.listener.accept()?;
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "acceptor closed",
                ));
            }
            match TcpByteStream::new(stream) {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) => warn!("dropping inbound tcp connection from {}: {}", from, e),
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // std has no way to interrupt accept(); poke it with a throwaway connection.
        let _ = TcpStream::connect(self.local_addr);
    }
}
