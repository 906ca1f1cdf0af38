//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] is a registry of named listeners. Dialing one creates
//! a pair of [`MemoryStream`]s joined by two crossbeam channels. The network
//! can sever every live link or refuse new dials, which is how the socket
//! tests simulate a flapping physical network.

use {
    crate::{split_host_port, ByteStream, LinkAcceptor, Transport},
    crossbeam_channel::{select, unbounded, Receiver, Sender},
    log::{debug, info},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        io::{self, Read, Write},
        sync::{
            atomic::{AtomicBool, AtomicU16, Ordering},
            Arc, Weak,
        },
    },
};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// State shared by every handle of both ends of one pipe.
struct PipeShared {
    label: String,
    closed: AtomicBool,
    // Dropping the sender wakes every reader blocked on `kill_rx`.
    kill_tx: Mutex<Option<Sender<()>>>,
    kill_rx: Receiver<()>,
}

impl PipeShared {
    fn new(label: String) -> Arc<Self> {
        let (kill_tx, kill_rx) = unbounded();
        Arc::new(Self {
            label,
            closed: AtomicBool::new(false),
            kill_tx: Mutex::new(Some(kill_tx)),
            kill_rx,
        })
    }

    fn kill(&self) {
        self.closed.store(true, Ordering::Release);
        self.kill_tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One end of an in-memory pipe.
pub struct MemoryStream {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    peer: String,
    shared: Arc<PipeShared>,
}

impl MemoryStream {
    /// Create two connected ends. `a` talks to `b` and vice versa.
    pub fn pair(a_label: &str, b_label: &str) -> (Self, Self) {
        let shared = PipeShared::new(format!("{a_label}<->{b_label}"));
        Self::pair_with(shared, a_label, b_label)
    }

    fn pair_with(shared: Arc<PipeShared>, a_label: &str, b_label: &str) -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let a = Self {
            tx: a_tx,
            rx: a_rx,
            pending: Vec::new(),
            offset: 0,
            peer: b_label.to_string(),
            shared: shared.clone(),
        };
        let b = Self {
            tx: b_tx,
            rx: b_rx,
            pending: Vec::new(),
            offset: 0,
            peer: a_label.to_string(),
            shared,
        };
        (a, b)
    }

    fn copy_pending(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset = self.offset.saturating_add(n);
        if self.offset >= self.pending.len() {
            self.pending.clear();
            self.offset = 0;
        }
        n
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset < self.pending.len() {
            return Ok(self.copy_pending(buf));
        }
        if self.shared.is_closed() {
            return Ok(0);
        }
        let received = select! {
            recv(self.rx) -> msg => msg.ok(),
            recv(self.shared.kill_rx) -> _ => None,
        };
        match received {
            Some(bytes) if !self.shared.is_closed() => {
                self.pending = bytes;
                self.offset = 0;
                Ok(self.copy_pending(buf))
            }
            Some(_) => Ok(0),
            None => {
                // Either the pipe was killed or every peer handle is gone.
                self.shared.kill();
                Ok(0)
            }
        }
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.shared.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for MemoryStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn ByteStream>> {
        Ok(Box::new(Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            pending: Vec::new(),
            offset: 0,
            peer: self.peer.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn shutdown(&self) {
        self.shared.kill();
    }

    fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

struct Registry {
    listeners: HashMap<String, Sender<Box<dyn ByteStream>>>,
    links: Vec<Weak<PipeShared>>,
}

struct NetworkInner {
    registry: Mutex<Registry>,
    partitioned: AtomicBool,
    next_port: AtomicU16,
}

/// An in-process network of listeners and pipes.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                registry: Mutex::new(Registry {
                    listeners: HashMap::new(),
                    links: Vec::new(),
                }),
                partitioned: AtomicBool::new(false),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Kill every live pipe. Both ends observe end-of-stream.
    pub fn sever_all(&self) -> usize {
        let links: Vec<Arc<PipeShared>> = {
            let mut registry = self.inner.registry.lock();
            registry.links.retain(|w| w.strong_count() > 0);
            registry.links.iter().filter_map(Weak::upgrade).collect()
        };
        let mut severed = 0usize;
        for link in links {
            if !link.is_closed() {
                debug!("severing memory link {}", link.label);
                link.kill();
                severed = severed.saturating_add(1);
            }
        }
        info!("memory network: severed {} link(s)", severed);
        severed
    }

    /// While partitioned every dial is refused. Existing pipes are untouched.
    pub fn set_partitioned(&self, partitioned: bool) {
        info!("memory network: partitioned={}", partitioned);
        self.inner.partitioned.store(partitioned, Ordering::Release);
    }

    pub fn is_partitioned(&self) -> bool {
        self.inner.partitioned.load(Ordering::Acquire)
    }

    /// Number of pipes that have not been shut down.
    pub fn live_link_count(&self) -> usize {
        let mut registry = self.inner.registry.lock();
        registry.links.retain(|w| w.strong_count() > 0);
        registry
            .links
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|l| !l.is_closed())
            .count()
    }

    fn resolve(&self, addr: &str) -> io::Result<String> {
        let (host, port) = split_host_port(addr)?;
        let port = if port == 0 {
            self.inner.next_port.fetch_add(1, Ordering::Relaxed)
        } else {
            port
        };
        Ok(format!("{host}:{port}"))
    }
}

impl Transport for MemoryNetwork {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn ByteStream>> {
        let (host, port) = split_host_port(addr)?;
        let key = format!("{host}:{port}");
        if self.is_partitioned() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{key}: network partitioned"),
            ));
        }
        let mut registry = self.inner.registry.lock();
        let listener = registry.listeners.get(&key).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{key}: nobody listening"),
            )
        })?;
        let shared = PipeShared::new(format!("dialer<->{key}"));
        let (client, server) = MemoryStream::pair_with(shared.clone(), "dialer", &key);
        if listener.send(Box::new(server)).is_err() {
            registry.listeners.remove(&key);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{key}: listener closed"),
            ));
        }
        registry.links.retain(|w| w.strong_count() > 0);
        registry.links.push(Arc::downgrade(&shared));
        Ok(Box::new(client))
    }

    fn listen(&self, addr: &str) -> io::Result<Box<dyn LinkAcceptor>> {
        let key = self.resolve(addr)?;
        let mut registry = self.inner.registry.lock();
        if registry.listeners.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{key} already bound"),
            ));
        }
        let (tx, rx) = unbounded();
        registry.listeners.insert(key.clone(), tx);
        let (close_tx, close_rx) = unbounded();
        Ok(Box::new(MemoryAcceptor {
            addr: key,
            inbound: rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            network: Arc::downgrade(&self.inner),
        }))
    }
}

/// Passive end registered with a [`MemoryNetwork`].
pub struct MemoryAcceptor {
    addr: String,
    inbound: Receiver<Box<dyn ByteStream>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    network: Weak<NetworkInner>,
}

impl LinkAcceptor for MemoryAcceptor {
    fn accept(&self) -> io::Result<Box<dyn ByteStream>> {
        let closed = || io::Error::new(io::ErrorKind::NotConnected, "acceptor closed");
        if self.close_tx.lock().is_none() {
            return Err(closed());
        }
        select! {
            recv(self.inbound) -> stream => stream.map_err(|_| closed()),
            recv(self.close_rx) -> _ => Err(closed()),
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn close(&self) {
        if self.close_tx.lock().take().is_none() {
            return;
        }
        if let Some(network) = self.network.upgrade() {
            network.registry.lock().listeners.remove(&self.addr);
        }
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}
