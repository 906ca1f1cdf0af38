//! Physical link wrapper.
//!
//! Every transport connection gets a process-wide, strictly increasing
//! [`LinkId`] and three threads:
//!
//! ```text
//!   transport ──▶ reader ──▶ dispatcher ──▶ coordinator
//!   transport ◀── writer ◀── LinkHandle::send
//! ```
//!
//! The reader only frames commands; the dispatcher hands them to the
//! coordinator, so a busy coordinator never stops the transport from being
//! drained (unless `max_unprocessed_bytes` says otherwise). Failures seen by
//! the reader or the writer travel through the dispatcher, after every
//! command that was framed before them.

use {
    crate::{
        brain::BrainHandle,
        command::Command,
        config::RelinkConfig,
        error::Result,
    },
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    parking_lot::{Condvar, Mutex},
    relink_transport::ByteStream,
    std::{
        fmt,
        io::Write,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::Builder,
        time::{Duration, Instant},
    },
};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity of one physical link. Later links have larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum WriterMessage {
    Frame(Vec<u8>),
    /// Write everything queued so far, then shut the link down.
    Close,
}

enum DispatchItem {
    Command(Command, usize),
    Failed(String),
}

/// Bounds the bytes framed by the reader but not yet taken by the
/// dispatcher.
struct ByteBudget {
    cap: Option<usize>,
    used: Mutex<usize>,
    released: Condvar,
}

impl ByteBudget {
    const POLL: Duration = Duration::from_millis(100);

    fn new(cap: Option<usize>) -> Self {
        Self {
            cap,
            used: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, n: usize, alive: &AtomicBool) {
        let Some(cap) = self.cap else {
            return;
        };
        let mut used = self.used.lock();
        // A single frame larger than the cap is let through on an idle budget.
        while *used > 0 && used.saturating_add(n) > cap && alive.load(Ordering::Acquire) {
            self.released.wait_for(&mut used, Self::POLL);
        }
        *used = used.saturating_add(n);
    }

    fn release(&self, n: usize) {
        if self.cap.is_none() {
            return;
        }
        let mut used = self.used.lock();
        *used = used.saturating_sub(n);
        self.released.notify_all();
    }
}

struct LinkShared {
    id: LinkId,
    passive: bool,
    peer: String,
    control: Mutex<Box<dyn ByteStream>>,
    settled: AtomicBool,
    alive: AtomicBool,
    budget: ByteBudget,
}

impl LinkShared {
    fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.control.lock().shutdown();
        self.budget.released.notify_all();
    }
}

/// Cloneable handle used by the coordinator to talk to a link.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<LinkShared>,
    writer_tx: Sender<WriterMessage>,
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.shared.id)
            .field("passive", &self.shared.passive)
            .field("peer", &self.shared.peer)
            .finish()
    }
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    /// Whether the link came from a listener rather than a dial.
    pub fn is_passive(&self) -> bool {
        self.shared.passive
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Queue `command` for the writer. Returns false if the link is gone.
    pub fn send(&self, command: &Command) -> bool {
        if !self.is_alive() {
            return false;
        }
        match command.encode() {
            Ok(frame) => self.writer_tx.send(WriterMessage::Frame(frame)).is_ok(),
            Err(e) => {
                error!("Link {}: cannot encode {}: {}", self.id(), command.kind(), e);
                false
            }
        }
    }

    /// The connection carried by this link reached established, closing or
    /// closed; the writer stops its settle timer.
    pub fn mark_settled(&self) {
        self.shared.settled.store(true, Ordering::Release);
    }

    /// Flush queued frames, then shut down.
    pub fn close(&self) {
        if self.writer_tx.send(WriterMessage::Close).is_err() {
            self.shared.shutdown();
        }
    }

    /// Shut down now, dropping anything still queued.
    pub fn abort(&self) {
        if self.is_alive() {
            debug!("Link {}: aborted", self.id());
        }
        self.shared.shutdown();
    }
}

/// Inbound half of a freshly opened link. Nothing is read until
/// [`LinkReader::start`] is called, which the coordinator does once the link
/// is registered so that no command can arrive for an unknown link.
pub struct LinkReader {
    shared: Arc<LinkShared>,
    stream: Box<dyn ByteStream>,
    dispatch_tx: Sender<DispatchItem>,
    dispatch_rx: Receiver<DispatchItem>,
    brain: BrainHandle,
    max_frame_size: usize,
}

impl LinkReader {
    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    /// Spawn the reader and dispatcher threads.
    pub fn start(self) -> Result<()> {
        let Self {
            shared,
            mut stream,
            dispatch_tx,
            dispatch_rx,
            brain,
            max_frame_size,
        } = self;
        let id = shared.id;

        let dispatcher_shared = shared.clone();
        Builder::new()
            .name(format!("relinkDispatch{}", id.as_u64()))
            .spawn(move || Self::dispatch_loop(&dispatcher_shared, &dispatch_rx, &brain))?;

        Builder::new()
            .name(format!("relinkReader{}", id.as_u64()))
            .spawn(move || loop {
                match Command::read_from(&mut *stream, max_frame_size) {
                    Ok(Some((command, size))) => {
                        trace!("Link {}: received {}", id, command.kind());
                        shared.budget.acquire(size, &shared.alive);
                        if dispatch_tx.send(DispatchItem::Command(command, size)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = dispatch_tx.send(DispatchItem::Failed("closed by peer".into()));
                        break;
                    }
                    Err(e) => {
                        let _ = dispatch_tx.send(DispatchItem::Failed(e.to_string()));
                        break;
                    }
                }
            })?;
        Ok(())
    }

    fn dispatch_loop(shared: &LinkShared, items: &Receiver<DispatchItem>, brain: &BrainHandle) {
        for item in items.iter() {
            match item {
                DispatchItem::Command(command, size) => {
                    shared.budget.release(size);
                    if brain.on_command_received(shared.id, command).is_err() {
                        break;
                    }
                }
                DispatchItem::Failed(reason) => {
                    shared.shutdown();
                    let _ = brain.on_link_failure_with_reason(shared.id, reason);
                    break;
                }
            }
        }
        trace!("Link {}: dispatcher exiting", shared.id);
    }
}

/// Wrap a transport connection: assign an id and start its writer.
pub fn open(
    stream: Box<dyn ByteStream>,
    passive: bool,
    brain: BrainHandle,
    config: &RelinkConfig,
) -> Result<(LinkHandle, LinkReader)> {
    let reader_stream = stream.try_clone_stream()?;
    let writer_stream = stream.try_clone_stream()?;
    let id = LinkId::next();
    let peer = stream.peer_label();
    let shared = Arc::new(LinkShared {
        id,
        passive,
        peer,
        control: Mutex::new(stream),
        settled: AtomicBool::new(false),
        alive: AtomicBool::new(true),
        budget: ByteBudget::new(config.max_unprocessed_bytes),
    });
    let (writer_tx, writer_rx) = unbounded();
    let (dispatch_tx, dispatch_rx) = unbounded();

    let writer = Writer {
        shared: shared.clone(),
        stream: writer_stream,
        messages: writer_rx,
        failures: dispatch_tx.clone(),
        settle_deadline: Instant::now()
            .checked_add(config.link_settle_timeout)
            .unwrap_or_else(Instant::now),
    };
    Builder::new()
        .name(format!("relinkWriter{}", id.as_u64()))
        .spawn(move || writer.run())?;

    debug!(
        "Link {}: opened ({}, peer {})",
        id,
        if passive { "accepted" } else { "dialed" },
        shared.peer
    );
    let handle = LinkHandle { shared: shared.clone(), writer_tx };
    let reader = LinkReader {
        shared,
        stream: reader_stream,
        dispatch_tx,
        dispatch_rx,
        brain,
        max_frame_size: config.max_frame_size,
    };
    Ok((handle, reader))
}

/// Single consumer of a link's outbound frames.
struct Writer {
    shared: Arc<LinkShared>,
    stream: Box<dyn ByteStream>,
    messages: Receiver<WriterMessage>,
    failures: Sender<DispatchItem>,
    settle_deadline: Instant,
}

impl Writer {
    fn run(mut self) {
        let id = self.shared.id;
        loop {
            let message = if self.shared.settled.load(Ordering::Acquire) {
                self.messages.recv().ok()
            } else {
                match self.messages.recv_deadline(self.settle_deadline) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => {
                        if self.shared.settled.load(Ordering::Acquire) {
                            continue;
                        }
                        warn!("Link {}: connection not established in time, expiring", id);
                        self.fail("settle timeout".to_string());
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            };
            match message {
                Some(WriterMessage::Frame(frame)) => {
                    if let Err(e) = self.stream.write_all(&frame).and_then(|()| self.stream.flush()) {
                        if self.shared.alive.load(Ordering::Acquire) {
                            warn!("Link {}: write failed: {}", id, e);
                        }
                        self.fail(e.to_string());
                        return;
                    }
                }
                Some(WriterMessage::Close) | None => {
                    debug!("Link {}: closing", id);
                    self.shared.shutdown();
                    return;
                }
            }
        }
    }

    fn fail(&self, reason: String) {
        self.shared.shutdown();
        let _ = self.failures.send(DispatchItem::Failed(reason));
    }
}
