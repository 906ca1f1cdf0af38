//! The coordinator ("brain").
//!
//! One thread owns every [`Entry`] of a node together with the binding of
//! entries to physical links. Everything else talks to it through
//! [`BrainHandle`], which posts [`BrainMessage`]s; nothing but this thread
//! ever touches protocol state, so no entry needs a lock.
//!
//! Commands arriving on a link are routed by the link they came from:
//!
//! * a link bound to a connection only carries commands for that
//!   connection, and only while it is still the connection's current link
//!   (anything else is stale and dropped);
//! * an unbound passive link may only open a connection (`NewConn`) or take
//!   over an existing one (`JoinConn`, `JoinCloseConn`).

use {
    crate::{
        command::{Command, CommandBody, CommandKind, DataPacket},
        config::RelinkConfig,
        entry::{Entry, EntryState, Transition},
        error::{RelinkError, Result},
        handler,
        input::InputBuffer,
        link::{LinkHandle, LinkId, LinkReader},
        recovery::{self, RecoveryEvent},
        stats::{BrainStats, StatsSnapshot},
        triplet::{ConnKey, NodeId, Triplet},
    },
    crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    parking_lot::Mutex,
    relink_transport::Transport,
    std::{
        collections::HashMap,
        sync::Arc,
        thread::{Builder, JoinHandle},
        time::Instant,
    },
    strum_macros::Display,
};

/// Which side of its connections a coordinator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Role {
    #[strum(serialize = "connector")]
    Connector,
    #[strum(serialize = "connectee")]
    Connectee,
}

/// How a connector starts the handshake on a freshly dialed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InitiateKind {
    /// First attempt of a new connection.
    NewConnection,
    /// A new-connection handshake lost its link before completing.
    ExistingConnection,
    Join,
    JoinClose,
}

/// A connection handed to a connector's `connect`.
#[derive(Debug)]
pub struct NewConnection {
    pub key: ConnKey,
    pub input: Arc<InputBuffer>,
}

/// A connection established by a remote connector, for the listener.
#[derive(Debug)]
pub struct Accepted {
    pub key: ConnKey,
    pub input: Arc<InputBuffer>,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStatus {
    pub state: EntryState,
    pub input_closed: bool,
}

pub enum BrainMessage {
    InitConnection {
        remote: String,
        host: String,
        port: u16,
        reply: Sender<Result<NewConnection>>,
    },
    Initiate {
        key: ConnKey,
        kind: InitiateKind,
        link: Option<(LinkHandle, LinkReader)>,
        reply: Sender<Result<()>>,
    },
    AttachPassiveLink {
        link: LinkHandle,
        reader: LinkReader,
    },
    CommandReceived {
        link: LinkId,
        command: Command,
    },
    LinkFailed {
        link: LinkId,
        reason: String,
    },
    DataSent {
        key: ConnKey,
        packet: DataPacket,
        reply: Sender<Result<()>>,
    },
    Flush {
        key: ConnKey,
    },
    LocalClose {
        key: ConnKey,
    },
    AwaitEstablished {
        key: ConnKey,
        reply: Sender<Result<()>>,
    },
    Query {
        key: ConnKey,
        reply: Sender<Option<EntryStatus>>,
    },
    Shutdown,
}

/// Cloneable front end of a coordinator thread.
#[derive(Clone)]
pub struct BrainHandle {
    sender: Sender<BrainMessage>,
    stats: Arc<BrainStats>,
    role: Role,
    node: NodeId,
}

impl BrainHandle {
    fn new(role: Role) -> (Self, Receiver<BrainMessage>) {
        let (sender, receiver) = unbounded();
        let handle = Self {
            sender,
            stats: Arc::new(BrainStats::new()),
            role,
            node: NodeId::new_random(),
        };
        (handle, receiver)
    }

    /// A handle whose messages land in the returned receiver instead of a
    /// coordinator thread.
    #[cfg(test)]
    pub(crate) fn detached(role: Role) -> (Self, Receiver<BrainMessage>) {
        Self::new(role)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn post(&self, message: BrainMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| RelinkError::CoordinatorGone)
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> BrainMessage) -> Result<T> {
        let (reply, response) = bounded(1);
        self.post(build(reply))?;
        response.recv().map_err(|_| RelinkError::CoordinatorGone)
    }

    /// Connector: create a connection entry (and its recovery agent).
    pub fn init_connection(&self, remote: &str, host: &str, port: u16) -> Result<NewConnection> {
        self.request(|reply| BrainMessage::InitConnection {
            remote: remote.to_string(),
            host: host.to_string(),
            port,
            reply,
        })?
    }

    /// Connector: start the new-connection handshake on `link`, or, without
    /// a link, leave it to the recovery agent.
    pub fn initiate_connection(
        &self,
        key: ConnKey,
        link: Option<(LinkHandle, LinkReader)>,
    ) -> Result<()> {
        self.initiate(key, InitiateKind::NewConnection, link)
    }

    pub fn initiate_existing_connection(
        &self,
        key: ConnKey,
        link: LinkHandle,
        reader: LinkReader,
    ) -> Result<()> {
        self.initiate(key, InitiateKind::ExistingConnection, Some((link, reader)))
    }

    pub fn initiate_join(&self, key: ConnKey, link: LinkHandle, reader: LinkReader) -> Result<()> {
        self.initiate(key, InitiateKind::Join, Some((link, reader)))
    }

    pub fn initiate_join_close(
        &self,
        key: ConnKey,
        link: LinkHandle,
        reader: LinkReader,
    ) -> Result<()> {
        self.initiate(key, InitiateKind::JoinClose, Some((link, reader)))
    }

    fn initiate(
        &self,
        key: ConnKey,
        kind: InitiateKind,
        link: Option<(LinkHandle, LinkReader)>,
    ) -> Result<()> {
        self.request(|reply| BrainMessage::Initiate {
            key,
            kind,
            link,
            reply,
        })?
    }

    /// Connectee: register a freshly accepted link.
    pub fn attach_passive_link(&self, link: LinkHandle, reader: LinkReader) -> Result<()> {
        self.post(BrainMessage::AttachPassiveLink { link, reader })
    }

    pub fn on_command_received(&self, link: LinkId, command: Command) -> Result<()> {
        self.post(BrainMessage::CommandReceived { link, command })
    }

    pub fn on_link_failure(&self, link: LinkId) -> Result<()> {
        self.on_link_failure_with_reason(link, "abandoned".to_string())
    }

    pub(crate) fn on_link_failure_with_reason(&self, link: LinkId, reason: String) -> Result<()> {
        self.post(BrainMessage::LinkFailed { link, reason })
    }

    /// Hand over the next application packet. Blocks until the coordinator
    /// accepted or refused it.
    pub fn on_data_sent(&self, key: ConnKey, packet: DataPacket) -> Result<()> {
        self.request(|reply| BrainMessage::DataSent { key, packet, reply })?
    }

    pub fn on_flush(&self, key: ConnKey) -> Result<()> {
        self.post(BrainMessage::Flush { key })
    }

    pub fn on_local_close(&self, key: ConnKey) -> Result<()> {
        self.post(BrainMessage::LocalClose { key })
    }

    /// Returns a receiver that yields once the connection is established for
    /// the first time, or fails if it closes first.
    pub fn await_established(&self, key: ConnKey) -> Result<Receiver<Result<()>>> {
        let (reply, response) = bounded(1);
        self.post(BrainMessage::AwaitEstablished { key, reply })?;
        Ok(response)
    }

    pub fn entry_status(&self, key: ConnKey) -> Result<Option<EntryStatus>> {
        self.request(|reply| BrainMessage::Query { key, reply })
    }

    pub fn entry_state(&self, key: ConnKey) -> Result<Option<EntryState>> {
        Ok(self.entry_status(key)?.map(|status| status.state))
    }

    /// A forgotten connection counts as closed.
    pub fn is_closed(&self, key: ConnKey) -> bool {
        !matches!(self.entry_state(key), Ok(Some(state)) if state != EntryState::Closed)
    }

    pub fn is_established_or_closing(&self, key: ConnKey) -> bool {
        matches!(self.entry_state(key), Ok(Some(state)) if state.is_established_or_closing())
    }

    pub fn is_established_or_establishing(&self, key: ConnKey) -> bool {
        matches!(self.entry_state(key), Ok(Some(state)) if state.is_established_or_establishing())
    }

    pub fn is_input_pipe_closed(&self, key: ConnKey) -> bool {
        !matches!(self.entry_status(key), Ok(Some(status)) if !status.input_closed)
    }

    pub fn shutdown(&self) {
        let _ = self.post(BrainMessage::Shutdown);
    }
}

/// Owns a running coordinator thread. Dropping the last reference shuts the
/// coordinator down and joins it, which waits up to
/// [`RelinkConfig::shutdown_linger`] for closing connections to finish.
pub struct BrainService {
    handle: BrainHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BrainService {
    pub fn spawn(
        role: Role,
        config: RelinkConfig,
        transport: Option<Arc<dyn Transport>>,
        accepted: Option<Sender<Accepted>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (handle, messages) = BrainHandle::new(role);
        let brain = Brain::new(handle.clone(), config, transport, accepted);
        let thread = Builder::new()
            .name(format!("relinkBrain{}", role))
            .spawn(move || brain.run(&messages))?;
        Ok(Arc::new(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn handle(&self) -> &BrainHandle {
        &self.handle
    }
}

impl Drop for BrainService {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Brain: coordinator thread panicked");
            }
        }
    }
}

// ── Coordinator state ───────────────────────────────────────────────────────

struct Slot {
    entry: Entry,
    link: Option<LinkHandle>,
    /// Newest link ever bound. Older links can never be bound again.
    highest_link: Option<LinkId>,
    agent: Option<Sender<RecoveryEvent>>,
    /// Newest link whose failure was reported to the agent.
    last_reported_failure: Option<LinkId>,
    /// Connector only: what to put in `NewConn`.
    target: Option<(String, u16)>,
}

impl Slot {
    fn new(entry: Entry) -> Self {
        Self {
            entry,
            link: None,
            highest_link: None,
            agent: None,
            last_reported_failure: None,
            target: None,
        }
    }

    fn link_id(&self) -> Option<LinkId> {
        self.link.as_ref().map(LinkHandle::id)
    }
}

struct Binding {
    handle: LinkHandle,
    /// `None` for a passive link that has not named its connection yet.
    key: Option<ConnKey>,
}

struct Brain {
    handle: BrainHandle,
    config: RelinkConfig,
    transport: Option<Arc<dyn Transport>>,
    accepted: Option<Sender<Accepted>>,
    next_connection_id: u64,
    entries: HashMap<ConnKey, Slot>,
    links: HashMap<LinkId, Binding>,
    waiters: HashMap<ConnKey, Vec<Sender<Result<()>>>>,
    /// Set once shutdown was requested: closing connections may finish
    /// their handshakes until this instant, new ones are refused.
    draining: Option<Instant>,
}

impl Brain {
    fn new(
        handle: BrainHandle,
        config: RelinkConfig,
        transport: Option<Arc<dyn Transport>>,
        accepted: Option<Sender<Accepted>>,
    ) -> Self {
        Self {
            handle,
            config,
            transport,
            accepted,
            next_connection_id: 1,
            entries: HashMap::new(),
            links: HashMap::new(),
            waiters: HashMap::new(),
            draining: None,
        }
    }

    fn role(&self) -> Role {
        self.handle.role
    }

    fn stats(&self) -> &BrainStats {
        &self.handle.stats
    }

    fn run(mut self, messages: &Receiver<BrainMessage>) {
        info!("Brain: started as {} {}", self.role(), self.handle.node);
        let tick = self.config.tick_interval;
        let mut next_tick = Instant::now().checked_add(tick).unwrap_or_else(Instant::now);
        loop {
            let wake = self.draining.map_or(next_tick, |deadline| deadline.min(next_tick));
            match messages.recv_deadline(wake) {
                Ok(BrainMessage::Shutdown) => {
                    if self.begin_drain() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Ok(message) => self.handle_message(message),
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                next_tick = now.checked_add(tick).unwrap_or(now);
            }
            if let Some(deadline) = self.draining {
                if self.entries.is_empty() {
                    debug!("Brain: all connections closed");
                    break;
                }
                if now >= deadline {
                    warn!(
                        "Brain: {} connection(s) still closing after {:?}",
                        self.entries.len(),
                        self.config.shutdown_linger
                    );
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Close every connection and keep running until their close handshakes
    /// finish or the linger runs out. Returns true when there is nothing to
    /// wait for.
    fn begin_drain(&mut self) -> bool {
        if self.draining.is_some() || self.config.shutdown_linger.is_zero() {
            return true;
        }
        let keys: Vec<ConnKey> = self.entries.keys().copied().collect();
        for key in keys {
            self.local_close(key);
        }
        if self.entries.is_empty() {
            return true;
        }
        info!(
            "Brain: draining {} connection(s) for up to {:?}",
            self.entries.len(),
            self.config.shutdown_linger
        );
        let now = Instant::now();
        self.draining = Some(now.checked_add(self.config.shutdown_linger).unwrap_or(now));
        false
    }

    fn handle_message(&mut self, message: BrainMessage) {
        match message {
            BrainMessage::InitConnection {
                remote,
                host,
                port,
                reply,
            } => {
                let result = if self.draining.is_some() {
                    Err(RelinkError::CoordinatorGone)
                } else {
                    self.init_connection(remote, host, port)
                };
                let _ = reply.send(result);
            }
            BrainMessage::Initiate {
                key,
                kind,
                link,
                reply,
            } => {
                let _ = reply.send(self.initiate(key, kind, link));
            }
            BrainMessage::AttachPassiveLink { link, reader } => {
                self.attach_passive_link(link, reader)
            }
            BrainMessage::CommandReceived { link, command } => {
                self.command_received(link, command)
            }
            BrainMessage::LinkFailed { link, reason } => self.link_failed(link, &reason),
            BrainMessage::DataSent { key, packet, reply } => {
                let _ = reply.send(self.data_sent(key, packet));
            }
            BrainMessage::Flush { key } => {
                if let Some(slot) = self.entries.get_mut(&key) {
                    let t = slot.entry.on_flush();
                    self.apply(key, t);
                }
            }
            BrainMessage::LocalClose { key } => self.local_close(key),
            BrainMessage::AwaitEstablished { key, reply } => self.await_established(key, reply),
            BrainMessage::Query { key, reply } => {
                let status = self.entries.get(&key).map(|slot| EntryStatus {
                    state: slot.entry.state(),
                    input_closed: slot.entry.is_input_pipe_closed(),
                });
                let _ = reply.send(status);
            }
            BrainMessage::Shutdown => {}
        }
    }

    // ── Local requests ──────────────────────────────────────────────────────

    fn init_connection(&mut self, remote: String, host: String, port: u16) -> Result<NewConnection> {
        let connection_id = self.next_connection_id;
        self.next_connection_id = connection_id.saturating_add(1);
        let key = ConnKey::new(self.handle.node, connection_id);
        let entry = Entry::new(Triplet::connector(key), &self.config);
        let input = entry.input().clone();

        let agent = match &self.transport {
            Some(transport) => Some(recovery::spawn_agent(
                key,
                remote,
                transport.clone(),
                self.handle.clone(),
                self.config.clone(),
            )?),
            None => None,
        };
        let mut slot = Slot::new(entry);
        slot.agent = agent;
        slot.target = Some((host, port));
        self.entries.insert(key, slot);
        self.stats().connections_opened.inc();
        debug!("Brain: created {}", key);
        Ok(NewConnection { key, input })
    }

    fn initiate(
        &mut self,
        key: ConnKey,
        kind: InitiateKind,
        link: Option<(LinkHandle, LinkReader)>,
    ) -> Result<()> {
        let Some((handle, reader)) = link else {
            let slot = self
                .entries
                .get(&key)
                .ok_or(RelinkError::UnknownConnection(key))?;
            if let Some(agent) = &slot.agent {
                let _ = agent.send(RecoveryEvent::Start);
            }
            return Ok(());
        };

        let link_id = handle.id();
        let t = match self.initiate_on_link(key, kind, link_id) {
            Ok(t) => t,
            Err(e) => {
                debug!("Brain: {} refused {} over link {}: {}", key, kind, link_id, e);
                handle.abort();
                return Err(e);
            }
        };
        debug!("Brain: {} {} over link {}", key, kind, link_id);
        self.stats().links_opened.inc();
        self.bind(key, handle);
        self.apply(key, t);
        if let Err(e) = reader.start() {
            warn!("Brain: cannot start reader for link {}: {}", link_id, e);
            self.link_failed(link_id, &e.to_string());
        }
        Ok(())
    }

    fn initiate_on_link(
        &mut self,
        key: ConnKey,
        kind: InitiateKind,
        link_id: LinkId,
    ) -> Result<Transition> {
        let slot = self
            .entries
            .get_mut(&key)
            .ok_or(RelinkError::UnknownConnection(key))?;
        if slot.link.is_some() || slot.highest_link.is_some_and(|newest| link_id <= newest) {
            return Err(RelinkError::Refused {
                state: slot.entry.state(),
            });
        }
        match kind {
            InitiateKind::NewConnection | InitiateKind::ExistingConnection => {
                let (host, port) = slot.target.clone().ok_or(RelinkError::Refused {
                    state: slot.entry.state(),
                })?;
                slot.entry.initiate_new_connection(&host, port)
            }
            InitiateKind::Join => slot.entry.initiate_join(),
            InitiateKind::JoinClose => slot.entry.initiate_join_close(),
        }
    }

    fn data_sent(&mut self, key: ConnKey, packet: DataPacket) -> Result<()> {
        let slot = self
            .entries
            .get_mut(&key)
            .ok_or(RelinkError::ConnectionClosed)?;
        let t = slot.entry.on_data_sent(packet)?;
        self.apply(key, t);
        Ok(())
    }

    fn local_close(&mut self, key: ConnKey) {
        let Some(slot) = self.entries.get_mut(&key) else {
            return;
        };
        debug!("Brain: {} closed locally in {}", key, slot.entry.state());
        let t = slot.entry.on_local_close();
        self.apply(key, t);
    }

    fn await_established(&mut self, key: ConnKey, reply: Sender<Result<()>>) {
        match self.entries.get(&key) {
            None => {
                let _ = reply.send(Err(RelinkError::ConnectionClosed));
            }
            Some(slot) if slot.entry.ever_established() => {
                let _ = reply.send(Ok(()));
            }
            Some(_) => self.waiters.entry(key).or_default().push(reply),
        }
    }

    fn tick(&mut self, now: Instant) {
        let mut pending = Vec::new();
        for (key, slot) in self.entries.iter_mut() {
            let t = slot.entry.on_tick(now);
            if !t.outbound.is_empty() {
                pending.push((*key, t));
            }
        }
        for (key, t) in pending {
            self.apply(key, t);
        }
    }

    // ── Links ───────────────────────────────────────────────────────────────

    fn attach_passive_link(&mut self, link: LinkHandle, reader: LinkReader) {
        let link_id = link.id();
        debug!("Brain: accepted link {} from {}", link_id, link.peer());
        self.stats().links_opened.inc();
        self.links.insert(
            link_id,
            Binding {
                handle: link,
                key: None,
            },
        );
        if let Err(e) = reader.start() {
            warn!("Brain: cannot start reader for link {}: {}", link_id, e);
            self.link_failed(link_id, &e.to_string());
        }
    }

    /// Make `link` the current link of `key`, replacing (and aborting) the
    /// previous one.
    fn bind(&mut self, key: ConnKey, link: LinkHandle) {
        let link_id = link.id();
        let Some(slot) = self.entries.get_mut(&key) else {
            self.links.remove(&link_id);
            link.abort();
            return;
        };
        if let Some(old) = slot.link.replace(link.clone()) {
            if old.id() != link_id {
                self.links.remove(&old.id());
                old.abort();
            }
        }
        slot.highest_link = Some(link_id);
        self.links.insert(
            link_id,
            Binding {
                handle: link,
                key: Some(key),
            },
        );
    }

    fn drop_link(&mut self, link: &LinkHandle) {
        self.links.remove(&link.id());
        link.abort();
    }

    fn link_failed(&mut self, link_id: LinkId, reason: &str) {
        let Some(binding) = self.links.remove(&link_id) else {
            trace!("Brain: ignoring failure of forgotten link {}", link_id);
            return;
        };
        binding.handle.abort();
        self.stats().link_failures.inc();
        let Some(key) = binding.key else {
            debug!("Brain: unbound link {} failed: {}", link_id, reason);
            return;
        };
        let Some(slot) = self.entries.get_mut(&key) else {
            return;
        };
        if slot.link_id() != Some(link_id) {
            return;
        }
        slot.link = None;
        warn!(
            "Brain: link {} of {} failed in {}: {}",
            link_id,
            key,
            slot.entry.state(),
            reason
        );
        let t = slot.entry.on_link_lost();
        self.apply(key, t);
        self.request_recovery(key, link_id);
    }

    /// Connector: wake the recovery agent if the entry needs a new link.
    fn request_recovery(&mut self, key: ConnKey, failed: LinkId) {
        let Some(slot) = self.entries.get_mut(&key) else {
            return;
        };
        if !slot.entry.triplet().are_we_connector
            || !matches!(
                slot.entry.state(),
                EntryState::Init | EntryState::Dead | EntryState::DeadClosing
            )
            || slot.last_reported_failure.is_some_and(|last| failed <= last)
        {
            return;
        }
        slot.last_reported_failure = Some(failed);
        if let Some(agent) = &slot.agent {
            let _ = agent.send(RecoveryEvent::LinkFailed(failed));
        }
    }

    // ── Inbound commands ────────────────────────────────────────────────────

    fn command_received(&mut self, link_id: LinkId, command: Command) {
        let Some(binding) = self.links.get(&link_id) else {
            trace!("Brain: {} from forgotten link {}", command.kind(), link_id);
            self.stats().stale_commands.inc();
            return;
        };
        match binding.key {
            Some(key) => self.bound_command(link_id, key, command),
            None => {
                let link = binding.handle.clone();
                self.unbound_command(link, command)
            }
        }
    }

    fn bound_command(&mut self, link_id: LinkId, key: ConnKey, command: Command) {
        let kind = command.kind();
        if command.conn != key {
            error!(
                "Brain: link {} belongs to {} but carried {} for {}",
                link_id, key, kind, command.conn
            );
            self.stats().protocol_violations.inc();
            return;
        }
        let Some(slot) = self.entries.get_mut(&key) else {
            self.stats().stale_commands.inc();
            return;
        };
        if slot.link_id() != Some(link_id) {
            trace!("Brain: {} for {} from superseded link {}", kind, key, link_id);
            self.stats().stale_commands.inc();
            return;
        }
        match handler::dispatch(&mut slot.entry, command.body) {
            Ok(t) => self.apply(key, t),
            Err(e) => {
                error!("Brain: {} rejected {}: {}", key, kind, e);
                self.stats().protocol_violations.inc();
            }
        }
    }

    fn unbound_command(&mut self, link: LinkHandle, command: Command) {
        let kind = command.kind();
        let key = command.conn;
        if self.role() != Role::Connectee {
            error!("Brain: {} for {} on unbound link {}", kind, key, link.id());
            self.stats().protocol_violations.inc();
            self.drop_link(&link);
            return;
        }
        match kind {
            CommandKind::NewConn => self.open_from_peer(link, key, command.body),
            CommandKind::JoinConn | CommandKind::JoinCloseConn => {
                self.join_from_peer(link, key, command.body)
            }
            _ => {
                error!(
                    "Brain: {} for {} before any handshake on link {}",
                    kind,
                    key,
                    link.id()
                );
                self.stats().protocol_violations.inc();
                self.drop_link(&link);
            }
        }
    }

    fn open_from_peer(&mut self, link: LinkHandle, key: ConnKey, body: CommandBody) {
        if self.draining.is_some() {
            debug!("Brain: refusing {} on link {} while shutting down", key, link.id());
            self.drop_link(&link);
            return;
        }
        if let Some(slot) = self.entries.get(&key) {
            if slot.entry.ever_established() {
                error!("Brain: NewConn for established {} on link {}", key, link.id());
                self.stats().protocol_violations.inc();
                self.drop_link(&link);
                return;
            }
            if slot.highest_link.is_some_and(|newest| link.id() <= newest) {
                trace!("Brain: NewConn for {} from superseded link {}", key, link.id());
                self.stats().stale_commands.inc();
                self.drop_link(&link);
                return;
            }
            debug!("Brain: restarting unfinished {}", key);
            if let Some(old) = self.entries.remove(&key).and_then(|slot| slot.link) {
                self.drop_link(&old);
            }
        } else {
            self.stats().connections_opened.inc();
        }
        self.entries
            .insert(key, Slot::new(Entry::new(Triplet::connectee(key), &self.config)));
        self.bind(key, link);
        self.dispatch_to(key, body);
    }

    fn join_from_peer(&mut self, link: LinkHandle, key: ConnKey, body: CommandBody) {
        let kind = body.kind();
        let Some(slot) = self.entries.get_mut(&key) else {
            debug!("Brain: {} for unknown {}", kind, key);
            if let Some(reply) = handler::unknown_connection_reply(kind) {
                link.send(&Command::new(key, reply));
            }
            self.links.remove(&link.id());
            link.close();
            return;
        };
        if slot.highest_link.is_some_and(|newest| link.id() <= newest) {
            trace!("Brain: {} for {} on outdated link {}", kind, key, link.id());
            self.stats().stale_commands.inc();
            self.drop_link(&link);
            return;
        }
        // The peer gave up on whatever link the entry still has.
        if let Some(old) = slot.link.take() {
            debug!("Brain: {} moves from link {} to {}", key, old.id(), link.id());
            self.links.remove(&old.id());
            old.abort();
            let t = slot.entry.on_link_lost();
            self.apply(key, t);
        }
        self.bind(key, link);
        self.dispatch_to(key, body);
    }

    fn dispatch_to(&mut self, key: ConnKey, body: CommandBody) {
        let Some(slot) = self.entries.get_mut(&key) else {
            return;
        };
        let kind = body.kind();
        match handler::dispatch(&mut slot.entry, body) {
            Ok(t) => self.apply(key, t),
            Err(e) => {
                error!("Brain: {} rejected {}: {}", key, kind, e);
                let link = slot.link.take();
                self.stats().protocol_violations.inc();
                if let Some(link) = link {
                    self.drop_link(&link);
                }
            }
        }
    }

    // ── Effects ─────────────────────────────────────────────────────────────

    fn apply(&mut self, key: ConnKey, t: Transition) {
        self.stats().packets_retransmitted.add(t.retransmitted);
        self.stats().duplicates_dropped.add(t.duplicates);
        let Some(slot) = self.entries.get(&key) else {
            return;
        };
        let state = slot.entry.state();
        match &slot.link {
            Some(link) => {
                for body in t.outbound {
                    link.send(&Command::new(key, body));
                }
                if state.is_established_or_closing() {
                    link.mark_settled();
                }
            }
            None if !t.outbound.is_empty() => {
                trace!(
                    "Brain: {} has no link, dropping {} command(s)",
                    key,
                    t.outbound.len()
                );
            }
            None => {}
        }
        if t.established || t.recovered {
            if let Some(agent) = &slot.agent {
                let _ = agent.send(RecoveryEvent::Recovered);
            }
        }
        if t.recovered {
            self.stats().recoveries.inc();
            info!("Brain: {} recovered over link {:?} in {}", key, slot.link_id(), state);
        }
        if t.first_established && !slot.entry.triplet().are_we_connector {
            if let Some(accepted) = &self.accepted {
                let _ = accepted.send(Accepted {
                    key,
                    input: slot.entry.input().clone(),
                });
            }
        }
        if t.established {
            self.notify_waiters(key, true);
        }
        if t.closed || state == EntryState::Closed {
            self.finish_entry(key);
        }
    }

    fn notify_waiters(&mut self, key: ConnKey, established: bool) {
        for waiter in self.waiters.remove(&key).unwrap_or_default() {
            let result = if established {
                Ok(())
            } else {
                Err(RelinkError::ConnectionClosed)
            };
            let _ = waiter.send(result);
        }
    }

    fn finish_entry(&mut self, key: ConnKey) {
        let Some(slot) = self.entries.remove(&key) else {
            return;
        };
        if let Some(link) = slot.link {
            self.links.remove(&link.id());
            link.close();
        }
        if let Some(agent) = slot.agent {
            let _ = agent.send(RecoveryEvent::Closed);
        }
        self.notify_waiters(key, false);
        self.stats().connections_closed.inc();
        info!("Brain: {} closed", key);
    }

    fn shutdown(&mut self) {
        info!(
            "Brain: shutting down with {} open connection(s)",
            self.entries.len()
        );
        for (_, mut slot) in self.entries.drain() {
            slot.entry.abandon();
            if let Some(agent) = slot.agent {
                let _ = agent.send(RecoveryEvent::Closed);
            }
        }
        for (_, binding) in self.links.drain() {
            binding.handle.abort();
        }
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(RelinkError::CoordinatorGone));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            command::{HandshakeAck, NewConnTarget, Signal},
            entry::tests::packet,
            link,
        },
        assert_matches::assert_matches,
        relink_transport::MemoryStream,
    };

    struct Harness {
        brain: Brain,
        accepted: Receiver<Accepted>,
        _inbox: Receiver<BrainMessage>,
    }

    impl Harness {
        fn new(role: Role) -> Self {
            let (handle, inbox) = BrainHandle::detached(role);
            let (accepted_tx, accepted) = unbounded();
            Self {
                brain: Brain::new(handle, RelinkConfig::dev_default(), None, Some(accepted_tx)),
                accepted,
                _inbox: inbox,
            }
        }

        fn open_link(&self) -> (LinkHandle, LinkReader, MemoryStream) {
            let (local, remote) = MemoryStream::pair("brain", "peer");
            let (handle, reader) = link::open(
                Box::new(local),
                true,
                self.brain.handle.clone(),
                &self.brain.config,
            )
            .unwrap();
            (handle, reader, remote)
        }

        fn passive_link(&mut self) -> (LinkId, MemoryStream) {
            let (handle, reader, remote) = self.open_link();
            let id = handle.id();
            self.brain.attach_passive_link(handle, reader);
            (id, remote)
        }

        fn deliver(&mut self, link: LinkId, key: ConnKey, body: CommandBody) {
            self.brain
                .handle_message(BrainMessage::CommandReceived {
                    link,
                    command: Command::new(key, body),
                });
        }

        fn stats(&self) -> StatsSnapshot {
            self.brain.handle.stats()
        }

        /// Connectee side of a completed new-connection handshake.
        fn accept_connection(&mut self, key: ConnKey) -> (LinkId, MemoryStream) {
            let (link, mut remote) = self.passive_link();
            self.deliver(link, key, CommandBody::NewConn(target()));
            assert_eq!(next_command(&mut remote).body, ack_new_conn(1));
            self.deliver(link, key, ack_new_conn(2));
            (link, remote)
        }
    }

    fn peer_key() -> ConnKey {
        ConnKey::new(NodeId(0xfeed), 7)
    }

    fn target() -> NewConnTarget {
        NewConnTarget {
            host: "service".to_string(),
            port: 80,
        }
    }

    fn ack_new_conn(step: u8) -> CommandBody {
        CommandBody::AckNewConn(HandshakeAck { step })
    }

    fn next_command(stream: &mut MemoryStream) -> Command {
        Command::read_from(stream, 1 << 20).unwrap().unwrap().0
    }

    #[test]
    fn test_new_connection_is_offered_to_listener() {
        let mut h = Harness::new(Role::Connectee);
        let (_link, _remote) = h.accept_connection(peer_key());

        let accepted = h.accepted.try_recv().unwrap();
        assert_eq!(accepted.key, peer_key());
        assert_eq!(
            h.brain.entries[&peer_key()].entry.state(),
            EntryState::Established
        );
        assert_eq!(h.stats().connections_opened, 1);
        assert_eq!(h.stats().links_opened, 1);
    }

    #[test]
    fn test_join_for_unknown_connection_gets_step_zero() {
        let mut h = Harness::new(Role::Connectee);
        let (link, mut remote) = h.passive_link();
        h.deliver(link, peer_key(), CommandBody::JoinConn(Signal));

        let reply = next_command(&mut remote);
        assert_eq!(reply.conn, peer_key());
        assert_eq!(reply.body, CommandBody::AckJoinConn(HandshakeAck { step: 0 }));
        assert_matches!(Command::read_from(&mut remote, 1 << 20), Ok(None) | Err(_));
        assert!(h.brain.links.is_empty());
    }

    #[test]
    fn test_commands_from_unknown_links_are_stale() {
        let mut h = Harness::new(Role::Connectee);
        let (handle, _reader, _remote) = h.open_link();
        h.deliver(handle.id(), peer_key(), CommandBody::NewConn(target()));
        assert_eq!(h.stats().stale_commands, 1);
        assert!(h.brain.entries.is_empty());
    }

    #[test]
    fn test_data_before_handshake_is_a_violation() {
        let mut h = Harness::new(Role::Connectee);
        let (link, _remote) = h.passive_link();
        h.deliver(link, peer_key(), CommandBody::Data(packet(0, b"x")));
        assert_eq!(h.stats().protocol_violations, 1);
        assert!(h.brain.links.is_empty());
    }

    #[test]
    fn test_join_supersedes_previous_link() {
        let mut h = Harness::new(Role::Connectee);
        let (old_link, _old_remote) = h.accept_connection(peer_key());

        let (new_link, mut new_remote) = h.passive_link();
        h.deliver(new_link, peer_key(), CommandBody::JoinConn(Signal));
        assert_eq!(
            next_command(&mut new_remote).body,
            CommandBody::AckJoinConn(HandshakeAck { step: 1 })
        );
        assert_eq!(h.brain.entries[&peer_key()].link_id(), Some(new_link));
        assert!(!h.brain.links.contains_key(&old_link));

        h.deliver(old_link, peer_key(), CommandBody::Data(packet(0, b"late")));
        assert_eq!(h.stats().stale_commands, 1);
        assert_eq!(h.brain.entries[&peer_key()].entry.next_recv_id(), 0);
    }

    #[test]
    fn test_command_for_other_connection_is_rejected() {
        let mut h = Harness::new(Role::Connectee);
        let (link, _remote) = h.accept_connection(peer_key());
        let other = ConnKey::new(NodeId(0xfeed), 8);
        h.deliver(link, other, CommandBody::Data(packet(0, b"x")));
        assert_eq!(h.stats().protocol_violations, 1);
        assert!(!h.brain.entries.contains_key(&other));
    }

    #[test]
    fn test_new_conn_for_established_connection_is_refused() {
        let mut h = Harness::new(Role::Connectee);
        let (link, _remote) = h.accept_connection(peer_key());
        let (second, _second_remote) = h.passive_link();
        h.deliver(second, peer_key(), CommandBody::NewConn(target()));
        assert_eq!(h.stats().protocol_violations, 1);
        assert_eq!(h.brain.entries[&peer_key()].link_id(), Some(link));
    }

    #[test]
    fn test_late_new_conn_on_older_link_is_stale() {
        let mut h = Harness::new(Role::Connectee);
        let (first, _first_remote) = h.passive_link();
        let (second, mut second_remote) = h.passive_link();
        h.deliver(second, peer_key(), CommandBody::NewConn(target()));
        assert_eq!(next_command(&mut second_remote).body, ack_new_conn(1));

        h.deliver(first, peer_key(), CommandBody::NewConn(target()));
        assert_eq!(h.stats().stale_commands, 1);
        assert_eq!(h.stats().connections_opened, 1);
        assert_eq!(h.brain.entries[&peer_key()].link_id(), Some(second));
        assert!(!h.brain.links.contains_key(&first));
        assert!(h.brain.links.contains_key(&second));
    }

    #[test]
    fn test_join_on_older_link_keeps_current_link() {
        let mut h = Harness::new(Role::Connectee);
        let (first, _first_remote) = h.passive_link();
        let (current, _remote) = h.accept_connection(peer_key());
        h.deliver(first, peer_key(), CommandBody::JoinConn(Signal));
        assert_eq!(h.stats().stale_commands, 1);
        assert_eq!(h.brain.entries[&peer_key()].link_id(), Some(current));
        assert_eq!(
            h.brain.entries[&peer_key()].entry.state(),
            EntryState::Established
        );
    }

    #[test]
    fn test_connector_link_failure_wakes_agent_once() {
        let mut h = Harness::new(Role::Connector);
        let conn = h
            .brain
            .init_connection("service:80".into(), "service".into(), 80)
            .unwrap();
        let (agent_tx, agent_rx) = unbounded();
        h.brain.entries.get_mut(&conn.key).unwrap().agent = Some(agent_tx);

        let (handle, reader, mut remote) = h.open_link();
        let link = handle.id();
        h.brain
            .initiate(conn.key, InitiateKind::NewConnection, Some((handle, reader)))
            .unwrap();
        assert_eq!(
            next_command(&mut remote).body,
            CommandBody::NewConn(target())
        );

        h.brain.link_failed(link, "test");
        h.brain.link_failed(link, "test");
        assert_matches!(agent_rx.try_recv(), Ok(RecoveryEvent::LinkFailed(id)) if id == link);
        assert!(agent_rx.try_recv().is_err());
        assert_eq!(h.brain.entries[&conn.key].entry.state(), EntryState::Init);

        // A newer link takes over.
        let (handle, reader, _remote) = h.open_link();
        assert!(h
            .brain
            .initiate(conn.key, InitiateKind::ExistingConnection, Some((handle, reader)))
            .is_ok());
    }

    #[test]
    fn test_waiters_learn_about_close() {
        let mut h = Harness::new(Role::Connector);
        let conn = h
            .brain
            .init_connection("service:80".into(), "service".into(), 80)
            .unwrap();
        let (reply, waiter) = bounded(1);
        h.brain.await_established(conn.key, reply);
        h.brain.local_close(conn.key);
        assert_matches!(waiter.try_recv(), Ok(Err(RelinkError::ConnectionClosed)));
        assert!(h.brain.entries.is_empty());
        assert_eq!(h.stats().connections_closed, 1);
    }

    #[test]
    fn test_shutdown_aborts_readers() {
        let mut h = Harness::new(Role::Connectee);
        let (_link, _remote) = h.accept_connection(peer_key());
        let input = h.accepted.try_recv().unwrap().input;
        h.brain.shutdown();
        let mut buf = [0u8; 1];
        assert!(input.read(&mut buf).is_err());
        assert!(h.brain.links.is_empty());
    }

    #[test]
    fn test_drain_closes_open_connections() {
        let mut h = Harness::new(Role::Connectee);
        let (link, _remote) = h.accept_connection(peer_key());

        assert!(!h.brain.begin_drain());
        assert!(h.brain.draining.is_some());
        let slot = &h.brain.entries[&peer_key()];
        assert!(slot.entry.state().is_closing());
        assert_eq!(slot.link_id(), Some(link));
        assert!(h.brain.links.contains_key(&link));

        // A second shutdown request stops waiting.
        assert!(h.brain.begin_drain());
    }

    #[test]
    fn test_drain_with_nothing_open_stops_at_once() {
        let mut h = Harness::new(Role::Connector);
        let conn = h
            .brain
            .init_connection("service:80".into(), "service".into(), 80)
            .unwrap();
        // Never established, so closing it needs no handshake.
        assert!(h.brain.begin_drain());
        assert!(!h.brain.entries.contains_key(&conn.key));
        assert_eq!(h.stats().connections_closed, 1);
    }

    #[test]
    fn test_draining_refuses_new_connections() {
        let mut h = Harness::new(Role::Connectee);
        let (_link, _remote) = h.accept_connection(peer_key());
        assert!(!h.brain.begin_drain());

        let other = ConnKey::new(NodeId(0xfeed), 8);
        let (late, _late_remote) = h.passive_link();
        h.deliver(late, other, CommandBody::NewConn(target()));
        assert!(!h.brain.entries.contains_key(&other));
        assert!(!h.brain.links.contains_key(&late));

        let (reply, result) = bounded(1);
        h.brain.handle_message(BrainMessage::InitConnection {
            remote: "service:80".into(),
            host: "service".into(),
            port: 80,
            reply,
        });
        assert_matches!(result.try_recv(), Ok(Err(RelinkError::CoordinatorGone)));
    }

    #[test]
    fn test_stale_links_are_shut_down() {
        let mut h = Harness::new(Role::Connectee);
        let (handle, reader, remote) = h.open_link();
        h.brain.attach_passive_link(handle.clone(), reader);
        h.brain.link_failed(handle.id(), "test");
        assert!(!handle.is_alive());
        assert!(h.brain.links.is_empty());
        drop(remote);
    }
}
