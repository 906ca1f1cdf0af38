//! Connector-side recovery agent.
//!
//! Every connector connection owns one agent thread. It sleeps until the
//! coordinator reports that the connection has no usable link, then dials
//! the remote address and starts whichever handshake the entry's state
//! calls for, retrying until the connection is recovered or closed.

use {
    crate::{
        brain::BrainHandle,
        config::RelinkConfig,
        entry::EntryState,
        error::{RelinkError, Result},
        link::{self, LinkHandle, LinkId},
        triplet::ConnKey,
    },
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    relink_transport::Transport,
    std::{
        sync::Arc,
        thread::Builder,
        time::Instant,
    },
};

/// Coordinator to agent notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// The first dial is the agent's job.
    Start,
    /// The link with this id died and the entry needs a new one.
    LinkFailed(LinkId),
    /// A handshake on the current link completed.
    Recovered,
    /// The connection is gone; the agent exits.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Recovered,
    Failed,
    Stop,
}

struct RecoveryAgent {
    key: ConnKey,
    remote: String,
    transport: Arc<dyn Transport>,
    brain: BrainHandle,
    config: RelinkConfig,
    events: Receiver<RecoveryEvent>,
    /// Link of the most recent attempt. Failures of older links are noise.
    last_attempt: Option<LinkId>,
}

/// Start the agent thread for `key`.
pub fn spawn_agent(
    key: ConnKey,
    remote: String,
    transport: Arc<dyn Transport>,
    brain: BrainHandle,
    config: RelinkConfig,
) -> Result<Sender<RecoveryEvent>> {
    let (sender, events) = unbounded();
    let agent = RecoveryAgent {
        key,
        remote,
        transport,
        brain,
        config,
        events,
        last_attempt: None,
    };
    Builder::new()
        .name(format!("relinkRecover{}", key.connection_id))
        .spawn(move || agent.run())?;
    Ok(sender)
}

impl RecoveryAgent {
    fn run(mut self) {
        while let Ok(event) = self.events.recv() {
            match event {
                RecoveryEvent::Start => {}
                RecoveryEvent::LinkFailed(failed) => {
                    if self.last_attempt.is_some_and(|last| failed < last) {
                        trace!("Recovery {}: ignoring failure of old link {}", self.key, failed);
                        continue;
                    }
                }
                RecoveryEvent::Recovered => continue,
                RecoveryEvent::Closed => break,
            }
            if !self.recover() {
                break;
            }
        }
        debug!("Recovery {}: exiting", self.key);
    }

    /// Returns false once the connection is gone.
    fn recover(&mut self) -> bool {
        let mut attempts = 0u64;
        loop {
            let state = match self.brain.entry_state(self.key) {
                Ok(Some(state)) if state != EntryState::Closed => state,
                _ => return false,
            };
            if !matches!(
                state,
                EntryState::Init | EntryState::Dead | EntryState::DeadClosing
            ) {
                // Someone else already put a link in place.
                return true;
            }
            attempts = attempts.saturating_add(1);
            match self.attempt(state, attempts) {
                Attempt::Recovered => {
                    if attempts > 1 {
                        info!("Recovery {}: recovered after {} attempts", self.key, attempts);
                    }
                    return true;
                }
                Attempt::Stop => return false,
                Attempt::Failed => {
                    match self.events.recv_timeout(self.config.recovery_retry_delay) {
                        Ok(RecoveryEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                            return false
                        }
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            }
        }
    }

    fn attempt(&mut self, state: EntryState, attempt: u64) -> Attempt {
        let stream = match self.transport.dial(&self.remote) {
            Ok(stream) => stream,
            Err(e) => {
                if attempt.is_power_of_two() {
                    warn!(
                        "Recovery {}: dialing {} failed (attempt {}): {}",
                        self.key, self.remote, attempt, e
                    );
                }
                return Attempt::Failed;
            }
        };
        let (handle, reader) = match link::open(stream, false, self.brain.clone(), &self.config) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Recovery {}: cannot open link: {}", self.key, e);
                return Attempt::Failed;
            }
        };
        let link_id = handle.id();
        self.last_attempt = Some(link_id);
        debug!(
            "Recovery {}: attempt {} from {} over link {}",
            self.key, attempt, state, link_id
        );

        let initiated = match state {
            EntryState::Init => {
                self.brain
                    .initiate_existing_connection(self.key, handle.clone(), reader)
            }
            EntryState::Dead => self.brain.initiate_join(self.key, handle.clone(), reader),
            _ => self.brain.initiate_join_close(self.key, handle.clone(), reader),
        };
        match initiated {
            Ok(()) => self.await_outcome(&handle),
            Err(RelinkError::UnknownConnection(_) | RelinkError::CoordinatorGone) => Attempt::Stop,
            Err(e) => {
                debug!("Recovery {}: link {} refused: {}", self.key, link_id, e);
                handle.abort();
                Attempt::Failed
            }
        }
    }

    fn await_outcome(&mut self, link: &LinkHandle) -> Attempt {
        let link_id = link.id();
        let deadline = Instant::now()
            .checked_add(self.config.join_success_timeout)
            .unwrap_or_else(Instant::now);
        loop {
            match self.events.recv_deadline(deadline) {
                Ok(RecoveryEvent::Recovered) => return Attempt::Recovered,
                Ok(RecoveryEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    return Attempt::Stop
                }
                Ok(RecoveryEvent::LinkFailed(failed)) if failed >= link_id => {
                    return Attempt::Failed
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Recovery {}: handshake on link {} did not finish within {:?}",
                        self.key, link_id, self.config.join_success_timeout
                    );
                    let _ = self.brain.on_link_failure(link_id);
                    return Attempt::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::brain::{BrainMessage, InitiateKind, Role},
        relink_transport::{LinkAcceptor, MemoryNetwork},
        std::time::Duration,
    };

    fn agent(
        network: &MemoryNetwork,
        remote: &str,
    ) -> (Sender<RecoveryEvent>, Receiver<BrainMessage>) {
        let (brain, inbox) = BrainHandle::detached(Role::Connector);
        let config = RelinkConfig {
            join_success_timeout: Duration::from_millis(200),
            ..RelinkConfig::dev_default()
        };
        let events = spawn_agent(
            ConnKey::new(brain.node_id(), 1),
            remote.to_string(),
            Arc::new(network.clone()),
            brain,
            config,
        )
        .unwrap();
        (events, inbox)
    }

    fn answer_query(inbox: &Receiver<BrainMessage>, state: EntryState) {
        match inbox.recv_timeout(Duration::from_secs(5)).unwrap() {
            BrainMessage::Query { reply, .. } => {
                let _ = reply.send(Some(crate::brain::EntryStatus {
                    state,
                    input_closed: false,
                }));
            }
            _ => panic!("expected a state query"),
        }
    }

    #[test]
    fn test_dead_connection_is_joined() {
        let network = MemoryNetwork::new();
        let acceptor = network.listen("server:1").unwrap();
        let (events, inbox) = agent(&network, "server:1");

        events.send(RecoveryEvent::Start).unwrap();
        answer_query(&inbox, EntryState::Dead);
        let _accepted = acceptor.accept().unwrap();
        match inbox.recv_timeout(Duration::from_secs(5)).unwrap() {
            BrainMessage::Initiate {
                kind, link, reply, ..
            } => {
                assert_eq!(kind, InitiateKind::Join);
                assert!(link.is_some());
                reply.send(Ok(())).unwrap();
            }
            _ => panic!("expected a join"),
        }
        events.send(RecoveryEvent::Recovered).unwrap();
        events.send(RecoveryEvent::Closed).unwrap();
    }

    #[test]
    fn test_unreachable_peer_is_retried() {
        let network = MemoryNetwork::new();
        let (events, inbox) = agent(&network, "nowhere:1");

        events.send(RecoveryEvent::Start).unwrap();
        answer_query(&inbox, EntryState::Init);
        // The dial fails, so the next thing the agent does is look again.
        answer_query(&inbox, EntryState::Init);
        answer_query(&inbox, EntryState::Closed);
    }

    #[test]
    fn test_handshake_timeout_abandons_link() {
        let network = MemoryNetwork::new();
        let _acceptor = network.listen("server:1").unwrap();
        let (events, inbox) = agent(&network, "server:1");

        events.send(RecoveryEvent::Start).unwrap();
        answer_query(&inbox, EntryState::DeadClosing);
        let attempted = match inbox.recv_timeout(Duration::from_secs(5)).unwrap() {
            BrainMessage::Initiate {
                kind, link, reply, ..
            } => {
                assert_eq!(kind, InitiateKind::JoinClose);
                reply.send(Ok(())).unwrap();
                link.unwrap().0.id()
            }
            _ => panic!("expected a join-close"),
        };
        match inbox.recv_timeout(Duration::from_secs(5)).unwrap() {
            BrainMessage::LinkFailed { link, .. } => assert_eq!(link, attempted),
            _ => panic!("expected the link to be abandoned"),
        }
        events.send(RecoveryEvent::Closed).unwrap();
    }
}
