//! Active and passive endpoints.
//!
//! A [`Connector`] dials out and owns the recovery of every connection it
//! creates. A [`Listener`] accepts links and hands out the connections
//! remote connectors establish over them. Each endpoint runs its own
//! coordinator; sockets keep it alive after the endpoint is dropped.

use {
    crate::{
        brain::{Accepted, BrainHandle, BrainService, Role},
        config::RelinkConfig,
        error::{RelinkError, Result},
        link,
        socket::VirtualSocket,
        stats::StatsSnapshot,
        triplet::{ConnKey, NodeId},
    },
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError},
    log::*,
    relink_transport::{split_host_port, LinkAcceptor, Transport},
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Opens virtual connections to listeners.
pub struct Connector {
    service: Arc<BrainService>,
    transport: Arc<dyn Transport>,
    config: RelinkConfig,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, config: RelinkConfig) -> Result<Self> {
        let service = BrainService::spawn(
            Role::Connector,
            config.clone(),
            Some(transport.clone()),
            None,
        )?;
        Ok(Self {
            service,
            transport,
            config,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.brain().node_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.brain().stats()
    }

    fn brain(&self) -> &BrainHandle {
        self.service.handle()
    }

    /// Open a virtual connection to the listener at `addr`.
    ///
    /// If `addr` cannot be reached right away the connection is retried in
    /// the background; this call keeps waiting (logging a warning every
    /// `connect_warn_interval`) until the handshake completes or
    /// `connect_timeout` expires.
    pub fn connect(&self, addr: &str) -> Result<VirtualSocket> {
        let (host, port) = split_host_port(addr).map_err(io::Error::from)?;
        let brain = self.brain();
        let conn = brain.init_connection(addr, &host, port)?;
        let key = conn.key;

        let result = brain
            .await_established(key)
            .and_then(|established| {
                let link = match self.transport.dial(addr) {
                    Ok(stream) => match link::open(stream, false, brain.clone(), &self.config) {
                        Ok(opened) => Some(opened),
                        Err(e) => {
                            warn!("Connector: cannot open link to {}: {}", addr, e);
                            None
                        }
                    },
                    Err(e) => {
                        warn!(
                            "Connector: dialing {} failed, retrying in the background: {}",
                            addr, e
                        );
                        None
                    }
                };
                brain.initiate_connection(key, link)?;
                self.wait_established(key, &established)
            });
        if let Err(e) = result {
            let _ = brain.on_local_close(key);
            return Err(e);
        }

        info!("Connector: {} established to {}", key, addr);
        Ok(VirtualSocket::new(
            self.service.clone(),
            key,
            conn.input,
            self.config.max_packet_payload,
        ))
    }

    fn wait_established(&self, key: ConnKey, established: &Receiver<Result<()>>) -> Result<()> {
        let started = Instant::now();
        loop {
            let mut wait = self.config.connect_warn_interval;
            if let Some(limit) = self.config.connect_timeout {
                let remaining = limit.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    warn!("Connector: {} not established within {:?}", key, limit);
                    return Err(RelinkError::ConnectTimeout(limit));
                }
                wait = wait.min(remaining);
            }
            match established.recv_timeout(wait) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if self
                        .config
                        .connect_timeout
                        .is_some_and(|limit| started.elapsed() >= limit)
                    {
                        continue;
                    }
                    warn!(
                        "Connector: still waiting for {} after {:?}",
                        key,
                        started.elapsed()
                    );
                }
                Err(RecvTimeoutError::Disconnected) => return Err(RelinkError::CoordinatorGone),
            }
        }
    }
}

/// Accepts virtual connections.
pub struct Listener {
    service: Arc<BrainService>,
    acceptor: Arc<dyn LinkAcceptor>,
    accepted: Receiver<Accepted>,
    exit: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    max_packet_payload: usize,
}

impl Listener {
    /// Listen on `addr` of `transport`.
    pub fn bind(transport: &dyn Transport, addr: &str, config: RelinkConfig) -> Result<Self> {
        let acceptor = transport.listen(addr)?;
        Self::from_acceptor(acceptor, config)
    }

    /// Serve connections arriving on an existing acceptor.
    pub fn from_acceptor(acceptor: Box<dyn LinkAcceptor>, config: RelinkConfig) -> Result<Self> {
        let (accepted_tx, accepted) = unbounded();
        let service = BrainService::spawn(Role::Connectee, config.clone(), None, Some(accepted_tx))?;
        let acceptor: Arc<dyn LinkAcceptor> = Arc::from(acceptor);
        let exit = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let acceptor = acceptor.clone();
            let brain = service.handle().clone();
            let exit = exit.clone();
            let config = config.clone();
            Builder::new()
                .name("relinkAccept".to_string())
                .spawn(move || Self::accept_loop(acceptor.as_ref(), &brain, &config, &exit))?
        };
        info!("Listener: accepting on {}", acceptor.local_addr());

        Ok(Self {
            service,
            acceptor,
            accepted,
            exit,
            accept_thread: Some(accept_thread),
            max_packet_payload: config.max_packet_payload,
        })
    }

    fn accept_loop(
        acceptor: &dyn LinkAcceptor,
        brain: &BrainHandle,
        config: &RelinkConfig,
        exit: &AtomicBool,
    ) {
        while !exit.load(Ordering::Acquire) {
            match acceptor.accept() {
                Ok(stream) => match link::open(stream, true, brain.clone(), config) {
                    Ok((link, reader)) => {
                        if brain.attach_passive_link(link.clone(), reader).is_err() {
                            link.abort();
                            break;
                        }
                    }
                    Err(e) => warn!("Listener: cannot open accepted link: {}", e),
                },
                Err(e) => {
                    if exit.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("Listener: accept failed: {}", e);
                    thread::sleep(config.tick_interval);
                }
            }
        }
        debug!("Listener: accept loop exiting");
    }

    pub fn local_addr(&self) -> String {
        self.acceptor.local_addr()
    }

    pub fn node_id(&self) -> NodeId {
        self.service.handle().node_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.service.handle().stats()
    }

    /// Block until a remote connector establishes a connection.
    pub fn accept(&self) -> Result<VirtualSocket> {
        let accepted = self
            .accepted
            .recv()
            .map_err(|_| RelinkError::CoordinatorGone)?;
        Ok(self.socket(accepted))
    }

    /// Like [`Listener::accept`], giving up after `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<VirtualSocket>> {
        match self.accepted.recv_timeout(timeout) {
            Ok(accepted) => Ok(Some(self.socket(accepted))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RelinkError::CoordinatorGone),
        }
    }

    fn socket(&self, accepted: Accepted) -> VirtualSocket {
        debug!("Listener: accepted {}", accepted.key);
        VirtualSocket::new(
            self.service.clone(),
            accepted.key,
            accepted.input,
            self.max_packet_payload,
        )
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        self.acceptor.close();
        if let Some(thread) = self.accept_thread.take() {
            if thread.join().is_err() {
                error!("Listener: accept thread panicked");
            }
        }
    }
}
