//! Poll-based proxy reactor. This is a single-threaded reactor using a
//! `poll` loop to drive every connection's state machine to completion.
use std::io;
use std::io::prelude::*;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;

use log::*;

use crate::conn::{Connection, EndpointKind, Phase};
use crate::error::Error;
use crate::notifier::Notifier;
use crate::pool::{ConnId, Pool, MAX_CONNECTIONS};
use crate::sys;

/// Maximum amount of time to wait for i/o.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 8192;
/// Listen backlog of the proxy socket.
const LISTEN_BACKLOG: libc::c_int = 5;

#[derive(Debug, PartialEq, Eq, Clone)]
enum Source {
    Conn(ConnId, EndpointKind),
    Listener,
    Waker,
}

/// Outcome of a single pump between an endpoint and its partner.
enum Pump {
    /// Bytes forwarded, or nothing to read yet.
    Continue,
    /// The source performed an orderly shutdown.
    Eof,
    /// Read or write failed; the connection is unusable.
    Fatal,
}

/// Used to wake up the main event loop.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// Reactor configuration.
#[derive(Debug)]
pub struct Config {
    /// Path of the real agent socket.
    pub agent: PathBuf,
    /// Program run once per accepted connection.
    pub notifier: Notifier,
    /// Connection pool capacity.
    pub capacity: usize,
}

impl Config {
    pub fn new(agent: PathBuf, notifier: Notifier) -> Self {
        Self {
            agent,
            notifier,
            capacity: MAX_CONNECTIONS,
        }
    }
}

/// A single-threaded non-blocking proxy reactor.
pub struct Reactor {
    pool: Pool,
    sources: popol::Sources<Source>,
    waker: Waker,
    agent_path: PathBuf,
    notifier: Notifier,
}

/// Create the proxy's listening socket. Owner-only, non-blocking,
/// close-on-exec; a stale socket at the path is replaced.
pub fn listen<P: AsRef<Path>>(path: P) -> Result<UnixListener, Error> {
    sys::bind(path.as_ref(), LISTEN_BACKLOG).map_err(Error::Listen)
}

impl Reactor {
    /// Construct a new reactor.
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker(Arc::new(
            popol::Waker::new(&mut sources, Source::Waker).map_err(Error::Poll)?,
        ));

        Ok(Self {
            pool: Pool::with_capacity(config.capacity),
            sources,
            waker,
            agent_path: config.agent,
            notifier: config.notifier,
        })
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop, eg. after sending a shutdown.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Run the proxy on the given listener until a shutdown is received.
    pub fn run(
        &mut self,
        listener: UnixListener,
        shutdown: chan::Receiver<()>,
    ) -> Result<(), Error> {
        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = popol::Events::new();

        loop {
            trace!(
                "Polling {} source(s), {} connection(s) live..",
                self.sources.len(),
                self.pool.len()
            );

            match self.sources.wait_timeout(&mut events, WAIT_TIMEOUT) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Poll(err)),
            }

            for (source, ev) in events.iter() {
                match source {
                    Source::Conn(id, kind) => self.endpoint_ready(*id, *kind),
                    Source::Listener => self.accept_peer(&listener),
                    Source::Waker => {
                        // Exit the loop if a shutdown was received.
                        if shutdown.try_recv().is_ok() {
                            return Ok(());
                        }
                        popol::Waker::reset(ev.source).ok();
                    }
                }
            }
        }
    }

    /// Accept one peer and set up its session. One accept per readiness
    /// event keeps the loop fair under load; poll is level-triggered, so a
    /// non-empty backlog re-reports.
    fn accept_peer(&mut self, listener: &UnixListener) {
        let (peer, _addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Spurious wakeup.
                return;
            }
            Err(err) => {
                error!("Accept error: {}", err);
                return;
            }
        };
        if let Err(err) = peer.set_nonblocking(true) {
            error!("Accept error: {}", err);
            return;
        }

        // Dropping the peer on any refusal below closes it.
        let creds = match sys::peer_credentials(&peer) {
            Ok(creds) => creds,
            Err(err) => {
                error!("Unable to look up peer credentials: {}", err);
                return;
            }
        };
        if creds.uid != sys::user_id() {
            warn!(
                "Denied: connecting process owned by other user, uid: {}",
                creds.uid
            );
            return;
        }

        if self.pool.is_full() {
            warn!("Too many connections, refusing peer (pid {})", creds.pid);
            return;
        }

        let (agent, phase) = match sys::connect(&self.agent_path) {
            Ok(sys::Connect::Ready(agent)) => (agent, Phase::Established),
            Ok(sys::Connect::Pending(agent)) => (agent, Phase::AgentConnecting),
            Err(err) => {
                error!(
                    "Connect to agent {}: {}",
                    self.agent_path.display(),
                    err
                );
                return;
            }
        };

        let id = match self
            .pool
            .insert(Connection::new(peer, agent, phase, creds.pid))
        {
            Some(id) => id,
            None => return, // capacity checked above
        };
        self.register(id);

        debug!("{:?}: Accepted peer (pid {}, {:?})", id, creds.pid, phase);

        if let Err(err) = self.notifier.spawn(creds.pid) {
            error!("{:?}: Notifier failed to spawn: {}", id, err);
            self.teardown(id);
        }
    }

    /// Register a fresh connection's subscriptions. The peer endpoint is
    /// deliberately left out until the agent connect has resolved, so no
    /// peer bytes are consumed for a session that may never establish.
    fn register(&mut self, id: ConnId) {
        let conn = match self.pool.get(id) {
            Some(conn) => conn,
            None => return,
        };
        match conn.phase {
            Phase::Established => {
                self.sources.register(
                    Source::Conn(id, EndpointKind::Agent),
                    &conn.agent,
                    popol::interest::READ,
                );
                self.sources.register(
                    Source::Conn(id, EndpointKind::Peer),
                    &conn.peer,
                    popol::interest::READ,
                );
            }
            Phase::AgentConnecting => {
                self.sources.register(
                    Source::Conn(id, EndpointKind::Agent),
                    &conn.agent,
                    popol::interest::WRITE,
                );
            }
        }
    }

    /// Drive one endpoint's state machine on a readiness event.
    fn endpoint_ready(&mut self, id: ConnId, kind: EndpointKind) {
        let phase = match self.pool.get(id) {
            Some(conn) => conn.phase,
            // The record was torn down earlier in this batch.
            None => return,
        };

        if kind == EndpointKind::Agent && phase == Phase::AgentConnecting {
            self.complete_agent_connect(id);
            return;
        }

        match self.pump(id, kind) {
            Pump::Continue => {}
            Pump::Eof => {
                debug!("{:?}: {:?} closed the stream", id, kind);
                self.teardown(id);
            }
            Pump::Fatal => self.teardown(id),
        }
    }

    /// Resolve a pending agent connect, signalled by write-readiness.
    ///
    /// "A file descriptor for a socket that is connecting asynchronously
    /// shall indicate that it is ready for writing, once a connection has
    /// been established."
    fn complete_agent_connect(&mut self, id: ConnId) {
        let connected = match self.pool.get_mut(id) {
            Some(conn) => match conn.agent.take_error() {
                Ok(None) => {
                    conn.phase = Phase::Established;
                    true
                }
                Ok(Some(err)) => {
                    error!("{:?}: Connect to agent: {}", id, err);
                    false
                }
                Err(err) => {
                    error!("{:?}: Connect to agent: {}", id, err);
                    false
                }
            },
            None => return,
        };
        if !connected {
            self.teardown(id);
            return;
        }

        if let Some(source) = self.sources.get_mut(&Source::Conn(id, EndpointKind::Agent)) {
            source.unset(popol::interest::WRITE);
            source.set(popol::interest::READ);
        }
        if let Some(conn) = self.pool.get(id) {
            self.sources.register(
                Source::Conn(id, EndpointKind::Peer),
                &conn.peer,
                popol::interest::READ,
            );
        }

        debug!("{:?}: Established", id);
    }

    /// Forward one buffer of bytes from the ready endpoint to its partner:
    /// a single non-blocking read, then a write to completion. Reading only
    /// once per readiness event gives other connections and the listener
    /// fair access to the loop; poll is level-triggered, so leftover data
    /// re-reports.
    fn pump(&mut self, id: ConnId, kind: EndpointKind) -> Pump {
        let conn = match self.pool.get_mut(id) {
            Some(conn) => conn,
            None => return Pump::Continue,
        };
        let (src, dst) = conn.split_mut(kind);
        let mut buffer = [0; READ_BUFFER_SIZE];

        let count = match src.read(&mut buffer) {
            Ok(0) => return Pump::Eof,
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Spurious wakeup.
                return Pump::Continue;
            }
            Err(err) => {
                error!("{:?}: Read error on {:?} endpoint: {}", id, kind, err);
                return Pump::Fatal;
            }
        };

        // A disconnected partner surfaces as `EPIPE` here, not as a signal:
        // the Rust runtime ignores `SIGPIPE` at startup.
        if let Err(err) = dst.write_all(&buffer[..count]) {
            error!(
                "{:?}: Write error on {:?} endpoint: {}",
                id,
                kind.partner(),
                err
            );
            return Pump::Fatal;
        }
        trace!("{:?}: Forwarded {} bytes from {:?}", id, count, kind);

        Pump::Continue
    }

    /// Tear down a connection: withdraw both subscriptions, then release
    /// the record. Dropping it closes both descriptors. Unregistering a
    /// never-registered peer endpoint is a no-op.
    fn teardown(&mut self, id: ConnId) {
        self.sources
            .unregister(&Source::Conn(id, EndpointKind::Peer));
        self.sources
            .unregister(&Source::Conn(id, EndpointKind::Agent));

        if let Some(conn) = self.pool.release(id) {
            trace!("{:?}: Closed (pid {})", id, conn.peer_pid);
        }
    }
}
