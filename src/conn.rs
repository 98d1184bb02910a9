//! Per-session connection state.
use std::os::unix::net::UnixStream;

/// Which side of the splice an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// The accepted client of the proxy.
    Peer,
    /// The upstream agent.
    Agent,
}

impl EndpointKind {
    /// The endpoint on the other side of the splice.
    pub fn partner(self) -> EndpointKind {
        match self {
            Self::Peer => Self::Agent,
            Self::Agent => Self::Peer,
        }
    }
}

/// Phase of a proxied session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The connect to the agent hasn't resolved yet. Only the agent
    /// endpoint is watched, for write-readiness.
    AgentConnecting,
    /// Bytes flow in both directions; both endpoints are watched for
    /// read-readiness.
    Established,
}

/// A proxied session: the accepted peer stream and its upstream agent
/// stream. Dropping a connection closes both descriptors.
#[derive(Debug)]
pub struct Connection {
    pub peer: UnixStream,
    pub agent: UnixStream,
    pub phase: Phase,
    /// Process id of the connecting peer, as reported by the kernel at
    /// accept time. Handed to the notifier, never updated.
    pub peer_pid: libc::pid_t,
}

impl Connection {
    pub fn new(peer: UnixStream, agent: UnixStream, phase: Phase, peer_pid: libc::pid_t) -> Self {
        Self {
            peer,
            agent,
            phase,
            peer_pid,
        }
    }

    /// The stream of the given endpoint and its partner, source first.
    pub fn split_mut(&mut self, kind: EndpointKind) -> (&mut UnixStream, &mut UnixStream) {
        match kind {
            EndpointKind::Peer => (&mut self.peer, &mut self.agent),
            EndpointKind::Agent => (&mut self.agent, &mut self.peer),
        }
    }
}
