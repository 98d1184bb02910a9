//! An intercepting proxy for an ssh-agent socket.
//!
//! The proxy listens on its own Unix socket and fronts the real agent: every
//! peer that connects is authenticated against the local user via the
//! kernel's peer credentials, bridged to a fresh connection to the agent,
//! and announced by spawning a configured notifier program. Bytes are
//! spliced in both directions until either side closes.
//!
//! Everything runs on a single thread: a poll-based readiness loop drives
//! all connections cooperatively, each through a small state machine
//! (pending upstream connect, bidirectional pump, teardown).
pub mod conn;
pub mod error;
pub mod notifier;
pub mod pool;
pub mod reactor;
pub mod sys;

pub use error::Error;
