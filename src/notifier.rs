//! The per-connection notifier program.
use std::io;
use std::process::{Command, Stdio};

/// Environment variable carrying the peer's process id to the notifier.
pub const PEER_PID_ENV: &str = "SSH_CONN_PID";

/// The operator-configured program spawned once per accepted connection,
/// so that agent use can be signalled or prompted for.
#[derive(Debug, Clone)]
pub struct Notifier {
    program: String,
    args: Vec<String>,
}

impl Notifier {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Build a notifier from a command line, program first. `None` if the
    /// command line is empty.
    pub fn from_command(mut command: Vec<String>) -> Option<Self> {
        if command.is_empty() {
            return None;
        }
        let args = command.split_off(1);
        let program = command.remove(0);

        Some(Self { program, args })
    }

    /// Launch the notifier for a peer. Standard input comes from the null
    /// device so the program can't read the session; standard output and
    /// error are inherited from the proxy.
    ///
    /// The child handle is dropped right away: terminated children are
    /// reaped by the kernel, see [`crate::sys::reap_children_automatically`].
    pub fn spawn(&self, peer_pid: libc::pid_t) -> io::Result<()> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .env(PEER_PID_ENV, peer_pid.to_string())
            .spawn()
            .map(|_child| ())
    }
}
