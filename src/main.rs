use std::path::{Path, PathBuf};
use std::process;

use argh::FromArgs;
use crossbeam_channel as chan;

use log::*;

use agent_relay::notifier::Notifier;
use agent_relay::reactor::{self, Config, Reactor};
use agent_relay::sys;
use agent_relay::Error;

#[derive(FromArgs)]
/// Intercepting proxy for an ssh-agent socket. Peers connecting to the
/// proxy socket are authenticated against the local user, bridged to the
/// real agent and announced by running the notifier.
struct Options {
    /// path of the proxy socket to create
    #[argh(positional)]
    listen: PathBuf,

    /// path of the real agent socket
    #[argh(positional)]
    agent: PathBuf,

    /// notifier program, followed by its arguments
    #[argh(positional, greedy)]
    notifier: Vec<String>,
}

fn main() {
    let opts: Options = argh::from_env();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let notifier = match Notifier::from_command(opts.notifier) {
        Some(notifier) => notifier,
        None => {
            eprintln!("usage: agent-relay <listen-path> <agent-path> <notifier> [notifier-arg ...]");
            process::exit(1);
        }
    };

    if let Err(err) = run(&opts.listen, opts.agent, notifier) {
        error!("Fatal: {}", err);
        process::exit(1);
    }
}

fn run(listen: &Path, agent: PathBuf, notifier: Notifier) -> Result<(), Error> {
    sys::reap_children_automatically().map_err(Error::Signals)?;

    let listener = reactor::listen(listen)?;
    let mut reactor = Reactor::new(Config::new(agent, notifier))?;

    info!("Listening on {}..", listen.display());

    // The sender is held for the life of the process; the proxy runs until
    // it is killed.
    let (_shutdown, shutdown_recv) = chan::bounded::<()>(1);

    reactor.run(listener, shutdown_recv)
}
