//! Single-threaded echo runtime.
//!
//! - `activation`: inherited or freshly bound listen sockets
//! - `control`: signalfd for SIGTERM/SIGHUP, timerfd for the watchdog
//! - `notify`: `READY=1`/`WATCHDOG=1` to the supervisor
//! - `connection`/`buffer`: per-connection echo state machine
//! - `datagram`: stateless UDP echo
//! - `event_loop`: mio poll loop tying the above together

pub mod activation;
mod buffer;
mod connection;
pub mod control;
mod datagram;
mod event_loop;
pub mod notify;
mod token;

pub use event_loop::EventLoop;

use crate::config::{CliArgs, ConfigError, ServiceConfig};
use activation::ActivationError;
use control::ControlChannel;
use notify::Notifier;
use std::fmt;
use std::io;
use tracing::info;

/// Process id of the only supervisor we agree to run under.
const SUPERVISOR_PID: u32 = 1;

/// Fatal service errors. Any of these ends the process with failure.
#[derive(Debug)]
pub enum ServiceError {
    /// Not started by the supervisor; carries the actual parent pid.
    Unsupervised(u32),
    Config(ConfigError),
    Activation(ActivationError),
    Io(&'static str, io::Error),
    /// The reloaded backlog could not be applied to the listener.
    Backlog(i32, io::Error),
    UnexpectedSignal(u32),
}

impl ServiceError {
    /// Adapter for `map_err` that attaches what we were trying to do.
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> ServiceError {
        move |e| ServiceError::Io(context, e)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Unsupervised(ppid) => write!(
                f,
                "This program should be invoked by init only (parent pid is {ppid})"
            ),
            ServiceError::Config(e) => write!(f, "{e}"),
            ServiceError::Activation(e) => write!(f, "{e}"),
            ServiceError::Io(context, e) => write!(f, "Failed to {context}: {e}"),
            ServiceError::Backlog(backlog, e) => write!(
                f,
                "Failed to update the backlog of the listen socket to {backlog}: {e}"
            ),
            ServiceError::UnexpectedSignal(signo) => {
                write!(f, "Received the unexpected signal: {signo}")
            }
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Config(e) => Some(e),
            ServiceError::Activation(e) => Some(e),
            ServiceError::Io(_, e) | ServiceError::Backlog(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServiceError {
    fn from(e: ConfigError) -> Self {
        ServiceError::Config(e)
    }
}

impl From<ActivationError> for ServiceError {
    fn from(e: ActivationError) -> Self {
        ServiceError::Activation(e)
    }
}

/// Refuse to run unless the parent is the supervisor.
pub fn ensure_supervised(parent: u32) -> Result<(), ServiceError> {
    if parent != SUPERVISOR_PID {
        return Err(ServiceError::Unsupervised(parent));
    }
    Ok(())
}

/// Start the service described by `cli` and serve until SIGTERM.
pub fn run(cli: &CliArgs) -> Result<(), ServiceError> {
    ensure_supervised(std::os::unix::process::parent_id())?;

    let config = ServiceConfig::load(&cli.config)?;
    info!(path = %cli.config.display(), backlog = config.backlog, "Configuration loaded");

    let inherited = activation::inherited_from_env()?;
    info!(inherited = inherited.len(), "Socket activation");
    let endpoints = activation::resolve(inherited, cli.listen, config.backlog)?;
    for endpoint in [&endpoints.stream, &endpoints.datagram] {
        info!(
            transport = %endpoint.transport,
            local = ?endpoint.local_addr().ok(),
            domain = ?endpoint.domain,
            inherited = endpoint.inherited,
            "Endpoint ready"
        );
    }

    let control = ControlChannel::from_env().map_err(ServiceError::io("set up the control channel"))?;
    let notifier = Notifier::from_env().map_err(ServiceError::io("open the notification socket"))?;

    let mut event_loop = EventLoop::new(endpoints, control, notifier, config, cli.config.clone())?;
    event_loop.run()
}
