//! Socket acquisition: inherited descriptors from systemd socket activation,
//! or freshly bound defaults.
//!
//! The result is always exactly one listening stream socket and one bound
//! datagram socket. Anything unexpected in what the supervisor passed is a
//! startup error; there is no fallback once descriptors were inherited.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::{debug, info};

/// First descriptor passed by the supervisor.
pub const LISTEN_FDS_START: RawFd = 3;

/// One stream plus one datagram socket.
pub const MAX_INHERITED: usize = 2;

pub const LISTEN_PID_ENV: &str = "LISTEN_PID";
pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";
pub const LISTEN_FDNAMES_ENV: &str = "LISTEN_FDNAMES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => write!(f, "stream"),
            Transport::Datagram => write!(f, "datagram"),
        }
    }
}

/// A validated socket ready to be handed to the event loop.
#[derive(Debug)]
pub struct ListenEndpoint {
    pub socket: Socket,
    pub transport: Transport,
    pub domain: Domain,
    /// Whether the supervisor passed this socket in.
    pub inherited: bool,
}

impl ListenEndpoint {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
    }
}

/// Both endpoints the service listens on.
#[derive(Debug)]
pub struct Endpoints {
    pub stream: ListenEndpoint,
    pub datagram: ListenEndpoint,
}

/// Socket acquisition errors. All of them are fatal at startup.
#[derive(Debug)]
pub enum ActivationError {
    /// `LISTEN_PID`/`LISTEN_FDS` could not be parsed.
    Environment(String),
    TooManyDescriptors(usize),
    /// Neither a listening stream socket nor a datagram socket on the
    /// expected family and port.
    Unrecognized(RawFd),
    Duplicate(Transport),
    Probe(RawFd, io::Error),
    Setup(Transport, &'static str, io::Error),
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationError::Environment(msg) => {
                write!(f, "Invalid socket activation environment: {msg}")
            }
            ActivationError::TooManyDescriptors(n) => {
                write!(f, "Only {MAX_INHERITED} fds are allowed, got {n}")
            }
            ActivationError::Unrecognized(fd) => {
                write!(f, "The passed in socket (fd {fd}) is wrong")
            }
            ActivationError::Duplicate(transport) => {
                write!(f, "Only one {transport} socket is allowed")
            }
            ActivationError::Probe(fd, e) => {
                write!(f, "Failed to determine the socket type of fd {fd}: {e}")
            }
            ActivationError::Setup(transport, step, e) => {
                write!(f, "Failed to {step} the {transport} socket: {e}")
            }
        }
    }
}

impl std::error::Error for ActivationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ActivationError::Probe(_, e) | ActivationError::Setup(_, _, e) => Some(e),
            _ => None,
        }
    }
}

/// Number of descriptors passed to this process, following
/// `sd_listen_fds`: a `LISTEN_PID` naming another process means none.
pub fn parse_listen_fds(
    pid: Option<&str>,
    fds: Option<&str>,
    own_pid: u32,
) -> Result<usize, ActivationError> {
    let (Some(pid), Some(fds)) = (pid, fds) else {
        return Ok(0);
    };

    let pid: u32 = pid
        .trim()
        .parse()
        .map_err(|_| ActivationError::Environment(format!("{LISTEN_PID_ENV}='{pid}'")))?;
    if pid != own_pid {
        return Ok(0);
    }

    fds.trim()
        .parse()
        .map_err(|_| ActivationError::Environment(format!("{LISTEN_FDS_ENV}='{fds}'")))
}

/// Take ownership of the descriptors the supervisor passed in.
///
/// The `LISTEN_*` variables are removed so that they do not leak into
/// anything spawned later. The count is checked before any descriptor is
/// adopted.
pub fn inherited_from_env() -> Result<Vec<OwnedFd>, ActivationError> {
    let pid = std::env::var(LISTEN_PID_ENV).ok();
    let fds = std::env::var(LISTEN_FDS_ENV).ok();
    let count = parse_listen_fds(pid.as_deref(), fds.as_deref(), std::process::id());

    std::env::remove_var(LISTEN_PID_ENV);
    std::env::remove_var(LISTEN_FDS_ENV);
    std::env::remove_var(LISTEN_FDNAMES_ENV);

    let count = count?;
    if count > MAX_INHERITED {
        return Err(ActivationError::TooManyDescriptors(count));
    }

    let fds = (LISTEN_FDS_START..LISTEN_FDS_START + count as RawFd)
        // SAFETY: the supervisor hands these descriptors to us exclusively;
        // nothing else in the process refers to them.
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    Ok(fds)
}

/// Validate `inherited` against `addr` and create whatever is missing.
///
/// Inherited sockets must use the family of `addr` and be bound to its port
/// (port 0 accepts any port). Created sockets are bound to `addr`; the
/// stream socket listens with `backlog`.
pub fn resolve(
    inherited: Vec<OwnedFd>,
    addr: SocketAddr,
    backlog: i32,
) -> Result<Endpoints, ActivationError> {
    if inherited.len() > MAX_INHERITED {
        return Err(ActivationError::TooManyDescriptors(inherited.len()));
    }

    let mut stream = None;
    let mut datagram = None;

    for fd in inherited {
        let raw = fd.as_raw_fd();
        let socket = Socket::from(fd);

        let transport = probe(&socket, &addr)
            .map_err(|e| ActivationError::Probe(raw, e))?
            .ok_or(ActivationError::Unrecognized(raw))?;

        let slot = match transport {
            Transport::Stream => &mut stream,
            Transport::Datagram => &mut datagram,
        };
        if slot.is_some() {
            return Err(ActivationError::Duplicate(transport));
        }

        socket
            .set_cloexec(true)
            .and_then(|()| socket.set_nonblocking(true))
            .map_err(setup_error(transport, "configure"))?;

        debug!(fd = raw, transport = %transport, "Using inherited socket");
        *slot = Some(ListenEndpoint {
            socket,
            transport,
            domain: Domain::for_address(addr),
            inherited: true,
        });
    }

    let stream = match stream {
        Some(endpoint) => endpoint,
        None => create_stream(addr, backlog)?,
    };
    let datagram = match datagram {
        Some(endpoint) => endpoint,
        None => create_datagram(addr)?,
    };

    Ok(Endpoints { stream, datagram })
}

/// Classify `socket` as a listening stream or a datagram socket bound to the
/// family and port of `addr`. `None` means neither.
fn probe(socket: &Socket, addr: &SocketAddr) -> io::Result<Option<Transport>> {
    let ty = match socket.r#type() {
        Ok(ty) => ty,
        Err(e) if e.raw_os_error() == Some(libc::ENOTSOCK) => return Ok(None),
        Err(e) => return Err(e),
    };

    let Some(local) = socket.local_addr()?.as_socket() else {
        return Ok(None);
    };
    if local.is_ipv4() != addr.is_ipv4() {
        return Ok(None);
    }
    if addr.port() != 0 && local.port() != addr.port() {
        return Ok(None);
    }

    if ty == Type::STREAM {
        if socket.is_listener()? {
            return Ok(Some(Transport::Stream));
        }
        return Ok(None);
    }
    if ty == Type::DGRAM {
        return Ok(Some(Transport::Datagram));
    }
    Ok(None)
}

fn setup_error(transport: Transport, step: &'static str) -> impl FnOnce(io::Error) -> ActivationError {
    move |e| ActivationError::Setup(transport, step, e)
}

fn create_stream(addr: SocketAddr, backlog: i32) -> Result<ListenEndpoint, ActivationError> {
    let setup = |step| setup_error(Transport::Stream, step);

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(setup("create"))?;
    socket.set_nonblocking(true).map_err(setup("configure"))?;
    socket.set_reuse_address(true).map_err(setup("set reuseaddr on"))?;
    socket.bind(&SockAddr::from(addr)).map_err(setup("bind"))?;
    socket.listen(backlog).map_err(setup("listen on"))?;

    info!(addr = %addr, backlog, "Created stream socket");
    Ok(ListenEndpoint {
        socket,
        transport: Transport::Stream,
        domain,
        inherited: false,
    })
}

fn create_datagram(addr: SocketAddr) -> Result<ListenEndpoint, ActivationError> {
    let setup = |step| setup_error(Transport::Datagram, step);

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(setup("create"))?;
    socket.set_nonblocking(true).map_err(setup("configure"))?;
    socket.bind(&SockAddr::from(addr)).map_err(setup("bind"))?;

    info!(addr = %addr, "Created datagram socket");
    Ok(ListenEndpoint {
        socket,
        transport: Transport::Datagram,
        domain,
        inherited: false,
    })
}
