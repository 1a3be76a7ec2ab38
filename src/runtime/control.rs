//! Control channel: termination/reload signals and the watchdog heartbeat.
//!
//! SIGTERM and SIGHUP are blocked and read from a `signalfd`; the watchdog
//! heartbeat is a `timerfd`. Both are plain descriptors, registered with the
//! same `Poll` as the sockets.

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

pub const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";
pub const WATCHDOG_PID_ENV: &str = "WATCHDOG_PID";

/// What a received signal asks the service to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// SIGTERM: exit successfully without draining connections.
    Terminate,
    /// SIGHUP: re-read the configuration and re-apply the backlog.
    Reload,
}

impl ControlEvent {
    /// Map a signal number; anything but SIGTERM/SIGHUP is `None`.
    pub fn from_signal(signo: u32) -> Option<Self> {
        match signo as libc::c_int {
            libc::SIGTERM => Some(ControlEvent::Terminate),
            libc::SIGHUP => Some(ControlEvent::Reload),
            _ => None,
        }
    }
}

/// `signalfd` receiving SIGTERM and SIGHUP.
pub struct SignalChannel {
    fd: OwnedFd,
}

impl SignalChannel {
    /// Block SIGTERM and SIGHUP for the calling thread and open a
    /// descriptor that receives them instead.
    ///
    /// Must be called before any other thread is spawned so that the mask
    /// is inherited everywhere.
    pub fn new() -> io::Result<Self> {
        // SAFETY: `mask` is initialized by sigemptyset before use, and the
        // returned descriptor is checked before being owned.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGTERM);
            libc::sigaddset(&mut mask, libc::SIGHUP);

            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }

            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Next pending signal number, or `None` once the queue is empty.
    pub fn next_signal(&self) -> io::Result<Option<u32>> {
        // SAFETY: signalfd_siginfo is plain old data.
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let size = mem::size_of::<libc::signalfd_siginfo>();

        let n = loop {
            // SAFETY: `info` is a valid, writable buffer of `size` bytes.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    size,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        };

        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read from signalfd: {n} of {size} bytes"),
            ));
        }
        Ok(Some(info.ssi_signo))
    }
}

impl Source for SignalChannel {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

/// Periodic `timerfd` driving `WATCHDOG=1` notifications.
pub struct Heartbeat {
    fd: OwnedFd,
    period: Duration,
}

impl Heartbeat {
    /// Arm a timer firing at half the supervisor's watchdog interval.
    pub fn new(watchdog: Duration) -> io::Result<Self> {
        let period = (watchdog / 2).max(Duration::from_micros(1));

        // SAFETY: the descriptor is checked before being owned.
        let fd = unsafe {
            let fd = libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        // SAFETY: itimerspec is plain old data.
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        spec.it_interval.tv_sec = period.as_secs() as libc::time_t;
        spec.it_interval.tv_nsec = period.subsec_nanos() as _;
        spec.it_value = spec.it_interval;
        // SAFETY: `spec` is a fully initialized itimerspec.
        let rc = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, period })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of expirations since the last call; 0 if none.
    pub fn expirations(&self) -> io::Result<u64> {
        let mut count: u64 = 0;
        loop {
            // SAFETY: `count` is a writable 8-byte buffer.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut count as *mut u64 as *mut libc::c_void,
                    mem::size_of::<u64>(),
                )
            };
            if n == mem::size_of::<u64>() as isize {
                return Ok(count);
            }
            if n >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read from timerfd",
                ));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(0),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

impl Source for Heartbeat {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

/// Watchdog interval requested by the supervisor, if any.
///
/// Follows `sd_watchdog_enabled`: `WATCHDOG_PID`, when set, must name this
/// process; `WATCHDOG_USEC` must be a positive number of microseconds.
pub fn watchdog_interval(
    usec: Option<&str>,
    pid: Option<&str>,
    own_pid: u32,
) -> io::Result<Option<Duration>> {
    let Some(usec) = usec else {
        return Ok(None);
    };

    if let Some(pid) = pid {
        let pid: u32 = pid.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid {WATCHDOG_PID_ENV}: '{pid}'"),
            )
        })?;
        if pid != own_pid {
            return Ok(None);
        }
    }

    match usec.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(Duration::from_micros(n))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid {WATCHDOG_USEC_ENV}: '{usec}'"),
        )),
    }
}

/// Signal descriptor plus the optional heartbeat timer.
pub struct ControlChannel {
    signals: SignalChannel,
    heartbeat: Option<Heartbeat>,
}

impl ControlChannel {
    pub fn new(watchdog: Option<Duration>) -> io::Result<Self> {
        let signals = SignalChannel::new()?;
        let heartbeat = watchdog.map(Heartbeat::new).transpose()?;
        Ok(Self { signals, heartbeat })
    }

    /// Control channel configured from `WATCHDOG_USEC`/`WATCHDOG_PID`.
    pub fn from_env() -> io::Result<Self> {
        let usec = std::env::var(WATCHDOG_USEC_ENV).ok();
        let pid = std::env::var(WATCHDOG_PID_ENV).ok();
        let watchdog = watchdog_interval(usec.as_deref(), pid.as_deref(), std::process::id())?;
        Self::new(watchdog)
    }

    pub fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }

    /// Register the signal descriptor and, if armed, the heartbeat timer.
    pub fn register(
        &mut self,
        registry: &Registry,
        signals: Token,
        heartbeat: Token,
    ) -> io::Result<()> {
        registry.register(&mut self.signals, signals, Interest::READABLE)?;
        if let Some(timer) = &mut self.heartbeat {
            registry.register(timer, heartbeat, Interest::READABLE)?;
        }
        Ok(())
    }
}
