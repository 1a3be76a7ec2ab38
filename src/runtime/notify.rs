//! Supervisor notifications (`sd_notify` protocol).
//!
//! State strings such as `READY=1` are sent as single datagrams to the unix
//! socket named by `NOTIFY_SOCKET`. A leading `@` names a socket in the
//! abstract namespace.

use std::ffi::OsStr;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use tracing::{debug, warn};

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

pub const READY: &str = "READY=1";
pub const WATCHDOG: &str = "WATCHDOG=1";

/// Client side of the notification socket.
pub struct Notifier {
    target: Option<(UnixDatagram, SocketAddr)>,
}

impl Notifier {
    /// Build a notifier from `NOTIFY_SOCKET`; without it, notifications
    /// are silently skipped.
    pub fn from_env() -> io::Result<Self> {
        match std::env::var_os(NOTIFY_SOCKET_ENV) {
            Some(path) if !path.is_empty() => Self::connect(&path),
            _ => Ok(Self::disabled()),
        }
    }

    /// Notifier that sends to `path`.
    pub fn connect(path: &OsStr) -> io::Result<Self> {
        let addr = match path.as_bytes() {
            [b'@', name @ ..] => SocketAddr::from_abstract_name(name)?,
            _ => SocketAddr::from_pathname(path)?,
        };
        let socket = UnixDatagram::unbound()?;
        Ok(Self {
            target: Some((socket, addr)),
        })
    }

    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Send `state` to the supervisor. Failures are logged, never fatal.
    pub fn notify(&self, state: &str) {
        let Some((socket, addr)) = &self.target else {
            return;
        };

        match socket.send_to_addr(state.as_bytes(), addr) {
            Ok(_) => debug!(state, "Notified supervisor"),
            Err(e) => warn!(state, error = %e, "Failed to notify supervisor"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Bound notification socket in a unique temporary location.
    pub(crate) struct Listener {
        pub socket: UnixDatagram,
        pub path: PathBuf,
    }

    impl Listener {
        pub fn bind(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "systemd-echo-notify-{}-{}.sock",
                std::process::id(),
                tag
            ));
            let _ = std::fs::remove_file(&path);
            let socket = UnixDatagram::bind(&path).unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Self { socket, path }
        }

        pub fn notifier(&self) -> Notifier {
            Notifier::connect(self.path.as_os_str()).unwrap()
        }

        pub fn recv(&self) -> String {
            let mut buf = [0u8; 256];
            let n = self.socket.recv(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn test_notify_path_socket() {
        let listener = Listener::bind("path");
        let notifier = listener.notifier();
        assert!(notifier.is_enabled());

        notifier.notify(READY);
        notifier.notify(WATCHDOG);
        assert_eq!(listener.recv(), "READY=1");
        assert_eq!(listener.recv(), "WATCHDOG=1");
    }

    #[test]
    fn test_notify_abstract_socket() {
        let name = format!("systemd-echo-test-{}", std::process::id());
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let socket = UnixDatagram::bind_addr(&addr).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let notifier = Notifier::connect(OsStr::new(&format!("@{name}"))).unwrap();
        notifier.notify(READY);

        let mut buf = [0u8; 64];
        let n = socket.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[test]
    fn test_disabled_is_noop() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        notifier.notify(READY);
    }
}
