//! mio event loop.
//!
//! Readiness-based model: poll tells us which descriptor is ready, then the
//! matching handler performs non-blocking syscalls until it would block.
//! Everything runs on one thread; the loop owns every descriptor and all
//! connection state.
//!
//! Registered sources:
//! - the stream listener and the datagram socket,
//! - the signal descriptor (SIGTERM, SIGHUP),
//! - the watchdog timer, when the supervisor asked for one,
//! - one entry per accepted connection, under the interest its state asks
//!   for (read while `Reading`, write while `Writing`).

use crate::config::ServiceConfig;
use crate::runtime::activation::Endpoints;
use crate::runtime::connection::{ConnState, Connection, Step, CHUNK_SIZE};
use crate::runtime::control::{ControlChannel, ControlEvent};
use crate::runtime::notify::{self, Notifier};
use crate::runtime::token::{self, Source};
use crate::runtime::datagram::{self, Batch};
use crate::runtime::ServiceError;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, trace};

const EVENTS_CAPACITY: usize = 256;

/// Whether the loop keeps running after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    /// Tokens of the last poll, copied out so handlers can borrow `self`.
    ready: Vec<Token>,
    listener: TcpListener,
    datagram: UdpSocket,
    control: ControlChannel,
    notifier: Notifier,
    config: ServiceConfig,
    config_path: PathBuf,
    connections: Slab<Connection<TcpStream>>,
    chunk: Box<[u8]>,
}

impl EventLoop {
    /// Register every descriptor and tell the supervisor we are ready.
    pub fn new(
        endpoints: Endpoints,
        mut control: ControlChannel,
        notifier: Notifier,
        config: ServiceConfig,
        config_path: PathBuf,
    ) -> Result<Self, ServiceError> {
        let poll = Poll::new().map_err(ServiceError::io("create the poll instance"))?;

        let mut listener = TcpListener::from_std(endpoints.stream.socket.into());
        poll.registry()
            .register(&mut listener, token::LISTENER, Interest::READABLE)
            .map_err(ServiceError::io("monitor the listen socket"))?;

        let mut datagram = UdpSocket::from_std(endpoints.datagram.socket.into());
        poll.registry()
            .register(&mut datagram, token::DATAGRAM, Interest::READABLE)
            .map_err(ServiceError::io("monitor the dgram socket"))?;

        control
            .register(poll.registry(), token::SIGNALS, token::HEARTBEAT)
            .map_err(ServiceError::io("monitor the control descriptors"))?;

        let event_loop = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            listener,
            datagram,
            control,
            notifier,
            config,
            config_path,
            connections: Slab::new(),
            chunk: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
        };

        info!(
            stream = %display_addr(event_loop.stream_addr()),
            datagram = %display_addr(event_loop.datagram_addr()),
            backlog = event_loop.config.backlog,
            heartbeat = ?event_loop.control.heartbeat().map(|h| h.period()),
            notify = event_loop.notifier.is_enabled(),
            "Event loop started"
        );
        event_loop.notifier.notify(notify::READY);

        Ok(event_loop)
    }

    /// Serve until SIGTERM arrives or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), ServiceError> {
        loop {
            if self.turn(None)? == Flow::Shutdown {
                info!(
                    connections = self.connection_count(),
                    "Shutting down without draining connections"
                );
                return Ok(());
            }
        }
    }

    /// Wait for readiness (at most `timeout`, forever with `None`) and
    /// handle every reported event in delivery order.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Flow, ServiceError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Flow::Continue),
            Err(e) => return Err(ServiceError::Io("wait for events", e)),
        }

        self.ready.clear();
        self.ready.extend(self.events.iter().map(|event| event.token()));

        for idx in 0..self.ready.len() {
            let token = self.ready[idx];
            if self.dispatch(token)? == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&mut self, token: Token) -> Result<Flow, ServiceError> {
        match Source::from(token) {
            Source::Listener => self.accept_connections()?,
            Source::Datagram => {
                let batch = datagram::echo_pending(&self.datagram, &mut self.chunk);
                if let Batch::Yielded(echoed) = batch {
                    trace!(echoed, "Datagram budget spent, yielding");
                    self.poll
                        .registry()
                        .reregister(&mut self.datagram, token::DATAGRAM, Interest::READABLE)
                        .map_err(ServiceError::io("monitor the dgram socket"))?;
                }
            }
            Source::Signals => return self.handle_signals(),
            Source::Heartbeat => self.handle_heartbeat()?,
            Source::Connection(conn_id) => self.handle_connection(conn_id),
        }
        Ok(Flow::Continue)
    }

    fn accept_connections(&mut self) -> Result<(), ServiceError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token::connection(conn_id),
                        Interest::READABLE,
                    ) {
                        debug!(peer = %peer, error = %e, "Failed to monitor accepted connection");
                        continue;
                    }
                    entry.insert(Connection::new(stream));
                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return self.accept_failed(e),
            }
        }
    }

    /// An accept error (EMFILE, ENFILE, ENOBUFS, ...) leaves the pending
    /// connection queued while its readiness edge is already consumed.
    /// Re-arming the listener reports it again on the next poll.
    fn accept_failed(&mut self, e: io::Error) -> Result<(), ServiceError> {
        debug!(error = %e, "Accept failed");
        self.poll
            .registry()
            .reregister(&mut self.listener, token::LISTENER, Interest::READABLE)
            .map_err(ServiceError::io("monitor the listen socket"))
    }

    fn handle_connection(&mut self, conn_id: usize) {
        // Events for a connection closed earlier in this batch are stale.
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        let step = if matches!(conn.state(), ConnState::Reading) {
            conn.on_readable(&mut self.chunk)
        } else {
            conn.on_writable()
        };

        match step {
            Step::Idle => {}
            Step::Reregister => {
                let interest = conn.state().interest();
                let result = self.poll.registry().reregister(
                    conn.stream_mut(),
                    token::connection(conn_id),
                    interest,
                );
                if let Err(e) = result {
                    debug!(conn_id, error = %e, "Failed to switch interest");
                    self.close_connection(conn_id);
                }
            }
            Step::Close(reason) => {
                debug!(conn_id, reason = %reason, "Closing connection");
                self.close_connection(conn_id);
            }
        }
    }

    /// Drop the connection together with any pending reply.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.try_remove(conn_id) {
            let mut stream = conn.into_stream();
            let _ = self.poll.registry().deregister(&mut stream);
            debug!(conn_id, "Connection closed");
        }
    }

    fn handle_signals(&mut self) -> Result<Flow, ServiceError> {
        loop {
            let signo = self
                .control
                .signals()
                .next_signal()
                .map_err(ServiceError::io("read the signal fd"))?;
            let Some(signo) = signo else {
                return Ok(Flow::Continue);
            };

            match ControlEvent::from_signal(signo) {
                Some(ControlEvent::Terminate) => {
                    info!("Received SIGTERM");
                    return Ok(Flow::Shutdown);
                }
                Some(ControlEvent::Reload) => {
                    info!("Received SIGHUP, reloading configuration");
                    self.reload()?;
                }
                None => return Err(ServiceError::UnexpectedSignal(signo)),
            }
        }
    }

    /// Re-read the configuration file and apply the new backlog to the
    /// existing listener. Established connections are untouched.
    pub fn reload(&mut self) -> Result<(), ServiceError> {
        let config = ServiceConfig::load(&self.config_path)?;

        SockRef::from(&self.listener)
            .listen(config.backlog)
            .map_err(|e| ServiceError::Backlog(config.backlog, e))?;

        info!(
            old_backlog = self.config.backlog,
            backlog = config.backlog,
            "Configuration reloaded"
        );
        self.config = config;
        Ok(())
    }

    fn handle_heartbeat(&mut self) -> Result<(), ServiceError> {
        let Some(heartbeat) = self.control.heartbeat() else {
            return Ok(());
        };

        let expired = heartbeat
            .expirations()
            .map_err(ServiceError::io("read the watchdog timer"))?;
        if expired > 0 {
            self.notifier.notify(notify::WATCHDOG);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn stream_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn datagram_addr(&self) -> io::Result<SocketAddr> {
        self.datagram.local_addr()
    }

    /// Number of open stream connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn display_addr(addr: io::Result<SocketAddr>) -> String {
    match addr {
        Ok(addr) => addr.to_string(),
        Err(e) => format!("<{e}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activation;
    use crate::runtime::control::tests::raise_on_current_thread;
    use crate::runtime::notify::tests::Listener as NotifyListener;
    use socket2::{Domain, SockAddr, Socket, Type};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
    use std::os::fd::AsRawFd;
    use std::path::Path;
    use std::time::Instant;

    const DEADLINE: Duration = Duration::from_secs(10);
    const TICK: Duration = Duration::from_millis(2);

    /// Config file in the temp dir, removed on drop.
    struct ConfigFile(PathBuf);

    impl ConfigFile {
        fn new(tag: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "systemd-echo-{}-{}.conf",
                std::process::id(),
                tag
            ));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }

        fn write(&self, contents: &str) {
            std::fs::write(&self.0, contents).unwrap();
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for ConfigFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn server_with(
        config: &ConfigFile,
        watchdog: Option<Duration>,
        notifier: Notifier,
    ) -> EventLoop {
        let endpoints = activation::resolve(Vec::new(), "127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let control = ControlChannel::new(watchdog).unwrap();
        EventLoop::new(
            endpoints,
            control,
            notifier,
            ServiceConfig::default(),
            config.path().to_path_buf(),
        )
        .unwrap()
    }

    fn server(config: &ConfigFile) -> EventLoop {
        server_with(config, None, Notifier::disabled())
    }

    fn pump_until(ev: &mut EventLoop, mut done: impl FnMut(&EventLoop) -> bool) {
        let start = Instant::now();
        while !done(ev) {
            assert!(start.elapsed() < DEADLINE, "condition not reached in time");
            assert_eq!(ev.turn(Some(TICK)).unwrap(), Flow::Continue);
        }
    }

    fn connect(ev: &mut EventLoop) -> StdTcpStream {
        let before = ev.connection_count();
        let client = StdTcpStream::connect(ev.stream_addr().unwrap()).unwrap();
        client.set_nonblocking(true).unwrap();
        pump_until(ev, |ev| ev.connection_count() == before + 1);
        client
    }

    /// Send `data` and collect the echo, turning the loop in between.
    fn echo(ev: &mut EventLoop, client: &mut StdTcpStream, data: &[u8]) -> Vec<u8> {
        client.write_all(data).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        let start = Instant::now();
        while received.len() < data.len() {
            assert!(start.elapsed() < DEADLINE, "echo not received in time");
            ev.turn(Some(TICK)).unwrap();
            match client.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        received
    }

    /// Client with a tiny receive window so the server's replies back up.
    fn slow_client(ev: &mut EventLoop) -> StdTcpStream {
        SockRef::from(&ev.listener)
            .set_send_buffer_size(4096)
            .unwrap();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket
            .connect(&SockAddr::from(ev.stream_addr().unwrap()))
            .unwrap();
        socket.set_nonblocking(true).unwrap();
        let before = ev.connection_count();
        pump_until(ev, |ev| ev.connection_count() == before + 1);
        socket.into()
    }

    fn any_writing(ev: &EventLoop) -> bool {
        ev.connections
            .iter()
            .any(|(_, conn)| matches!(conn.state(), ConnState::Writing(_)))
    }

    /// Push `payload` without reading until the server has to buffer a
    /// reply. Returns how many bytes were sent.
    fn fill_until_writing(ev: &mut EventLoop, client: &mut StdTcpStream, payload: &[u8]) -> usize {
        let mut sent = 0;
        let start = Instant::now();
        while !any_writing(ev) {
            assert!(start.elapsed() < DEADLINE, "server never buffered a reply");
            assert!(sent < payload.len(), "payload exhausted before backpressure");
            let end = (sent + 1000).min(payload.len());
            match client.write(&payload[sent..end]) {
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("write failed: {e}"),
            }
            ev.turn(Some(TICK)).unwrap();
        }
        sent
    }

    /// Accept queue limit the kernel applies to a listening socket, as
    /// reported in `tcpi_sacked` of `TCP_INFO`.
    fn kernel_backlog(listener: &TcpListener) -> u32 {
        // SAFETY: tcp_info is plain old data.
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        // SAFETY: `info` and `len` describe a valid buffer for TCP_INFO.
        let rc = unsafe {
            libc::getsockopt(
                listener.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut libc::tcp_info as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0, "TCP_INFO: {}", io::Error::last_os_error());
        info.tcpi_sacked
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_tcp_hello_then_disconnect() {
        let config = ConfigFile::new("hello", "Backlog=10\n");
        let mut ev = server(&config);

        let mut client = connect(&mut ev);
        assert_eq!(echo(&mut ev, &mut client, b"hello"), b"hello");

        drop(client);
        pump_until(&mut ev, |ev| ev.connection_count() == 0);
    }

    #[test]
    fn test_partial_writes_preserve_order() {
        let config = ConfigFile::new("partial", "Backlog=10\n");
        let mut ev = server(&config);
        let mut client = slow_client(&mut ev);

        let data = payload(1 << 20);
        let mut sent = fill_until_writing(&mut ev, &mut client, &data);

        let mut received = Vec::with_capacity(data.len());
        let mut buf = vec![0u8; 8192];
        let start = Instant::now();
        while received.len() < data.len() {
            assert!(start.elapsed() < DEADLINE, "echo not completed in time");
            if sent < data.len() {
                let end = (sent + 777).min(data.len());
                match client.write(&data[sent..end]) {
                    Ok(n) => sent += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => panic!("write failed: {e}"),
                }
            }
            ev.turn(Some(TICK)).unwrap();
            match client.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert!(received == data, "echoed bytes differ from sent bytes");

        // Drained: back to reading, and a fresh message comes back clean.
        pump_until(&mut ev, |ev| !any_writing(ev));
        assert_eq!(echo(&mut ev, &mut client, b"second"), b"second");
    }

    #[test]
    fn test_new_connection_starts_without_buffer() {
        let config = ConfigFile::new("reuse", "Backlog=10\n");
        let mut ev = server(&config);

        let mut first = slow_client(&mut ev);
        let data = payload(1 << 20);
        fill_until_writing(&mut ev, &mut first, &data);

        // Close while a reply is pending.
        first.shutdown(Shutdown::Both).unwrap();
        drop(first);
        pump_until(&mut ev, |ev| ev.connection_count() == 0);

        let mut second = connect(&mut ev);
        assert!(!any_writing(&ev));
        assert_eq!(echo(&mut ev, &mut second, b"fresh"), b"fresh");
    }

    #[test]
    fn test_failed_accept_rearms_listener() {
        let config = ConfigFile::new("rearm", "Backlog=10\n");
        let mut ev = server(&config);
        let _client = StdTcpStream::connect(ev.stream_addr().unwrap()).unwrap();

        // Consume the listener's readiness edge without accepting, as an
        // accept failing with EMFILE does.
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < DEADLINE, "listener never became readable");
            ev.poll.poll(&mut ev.events, Some(TICK)).unwrap();
            if ev.events.iter().any(|event| event.token() == token::LISTENER) {
                break;
            }
        }
        ev.accept_failed(io::Error::from_raw_os_error(libc::EMFILE))
            .unwrap();

        // The queued connection is reported again; no second connect needed.
        pump_until(&mut ev, |ev| ev.connection_count() == 1);
    }

    #[test]
    fn test_datagram_echo() {
        let config = ConfigFile::new("udp", "Backlog=10\n");
        let mut ev = server(&config);

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_nonblocking(true).unwrap();
        client.send_to(b"x", ev.datagram_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let start = Instant::now();
        let (n, from) = loop {
            assert!(start.elapsed() < DEADLINE, "datagram not echoed in time");
            ev.turn(Some(TICK)).unwrap();
            match client.recv_from(&mut buf) {
                Ok(received) => break received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"x");
        assert_eq!(from, ev.datagram_addr().unwrap());
    }

    #[test]
    fn test_reload_updates_backlog_and_keeps_connections() {
        let config = ConfigFile::new("reload", "Backlog=10\n");
        let mut ev = server(&config);
        let mut client = connect(&mut ev);
        assert_eq!(kernel_backlog(&ev.listener), 10);

        config.write("\nBacklog = 3\n");
        raise_on_current_thread(libc::SIGHUP);
        pump_until(&mut ev, |ev| ev.config().backlog == 3);

        assert_eq!(kernel_backlog(&ev.listener), 3);
        assert_eq!(ev.connection_count(), 1);
        assert_eq!(echo(&mut ev, &mut client, b"still here"), b"still here");
    }

    #[test]
    fn test_reload_failure_is_fatal() {
        let config = ConfigFile::new("badreload", "Backlog=10\n");
        let mut ev = server(&config);

        config.write("Backlog=0\n");
        raise_on_current_thread(libc::SIGHUP);

        let start = Instant::now();
        let err = loop {
            assert!(start.elapsed() < DEADLINE, "reload never happened");
            match ev.turn(Some(TICK)) {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ServiceError::Config(_)));
        assert_eq!(ev.config().backlog, 10);
    }

    #[test]
    fn test_terminate_does_not_drain() {
        let config = ConfigFile::new("terminate", "Backlog=10\n");
        let mut ev = server(&config);
        let mut client = slow_client(&mut ev);

        let data = payload(1 << 20);
        let sent = fill_until_writing(&mut ev, &mut client, &data);

        raise_on_current_thread(libc::SIGTERM);
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < DEADLINE, "terminate not observed");
            if ev.turn(Some(TICK)).unwrap() == Flow::Shutdown {
                break;
            }
        }
        drop(ev);

        let mut received = 0;
        let mut buf = vec![0u8; 8192];
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < DEADLINE, "connection never closed");
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(TICK)
                }
                Err(_) => break,
            }
        }
        assert!(received < sent, "pending reply was drained before exit");
    }

    #[test]
    fn test_run_returns_on_terminate() {
        let config = ConfigFile::new("run", "Backlog=10\n");
        let mut ev = server(&config);
        raise_on_current_thread(libc::SIGTERM);
        ev.run().unwrap();
    }

    #[test]
    fn test_ready_and_heartbeat_notifications() {
        let config = ConfigFile::new("watchdog", "Backlog=10\n");
        let listener = NotifyListener::bind("watchdog");
        let mut ev = server_with(&config, Some(Duration::from_millis(20)), listener.notifier());

        assert_eq!(listener.recv(), "READY=1");

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(60) {
            ev.turn(Some(TICK)).unwrap();
        }
        assert_eq!(listener.recv(), "WATCHDOG=1");
    }
}
