//! Datagram echo.
//!
//! Stateless: every datagram is sent straight back to its source. Sends are
//! best-effort; there is no queueing, so a reply the kernel refuses is lost.

use mio::net::UdpSocket;
use std::io;
use tracing::trace;

/// Datagrams received per wake-up before other sources get a turn.
pub const MAX_DATAGRAMS_PER_WAKE: usize = 64;

/// Outcome of one call to [`echo_pending`], carrying the number echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Batch {
    /// The socket would block; the next edge reports new datagrams.
    Drained(usize),
    /// The per-wake budget ran out. More may be queued, so the caller has
    /// to re-arm the socket.
    Yielded(usize),
}

/// Echo queued datagrams on `socket`, at most [`MAX_DATAGRAMS_PER_WAKE`].
pub fn echo_pending(socket: &UdpSocket, buf: &mut [u8]) -> Batch {
    let mut echoed = 0;

    for _ in 0..MAX_DATAGRAMS_PER_WAKE {
        let (len, peer) = match socket.recv_from(buf) {
            Ok((0, _)) => continue,
            Ok(received) => received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Batch::Drained(echoed),
            Err(ref e) if is_one_shot(e) => continue,
            Err(e) => {
                trace!(error = %e, "Datagram receive failed");
                return Batch::Drained(echoed);
            }
        };

        if let Err(e) = socket.send_to(&buf[..len], peer) {
            trace!(peer = %peer, len, error = %e, "Dropped datagram reply");
        }
        echoed += 1;
    }

    Batch::Yielded(echoed)
}

/// Errors that concern one earlier datagram, not the socket.
fn is_one_shot(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}
