//! Connection state machine for echo sessions.
//!
//! Each connection is either `Reading` (no buffer, read interest) or
//! `Writing` (owns the unwritten part of the last echo, write interest).
//! The handlers below only move between those states; the event loop
//! derives the readiness interest from the state they leave behind.
//!
//! mio readiness is edge-triggered, so both handlers keep going until the
//! socket reports `WouldBlock` or the state changes. Reading stops early
//! after `MAX_CHUNKS_PER_WAKE` chunks so one busy peer cannot starve the
//! rest of the loop; re-registering then re-arms the edge.

use crate::runtime::buffer::PendingReply;
use std::fmt;
use std::io::{self, Read, Write};

/// Largest read performed per call, and the datagram receive size.
pub const CHUNK_SIZE: usize = 4096;

/// Chunks echoed per readable event before yielding to other sources.
pub const MAX_CHUNKS_PER_WAKE: usize = 16;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Waiting for data from the peer.
    Reading,
    /// Draining a reply the socket would not take in one write.
    Writing(PendingReply),
}

impl ConnState {
    /// Readiness interest that matches this state.
    pub fn interest(&self) -> mio::Interest {
        match self {
            ConnState::Reading => mio::Interest::READABLE,
            ConnState::Writing(_) => mio::Interest::WRITABLE,
        }
    }
}

/// What the event loop must do after a handler ran.
#[derive(Debug)]
pub enum Step {
    /// Nothing changed that affects registration.
    Idle,
    /// The state flipped, or reading yielded with data possibly left;
    /// re-register with `ConnState::interest`.
    Reregister,
    /// Tear the connection down.
    Close(CloseReason),
}

/// Why a connection is being closed.
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    Io(io::Error),
    OutOfMemory,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Io(e) => write!(f, "{e}"),
            CloseReason::OutOfMemory => write!(f, "could not allocate reply buffer"),
        }
    }
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the reading state.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
        }
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the connection, dropping any pending reply.
    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Read chunks and echo them back until the socket runs dry, a reply
    /// has to be buffered, or the per-wake budget is spent.
    pub fn on_readable(&mut self, chunk: &mut [u8]) -> Step {
        if !matches!(self.state, ConnState::Reading) {
            return Step::Idle;
        }

        let mut echoed = 0;
        loop {
            if echoed == MAX_CHUNKS_PER_WAKE {
                return Step::Reregister;
            }

            let len = match self.stream.read(chunk) {
                Ok(0) => return Step::Close(CloseReason::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Step::Close(CloseReason::Io(e)),
            };

            let written = match self.stream.write(&chunk[..len]) {
                Ok(n) => n,
                Err(ref e) if is_transient(e) => 0,
                Err(e) => return Step::Close(CloseReason::Io(e)),
            };

            if written >= len {
                echoed += 1;
                continue;
            }

            return match PendingReply::copy_from(&chunk[written..len]) {
                Some(reply) => {
                    self.state = ConnState::Writing(reply);
                    Step::Reregister
                }
                None => Step::Close(CloseReason::OutOfMemory),
            };
        }
    }

    /// Write out as much of the pending reply as the socket accepts.
    pub fn on_writable(&mut self) -> Step {
        let ConnState::Writing(reply) = &mut self.state else {
            return Step::Idle;
        };

        loop {
            match self.stream.write(reply.chunk()) {
                Ok(0) => return Step::Idle,
                Ok(n) => {
                    reply.advance(n);
                    if reply.is_drained() {
                        self.state = ConnState::Reading;
                        return Step::Reregister;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                Err(e) => return Step::Close(CloseReason::Io(e)),
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
