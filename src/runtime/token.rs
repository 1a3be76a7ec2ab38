//! Readiness token assignment.
//!
//! Connections use their slab key as token. The fixed sources take the top
//! of the token space, which the slab never reaches.

use mio::Token;

pub const LISTENER: Token = Token(usize::MAX);
pub const DATAGRAM: Token = Token(usize::MAX - 1);
pub const SIGNALS: Token = Token(usize::MAX - 2);
pub const HEARTBEAT: Token = Token(usize::MAX - 3);

/// The source a readiness event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Datagram,
    Signals,
    Heartbeat,
    /// Stream connection, by connection id.
    Connection(usize),
}

impl From<Token> for Source {
    fn from(token: Token) -> Self {
        match token {
            LISTENER => Source::Listener,
            DATAGRAM => Source::Datagram,
            SIGNALS => Source::Signals,
            HEARTBEAT => Source::Heartbeat,
            Token(conn_id) => Source::Connection(conn_id),
        }
    }
}

/// Token under which connection `conn_id` is registered.
pub fn connection(conn_id: usize) -> Token {
    debug_assert!(conn_id < HEARTBEAT.0, "connection id collides with fixed token");
    Token(conn_id)
}
