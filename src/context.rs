//! Per-session logging/debugging context, threaded through handshake, chunk
//! and command code so error messages and log lines can identify which
//! connection they came from without a global session table lookup.

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

#[derive(Clone, Copy)]
pub struct Context {
    pub established: SystemTime,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    /// Session-relative byte offset into the inbound chunk stream, bumped as
    /// messages are decoded; useful for correlating a log line with a
    /// position in a packet capture of the connection.
    pub byte_offset: u64,
}

impl Context {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Context {
            established: SystemTime::now(),
            local_addr,
            peer_addr,
            byte_offset: 0,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("peer_addr", &self.peer_addr)
            .field("byte_offset", &self.byte_offset)
            .finish()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_addr)
    }
}
