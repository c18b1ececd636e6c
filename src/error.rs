//! The five-category close-reason taxonomy, layered on top of
//! `failure::Error` the way the rest of this crate's fallible calls already
//! return it. A `CloseReason` is attached to an error via `.context(...)` at
//! the point a session decides to stop, so the session loop's top-level
//! match can pick a log level and a peer-visible response without every
//! call site needing its own error enum.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// EOF, reset, write timeout: close silently, clean up registry.
    Transport,
    /// Invalid fmt, oversized chunk size, unknown message type, truncated
    /// header: log and close.
    Framing,
    /// Wrong version byte, timeout, unresolved digest: close without
    /// notifying the peer.
    Handshake,
    /// Publish without connect, play without publisher: send `onStatus`
    /// error, then close.
    ProtocolState,
    /// Fan-out buffer overflow on a subscriber: drop that subscriber only,
    /// the publisher and other subscribers are unaffected.
    FanoutOverflow,
}

impl CloseReason {
    /// Whether this reason's handling path logs at `error!` (protocol bugs,
    /// peer misbehavior) as opposed to `debug!`/`info!` (ordinary hangups).
    pub fn is_noteworthy(self) -> bool {
        !matches!(self, CloseReason::Transport)
    }

    /// Whether the session should attempt to tell the peer why before
    /// closing the socket (an `onStatus` error command, not a TCP-level
    /// signal).
    pub fn notify_peer(self) -> bool {
        matches!(self, CloseReason::ProtocolState)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Transport => "transport",
            CloseReason::Framing => "framing",
            CloseReason::Handshake => "handshake",
            CloseReason::ProtocolState => "protocol-state",
            CloseReason::FanoutOverflow => "fan-out overflow",
        };
        f.write_str(s)
    }
}
