// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::{fmt, io};

use tempest_proto::control::ConnectionResult;
use tempest_proto::{FrameError, HandshakeError};

/// This error occurs when the connection's receive path fails.
///
/// Every variant tears the connection down; [`ReadError::result`] names
/// the reason the local side surfaces and, where possible, notifies the
/// peer about.
#[derive(Debug)]
pub enum ReadError {
    /// Standard I/O error, including the peer closing the stream.
    Io(io::Error),

    /// Error propagated from the envelope layer: bad framing, unknown
    /// ids, failed authentication.
    Frame(FrameError),

    /// The handshake failed or a handshake message arrived when it
    /// should not have.
    Handshake(HandshakeError),

    /// The peer announced it is going away.
    PeerDisconnected {
        reason: ConnectionResult,
        message: Option<String>,
    },

    /// Nothing has been heard from the peer for longer than the ping
    /// timeout, or a reliable datagram exhausted its delivery deadline.
    TimedOut,
}

impl std::error::Error for ReadError {}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "read error, io failed: {}", err),
            Self::Frame(err) => write!(f, "read error, {}", err),
            Self::Handshake(err) => write!(f, "read error, {}", err),
            Self::PeerDisconnected { reason, .. } => {
                write!(f, "peer disconnected: {:?}", reason)
            }
            Self::TimedOut => write!(f, "peer timed out"),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<FrameError> for ReadError {
    fn from(error: FrameError) -> Self {
        Self::Frame(error)
    }
}

impl From<HandshakeError> for ReadError {
    fn from(error: HandshakeError) -> Self {
        Self::Handshake(error)
    }
}

impl ReadError {
    /// The reason surfaced in the local `Disconnected` event.
    pub fn result(&self) -> ConnectionResult {
        match self {
            Self::Io(_) => ConnectionResult::ConnectionFailed,
            Self::Frame(err) => err.result(),
            Self::Handshake(err) => err.result(),
            Self::PeerDisconnected { reason, .. } => *reason,
            Self::TimedOut => ConnectionResult::TimedOut,
        }
    }

    /// Whether the peer should still be told why we are leaving. A peer
    /// that already said goodbye (or a dead socket) is not written to.
    pub(crate) fn notify_peer(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::PeerDisconnected { .. })
    }
}

/// This error occurs when connecting to a server fails.
#[derive(Debug)]
pub enum ConnectError {
    /// The transport could not be established at all.
    Io(io::Error),

    /// The server rejected the connection with this result.
    Rejected(ConnectionResult),

    /// The handshake failed locally.
    Handshake(HandshakeError),
}

impl std::error::Error for ConnectError {}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "connect error: {}", err),
            Self::Rejected(result) => write!(f, "connection rejected: {:?}", result),
            Self::Handshake(err) => write!(f, "connect error: {}", err),
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<HandshakeError> for ConnectError {
    fn from(error: HandshakeError) -> Self {
        Self::Handshake(error)
    }
}

impl From<ReadError> for ConnectError {
    fn from(error: ReadError) -> Self {
        match error {
            ReadError::Io(err) => Self::Io(err),
            ReadError::Handshake(err) => Self::Handshake(err),
            ReadError::PeerDisconnected { reason, .. } => Self::Rejected(reason),
            ReadError::TimedOut => Self::Rejected(ConnectionResult::TimedOut),
            ReadError::Frame(_) => Self::Rejected(ConnectionResult::FailedUnknown),
        }
    }
}

/// This error occurs when a sent message will never produce an outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationError {
    /// The message (or the response it was waiting for) was dropped: the
    /// send failed, the response deadline elapsed, or the connection went
    /// away with the request still pending.
    Dropped,

    /// The connection was already torn down when the call was made.
    NotConnected,
}

impl std::error::Error for InvocationError {}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dropped => write!(f, "request dropped (cancelled)"),
            Self::NotConnected => write!(f, "connection is closed"),
        }
    }
}
