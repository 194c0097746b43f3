// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connection handles and the machinery shared by the TCP and UDP
//! drivers.
//!
//! A connection is a cheap cloneable [`Connection`] handle plus a single
//! driver task that owns the socket, the serializer and all per-connection
//! state. Commands flow to the driver over an unbounded channel, which
//! doubles as the send lock: ids are assigned in the order commands
//! drain, so the order of ids matches the order of enqueues.

pub(crate) mod tcp;
pub(crate) mod udp;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use tempest_proto::control::{
    AcknowledgeConnectMessage, AcknowledgeMessage, ConnectMessage, ConnectedMessage,
    ConnectionResult, ConnectionResultMessage, DisconnectMessage, FinalConnectMessage,
    PingMessage, PongMessage, types,
};
use tempest_proto::{Message, MessageId};

use crate::errors::InvocationError;

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

/// A message delivered to the application, together with the id the peer
/// assigned it (needed to respond).
pub struct InboundMessage {
    pub id: MessageId,
    pub message: Box<dyn Message>,
}

/// What a connection reports to the application.
pub enum Event {
    /// The handshake finished and the connection reached steady state.
    Connected,

    /// A message arrived for the application.
    Message(InboundMessage),

    /// The connection is gone, with the reason the protocol assigns.
    Disconnected {
        reason: ConnectionResult,
        message: Option<String>,
    },
}

pub(crate) enum Command {
    Send {
        message: Box<dyn Message>,
    },
    SendFor {
        message: Box<dyn Message>,
        timeout: Option<Duration>,
        completer: oneshot::Sender<Result<Box<dyn Message>, InvocationError>>,
    },
    Respond {
        response_to: MessageId,
        message: Box<dyn Message>,
    },
    Disconnect {
        reason: ConnectionResult,
        message: Option<String>,
        done: oneshot::Sender<()>,
    },
}

pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    connection_id: AtomicI32,
}

impl Shared {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self {
            state: Mutex::new(state),
            connection_id: AtomicI32::new(0),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub(crate) fn set_connection_id(&self, id: i32) {
        self.connection_id.store(id, Ordering::Relaxed);
    }
}

/// A handle to a live connection, cheap to clone and safe to use from
/// any thread. All I/O happens on the connection's driver task.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    /// The id the server assigned to this connection.
    pub fn connection_id(&self) -> i32 {
        self.shared.connection_id.load(Ordering::Relaxed)
    }

    /// Enqueues a message. Delivery (and failure) is observed through
    /// events; use [`Connection::send_for`] to wait for an answer.
    pub fn send(&self, message: Box<dyn Message>) -> Result<(), InvocationError> {
        self.commands
            .send(Command::Send { message })
            .map_err(|_| InvocationError::NotConnected)
    }

    /// Sends a message and waits for the peer's response, with an
    /// optional deadline after which the wait completes as cancelled.
    pub async fn send_for(
        &self,
        message: Box<dyn Message>,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Message>, InvocationError> {
        let (completer, rx) = oneshot::channel();
        self.commands
            .send(Command::SendFor {
                message,
                timeout,
                completer,
            })
            .map_err(|_| InvocationError::NotConnected)?;
        rx.await.unwrap_or(Err(InvocationError::Dropped))
    }

    /// Sends a message as the response to an inbound message.
    pub fn respond(
        &self,
        response_to: MessageId,
        message: Box<dyn Message>,
    ) -> Result<(), InvocationError> {
        self.commands
            .send(Command::Respond {
                response_to,
                message,
            })
            .map_err(|_| InvocationError::NotConnected)
    }

    /// Disconnects, waiting until the peer has been notified and every
    /// outstanding request has been cancelled.
    pub async fn disconnect(&self) {
        self.disconnect_with_reason(None).await
    }

    /// Disconnects with an application-supplied reason string; the peer
    /// observes `ConnectionResult::Custom`.
    pub async fn disconnect_with_reason(&self, message: Option<String>) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect {
                reason: ConnectionResult::Custom,
                message,
                done,
            })
            .is_ok()
        {
            drop(rx.await);
        }
    }
}

/// A connection accepted by a listener: the handle plus its event
/// stream.
pub struct Accepted {
    pub connection: Connection,
    pub events: mpsc::UnboundedReceiver<Event>,
}

/// What a listener reports to the application.
pub enum ListenerEvent {
    /// A peer completed its handshake.
    Connected(Accepted),

    /// A peer failed to connect; its connection was never surfaced.
    ConnectionFailed { reason: ConnectionResult },

    /// A datagram with connection id zero arrived outside any
    /// connection (datagram listeners only).
    Connectionless {
        from: std::net::SocketAddr,
        message: Box<dyn Message>,
    },
}

/// The envelope fields a driver needs after the header itself has been
/// consumed by deserialization.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameInfo {
    pub protocol_id: u8,
    pub type_id: u16,
    pub message_id: MessageId,
    pub is_response: bool,
    pub response_id: Option<MessageId>,
}

impl FrameInfo {
    pub(crate) fn of(header: &tempest_proto::MessageHeader) -> Self {
        Self {
            protocol_id: header.protocol_id,
            type_id: header.type_id,
            message_id: header.message_id,
            is_response: header.is_response,
            response_id: header.response_id,
        }
    }
}

/// Per-connection state every driver owns, regardless of transport.
pub(crate) struct Core {
    pub serializer: tempest_proto::MessageSerializer,
    pub tracker: crate::tracker::ResponseTracker,
    pub events: mpsc::UnboundedSender<Event>,
    pub shared: Arc<Shared>,
    pub last_inbound_at: tokio::time::Instant,
}

impl Core {
    pub(crate) fn new(
        serializer: tempest_proto::MessageSerializer,
        events: mpsc::UnboundedSender<Event>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            serializer,
            tracker: crate::tracker::ResponseTracker::new(),
            events,
            shared,
            last_inbound_at: tokio::time::Instant::now(),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        drop(self.events.send(event));
    }

    /// Adopts the outcome of a completed handshake.
    pub(crate) fn install_session(&mut self, session: tempest_proto::handshake::Session) {
        self.serializer.set_connection_id(session.connection_id);
        self.shared.set_connection_id(session.connection_id);
        if let Some(security) = session.security {
            self.serializer
                .install_session(security.signer, security.session_key);
        }
        self.shared.set_state(ConnectionState::Connected);
    }
}

/// Control messages, classified for the drivers' dispatch loops.
pub(crate) enum Control {
    Ping,
    Pong,
    Disconnect {
        reason: ConnectionResult,
        message: Option<String>,
    },
    Acknowledge {
        id: u32,
    },
    Connect(ConnectMessage),
    AcknowledgeConnect(Box<AcknowledgeConnectMessage>),
    FinalConnect(FinalConnectMessage),
    Connected(ConnectedMessage),
    ConnectionResult(ConnectionResult),
}

pub(crate) fn classify_control(type_id: u16, message: &dyn Message) -> Option<Control> {
    let any = message.as_any();
    Some(match type_id {
        types::PING => {
            any.downcast_ref::<PingMessage>()?;
            Control::Ping
        }
        types::PONG => {
            any.downcast_ref::<PongMessage>()?;
            Control::Pong
        }
        types::DISCONNECT => {
            let disconnect = any.downcast_ref::<DisconnectMessage>()?;
            Control::Disconnect {
                reason: disconnect.reason,
                message: disconnect.custom_reason.clone(),
            }
        }
        types::ACKNOWLEDGE => Control::Acknowledge {
            id: any.downcast_ref::<AcknowledgeMessage>()?.message_id,
        },
        types::CONNECT => Control::Connect(any.downcast_ref::<ConnectMessage>()?.clone()),
        types::ACKNOWLEDGE_CONNECT => Control::AcknowledgeConnect(Box::new(
            any.downcast_ref::<AcknowledgeConnectMessage>()?.clone(),
        )),
        types::FINAL_CONNECT => {
            Control::FinalConnect(any.downcast_ref::<FinalConnectMessage>()?.clone())
        }
        types::CONNECTED => Control::Connected(*any.downcast_ref::<ConnectedMessage>()?),
        types::CONNECTION_RESULT => {
            Control::ConnectionResult(any.downcast_ref::<ConnectionResultMessage>()?.result)
        }
        _ => return None,
    })
}

/// How a driver's attempt to put a frame on the wire failed.
pub(crate) enum WriteFailure {
    Frame(tempest_proto::FrameError),
    Io(std::io::Error),
}

pub(crate) fn io_only(failure: WriteFailure) -> crate::errors::ReadError {
    match failure {
        WriteFailure::Io(err) => crate::errors::ReadError::Io(err),
        // Handshake messages are plain; serialization cannot fail for
        // want of a session.
        WriteFailure::Frame(err) => crate::errors::ReadError::Frame(err),
    }
}

pub(crate) fn expect_control(
    info: &FrameInfo,
    message: &dyn Message,
) -> Result<Control, crate::errors::ReadError> {
    use tempest_proto::{CONTROL_PROTOCOL_ID, HandshakeError};

    if info.protocol_id != CONTROL_PROTOCOL_ID {
        return Err(crate::errors::ReadError::Handshake(
            HandshakeError::UnexpectedMessage,
        ));
    }
    classify_control(info.type_id, message).ok_or(crate::errors::ReadError::Handshake(
        HandshakeError::UnexpectedMessage,
    ))
}

/// Whether a non-response message id moved backwards relative to the
/// last accepted one, accounting for wraparound of the 23-bit space.
pub(crate) fn regressed(last: MessageId, id: MessageId) -> bool {
    let forward = id.0.wrapping_sub(last.0) & MessageId::MAX;
    forward == 0 || forward > (1 << 22)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regression_detection() {
        assert!(regressed(MessageId(5), MessageId(5)));
        assert!(regressed(MessageId(5), MessageId(4)));
        assert!(regressed(MessageId(5), MessageId(0)));
        assert!(!regressed(MessageId(5), MessageId(6)));
        assert!(!regressed(MessageId(5), MessageId(100)));
    }

    #[test]
    fn regression_detection_across_wraparound() {
        // MAX wrapping to 0 is forward movement, not a regression.
        assert!(!regressed(MessageId(MessageId::MAX), MessageId(0)));
        assert!(!regressed(MessageId(MessageId::MAX - 1), MessageId(3)));
        // And the old pre-wrap ids are regressions.
        assert!(regressed(MessageId(1), MessageId(MessageId::MAX)));
    }
}
