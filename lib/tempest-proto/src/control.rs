// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tempest's internal control messages (protocol id 1).
//!
//! These carry the handshake, liveness probes, datagram acknowledgements
//! and disconnect notifications. They are never handed to user code; the
//! connection consumes them itself.

use std::any::Any;

use tempest_wire::{Encoding, Reader, Writer};

use crate::protocol::MessageConstructor;
use crate::{Message, Protocol};

/// Message type ids within the control protocol.
pub mod types {
    pub const CONNECT: u16 = 2;
    pub const CONNECTION_RESULT: u16 = 3;
    pub const DISCONNECT: u16 = 4;
    pub const PING: u16 = 5;
    pub const PONG: u16 = 6;
    pub const ACKNOWLEDGE_CONNECT: u16 = 7;
    pub const FINAL_CONNECT: u16 = 8;
    pub const CONNECTED: u16 = 9;
    pub const ACKNOWLEDGE: u16 = 10;
}

/// The outcome of connecting, carried in `ConnectionResult` and
/// `Disconnect` messages and surfaced in disconnect events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionResult {
    FailedUnknown,
    Success,
    ConnectionFailed,
    IncompatibleVersion,
    FailedHandshake,
    MessageAuthenticationFailed,
    EncryptionMismatch,
    Custom,
    TimedOut,
}

impl ConnectionResult {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::FailedUnknown => 0,
            Self::Success => 1,
            Self::ConnectionFailed => 2,
            Self::IncompatibleVersion => 3,
            Self::FailedHandshake => 4,
            Self::MessageAuthenticationFailed => 5,
            Self::EncryptionMismatch => 6,
            Self::Custom => 7,
            Self::TimedOut => 8,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::FailedUnknown,
            1 => Self::Success,
            2 => Self::ConnectionFailed,
            3 => Self::IncompatibleVersion,
            4 => Self::FailedHandshake,
            5 => Self::MessageAuthenticationFailed,
            6 => Self::EncryptionMismatch,
            7 => Self::Custom,
            8 => Self::TimedOut,
            _ => return None,
        })
    }
}

macro_rules! control_message {
    ($name:ident, $type_id:expr, reliable: $reliable:expr) => {
        impl Message for $name {
            fn protocol_id(&self) -> u8 {
                crate::CONTROL_PROTOCOL_ID
            }

            fn type_id(&self) -> u16 {
                $type_id
            }

            fn must_be_reliable(&self) -> bool {
                $reliable
            }

            fn write_payload(&self, writer: &mut Writer) {
                self.write(writer)
            }

            fn read_payload(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
                self.read(reader)
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

fn write_protocols(writer: &mut Writer, protocols: &[Protocol]) {
    writer.write_var_int(protocols.len() as i32);
    for protocol in protocols {
        writer.write_u8(protocol.id());
        writer.write_u16(protocol.version());
        writer.write_u16(protocol.min_version());
    }
}

fn read_protocols(reader: &mut Reader<'_>) -> tempest_wire::Result<Vec<Protocol>> {
    let count = reader.read_var_int()?;
    if count < 0 {
        return Err(tempest_wire::Error::NegativeLength { got: count });
    }
    (0..count)
        .map(|_| {
            let id = reader.read_u8()?;
            let version = reader.read_u16()?;
            let min_version = reader.read_u16()?;
            Ok(Protocol::new(id, version, min_version))
        })
        .collect()
}

/// Opens the handshake: the protocols this peer speaks and the signature
/// hash algorithms it supports, in preference order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectMessage {
    pub protocols: Vec<Protocol>,
    pub signature_hash_algorithms: Vec<String>,
}

impl ConnectMessage {
    fn write(&self, writer: &mut Writer) {
        write_protocols(writer, &self.protocols);
        writer.write_var_int(self.signature_hash_algorithms.len() as i32);
        for name in &self.signature_hash_algorithms {
            writer.write_string(name, Encoding::Utf8);
        }
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.protocols = read_protocols(reader)?;
        let count = reader.read_var_int()?;
        if count < 0 {
            return Err(tempest_wire::Error::NegativeLength { got: count });
        }
        self.signature_hash_algorithms = (0..count)
            .map(|_| reader.read_string(Encoding::Utf8))
            .collect::<tempest_wire::Result<_>>()?;
        Ok(())
    }
}

control_message!(ConnectMessage, types::CONNECT, reliable: true);

/// Reports the outcome of a connection attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionResultMessage {
    pub result: ConnectionResult,
    pub custom_reason: Option<String>,
}

impl Default for ConnectionResultMessage {
    fn default() -> Self {
        Self {
            result: ConnectionResult::FailedUnknown,
            custom_reason: None,
        }
    }
}

impl ConnectionResultMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.result.to_u8());
        writer.write_str(self.custom_reason.as_deref(), Encoding::Utf8);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.result = ConnectionResult::from_u8(reader.read_u8()?)
            .unwrap_or(ConnectionResult::FailedUnknown);
        self.custom_reason = reader.read_str(Encoding::Utf8)?;
        Ok(())
    }
}

control_message!(ConnectionResultMessage, types::CONNECTION_RESULT, reliable: true);

/// Announces teardown, carrying the reason the peer should surface.
#[derive(Clone, Debug, PartialEq)]
pub struct DisconnectMessage {
    pub reason: ConnectionResult,
    pub custom_reason: Option<String>,
}

impl Default for DisconnectMessage {
    fn default() -> Self {
        Self {
            reason: ConnectionResult::FailedUnknown,
            custom_reason: None,
        }
    }
}

impl DisconnectMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.reason.to_u8());
        writer.write_str(self.custom_reason.as_deref(), Encoding::Utf8);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.reason = ConnectionResult::from_u8(reader.read_u8()?)
            .unwrap_or(ConnectionResult::FailedUnknown);
        self.custom_reason = reader.read_str(Encoding::Utf8)?;
        Ok(())
    }
}

control_message!(DisconnectMessage, types::DISCONNECT, reliable: true);

/// A liveness probe; the peer answers with a [`PongMessage`] response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingMessage;

impl PingMessage {
    fn write(&self, _writer: &mut Writer) {}

    fn read(&mut self, _reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        Ok(())
    }
}

control_message!(PingMessage, types::PING, reliable: false);

/// The response to a [`PingMessage`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PongMessage;

impl PongMessage {
    fn write(&self, _writer: &mut Writer) {}

    fn read(&mut self, _reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        Ok(())
    }
}

control_message!(PongMessage, types::PONG, reliable: false);

/// The server's answer to `Connect`: the negotiated hash algorithm, the
/// protocols it enabled, the connection id it assigned, and its public
/// keys for signature verification and session key wrapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcknowledgeConnectMessage {
    pub signature_hash_algorithm: String,
    pub enabled_protocols: Vec<Protocol>,
    pub connection_id: i32,
    pub public_authentication_key: Vec<u8>,
    pub public_encryption_key: Vec<u8>,
}

impl AcknowledgeConnectMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.signature_hash_algorithm, Encoding::Utf8);
        write_protocols(writer, &self.enabled_protocols);
        writer.write_i32(self.connection_id);
        writer.write_bytes(&self.public_authentication_key);
        writer.write_bytes(&self.public_encryption_key);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.signature_hash_algorithm = reader.read_string(Encoding::Utf8)?;
        self.enabled_protocols = read_protocols(reader)?;
        self.connection_id = reader.read_i32()?;
        self.public_authentication_key = reader.read_bytes()?;
        self.public_encryption_key = reader.read_bytes()?;
        Ok(())
    }
}

control_message!(AcknowledgeConnectMessage, types::ACKNOWLEDGE_CONNECT, reliable: true);

/// The client's final handshake message: the wrapped session key, its
/// public authentication key, and a signature over that key made with the
/// matching private key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalConnectMessage {
    pub encrypted_session_key: Vec<u8>,
    pub public_authentication_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl FinalConnectMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.encrypted_session_key);
        writer.write_bytes(&self.public_authentication_key);
        writer.write_bytes(&self.signature);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.encrypted_session_key = reader.read_bytes()?;
        self.public_authentication_key = reader.read_bytes()?;
        self.signature = reader.read_bytes()?;
        Ok(())
    }
}

control_message!(FinalConnectMessage, types::FINAL_CONNECT, reliable: true);

/// Moves both sides into the steady state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectedMessage {
    pub connection_id: i32,
}

impl ConnectedMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_i32(self.connection_id);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.connection_id = reader.read_i32()?;
        Ok(())
    }
}

control_message!(ConnectedMessage, types::CONNECTED, reliable: true);

/// Acknowledges delivery of one reliable datagram. Never itself reliable,
/// or the two sides would acknowledge acknowledgements forever.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcknowledgeMessage {
    pub message_id: u32,
}

impl AcknowledgeMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.message_id);
    }

    fn read(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.message_id = reader.read_u32()?;
        Ok(())
    }
}

control_message!(AcknowledgeMessage, types::ACKNOWLEDGE, reliable: false);

/// The constructor table the registry installs for the control protocol.
pub(crate) const CONTROL_MESSAGES: &[(u16, MessageConstructor)] = &[
    (types::CONNECT, || Box::new(ConnectMessage::default())),
    (types::CONNECTION_RESULT, || {
        Box::new(ConnectionResultMessage::default())
    }),
    (types::DISCONNECT, || Box::new(DisconnectMessage::default())),
    (types::PING, || Box::new(PingMessage)),
    (types::PONG, || Box::new(PongMessage)),
    (types::ACKNOWLEDGE_CONNECT, || {
        Box::new(AcknowledgeConnectMessage::default())
    }),
    (types::FINAL_CONNECT, || {
        Box::new(FinalConnectMessage::default())
    }),
    (types::CONNECTED, || Box::new(ConnectedMessage::default())),
    (types::ACKNOWLEDGE, || {
        Box::new(AcknowledgeMessage::default())
    }),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<M: Message + Default + PartialEq + std::fmt::Debug>(message: M) -> M {
        let mut writer = Writer::new();
        message.write_payload(&mut writer);
        let bytes = writer.into_vec();

        let mut read_back = M::default();
        let mut reader = Reader::from_slice(&bytes);
        read_back.read_payload(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        read_back
    }

    #[test]
    fn connect_round_trips() {
        let message = ConnectMessage {
            protocols: vec![Protocol::new(2, 3, 1), Protocol::new(7, 1, 1)],
            signature_hash_algorithms: vec!["SHA256".into(), "SHA1".into()],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn disconnect_round_trips_with_custom_reason() {
        let message = DisconnectMessage {
            reason: ConnectionResult::Custom,
            custom_reason: Some("operator shutdown".into()),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn acknowledge_connect_round_trips() {
        let message = AcknowledgeConnectMessage {
            signature_hash_algorithm: "SHA256".into(),
            enabled_protocols: vec![Protocol::new(5, 5, 4)],
            connection_id: 42,
            public_authentication_key: vec![1, 2, 3],
            public_encryption_key: vec![4, 5, 6],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn connection_result_values_are_stable() {
        // These values are part of the wire contract.
        let expected = [
            (ConnectionResult::FailedUnknown, 0),
            (ConnectionResult::Success, 1),
            (ConnectionResult::ConnectionFailed, 2),
            (ConnectionResult::IncompatibleVersion, 3),
            (ConnectionResult::FailedHandshake, 4),
            (ConnectionResult::MessageAuthenticationFailed, 5),
            (ConnectionResult::EncryptionMismatch, 6),
            (ConnectionResult::Custom, 7),
            (ConnectionResult::TimedOut, 8),
        ];
        for (result, value) in expected {
            assert_eq!(result.to_u8(), value);
            assert_eq!(ConnectionResult::from_u8(value), Some(result));
        }
        assert_eq!(ConnectionResult::from_u8(9), None);
    }

    #[test]
    fn every_control_type_has_a_constructor() {
        for (type_id, constructor) in CONTROL_MESSAGES {
            let prototype = constructor();
            assert_eq!(Message::type_id(&*prototype), *type_id);
            assert_eq!(prototype.protocol_id(), crate::CONTROL_PROTOCOL_ID);
            // No session exists while the handshake runs, so no control
            // message may demand one.
            assert!(!prototype.authenticated());
            assert!(!prototype.encrypted());
        }
    }
}
