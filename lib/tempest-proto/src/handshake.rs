// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The four-message handshake that negotiates protocol versions, the
//! signing algorithm and the session key.
//!
//! ```text
//! client                                server
//!   |------------- Connect --------------->|
//!   |<------- AcknowledgeConnect ----------|
//!   |----------- FinalConnect ------------>|
//!   |<------------ Connected --------------|
//! ```
//!
//! Each state is a type consumed by the step that leaves it, so an
//! out-of-order message has no method to call: the driver maps that to
//! [`HandshakeError::UnexpectedMessage`]. No I/O happens here; the
//! connection sends whatever messages a step returns.
//!
//! When no registered message type is authenticated or encrypted the
//! server skips the key exchange entirely and answers `Connect` with
//! `Connected`.

use std::sync::Arc;

use log::{debug, info};

use tempest_crypto::rsa::{PrivateKey, PublicKey};
use tempest_crypto::{HashAlgorithm, MessageSigner, generate_session_key};

use crate::control::{
    AcknowledgeConnectMessage, ConnectMessage, ConnectedMessage, FinalConnectMessage,
};
use crate::{HandshakeError, Protocol, ProtocolRegistry};

/// The key pair material a listener needs to accept secured sessions.
pub struct ServerIdentity {
    pub authentication: PrivateKey,
    pub encryption: PrivateKey,
}

impl ServerIdentity {
    /// Generates fresh authentication and encryption key pairs.
    pub fn generate() -> Result<Self, tempest_crypto::Error> {
        Ok(Self {
            authentication: PrivateKey::generate()?,
            encryption: PrivateKey::generate()?,
        })
    }
}

/// Security material shared by both ends of an established session.
#[derive(Clone)]
pub struct SessionSecurity {
    pub signer: MessageSigner,
    pub session_key: [u8; 32],
}

/// The outcome of a completed handshake.
pub struct Session {
    pub connection_id: i32,
    /// `None` when the handshake was skipped.
    pub security: Option<SessionSecurity>,
}

/// Starts a client handshake: the `Connect` to send, and the state that
/// consumes the server's answer.
pub fn begin(registry: &ProtocolRegistry) -> (ConnectMessage, ClientHandshake) {
    let protocols: Vec<Protocol> = registry.user_protocols().copied().collect();
    let connect = ConnectMessage {
        protocols: protocols.clone(),
        signature_hash_algorithms: HashAlgorithm::all()
            .iter()
            .map(|algorithm| algorithm.name().to_owned())
            .collect(),
    };
    (connect, ClientHandshake { protocols })
}

/// Client state: `Connect` sent, awaiting `AcknowledgeConnect` (or a bare
/// `Connected` when the server skipped the key exchange).
pub struct ClientHandshake {
    protocols: Vec<Protocol>,
}

impl ClientHandshake {
    /// Consumes the server's `AcknowledgeConnect`: imports its keys,
    /// wraps a fresh session key for it, and signs our public
    /// authentication key with the negotiated algorithm.
    pub fn handle_acknowledge(
        self,
        ack: &AcknowledgeConnectMessage,
    ) -> Result<(FinalConnectMessage, ClientSecured), HandshakeError> {
        let algorithm = HashAlgorithm::from_name(&ack.signature_hash_algorithm)
            .ok_or(HandshakeError::NoCommonHashAlgorithm)?;

        let compatible = ack.enabled_protocols.iter().any(|enabled| {
            self.protocols
                .iter()
                .any(|local| local.id() == enabled.id() && local.is_compatible_with(enabled.version()))
        });
        if !compatible {
            return Err(HandshakeError::IncompatibleVersion);
        }

        let server_encryption = PublicKey::from_der(&ack.public_encryption_key)?;
        // Imported eagerly so a malformed key fails the handshake here
        // rather than on the first authenticated message.
        let _server_authentication = PublicKey::from_der(&ack.public_authentication_key)?;

        let session_key = generate_session_key();
        let encrypted_session_key = server_encryption.encrypt(&session_key)?;

        let authentication = PrivateKey::generate()?;
        let public_authentication_key = authentication.public().to_der();
        let signature = authentication.sign(algorithm, &public_authentication_key)?;

        debug!("handshake negotiated {}", algorithm.name());
        Ok((
            FinalConnectMessage {
                encrypted_session_key,
                public_authentication_key,
                signature,
            },
            ClientSecured {
                connection_id: ack.connection_id,
                security: SessionSecurity {
                    signer: MessageSigner::new(algorithm, session_key),
                    session_key,
                },
            },
        ))
    }

    /// Consumes a bare `Connected`, the server's answer when no message
    /// type required a handshake.
    pub fn handle_connected(self, connected: &ConnectedMessage) -> Session {
        Session {
            connection_id: connected.connection_id,
            security: None,
        }
    }
}

/// Client state: `FinalConnect` sent, awaiting `Connected`.
pub struct ClientSecured {
    connection_id: i32,
    security: SessionSecurity,
}

impl ClientSecured {
    pub fn handle_connected(self, connected: &ConnectedMessage) -> Session {
        info!("session secured, connection id {}", connected.connection_id);
        Session {
            connection_id: connected.connection_id,
            security: Some(self.security),
        }
    }
}

/// What the server sends back for a `Connect`.
pub enum ServerResponse {
    /// Key exchange required: send the acknowledgement and await
    /// `FinalConnect`.
    Acknowledge(Box<AcknowledgeConnectMessage>, ServerHandshake),
    /// Handshake skipped: the session is ready immediately.
    Connected(ConnectedMessage, Session),
}

/// Validates a client's `Connect` and produces the server's answer.
pub fn respond(
    registry: &ProtocolRegistry,
    identity: Option<&Arc<ServerIdentity>>,
    connect: &ConnectMessage,
    connection_id: i32,
) -> Result<ServerResponse, HandshakeError> {
    if connect.protocols.is_empty() {
        return Err(HandshakeError::EmptyProtocols);
    }
    if connect.signature_hash_algorithms.is_empty() {
        return Err(HandshakeError::EmptyHashAlgorithms);
    }

    let enabled: Vec<Protocol> = connect
        .protocols
        .iter()
        .filter_map(|peer| {
            registry
                .protocol(peer.id())
                .filter(|local| {
                    local.is_compatible_with(peer.version())
                        && peer.is_compatible_with(local.version())
                })
                .copied()
        })
        .collect();
    if enabled.is_empty() {
        return Err(HandshakeError::IncompatibleVersion);
    }

    if !registry.requires_handshake() {
        debug!("no registered message needs a session, skipping key exchange");
        return Ok(ServerResponse::Connected(
            ConnectedMessage { connection_id },
            Session {
                connection_id,
                security: None,
            },
        ));
    }

    let identity = identity.ok_or(HandshakeError::UnexpectedMessage)?;

    // First algorithm the client offered that we also support.
    let algorithm = connect
        .signature_hash_algorithms
        .iter()
        .find_map(|name| HashAlgorithm::from_name(name))
        .ok_or(HandshakeError::NoCommonHashAlgorithm)?;

    let ack = AcknowledgeConnectMessage {
        signature_hash_algorithm: algorithm.name().to_owned(),
        enabled_protocols: enabled,
        connection_id,
        public_authentication_key: identity.authentication.public().to_der(),
        public_encryption_key: identity.encryption.public().to_der(),
    };

    Ok(ServerResponse::Acknowledge(
        Box::new(ack),
        ServerHandshake {
            identity: Arc::clone(identity),
            algorithm,
            connection_id,
        },
    ))
}

/// Server state: `AcknowledgeConnect` sent, awaiting `FinalConnect`.
pub struct ServerHandshake {
    identity: Arc<ServerIdentity>,
    algorithm: HashAlgorithm,
    connection_id: i32,
}

impl ServerHandshake {
    /// Consumes the client's `FinalConnect`: unwraps the session key,
    /// verifies the signature over the client's public authentication
    /// key, and completes the session.
    pub fn handle_final(
        self,
        final_connect: &FinalConnectMessage,
    ) -> Result<(ConnectedMessage, Session), HandshakeError> {
        let session_key: [u8; 32] = self
            .identity
            .encryption
            .decrypt(&final_connect.encrypted_session_key)?
            .try_into()
            .map_err(|_| HandshakeError::Crypto(tempest_crypto::Error::InvalidBuffer))?;

        let client_authentication = PublicKey::from_der(&final_connect.public_authentication_key)?;
        if !client_authentication.verify(
            self.algorithm,
            &final_connect.public_authentication_key,
            &final_connect.signature,
        ) {
            return Err(HandshakeError::BadSignature);
        }

        info!("session secured, connection id {}", self.connection_id);
        Ok((
            ConnectedMessage {
                connection_id: self.connection_id,
            },
            Session {
                connection_id: self.connection_id,
                security: Some(SessionSecurity {
                    signer: MessageSigner::new(self.algorithm, session_key),
                    session_key,
                }),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::OnceLock;

    use crate::Message;
    use tempest_wire::{Reader, Writer};

    #[derive(Default)]
    struct Secret;

    impl Message for Secret {
        fn protocol_id(&self) -> u8 {
            5
        }
        fn type_id(&self) -> u16 {
            1
        }
        fn encrypted(&self) -> bool {
            true
        }
        fn write_payload(&self, _writer: &mut Writer) {}
        fn read_payload(&mut self, _reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Plain;

    impl Message for Plain {
        fn protocol_id(&self) -> u8 {
            5
        }
        fn type_id(&self) -> u16 {
            2
        }
        fn write_payload(&self, _writer: &mut Writer) {}
        fn read_payload(&mut self, _reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn secured_registry(version: u16, min_version: u16) -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(
                Protocol::new(5, version, min_version),
                &[(1, || Box::new(Secret) as Box<dyn Message>)],
            )
            .unwrap();
        registry
    }

    fn plain_registry() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(
                Protocol::new(5, 1, 1),
                &[(2, || Box::new(Plain) as Box<dyn Message>)],
            )
            .unwrap();
        registry
    }

    // RSA key generation dominates these tests, so one identity is shared.
    fn identity() -> Arc<ServerIdentity> {
        static IDENTITY: OnceLock<Arc<ServerIdentity>> = OnceLock::new();
        Arc::clone(IDENTITY.get_or_init(|| Arc::new(ServerIdentity::generate().unwrap())))
    }

    fn expect_err<T>(result: Result<T, HandshakeError>) -> HandshakeError {
        match result {
            Ok(_) => panic!("expected the handshake step to fail"),
            Err(err) => err,
        }
    }

    #[test]
    fn full_handshake_agrees_on_the_session_key() {
        let client_registry = secured_registry(5, 4);
        let server_registry = secured_registry(5, 4);
        let identity = identity();

        let (connect, client) = begin(&client_registry);
        let response = respond(&server_registry, Some(&identity), &connect, 7).unwrap();
        let ServerResponse::Acknowledge(ack, server) = response else {
            panic!("expected a key exchange");
        };

        let (final_connect, client) = client.handle_acknowledge(&ack).unwrap();
        let (connected, server_session) = server.handle_final(&final_connect).unwrap();
        let client_session = client.handle_connected(&connected);

        assert_eq!(client_session.connection_id, 7);
        assert_eq!(server_session.connection_id, 7);

        let client_security = client_session.security.unwrap();
        let server_security = server_session.security.unwrap();
        assert_eq!(client_security.session_key, server_security.session_key);

        // A tag produced by one side verifies on the other.
        let tag = client_security.signer.sign(b"frame");
        assert!(server_security.signer.verify(b"frame", &tag));
    }

    #[test]
    fn handshake_is_skipped_without_secured_messages() {
        let client_registry = plain_registry();
        let server_registry = plain_registry();

        let (connect, client) = begin(&client_registry);
        let response = respond(&server_registry, None, &connect, 3).unwrap();
        let ServerResponse::Connected(connected, server_session) = response else {
            panic!("expected the key exchange to be skipped");
        };

        let client_session = client.handle_connected(&connected);
        assert!(client_session.security.is_none());
        assert!(server_session.security.is_none());
        assert_eq!(client_session.connection_id, 3);
    }

    #[test]
    fn empty_protocol_list_fails_the_handshake() {
        let connect = ConnectMessage {
            protocols: vec![],
            signature_hash_algorithms: vec!["SHA256".into()],
        };
        let err = expect_err(respond(&secured_registry(1, 1), Some(&identity()), &connect, 1));
        assert_eq!(err, HandshakeError::EmptyProtocols);
        assert_eq!(
            err.result(),
            crate::control::ConnectionResult::FailedHandshake
        );
    }

    #[test]
    fn empty_hash_list_fails_the_handshake() {
        let (mut connect, _) = begin(&secured_registry(1, 1));
        connect.signature_hash_algorithms.clear();
        let err = expect_err(respond(&secured_registry(1, 1), Some(&identity()), &connect, 1));
        assert_eq!(err, HandshakeError::EmptyHashAlgorithms);
    }

    #[test]
    fn version_below_minimum_is_incompatible() {
        // Server speaks v5 and requires at least v4; the client only
        // speaks v3.
        let client_registry = secured_registry(3, 1);
        let server_registry = secured_registry(5, 4);

        let (connect, _) = begin(&client_registry);
        let err = expect_err(respond(&server_registry, Some(&identity()), &connect, 1));
        assert_eq!(err, HandshakeError::IncompatibleVersion);
        assert_eq!(
            err.result(),
            crate::control::ConnectionResult::IncompatibleVersion
        );
    }

    #[test]
    fn version_at_minimum_connects() {
        let client_registry = secured_registry(4, 1);
        let server_registry = secured_registry(5, 4);

        let (connect, _) = begin(&client_registry);
        assert!(respond(&server_registry, Some(&identity()), &connect, 1).is_ok());
    }

    #[test]
    fn unknown_hash_algorithms_fail() {
        let (mut connect, _) = begin(&secured_registry(1, 1));
        connect.signature_hash_algorithms = vec!["MD5".into()];
        let err = expect_err(respond(&secured_registry(1, 1), Some(&identity()), &connect, 1));
        assert_eq!(err, HandshakeError::NoCommonHashAlgorithm);
    }

    #[test]
    fn tampered_final_connect_signature_is_rejected() {
        let registry = secured_registry(1, 1);
        let identity = identity();

        let (connect, client) = begin(&registry);
        let ServerResponse::Acknowledge(ack, server) =
            respond(&registry, Some(&identity), &connect, 1).unwrap()
        else {
            panic!("expected a key exchange");
        };

        let (mut final_connect, _) = client.handle_acknowledge(&ack).unwrap();
        let last = final_connect.signature.len() - 1;
        final_connect.signature[last] ^= 0x01;

        assert_eq!(
            expect_err(server.handle_final(&final_connect)),
            HandshakeError::BadSignature
        );
    }

    #[test]
    fn garbage_session_key_fails_cryptographically() {
        let registry = secured_registry(1, 1);
        let identity = identity();

        let (connect, client) = begin(&registry);
        let ServerResponse::Acknowledge(ack, server) =
            respond(&registry, Some(&identity), &connect, 1).unwrap()
        else {
            panic!("expected a key exchange");
        };

        let (mut final_connect, _) = client.handle_acknowledge(&ack).unwrap();
        final_connect.encrypted_session_key = vec![0xab; 256];

        assert!(matches!(
            expect_err(server.handle_final(&final_connect)),
            HandshakeError::Crypto(_)
        ));
    }

    #[test]
    fn bad_server_keys_fail_on_the_client() {
        let registry = secured_registry(1, 1);
        let identity = identity();

        let (connect, client) = begin(&registry);
        let ServerResponse::Acknowledge(mut ack, _) =
            respond(&registry, Some(&identity), &connect, 1).unwrap()
        else {
            panic!("expected a key exchange");
        };

        ack.public_encryption_key = vec![1, 2, 3];
        assert!(matches!(
            expect_err(client.handle_acknowledge(&ack)),
            HandshakeError::Crypto(_)
        ));
    }
}
