// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::collections::HashMap;
use std::fmt;

use crate::Message;
use crate::control;

/// The protocol id reserved for Tempest's internal control messages.
pub const CONTROL_PROTOCOL_ID: u8 = 1;

/// An (id, version) pair scoping a set of message type ids.
///
/// Two protocols are compatible iff their ids match and the peer's
/// version is at least the local minimum. Immutable once registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protocol {
    id: u8,
    version: u16,
    min_version: u16,
    requires_handshake: bool,
}

impl Protocol {
    pub fn new(id: u8, version: u16, min_version: u16) -> Self {
        Self {
            id,
            version,
            min_version,
            requires_handshake: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn min_version(&self) -> u16 {
        self.min_version
    }

    /// Whether any message registered under this protocol needs the
    /// handshake's session key material.
    pub fn requires_handshake(&self) -> bool {
        self.requires_handshake
    }

    /// Whether a peer advertising `peer_version` can talk to us.
    pub fn is_compatible_with(&self, peer_version: u16) -> bool {
        peer_version >= self.min_version
    }
}

/// Creates a blank instance of a message type, ready for `read_payload`.
pub type MessageConstructor = fn() -> Box<dyn Message>;

/// The error type for protocol registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Protocol id 1 belongs to the control protocol.
    ReservedProtocol { id: u8 },

    /// The protocol id was registered twice.
    DuplicateProtocol { id: u8 },

    /// Two message types under one protocol share a type id.
    DuplicateType { protocol: u8, type_id: u16 },
}

impl std::error::Error for RegistryError {}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ReservedProtocol { id } => {
                write!(f, "protocol id {} is reserved for control messages", id)
            }
            Self::DuplicateProtocol { id } => write!(f, "protocol {} registered twice", id),
            Self::DuplicateType { protocol, type_id } => {
                write!(f, "type {} registered twice in protocol {}", type_id, protocol)
            }
        }
    }
}

/// The closed registry of every protocol and message type a connection
/// understands, fixed before any connection is made.
///
/// Maps (protocol id, message type id) to the constructor producing a
/// blank instance for the parser to fill. Registering a message whose
/// prototype is authenticated or encrypted raises `requires_handshake`
/// on the owning protocol and on the registry as a whole.
pub struct ProtocolRegistry {
    protocols: HashMap<u8, Protocol>,
    constructors: HashMap<(u8, u16), MessageConstructor>,
    requires_handshake: bool,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Creates a registry pre-populated with the control protocol.
    pub fn new() -> Self {
        let mut registry = Self {
            protocols: HashMap::new(),
            constructors: HashMap::new(),
            requires_handshake: false,
        };

        let control_protocol = Protocol::new(CONTROL_PROTOCOL_ID, 1, 1);
        registry.protocols.insert(CONTROL_PROTOCOL_ID, control_protocol);
        for (type_id, constructor) in control::CONTROL_MESSAGES {
            registry
                .constructors
                .insert((CONTROL_PROTOCOL_ID, *type_id), *constructor);
        }

        registry
    }

    /// Registers a protocol together with its message types.
    pub fn register(
        &mut self,
        mut protocol: Protocol,
        messages: &[(u16, MessageConstructor)],
    ) -> Result<(), RegistryError> {
        if protocol.id == CONTROL_PROTOCOL_ID {
            return Err(RegistryError::ReservedProtocol { id: protocol.id });
        }
        if self.protocols.contains_key(&protocol.id) {
            return Err(RegistryError::DuplicateProtocol { id: protocol.id });
        }

        // Validate before touching any state so a failed registration
        // leaves the registry as it was.
        let mut type_ids = std::collections::HashSet::new();
        for (type_id, _) in messages {
            if !type_ids.insert(*type_id) {
                return Err(RegistryError::DuplicateType {
                    protocol: protocol.id,
                    type_id: *type_id,
                });
            }
        }

        for (type_id, constructor) in messages {
            let prototype = constructor();
            if prototype.authenticated() || prototype.encrypted() {
                protocol.requires_handshake = true;
                self.requires_handshake = true;
            }
            self.constructors.insert((protocol.id, *type_id), *constructor);
        }

        self.protocols.insert(protocol.id, protocol);
        Ok(())
    }

    /// Creates a blank instance of the given message type, or `None` when
    /// the (protocol, type) pair is unknown.
    pub fn create(&self, protocol_id: u8, type_id: u16) -> Option<Box<dyn Message>> {
        self.constructors
            .get(&(protocol_id, type_id))
            .map(|constructor| constructor())
    }

    pub fn protocol(&self, id: u8) -> Option<&Protocol> {
        self.protocols.get(&id)
    }

    /// The registered protocols, control protocol excluded.
    pub fn user_protocols(&self) -> impl Iterator<Item = &Protocol> {
        self.protocols
            .values()
            .filter(|p| p.id != CONTROL_PROTOCOL_ID)
    }

    /// Whether any registered message type needs a handshake.
    pub fn requires_handshake(&self) -> bool {
        self.requires_handshake
    }
}
