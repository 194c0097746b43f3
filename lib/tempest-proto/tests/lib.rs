// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Engine-level tests: two peers talk through the full protocol stack
//! (handshake, serialization, ordering) with bytes handed across
//! directly, no sockets involved.

use std::any::Any;
use std::sync::Arc;

use tempest_proto::control::types;
use tempest_proto::handshake::{self, ServerIdentity, ServerResponse};
use tempest_proto::{
    FrameError, Message, MessageHeader, MessageId, MessageSerializer, Protocol, ProtocolRegistry,
    ReliableQueue,
};
use tempest_wire::{Encoding, Reader, Writer};

#[derive(Clone, Debug, Default, PartialEq)]
struct ChatMessage {
    content: String,
}

impl Message for ChatMessage {
    fn protocol_id(&self) -> u8 {
        2
    }
    fn type_id(&self) -> u16 {
        1
    }
    fn encrypted(&self) -> bool {
        true
    }
    fn must_be_reliable(&self) -> bool {
        true
    }
    fn write_payload(&self, writer: &mut Writer) {
        writer.write_string(&self.content, Encoding::Utf8);
    }
    fn read_payload(&mut self, reader: &mut Reader<'_>) -> tempest_wire::Result<()> {
        self.content = reader.read_string(Encoding::Utf8)?;
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn registry() -> Arc<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::new();
    registry
        .register(
            Protocol::new(2, 1, 1),
            &[(1, || Box::new(ChatMessage::default()) as Box<dyn Message>)],
        )
        .unwrap();
    Arc::new(registry)
}

/// Runs the whole handshake between two serializers, as the transports
/// would, and leaves both with an installed session.
fn establish(
    client: &mut MessageSerializer,
    server: &mut MessageSerializer,
    identity: &Arc<ServerIdentity>,
) {
    let client_registry = Arc::clone(client.registry());
    let server_registry = Arc::clone(server.registry());

    let (connect, client_state) = handshake::begin(&client_registry);
    let ServerResponse::Acknowledge(ack, server_state) =
        handshake::respond(&server_registry, Some(identity), &connect, 1).unwrap()
    else {
        panic!("key exchange expected");
    };

    let (final_connect, client_state) = client_state.handle_acknowledge(&ack).unwrap();
    let (connected, server_session) = server_state.handle_final(&final_connect).unwrap();
    let client_session = client_state.handle_connected(&connected);

    let security = client_session.security.unwrap();
    client.set_connection_id(client_session.connection_id);
    client.install_session(security.signer, security.session_key);

    let security = server_session.security.unwrap();
    server.set_connection_id(server_session.connection_id);
    server.install_session(security.signer, security.session_key);
}

fn parse(serializer: &MessageSerializer, frame: &[u8]) -> MessageHeader {
    let mut header = MessageHeader::new();
    serializer.try_read_header(&mut header, frame).unwrap();
    header
}

#[test]
fn encrypted_conversation_end_to_end() {
    let registry = registry();
    let identity = Arc::new(ServerIdentity::generate().unwrap());
    let mut client = MessageSerializer::new(Arc::clone(&registry));
    let mut server = MessageSerializer::new(Arc::clone(&registry));
    establish(&mut client, &mut server, &identity);

    for expected in ["first", "second", "third"] {
        let message = ChatMessage {
            content: expected.into(),
        };
        let id = client.next_message_id();
        let frame = client.serialize(&message, id, None).unwrap();

        // The payload never appears on the wire in the clear.
        assert!(!frame
            .windows(expected.len())
            .any(|window| window == expected.as_bytes()));

        let header = parse(&server, &frame);
        let received = server.deserialize(header, &frame).unwrap();
        let received = received.as_any().downcast_ref::<ChatMessage>().unwrap();
        assert_eq!(received.content, expected);
    }
}

#[test]
fn sessions_do_not_cross_connections() {
    let registry = registry();
    let identity = Arc::new(ServerIdentity::generate().unwrap());

    let mut client_a = MessageSerializer::new(Arc::clone(&registry));
    let mut server_a = MessageSerializer::new(Arc::clone(&registry));
    establish(&mut client_a, &mut server_a, &identity);

    let mut client_b = MessageSerializer::new(Arc::clone(&registry));
    let mut server_b = MessageSerializer::new(Arc::clone(&registry));
    establish(&mut client_b, &mut server_b, &identity);

    let message = ChatMessage {
        content: "for a only".into(),
    };
    let id = client_a.next_message_id();
    let frame = client_a.serialize(&message, id, None).unwrap();

    // Session B cannot decrypt session A's traffic.
    let header = parse(&server_b, &frame);
    match server_b.deserialize(header, &frame) {
        Err(FrameError::AuthenticationFailed) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("session b decrypted session a's traffic"),
    }
}

#[test]
fn out_of_order_frames_are_reordered_by_the_queue() {
    let registry = registry();
    let identity = Arc::new(ServerIdentity::generate().unwrap());
    let mut client = MessageSerializer::new(Arc::clone(&registry));
    let mut server = MessageSerializer::new(Arc::clone(&registry));
    establish(&mut client, &mut server, &identity);

    let mut frames = Vec::new();
    for content in ["0", "1", "2", "3"] {
        let message = ChatMessage {
            content: content.into(),
        };
        let id = client.next_message_id();
        frames.push((id, client.serialize(&message, id, None).unwrap()));
    }
    // Deliver 2, 0, 3, 1 and duplicate 2 along the way.
    let order = [2usize, 0, 3, 2, 1];

    let mut queue: ReliableQueue<String> = ReliableQueue::new();
    let mut delivered = Vec::new();
    for index in order {
        let (id, frame) = &frames[index];
        let header = parse(&server, frame);
        let message = server.deserialize(header, frame).unwrap();
        let message = message.as_any().downcast_ref::<ChatMessage>().unwrap();
        delivered.extend(queue.enqueue(*id, message.content.clone()));
    }

    assert_eq!(delivered, ["0", "1", "2", "3"]);
}

#[test]
fn control_messages_parse_with_a_sessionless_serializer() {
    let registry = registry();
    let mut sender = MessageSerializer::new(Arc::clone(&registry));
    let receiver = MessageSerializer::new(Arc::clone(&registry));

    let (connect, _) = handshake::begin(&registry);
    let id = sender.next_message_id();
    let frame = sender.serialize(&connect, id, None).unwrap();

    let header = parse(&receiver, &frame);
    assert_eq!(header.type_id, types::CONNECT);
    assert!(!header.encrypted);
    let message = receiver.deserialize(header, &frame).unwrap();
    assert!(message.as_any().downcast_ref::<tempest_proto::control::ConnectMessage>().is_some());
}

#[test]
fn response_frames_correlate_by_id() {
    let registry = registry();
    let identity = Arc::new(ServerIdentity::generate().unwrap());
    let mut client = MessageSerializer::new(Arc::clone(&registry));
    let mut server = MessageSerializer::new(Arc::clone(&registry));
    establish(&mut client, &mut server, &identity);

    // Request travels client -> server.
    let request = ChatMessage {
        content: "what time is it?".into(),
    };
    let request_id = client.next_message_id();
    let frame = client.serialize(&request, request_id, None).unwrap();
    let header = parse(&server, &frame);
    let request_seen = header.message_id;
    server.deserialize(header, &frame).unwrap();

    // Response travels server -> client, referencing the request.
    let response = ChatMessage {
        content: "half past".into(),
    };
    let response_id = server.next_message_id();
    let frame = server
        .serialize(&response, response_id, Some(request_seen))
        .unwrap();
    let header = parse(&client, &frame);
    assert!(header.is_response);
    assert_eq!(header.response_id, Some(request_id));
    assert!(client.is_plausible_response(header.response_id.unwrap()));

    // An id the client never issued is implausible.
    assert!(!client.is_plausible_response(MessageId(5000)));
}
