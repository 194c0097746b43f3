// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The stream-framed connection: frames are cut out of a continuous
//! receive buffer, partial headers survive across socket completions,
//! and the stream itself guarantees ordering, so inbound ids only need
//! the monotonicity check.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use tempest_proto::control::{
    ConnectionResult, ConnectionResultMessage, DisconnectMessage, PingMessage, PongMessage,
};
use tempest_proto::handshake::{self, ServerIdentity, ServerResponse};
use tempest_proto::{
    CONTROL_PROTOCOL_ID, FrameError, HandshakeError, Message, MessageHeader, MessageId,
    MessageSerializer, ProtocolRegistry,
};

use crate::config::ConnectionConfig;
use crate::context::NetContext;
use crate::errors::{ConnectError, ReadError};
use crate::net::Target;

use super::{
    Accepted, Command, Connection, ConnectionState, Control, Core, Event, FrameInfo,
    InboundMessage, ListenerEvent, Shared, WriteFailure, expect_control, io_only, regressed,
};

const INITIAL_BUFFER: usize = 64 * 1024;

/// Opens a connection to `target`, runs the handshake, and returns the
/// handle together with its event stream once the connection is in
/// steady state.
pub async fn connect(
    target: Target,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
) -> Result<(Connection, mpsc::UnboundedReceiver<Event>), ConnectError> {
    let addr = target.resolve().await?;
    info!("connecting to {}...", target);

    let shared = Arc::new(Shared::new(ConnectionState::Connecting));
    let stream = TcpStream::connect(addr).await?;
    shared.set_state(ConnectionState::Handshaking);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let mut driver = TcpDriver::new(
        stream,
        registry,
        context,
        config,
        events_tx,
        Arc::clone(&shared),
        commands_rx,
    );

    match driver.client_handshake().await {
        Ok(leftovers) => {
            let connection = Connection {
                shared,
                commands: commands_tx,
            };
            driver.core.emit(Event::Connected);
            tokio::spawn(driver.run(leftovers));
            Ok((connection, events_rx))
        }
        Err(err) => {
            driver.teardown(err.result(), None, err.notify_peer()).await;
            Err(err.into())
        }
    }
}

/// Accepts Tempest connections over TCP.
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Binds and starts accepting. Each accepted peer is driven through
    /// the server handshake and surfaced as a [`ListenerEvent`].
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ProtocolRegistry>,
        context: Arc<NetContext>,
        config: ConnectionConfig,
    ) -> io::Result<(Listener, mpsc::UnboundedReceiver<ListenerEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let identity = if registry.requires_handshake() {
            Some(Arc::new(ServerIdentity::generate().map_err(|err| {
                io::Error::other(format!("listener key generation failed: {}", err))
            })?))
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(
            listener, registry, context, config, identity, events_tx,
        ));

        Ok((
            Listener {
                local_addr,
                accept_task,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
    identity: Option<Arc<ServerIdentity>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted {}", addr);
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&registry),
                    Arc::clone(&context),
                    config.clone(),
                    identity.clone(),
                    events.clone(),
                ));
            }
            Err(err) => {
                warn!("accept failed: {}", err);
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
    identity: Option<Arc<ServerIdentity>>,
    listener_events: mpsc::UnboundedSender<ListenerEvent>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::new(ConnectionState::Handshaking));
    let connection_id = context.next_connection_id();

    let mut driver = TcpDriver::new(
        stream,
        registry,
        context,
        config,
        events_tx,
        Arc::clone(&shared),
        commands_rx,
    );

    match driver.server_handshake(identity.as_ref(), connection_id).await {
        Ok(leftovers) => {
            let connection = Connection {
                shared,
                commands: commands_tx,
            };
            driver.core.emit(Event::Connected);
            drop(listener_events.send(ListenerEvent::Connected(Accepted {
                connection,
                events: events_rx,
            })));
            driver.run(leftovers).await;
        }
        Err(err) => {
            info!("peer handshake failed: {}", err);
            if let ReadError::Handshake(handshake_err) = &err {
                driver.send_connection_result(handshake_err.result()).await;
            }
            driver.teardown(err.result(), None, false).await;
            drop(listener_events.send(ListenerEvent::ConnectionFailed {
                reason: err.result(),
            }));
        }
    }
}

enum Tick {
    Read(io::Result<usize>),
    Cmd(Option<Command>),
    Ping,
    Sweep,
}

enum LoopEnd {
    UserDisconnect {
        reason: ConnectionResult,
        message: Option<String>,
        done: tokio::sync::oneshot::Sender<()>,
    },
    HandleDropped,
}

enum ClientStage {
    AwaitingAck(handshake::ClientHandshake),
    AwaitingConnected(handshake::ClientSecured),
}

enum ServerStage {
    AwaitingConnect,
    AwaitingFinal(handshake::ServerHandshake),
}

pub(crate) struct TcpDriver {
    stream: TcpStream,
    commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) core: Core,
    config: ConnectionConfig,
    context: Arc<NetContext>,

    buffer: Vec<u8>,
    tail: usize,
    partial: Option<MessageHeader>,
    last_inbound: Option<MessageId>,
}

impl TcpDriver {
    fn new(
        stream: TcpStream,
        registry: Arc<ProtocolRegistry>,
        context: Arc<NetContext>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<Event>,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        context.pool().connection_opened();
        let serializer =
            MessageSerializer::new(registry).with_max_message_size(config.max_message_size);
        Self {
            stream,
            commands,
            core: Core::new(serializer, events, shared),
            config,
            context,
            buffer: vec![0; INITIAL_BUFFER],
            tail: 0,
            partial: None,
            last_inbound: None,
        }
    }

    // ---- handshake phase ------------------------------------------------

    async fn client_handshake(
        &mut self,
    ) -> Result<Vec<(FrameInfo, Box<dyn Message>)>, ReadError> {
        let registry = Arc::clone(self.core.serializer.registry());
        let (connect, first) = handshake::begin(&registry);
        self.write_next(&connect, None).await.map_err(io_only)?;

        let mut stage = ClientStage::AwaitingAck(first);
        loop {
            self.recv_some().await?;
            let mut frames = self.drain_frames()?.into_iter();
            while let Some((info, message)) = frames.next() {
                let control = expect_control(&info, &*message)?;
                stage = match (stage, control) {
                    (ClientStage::AwaitingAck(state), Control::AcknowledgeConnect(ack)) => {
                        let (final_connect, secured) = state.handle_acknowledge(&ack)?;
                        self.write_next(&final_connect, None)
                            .await
                            .map_err(io_only)?;
                        ClientStage::AwaitingConnected(secured)
                    }
                    (ClientStage::AwaitingAck(state), Control::Connected(connected)) => {
                        self.core.install_session(state.handle_connected(&connected));
                        return Ok(frames.collect());
                    }
                    (ClientStage::AwaitingConnected(state), Control::Connected(connected)) => {
                        self.core.install_session(state.handle_connected(&connected));
                        return Ok(frames.collect());
                    }
                    (_, Control::ConnectionResult(result)) => {
                        return Err(ReadError::PeerDisconnected {
                            reason: result,
                            message: None,
                        });
                    }
                    (_, Control::Disconnect { reason, message }) => {
                        return Err(ReadError::PeerDisconnected { reason, message });
                    }
                    _ => return Err(ReadError::Handshake(HandshakeError::UnexpectedMessage)),
                };
            }
        }
    }

    async fn server_handshake(
        &mut self,
        identity: Option<&Arc<ServerIdentity>>,
        connection_id: i32,
    ) -> Result<Vec<(FrameInfo, Box<dyn Message>)>, ReadError> {
        let registry = Arc::clone(self.core.serializer.registry());

        let mut stage = ServerStage::AwaitingConnect;
        loop {
            self.recv_some().await?;
            let mut frames = self.drain_frames()?.into_iter();
            while let Some((info, message)) = frames.next() {
                let control = expect_control(&info, &*message)?;
                stage = match (stage, control) {
                    (ServerStage::AwaitingConnect, Control::Connect(connect)) => {
                        match handshake::respond(&registry, identity, &connect, connection_id)? {
                            ServerResponse::Acknowledge(ack, state) => {
                                self.write_next(&*ack, None).await.map_err(io_only)?;
                                ServerStage::AwaitingFinal(state)
                            }
                            ServerResponse::Connected(connected, session) => {
                                self.core.install_session(session);
                                self.write_next(&connected, None).await.map_err(io_only)?;
                                return Ok(frames.collect());
                            }
                        }
                    }
                    (ServerStage::AwaitingFinal(state), Control::FinalConnect(final_connect)) => {
                        let (connected, session) = state.handle_final(&final_connect)?;
                        self.core.install_session(session);
                        self.write_next(&connected, None).await.map_err(io_only)?;
                        return Ok(frames.collect());
                    }
                    (_, Control::Disconnect { reason, message }) => {
                        return Err(ReadError::PeerDisconnected { reason, message });
                    }
                    _ => return Err(ReadError::Handshake(HandshakeError::UnexpectedMessage)),
                };
            }
        }
    }

    async fn send_connection_result(&mut self, result: ConnectionResult) {
        let message = ConnectionResultMessage {
            result,
            custom_reason: None,
        };
        drop(self.write_next(&message, None).await);
    }

    // ---- steady state ---------------------------------------------------

    pub(crate) async fn run(mut self, leftovers: Vec<(FrameInfo, Box<dyn Message>)>) {
        match self.steady(leftovers).await {
            Ok(LoopEnd::UserDisconnect {
                reason,
                message,
                done,
            }) => {
                self.teardown(reason, message, true).await;
                drop(done.send(()));
            }
            Ok(LoopEnd::HandleDropped) => {
                self.teardown(ConnectionResult::Custom, None, true).await;
            }
            Err(err) => {
                warn!("connection failed: {}", err);
                let message = match &err {
                    ReadError::PeerDisconnected { message, .. } => message.clone(),
                    _ => None,
                };
                self.teardown(err.result(), message, err.notify_peer()).await;
            }
        }
    }

    async fn steady(
        &mut self,
        leftovers: Vec<(FrameInfo, Box<dyn Message>)>,
    ) -> Result<LoopEnd, ReadError> {
        for (info, message) in leftovers {
            self.dispatch(info, message).await?;
        }

        let mut ping = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.ensure_read_capacity();

            let tick = {
                let TcpDriver {
                    stream,
                    commands,
                    buffer,
                    tail,
                    ..
                } = self;
                tokio::select! {
                    read = stream.read(&mut buffer[*tail..]) => Tick::Read(read),
                    command = commands.recv() => Tick::Cmd(command),
                    _ = ping.tick() => Tick::Ping,
                    _ = sweep.tick() => Tick::Sweep,
                }
            };

            match tick {
                Tick::Read(Ok(0)) => {
                    return Err(ReadError::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "read 0 bytes",
                    )));
                }
                Tick::Read(Ok(n)) => {
                    trace!("read {} bytes from the network", n);
                    self.tail += n;
                    self.core.last_inbound_at = Instant::now();
                    for (info, message) in self.drain_frames()? {
                        self.dispatch(info, message).await?;
                    }
                }
                Tick::Read(Err(err)) => return Err(err.into()),
                Tick::Cmd(None) => return Ok(LoopEnd::HandleDropped),
                Tick::Cmd(Some(Command::Disconnect {
                    reason,
                    message,
                    done,
                })) => {
                    return Ok(LoopEnd::UserDisconnect {
                        reason,
                        message,
                        done,
                    });
                }
                Tick::Cmd(Some(command)) => self.handle_command(command).await?,
                Tick::Ping => {
                    if self.core.last_inbound_at.elapsed() > self.config.ping_timeout {
                        return Err(ReadError::TimedOut);
                    }
                    if let Err(WriteFailure::Io(err)) =
                        self.write_next(&PingMessage, None).await
                    {
                        return Err(err.into());
                    }
                }
                Tick::Sweep => self.core.tracker.check_timeouts(Instant::now()),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ReadError> {
        match command {
            Command::Send { message } => match self.write_next(&*message, None).await {
                Ok(_) | Err(WriteFailure::Frame(_)) => {}
                Err(WriteFailure::Io(err)) => return Err(err.into()),
            },
            Command::SendFor {
                message,
                timeout,
                completer,
            } => {
                let id = self.core.serializer.next_message_id();
                self.core.tracker.register(id, completer, timeout);
                match self.write_frame(&*message, id, None).await {
                    Ok(()) => {}
                    Err(WriteFailure::Frame(err)) => {
                        warn!("request could not be serialized: {}", err);
                        self.core.tracker.fail_send(id);
                    }
                    // Teardown clears the tracker, so the waiter still
                    // observes a single cancellation.
                    Err(WriteFailure::Io(err)) => return Err(err.into()),
                }
            }
            Command::Respond {
                response_to,
                message,
            } => match self.write_next(&*message, Some(response_to)).await {
                Ok(_) | Err(WriteFailure::Frame(_)) => {}
                Err(WriteFailure::Io(err)) => return Err(err.into()),
            },
            Command::Disconnect { .. } => unreachable!("handled by the steady loop"),
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        info: FrameInfo,
        message: Box<dyn Message>,
    ) -> Result<(), ReadError> {
        if info.protocol_id == CONTROL_PROTOCOL_ID {
            match expect_control(&info, &*message)? {
                Control::Ping => {
                    if let Err(WriteFailure::Io(err)) =
                        self.write_next(&PongMessage, Some(info.message_id)).await
                    {
                        return Err(err.into());
                    }
                }
                Control::Pong => {
                    // Any inbound traffic already refreshed the liveness
                    // clock; nothing further to do.
                }
                Control::Disconnect { reason, message } => {
                    return Err(ReadError::PeerDisconnected { reason, message });
                }
                Control::Acknowledge { id } => {
                    trace!("ignoring datagram ack {} on a stream transport", id);
                }
                Control::ConnectionResult(result) => {
                    debug!("ignoring late connection result {:?}", result);
                }
                _ => return Err(ReadError::Handshake(HandshakeError::UnexpectedMessage)),
            }
            return Ok(());
        }

        if info.is_response {
            let response_id = info
                .response_id
                .ok_or(ReadError::Frame(FrameError::BadMessageId {
                    got: info.message_id.0,
                }))?;
            if !self.core.serializer.is_plausible_response(response_id) {
                return Err(ReadError::Frame(FrameError::BadMessageId {
                    got: response_id.0,
                }));
            }
            self.core.tracker.receive(response_id, message);
            return Ok(());
        }

        if let Some(last) = self.last_inbound {
            if regressed(last, info.message_id) {
                return Err(ReadError::Frame(FrameError::BadMessageId {
                    got: info.message_id.0,
                }));
            }
        }
        self.last_inbound = Some(info.message_id);
        self.core.emit(Event::Message(InboundMessage {
            id: info.message_id,
            message,
        }));
        Ok(())
    }

    // ---- receive path ---------------------------------------------------

    fn ensure_read_capacity(&mut self) {
        if self.tail == self.buffer.len() {
            let ceiling = self.config.max_message_size + INITIAL_BUFFER;
            let grown = (self.buffer.len() * 2).clamp(INITIAL_BUFFER, ceiling);
            self.buffer.resize(grown.max(self.tail + 1024), 0);
        }
    }

    async fn recv_some(&mut self) -> Result<(), ReadError> {
        self.ensure_read_capacity();
        let n = self.stream.read(&mut self.buffer[self.tail..]).await?;
        if n == 0 {
            return Err(ReadError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "read 0 bytes",
            )));
        }
        self.tail += n;
        self.core.last_inbound_at = Instant::now();
        Ok(())
    }

    /// Cuts every complete frame out of the receive buffer, carrying a
    /// partial header over to the next read, and compacts the buffer.
    fn drain_frames(&mut self) -> Result<Vec<(FrameInfo, Box<dyn Message>)>, ReadError> {
        let mut out = Vec::new();
        let mut offset = 0;

        while offset < self.tail {
            let mut header = self.partial.take().unwrap_or_default();
            match self
                .core
                .serializer
                .try_read_header(&mut header, &self.buffer[offset..self.tail])
            {
                Err(FrameError::MissingBytes) => {
                    self.partial = Some(header);
                    break;
                }
                Err(err) => return Err(err.into()),
                Ok(()) => {
                    if self.tail - offset < header.length {
                        // Frame announced but not fully buffered yet.
                        self.partial = Some(header);
                        break;
                    }
                    let info = FrameInfo::of(&header);
                    let length = header.length;
                    let frame = &self.buffer[offset..offset + length];
                    let message = self.core.serializer.deserialize(header, frame)?;
                    out.push((info, message));
                    offset += length;
                }
            }
        }

        if offset > 0 {
            self.buffer.copy_within(offset..self.tail, 0);
            self.tail -= offset;
        }
        // A frame larger than the current buffer was announced; make
        // room so the reads can ever complete it.
        if let Some(header) = &self.partial {
            if header.is_complete() && header.length > self.buffer.len() {
                self.buffer.resize(header.length, 0);
            }
        }

        Ok(out)
    }

    // ---- send path ------------------------------------------------------

    async fn write_next(
        &mut self,
        message: &dyn Message,
        response_to: Option<MessageId>,
    ) -> Result<MessageId, WriteFailure> {
        let id = self.core.serializer.next_message_id();
        self.write_frame(message, id, response_to).await?;
        Ok(id)
    }

    async fn write_frame(
        &mut self,
        message: &dyn Message,
        id: MessageId,
        response_to: Option<MessageId>,
    ) -> Result<(), WriteFailure> {
        let buffer = self.context.pool().acquire();
        let frame = match self
            .core
            .serializer
            .serialize_into(buffer, message, id, response_to)
        {
            Ok(frame) => frame,
            Err(err) => {
                self.context.pool().release(Vec::new());
                return Err(WriteFailure::Frame(err));
            }
        };

        let result = self.stream.write_all(&frame).await;
        self.context.pool().release(frame);
        result.map_err(WriteFailure::Io)
    }

    // ---- teardown -------------------------------------------------------

    pub(crate) async fn teardown(
        &mut self,
        reason: ConnectionResult,
        message: Option<String>,
        notify_peer: bool,
    ) {
        self.core.shared.set_state(ConnectionState::Disconnecting);

        if notify_peer {
            let disconnect = DisconnectMessage {
                reason,
                custom_reason: message.clone(),
            };
            let id = self.core.serializer.next_message_id();
            if let Ok(frame) = self.core.serializer.serialize(&disconnect, id, None) {
                drop(
                    tokio::time::timeout(
                        Duration::from_secs(1),
                        self.stream.write_all(&frame),
                    )
                    .await,
                );
            }
        }

        self.core.tracker.clear();
        self.core.emit(Event::Disconnected { reason, message });
        self.core.shared.set_state(ConnectionState::Disconnected);
        self.context.pool().connection_closed();
    }
}

