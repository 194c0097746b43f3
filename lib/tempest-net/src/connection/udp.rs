// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The datagram connection: every frame travels in its own datagram,
//! reliable messages are retained and retransmitted until acknowledged,
//! and the reliable queue restores ordering on the receive side.
//!
//! Reliable and unreliable messages share the socket but not an id
//! space: reliable ids come from the connection's primary counter (so
//! the receive queue sees a dense sequence), unreliable ids from a
//! second counter that nothing on the receive side tracks. Request
//! correlation is therefore only offered for reliable messages here.
//!
//! One listener socket serves every connection; a router task hands
//! datagrams to the matching connection by peer address. Datagrams with
//! connection id zero and no connection are the connectionless path and
//! surface as listener events.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use tempest_proto::control::{
    AcknowledgeMessage, ConnectionResult, ConnectionResultMessage, DisconnectMessage, PingMessage,
    PongMessage, types,
};
use tempest_proto::handshake::{self, ServerIdentity, ServerResponse};
use tempest_proto::{
    CONTROL_PROTOCOL_ID, FrameError, HandshakeError, Message, MessageHeader, MessageId,
    MessageSerializer, ProtocolRegistry, ReliableQueue,
};

use crate::config::ConnectionConfig;
use crate::context::NetContext;
use crate::errors::{ConnectError, InvocationError, ReadError};
use crate::net::Target;

use super::{
    Accepted, Command, Connection, ConnectionState, Control, Core, Event, FrameInfo,
    InboundMessage, ListenerEvent, Shared, WriteFailure, expect_control, io_only,
};

const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Opens a datagram connection to `target` and runs the handshake over
/// it, retransmitting until the server answers or the delivery deadline
/// expires.
pub async fn connect_udp(
    target: Target,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
) -> Result<(Connection, mpsc::UnboundedReceiver<Event>), ConnectError> {
    let addr = target.resolve().await?;
    info!("connecting to {} over udp...", target);

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal bind address")
    } else {
        "[::]:0".parse().expect("literal bind address")
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(addr).await?;

    let shared = Arc::new(Shared::new(ConnectionState::Handshaking));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let mut driver = UdpDriver::new(
        DatagramSource::Socket(Arc::clone(&socket)),
        DatagramSink::Connected(socket),
        registry,
        context,
        config,
        events_tx,
        Arc::clone(&shared),
        commands_rx,
    );

    match driver.client_handshake().await {
        Ok(backlog) => {
            let connection = Connection {
                shared,
                commands: commands_tx,
            };
            driver.core.emit(Event::Connected);
            tokio::spawn(driver.run(backlog));
            Ok((connection, events_rx))
        }
        Err(err) => {
            driver.teardown(err.result(), None, err.notify_peer()).await;
            Err(err.into())
        }
    }
}

/// Accepts Tempest connections over UDP, one socket for all of them.
pub struct UdpListener {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    registry: Arc<ProtocolRegistry>,
    router_task: JoinHandle<()>,
}

impl UdpListener {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ProtocolRegistry>,
        context: Arc<NetContext>,
        config: ConnectionConfig,
    ) -> io::Result<(UdpListener, mpsc::UnboundedReceiver<ListenerEvent>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let identity = if registry.requires_handshake() {
            Some(Arc::new(ServerIdentity::generate().map_err(|err| {
                io::Error::other(format!("listener key generation failed: {}", err))
            })?))
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router_task = tokio::spawn(route_datagrams(
            Arc::clone(&socket),
            Arc::clone(&registry),
            context,
            config,
            identity,
            events_tx,
        ));

        Ok((
            UdpListener {
                local_addr,
                socket,
                registry,
                router_task,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends a single connectionless datagram (connection id zero) to an
    /// arbitrary peer. Only plain messages can travel this way.
    pub async fn send_connectionless(
        &self,
        to: SocketAddr,
        message: &dyn Message,
    ) -> io::Result<()> {
        let mut serializer = MessageSerializer::new(Arc::clone(&self.registry));
        let frame = serializer
            .serialize(message, MessageId(0), None)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        self.socket.send_to(&frame, to).await.map(|_| ())
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.router_task.abort();
    }
}

async fn route_datagrams(
    socket: Arc<UdpSocket>,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
    identity: Option<Arc<ServerIdentity>>,
    listener_events: mpsc::UnboundedSender<ListenerEvent>,
) {
    let mut routes: HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buffer = vec![0u8; DATAGRAM_BUFFER];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (n, from) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("udp receive failed: {}", err);
                        continue;
                    }
                };
                let datagram = buffer[..n].to_vec();

                if let Some(route) = routes.get(&from) {
                    if route.send(datagram).is_ok() {
                        continue;
                    }
                    // The driver is gone; fall through as if unknown.
                    routes.remove(&from);
                    continue;
                }

                handle_unknown_peer(
                    datagram,
                    from,
                    &socket,
                    &registry,
                    &context,
                    &config,
                    &identity,
                    &listener_events,
                    &mut routes,
                    &done_tx,
                );
            }
            gone = done_rx.recv() => {
                if let Some(addr) = gone {
                    routes.remove(&addr);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_unknown_peer(
    datagram: Vec<u8>,
    from: SocketAddr,
    socket: &Arc<UdpSocket>,
    registry: &Arc<ProtocolRegistry>,
    context: &Arc<NetContext>,
    config: &ConnectionConfig,
    identity: &Option<Arc<ServerIdentity>>,
    listener_events: &mpsc::UnboundedSender<ListenerEvent>,
    routes: &mut HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>,
    done_tx: &mpsc::UnboundedSender<SocketAddr>,
) {
    // Peek at the first frame with a sessionless serializer; everything
    // that can legitimately arrive outside a connection is plain.
    let scratch = MessageSerializer::new(Arc::clone(registry));
    let mut header = MessageHeader::new();
    if scratch.try_read_header(&mut header, &datagram).is_err() {
        debug!("dropping unparseable datagram from {}", from);
        return;
    }
    let connection_id = header.connection_id;
    let type_id = header.type_id;
    let protocol_id = header.protocol_id;
    let length = header.length;
    if datagram.len() < length {
        debug!("dropping truncated datagram from {}", from);
        return;
    }

    if protocol_id == CONTROL_PROTOCOL_ID && type_id == types::CONNECT {
        debug!("new udp peer {}", from);
        let (datagrams_tx, datagrams_rx) = mpsc::unbounded_channel();
        drop(datagrams_tx.send(datagram));
        routes.insert(from, datagrams_tx);
        tokio::spawn(serve_udp_connection(
            Arc::clone(socket),
            from,
            datagrams_rx,
            Arc::clone(registry),
            Arc::clone(context),
            config.clone(),
            identity.clone(),
            listener_events.clone(),
            done_tx.clone(),
        ));
        return;
    }

    if connection_id == 0 {
        match scratch.deserialize(header, &datagram) {
            Ok(message) => {
                drop(listener_events.send(ListenerEvent::Connectionless { from, message }));
            }
            Err(err) => debug!("bad connectionless datagram from {}: {}", from, err),
        }
        return;
    }

    debug!(
        "dropping datagram for unknown connection {} from {}",
        connection_id, from
    );
}

#[allow(clippy::too_many_arguments)]
async fn serve_udp_connection(
    socket: Arc<UdpSocket>,
    from: SocketAddr,
    datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
    registry: Arc<ProtocolRegistry>,
    context: Arc<NetContext>,
    config: ConnectionConfig,
    identity: Option<Arc<ServerIdentity>>,
    listener_events: mpsc::UnboundedSender<ListenerEvent>,
    done: mpsc::UnboundedSender<SocketAddr>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::new(ConnectionState::Handshaking));
    let connection_id = context.next_connection_id();

    let mut driver = UdpDriver::new(
        DatagramSource::Channel(datagrams),
        DatagramSink::SendTo(socket, from),
        registry,
        context,
        config,
        events_tx,
        Arc::clone(&shared),
        commands_rx,
    );

    match driver.server_handshake(identity.as_ref(), connection_id).await {
        Ok(backlog) => {
            let connection = Connection {
                shared,
                commands: commands_tx,
            };
            driver.core.emit(Event::Connected);
            drop(listener_events.send(ListenerEvent::Connected(Accepted {
                connection,
                events: events_rx,
            })));
            driver.run(backlog).await;
        }
        Err(err) => {
            info!("udp peer {} handshake failed: {}", from, err);
            if let ReadError::Handshake(handshake_err) = &err {
                driver.send_connection_result(handshake_err.result()).await;
            }
            driver.teardown(err.result(), None, false).await;
            drop(listener_events.send(ListenerEvent::ConnectionFailed {
                reason: err.result(),
            }));
        }
    }

    drop(done.send(from));
}

enum DatagramSource {
    Socket(Arc<UdpSocket>),
    Channel(mpsc::UnboundedReceiver<Vec<u8>>),
}

enum DatagramSink {
    Connected(Arc<UdpSocket>),
    SendTo(Arc<UdpSocket>, SocketAddr),
}

async fn recv_datagram(source: &mut DatagramSource, buffer: &mut [u8]) -> io::Result<usize> {
    match source {
        DatagramSource::Socket(socket) => socket.recv(buffer).await,
        DatagramSource::Channel(datagrams) => match datagrams.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buffer.len());
                buffer[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener went away",
            )),
        },
    }
}

async fn send_datagram(sink: &DatagramSink, frame: &[u8]) -> io::Result<()> {
    match sink {
        DatagramSink::Connected(socket) => socket.send(frame).await.map(|_| ()),
        DatagramSink::SendTo(socket, addr) => socket.send_to(frame, *addr).await.map(|_| ()),
    }
}

struct PendingReliable {
    frame: Vec<u8>,
    first_sent: Instant,
    next_retry: Instant,
    attempts: u32,
}

enum Tick {
    Read(io::Result<usize>),
    Cmd(Option<Command>),
    Resend,
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

type Backlog = VecDeque<(FrameInfo, Box<dyn Message>)>;

struct UdpDriver {
    source: DatagramSource,
    sink: DatagramSink,
    commands: mpsc::UnboundedReceiver<Command>,
    core: Core,
    config: ConnectionConfig,
    context: Arc<NetContext>,

    recv_buffer: Vec<u8>,
    queue: ReliableQueue<(FrameInfo, Box<dyn Message>)>,
    pending: HashMap<u32, PendingReliable>,
    unreliable_next: MessageId,
}

impl UdpDriver {
    #[allow(clippy::too_many_arguments)]
    fn new(
        source: DatagramSource,
        sink: DatagramSink,
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
            source,
            sink,
            commands,
            core: Core::new(serializer, events, shared),
            config,
            context,
            recv_buffer: vec![0; DATAGRAM_BUFFER],
            queue: ReliableQueue::new(),
            pending: HashMap::new(),
            unreliable_next: MessageId(0),
        }
    }

    // ---- handshake phase ------------------------------------------------

    async fn client_handshake(&mut self) -> Result<Backlog, ReadError> {
        let registry = Arc::clone(self.core.serializer.registry());
        let (connect, first) = handshake::begin(&registry);
        self.send_message(&connect, None).await.map_err(io_only)?;

        let mut stage = ClientStage::AwaitingAck(first);
        let mut backlog: Backlog = VecDeque::new();
        let mut resend = self.resend_interval();

        loop {
            while let Some((info, message)) = backlog.pop_front() {
                let control = expect_control(&info, &*message)?;
                stage = match (stage, control) {
                    (ClientStage::AwaitingAck(state), Control::AcknowledgeConnect(ack)) => {
                        let (final_connect, secured) = state.handle_acknowledge(&ack)?;
                        self.send_message(&final_connect, None)
                            .await
                            .map_err(io_only)?;
                        ClientStage::AwaitingConnected(secured)
                    }
                    (ClientStage::AwaitingAck(state), Control::Connected(connected)) => {
                        self.core.install_session(state.handle_connected(&connected));
                        return Ok(backlog);
                    }
                    (ClientStage::AwaitingConnected(state), Control::Connected(connected)) => {
                        self.core.install_session(state.handle_connected(&connected));
                        return Ok(backlog);
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

            self.handshake_tick(&mut resend, &mut backlog).await?;
        }
    }

    async fn server_handshake(
        &mut self,
        identity: Option<&Arc<ServerIdentity>>,
        connection_id: i32,
    ) -> Result<Backlog, ReadError> {
        let registry = Arc::clone(self.core.serializer.registry());

        let mut stage = ServerStage::AwaitingConnect;
        let mut backlog: Backlog = VecDeque::new();
        let mut resend = self.resend_interval();

        loop {
            while let Some((info, message)) = backlog.pop_front() {
                let control = expect_control(&info, &*message)?;
                stage = match (stage, control) {
                    (ServerStage::AwaitingConnect, Control::Connect(connect)) => {
                        match handshake::respond(&registry, identity, &connect, connection_id)? {
                            ServerResponse::Acknowledge(ack, state) => {
                                self.send_message(&*ack, None).await.map_err(io_only)?;
                                ServerStage::AwaitingFinal(state)
                            }
                            ServerResponse::Connected(connected, session) => {
                                self.core.install_session(session);
                                self.send_message(&connected, None).await.map_err(io_only)?;
                                return Ok(backlog);
                            }
                        }
                    }
                    (ServerStage::AwaitingFinal(state), Control::FinalConnect(final_connect)) => {
                        let (connected, session) = state.handle_final(&final_connect)?;
                        self.core.install_session(session);
                        self.send_message(&connected, None).await.map_err(io_only)?;
                        return Ok(backlog);
                    }
                    (_, Control::Disconnect { reason, message }) => {
                        return Err(ReadError::PeerDisconnected { reason, message });
                    }
                    _ => return Err(ReadError::Handshake(HandshakeError::UnexpectedMessage)),
                };
            }

            self.handshake_tick(&mut resend, &mut backlog).await?;
        }
    }

    /// One turn of the handshake loop: wait for a datagram or the resend
    /// timer and refill the backlog with whatever became deliverable.
    async fn handshake_tick(
        &mut self,
        resend: &mut tokio::time::Interval,
        backlog: &mut Backlog,
    ) -> Result<(), ReadError> {
        let received = {
            let UdpDriver {
                source,
                recv_buffer,
                ..
            } = self;
            tokio::select! {
                received = recv_datagram(source, recv_buffer) => Some(received),
                _ = resend.tick() => None,
            }
        };

        match received {
            Some(received) => {
                let n = received?;
                self.core.last_inbound_at = Instant::now();
                for (info, message) in self.parse_datagram(n)? {
                    if message.must_be_reliable() {
                        self.send_ack(info.message_id).await?;
                        backlog.extend(self.queue.enqueue(info.message_id, (info, message)));
                    } else {
                        trace!("ignoring unreliable frame during the handshake");
                    }
                }
            }
            None => self.retransmit().await?,
        }
        Ok(())
    }

    async fn send_connection_result(&mut self, result: ConnectionResult) {
        let message = ConnectionResultMessage {
            result,
            custom_reason: None,
        };
        drop(self.send_message(&message, None).await);
    }

    // ---- steady state ---------------------------------------------------

    async fn run(mut self, backlog: Backlog) {
        match self.steady(backlog).await {
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
                warn!("udp connection failed: {}", err);
                let message = match &err {
                    ReadError::PeerDisconnected { message, .. } => message.clone(),
                    _ => None,
                };
                self.teardown(err.result(), message, err.notify_peer()).await;
            }
        }
    }

    async fn steady(&mut self, backlog: Backlog) -> Result<LoopEnd, ReadError> {
        for (info, message) in backlog {
            self.dispatch(info, message).await?;
        }

        let mut resend = self.resend_interval();
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
            let tick = {
                let UdpDriver {
                    source,
                    recv_buffer,
                    commands,
                    ..
                } = self;
                tokio::select! {
                    received = recv_datagram(source, recv_buffer) => Tick::Read(received),
                    command = commands.recv() => Tick::Cmd(command),
                    _ = resend.tick() => Tick::Resend,
                    _ = ping.tick() => Tick::Ping,
                    _ = sweep.tick() => Tick::Sweep,
                }
            };

            match tick {
                Tick::Read(Ok(n)) => {
                    self.core.last_inbound_at = Instant::now();
                    for (info, message) in self.parse_datagram(n)? {
                        self.accept_frame(info, message).await?;
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
                Tick::Resend => self.retransmit().await?,
                Tick::Ping => {
                    if self.core.last_inbound_at.elapsed() > self.config.ping_timeout {
                        return Err(ReadError::TimedOut);
                    }
                    if let Err(WriteFailure::Io(err)) = self.send_message(&PingMessage, None).await
                    {
                        return Err(err.into());
                    }
                }
                Tick::Sweep => self.core.tracker.check_timeouts(Instant::now()),
            }
        }
    }

    /// Routes one inbound frame: reliable frames are acknowledged (even
    /// duplicates, whose earlier acknowledgement may have been lost) and
    /// released through the ordering queue; unreliable frames go
    /// straight through.
    async fn accept_frame(
        &mut self,
        info: FrameInfo,
        message: Box<dyn Message>,
    ) -> Result<(), ReadError> {
        if message.must_be_reliable() {
            self.send_ack(info.message_id).await?;
            for (info, message) in self.queue.enqueue(info.message_id, (info, message)) {
                self.dispatch(info, message).await?;
            }
        } else {
            self.dispatch(info, message).await?;
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
                        self.send_message(&PongMessage, Some(info.message_id)).await
                    {
                        return Err(err.into());
                    }
                }
                Control::Pong => {}
                Control::Disconnect { reason, message } => {
                    return Err(ReadError::PeerDisconnected { reason, message });
                }
                Control::Acknowledge { id } => {
                    if let Some(entry) = self.pending.remove(&id) {
                        trace!("reliable message {} acknowledged", id);
                        self.context.pool().release(entry.frame);
                    }
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

        self.core.emit(Event::Message(InboundMessage {
            id: info.message_id,
            message,
        }));
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ReadError> {
        match command {
            Command::Send { message } => match self.send_message(&*message, None).await {
                Ok(_) | Err(WriteFailure::Frame(_)) => {}
                Err(WriteFailure::Io(err)) => return Err(err.into()),
            },
            Command::SendFor {
                message,
                timeout,
                completer,
            } => {
                if !message.must_be_reliable() {
                    // Correlation needs the reliable id space; see the
                    // module docs.
                    warn!("send_for over the unreliable channel is not supported");
                    drop(completer.send(Err(InvocationError::Dropped)));
                    return Ok(());
                }
                let id = self.core.serializer.next_message_id();
                self.core.tracker.register(id, completer, timeout);
                match self.send_frame_with_id(&*message, id, None).await {
                    Ok(()) => {}
                    Err(WriteFailure::Frame(err)) => {
                        warn!("request could not be serialized: {}", err);
                        self.core.tracker.fail_send(id);
                    }
                    Err(WriteFailure::Io(err)) => return Err(err.into()),
                }
            }
            Command::Respond {
                response_to,
                message,
            } => match self.send_message(&*message, Some(response_to)).await {
                Ok(_) | Err(WriteFailure::Frame(_)) => {}
                Err(WriteFailure::Io(err)) => return Err(err.into()),
            },
            Command::Disconnect { .. } => unreachable!("handled by the steady loop"),
        }
        Ok(())
    }

    // ---- send path ------------------------------------------------------

    fn next_id_for(&mut self, message: &dyn Message) -> MessageId {
        if message.must_be_reliable() {
            self.core.serializer.next_message_id()
        } else {
            let id = self.unreliable_next;
            self.unreliable_next = id.next();
            id
        }
    }

    async fn send_message(
        &mut self,
        message: &dyn Message,
        response_to: Option<MessageId>,
    ) -> Result<MessageId, WriteFailure> {
        let id = self.next_id_for(message);
        self.send_frame_with_id(message, id, response_to).await?;
        Ok(id)
    }

    async fn send_frame_with_id(
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

        if let Err(err) = send_datagram(&self.sink, &frame).await {
            self.context.pool().release(frame);
            return Err(WriteFailure::Io(err));
        }

        if message.must_be_reliable() {
            let now = Instant::now();
            self.pending.insert(
                id.0,
                PendingReliable {
                    frame,
                    first_sent: now,
                    next_retry: now + self.config.resend_backoff,
                    attempts: 0,
                },
            );
        } else {
            self.context.pool().release(frame);
        }
        Ok(())
    }

    async fn send_ack(&mut self, id: MessageId) -> Result<(), ReadError> {
        let ack = AcknowledgeMessage { message_id: id.0 };
        match self.send_message(&ack, None).await {
            Ok(_) | Err(WriteFailure::Frame(_)) => Ok(()),
            Err(WriteFailure::Io(err)) => Err(err.into()),
        }
    }

    fn resend_interval(&self) -> tokio::time::Interval {
        let mut interval = interval_at(
            Instant::now() + self.config.resend_tick,
            self.config.resend_tick,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Walks the pending table: gives up past the delivery deadline,
    /// retransmits entries whose backoff elapsed.
    async fn retransmit(&mut self) -> Result<(), ReadError> {
        let now = Instant::now();
        let mut due: Vec<u32> = Vec::new();

        for (&id, entry) in &mut self.pending {
            if now.duration_since(entry.first_sent) >= self.config.resend_deadline {
                debug!("reliable message {} exhausted its delivery deadline", id);
                return Err(ReadError::TimedOut);
            }
            if now >= entry.next_retry {
                let backoff = self
                    .config
                    .resend_backoff
                    .saturating_mul(1 << entry.attempts.min(16))
                    .min(self.config.resend_backoff_cap);
                entry.attempts += 1;
                entry.next_retry = now + backoff;
                due.push(id);
            }
        }

        for id in due {
            let entry = &self.pending[&id];
            trace!("retransmitting {} (attempt {})", id, entry.attempts);
            send_datagram(&self.sink, &entry.frame).await?;
        }
        Ok(())
    }

    // ---- receive path ---------------------------------------------------

    /// Parses every whole frame out of one datagram. Datagrams are never
    /// split across reads, so a truncated frame is simply dropped the
    /// way a lost datagram would be.
    fn parse_datagram(
        &mut self,
        len: usize,
    ) -> Result<Vec<(FrameInfo, Box<dyn Message>)>, ReadError> {
        let mut out = Vec::new();
        let mut offset = 0;

        while offset < len {
            let mut header = MessageHeader::new();
            match self
                .core
                .serializer
                .try_read_header(&mut header, &self.recv_buffer[offset..len])
            {
                Err(FrameError::MissingBytes) => {
                    debug!("dropping truncated datagram frame");
                    break;
                }
                Err(err) => return Err(err.into()),
                Ok(()) => {
                    if len - offset < header.length {
                        debug!("dropping truncated datagram frame");
                        break;
                    }
                    let info = FrameInfo::of(&header);
                    let length = header.length;
                    let frame = &self.recv_buffer[offset..offset + length];
                    let message = self.core.serializer.deserialize(header, frame)?;
                    out.push((info, message));
                    offset += length;
                }
            }
        }
        Ok(out)
    }

    // ---- teardown -------------------------------------------------------

    async fn teardown(
        &mut self,
        reason: ConnectionResult,
        message: Option<String>,
        notify_peer: bool,
    ) {
        self.core.shared.set_state(ConnectionState::Disconnecting);

        if notify_peer {
            // Best effort: one datagram, no retransmission, we're leaving.
            let disconnect = DisconnectMessage {
                reason,
                custom_reason: message.clone(),
            };
            let id = self.core.serializer.next_message_id();
            if let Ok(frame) = self.core.serializer.serialize(&disconnect, id, None) {
                drop(send_datagram(&self.sink, &frame).await);
            }
        }

        for (_, entry) in self.pending.drain() {
            self.context.pool().release(entry.frame);
        }
        self.core.tracker.clear();
        self.queue.clear();
        self.core.emit(Event::Disconnected { reason, message });
        self.core.shared.set_state(ConnectionState::Disconnected);
        self.context.pool().connection_closed();
    }
}

