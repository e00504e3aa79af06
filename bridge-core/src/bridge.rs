// Context event loop
//
// One `Bridge` per execution context. A single task owns the registry, router,
// correlator, keepalive monitor and page adapter; everything else talks to it
// through the cloneable `BridgeHandle` or the inbound queue fed by per-port
// reader tasks. Handlers receive `Delivery` values on an mpsc channel.

use crate::config::BridgeConfig;
use crate::correlator::{disconnected_payload, error_payload, overflow_payload, Correlator, Responder};
use crate::envelope::{decode, Envelope};
use crate::error::{ConnectError, RegistryError, RequestError, RouteError};
use crate::inpage::{IngestError, InpageAdapter};
use crate::keepalive::{Adoption, KeepaliveMonitor};
use crate::protocol::{ChannelName, ContextRole, Link, MessageKind, PortName};
use crate::registry::{LifecycleEvent, LifecycleObserver, PortRegistry};
use crate::router::{Dispatch, Hop, Links, ReplyPath, Router, Sent};
use crate::stats::BridgeStats;
use crate::transport::{FrameSource, PageWindow, Transport, WindowMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A request or event addressed to this context's handler.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    reply: Option<ReplyPath>,
}

impl Delivery {
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply_path(&self) -> Option<ReplyPath> {
        self.reply
    }

    pub fn channel(&self) -> ChannelName {
        self.envelope.channel
    }

    pub fn origin(&self) -> &str {
        &self.envelope.origin
    }

    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }
}

enum Command {
    Send {
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
        timeout: Duration,
        responder: Responder,
    },
    Emit {
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
        done: oneshot::Sender<Result<(), RequestError>>,
    },
    Respond {
        id: String,
        channel: ChannelName,
        reply: ReplyPath,
        payload: Value,
    },
    Connect {
        port: PortName,
        peer_origin: String,
        transport: Transport,
        done: oneshot::Sender<Result<Adoption, ConnectError>>,
    },
    Disconnect {
        port: PortName,
        done: oneshot::Sender<Result<(), RegistryError>>,
    },
    Stats(oneshot::Sender<BridgeStats>),
    Shutdown,
}

enum Inbound {
    Frame {
        port: PortName,
        generation: u64,
        bytes: Vec<u8>,
    },
    Disconnected {
        port: PortName,
        generation: u64,
    },
    Window(WindowMessage),
}

pub struct Bridge {
    role: ContextRole,
    origin: String,
    config: BridgeConfig,
    registry: PortRegistry,
    lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
    router: Router,
    correlator: Correlator,
    keepalive: KeepaliveMonitor,
    page: Option<InpageAdapter>,
    stats: BridgeStats,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    readers: HashMap<PortName, (u64, JoinHandle<()>)>,
    window_rx: Option<broadcast::Receiver<WindowMessage>>,
    window_task: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Build the context. `window` is only used by roles that sit on the page
    /// boundary (content script and inpage); the subscription is taken here so
    /// nothing posted before `run` starts is missed.
    pub fn new(
        role: ContextRole,
        origin: impl Into<String>,
        config: BridgeConfig,
        window: Option<PageWindow>,
    ) -> (Bridge, BridgeHandle, mpsc::UnboundedReceiver<Delivery>) {
        let origin = origin.into();
        let mut registry = PortRegistry::new();
        let lifecycle = registry.subscribe();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();

        let page = match (role.page_side(), window) {
            (Some(side), Some(window)) => Some(InpageAdapter::new(side, window)),
            (None, Some(_)) => {
                tracing::warn!(%role, "role has no page side, ignoring window");
                None
            }
            _ => None,
        };
        let window_rx = page.as_ref().map(|p| p.window().subscribe());

        let handle = BridgeHandle {
            role,
            commands: command_tx,
            default_timeout: config.correlator.default_timeout(),
        };

        let bridge = Bridge {
            role,
            router: Router::new(role, origin.clone(), config.router.queue_capacity),
            correlator: Correlator::new(role.as_str()),
            keepalive: KeepaliveMonitor::new(config.keepalive.clone(), origin.clone()),
            origin,
            config,
            registry,
            lifecycle,
            page,
            stats: BridgeStats::default(),
            commands,
            inbound_tx,
            inbound_rx,
            deliveries,
            readers: HashMap::new(),
            window_rx,
            window_task: None,
        };
        (bridge, handle, delivery_rx)
    }

    /// Build the context and run it on its own task.
    pub fn spawn(
        role: ContextRole,
        origin: impl Into<String>,
        config: BridgeConfig,
        window: Option<PageWindow>,
    ) -> (BridgeHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (bridge, handle, deliveries) = Bridge::new(role, origin, config, window);
        tokio::spawn(bridge.run());
        (handle, deliveries)
    }

    pub async fn run(mut self) {
        tracing::info!(role = %self.role, origin = %self.origin, "🚀 bridge context started");

        if let Some(rx) = self.window_rx.take() {
            self.window_task = Some(tokio::spawn(read_window(rx, self.inbound_tx.clone())));
        }

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => {
                    if let Command::Shutdown = command {
                        break;
                    }
                    self.on_command(command);
                }
                Some(inbound) = self.inbound_rx.recv() => self.on_inbound(inbound),
                _ = sleep_until(wakeup) => self.on_tick(Instant::now()),
            }
            self.dispatch_lifecycle();
        }

        self.close();
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match (self.correlator.next_deadline(), self.keepalive.next_wakeup()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                channel,
                payload,
                target,
                timeout,
                responder,
            } => self.send_request(channel, payload, target, timeout, responder),
            Command::Emit {
                channel,
                payload,
                target,
                done,
            } => {
                let id = self.correlator.next_id();
                let result = self.emit(id.clone(), channel, payload, target);
                if let Err(reason) = &result {
                    self.stats.record(reason);
                }
                let _ = done.send(result.map_err(|reason| RequestError::Dropped { id, reason }));
            }
            Command::Respond {
                id,
                channel,
                reply,
                payload,
            } => self.respond(id, channel, reply, payload),
            Command::Connect {
                port,
                peer_origin,
                transport,
                done,
            } => {
                let _ = done.send(self.connect(port, &peer_origin, transport));
            }
            Command::Disconnect { port, done } => {
                let _ = done.send(self.registry.mark_closed(port));
            }
            Command::Stats(reply) => {
                let mut snapshot = self.stats.clone();
                snapshot.pending_requests = self.correlator.pending_count();
                snapshot.open_ports = self.registry.open_ports().len();
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    fn send_request(
        &mut self,
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
        timeout: Duration,
        responder: Responder,
    ) {
        let id = self.correlator.next_id();
        let hop = match self.router.outbound_hop(channel, MessageKind::Request, target) {
            Ok(Hop::Broadcast) => Err(RouteError::NoRoute {
                channel,
                from: self.role.to_string(),
            }),
            other => other,
        };
        let hop = match hop {
            Ok(hop) => hop,
            Err(reason) => {
                self.stats.record(&reason);
                let _ = responder.send(Err(RequestError::Dropped { id, reason }));
                return;
            }
        };

        let envelope = Envelope::request(id.clone(), channel, self.origin.clone(), payload);
        match hop {
            Hop::Link(link) => {
                let port = match link {
                    Link::Port(name) => Some((name, self.registry.generation_of(name).unwrap_or(0))),
                    Link::Page => None,
                };
                self.correlator.track(id.clone(), channel, port, timeout, responder);
                if let Err(reason) = self.forward(link, envelope) {
                    self.stats.record(&reason);
                    self.correlator.reject_dropped(&id, reason);
                }
            }
            _ => {
                // IPC loopback
                self.correlator.track(id, channel, None, timeout, responder);
                self.deliver(Delivery {
                    envelope,
                    reply: Some(ReplyPath::Local),
                });
            }
        }
    }

    fn emit(
        &mut self,
        id: String,
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
    ) -> Result<(), RouteError> {
        let envelope = Envelope::event(id, channel, self.origin.clone(), payload);
        match self.router.outbound_hop(channel, MessageKind::Event, target)? {
            Hop::Local => {
                self.deliver(Delivery {
                    envelope,
                    reply: None,
                });
                Ok(())
            }
            Hop::Link(link) => self.forward(link, envelope),
            Hop::Broadcast => {
                let mut links = Links {
                    registry: &mut self.registry,
                    page: self.page.as_ref(),
                };
                let results = self.router.broadcast(&mut links, &envelope);
                if results.is_empty() {
                    tracing::debug!(id = %envelope.id, "broadcast with no open ports");
                }
                for (_, sent) in results {
                    self.on_sent(sent);
                }
                Ok(())
            }
        }
    }

    fn respond(&mut self, id: String, channel: ChannelName, reply: ReplyPath, payload: Value) {
        let envelope = Envelope::new(id, channel, MessageKind::Response, self.origin.clone(), payload);
        match reply {
            ReplyPath::Local => {
                if !self.correlator.resolve(envelope) {
                    self.stats.unmatched_responses += 1;
                }
            }
            ReplyPath::Link(link) => {
                if let Err(reason) = self.forward(link, envelope) {
                    self.stats.record(&reason);
                }
            }
        }
    }

    fn connect(
        &mut self,
        port: PortName,
        peer_origin: &str,
        transport: Transport,
    ) -> Result<Adoption, ConnectError> {
        let Transport { sink, source } = transport;
        let adoption = self
            .keepalive
            .adopt(&mut self.registry, port, peer_origin, sink)?;

        if let Adoption::Reconnected { .. } = adoption {
            self.stats.reconnects += 1;
        }
        let generation = adoption.generation();
        let reader = tokio::spawn(read_port(port, generation, source, self.inbound_tx.clone()));
        if let Some((_, stale)) = self.readers.insert(port, (generation, reader)) {
            stale.abort();
        }
        tracing::info!(%port, generation, peer = %peer_origin, "✅ port connected");
        Ok(adoption)
    }

    fn forward(&mut self, link: Link, envelope: Envelope) -> Result<(), RouteError> {
        let mut links = Links {
            registry: &mut self.registry,
            page: self.page.as_ref(),
        };
        let sent = self.router.forward(&mut links, link, envelope)?;
        self.on_sent(sent);
        Ok(())
    }

    fn on_sent(&mut self, sent: Sent) {
        if let Sent::Overflowed { port, dropped } = sent {
            let reason = RouteError::QueueOverflow {
                port,
                dropped_id: dropped.id.clone(),
            };
            self.stats.record(&reason);
            if dropped.kind != MessageKind::Request || self.correlator.reject_dropped(&dropped.id, reason) {
                return;
            }
            // Not ours: a request relayed for another context
            if let Some(back) = self.router.take_relay(&dropped.id) {
                self.fail_relayed(dropped.id, dropped.channel, back, overflow_payload(port));
            }
        }
    }

    /// Answer the sender of a relayed request that will never get through.
    fn fail_relayed(&mut self, id: String, channel: ChannelName, back: Link, payload: Value) {
        tracing::warn!(%id, to = %back, "failing relayed request");
        let envelope = Envelope::new(id, channel, MessageKind::Response, self.origin.clone(), payload);
        if let Err(reason) = self.forward(back, envelope) {
            self.stats.record(&reason);
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        if let Err(mpsc::error::SendError(delivery)) = self.deliveries.send(delivery) {
            tracing::warn!(id = %delivery.envelope.id, "no handler listening, dropping delivery");
            if let Some(reply) = delivery.reply {
                let Envelope { id, channel, .. } = delivery.envelope;
                self.respond(id, channel, reply, error_payload("no handler in this context"));
            }
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame {
                port,
                generation,
                bytes,
            } => {
                if self.registry.generation_of(port) != Some(generation) || !self.registry.is_open(port) {
                    tracing::trace!(%port, generation, "dropping frame from stale port");
                    return;
                }
                match decode(&bytes) {
                    Ok(envelope) => self.route(Link::Port(port), envelope),
                    Err(error) => {
                        self.stats.decode_errors += 1;
                        tracing::warn!(%port, %error, "undecodable frame");
                    }
                }
            }
            Inbound::Disconnected { port, generation } => {
                if self.registry.generation_of(port) == Some(generation) {
                    tracing::info!(%port, generation, "❌ port disconnected");
                    if let Err(error) = self.registry.mark_closed(port) {
                        tracing::error!(%port, %error, "failed to close port");
                    }
                }
            }
            Inbound::Window(message) => {
                let Some(page) = self.page.as_ref() else {
                    return;
                };
                match page.ingest(message) {
                    Ok(Some(envelope)) => self.route(Link::Page, envelope),
                    Ok(None) => self.stats.reflections_ignored += 1,
                    Err(IngestError::Decode(error)) => {
                        self.stats.decode_errors += 1;
                        tracing::debug!(%error, "ignoring window message");
                    }
                    Err(IngestError::Route(reason)) => self.stats.record(&reason),
                }
            }
        }
    }

    fn route(&mut self, link: Link, envelope: Envelope) {
        let mut links = Links {
            registry: &mut self.registry,
            page: self.page.as_ref(),
        };
        let dispatch = self.router.inbound(&mut links, link, envelope);

        match dispatch {
            Ok(Dispatch::Local { envelope, reply }) => {
                self.deliver(Delivery { envelope, reply })
            }
            Ok(Dispatch::Response(envelope)) => {
                if !self.correlator.resolve(envelope) {
                    self.stats.unmatched_responses += 1;
                }
            }
            Ok(Dispatch::Pong { port, envelope }) => {
                self.keepalive
                    .on_pong(&mut self.registry, port, &envelope, Instant::now())
            }
            Ok(Dispatch::Relayed(sent)) => self.on_sent(sent),
            Ok(Dispatch::Handled) => self.stats.pings_answered += 1,
            Err(reason) => self.stats.record(&reason),
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let timed_out = self.correlator.expire(now);
        self.stats.timeouts += timed_out as u64;
        self.keepalive.tick(&mut self.registry, now);
        self.router.prune_relays(now, self.config.router.relay_ttl());
    }

    /// Fan registry events out to every observer.
    fn dispatch_lifecycle(&mut self) {
        while let Ok(event) = self.lifecycle.try_recv() {
            if let LifecycleEvent::Closed { name, generation } = event {
                self.stats.ports_closed += 1;
                if self
                    .readers
                    .get(&name)
                    .is_some_and(|(reader_gen, _)| *reader_gen == generation)
                {
                    if let Some((_, reader)) = self.readers.remove(&name) {
                        reader.abort();
                    }
                }
            }
            self.keepalive.on_lifecycle(&event, &mut self.registry);
            self.router.on_lifecycle(&event, &mut self.registry);
            self.correlator.on_lifecycle(&event, &mut self.registry);

            for abandoned in self.router.take_abandoned() {
                self.fail_relayed(
                    abandoned.id,
                    abandoned.channel,
                    abandoned.back,
                    disconnected_payload(abandoned.port),
                );
            }
        }
    }

    fn close(&mut self) {
        let pending = self.correlator.pending_count();
        self.correlator.close_all();
        for (_, (_, reader)) in self.readers.drain() {
            reader.abort();
        }
        if let Some(task) = self.window_task.take() {
            task.abort();
        }
        tracing::info!(role = %self.role, pending, "bridge context stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}

async fn read_port(
    port: PortName,
    generation: u64,
    mut source: Box<dyn FrameSource>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(bytes) = source.next_frame().await {
        if inbound
            .send(Inbound::Frame {
                port,
                generation,
                bytes,
            })
            .is_err()
        {
            return;
        }
    }
    let _ = inbound.send(Inbound::Disconnected { port, generation });
}

async fn read_window(
    mut window: broadcast::Receiver<WindowMessage>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match window.recv().await {
            Ok(message) => {
                if inbound.send(Inbound::Window(message)).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "page window reader lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Cloneable front door to a running context.
#[derive(Clone)]
pub struct BridgeHandle {
    role: ContextRole,
    commands: mpsc::UnboundedSender<Command>,
    default_timeout: Duration,
}

impl BridgeHandle {
    pub fn role(&self) -> ContextRole {
        self.role
    }

    /// Request with the configured default timeout, routed by the static table.
    pub async fn request(&self, channel: ChannelName, payload: Value) -> Result<Value, RequestError> {
        self.send(channel, payload, None, self.default_timeout).await
    }

    /// Request addressed to one port (background only).
    pub async fn request_to(
        &self,
        port: PortName,
        channel: ChannelName,
        payload: Value,
    ) -> Result<Value, RequestError> {
        self.send(channel, payload, Some(port), self.default_timeout)
            .await
    }

    pub async fn send(
        &self,
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                channel,
                payload,
                target,
                timeout,
                responder,
            })
            .map_err(|_| RequestError::BridgeClosed)?;
        rx.await.unwrap_or(Err(RequestError::BridgeClosed))
    }

    /// Fire-and-forget event. Background events without a target go to every
    /// Open port.
    pub async fn emit(&self, channel: ChannelName, payload: Value) -> Result<(), RequestError> {
        self.emit_inner(channel, payload, None).await
    }

    pub async fn emit_to(
        &self,
        port: PortName,
        channel: ChannelName,
        payload: Value,
    ) -> Result<(), RequestError> {
        self.emit_inner(channel, payload, Some(port)).await
    }

    async fn emit_inner(
        &self,
        channel: ChannelName,
        payload: Value,
        target: Option<PortName>,
    ) -> Result<(), RequestError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Emit {
                channel,
                payload,
                target,
                done,
            })
            .map_err(|_| RequestError::BridgeClosed)?;
        rx.await.unwrap_or(Err(RequestError::BridgeClosed))
    }

    /// Answer a delivered request. Events have nobody to answer and are ignored.
    pub fn respond(&self, delivery: &Delivery, payload: Value) -> Result<(), RequestError> {
        let Some(reply) = delivery.reply else {
            tracing::trace!(id = %delivery.envelope.id, "not a request, nothing to respond to");
            return Ok(());
        };
        self.commands
            .send(Command::Respond {
                id: delivery.envelope.id.clone(),
                channel: delivery.envelope.channel,
                reply,
                payload,
            })
            .map_err(|_| RequestError::BridgeClosed)
    }

    pub fn respond_error(&self, delivery: &Delivery, message: &str) -> Result<(), RequestError> {
        self.respond(delivery, error_payload(message))
    }

    /// Attach a transport to `port`, for the first time or after it closed.
    pub async fn connect(
        &self,
        port: PortName,
        peer_origin: impl Into<String>,
        transport: Transport,
    ) -> Result<Adoption, ConnectError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                port,
                peer_origin: peer_origin.into(),
                transport,
                done,
            })
            .map_err(|_| ConnectError::BridgeClosed)?;
        rx.await.unwrap_or(Err(ConnectError::BridgeClosed))
    }

    /// Close `port` from this side, as if the context had called `disconnect()`.
    pub async fn disconnect(&self, port: PortName) -> Result<(), ConnectError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { port, done })
            .map_err(|_| ConnectError::BridgeClosed)?;
        rx.await
            .map_err(|_| ConnectError::BridgeClosed)?
            .map_err(ConnectError::from)
    }

    pub async fn stats(&self) -> Result<BridgeStats, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| RequestError::BridgeClosed)?;
        rx.await.map_err(|_| RequestError::BridgeClosed)
    }

    /// Stop the loop; every pending request fails with `BridgeClosed`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
