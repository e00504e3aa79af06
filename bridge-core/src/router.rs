// Message router - validation, dispatch and forwarding
//
// Inbound envelopes pass a direction check (page link only) and an origin
// check against the link they physically arrived on before anything looks at
// their kind. Outbound envelopes for a port that is not Open wait in a small
// FIFO queue until the port comes back.

use crate::envelope::Envelope;
use crate::error::RouteError;
use crate::inpage::InpageAdapter;
use crate::protocol::{ChannelName, ContextRole, Link, MessageKind, PortName};
use crate::registry::{LifecycleEvent, LifecycleObserver, PortRegistry};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Where the answer to a delivered request goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPath {
    Link(Link),
    /// Request originated in this context (IPC loopback)
    Local,
}

/// Next hop for a locally originated envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hop {
    Local,
    Link(Link),
    Broadcast,
}

/// Result of handing an envelope to a link.
#[derive(Debug, PartialEq)]
pub enum Sent {
    Posted,
    Queued,
    /// Queued, but the queue was full and this older envelope was evicted
    Overflowed { port: PortName, dropped: Envelope },
}

/// What the context should do with an inbound envelope.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Local {
        envelope: Envelope,
        reply: Option<ReplyPath>,
    },
    Response(Envelope),
    Pong {
        port: PortName,
        envelope: Envelope,
    },
    Relayed(Sent),
    /// Answered in place (ping)
    Handled,
}

/// Physical links a router may touch.
pub struct Links<'a> {
    pub registry: &'a mut PortRegistry,
    pub page: Option<&'a InpageAdapter>,
}

#[derive(Debug)]
struct Relay {
    channel: ChannelName,
    back: Link,
    via: Link,
    at: Instant,
}

/// A relayed request whose onward port closed before it was answered. The
/// context owes the sender a failure on `back`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub id: String,
    pub channel: ChannelName,
    pub back: Link,
    pub port: PortName,
}

pub struct Router {
    role: ContextRole,
    origin: String,
    capacity: usize,
    queues: HashMap<PortName, VecDeque<Envelope>>,
    relayed: HashMap<String, Relay>,
    abandoned: Vec<Abandoned>,
}

impl Router {
    pub fn new(role: ContextRole, origin: impl Into<String>, capacity: usize) -> Self {
        Self {
            role,
            origin: origin.into(),
            capacity,
            queues: HashMap::new(),
            relayed: HashMap::new(),
            abandoned: Vec::new(),
        }
    }

    pub fn queued(&self, port: PortName) -> usize {
        self.queues.get(&port).map_or(0, VecDeque::len)
    }

    pub fn relayed_count(&self) -> usize {
        self.relayed.len()
    }

    /// Static routing table for traffic arriving from another context.
    fn inbound_hop(&self, channel: ChannelName, from: Link) -> Option<Hop> {
        use ContextRole::*;

        if channel != ChannelName::Extension {
            // IPC never crosses a link; ping traffic is handled by kind
            return None;
        }
        match (self.role, from) {
            (Background, Link::Port(_)) => Some(Hop::Local),
            (ContentScript, Link::Page) => Some(Hop::Link(Link::Port(PortName::ContentScriptToBackground))),
            (ContentScript, Link::Port(PortName::ContentScriptToBackground)) => Some(Hop::Link(Link::Page)),
            (Offscreen | Ui, Link::Port(port)) if self.role.uplink() == Some(port) => Some(Hop::Local),
            (Inpage, Link::Page) => Some(Hop::Local),
            _ => None,
        }
    }

    /// Static routing table for traffic created in this context.
    pub fn outbound_hop(
        &self,
        channel: ChannelName,
        kind: MessageKind,
        target: Option<PortName>,
    ) -> Result<Hop, RouteError> {
        let no_route = || RouteError::NoRoute {
            channel,
            from: self.role.to_string(),
        };

        match channel {
            ChannelName::Ipc => Ok(Hop::Local),
            ChannelName::ExtensionPing => Err(no_route()),
            ChannelName::Extension => match self.role {
                ContextRole::Background => match (target, kind) {
                    (Some(port), _) => Ok(Hop::Link(Link::Port(port))),
                    (None, MessageKind::Event) => Ok(Hop::Broadcast),
                    (None, _) => Err(no_route()),
                },
                ContextRole::Inpage => Ok(Hop::Link(Link::Page)),
                role => role
                    .uplink()
                    .map(|port| Hop::Link(Link::Port(port)))
                    .ok_or_else(no_route),
            },
        }
    }

    /// Validate and dispatch an envelope that arrived on `link`.
    pub fn inbound(
        &mut self,
        links: &mut Links<'_>,
        link: Link,
        envelope: Envelope,
    ) -> Result<Dispatch, RouteError> {
        let no_route = |envelope: &Envelope| RouteError::NoRoute {
            channel: envelope.channel,
            from: link.to_string(),
        };

        let bound_origin = match link {
            Link::Page => {
                let page = links.page.ok_or_else(|| no_route(&envelope))?;
                let expected = page.side().inbound_direction();
                if envelope.direction != Some(expected) {
                    return Err(RouteError::DirectionViolation {
                        link,
                        expected,
                        actual: envelope.direction,
                    });
                }
                page.page_origin().to_string()
            }
            Link::Port(port) => links
                .registry
                .get(port)
                .map_err(|_| no_route(&envelope))?
                .origin()
                .to_string(),
        };

        if envelope.origin != bound_origin {
            return Err(RouteError::OriginMismatch {
                link,
                bound: bound_origin,
                claimed: envelope.origin,
            });
        }

        match (envelope.kind, link) {
            (MessageKind::Ping, Link::Port(port)) => {
                let pong = envelope.pong(self.origin.clone());
                if let Err(e) = links.registry.post(port, pong.encode()) {
                    tracing::debug!(%port, error = %e, "could not answer ping");
                }
                Ok(Dispatch::Handled)
            }
            (MessageKind::Pong, Link::Port(port)) => Ok(Dispatch::Pong { port, envelope }),
            (MessageKind::Ping | MessageKind::Pong, Link::Page) => Err(no_route(&envelope)),
            (MessageKind::Response, _) => match self.relayed.remove(&envelope.id) {
                Some(relay) => Ok(Dispatch::Relayed(self.forward(links, relay.back, envelope)?)),
                None => Ok(Dispatch::Response(envelope)),
            },
            (kind @ (MessageKind::Request | MessageKind::Event), _) => {
                match self.inbound_hop(envelope.channel, link) {
                    Some(Hop::Local) => Ok(Dispatch::Local {
                        reply: (kind == MessageKind::Request).then_some(ReplyPath::Link(link)),
                        envelope,
                    }),
                    Some(Hop::Link(to)) => {
                        if kind == MessageKind::Request {
                            self.relayed.insert(
                                envelope.id.clone(),
                                Relay {
                                    channel: envelope.channel,
                                    back: link,
                                    via: to,
                                    at: Instant::now(),
                                },
                            );
                        }
                        Ok(Dispatch::Relayed(self.forward(links, to, envelope)?))
                    }
                    Some(Hop::Broadcast) | None => Err(no_route(&envelope)),
                }
            }
        }
    }

    /// Hand an envelope to a link, queueing it if the port is not Open.
    pub fn forward(
        &mut self,
        links: &mut Links<'_>,
        link: Link,
        mut envelope: Envelope,
    ) -> Result<Sent, RouteError> {
        match link {
            Link::Page => {
                let page = links.page.ok_or_else(|| RouteError::NoRoute {
                    channel: envelope.channel,
                    from: self.role.to_string(),
                })?;
                page.deliver(envelope)?;
                Ok(Sent::Posted)
            }
            Link::Port(port) => {
                // Direction tags belong to the page boundary only
                envelope.direction = None;

                if links.registry.is_open(port) {
                    self.flush(links.registry, port);
                    if self.queued(port) == 0 {
                        match links.registry.post(port, envelope.encode()) {
                            Ok(()) => return Ok(Sent::Posted),
                            Err(e) => tracing::debug!(%port, error = %e, "post failed, queueing"),
                        }
                    }
                }
                Ok(self.enqueue(port, envelope))
            }
        }
    }

    /// Send an event on every Open port.
    pub fn broadcast(&mut self, links: &mut Links<'_>, envelope: &Envelope) -> Vec<(PortName, Sent)> {
        let ports = links.registry.open_ports();
        let mut results = Vec::with_capacity(ports.len());
        for port in ports {
            match self.forward(links, Link::Port(port), envelope.clone()) {
                Ok(sent) => results.push((port, sent)),
                Err(e) => tracing::warn!(%port, error = %e, "broadcast leg failed"),
            }
        }
        results
    }

    fn enqueue(&mut self, port: PortName, envelope: Envelope) -> Sent {
        let queue = self.queues.entry(port).or_default();
        queue.push_back(envelope);
        if queue.len() > self.capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(%port, id = %dropped.id, "queue overflow, dropping oldest envelope");
                return Sent::Overflowed { port, dropped };
            }
        }
        tracing::debug!(%port, depth = queue.len(), "port not open, envelope queued");
        Sent::Queued
    }

    /// Drain the queue for `port` in order while it stays Open.
    pub fn flush(&mut self, registry: &mut PortRegistry, port: PortName) -> usize {
        let Some(queue) = self.queues.get_mut(&port) else {
            return 0;
        };
        let mut flushed = 0;
        while registry.is_open(port) {
            let Some(envelope) = queue.pop_front() else {
                break;
            };
            if registry.post(port, envelope.encode()).is_err() {
                queue.push_front(envelope);
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            tracing::info!(%port, flushed, "flushed queued envelopes");
        }
        flushed
    }

    /// Remove the return path for a relayed request, e.g. one evicted from a
    /// full queue, and say where its answer would have gone.
    pub fn take_relay(&mut self, id: &str) -> Option<Link> {
        self.relayed.remove(id).map(|relay| relay.back)
    }

    /// Relayed requests stranded by a port closing since the last call.
    pub fn take_abandoned(&mut self) -> Vec<Abandoned> {
        std::mem::take(&mut self.abandoned)
    }

    /// Forget relayed requests older than `max_age`; their senders time out.
    pub fn prune_relays(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.relayed.len();
        self.relayed.retain(|_, relay| now.duration_since(relay.at) < max_age);
        before - self.relayed.len()
    }
}

impl LifecycleObserver for Router {
    fn on_lifecycle(&mut self, event: &LifecycleEvent, registry: &mut PortRegistry) {
        match *event {
            LifecycleEvent::Opened { name, generation } => {
                if registry.generation_of(name) == Some(generation) {
                    self.flush(registry, name);
                }
            }
            LifecycleEvent::Closed { name, .. } => {
                let link = Link::Port(name);
                let abandoned = &mut self.abandoned;
                self.relayed.retain(|id, relay| {
                    if relay.via == link && relay.back != link {
                        abandoned.push(Abandoned {
                            id: id.clone(),
                            channel: relay.channel,
                            back: relay.back,
                            port: name,
                        });
                    }
                    relay.back != link && relay.via != link
                });
            }
            LifecycleEvent::Registered { .. } => {}
        }
    }
}
