// Port registry - single source of truth for which ports exist
//
// Ports are never mutated back to life: a reconnect replaces the Closed port
// with a fresh one carrying a higher generation. Every state change is pushed
// to subscribers so the router, correlator and keepalive monitor react without
// polling.

use crate::error::{RegistryError, TransportError};
use crate::protocol::PortName;
use crate::transport::FrameSink;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Connecting,
    Open,
    Closed,
}

/// One physical transport endpoint. Only the registry holds these.
pub struct Port {
    name: PortName,
    state: PortState,
    /// Origin of the context on the other end
    origin: String,
    generation: u64,
    last_pong_at: Option<Instant>,
    sink: Option<Box<dyn FrameSink>>,
}

impl Port {
    pub fn name(&self) -> PortName {
        self.name
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    /// Connecting or Open.
    pub fn is_live(&self) -> bool {
        self.state != PortState::Closed
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("origin", &self.origin)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered { name: PortName, generation: u64 },
    Opened { name: PortName, generation: u64 },
    Closed { name: PortName, generation: u64 },
}

impl LifecycleEvent {
    pub fn port(&self) -> PortName {
        match self {
            LifecycleEvent::Registered { name, .. }
            | LifecycleEvent::Opened { name, .. }
            | LifecycleEvent::Closed { name, .. } => *name,
        }
    }
}

/// Implemented by every component that reacts to port lifecycle changes.
pub trait LifecycleObserver {
    fn on_lifecycle(&mut self, event: &LifecycleEvent, registry: &mut PortRegistry);
}

#[derive(Default)]
pub struct PortRegistry {
    ports: HashMap<PortName, Port>,
    observers: Vec<mpsc::UnboundedSender<LifecycleEvent>>,
    next_generation: u64,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every lifecycle event from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    fn emit(&mut self, event: LifecycleEvent) {
        tracing::debug!(?event, "port lifecycle");
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn insert(&mut self, name: PortName, origin: String, sink: Box<dyn FrameSink>) -> &Port {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.ports.insert(
            name,
            Port {
                name,
                state: PortState::Connecting,
                origin,
                generation,
                last_pong_at: None,
                sink: Some(sink),
            },
        );
        self.emit(LifecycleEvent::Registered { name, generation });
        &self.ports[&name]
    }

    /// Create a port in the Connecting state.
    pub fn register(
        &mut self,
        name: PortName,
        origin: impl Into<String>,
        sink: Box<dyn FrameSink>,
    ) -> Result<&Port, RegistryError> {
        if self.ports.get(&name).is_some_and(|p| p.is_live()) {
            return Err(RegistryError::DuplicatePort(name));
        }
        Ok(self.insert(name, origin.into(), sink))
    }

    /// Swap a Closed port for a new Connecting one with the same name.
    pub fn replace(
        &mut self,
        name: PortName,
        origin: impl Into<String>,
        sink: Box<dyn FrameSink>,
    ) -> Result<&Port, RegistryError> {
        let live = self.get(name)?.is_live();
        if live {
            return Err(RegistryError::DuplicatePort(name));
        }
        Ok(self.insert(name, origin.into(), sink))
    }

    pub fn get(&self, name: PortName) -> Result<&Port, RegistryError> {
        self.ports.get(&name).ok_or(RegistryError::NotFound(name))
    }

    pub fn generation_of(&self, name: PortName) -> Option<u64> {
        self.ports.get(&name).map(Port::generation)
    }

    pub fn is_open(&self, name: PortName) -> bool {
        self.ports
            .get(&name)
            .is_some_and(|p| p.state == PortState::Open)
    }

    pub fn open_ports(&self) -> Vec<PortName> {
        let mut names: Vec<PortName> = self
            .ports
            .values()
            .filter(|p| p.state == PortState::Open)
            .map(Port::name)
            .collect();
        names.sort();
        names
    }

    pub fn mark_open(&mut self, name: PortName) -> Result<(), RegistryError> {
        let port = self
            .ports
            .get_mut(&name)
            .ok_or(RegistryError::NotFound(name))?;
        match port.state {
            PortState::Open => Ok(()),
            PortState::Closed => Err(RegistryError::NotOpen(name)),
            PortState::Connecting => {
                port.state = PortState::Open;
                let generation = port.generation;
                self.emit(LifecycleEvent::Opened { name, generation });
                Ok(())
            }
        }
    }

    /// Transition to Closed and drop the outbound half so the peer notices.
    /// Closing an already Closed port is a no-op.
    pub fn mark_closed(&mut self, name: PortName) -> Result<(), RegistryError> {
        let port = self
            .ports
            .get_mut(&name)
            .ok_or(RegistryError::NotFound(name))?;
        if port.state == PortState::Closed {
            return Ok(());
        }
        port.state = PortState::Closed;
        port.sink = None;
        let generation = port.generation;
        tracing::info!(port = %name, generation, "port closed");
        self.emit(LifecycleEvent::Closed { name, generation });
        Ok(())
    }

    pub fn record_pong(&mut self, name: PortName, at: Instant) {
        if let Some(port) = self.ports.get_mut(&name) {
            port.last_pong_at = Some(at);
        }
    }

    /// Send a frame on an Open port. A sink failure closes the port.
    pub fn post(&mut self, name: PortName, frame: Vec<u8>) -> Result<(), RegistryError> {
        let port = self
            .ports
            .get_mut(&name)
            .ok_or(RegistryError::NotFound(name))?;
        if port.state != PortState::Open {
            return Err(RegistryError::NotOpen(name));
        }
        let result = match port.sink.as_mut() {
            Some(sink) => sink.post(frame),
            None => Err(TransportError::Closed),
        };
        if result.is_err() {
            tracing::warn!(port = %name, "transport refused frame, closing port");
            self.mark_closed(name)?;
            return Err(RegistryError::NotOpen(name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    const CS: PortName = PortName::ContentScriptToBackground;

    fn sink() -> (Box<dyn FrameSink>, Transport) {
        let (ours, theirs) = Transport::pair();
        (ours.sink, theirs)
    }

    #[test]
    fn test_register_rejects_live_duplicate() {
        let mut registry = PortRegistry::new();
        let (s1, _p1) = sink();
        let (s2, _p2) = sink();

        registry.register(CS, "https://a.example", s1).unwrap();
        assert_eq!(
            registry.register(CS, "https://a.example", s2).unwrap_err(),
            RegistryError::DuplicatePort(CS)
        );
    }

    #[test]
    fn test_get_unknown_port_is_not_found() {
        let registry = PortRegistry::new();
        assert_eq!(
            registry.get(PortName::UiToBackground).unwrap_err(),
            RegistryError::NotFound(PortName::UiToBackground)
        );
    }

    #[test]
    fn test_replace_requires_closed_port_and_bumps_generation() {
        let mut registry = PortRegistry::new();
        let (s1, _p1) = sink();
        let (s2, _p2) = sink();
        let (s3, _p3) = sink();

        let first = registry.register(CS, "https://a.example", s1).unwrap().generation();
        registry.mark_open(CS).unwrap();
        assert_eq!(
            registry.replace(CS, "https://a.example", s2).unwrap_err(),
            RegistryError::DuplicatePort(CS)
        );

        registry.mark_closed(CS).unwrap();
        let port = registry.replace(CS, "https://a.example", s3).unwrap();
        assert!(port.generation() > first);
        assert_eq!(port.state(), PortState::Connecting);
    }

    #[test]
    fn test_lifecycle_events_reach_subscribers_in_order() {
        let mut registry = PortRegistry::new();
        let mut events = registry.subscribe();
        let (s1, _p1) = sink();

        registry.register(CS, "https://a.example", s1).unwrap();
        registry.mark_open(CS).unwrap();
        registry.mark_closed(CS).unwrap();
        registry.mark_closed(CS).unwrap();

        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Registered { .. })));
        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Opened { .. })));
        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Closed { .. })));
        assert!(events.try_recv().is_err(), "second close must not emit");
    }

    #[tokio::test]
    async fn test_post_requires_open_and_close_drops_sink() {
        let mut registry = PortRegistry::new();
        let (s1, mut peer) = sink();

        registry.register(CS, "https://a.example", s1).unwrap();
        assert_eq!(
            registry.post(CS, b"early".to_vec()).unwrap_err(),
            RegistryError::NotOpen(CS)
        );

        registry.mark_open(CS).unwrap();
        registry.post(CS, b"hello".to_vec()).unwrap();
        assert_eq!(peer.source.next_frame().await.unwrap(), b"hello");

        registry.mark_closed(CS).unwrap();
        assert!(peer.source.next_frame().await.is_none());
    }

    #[test]
    fn test_failed_post_closes_port() {
        let mut registry = PortRegistry::new();
        let (s1, peer) = sink();
        registry.register(CS, "https://a.example", s1).unwrap();
        registry.mark_open(CS).unwrap();
        drop(peer);

        assert!(registry.post(CS, b"lost".to_vec()).is_err());
        assert_eq!(registry.get(CS).unwrap().state(), PortState::Closed);
    }
}
