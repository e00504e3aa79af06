// Keepalive monitor - detects silently dead ports
//
// The monitor is also the only component that brings a port (back) to life:
// adopting a transport goes through `adopt`, which registers or replaces the
// port in the registry.

use crate::config::KeepaliveConfig;
use crate::envelope::Envelope;
use crate::error::RegistryError;
use crate::protocol::PortName;
use crate::registry::{LifecycleEvent, LifecycleObserver, PortRegistry};
use crate::transport::FrameSink;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug)]
struct Liveness {
    generation: u64,
    outstanding: Option<(String, Instant)>,
    missed: u32,
    next_ping_at: Instant,
}

pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    /// Origin stamped on our pings
    origin: String,
    counter: u64,
    tracked: HashMap<PortName, Liveness>,
}

/// What `adopt` did with a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adoption {
    Registered { generation: u64 },
    Reconnected { generation: u64 },
}

impl Adoption {
    pub fn generation(self) -> u64 {
        match self {
            Adoption::Registered { generation } | Adoption::Reconnected { generation } => generation,
        }
    }
}

impl KeepaliveMonitor {
    pub fn new(config: KeepaliveConfig, origin: impl Into<String>) -> Self {
        Self {
            config,
            origin: origin.into(),
            counter: 0,
            tracked: HashMap::new(),
        }
    }

    /// Attach a freshly available transport to `name`.
    ///
    /// A missing port is registered, a Closed port is replaced, and a live
    /// port is refused with `DuplicatePort`.
    pub fn adopt(
        &mut self,
        registry: &mut PortRegistry,
        name: PortName,
        peer_origin: &str,
        sink: Box<dyn FrameSink>,
    ) -> Result<Adoption, RegistryError> {
        let known = registry.get(name).is_ok();
        let adoption = if known {
            let generation = registry.replace(name, peer_origin, sink)?.generation();
            tracing::info!(port = %name, generation, "port reconnected");
            Adoption::Reconnected { generation }
        } else {
            let generation = registry.register(name, peer_origin, sink)?.generation();
            Adoption::Registered { generation }
        };
        registry.mark_open(name)?;
        Ok(adoption)
    }

    pub fn is_tracking(&self, name: PortName) -> bool {
        self.tracked.contains_key(&name)
    }

    pub fn missed(&self, name: PortName) -> u32 {
        self.tracked.get(&name).map_or(0, |l| l.missed)
    }

    /// A pong arrived on `name`. Only the answer to the outstanding ping counts.
    pub fn on_pong(&mut self, registry: &mut PortRegistry, name: PortName, pong: &Envelope, now: Instant) {
        let Some(liveness) = self.tracked.get_mut(&name) else {
            return;
        };
        match &liveness.outstanding {
            Some((id, _)) if *id == pong.id => {
                liveness.outstanding = None;
                liveness.missed = 0;
                registry.record_pong(name, now);
            }
            _ => tracing::trace!(port = %name, id = %pong.id, "ignoring stale pong"),
        }
    }

    /// Count missed pongs, close ports past the limit, and send due pings.
    /// Returns the ports closed by this tick.
    pub fn tick(&mut self, registry: &mut PortRegistry, now: Instant) -> Vec<PortName> {
        let mut dead = Vec::new();
        let mut names: Vec<PortName> = self.tracked.keys().copied().collect();
        names.sort();

        for name in names {
            let Some(liveness) = self.tracked.get_mut(&name) else {
                continue;
            };

            if let Some((_, sent_at)) = liveness.outstanding {
                if now >= sent_at + self.config.pong_timeout() {
                    liveness.outstanding = None;
                    liveness.missed += 1;
                    tracing::warn!(port = %name, missed = liveness.missed, "pong not received in time");
                    if liveness.missed >= self.config.max_missed {
                        dead.push(name);
                        continue;
                    }
                }
            }

            if liveness.outstanding.is_none() && now >= liveness.next_ping_at {
                self.counter += 1;
                let id = format!("ping:{}", self.counter);
                let ping = Envelope::ping(id.clone(), self.origin.clone());
                liveness.outstanding = Some((id, now));
                liveness.next_ping_at = now + self.config.interval();
                if registry.post(name, ping.encode()).is_err() {
                    tracing::debug!(port = %name, "ping could not be sent");
                }
            }
        }

        for name in &dead {
            tracing::warn!(port = %name, "port missed too many pongs, marking closed");
            if let Err(e) = registry.mark_closed(*name) {
                tracing::error!(port = %name, error = %e, "failed to close dead port");
            }
        }
        dead
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.tracked
            .values()
            .map(|l| match &l.outstanding {
                Some((_, sent_at)) => *sent_at + self.config.pong_timeout(),
                None => l.next_ping_at,
            })
            .min()
    }
}

impl LifecycleObserver for KeepaliveMonitor {
    fn on_lifecycle(&mut self, event: &LifecycleEvent, _registry: &mut PortRegistry) {
        match *event {
            LifecycleEvent::Opened { name, generation } => {
                self.tracked.insert(
                    name,
                    Liveness {
                        generation,
                        outstanding: None,
                        missed: 0,
                        next_ping_at: Instant::now() + self.config.interval(),
                    },
                );
            }
            LifecycleEvent::Closed { name, generation } => {
                if self
                    .tracked
                    .get(&name)
                    .is_some_and(|l| l.generation <= generation)
                {
                    self.tracked.remove(&name);
                }
            }
            LifecycleEvent::Registered { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode;
    use crate::protocol::MessageKind;
    use crate::transport::Transport;
    use std::time::Duration;

    const UI: PortName = PortName::UiToBackground;

    fn config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: 1_000,
            pong_timeout_ms: 300,
            max_missed: 2,
        }
    }

    fn setup() -> (KeepaliveMonitor, PortRegistry, Transport) {
        let mut monitor = KeepaliveMonitor::new(config(), "chrome-extension://abc");
        let mut registry = PortRegistry::new();
        let mut events = registry.subscribe();
        let (ours, theirs) = Transport::pair();

        monitor
            .adopt(&mut registry, UI, "chrome-extension://abc", ours.sink)
            .unwrap();
        while let Ok(event) = events.try_recv() {
            monitor.on_lifecycle(&event, &mut registry);
        }
        (monitor, registry, theirs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_on_interval_and_pong_resets() {
        let (mut monitor, mut registry, mut peer) = setup();
        assert!(monitor.is_tracking(UI));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        monitor.tick(&mut registry, Instant::now());

        let ping = decode(&peer.source.next_frame().await.unwrap()).unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);

        monitor.on_pong(&mut registry, UI, &ping.pong("chrome-extension://abc"), Instant::now());
        assert_eq!(monitor.missed(UI), 0);
        assert!(registry.get(UI).unwrap().last_pong_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_missed_pongs_close_the_port() {
        let (mut monitor, mut registry, _peer) = setup();

        // ping at 1000, miss at 1300, ping at 2000, miss at 2300
        for step in [1_000, 300, 700] {
            tokio::time::advance(Duration::from_millis(step)).await;
            assert!(monitor.tick(&mut registry, Instant::now()).is_empty());
        }
        assert_eq!(monitor.missed(UI), 1);

        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(monitor.tick(&mut registry, Instant::now()), vec![UI]);
        assert!(!registry.is_open(UI));
    }

    #[test]
    fn test_adopt_refuses_live_port_and_replaces_closed_one() {
        let mut monitor = KeepaliveMonitor::new(config(), "bg");
        let mut registry = PortRegistry::new();
        let (a, _pa) = Transport::pair();
        let (b, _pb) = Transport::pair();
        let (c, _pc) = Transport::pair();

        let first = monitor.adopt(&mut registry, UI, "ui", a.sink).unwrap();
        assert!(matches!(first, Adoption::Registered { .. }));
        assert_eq!(
            monitor.adopt(&mut registry, UI, "ui", b.sink).unwrap_err(),
            RegistryError::DuplicatePort(UI)
        );

        registry.mark_closed(UI).unwrap();
        let second = monitor.adopt(&mut registry, UI, "ui", c.sink).unwrap();
        assert!(matches!(second, Adoption::Reconnected { .. }));
        assert!(second.generation() > first.generation());
        assert!(registry.is_open(UI));
    }
}
