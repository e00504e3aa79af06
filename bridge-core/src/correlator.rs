// Request/response correlation over one-way envelopes
//
// Ids are "<context>:<nonce>:<counter>" so two contexts never collide. Each
// pending entry is removed exactly once: on its response, its deadline, its
// port closing, or its caller going away.

use crate::envelope::Envelope;
use crate::error::{RequestError, RouteError};
use crate::protocol::{ChannelName, PortName};
use crate::registry::{LifecycleEvent, LifecycleObserver, PortRegistry};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Responder = oneshot::Sender<Result<Value, RequestError>>;

pub struct PendingRequest {
    pub id: String,
    pub channel: ChannelName,
    /// Port the request left by, with the port generation at send time
    pub port: Option<(PortName, u64)>,
    pub created_at: Instant,
    pub timeout: Duration,
    responder: Responder,
}

impl PendingRequest {
    pub fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    fn settle(self, result: Result<Value, RequestError>) {
        // A closed receiver means the caller stopped caring
        let _ = self.responder.send(result);
    }
}

pub struct Correlator {
    prefix: String,
    counter: u64,
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new(context_name: &str) -> Self {
        let nonce: u32 = rand::thread_rng().gen();
        Self {
            prefix: format!("{}:{:08x}", context_name, nonce),
            counter: 0,
            pending: HashMap::new(),
        }
    }

    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}:{}", self.prefix, self.counter)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Record a request that is about to be transmitted.
    pub fn track(
        &mut self,
        id: String,
        channel: ChannelName,
        port: Option<(PortName, u64)>,
        timeout: Duration,
        responder: Responder,
    ) {
        let entry = PendingRequest {
            id: id.clone(),
            channel,
            port,
            created_at: Instant::now(),
            timeout,
            responder,
        };
        self.pending.insert(id, entry);
    }

    /// Settle the request matching this response. Unknown, late and duplicate
    /// ids return `false` and have no other effect.
    pub fn resolve(&mut self, response: Envelope) -> bool {
        let Some(entry) = self.pending.remove(&response.id) else {
            tracing::debug!(id = %response.id, "dropping response with no pending request");
            return false;
        };

        let result = match remote_failure(&response.id, &response.payload) {
            Some(error) => Err(error),
            None => Ok(response.payload),
        };
        entry.settle(result);
        true
    }

    /// Fail one request whose envelope never made it out.
    pub fn reject_dropped(&mut self, id: &str, reason: RouteError) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                let id = entry.id.clone();
                entry.settle(Err(RequestError::Dropped { id, reason }));
                true
            }
            None => false,
        }
    }

    /// Reject everything sent on `port` at or before `generation`.
    pub fn reject_port(&mut self, port: PortName, generation: u64) -> usize {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| matches!(p.port, Some((name, sent_gen)) if name == port && sent_gen <= generation))
            .map(|p| p.id.clone())
            .collect();

        for id in &ids {
            if let Some(entry) = self.pending.remove(id) {
                entry.settle(Err(RequestError::PortDisconnected {
                    id: id.clone(),
                    port,
                }));
            }
        }
        if !ids.is_empty() {
            tracing::warn!(%port, rejected = ids.len(), "rejected pending requests on closed port");
        }
        ids.len()
    }

    /// Time out every request whose deadline has passed and forget callers
    /// that are no longer waiting.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.pending
            .retain(|_, entry| !entry.responder.is_closed());

        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.deadline() <= now)
            .map(|p| p.id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                tracing::warn!(id = %id, channel = %entry.channel, "request timed out");
                let timeout = entry.timeout;
                entry.settle(Err(RequestError::Timeout {
                    id: id.clone(),
                    timeout,
                }));
            }
        }
        expired.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(PendingRequest::deadline).min()
    }

    /// Fail everything; used when the context shuts down.
    pub fn close_all(&mut self) {
        for (_, entry) in self.pending.drain() {
            entry.settle(Err(RequestError::BridgeClosed));
        }
    }
}

impl LifecycleObserver for Correlator {
    fn on_lifecycle(&mut self, event: &LifecycleEvent, _registry: &mut PortRegistry) {
        if let LifecycleEvent::Closed { name, generation } = event {
            self.reject_port(*name, *generation);
        }
    }
}

const PORT_DISCONNECTED: &str = "portDisconnected";
const QUEUE_OVERFLOW: &str = "queueOverflow";

/// Responses shaped `{"error": {"message": "..."}}` are remote failures. A
/// relay that lost the request on its onward port adds a `code` and the port
/// name, which map back to the typed error the relay saw.
fn remote_failure(id: &str, payload: &Value) -> Option<RequestError> {
    let error = payload.as_object()?.get("error")?;
    let message = error.get("message")?.as_str()?.to_string();
    let code = error.get("code").and_then(Value::as_str);
    let port = error
        .get("port")
        .and_then(|port| serde_json::from_value::<PortName>(port.clone()).ok());
    let id = id.to_string();

    Some(match (code, port) {
        (Some(PORT_DISCONNECTED), Some(port)) => RequestError::PortDisconnected { id, port },
        (Some(QUEUE_OVERFLOW), Some(port)) => RequestError::Dropped {
            reason: RouteError::QueueOverflow {
                port,
                dropped_id: id.clone(),
            },
            id,
        },
        _ => RequestError::Remote { id, message },
    })
}

/// Payload used to answer a request with a failure.
pub fn error_payload(message: &str) -> Value {
    serde_json::json!({ "error": { "message": message } })
}

/// Answer for a relayed request whose onward port closed.
pub fn disconnected_payload(port: PortName) -> Value {
    serde_json::json!({
        "error": {
            "message": format!("port {} disconnected", port),
            "code": PORT_DISCONNECTED,
            "port": port,
        }
    })
}

/// Answer for a relayed request evicted from a full queue.
pub fn overflow_payload(port: PortName) -> Value {
    serde_json::json!({
        "error": {
            "message": format!("queue for {} overflowed", port),
            "code": QUEUE_OVERFLOW,
            "port": port,
        }
    })
}
