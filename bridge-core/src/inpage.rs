// Inpage bridge adapter - the only code that touches the page window
//
// Host side (content script): page traffic gets INPAGE_TO_HOST and the real
// frame origin stamped on it; whatever the page wrote in those fields is
// discarded. Inpage side (provider): only HOST_TO_INPAGE traffic is accepted.
// Both sides ignore their own reflections, since the window echoes every post
// back to every listener.

use crate::envelope::{decode_value, Envelope};
use crate::error::{DecodeError, RouteError};
use crate::protocol::{Link, PageSide};
use crate::transport::{PageWindow, WindowMessage};
use thiserror::Error;

/// Why a window message did not become an envelope.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

pub struct InpageAdapter {
    side: PageSide,
    window: PageWindow,
}

impl InpageAdapter {
    pub fn new(side: PageSide, window: PageWindow) -> Self {
        Self { side, window }
    }

    pub fn side(&self) -> PageSide {
        self.side
    }

    /// Origin bound to the page link.
    pub fn page_origin(&self) -> &str {
        self.window.origin()
    }

    pub fn window(&self) -> &PageWindow {
        &self.window
    }

    /// Turn a window message into an envelope for the router.
    ///
    /// `Ok(None)` means the message is not for us (our own reflection, or
    /// untagged noise on the inpage side).
    pub fn ingest(&self, message: WindowMessage) -> Result<Option<Envelope>, IngestError> {
        let mut envelope = decode_value(message.data)?;

        if envelope.direction == Some(self.side.outbound_direction()) {
            tracing::trace!(id = %envelope.id, "ignoring reflected window message");
            return Ok(None);
        }
        if self.side == PageSide::Inpage && envelope.direction.is_none() {
            return Ok(None);
        }
        if !envelope.channel.is_page_visible() {
            return Err(RouteError::HiddenChannel(envelope.channel).into());
        }

        envelope.direction = Some(self.side.inbound_direction());
        envelope.origin = message.origin;
        Ok(Some(envelope))
    }

    /// Post an envelope to the page, enforcing the outbound direction slot.
    pub fn deliver(&self, mut envelope: Envelope) -> Result<(), RouteError> {
        if !envelope.channel.is_page_visible() {
            return Err(RouteError::HiddenChannel(envelope.channel));
        }

        let expected = self.side.outbound_direction();
        match envelope.direction {
            None => envelope.direction = Some(expected),
            Some(actual) if actual != expected => {
                return Err(RouteError::DirectionViolation {
                    link: Link::Page,
                    expected,
                    actual: Some(actual),
                })
            }
            Some(_) => {}
        }

        if self.window.post(envelope.to_value()).is_err() {
            // Nobody is listening; the page is gone
            tracing::debug!(id = %envelope.id, "page window has no listeners");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChannelName, Direction};
    use serde_json::json;

    const PAGE: &str = "https://dapp.example";

    fn host() -> (InpageAdapter, PageWindow) {
        let window = PageWindow::new(PAGE);
        (InpageAdapter::new(PageSide::Host, window.clone()), window)
    }

    fn page_request() -> serde_json::Value {
        json!({
            "id": "inpage:1",
            "channel": ChannelName::Extension.as_str(),
            "origin": "chrome-extension://forged",
            "kind": "request",
            "payload": "getAccounts",
        })
    }

    #[test]
    fn test_host_stamps_direction_and_real_origin() {
        let (adapter, _) = host();
        let envelope = adapter
            .ingest(WindowMessage {
                origin: PAGE.to_string(),
                data: page_request(),
            })
            .unwrap()
            .unwrap();

        assert_eq!(envelope.direction, Some(Direction::InpageToHost));
        assert_eq!(envelope.origin, PAGE);
    }

    #[test]
    fn test_host_ignores_its_own_reflection() {
        let (adapter, _) = host();
        let mut data = page_request();
        data["direction"] = json!(Direction::HostToInpage.as_str());

        let result = adapter
            .ingest(WindowMessage {
                origin: PAGE.to_string(),
                data,
            })
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_page_cannot_address_hidden_channels() {
        let (adapter, _) = host();
        let mut data = page_request();
        data["channel"] = json!(ChannelName::Ipc.as_str());

        let err = adapter
            .ingest(WindowMessage {
                origin: PAGE.to_string(),
                data,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Route(RouteError::HiddenChannel(ChannelName::Ipc))
        ));
    }

    #[test]
    fn test_inpage_side_ignores_untagged_noise() {
        let window = PageWindow::new(PAGE);
        let adapter = InpageAdapter::new(PageSide::Inpage, window);

        let result = adapter
            .ingest(WindowMessage {
                origin: PAGE.to_string(),
                data: page_request(),
            })
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_deliver_rejects_inpage_to_host_in_outbound_slot() {
        let (adapter, window) = host();
        let mut page = window.subscribe();

        let envelope = Envelope::event("bg:1", ChannelName::Extension, "chrome-extension://abc", json!(1))
            .with_direction(Direction::InpageToHost);
        let err = adapter.deliver(envelope).unwrap_err();

        assert!(matches!(err, RouteError::DirectionViolation { .. }));
        assert!(page.try_recv().is_err(), "nothing may reach the page");
    }

    #[tokio::test]
    async fn test_deliver_tags_and_posts_visible_channels_only() {
        let (adapter, window) = host();
        let mut page = window.subscribe();

        let hidden = Envelope::event("bg:1", ChannelName::Ipc, "chrome-extension://abc", json!(1));
        assert!(matches!(
            adapter.deliver(hidden),
            Err(RouteError::HiddenChannel(ChannelName::Ipc))
        ));

        let visible = Envelope::event("bg:2", ChannelName::Extension, "chrome-extension://abc", json!(2));
        adapter.deliver(visible).unwrap();

        let posted = page.recv().await.unwrap();
        assert_eq!(posted.data["id"], "bg:2");
        assert_eq!(posted.data["direction"], Direction::HostToInpage.as_str());
    }
}
