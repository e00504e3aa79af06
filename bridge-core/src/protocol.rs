// Shared protocol vocabulary for every extension context
// These strings are the whole compatibility surface with external peers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const JS_BRIDGE_MESSAGE_IPC_CHANNEL: &str = "onekey@JS_BRIDGE_MESSAGE_IPC_CHANNEL";
pub const JS_BRIDGE_MESSAGE_EXT_CHANNEL: &str = "onekey@JS_BRIDGE_MESSAGE_EXT_CHANNEL";
pub const JS_BRIDGE_MESSAGE_EXT_PING: &str = "onekey@JS_BRIDGE_MESSAGE_EXT_PING";

pub const DIRECTION_HOST_TO_INPAGE: &str = "onekey@JS_BRIDGE_MESSAGE_DIRECTION-HOST_TO_INPAGE";
pub const DIRECTION_INPAGE_TO_HOST: &str = "onekey@JS_BRIDGE_MESSAGE_DIRECTION-INPAGE_TO_HOST";

pub const EXT_PORT_OFFSCREEN_TO_BG: &str = "onekey@EXT_PORT_OFFSCREEN_TO_BG";
pub const EXT_PORT_CS_TO_BG: &str = "onekey@EXT_PORT_CS_TO_BG";
pub const EXT_PORT_UI_TO_BG: &str = "onekey@EXT_PORT_UI_TO_BG";

/// Returned when a wire string is not part of the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol name: {}", self.0)
    }
}

impl std::error::Error for UnknownName {}

/// Logical channel multiplexed over the physical ports.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// Background-internal traffic; never leaves the context it was created in
    #[serde(rename = "onekey@JS_BRIDGE_MESSAGE_IPC_CHANNEL")]
    Ipc,
    #[serde(rename = "onekey@JS_BRIDGE_MESSAGE_EXT_CHANNEL")]
    Extension,
    #[serde(rename = "onekey@JS_BRIDGE_MESSAGE_EXT_PING")]
    ExtensionPing,
}

impl ChannelName {
    pub const ALL: [ChannelName; 3] = [
        ChannelName::Ipc,
        ChannelName::Extension,
        ChannelName::ExtensionPing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelName::Ipc => JS_BRIDGE_MESSAGE_IPC_CHANNEL,
            ChannelName::Extension => JS_BRIDGE_MESSAGE_EXT_CHANNEL,
            ChannelName::ExtensionPing => JS_BRIDGE_MESSAGE_EXT_PING,
        }
    }

    /// Whether a web page may address this channel at all.
    pub fn is_page_visible(self) -> bool {
        matches!(self, ChannelName::Extension)
    }
}

impl FromStr for ChannelName {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction tag, only meaningful on the page/content-script boundary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    #[serde(rename = "onekey@JS_BRIDGE_MESSAGE_DIRECTION-HOST_TO_INPAGE")]
    HostToInpage,
    #[serde(rename = "onekey@JS_BRIDGE_MESSAGE_DIRECTION-INPAGE_TO_HOST")]
    InpageToHost,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::HostToInpage => DIRECTION_HOST_TO_INPAGE,
            Direction::InpageToHost => DIRECTION_INPAGE_TO_HOST,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::HostToInpage => Direction::InpageToHost,
            Direction::InpageToHost => Direction::HostToInpage,
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            DIRECTION_HOST_TO_INPAGE => Ok(Direction::HostToInpage),
            DIRECTION_INPAGE_TO_HOST => Ok(Direction::InpageToHost),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named physical port between an extension context and the background.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortName {
    #[serde(rename = "onekey@EXT_PORT_OFFSCREEN_TO_BG")]
    OffscreenToBackground,
    #[serde(rename = "onekey@EXT_PORT_CS_TO_BG")]
    ContentScriptToBackground,
    #[serde(rename = "onekey@EXT_PORT_UI_TO_BG")]
    UiToBackground,
}

impl PortName {
    pub const ALL: [PortName; 3] = [
        PortName::OffscreenToBackground,
        PortName::ContentScriptToBackground,
        PortName::UiToBackground,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PortName::OffscreenToBackground => EXT_PORT_OFFSCREEN_TO_BG,
            PortName::ContentScriptToBackground => EXT_PORT_CS_TO_BG,
            PortName::UiToBackground => EXT_PORT_UI_TO_BG,
        }
    }
}

impl FromStr for PortName {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Event => "event",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(MessageKind::Request),
            "response" => Ok(MessageKind::Response),
            "event" => Ok(MessageKind::Event),
            "ping" => Ok(MessageKind::Ping),
            "pong" => Ok(MessageKind::Pong),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which execution context a bridge instance runs in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Background,
    ContentScript,
    Offscreen,
    Ui,
    Inpage,
}

impl ContextRole {
    /// The port this context uses to reach the background, if any.
    pub fn uplink(self) -> Option<PortName> {
        match self {
            ContextRole::ContentScript => Some(PortName::ContentScriptToBackground),
            ContextRole::Offscreen => Some(PortName::OffscreenToBackground),
            ContextRole::Ui => Some(PortName::UiToBackground),
            ContextRole::Background | ContextRole::Inpage => None,
        }
    }

    /// Which side of the window boundary this context sits on, if it touches it.
    pub fn page_side(self) -> Option<PageSide> {
        match self {
            ContextRole::ContentScript => Some(PageSide::Host),
            ContextRole::Inpage => Some(PageSide::Inpage),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextRole::Background => "background",
            ContextRole::ContentScript => "content_script",
            ContextRole::Offscreen => "offscreen",
            ContextRole::Ui => "ui",
            ContextRole::Inpage => "inpage",
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two ends of the window messaging boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSide {
    /// The content script, listening for page traffic
    Host,
    /// The injected provider inside the page
    Inpage,
}

impl PageSide {
    /// Tag every message arriving at this side must carry.
    pub fn inbound_direction(self) -> Direction {
        match self {
            PageSide::Host => Direction::InpageToHost,
            PageSide::Inpage => Direction::HostToInpage,
        }
    }

    /// Tag every message this side posts to the window must carry.
    pub fn outbound_direction(self) -> Direction {
        self.inbound_direction().reverse()
    }
}

/// Physical link an envelope arrived on or leaves by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Link {
    Port(PortName),
    Page,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Port(name) => write!(f, "port {}", name),
            Link::Page => f.write_str("page"),
        }
    }
}
