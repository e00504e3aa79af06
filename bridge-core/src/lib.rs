// Cross-context message bridge for browser-extension wallets
//
// inpage <-> window <-> content script <-> CS port <-> background <-> {offscreen, UI}

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod inpage;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod stats;
pub mod storage;
pub mod transport;

pub use bridge::{Bridge, BridgeHandle, Delivery};
pub use config::BridgeConfig;
pub use envelope::{decode, encode, Envelope};
pub use error::{ConfigError, ConnectError, DecodeError, RegistryError, RequestError, RouteError, StoreError};
pub use protocol::{ChannelName, ContextRole, Direction, Link, MessageKind, PageSide, PortName};
pub use stats::BridgeStats;
pub use transport::{PageWindow, Transport};
