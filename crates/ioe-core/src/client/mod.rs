pub mod connection;
pub mod correlator;
pub mod device;
pub mod events;
pub mod identity;
pub mod reconnect;
pub mod types;

pub use connection::{Connection, PUSH_BACKLOG, Subscription};
pub use correlator::Correlator;
pub use device::{ROOT_NODE_ID, node_id, split_path};
pub use events::EventBuffer;
pub use identity::{SnCheck, reconcile_sn};
pub use reconnect::ReconnectTimer;
pub use types::{ConnectionEvent, ConnectionEventKind, ConnectionStatus, SnDecision};
