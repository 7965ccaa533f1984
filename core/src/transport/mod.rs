/// Push channel: connector and wire protocol
pub mod connector;
pub mod protocol;

pub use connector::{ConnectionState, EventHandler, Transport};
pub use protocol::{Envelope, InboundEvent, IncomingMessage, INBOUND_EVENTS};
