mod channel;
mod envelope;
mod socket;
mod state;
mod ws;

pub use channel::{Channel, RealtimeConfig, RealtimeEvent, DEFAULT_TOPIC};
pub use envelope::Envelope;
pub use socket::{ChannelError, Connector, RealtimeSocket, SocketEvent};
pub use state::{ConnectionState, StateCell};
pub use ws::WsConnector;
