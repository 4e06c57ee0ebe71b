//! KIS Open API gateway: authenticated REST session, broker operations and
//! the realtime WebSocket stream.

pub mod broker;
pub mod session;
pub mod websocket;

pub use broker::KisBroker;
pub use session::SessionManager;
pub use websocket::RealtimeStream;
