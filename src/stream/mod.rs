pub mod live;
pub mod orderbook_client;
pub mod proto;
pub mod supervisor;
pub mod transport;

pub use live::StreamingClient;
pub use orderbook_client::{OrderbookClient, TickerStatus};
pub use supervisor::{Credentials, SessionHandler, SessionSettings, Supervisor};
pub use transport::{Transport, WsTransport};
