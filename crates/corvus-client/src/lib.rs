//! Messaging client that adapts a push-based broker to a dual
//! synchronous/asynchronous consumer API: blocking `receive` calls with
//! timeouts on one side, application push listeners on the other, both
//! gated by the connection's start/stop/close lifecycle.
//!
//! ```
//! use corvus_broker::Broker;
//! use corvus_client::{AckMode, ClientConfig, Connection, Destination};
//!
//! # async fn demo() -> corvus_client::Result<()> {
//! let broker = Broker::new();
//! let connection = Connection::new(broker.connect(), ClientConfig::default());
//! connection.start().await?;
//! let session = connection.create_session(AckMode::Auto).await?;
//! let consumer = session.create_consumer(&Destination::queue("orders")).await?;
//! if let Some(message) = consumer.receive_timeout(1_000).await? {
//!     println!("got {:?}", message.as_text());
//! }
//! # Ok(())
//! # }
//! ```
pub mod config;
mod connection;
mod consumer;
mod destination;
mod message;
mod session;
#[cfg(test)]
mod tests;

pub use config::ClientConfig;
pub use connection::Connection;
pub use consumer::listener::MessageListener;
pub use consumer::Consumer;
pub use destination::Destination;
pub use message::{FrameError, Message, MessageBody};
pub use session::{AckMode, Session};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Operation invoked on a closed or closing object, or a listener
    /// install that lost its race.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// Underlying broker failure, surfaced as-is.
    #[error("broker failure: {0}")]
    Broker(#[from] corvus_broker::BrokerError),
    /// A received body frame that cannot be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] message::FrameError),
    #[error("config error: {0}")]
    Config(String),
}
