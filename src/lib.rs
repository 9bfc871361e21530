pub mod aggregator;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod message;
pub mod pipeline;

use thiserror::Error as ThisError;

pub use client::{Client, Command, CommandExecution};
pub use config::ClientConfig;
pub use connection::Endpoint;
pub use message::Message;

/// Every failure the client surfaces falls into one of three kinds: the byte
/// stream was malformed (fatal to the connection), the socket itself failed
/// (fatal to the connection, reconnect lazily), or a single reply had an
/// unexpected shape (local to that call).
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] codec::ProtocolError),
    #[error(transparent)]
    Connection(#[from] connection::ConnectionError),
    #[error(transparent)]
    Data(#[from] client::DataError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Connection(connection::ConnectionError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
