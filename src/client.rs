use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error as ThisError;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::config::ClientConfig;
use crate::connection::{Connection, Endpoint};
use crate::message::Message;
use crate::Result;

/// A reply did not have the shape the caller expected. Unlike protocol and
/// connection errors this is local to the single call: the connection and its
/// decoder state remain valid and usable.
#[derive(Debug, ThisError)]
pub enum DataError {
    #[error("expected {expected} reply, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: String,
    },
    #[error("server error: {0}")]
    ServerError(String),
    #[error("transaction aborted by server")]
    TransactionAborted,
}

/// A command name plus its ordered arguments. Encodes on the wire as a RESP
/// array of bulk strings, which is how clients always frame requests.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.args.push(arg.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_message(&self) -> Message {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(Message::bulk(self.name.clone().into_bytes()));
        parts.extend(self.args.iter().cloned().map(Message::bulk));
        Message::Array(Some(parts))
    }
}

/// A command paired with the processor that decodes its reply.
///
/// Batch execution writes every command before reading any reply; the
/// processor travels with its command so each positional reply is decoded by
/// the processor it originated with.
pub struct CommandExecution<T> {
    command: Command,
    processor: Box<dyn FnOnce(Message) -> Result<T> + Send>,
}

impl<T> CommandExecution<T> {
    pub fn new(
        command: Command,
        processor: impl FnOnce(Message) -> Result<T> + Send + 'static,
    ) -> CommandExecution<T> {
        CommandExecution {
            command,
            processor: Box::new(processor),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

impl From<Command> for CommandExecution<Message> {
    fn from(command: Command) -> CommandExecution<Message> {
        CommandExecution::new(command, processors::identity)
    }
}

/// The command executor: one connection, shared by any number of tasks.
///
/// All socket access goes through a mutex, so exactly one request/response
/// exchange is in flight at a time. RESP carries no request identifiers, so
/// this strict serialization is what makes reply pairing correct: within one
/// lock hold, writes happen in program order and replies are consumed FIFO.
///
/// For multi-command sequences that must be atomic with respect to other
/// callers, [`Client::exclusive`] hands out a guard that holds the lock for
/// its whole lifetime; its methods execute without re-acquiring, so a
/// transaction is plain sequential code on the guard.
#[derive(Clone)]
pub struct Client {
    connection: Arc<Mutex<Connection>>,
}

impl Client {
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Client {
        Client {
            connection: Arc::new(Mutex::new(Connection::new(endpoint, config))),
        }
    }

    /// Executes one command and decodes its reply with `processor`.
    ///
    /// Connects lazily, writes and flushes the encoded command, waits for
    /// exactly one reply. The lock is released on every exit path, success or
    /// failure, by the guard going out of scope.
    pub async fn execute<T>(
        &self,
        command: Command,
        processor: impl FnOnce(Message) -> Result<T>,
    ) -> Result<T> {
        let mut connection = self.connection.lock().await;
        let reply = roundtrip(&mut connection, &command).await?;
        processor(reply)
    }

    /// Executes a batch under a single lock hold: all commands are written in
    /// order, flushed once, then exactly `executions.len()` replies are read
    /// and each one is decoded by the processor of the execution at the same
    /// position. No other caller's request can be interleaved.
    pub async fn execute_batch<T>(&self, executions: Vec<CommandExecution<T>>) -> Result<Vec<T>> {
        let mut connection = self.connection.lock().await;
        batch(&mut connection, executions).await
    }

    /// Acquires the connection exclusively until the returned guard is
    /// dropped. Other callers block for the full duration.
    pub async fn exclusive(&self) -> ExclusiveConnection<'_> {
        ExclusiveConnection {
            connection: self.connection.lock().await,
        }
    }

    pub async fn disconnect(&self) {
        self.connection.lock().await.disconnect();
    }
}

/// A lock-holding session on the client's connection.
///
/// Dependent operations issued through this guard run back to back on the
/// socket with no possibility of interleaving, without each call re-acquiring
/// the lock.
pub struct ExclusiveConnection<'a> {
    connection: MutexGuard<'a, Connection>,
}

impl ExclusiveConnection<'_> {
    pub async fn execute<T>(
        &mut self,
        command: Command,
        processor: impl FnOnce(Message) -> Result<T>,
    ) -> Result<T> {
        let reply = roundtrip(&mut self.connection, &command).await?;
        processor(reply)
    }

    pub async fn execute_batch<T>(
        &mut self,
        executions: Vec<CommandExecution<T>>,
    ) -> Result<Vec<T>> {
        batch(&mut self.connection, executions).await
    }
}

async fn roundtrip(connection: &mut Connection, command: &Command) -> Result<Message> {
    connection.connect().await?;
    trace!(command = command.name(), "executing");
    connection.write_and_flush(&command.to_message()).await?;
    connection.read().await
}

async fn batch<T>(
    connection: &mut Connection,
    executions: Vec<CommandExecution<T>>,
) -> Result<Vec<T>> {
    connection.connect().await?;
    for execution in &executions {
        connection.write(&execution.command.to_message()).await?;
    }
    connection.flush().await?;

    // Every reply is read off the wire before any processor runs, so a
    // decoding failure cannot leave later replies queued against the next
    // caller's commands.
    let mut replies = Vec::with_capacity(executions.len());
    for _ in &executions {
        replies.push(connection.read().await?);
    }

    executions
        .into_iter()
        .zip(replies)
        .map(|(execution, reply)| (execution.processor)(reply))
        .collect()
}

/// Canonical response processors for the reply shapes RESP2 defines. Each one
/// turns a server `-ERR` into [`DataError::ServerError`] and any other
/// unexpected shape into [`DataError::UnexpectedReply`].
pub mod processors {
    use super::DataError;
    use crate::message::Message;
    use crate::{Error, Result};

    pub fn identity(message: Message) -> Result<Message> {
        Ok(message)
    }

    pub fn simple_string(message: Message) -> Result<String> {
        match message {
            Message::Simple(s) => Ok(s),
            other => Err(unexpected("simple string", other)),
        }
    }

    pub fn integer(message: Message) -> Result<i64> {
        match message {
            Message::Integer(i) => Ok(i),
            other => Err(unexpected("integer", other)),
        }
    }

    pub fn bulk(message: Message) -> Result<Option<bytes::Bytes>> {
        match message {
            Message::Bulk(bytes) => Ok(bytes),
            other => Err(unexpected("bulk string", other)),
        }
    }

    pub fn array(message: Message) -> Result<Option<Vec<Message>>> {
        match message {
            Message::Array(children) => Ok(children),
            other => Err(unexpected("array", other)),
        }
    }

    pub(crate) fn unexpected(expected: &'static str, actual: Message) -> Error {
        match actual {
            Message::Error(e) => DataError::ServerError(e).into(),
            other => DataError::UnexpectedReply {
                expected,
                actual: other.to_string(),
            }
            .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encodes_as_bulk_string_array() {
        let command = Command::new("SET").arg("key").arg("value");
        assert_eq!(
            command.to_message().serialize(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n"
        );
    }

    #[test]
    fn command_without_args() {
        let command = Command::new("PING");
        assert_eq!(command.to_message().serialize(), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn processor_accepts_expected_shape() {
        assert_eq!(
            processors::simple_string(Message::Simple("OK".to_string())).unwrap(),
            "OK"
        );
        assert_eq!(processors::integer(Message::Integer(7)).unwrap(), 7);
    }

    #[test]
    fn processor_rejects_unexpected_shape() {
        let err = processors::integer(Message::Simple("OK".to_string())).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Data(DataError::UnexpectedReply { expected: "integer", .. })
        ));
    }

    #[test]
    fn processor_surfaces_server_error() {
        let err = processors::bulk(Message::Error("ERR no such key".to_string())).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Data(DataError::ServerError(ref e)) if e == "ERR no such key"
        ));
    }
}
