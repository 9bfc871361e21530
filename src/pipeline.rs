use crate::client::{Client, Command, CommandExecution, DataError};
use crate::message::Message;
use crate::Result;

impl Client {
    /// Starts an empty pipeline bound to this client.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            client: self,
            commands: Vec::new(),
        }
    }

    /// Starts an empty transaction bound to this client.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            client: self,
            commands: Vec::new(),
        }
    }
}

/// A batch of commands issued in one write burst and read back in order.
///
/// All commands are written before any reply is read, and the connection lock
/// is held across the whole exchange, so the replies land in request order
/// with nothing interleaved.
pub struct Pipeline<'a> {
    client: &'a Client,
    commands: Vec<Command>,
}

impl Pipeline<'_> {
    pub fn cmd(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executes the queued commands and returns their replies in order.
    pub async fn execute(self) -> Result<Vec<Message>> {
        let executions = self.commands.into_iter().map(CommandExecution::from).collect();
        self.client.execute_batch(executions).await
    }
}

/// A `MULTI`/`EXEC` transaction.
///
/// The queued commands are sent in one batch wrapped in `MULTI` and `EXEC`,
/// under a single lock hold. The server replies `+OK` to `MULTI`, `+QUEUED`
/// per command, and an array of the real replies to `EXEC`; that array is
/// unwrapped into the returned list. A null `EXEC` reply means the server
/// aborted the transaction.
pub struct Transaction<'a> {
    client: &'a Client,
    commands: Vec<Command>,
}

impl Transaction<'_> {
    pub fn cmd(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executes the transaction and returns the per-command replies.
    pub async fn execute(self) -> Result<Vec<Message>> {
        let command_count = self.commands.len();

        let mut batch: Vec<CommandExecution<Message>> =
            Vec::with_capacity(command_count + 2);
        batch.push(Command::new("MULTI").into());
        batch.extend(self.commands.into_iter().map(CommandExecution::from));
        batch.push(Command::new("EXEC").into());

        let mut replies = self.client.execute_batch(batch).await?.into_iter();

        expect_status(replies.next(), "OK")?;
        for _ in 0..command_count {
            expect_status(replies.next(), "QUEUED")?;
        }

        match replies.next() {
            Some(Message::Array(Some(results))) => Ok(results),
            Some(Message::Array(None)) => Err(DataError::TransactionAborted.into()),
            Some(Message::Error(e)) => Err(DataError::ServerError(e).into()),
            Some(other) => Err(DataError::UnexpectedReply {
                expected: "EXEC array",
                actual: other.to_string(),
            }
            .into()),
            None => Err(DataError::UnexpectedReply {
                expected: "EXEC array",
                actual: "missing reply".to_string(),
            }
            .into()),
        }
    }
}

fn expect_status(reply: Option<Message>, status: &'static str) -> Result<()> {
    match reply {
        Some(Message::Simple(s)) if s == status => Ok(()),
        Some(Message::Error(e)) => Err(DataError::ServerError(e).into()),
        Some(other) => Err(DataError::UnexpectedReply {
            expected: status,
            actual: other.to_string(),
        }
        .into()),
        None => Err(DataError::UnexpectedReply {
            expected: status,
            actual: "missing reply".to_string(),
        }
        .into()),
    }
}
