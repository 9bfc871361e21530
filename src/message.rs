// https://redis.io/docs/reference/protocol-spec

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::codec::ProtocolError;

pub(crate) static EOL: &[u8; 2] = b"\r\n";

/// Maximum length of a bulk string, same limit as the Redis server (512 MiB).
pub const MESSAGE_MAX_LENGTH: i64 = 512 * 1024 * 1024;

/// Maximum length of an inline message accepted by the Redis server (64 KiB).
pub const INLINE_MESSAGE_MAX_LENGTH: usize = 64 * 1024;

/// Length encoding for a null bulk string or null array.
pub(crate) const NULL_VALUE: i64 = -1;

/// Number of decimal digits in `i64::MAX`.
pub(crate) const POSITIVE_LONG_MAX_LENGTH: usize = 19;

/// A single RESP protocol message.
///
/// The decoder emits bulk strings and arrays in parts: a `BulkHeader` followed
/// by one or more `BulkChunk`s, and an `ArrayHeader` followed by its elements.
/// The [`Aggregator`](crate::aggregator::Aggregator) folds those parts into
/// `Bulk` and `Array` so consumers downstream of a connection only ever see
/// fully materialized messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Simple(String),
    Error(String),
    Integer(i64),
    /// Length announcement of a non-empty bulk string; its content follows as
    /// one or more `BulkChunk`s.
    BulkHeader(usize),
    BulkChunk { bytes: Bytes, is_last: bool },
    /// A fully materialized bulk string. `None` is the RESP null bulk (`$-1`).
    Bulk(Option<Bytes>),
    ArrayHeader(i64),
    /// A fully materialized array. `None` is the RESP null array (`*-1`).
    Array(Option<Vec<Message>>),
    /// A tag-less, line-terminated command. Only produced when inline command
    /// decoding is enabled in the configuration.
    Inline(String),
}

impl Message {
    pub fn bulk(bytes: impl Into<Bytes>) -> Message {
        Message::Bulk(Some(bytes.into()))
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::Simple(s) => serialize_line(b'+', s.as_bytes()),
            Message::Error(s) => serialize_line(b'-', s.as_bytes()),
            Message::Integer(i) => serialize_line(b':', i.to_string().as_bytes()),
            Message::BulkHeader(len) => serialize_line(b'$', len.to_string().as_bytes()),
            Message::BulkChunk { bytes, is_last } => {
                let mut out = Vec::with_capacity(bytes.len() + EOL.len());
                out.extend_from_slice(bytes);
                if *is_last {
                    out.extend_from_slice(EOL);
                }
                out
            }
            Message::Bulk(Some(bytes)) => {
                let length = bytes.len().to_string();
                let mut out =
                    Vec::with_capacity(1 + length.len() + EOL.len() + bytes.len() + EOL.len());
                out.push(b'$');
                out.extend_from_slice(length.as_bytes());
                out.extend_from_slice(EOL);
                out.extend_from_slice(bytes);
                out.extend_from_slice(EOL);
                out
            }
            Message::Bulk(None) => b"$-1\r\n".to_vec(),
            Message::ArrayHeader(len) => serialize_line(b'*', len.to_string().as_bytes()),
            Message::Array(Some(children)) => {
                let mut out = serialize_line(b'*', children.len().to_string().as_bytes());
                for child in children {
                    out.extend(child.serialize());
                }
                out
            }
            Message::Array(None) => b"*-1\r\n".to_vec(),
            Message::Inline(s) => {
                let mut out = Vec::with_capacity(s.len() + EOL.len());
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(EOL);
                out
            }
        }
    }
}

fn serialize_line(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + content.len() + EOL.len());
    out.push(tag);
    out.extend_from_slice(content);
    out.extend_from_slice(EOL);
    out
}

impl From<Message> for Vec<u8> {
    fn from(message: Message) -> Self {
        message.serialize()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Simple(s) => write!(f, "+{}", s),
            Message::Error(s) => write!(f, "-{}", s),
            Message::Integer(i) => write!(f, ":{}", i),
            Message::BulkHeader(len) => write!(f, "${}", len),
            Message::BulkChunk { bytes, .. } => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Message::Bulk(Some(bytes)) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Message::Bulk(None) => write!(f, "$-1"),
            Message::ArrayHeader(len) => write!(f, "*{}", len),
            Message::Array(Some(children)) => {
                write!(f, "*{}\r\n", children.len())?;
                for child in children {
                    write!(f, "{}\r\n", child)?;
                }
                Ok(())
            }
            Message::Array(None) => write!(f, "*-1"),
            Message::Inline(s) => write!(f, "{}", s),
        }
    }
}

/// The message type encoded by the one-byte RESP tag.
///
/// `Simple`, `Error` and `Integer` are "inline" types: their whole payload is
/// a single line with no length prefix. `Bulk` and `ArrayHeader` announce a
/// length first. A byte that is not a recognized tag starts an inline command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    InlineCommand,
    Simple,     // '+'
    Error,      // '-'
    Integer,    // ':'
    Bulk,       // '$'
    ArrayHeader, // '*'
}

impl MessageType {
    /// Classifies the first byte of a message.
    ///
    /// Unrecognized tags classify as `InlineCommand`, which fails unless
    /// inline command decoding was enabled. Note that for inline commands the
    /// tag byte is part of the content and must not be consumed.
    pub fn classify(byte: u8, decode_inline_commands: bool) -> Result<MessageType, ProtocolError> {
        let message_type = match byte {
            b'+' => MessageType::Simple,
            b'-' => MessageType::Error,
            b':' => MessageType::Integer,
            b'$' => MessageType::Bulk,
            b'*' => MessageType::ArrayHeader,
            _ => MessageType::InlineCommand,
        };
        if message_type == MessageType::InlineCommand && !decode_inline_commands {
            return Err(ProtocolError::InlineCommandsDisabled);
        }
        Ok(message_type)
    }

    /// Whether this type is line-delimited rather than length-prefixed.
    pub fn is_inline(self) -> bool {
        !matches!(self, MessageType::Bulk | MessageType::ArrayHeader)
    }
}

/// A process-wide, read-only cache of frequently repeated scalar replies.
///
/// Status replies such as `+OK` and small integers show up in nearly every
/// exchange; looking them up by byte content avoids reallocating an identical
/// message per reply. Entries are immutable and shared across connections.
pub(crate) struct MessagePool {
    simple_strings: HashMap<&'static [u8], Message>,
    errors: HashMap<&'static [u8], Message>,
    integers: HashMap<Vec<u8>, Message>,
}

static POOL: OnceLock<MessagePool> = OnceLock::new();

const CACHED_STATUSES: &[&str] = &["OK", "PONG", "QUEUED"];

const CACHED_ERRORS: &[&str] = &[
    "ERR no such key",
    "ERR value is not an integer or out of range",
    "WRONGTYPE Operation against a key holding the wrong kind of value",
];

const CACHED_INTEGER_MAX: i64 = 255;

impl MessagePool {
    pub(crate) fn global() -> &'static MessagePool {
        POOL.get_or_init(MessagePool::build)
    }

    fn build() -> MessagePool {
        let simple_strings = CACHED_STATUSES
            .iter()
            .map(|s| (s.as_bytes(), Message::Simple(s.to_string())))
            .collect();
        let errors = CACHED_ERRORS
            .iter()
            .map(|s| (s.as_bytes(), Message::Error(s.to_string())))
            .collect();
        let integers = (0..=CACHED_INTEGER_MAX)
            .map(|i| (i.to_string().into_bytes(), Message::Integer(i)))
            .collect();

        MessagePool {
            simple_strings,
            errors,
            integers,
        }
    }

    pub(crate) fn simple_string(&self, content: &[u8]) -> Option<Message> {
        self.simple_strings.get(content).cloned()
    }

    pub(crate) fn error(&self, content: &[u8]) -> Option<Message> {
        self.errors.get(content).cloned()
    }

    pub(crate) fn integer(&self, content: &[u8]) -> Option<Message> {
        self.integers.get(content).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_simple_string() {
        let message = Message::Simple("OK".to_string());
        assert_eq!(message.serialize(), b"+OK\r\n");
    }

    #[test]
    fn serialize_error() {
        let message = Message::Error("ERR oops".to_string());
        assert_eq!(message.serialize(), b"-ERR oops\r\n");
    }

    #[test]
    fn serialize_integer() {
        assert_eq!(Message::Integer(1000).serialize(), b":1000\r\n");
        assert_eq!(Message::Integer(-5).serialize(), b":-5\r\n");
    }

    #[test]
    fn serialize_bulk_string() {
        assert_eq!(Message::bulk("foobar").serialize(), b"$6\r\nfoobar\r\n");
        assert_eq!(Message::Bulk(None).serialize(), b"$-1\r\n");
        assert_eq!(Message::bulk("").serialize(), b"$0\r\n\r\n");
    }

    #[test]
    fn serialize_array() {
        let message = Message::Array(Some(vec![
            Message::bulk("GET"),
            Message::bulk("key"),
        ]));
        assert_eq!(message.serialize(), b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        assert_eq!(Message::Array(None).serialize(), b"*-1\r\n");
        assert_eq!(Message::Array(Some(vec![])).serialize(), b"*0\r\n");
    }

    #[test]
    fn classify_tags() {
        assert_eq!(MessageType::classify(b'+', false), Ok(MessageType::Simple));
        assert_eq!(MessageType::classify(b'-', false), Ok(MessageType::Error));
        assert_eq!(MessageType::classify(b':', false), Ok(MessageType::Integer));
        assert_eq!(MessageType::classify(b'$', false), Ok(MessageType::Bulk));
        assert_eq!(
            MessageType::classify(b'*', false),
            Ok(MessageType::ArrayHeader)
        );
    }

    #[test]
    fn classify_inline_disabled() {
        assert_eq!(
            MessageType::classify(b'P', false),
            Err(ProtocolError::InlineCommandsDisabled)
        );
    }

    #[test]
    fn classify_inline_enabled() {
        assert_eq!(
            MessageType::classify(b'P', true),
            Ok(MessageType::InlineCommand)
        );
    }

    #[test]
    fn inline_types() {
        assert!(MessageType::Simple.is_inline());
        assert!(MessageType::Error.is_inline());
        assert!(MessageType::Integer.is_inline());
        assert!(MessageType::InlineCommand.is_inline());
        assert!(!MessageType::Bulk.is_inline());
        assert!(!MessageType::ArrayHeader.is_inline());
    }

    #[test]
    fn pool_hits_by_content() {
        let pool = MessagePool::global();

        assert_eq!(
            pool.simple_string(b"OK"),
            Some(Message::Simple("OK".to_string()))
        );
        assert_eq!(pool.integer(b"42"), Some(Message::Integer(42)));
        assert_eq!(
            pool.error(b"ERR no such key"),
            Some(Message::Error("ERR no such key".to_string()))
        );
    }

    #[test]
    fn pool_misses() {
        let pool = MessagePool::global();

        assert_eq!(pool.simple_string(b"NOT CACHED"), None);
        assert_eq!(pool.integer(b"9000"), None);
        assert_eq!(pool.integer(b"-1"), None);
    }
}
