use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::Decoder;

use crate::aggregator::Aggregator;
use crate::config::ClientConfig;
use crate::message::{
    Message, MessagePool, MessageType, MESSAGE_MAX_LENGTH, NULL_VALUE, POSITIVE_LONG_MAX_LENGTH,
};
use crate::Error;

/// A malformed byte stream. Always fatal to the connection: once framing is
/// wrong, byte alignment beyond the error point cannot be trusted.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("decoding of inline commands is disabled")]
    InlineCommandsDisabled,
    #[error("inline message length {length} exceeds maximum of {max}")]
    InlineTooLong { length: usize, max: usize },
    #[error("bad byte in number: {0:#04x}")]
    BadDigit(u8),
    #[error("no number to parse")]
    EmptyNumber,
    #[error("too many characters to be a valid RESP integer: {0}")]
    NumberTooLong(usize),
    #[error("bad line delimiter: [{0:#04x}, {1:#04x}] (expected \\r\\n)")]
    BadLineTerminator(u8, u8),
    #[error("length: {0} (expected: >= -1)")]
    BadLength(i64),
    #[error("bulk string length {0} exceeds maximum of {MESSAGE_MAX_LENGTH}")]
    BulkTooLong(i64),
    #[error("array length {0} exceeds maximum element count")]
    ArrayTooLarge(i64),
    #[error("invalid utf-8 in line-delimited message")]
    InvalidUtf8,
    #[error("unexpected bulk content chunk")]
    UnexpectedChunk,
    #[error("bad message type: {0}")]
    BadType(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    AwaitingType,
    DecodingInline,
    DecodingLength,
    AwaitingBulkEol,
    DecodingBulkContent,
}

/// Streaming RESP decoder.
///
/// Consumes raw bytes incrementally and emits one [`Message`] per successful
/// `decode` call. A chunk boundary may fall anywhere, including mid-header or
/// mid-content: the state machine persists across calls and picks up where the
/// previous call left off. Bulk strings longer than the available bytes are
/// emitted as a [`Message::BulkHeader`] followed by content chunks, and arrays
/// as an [`Message::ArrayHeader`] followed by their elements; feed the output
/// through an [`Aggregator`] to materialize them.
#[derive(Debug)]
pub struct RespDecoder {
    state: DecodeState,
    message_type: MessageType,
    remaining_bulk_length: i64,
    max_inline_length: usize,
    decode_inline_commands: bool,
}

impl RespDecoder {
    pub fn new(max_inline_length: usize, decode_inline_commands: bool) -> RespDecoder {
        RespDecoder {
            state: DecodeState::AwaitingType,
            message_type: MessageType::InlineCommand,
            remaining_bulk_length: 0,
            max_inline_length,
            decode_inline_commands,
        }
    }

    pub fn from_config(config: &ClientConfig) -> RespDecoder {
        RespDecoder::new(config.max_inline_length, config.decode_inline_commands)
    }

    /// Decodes at most one message from `src`, consuming the bytes it used.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error resets the
    /// decoder to its initial state before propagating.
    pub fn decode_message(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.run(src) {
            Ok(message) => Ok(message),
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    fn reset(&mut self) {
        self.state = DecodeState::AwaitingType;
        self.remaining_bulk_length = 0;
    }

    fn run(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::AwaitingType => {
                    if !self.decode_type(src)? {
                        return Ok(None);
                    }
                }
                DecodeState::DecodingInline => return self.decode_inline(src),
                DecodeState::DecodingLength => return self.decode_length(src),
                DecodeState::AwaitingBulkEol => return self.decode_bulk_eol(src),
                DecodeState::DecodingBulkContent => return self.decode_bulk_content(src),
            }
        }
    }

    fn decode_type(&mut self, src: &mut BytesMut) -> Result<bool, ProtocolError> {
        let Some(&byte) = src.first() else {
            return Ok(false);
        };
        self.message_type = MessageType::classify(byte, self.decode_inline_commands)?;
        if self.message_type != MessageType::InlineCommand {
            // The tag byte belongs to the framing; for inline commands it is
            // part of the content and stays in the buffer.
            src.advance(1);
        }
        self.state = if self.message_type.is_inline() {
            DecodeState::DecodingInline
        } else {
            DecodeState::DecodingLength
        };
        Ok(true)
    }

    fn decode_inline(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(line) = read_line(src)? else {
            if src.len() > self.max_inline_length {
                return Err(ProtocolError::InlineTooLong {
                    length: src.len(),
                    max: self.max_inline_length,
                });
            }
            return Ok(None);
        };
        let message = self.new_inline_message(&line)?;
        self.reset();
        Ok(Some(message))
    }

    fn decode_length(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(line) = read_line(src)? else {
            return Ok(None);
        };
        let length = parse_number(&line)?;
        if length < NULL_VALUE {
            return Err(ProtocolError::BadLength(length));
        }

        match self.message_type {
            MessageType::ArrayHeader => {
                self.reset();
                Ok(Some(Message::ArrayHeader(length)))
            }
            MessageType::Bulk => {
                if length > MESSAGE_MAX_LENGTH {
                    return Err(ProtocolError::BulkTooLong(length));
                }
                self.remaining_bulk_length = length;
                self.decode_bulk_start(src)
            }
            _ => Err(ProtocolError::BadType("expected a length-prefixed type")),
        }
    }

    fn decode_bulk_start(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.remaining_bulk_length {
            NULL_VALUE => {
                self.reset();
                Ok(Some(Message::Bulk(None)))
            }
            0 => {
                self.state = DecodeState::AwaitingBulkEol;
                self.decode_bulk_eol(src)
            }
            length => {
                self.state = DecodeState::DecodingBulkContent;
                Ok(Some(Message::BulkHeader(length as usize)))
            }
        }
    }

    // $0\r\n <here> \r\n
    fn decode_bulk_eol(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        read_eol(src)?;
        self.reset();
        Ok(Some(Message::Bulk(Some(Bytes::new()))))
    }

    // ${length}\r\n <here> {content}\r\n
    fn decode_bulk_content(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let readable = src.len();
        if readable == 0 || (self.remaining_bulk_length == 0 && readable < 2) {
            return Ok(None);
        }

        // Last chunk: the rest of the content and its trailing CRLF are here.
        if readable as i64 >= self.remaining_bulk_length + 2 {
            let bytes = src.split_to(self.remaining_bulk_length as usize).freeze();
            read_eol(src)?;
            self.reset();
            return Ok(Some(Message::BulkChunk {
                bytes,
                is_last: true,
            }));
        }

        let to_read = self.remaining_bulk_length.min(readable as i64) as usize;
        self.remaining_bulk_length -= to_read as i64;
        Ok(Some(Message::BulkChunk {
            bytes: src.split_to(to_read).freeze(),
            is_last: false,
        }))
    }

    fn new_inline_message(&self, line: &[u8]) -> Result<Message, ProtocolError> {
        let pool = MessagePool::global();
        match self.message_type {
            MessageType::Simple => match pool.simple_string(line) {
                Some(message) => Ok(message),
                None => Ok(Message::Simple(utf8(line)?)),
            },
            MessageType::Error => match pool.error(line) {
                Some(message) => Ok(message),
                None => Ok(Message::Error(utf8(line)?)),
            },
            MessageType::Integer => match pool.integer(line) {
                Some(message) => Ok(message),
                None => Ok(Message::Integer(parse_number(line)?)),
            },
            MessageType::InlineCommand => Ok(Message::Inline(utf8(line)?)),
            MessageType::Bulk | MessageType::ArrayHeader => {
                Err(ProtocolError::BadType("expected a line-delimited type"))
            }
        }
    }
}

fn utf8(line: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Reads one CR LF terminated line, without the terminator. Returns `None`
/// when no complete line is buffered yet; a line ended by a bare LF is an
/// error.
fn read_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
    let Some(lf) = src.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if lf == 0 || src[lf - 1] != b'\r' {
        let before = if lf == 0 { b'\n' } else { src[lf - 1] };
        return Err(ProtocolError::BadLineTerminator(before, b'\n'));
    }
    let mut line = src.split_to(lf + 1);
    line.truncate(lf - 1);
    Ok(Some(line))
}

fn read_eol(src: &mut BytesMut) -> Result<(), ProtocolError> {
    let (cr, lf) = (src[0], src[1]);
    if &[cr, lf] != b"\r\n" {
        return Err(ProtocolError::BadLineTerminator(cr, lf));
    }
    src.advance(2);
    Ok(())
}

/// Parses a signed decimal integer, validating byte by byte: an optional
/// leading `-`, then at most 19 ASCII digits.
fn parse_number(line: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match line.first() {
        Some(b'-') => (true, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(ProtocolError::EmptyNumber);
    }
    if digits.len() > POSITIVE_LONG_MAX_LENGTH {
        return Err(ProtocolError::NumberTooLong(digits.len()));
    }
    let mut value: i64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(ProtocolError::BadDigit(byte));
        }
        value = value.wrapping_mul(10).wrapping_add((byte - b'0') as i64);
    }
    Ok(if negative { -value } else { value })
}

impl Decoder for RespDecoder {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_message(src)?)
    }
}

/// The full response codec: streaming decode plus aggregation, so each
/// successfully decoded item is a fully materialized message.
#[derive(Debug)]
pub struct RespCodec {
    decoder: RespDecoder,
    aggregator: Aggregator,
}

impl RespCodec {
    pub fn new(config: &ClientConfig) -> RespCodec {
        RespCodec {
            decoder: RespDecoder::from_config(config),
            aggregator: Aggregator::new(),
        }
    }
}

impl Decoder for RespCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // The decoder resets itself on error; partial aggregation state is
            // just as untrustworthy, so drop it alongside.
            let part = match self.decoder.decode_message(src) {
                Ok(Some(part)) => part,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.aggregator.reset();
                    return Err(err.into());
                }
            };
            match self.aggregator.push(part) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(err) => {
                    self.aggregator.reset();
                    return Err(err.into());
                }
            }
        }
    }
}
