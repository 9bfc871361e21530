use bytes::BytesMut;

use crate::codec::ProtocolError;
use crate::message::Message;

/// An in-progress array: the announced element count and the children
/// collected so far. A frame is popped and wrapped into a composite
/// [`Message::Array`] exactly when it is full.
#[derive(Debug)]
struct AggregationFrame {
    expected: usize,
    children: Vec<Message>,
}

/// An in-progress bulk string being reassembled from content chunks.
#[derive(Debug)]
struct BulkBuffer {
    bytes: BytesMut,
}

/// Folds the decoder's flat message stream into fully materialized messages.
///
/// Bulk string headers and content chunks are reassembled into
/// [`Message::Bulk`], and array headers plus the right number of following
/// elements into [`Message::Array`]. Nested arrays are tracked as a stack of
/// frames; completing an inner array may complete its parent, so completion
/// cascades through the stack in one step.
#[derive(Debug, Default)]
pub struct Aggregator {
    stack: Vec<AggregationFrame>,
    bulk: Option<BulkBuffer>,
}

/// Arrays are stored as `Vec<Message>`; lengths beyond `u32::MAX` elements
/// are rejected rather than silently truncated.
const MAX_ARRAY_LENGTH: i64 = u32::MAX as i64;

impl Aggregator {
    pub fn new() -> Aggregator {
        Aggregator::default()
    }

    /// Discards all partial state. Must be called when the owning decoder is
    /// reset due to a protocol error.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.bulk = None;
    }

    /// Consumes one decoder output message. Returns a message only when it is
    /// fully materialized and belongs to no enclosing array.
    pub fn push(&mut self, message: Message) -> Result<Option<Message>, ProtocolError> {
        match self.fold_bulk(message)? {
            Some(message) => self.fold_array(message),
            None => Ok(None),
        }
    }

    fn fold_bulk(&mut self, message: Message) -> Result<Option<Message>, ProtocolError> {
        match message {
            Message::BulkHeader(length) => {
                self.bulk = Some(BulkBuffer {
                    bytes: BytesMut::with_capacity(length),
                });
                Ok(None)
            }
            Message::BulkChunk { bytes, is_last } => {
                let Some(mut bulk) = self.bulk.take() else {
                    return Err(ProtocolError::UnexpectedChunk);
                };
                bulk.bytes.extend_from_slice(&bytes);
                if !is_last {
                    self.bulk = Some(bulk);
                    return Ok(None);
                }
                Ok(Some(Message::Bulk(Some(bulk.bytes.freeze()))))
            }
            other => Ok(Some(other)),
        }
    }

    fn fold_array(&mut self, message: Message) -> Result<Option<Message>, ProtocolError> {
        let mut message = match message {
            Message::ArrayHeader(length) => match self.decode_array_header(length)? {
                Some(message) => message,
                // A frame was pushed; output comes once it fills.
                None => return Ok(None),
            },
            other => other,
        };

        while let Some(mut top) = self.stack.pop() {
            top.children.push(message);
            if top.children.len() < top.expected {
                self.stack.push(top);
                return Ok(None);
            }
            // The frame is full: wrap it and hand the composite to the parent
            // frame, which may complete in turn.
            message = Message::Array(Some(top.children));
        }

        Ok(Some(message))
    }

    fn decode_array_header(&mut self, length: i64) -> Result<Option<Message>, ProtocolError> {
        match length {
            -1 => Ok(Some(Message::Array(None))),
            0 => Ok(Some(Message::Array(Some(Vec::new())))),
            l if l < -1 => Err(ProtocolError::BadLength(l)),
            l if l > MAX_ARRAY_LENGTH => Err(ProtocolError::ArrayTooLarge(l)),
            l => {
                self.stack.push(AggregationFrame {
                    expected: l as usize,
                    children: Vec::with_capacity(l as usize),
                });
                Ok(None)
            }
        }
    }
}
