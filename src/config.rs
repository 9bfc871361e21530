use std::time::Duration;

use crate::message::INLINE_MESSAGE_MAX_LENGTH;

/// Sentinel for [`ClientConfig::read_timeout_secs`]: never time out a read.
/// Required for connections whose protocol semantics include server-side
/// blocking waits, such as `BLPOP` or a subscription.
pub const NO_READ_TIMEOUT: i64 = -1;

/// Options recognized by the connection and codec layers.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Maximum time to wait for the TCP connect to complete. `None` leaves
    /// the operating system default in place.
    pub connect_timeout: Option<Duration>,
    /// Enable TCP keep-alive on the socket.
    pub keep_alive: bool,
    /// Seconds to wait for the next reply before declaring the connection
    /// dead. [`NO_READ_TIMEOUT`] (or any negative value) disables the timeout.
    pub read_timeout_secs: i64,
    /// Maximum accepted length of a line-delimited message.
    pub max_inline_length: usize,
    /// Whether tag-less inline commands are decoded or rejected.
    pub decode_inline_commands: bool,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            connect_timeout: None,
            keep_alive: false,
            read_timeout_secs: NO_READ_TIMEOUT,
            max_inline_length: INLINE_MESSAGE_MAX_LENGTH,
            decode_inline_commands: false,
        }
    }
}
