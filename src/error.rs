use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced by the runtime.
///
/// Per-connection failures (I/O errors, protocol violations) are handled by
/// transitioning that connection's state machine and never cross the
/// connection boundary; the variants here describe what happened locally.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection has not completed its handshake")]
    NotActive,

    #[error("task rejected: pool is saturated or shutting down")]
    Rejected,

    #[error("dispatcher is no longer running")]
    DispatcherGone,

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Framing and payload-level failures.
///
/// Any of these on the read path is a protocol violation for that connection
/// only: the connection transitions to Closing and nothing is dispatched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("declared packet length {declared} exceeds maximum {max}")]
    OversizedPacket { declared: usize, max: usize },

    #[error("declared packet length {declared} is below the opcode field width")]
    UndersizedPacket { declared: usize },

    #[error("payload of {len} bytes does not fit the length field")]
    PayloadTooLarge { len: usize },

    #[error("unknown opcode 0x{0:04x}")]
    UnknownOpcode(u16),

    #[error("unexpected opcode 0x{got:04x} in state {state}")]
    UnexpectedOpcode { got: u16, state: &'static str },

    #[error("payload truncated: needed {needed} more byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("invalid utf-8 in string field at offset {offset}")]
    InvalidString { offset: usize },
}
