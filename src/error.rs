/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error handling

use std::{error, fmt, io};

use crate::protocol::node::NodeKind;

/// All errors the crate can produce.
///
/// Parser errors (`InvalidPrefix` through `ExceedsMaxNestedDepth`) mean the
/// byte stream has desynchronised; the connection that produced them is torn
/// down and re-established.  Adapter errors (`WrongType`, `NullUnexpected`,
/// `SizeMismatch`, and the `NotA*` kinds when raised while adapting) fail one
/// request only, the stream position is unaffected.
#[derive(Debug)]
pub enum Error {
    /// An IO error occurred
    IO(io::Error),

    /// An unknown RESP3 type byte was read
    InvalidPrefix(u8),

    /// A scalar frame was expected at this point of the stream
    ExpectsSimpleType,

    /// An aggregate frame was expected at this point of the stream
    ExpectsAggregateType,

    /// A line was not terminated with CRLF within a reasonable length
    NoCrlf,

    /// A field that should contain a decimal integer did not
    NotANumber,

    /// A field that should contain a double did not
    NotADouble,

    /// A boolean frame contained something other than `t` or `f`
    NotABoolean,

    /// An aggregate size was out of range for its kind
    IncompatibleSize,

    /// A header field that must not be empty was empty
    EmptyField,

    /// A blob frame carried bytes beyond its declared length
    UnexpectedReadSize,

    /// The reply tree is nested deeper than the configured limit
    ExceedsMaxNestedDepth,

    /// A reply node could not be assigned to the requested target type
    WrongType {
        expected: &'static str,
        found: NodeKind,
    },

    /// A `null` reply was delivered to a non-optional target
    NullUnexpected,

    /// The declared size of a reply does not match the target's arity
    SizeMismatch { expected: usize, found: usize },

    /// An error reported by the server as part of a reply
    Remote(ServerError),

    /// The connection is not in a state that allows the operation
    Connection(ConnectionReason),

    /// A non-specific internal error that prevented an operation from
    /// completing
    Internal(String),

    /// The stream ended before a complete reply was read
    EndOfStream,
}

impl Error {
    pub(crate) fn wrong_type(expected: &'static str, found: NodeKind) -> Error {
        Error::WrongType { expected, found }
    }
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IO(err) => write!(f, "IO error: {}", err),
            Error::InvalidPrefix(b) => write!(f, "Invalid RESP3 type byte: 0x{:02x}", b),
            Error::ExpectsSimpleType => write!(f, "Expected a RESP3 simple type"),
            Error::ExpectsAggregateType => write!(f, "Expected a RESP3 aggregate type"),
            Error::NoCrlf => write!(f, "Missing CRLF line terminator"),
            Error::NotANumber => write!(f, "Field is not a number"),
            Error::NotADouble => write!(f, "Field is not a double"),
            Error::NotABoolean => write!(f, "Field is not a boolean"),
            Error::IncompatibleSize => write!(f, "Aggregate size out of range"),
            Error::EmptyField => write!(f, "Field is empty"),
            Error::UnexpectedReadSize => {
                write!(f, "Blob carries more bytes than its declared length")
            }
            Error::ExceedsMaxNestedDepth => write!(f, "Reply nested deeper than the allowed limit"),
            Error::WrongType { expected, found } => {
                write!(f, "Cannot read {} into {}", found, expected)
            }
            Error::NullUnexpected => write!(f, "Unexpected null reply"),
            Error::SizeMismatch { expected, found } => {
                write!(f, "Size mismatch: expected {}, found {}", expected, found)
            }
            Error::Remote(e) => write!(f, "Server error: {}", e),
            Error::Connection(reason) => write!(f, "Connection error: {}", reason),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::EndOfStream => write!(f, "End of stream"),
        }
    }
}

/// An error reported by the server itself, e.g. `-ERR unknown command`.
///
/// These are data, not protocol violations: the stream stays usable.  A
/// remote error fails the affected request unless the target captures it,
/// which `Result<T, ServerError>` targets do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    kind: ServerErrorKind,
    message: String,
}

/// Whether a server error arrived as a simple error or a blob error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Simple,
    Blob,
}

impl ServerError {
    pub(crate) fn new(kind: ServerErrorKind, message: String) -> Self {
        ServerError { kind, message }
    }

    pub fn kind(&self) -> ServerErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The leading word of the message, conventionally an error code such as
    /// `ERR` or `WRONGTYPE`.
    pub fn code(&self) -> &str {
        self.message
            .split_whitespace()
            .next()
            .unwrap_or(&self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Details of the connection-level failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// The operation requires a running connection and there is none
    NotConnected,
    /// No connection attempt succeeded
    ConnectionFailed,
    /// The `HELLO` handshake was rejected by the server
    HandshakeFailed,
    /// An established connection was lost
    ConnectionLost,
    /// The operation was cancelled
    Cancelled,
    /// A health-check `PING` went unanswered for too long
    IdleTimeout,
    /// Name resolution did not complete in time
    ResolveTimeout,
    /// The transport could not be connected in time
    ConnectTimeout,
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionReason::NotConnected => "not connected",
            ConnectionReason::ConnectionFailed => "connection failed",
            ConnectionReason::HandshakeFailed => "handshake failed",
            ConnectionReason::ConnectionLost => "connection lost",
            ConnectionReason::Cancelled => "cancelled",
            ConnectionReason::IdleTimeout => "idle timeout",
            ConnectionReason::ResolveTimeout => "resolve timeout",
            ConnectionReason::ConnectTimeout => "connect timeout",
        };
        f.write_str(s)
    }
}
