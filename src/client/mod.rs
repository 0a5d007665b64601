/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The client API itself.
//!
//! Two surfaces are provided:
//!
//! * [`connect`] / [`ConnectionBuilder`] return a [`MultiplexedConnection`]:
//!   one long-lived socket multiplexing concurrent pipelined requests, with
//!   automatic handshake, health checks and reconnection.  This is the
//!   interface almost every application wants.
//! * [`RawConnection`] is the low-level interface: write a request, read a
//!   reply, no multiplexing and no reconnection.  It exists so higher-level
//!   functionality can be built and tested against the bare protocol.

pub mod builder;
pub mod hello;
pub mod multiplexed;
pub mod raw;

pub use self::builder::ConnectionBuilder;
pub use self::hello::ServerEndpoint;
pub use self::multiplexed::{ConnectionState, MultiplexedConnection, PushStream};
pub use self::raw::RawConnection;

use crate::error::Error;

/// Connects to a server with default settings, spawning the connection's
/// run loop on the current runtime.  Use [`ConnectionBuilder`] for
/// credentials, timeouts, or control over the run loop.
pub async fn connect(
    host: impl Into<String>,
    port: u16,
) -> Result<MultiplexedConnection, Error> {
    ConnectionBuilder::new(host, port).connect().await
}
