/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A RESP3 client core for Redis-compatible servers, using Tokio and
//! Futures.
//!
//! The crate provides a single long-lived, full-duplex connection that
//! multiplexes concurrent pipelined requests over one socket.  Requests are
//! built with [`Request`], submitted through
//! [`MultiplexedConnection::exec`](client::MultiplexedConnection::exec), and
//! their replies adapted into ordinary Rust types; replies complete in
//! submission order however many submitters share the connection.  Server
//! push frames (pub/sub messages, client-side cache invalidations) are
//! separated from command replies and delivered on their own stream.
//!
//! ## Connecting and running commands
//!
//! ```no_run
//! use resp3_async::{client, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), resp3_async::Error> {
//!     let connection = client::connect("127.0.0.1", 6379).await?;
//!
//!     let mut req = Request::new();
//!     req.push("SET", ("greeting", "hello"));
//!     req.push("GET", ("greeting",));
//!     let ((), value): ((), Option<String>) = connection.exec(req).await?;
//!     assert_eq!(value.as_deref(), Some("hello"));
//!     Ok(())
//! }
//! ```
//!
//! Response targets are tuples with one element per expected reply; see the
//! [`adapter`] module for the available element types, including
//! [`adapter::Transaction`] for `MULTI`/`EXEC` pipelines and
//! [`protocol::NodeTree`] for replies of unknown shape.
//!
//! ## Layers
//!
//! * [`protocol`]: the RESP3 taxonomy, the incremental zero-copy parser
//!   and the request builder.
//! * [`adapter`]: typed response targets driven node by node.
//! * [`client`]: the multiplexed connection engine (handshake, health
//!   checks, reconnection) and a low-level single-shot connection.

pub mod adapter;
pub mod client;
pub mod error;
pub mod protocol;

mod task;

pub use crate::client::{ConnectionBuilder, MultiplexedConnection};
pub use crate::error::Error;
pub use crate::protocol::{Request, RequestConfig};
