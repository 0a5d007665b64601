/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A low-level connection: write requests, read replies one at a time.
//!
//! This surface makes no attempt at multiplexing; pairing replies to
//! commands is up to the caller, which makes it suitable as a building block
//! and for protocol exploration.  Most applications want
//! [`MultiplexedConnection`](crate::client::MultiplexedConnection) instead.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::adapter::{AttributeFilter, FromResp3, NodeAdapter};
use crate::error::{ConnectionReason, Error};
use crate::protocol::node::{NodeKind, NodeTree};
use crate::protocol::parse::Parser;
use crate::protocol::request::Request;

const READ_BUFFER_CAPACITY: usize = 4096;

/// A plain framed connection over any bidirectional byte stream.
pub struct RawConnection<S = TcpStream> {
    stream: S,
    buf: BytesMut,
    parser: Parser,
    pushes: VecDeque<NodeTree>,
}

impl RawConnection<TcpStream> {
    /// Connects over TCP; tries every resolved address in order.
    pub async fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(RawConnection::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Error::IO)
            .unwrap_or(Error::Connection(ConnectionReason::ConnectionFailed)))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> RawConnection<S> {
    pub fn new(stream: S) -> Self {
        RawConnection {
            stream,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            parser: Parser::new(),
            pushes: VecDeque::new(),
        }
    }

    /// Writes a request's payload in one contiguous unit.
    pub async fn send(&mut self, req: &Request) -> Result<(), Error> {
        self.stream.write_all(req.payload_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly one top-level reply into the target type.
    ///
    /// Push frames encountered on the way are not replies: they are set
    /// aside (see [`RawConnection::take_push`]) and reading continues until
    /// a non-push reply completes.
    pub async fn read_one<T: FromResp3>(&mut self) -> Result<T, Error> {
        let mut adapter = T::adapter();
        let mut filter = AttributeFilter::default();
        let mut failed: Option<Error> = None;
        let mut push: Option<NodeTree> = None;

        loop {
            loop {
                if self.parser.reply_complete() {
                    let consumed = self.parser.consumed();
                    self.buf.advance(consumed);
                    self.parser.reset();
                    match push.take() {
                        Some(tree) => {
                            self.pushes.push_back(tree);
                            continue;
                        }
                        None => {
                            return match failed.take() {
                                Some(e) => Err(e),
                                None => adapter.finish(),
                            };
                        }
                    }
                }
                match self.parser.next(&self.buf)? {
                    Some(node) => {
                        if push.is_some() || (node.depth == 0 && node.kind == NodeKind::Push) {
                            push.get_or_insert_with(NodeTree::default)
                                .nodes
                                .push(node.to_owned());
                        } else if filter.admit(&node) && failed.is_none() {
                            if let Err(e) = adapter.on_node(&node) {
                                failed = Some(e);
                            }
                        }
                    }
                    None => break,
                }
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::EndOfStream);
            }
        }
    }

    /// The oldest push frame received while reading replies, if any.
    pub fn take_push(&mut self) -> Option<NodeTree> {
        self.pushes.pop_front()
    }

    /// Tears the connection down.
    pub fn close(self) -> S {
        self.stream
    }
}
