/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Typed response targets.
//!
//! A reply arrives as a stream of [`Node`]s; an adapter consumes the nodes of
//! exactly one top-level reply and builds a value out of them.  Implementing
//! [`FromResp3`] on a type makes it a valid target for a single reply;
//! [`Response`] describes the target of a whole request: a tuple with one
//! [`FromResp3`] element per expected reply, so a lone `PING` is read with
//! `(String,)` and a pipeline with e.g. `((), Option<String>)`.
//! [`Transaction`](crate::adapter::Transaction) unwraps an `EXEC` reply into
//! its queued sub-replies, and [`NodeTree`](crate::protocol::node::NodeTree)
//! captures any reply verbatim.
//!
//! Adapters fail fast: the first node that cannot be assigned to the target
//! produces a typed error, which fails the request without desynchronising
//! the connection.  Attribute subtrees are discarded before adapters see
//! them.

pub mod aggregate;
pub mod primitive;
pub mod tuple;

use std::str;

pub use aggregate::Transaction;

use crate::error::{Error, ServerError, ServerErrorKind};
use crate::protocol::node::{AggregateSize, Node, NodeKind};

/// Consumes the node stream of one top-level reply.
pub trait NodeAdapter: Send {
    type Output;

    /// Accepts the next node of the reply, in document order; the root
    /// arrives first with depth 0.
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error>;

    /// Whether the adapter has seen a full reply.
    fn is_complete(&self) -> bool;

    /// Extracts the adapted value.  Called once, after the reply completed.
    fn finish(&mut self) -> Result<Self::Output, Error>;
}

/// Types that can be read from a single RESP3 reply.
///
/// Implementations exist for the unit type (any reply, ignored), integers,
/// `bool`, `f64`, `String`, `Vec<u8>`, `Option<T>`, `Vec<T>`, maps, sets,
/// [`NodeTree`](crate::protocol::node::NodeTree), `Result<T, ServerError>`
/// (capturing server errors as data) and [`Transaction`].
pub trait FromResp3: Send + Sized + 'static {
    type Adapter: NodeAdapter<Output = Self> + 'static;

    fn adapter() -> Self::Adapter;
}

/// Consumes every reply of one request.
pub trait ResponseSink: Send {
    type Output;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error>;

    /// Called after each complete top-level reply.
    fn end_reply(&mut self);

    fn finish(&mut self) -> Result<Self::Output, Error>;
}

/// The target of a whole request: one sub-target per expected reply.
///
/// Implemented for tuples up to arity eight, with one [`FromResp3`] element
/// per reply, and for [`Ignore`], which matches any number of replies.
pub trait Response: Send + Sized + 'static {
    type Sink: ResponseSink<Output = Self> + 'static;

    /// Number of top-level replies this target consumes, `None` for "any".
    const REPLIES: Option<usize>;

    fn sink() -> Self::Sink;
}

/// Discards any number of replies; the response target for requests whose
/// results are of no interest, whatever their shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ignore;

pub struct IgnoreSink;

impl ResponseSink for IgnoreSink {
    type Output = Ignore;

    fn on_node(&mut self, _node: &Node<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn end_reply(&mut self) {}

    fn finish(&mut self) -> Result<Ignore, Error> {
        Ok(Ignore)
    }
}

impl Response for Ignore {
    type Sink = IgnoreSink;
    const REPLIES: Option<usize> = None;

    fn sink() -> IgnoreSink {
        IgnoreSink
    }
}

/// Mirrors the parser's frame accounting over an already-parsed node stream,
/// so adapters can tell when a subtree rooted at the first pushed node has
/// closed.  Unlike the parser, attribute frames count like any other
/// aggregate here: the guard is also what the attribute filter uses to skip
/// a whole attribute subtree.
#[derive(Debug, Default)]
pub(crate) struct TreeGuard {
    stack: Vec<GuardFrame>,
    done: bool,
}

#[derive(Debug)]
enum GuardFrame {
    Finite(usize),
    Streamed,
}

impl TreeGuard {
    pub(crate) fn new() -> Self {
        TreeGuard::default()
    }

    pub(crate) fn push_node(&mut self, node: &Node<'_>) {
        if self.done {
            return;
        }
        if node.kind.is_aggregate() || (node.kind.is_blob() && node.size.is_streamed()) {
            match node.size {
                AggregateSize::Streamed => self.stack.push(GuardFrame::Streamed),
                AggregateSize::Finite(0) => self.complete_child(),
                AggregateSize::Finite(n) => self.stack.push(GuardFrame::Finite(n)),
            }
            return;
        }
        if node.kind == NodeKind::StreamedStringPart {
            if node.data.is_empty() {
                // terminator: closes the enclosing streamed frame
                self.stack.pop();
                self.complete_child();
            }
            return;
        }
        self.complete_child();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done
    }

    fn complete_child(&mut self) {
        loop {
            let exhausted = match self.stack.last_mut() {
                None => {
                    self.done = true;
                    return;
                }
                Some(GuardFrame::Finite(remaining)) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                Some(GuardFrame::Streamed) => return,
            };
            if !exhausted {
                return;
            }
            self.stack.pop();
        }
    }
}

/// Drops attribute subtrees out of a node stream before they reach an
/// adapter.  Attributes are metadata the server attaches to a reply; no
/// built-in target consumes them.
#[derive(Debug, Default)]
pub(crate) struct AttributeFilter {
    skip: Option<TreeGuard>,
}

impl AttributeFilter {
    /// Returns `true` when the node should be forwarded to the adapter.
    pub(crate) fn admit(&mut self, node: &Node<'_>) -> bool {
        if let Some(guard) = self.skip.as_mut() {
            guard.push_node(node);
            if guard.is_complete() {
                self.skip = None;
            }
            return false;
        }
        if node.kind == NodeKind::Attribute {
            let mut guard = TreeGuard::new();
            guard.push_node(node);
            if !guard.is_complete() {
                self.skip = Some(guard);
            }
            return false;
        }
        true
    }
}

/// Reads a server error out of a node, if the node is one.
pub(crate) fn remote_error(node: &Node<'_>) -> Option<ServerError> {
    let kind = match node.kind {
        NodeKind::SimpleError => ServerErrorKind::Simple,
        NodeKind::BlobError => ServerErrorKind::Blob,
        _ => return None,
    };
    Some(ServerError::new(
        kind,
        String::from_utf8_lossy(node.data).into_owned(),
    ))
}

pub(crate) fn parse_int(bytes: &[u8]) -> Result<i64, Error> {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::NotANumber)
}

/// The unit type discards exactly one reply of any shape; server errors at
/// the reply root still fail it.
pub struct UnitAdapter {
    guard: TreeGuard,
    started: bool,
    remote: Option<ServerError>,
}

impl NodeAdapter for UnitAdapter {
    type Output = ();

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if !self.started {
            self.started = true;
            self.remote = remote_error(node);
        }
        self.guard.push_node(node);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.started && self.guard.is_complete()
    }

    fn finish(&mut self) -> Result<(), Error> {
        match self.remote.take() {
            Some(err) => Err(Error::Remote(err)),
            None => Ok(()),
        }
    }
}

impl FromResp3 for () {
    type Adapter = UnitAdapter;

    fn adapter() -> UnitAdapter {
        UnitAdapter {
            guard: TreeGuard::new(),
            started: false,
            remote: None,
        }
    }
}

#[cfg(test)]
pub(crate) fn run_response<T: Response>(input: &[u8]) -> Result<T, Error> {
    use crate::protocol::parse::Parser;

    // Mirrors the engine's reader: parse reply by reply, filter attributes,
    // record the first adapter error but keep draining the stream.
    let mut parser = Parser::new();
    let mut sink = T::sink();
    let mut filter = AttributeFilter::default();
    let mut failed: Option<Error> = None;
    let mut buf = input;
    loop {
        if parser.reply_complete() {
            buf = &buf[parser.consumed()..];
            parser.reset();
            sink.end_reply();
            filter = AttributeFilter::default();
            if buf.is_empty() {
                break;
            }
            continue;
        }
        match parser.next(buf)? {
            Some(node) => {
                if filter.admit(&node) && failed.is_none() {
                    if let Err(e) = sink.on_node(&node) {
                        failed = Some(e);
                    }
                }
            }
            None => panic!("test input ended mid-reply"),
        }
    }
    match failed {
        Some(e) => Err(e),
        None => sink.finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_ignores_any_shape() {
        run_response::<((),)>(b"+OK\r\n").unwrap();
        run_response::<((),)>(b"*2\r\n:1\r\n*1\r\n:2\r\n").unwrap();
    }

    #[test]
    fn unit_reports_server_errors() {
        let err = run_response::<((),)>(b"-ERR boom\r\n").unwrap_err();
        match err {
            Error::Remote(e) => assert_eq!(e.code(), "ERR"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn attributes_are_invisible() {
        // An attribute before the reply and one inside an aggregate.
        let (n,): (i64,) = run_response(b"|2\r\n+ttl\r\n:3600\r\n:42\r\n").unwrap();
        assert_eq!(n, 42);

        let (v,): (Vec<i64>,) = run_response(b"*2\r\n:1\r\n|2\r\n+k\r\n+v\r\n:2\r\n").unwrap();
        assert_eq!(v, vec![1, 2]);
    }

    #[test]
    fn ignore_accepts_any_reply_count() {
        run_response::<Ignore>(b"+OK\r\n+OK\r\n+OK\r\n").unwrap();
    }
}
