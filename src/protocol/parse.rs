/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The incremental RESP3 parser.
//!
//! [`Parser`] is a pull parser over a growing byte buffer: callers append
//! received bytes to a buffer of their own and repeatedly ask for the next
//! node.  The parser walks as far as complete framing allows and never emits
//! a node for a partially buffered frame.  Scalar payloads are borrowed from
//! the caller's buffer, so nothing is copied until a consumer decides to keep
//! the data.
//!
//! The caller owns buffer advancement: once [`Parser::reply_complete`]
//! reports that a top-level reply has been fully emitted, the caller drops
//! the first [`Parser::consumed`] bytes and calls [`Parser::reset`].  The
//! buffer must not be advanced mid-reply; appending is always fine.

use std::str;

use crate::error::Error;
use crate::protocol::node::{AggregateSize, Node, NodeKind};

/// Nesting limit applied before any aggregate frame is opened.
pub const DEFAULT_MAX_NESTED_DEPTH: usize = 64;

/// A header line (or a simple string) must terminate within this many bytes.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug)]
struct Frame {
    kind: NodeKind,
    state: FrameState,
}

#[derive(Debug, PartialEq, Eq)]
enum FrameState {
    /// Element slots that have not completed yet.
    Finite(usize),
    /// Terminates on a zero-length chunk.
    Streamed,
}

/// The incremental parser.  One instance parses one top-level reply at a
/// time; it is reused for the next reply after [`Parser::reset`].
#[derive(Debug)]
pub struct Parser {
    stack: Vec<Frame>,
    /// A blob header has been read and its payload is awaited.
    blob: Option<(NodeKind, usize)>,
    /// Bytes consumed from the start of the buffer.
    pos: usize,
    done: bool,
    max_depth: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser::with_max_depth(DEFAULT_MAX_NESTED_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Parser {
            stack: Vec::new(),
            blob: None,
            pos: 0,
            done: false,
            max_depth,
        }
    }

    /// Parses the next node out of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer ends mid-frame (feed more bytes)
    /// or when the current top-level reply is complete (check
    /// [`Parser::reply_complete`], then advance the buffer and reset).
    pub fn next<'a>(&mut self, buf: &'a [u8]) -> Result<Option<Node<'a>>, Error> {
        loop {
            if self.done {
                return Ok(None);
            }

            // A blob payload is pending from an earlier header line.
            if let Some((kind, len)) = self.blob {
                let start = self.pos;
                if buf.len() < start + len + 2 {
                    return Ok(None);
                }
                if &buf[start + len..start + len + 2] != CRLF {
                    return Err(Error::UnexpectedReadSize);
                }
                self.blob = None;
                self.pos = start + len + 2;
                let data = &buf[start..start + len];
                return Ok(Some(self.emit_scalar(kind, data)));
            }

            let (next_pos, line) = match scan_line(buf, self.pos)? {
                Some(line) => line,
                None => return Ok(None),
            };
            if line.is_empty() {
                return Err(Error::EmptyField);
            }
            let prefix = line[0];
            let body = &line[1..];
            let kind = NodeKind::from_prefix(prefix).ok_or(Error::InvalidPrefix(prefix))?;

            // Inside a streamed blob nothing but chunks may appear.
            if let Some(frame) = self.stack.last() {
                if frame.state == FrameState::Streamed
                    && frame.kind.is_blob()
                    && kind != NodeKind::StreamedStringPart
                {
                    return Err(Error::ExpectsSimpleType);
                }
            }

            self.pos = next_pos;

            match kind {
                NodeKind::SimpleString | NodeKind::SimpleError => {
                    return Ok(Some(self.emit_scalar(kind, body)));
                }
                NodeKind::Double | NodeKind::BigNumber => {
                    if body.is_empty() {
                        return Err(Error::EmptyField);
                    }
                    return Ok(Some(self.emit_scalar(kind, body)));
                }
                NodeKind::Number => {
                    parse_i64(body)?;
                    return Ok(Some(self.emit_scalar(kind, body)));
                }
                NodeKind::Boolean => {
                    if body != b"t" && body != b"f" {
                        return Err(Error::NotABoolean);
                    }
                    return Ok(Some(self.emit_scalar(kind, body)));
                }
                NodeKind::Null => {
                    return Ok(Some(self.emit_scalar(kind, b"")));
                }
                NodeKind::BlobString | NodeKind::BlobError | NodeKind::VerbatimString => {
                    match parse_size(body)? {
                        Header::Streamed => return self.begin_aggregate(kind, None).map(Some),
                        Header::Finite(-1) if kind == NodeKind::BlobString => {
                            // RESP2 nil compatibility
                            return Ok(Some(self.emit_scalar(NodeKind::Null, b"")));
                        }
                        Header::Finite(n) if n < 0 => return Err(Error::IncompatibleSize),
                        Header::Finite(n) => {
                            self.blob = Some((kind, n as usize));
                        }
                    }
                }
                NodeKind::StreamedStringPart => {
                    let len = match parse_size(body)? {
                        Header::Finite(n) if n >= 0 => n as usize,
                        _ => return Err(Error::IncompatibleSize),
                    };
                    let streamed_top = matches!(
                        self.stack.last(),
                        Some(frame) if frame.state == FrameState::Streamed
                    );
                    if !streamed_top {
                        return Err(Error::ExpectsSimpleType);
                    }
                    if len == 0 {
                        // The terminating chunk closes the enclosing frame;
                        // it is emitted so consumers can observe the end of
                        // the stream, but occupies no slot.
                        let depth = self.stack.len();
                        let closed = self.stack.pop();
                        if !matches!(&closed, Some(f) if f.kind == NodeKind::Attribute) {
                            self.complete_child();
                        }
                        return Ok(Some(Node {
                            kind,
                            depth,
                            size: AggregateSize::Finite(1),
                            data: b"",
                        }));
                    }
                    self.blob = Some((kind, len));
                }
                NodeKind::Array
                | NodeKind::Set
                | NodeKind::Map
                | NodeKind::Attribute
                | NodeKind::Push => match parse_size(body)? {
                    Header::Streamed => return self.begin_aggregate(kind, None).map(Some),
                    Header::Finite(-1) if kind == NodeKind::Array => {
                        // RESP2 nil compatibility
                        return Ok(Some(self.emit_scalar(NodeKind::Null, b"")));
                    }
                    Header::Finite(n) if n < 0 => return Err(Error::IncompatibleSize),
                    Header::Finite(n) => {
                        let n = n as usize;
                        if matches!(kind, NodeKind::Map | NodeKind::Attribute) && n % 2 != 0 {
                            return Err(Error::IncompatibleSize);
                        }
                        return self.begin_aggregate(kind, Some(n)).map(Some);
                    }
                },
            }
        }
    }

    /// Whether the current top-level reply has been fully emitted.
    pub fn reply_complete(&self) -> bool {
        self.done
    }

    /// Bytes of the buffer consumed so far for the current reply.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Prepares for the next top-level reply.  The caller must have advanced
    /// its buffer by [`Parser::consumed`] bytes first.
    pub fn reset(&mut self) {
        debug_assert!(self.stack.is_empty());
        self.stack.clear();
        self.blob = None;
        self.pos = 0;
        self.done = false;
    }

    fn emit_scalar<'a>(&mut self, kind: NodeKind, data: &'a [u8]) -> Node<'a> {
        let depth = self.stack.len();
        self.complete_child();
        Node {
            kind,
            depth,
            size: AggregateSize::Finite(1),
            data,
        }
    }

    fn begin_aggregate(
        &mut self,
        kind: NodeKind,
        size: Option<usize>,
    ) -> Result<Node<'static>, Error> {
        let depth = self.stack.len();
        let declared = match size {
            None => AggregateSize::Streamed,
            Some(n) => AggregateSize::Finite(n),
        };
        match size {
            Some(0) => {
                // An empty aggregate is already a complete subtree.
                if kind != NodeKind::Attribute {
                    self.complete_child();
                }
            }
            _ => {
                if self.stack.len() >= self.max_depth {
                    return Err(Error::ExceedsMaxNestedDepth);
                }
                self.stack.push(Frame {
                    kind,
                    state: match size {
                        None => FrameState::Streamed,
                        Some(n) => FrameState::Finite(n),
                    },
                });
            }
        }
        Ok(Node {
            kind,
            depth,
            size: declared,
            data: b"",
        })
    }

    /// One child subtree under the top frame has completed; propagates frame
    /// closure upwards.  Attribute frames are transparent: closing one never
    /// counts towards its parent.
    fn complete_child(&mut self) {
        loop {
            let exhausted = match self.stack.last_mut() {
                None => {
                    self.done = true;
                    return;
                }
                Some(frame) => match &mut frame.state {
                    FrameState::Finite(remaining) => {
                        *remaining -= 1;
                        *remaining == 0
                    }
                    FrameState::Streamed => return,
                },
            };
            if !exhausted {
                return;
            }
            let closed = self.stack.pop();
            if matches!(&closed, Some(f) if f.kind == NodeKind::Attribute) {
                return;
            }
        }
    }
}

/// Looks for the next CRLF-terminated line starting at `start`.  Only
/// returns the line once the terminator is fully buffered; the returned
/// position is the first byte after the terminator.
fn scan_line(buf: &[u8], start: usize) -> Result<Option<(usize, &[u8])>, Error> {
    let mut pos = start;
    loop {
        if pos - start > MAX_LINE_LENGTH {
            return Err(Error::NoCrlf);
        }
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] == b'\r' {
            if pos + 1 >= buf.len() {
                return Ok(None);
            }
            if buf[pos + 1] == b'\n' {
                return Ok(Some((pos + 2, &buf[start..pos])));
            }
        }
        pos += 1;
    }
}

fn parse_i64(bytes: &[u8]) -> Result<i64, Error> {
    if bytes.is_empty() {
        return Err(Error::EmptyField);
    }
    let s = str::from_utf8(bytes).map_err(|_| Error::NotANumber)?;
    s.parse().map_err(|_| Error::NotANumber)
}

enum Header {
    Finite(i64),
    Streamed,
}

fn parse_size(bytes: &[u8]) -> Result<Header, Error> {
    if bytes == b"?" {
        return Ok(Header::Streamed);
    }
    parse_i64(bytes).map(Header::Finite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::node::OwnedNode;

    /// Parses `input` to the end, expecting exactly one complete reply.
    fn parse_reply(input: &[u8]) -> Vec<OwnedNode> {
        let mut parser = Parser::new();
        let mut nodes = Vec::new();
        while let Some(node) = parser.next(input).unwrap() {
            nodes.push(node.to_owned());
        }
        assert!(parser.reply_complete(), "reply should be complete");
        assert_eq!(parser.consumed(), input.len());
        nodes
    }

    fn parse_err(input: &[u8]) -> Error {
        let mut parser = Parser::new();
        loop {
            match parser.next(input) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an error"),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn simple_string() {
        let nodes = parse_reply(b"+OK\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::SimpleString);
        assert_eq!(&nodes[0].data[..], b"OK");
        assert_eq!(nodes[0].depth, 0);
    }

    #[test]
    fn negative_number() {
        let nodes = parse_reply(b":-3\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Number);
        assert_eq!(&nodes[0].data[..], b"-3");
    }

    #[test]
    fn double_is_textual() {
        let nodes = parse_reply(b",1.23\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Double);
        assert_eq!(&nodes[0].data[..], b"1.23");
    }

    #[test]
    fn booleans() {
        let nodes = parse_reply(b"#t\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Boolean);
        assert_eq!(&nodes[0].data[..], b"t");

        assert!(matches!(parse_err(b"#x\r\n"), Error::NotABoolean));
    }

    #[test]
    fn number_with_junk() {
        assert!(matches!(parse_err(b":12ab\r\n"), Error::NotANumber));
    }

    #[test]
    fn invalid_prefix() {
        assert!(matches!(parse_err(b"@5\r\n"), Error::InvalidPrefix(b'@')));
    }

    #[test]
    fn blob_with_embedded_crlf() {
        let input = b"$26\r\nhhaa\x07aaa\raaaaa\r\naaaaaaaaaa\r\n";
        let nodes = parse_reply(input);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::BlobString);
        assert_eq!(&nodes[0].data[..], b"hhaa\x07aaa\raaaaa\r\naaaaaaaaaa");
    }

    #[test]
    fn blob_longer_than_declared() {
        assert!(matches!(
            parse_err(b"$3\r\nabcd\r\n"),
            Error::UnexpectedReadSize
        ));
    }

    #[test]
    fn resp2_nils() {
        let nodes = parse_reply(b"$-1\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Null);
        let nodes = parse_reply(b"*-1\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Null);
    }

    #[test]
    fn flat_map_depths_and_sizes() {
        let nodes = parse_reply(b"%2\r\n$3\r\nkey\r\n$3\r\nval\r\n");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].kind, NodeKind::Map);
        assert_eq!(nodes[0].size, AggregateSize::Finite(2));
        assert_eq!(nodes[0].depth, 0);
        assert_eq!(&nodes[1].data[..], b"key");
        assert_eq!(nodes[1].depth, 1);
        assert_eq!(&nodes[2].data[..], b"val");
        assert_eq!(nodes[2].depth, 1);
    }

    #[test]
    fn odd_map_size_rejected() {
        assert!(matches!(
            parse_err(b"%3\r\n:1\r\n:2\r\n:3\r\n"),
            Error::IncompatibleSize
        ));
    }

    #[test]
    fn nested_array_depths() {
        let nodes = parse_reply(b"*2\r\n*1\r\n:1\r\n#t\r\n");
        let depths: Vec<usize> = nodes.iter().map(|n| n.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
    }

    #[test]
    fn empty_aggregate_completes() {
        let nodes = parse_reply(b"*0\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].size, AggregateSize::Finite(0));
    }

    #[test]
    fn push_frame() {
        let nodes = parse_reply(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n");
        assert_eq!(nodes[0].kind, NodeKind::Push);
        assert_eq!(nodes.len(), 4);
    }

    #[test]
    fn streamed_string() {
        let input = b"$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;1\r\nd\r\n;0\r\n";
        let nodes = parse_reply(input);
        assert_eq!(nodes[0].kind, NodeKind::BlobString);
        assert_eq!(nodes[0].size, AggregateSize::Streamed);
        let parts: Vec<&[u8]> = nodes[1..].iter().map(|n| &n.data[..]).collect();
        assert_eq!(parts, vec![&b"Hell"[..], b"o wor", b"d", b""]);
        assert!(nodes[1..]
            .iter()
            .all(|n| n.kind == NodeKind::StreamedStringPart && n.depth == 1));
    }

    #[test]
    fn streamed_array_terminates_on_empty_chunk() {
        let input = b"*?\r\n:1\r\n:2\r\n;0\r\n";
        let nodes = parse_reply(input);
        assert_eq!(nodes[0].size, AggregateSize::Streamed);
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[3].kind, NodeKind::StreamedStringPart);
        assert!(nodes[3].data.is_empty());
    }

    #[test]
    fn chunk_outside_streamed_frame() {
        assert!(matches!(parse_err(b";4\r\nabcd\r\n"), Error::ExpectsSimpleType));
    }

    #[test]
    fn attribute_is_transparent_at_top_level() {
        let mut parser = Parser::new();
        let input = b"|2\r\n+ttl\r\n:3600\r\n:42\r\n";
        let mut nodes = Vec::new();
        while let Some(node) = parser.next(input).unwrap() {
            nodes.push(node.to_owned());
            if nodes.len() == 3 {
                // The whole attribute subtree is in, the reply is not done.
                assert!(!parser.reply_complete());
            }
        }
        assert!(parser.reply_complete());
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].kind, NodeKind::Attribute);
        assert_eq!(nodes[3].kind, NodeKind::Number);
        assert_eq!(nodes[3].depth, 0);
    }

    #[test]
    fn attribute_does_not_consume_parent_slot() {
        // An attribute preceding the second element of a two-element array.
        let input = b"*2\r\n:1\r\n|2\r\n+k\r\n+v\r\n:2\r\n";
        let nodes = parse_reply(input);
        assert_eq!(nodes.last().unwrap().kind, NodeKind::Number);
        assert_eq!(&nodes.last().unwrap().data[..], b"2");
    }

    #[test]
    fn depth_limit() {
        let mut parser = Parser::with_max_depth(2);
        let input = b"*1\r\n*1\r\n*1\r\n:1\r\n";
        let err = loop {
            match parser.next(input) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected depth error"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::ExceedsMaxNestedDepth));
    }

    #[test]
    fn needs_more_reports_nothing_partial() {
        let full = b"*2\r\n$3\r\nfoo\r\n:42\r\n";
        let reference = parse_reply(full);

        // Growing the buffer byte by byte must produce the same node
        // sequence, with no node emitted twice and none emitted early.
        let mut parser = Parser::new();
        let mut nodes = Vec::new();
        for end in 0..=full.len() {
            while let Some(node) = parser.next(&full[..end]).unwrap() {
                nodes.push(node.to_owned());
            }
        }
        assert!(parser.reply_complete());
        assert_eq!(nodes, reference);
    }

    #[test]
    fn two_replies_back_to_back() {
        let mut buf = Vec::from(&b"+first\r\n+second\r\n"[..]);
        let mut parser = Parser::new();

        let node = parser.next(&buf).unwrap().unwrap();
        assert_eq!(node.data, b"first");
        assert!(parser.reply_complete());
        let consumed = parser.consumed();
        buf.drain(..consumed);
        parser.reset();

        let node = parser.next(&buf).unwrap().unwrap();
        assert_eq!(node.data, b"second");
        assert!(parser.reply_complete());
    }

    #[test]
    fn server_errors_are_data() {
        let nodes = parse_reply(b"-ERR unknown command\r\n");
        assert_eq!(nodes[0].kind, NodeKind::SimpleError);
        assert_eq!(&nodes[0].data[..], b"ERR unknown command");

        let nodes = parse_reply(b"!10\r\nSYNTAX err\r\n");
        assert_eq!(nodes[0].kind, NodeKind::BlobError);
        assert_eq!(&nodes[0].data[..], b"SYNTAX err");
    }

    #[test]
    fn verbatim_string_keeps_format_prefix() {
        let nodes = parse_reply(b"=15\r\ntxt:Some string\r\n");
        assert_eq!(nodes[0].kind, NodeKind::VerbatimString);
        assert_eq!(&nodes[0].data[..], b"txt:Some string");
    }
}
