/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The RESP3 type taxonomy.
//!
//! Every value on the wire is a tree of frames; the parser flattens that tree
//! into a stream of [`Node`]s in document order.  A node records its kind, its
//! nesting depth below the current top-level reply (root = 0), the declared
//! size for aggregates, and a borrowed view of its payload bytes.

use std::fmt;

use bytes::Bytes;

/// Every frame kind RESP3 defines, selected by a one-byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// `+` a short line of text
    SimpleString,
    /// `-` an error as a line of text
    SimpleError,
    /// `:` a signed 64-bit integer
    Number,
    /// `,` a double, kept textual
    Double,
    /// `#` a boolean, `t` or `f`
    Boolean,
    /// `(` an arbitrarily large integer, kept textual
    BigNumber,
    /// `_` the absence of a value
    Null,
    /// `$` a length-prefixed byte string
    BlobString,
    /// `!` an error as a length-prefixed byte string
    BlobError,
    /// `=` a blob with a three-character format prefix, e.g. `txt:`
    VerbatimString,
    /// `;` one chunk of a streamed blob; a zero-length chunk terminates the
    /// enclosing streamed frame
    StreamedStringPart,
    /// `*` an ordered sequence of frames
    Array,
    /// `~` an unordered sequence of frames
    Set,
    /// `%` alternating key and value frames
    Map,
    /// `|` metadata attached to the frame that follows it
    Attribute,
    /// `>` a server-initiated, out-of-band message
    Push,
}

impl NodeKind {
    /// Maps a type byte to its kind, `None` for bytes outside the protocol.
    pub fn from_prefix(prefix: u8) -> Option<NodeKind> {
        let kind = match prefix {
            b'+' => NodeKind::SimpleString,
            b'-' => NodeKind::SimpleError,
            b':' => NodeKind::Number,
            b',' => NodeKind::Double,
            b'#' => NodeKind::Boolean,
            b'(' => NodeKind::BigNumber,
            b'_' => NodeKind::Null,
            b'$' => NodeKind::BlobString,
            b'!' => NodeKind::BlobError,
            b'=' => NodeKind::VerbatimString,
            b';' => NodeKind::StreamedStringPart,
            b'*' => NodeKind::Array,
            b'~' => NodeKind::Set,
            b'%' => NodeKind::Map,
            b'|' => NodeKind::Attribute,
            b'>' => NodeKind::Push,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether this kind carries an element-count header rather than data.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            NodeKind::Array | NodeKind::Set | NodeKind::Map | NodeKind::Attribute | NodeKind::Push
        )
    }

    /// Whether this kind is a blob whose header may carry the streamed
    /// sentinel instead of a length.
    pub fn is_blob(self) -> bool {
        matches!(
            self,
            NodeKind::BlobString | NodeKind::BlobError | NodeKind::VerbatimString
        )
    }

    /// Whether this kind denotes a server-reported error.
    pub fn is_error(self) -> bool {
        matches!(self, NodeKind::SimpleError | NodeKind::BlobError)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NodeKind::SimpleString => "simple-string",
            NodeKind::SimpleError => "simple-error",
            NodeKind::Number => "number",
            NodeKind::Double => "double",
            NodeKind::Boolean => "boolean",
            NodeKind::BigNumber => "big-number",
            NodeKind::Null => "null",
            NodeKind::BlobString => "blob-string",
            NodeKind::BlobError => "blob-error",
            NodeKind::VerbatimString => "verbatim-string",
            NodeKind::StreamedStringPart => "streamed-string-part",
            NodeKind::Array => "array",
            NodeKind::Set => "set",
            NodeKind::Map => "map",
            NodeKind::Attribute => "attribute",
            NodeKind::Push => "push",
        };
        f.write_str(s)
    }
}

/// The declared size of a frame.
///
/// For finite aggregates this is the element-slot count from the header; maps
/// and attributes declare the flat count, i.e. twice the number of pairs.
/// Scalars always report `Finite(1)`.  `Streamed` marks a frame whose header
/// carried the `?` sentinel and which terminates on a zero-length chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateSize {
    Finite(usize),
    Streamed,
}

impl AggregateSize {
    pub fn finite(self) -> Option<usize> {
        match self {
            AggregateSize::Finite(n) => Some(n),
            AggregateSize::Streamed => None,
        }
    }

    pub fn is_streamed(self) -> bool {
        matches!(self, AggregateSize::Streamed)
    }
}

/// One parsed frame, borrowing its payload from the read buffer.
///
/// The borrow is only valid until the parser's buffer is advanced or
/// extended; consumers that keep node data copy it first, see [`OwnedNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node<'a> {
    pub kind: NodeKind,
    /// Nesting level below the current top-level reply, root = 0.
    pub depth: usize,
    pub size: AggregateSize,
    /// Scalar payload bytes; empty for aggregates and `null`.
    pub data: &'a [u8],
}

impl<'a> Node<'a> {
    pub fn to_owned(&self) -> OwnedNode {
        OwnedNode {
            kind: self.kind,
            depth: self.depth,
            size: self.size,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// A [`Node`] that owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedNode {
    pub kind: NodeKind,
    pub depth: usize,
    pub size: AggregateSize,
    pub data: Bytes,
}

/// A whole reply captured verbatim as its flattened node list, in document
/// order.  This is the generic target for replies whose shape is not known
/// up front, and the payload type of server push frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTree {
    pub nodes: Vec<OwnedNode>,
}

impl NodeTree {
    pub fn root(&self) -> Option<&OwnedNode> {
        self.nodes.first()
    }

    pub fn is_push(&self) -> bool {
        matches!(self.root(), Some(node) if node.kind == NodeKind::Push)
    }

    /// The scalar children directly below the root, lossily decoded.  Push
    /// frames are flat in practice, so this is the common way to inspect one.
    pub fn flat_strings(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.depth == 1 && !n.kind.is_aggregate())
            .map(|n| String::from_utf8_lossy(&n.data).into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trip() {
        for b in 0u8..=255 {
            if let Some(kind) = NodeKind::from_prefix(b) {
                let expected = match kind {
                    NodeKind::SimpleString => b'+',
                    NodeKind::SimpleError => b'-',
                    NodeKind::Number => b':',
                    NodeKind::Double => b',',
                    NodeKind::Boolean => b'#',
                    NodeKind::BigNumber => b'(',
                    NodeKind::Null => b'_',
                    NodeKind::BlobString => b'$',
                    NodeKind::BlobError => b'!',
                    NodeKind::VerbatimString => b'=',
                    NodeKind::StreamedStringPart => b';',
                    NodeKind::Array => b'*',
                    NodeKind::Set => b'~',
                    NodeKind::Map => b'%',
                    NodeKind::Attribute => b'|',
                    NodeKind::Push => b'>',
                };
                assert_eq!(b, expected);
            }
        }
    }

    #[test]
    fn aggregate_classification() {
        assert!(NodeKind::Map.is_aggregate());
        assert!(NodeKind::Push.is_aggregate());
        assert!(!NodeKind::BlobString.is_aggregate());
        assert!(NodeKind::BlobError.is_error());
        assert!(!NodeKind::Null.is_error());
    }
}
