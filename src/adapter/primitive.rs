/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Adapters for scalar targets.

use std::marker::PhantomData;

use crate::error::{self, Error};
use crate::protocol::node::{Node, NodeKind};

use super::{parse_int, remote_error, FromResp3, NodeAdapter};

/// Adapts one reply into an integer.
///
/// Numbers are taken directly; booleans map to 0/1; textual kinds are parsed
/// as decimal, so a reply like `+OK` fails with `NotANumber` rather than a
/// type error, mirroring how the server itself transmits numbers as text.
pub struct IntegerAdapter<T> {
    value: Option<i64>,
    _target: PhantomData<T>,
}

impl<T> IntegerAdapter<T> {
    fn new() -> Self {
        IntegerAdapter {
            value: None,
            _target: PhantomData,
        }
    }
}

impl<T> NodeAdapter for IntegerAdapter<T>
where
    T: TryFrom<i64> + Send,
{
    type Output = T;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if let Some(err) = remote_error(node) {
            return Err(Error::Remote(err));
        }
        let value = match node.kind {
            NodeKind::Number => parse_int(node.data)?,
            NodeKind::Boolean => i64::from(node.data == b"t"),
            NodeKind::SimpleString
            | NodeKind::BlobString
            | NodeKind::VerbatimString
            | NodeKind::BigNumber
            | NodeKind::Double => parse_int(node.data)?,
            NodeKind::Null => return Err(Error::NullUnexpected),
            other => return Err(Error::wrong_type("number", other)),
        };
        self.value = Some(value);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    fn finish(&mut self) -> Result<T, Error> {
        let value = self
            .value
            .take()
            .ok_or_else(|| error::internal("integer reply incomplete"))?;
        T::try_from(value).map_err(|_| Error::NotANumber)
    }
}

macro_rules! impl_fromresp3_integers {
    ($($int_ty:ty),* $(,)?) => {
        $(
            impl FromResp3 for $int_ty {
                type Adapter = IntegerAdapter<$int_ty>;

                fn adapter() -> Self::Adapter {
                    IntegerAdapter::new()
                }
            }
        )*
    };
}

impl_fromresp3_integers!(i32, i64, u32, u64, usize, isize);

/// Adapts one reply into a boolean; nothing but a boolean frame qualifies.
pub struct BoolAdapter {
    value: Option<bool>,
}

impl NodeAdapter for BoolAdapter {
    type Output = bool;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if let Some(err) = remote_error(node) {
            return Err(Error::Remote(err));
        }
        match node.kind {
            NodeKind::Boolean => {
                self.value = Some(node.data == b"t");
                Ok(())
            }
            NodeKind::Null => Err(Error::NullUnexpected),
            other => Err(Error::wrong_type("boolean", other)),
        }
    }

    fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    fn finish(&mut self) -> Result<bool, Error> {
        self.value
            .take()
            .ok_or_else(|| error::internal("boolean reply incomplete"))
    }
}

impl FromResp3 for bool {
    type Adapter = BoolAdapter;

    fn adapter() -> BoolAdapter {
        BoolAdapter { value: None }
    }
}

/// Adapts one reply into a double.  Doubles travel as text; numbers are
/// accepted too since every integer is a valid double.
pub struct DoubleAdapter {
    value: Option<f64>,
}

impl NodeAdapter for DoubleAdapter {
    type Output = f64;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if let Some(err) = remote_error(node) {
            return Err(Error::Remote(err));
        }
        match node.kind {
            NodeKind::Double | NodeKind::Number | NodeKind::BigNumber => {
                let parsed = std::str::from_utf8(node.data)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error::NotADouble)?;
                self.value = Some(parsed);
                Ok(())
            }
            NodeKind::Null => Err(Error::NullUnexpected),
            other => Err(Error::wrong_type("double", other)),
        }
    }

    fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    fn finish(&mut self) -> Result<f64, Error> {
        self.value
            .take()
            .ok_or_else(|| error::internal("double reply incomplete"))
    }
}

impl FromResp3 for f64 {
    type Adapter = DoubleAdapter;

    fn adapter() -> DoubleAdapter {
        DoubleAdapter { value: None }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TextState {
    Empty,
    Streaming,
    Done,
}

/// Assembles one reply into a byte buffer, concatenating streamed chunks in
/// order when the string arrives streamed.
struct TextAccumulator {
    /// Kinds accepted as a finite root, besides streamed blobs.
    accepts: &'static [NodeKind],
    expected: &'static str,
    buf: Vec<u8>,
    state: TextState,
}

impl TextAccumulator {
    fn new(accepts: &'static [NodeKind], expected: &'static str) -> Self {
        TextAccumulator {
            accepts,
            expected,
            buf: Vec::new(),
            state: TextState::Empty,
        }
    }

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if let Some(err) = remote_error(node) {
            return Err(Error::Remote(err));
        }
        match self.state {
            TextState::Empty => {
                if node.kind.is_blob() && node.size.is_streamed() {
                    self.state = TextState::Streaming;
                    return Ok(());
                }
                if !self.accepts.contains(&node.kind) {
                    return Err(match node.kind {
                        NodeKind::Null => Error::NullUnexpected,
                        other => Error::wrong_type(self.expected, other),
                    });
                }
                self.buf.extend_from_slice(node.data);
                self.state = TextState::Done;
                Ok(())
            }
            TextState::Streaming => match node.kind {
                NodeKind::StreamedStringPart => {
                    if node.data.is_empty() {
                        self.state = TextState::Done;
                    } else {
                        self.buf.extend_from_slice(node.data);
                    }
                    Ok(())
                }
                _ => Err(Error::ExpectsSimpleType),
            },
            TextState::Done => Ok(()),
        }
    }

    fn is_complete(&self) -> bool {
        self.state == TextState::Done
    }

    fn take(&mut self) -> Result<Vec<u8>, Error> {
        if self.state != TextState::Done {
            return Err(error::internal("string reply incomplete"));
        }
        Ok(std::mem::take(&mut self.buf))
    }
}

/// Adapts one reply into an owned `String`.  Accepts every textual kind;
/// invalid UTF-8 is replaced lossily, as byte strings are the server's
/// native representation.
pub struct StringAdapter {
    inner: TextAccumulator,
}

impl NodeAdapter for StringAdapter {
    type Output = String;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        self.inner.on_node(node)
    }

    fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    fn finish(&mut self) -> Result<String, Error> {
        let bytes = self.inner.take()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl FromResp3 for String {
    type Adapter = StringAdapter;

    fn adapter() -> StringAdapter {
        StringAdapter {
            inner: TextAccumulator::new(
                &[
                    NodeKind::SimpleString,
                    NodeKind::BlobString,
                    NodeKind::VerbatimString,
                    NodeKind::BigNumber,
                    NodeKind::Double,
                ],
                "string",
            ),
        }
    }
}

/// Adapts one reply into raw bytes; only blob kinds qualify.
pub struct BytesAdapter {
    inner: TextAccumulator,
}

impl NodeAdapter for BytesAdapter {
    type Output = Vec<u8>;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        self.inner.on_node(node)
    }

    fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    fn finish(&mut self) -> Result<Vec<u8>, Error> {
        self.inner.take()
    }
}

impl FromResp3 for Vec<u8> {
    type Adapter = BytesAdapter;

    fn adapter() -> BytesAdapter {
        BytesAdapter {
            inner: TextAccumulator::new(
                &[NodeKind::BlobString, NodeKind::VerbatimString],
                "bytes",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::run_response;
    use crate::error::Error;

    #[test]
    fn integers() {
        let (n,): (i64,) = run_response(b":-3\r\n").unwrap();
        assert_eq!(n, -3);
        let (n,): (u32,) = run_response(b":50\r\n").unwrap();
        assert_eq!(n, 50);
        let (n,): (i64,) = run_response(b"#t\r\n").unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn integer_from_text() {
        let (n,): (i64,) = run_response(b"$2\r\n17\r\n").unwrap();
        assert_eq!(n, 17);
    }

    #[test]
    fn ok_is_not_a_number() {
        let err = run_response::<(i64,)>(b"+OK\r\n").unwrap_err();
        assert!(matches!(err, Error::NotANumber));
    }

    #[test]
    fn integer_overflow() {
        let err = run_response::<(i32,)>(b":9223372036854775807\r\n").unwrap_err();
        assert!(matches!(err, Error::NotANumber));
    }

    #[test]
    fn integer_underflow() {
        let err = run_response::<(u64,)>(b":-2\r\n").unwrap_err();
        assert!(matches!(err, Error::NotANumber));
    }

    #[test]
    fn booleans() {
        assert!(run_response::<(bool,)>(b"#t\r\n").unwrap().0);
        assert!(!run_response::<(bool,)>(b"#f\r\n").unwrap().0);
        let err = run_response::<(bool,)>(b":1\r\n").unwrap_err();
        assert!(matches!(err, Error::WrongType { .. }));
    }

    #[test]
    fn doubles() {
        let (d,): (f64,) = run_response(b",1.23\r\n").unwrap();
        assert!((d - 1.23).abs() < f64::EPSILON);
        let (d,): (f64,) = run_response(b":3\r\n").unwrap();
        assert!((d - 3.0).abs() < f64::EPSILON);
        let err = run_response::<(f64,)>(b",abc\r\n").unwrap_err();
        assert!(matches!(err, Error::NotADouble));
    }

    #[test]
    fn strings() {
        let (s,): (String,) = run_response(b"+PONG\r\n").unwrap();
        assert_eq!(s, "PONG");
        let (s,): (String,) = run_response(b"$5\r\nhello\r\n").unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn streamed_string_reassembled() {
        let (s,): (String,) =
            run_response(b"$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;1\r\nd\r\n;0\r\n").unwrap();
        assert_eq!(s, "Hello word");
    }

    #[test]
    fn null_string_is_unexpected() {
        let err = run_response::<(String,)>(b"_\r\n").unwrap_err();
        assert!(matches!(err, Error::NullUnexpected));
    }

    #[test]
    fn bytes_from_blob() {
        let (b,): (Vec<u8>,) = run_response(b"$3\r\n\x00\x01\x02\r\n").unwrap();
        assert_eq!(b, vec![0, 1, 2]);
        let err = run_response::<(Vec<u8>,)>(b"+nope\r\n").unwrap_err();
        assert!(matches!(err, Error::WrongType { .. }));
    }
}
