/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The request builder.
//!
//! A [`Request`] accumulates a pipeline of commands as one framed RESP
//! payload plus per-command metadata.  It never touches the network: the
//! payload is handed to a connection on submission and written as a single
//! contiguous unit.
//!
//! ```
//! use resp3_async::Request;
//!
//! let mut req = Request::new();
//! req.push("SET", ("key", "value"));
//! req.push("LRANGE", ("mylist", 0, -1));
//! req.push_range("RPUSH", "mylist", ["a", "b", "c"]);
//! assert_eq!(req.len(), 3);
//! ```

use std::cmp;

use bytes::{BufMut, Bytes, BytesMut};

const DEFAULT_PAYLOAD_SIZE: usize = 1024;

/// Per-request behaviour toggles, mirrored by the connection when the
/// request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestConfig {
    /// Fail the request when the connection drops while it is in flight;
    /// when unset the request stays queued for the next connection.
    pub cancel_on_connection_lost: bool,
    /// Fail submission immediately unless the connection is up and running.
    pub cancel_if_not_connected: bool,
    /// When the request starts with `HELLO` it may be written during the
    /// handshake phase, ahead of requests that are still queued.
    pub hello_with_priority: bool,
    /// Re-submit the request after a reconnect even when its bytes had
    /// already been written; only safe for idempotent commands.
    pub retry: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            cancel_on_connection_lost: true,
            cancel_if_not_connected: false,
            hello_with_priority: true,
            retry: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CommandMeta {
    pub(crate) name: String,
    /// Top-level replies the command produces; the `SUBSCRIBE` family is
    /// confirmed through push frames and produces none.
    pub(crate) replies: usize,
}

/// An ordered pipeline of commands plus its frozen wire payload.
#[derive(Debug, Clone, Default)]
pub struct Request {
    payload: BytesMut,
    commands: Vec<CommandMeta>,
    config: RequestConfig,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    /// Appends one command.  Arguments are serialised as blob strings:
    /// strings and byte slices verbatim, numbers as decimal text.
    ///
    /// Arguments are given as a tuple (up to six elements, possibly of
    /// mixed types), an array, a slice, or `()` for none.
    ///
    /// # Panics
    ///
    /// If the command name is empty.
    pub fn push<A: RequestArgs>(&mut self, command: &str, args: A) -> &mut Self {
        assert!(!command.is_empty(), "command name must not be empty");
        write_header(&mut self.payload, b'*', (1 + args.count()) as i64);
        write_blob(&mut self.payload, command.as_bytes());
        args.write(&mut self.payload);
        self.record(command);
        self
    }

    /// Appends one command whose tail is the elements of an iterable, e.g.
    /// `RPUSH key v1 v2 …`.  Map iterables contribute alternating key and
    /// value arguments.
    ///
    /// # Panics
    ///
    /// If the command name is empty.
    pub fn push_range<I>(&mut self, command: &str, key: &str, items: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: RangeItem,
    {
        assert!(!command.is_empty(), "command name must not be empty");
        let mut tail = BytesMut::new();
        let mut count = 0;
        for item in items {
            count += item.count();
            item.write(&mut tail);
        }
        write_header(&mut self.payload, b'*', (2 + count) as i64);
        write_blob(&mut self.payload, command.as_bytes());
        write_blob(&mut self.payload, key.as_bytes());
        self.payload.extend_from_slice(&tail);
        self.record(command);
        self
    }

    /// The request's configuration, mutably.
    pub fn get_config(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Drops all commands and the payload; the configuration is kept.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.commands.clear();
    }

    /// Number of commands pushed so far.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Total number of top-level replies the pipeline will produce.
    pub fn expected_replies(&self) -> usize {
        self.commands.iter().map(|c| c.replies).sum()
    }

    pub(crate) fn starts_with_hello(&self) -> bool {
        matches!(self.commands.first(), Some(c) if c.name == "HELLO")
    }

    pub(crate) fn contains_quit(&self) -> bool {
        self.commands.iter().any(|c| c.name == "QUIT")
    }

    pub(crate) fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.payload.freeze()
    }

    fn record(&mut self, command: &str) {
        let name = command.to_ascii_uppercase();
        let replies = if matches!(
            name.as_str(),
            "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE"
        ) {
            0
        } else {
            1
        };
        self.commands.push(CommandMeta { name, replies });
    }
}

fn check_and_reserve(buf: &mut BytesMut, amt: usize) {
    if buf.remaining_mut() < amt {
        buf.reserve(cmp::max(amt, DEFAULT_PAYLOAD_SIZE));
    }
}

fn write_rn(buf: &mut BytesMut) {
    buf.put_u8(b'\r');
    buf.put_u8(b'\n');
}

fn write_header(buf: &mut BytesMut, symb: u8, len: i64) {
    let len_as_string = len.to_string();
    let len_as_bytes = len_as_string.as_bytes();
    check_and_reserve(buf, 1 + len_as_bytes.len() + 2);
    buf.put_u8(symb);
    buf.extend_from_slice(len_as_bytes);
    write_rn(buf);
}

fn write_blob(buf: &mut BytesMut, data: &[u8]) {
    write_header(buf, b'$', data.len() as i64);
    check_and_reserve(buf, data.len() + 2);
    buf.extend_from_slice(data);
    write_rn(buf);
}

/// A single command argument, serialised as a blob string.
pub trait CommandArg {
    fn write_arg(&self, buf: &mut BytesMut);
}

impl CommandArg for str {
    fn write_arg(&self, buf: &mut BytesMut) {
        write_blob(buf, self.as_bytes());
    }
}

impl CommandArg for String {
    fn write_arg(&self, buf: &mut BytesMut) {
        write_blob(buf, self.as_bytes());
    }
}

impl CommandArg for [u8] {
    fn write_arg(&self, buf: &mut BytesMut) {
        write_blob(buf, self);
    }
}

impl CommandArg for Vec<u8> {
    fn write_arg(&self, buf: &mut BytesMut) {
        write_blob(buf, self);
    }
}

impl<'a, T: CommandArg + ?Sized> CommandArg for &'a T {
    fn write_arg(&self, buf: &mut BytesMut) {
        (**self).write_arg(buf)
    }
}

macro_rules! impl_command_arg_numbers {
    ($($num_ty:ty),* $(,)?) => {
        $(
            impl CommandArg for $num_ty {
                fn write_arg(&self, buf: &mut BytesMut) {
                    write_blob(buf, self.to_string().as_bytes());
                }
            }
        )*
    };
}

impl_command_arg_numbers!(i32, i64, u32, u64, usize, isize, f64);

/// The argument list of one command: a tuple, array, slice or `()`.
pub trait RequestArgs {
    fn count(&self) -> usize;
    fn write(&self, buf: &mut BytesMut);
}

impl RequestArgs for () {
    fn count(&self) -> usize {
        0
    }

    fn write(&self, _buf: &mut BytesMut) {}
}

macro_rules! impl_request_args_tuples {
    ($(($($T:ident | $idx:tt),+))*) => {
        $(
            impl<$($T: CommandArg),+> RequestArgs for ($($T,)+) {
                fn count(&self) -> usize {
                    0 $(+ { let _ = $idx; 1 })+
                }

                fn write(&self, buf: &mut BytesMut) {
                    $( self.$idx.write_arg(buf); )+
                }
            }
        )*
    };
}

impl_request_args_tuples! {
    (A | 0)
    (A | 0, B | 1)
    (A | 0, B | 1, C | 2)
    (A | 0, B | 1, C | 2, D | 3)
    (A | 0, B | 1, C | 2, D | 3, E | 4)
    (A | 0, B | 1, C | 2, D | 3, E | 4, F | 5)
}

impl<'a, T: CommandArg> RequestArgs for &'a [T] {
    fn count(&self) -> usize {
        self.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        for item in *self {
            item.write_arg(buf);
        }
    }
}

impl<T: CommandArg, const N: usize> RequestArgs for [T; N] {
    fn count(&self) -> usize {
        N
    }

    fn write(&self, buf: &mut BytesMut) {
        for item in self {
            item.write_arg(buf);
        }
    }
}

impl<T: CommandArg> RequestArgs for Vec<T> {
    fn count(&self) -> usize {
        self.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        for item in self {
            item.write_arg(buf);
        }
    }
}

/// One element of a [`Request::push_range`] iterable: a plain argument, or a
/// key-value pair contributing two arguments.
pub trait RangeItem {
    fn count(&self) -> usize;
    fn write(&self, buf: &mut BytesMut);
}

macro_rules! impl_range_item {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RangeItem for $ty {
                fn count(&self) -> usize {
                    1
                }

                fn write(&self, buf: &mut BytesMut) {
                    CommandArg::write_arg(self, buf);
                }
            }
        )*
    };
}

impl_range_item!(String, Vec<u8>, i32, i64, u32, u64, usize, isize, f64);

impl RangeItem for str {
    fn count(&self) -> usize {
        1
    }

    fn write(&self, buf: &mut BytesMut) {
        CommandArg::write_arg(self, buf);
    }
}

impl RangeItem for [u8] {
    fn count(&self) -> usize {
        1
    }

    fn write(&self, buf: &mut BytesMut) {
        CommandArg::write_arg(self, buf);
    }
}

impl<'a, T: RangeItem + ?Sized> RangeItem for &'a T {
    fn count(&self) -> usize {
        (**self).count()
    }

    fn write(&self, buf: &mut BytesMut) {
        (**self).write(buf)
    }
}

impl<K: CommandArg, V: CommandArg> RangeItem for (K, V) {
    fn count(&self) -> usize {
        2
    }

    fn write(&self, buf: &mut BytesMut) {
        self.0.write_arg(buf);
        self.1.write_arg(buf);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn framing() {
        let mut req = Request::new();
        req.push("SET", ("x", "1"));
        assert_eq!(
            req.payload_bytes(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$1\r\n1\r\n"
        );
    }

    #[test]
    fn mixed_argument_types() {
        let mut req = Request::new();
        req.push("LRANGE", ("k", 0, -1));
        assert_eq!(
            req.payload_bytes(),
            b"*4\r\n$6\r\nLRANGE\r\n$1\r\nk\r\n$1\r\n0\r\n$2\r\n-1\r\n"
        );
    }

    #[test]
    fn no_arguments() {
        let mut req = Request::new();
        req.push("PING", ());
        assert_eq!(req.payload_bytes(), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn binary_arguments_copied_verbatim() {
        let mut req = Request::new();
        req.push("SET", ("k", &b"\x00\x01"[..]));
        assert_eq!(
            req.payload_bytes(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\n\x00\x01\r\n"
        );
    }

    #[test]
    fn push_range_sequence() {
        let mut req = Request::new();
        req.push_range("RPUSH", "mylist", ["a", "b", "c"]);
        assert_eq!(
            req.payload_bytes(),
            b"*5\r\n$5\r\nRPUSH\r\n$6\r\nmylist\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n"
        );
    }

    #[test]
    fn push_range_map() {
        let mut m = BTreeMap::new();
        m.insert("f1", "v1");
        m.insert("f2", "v2");
        let mut req = Request::new();
        req.push_range("HSET", "h", &m);
        assert_eq!(
            req.payload_bytes(),
            b"*6\r\n$4\r\nHSET\r\n$1\r\nh\r\n$2\r\nf1\r\n$2\r\nv1\r\n$2\r\nf2\r\n$2\r\nv2\r\n"
        );
    }

    #[test]
    fn payload_is_concatenation_of_commands() {
        let mut req = Request::new();
        req.push("MULTI", ()).push("PING", ()).push("EXEC", ());
        let mut expected = Vec::new();
        for cmd in ["MULTI", "PING", "EXEC"] {
            let mut single = Request::new();
            single.push(cmd, ());
            expected.extend_from_slice(single.payload_bytes());
        }
        assert_eq!(req.payload_bytes(), &expected[..]);
    }

    #[test]
    fn reply_accounting() {
        let mut req = Request::new();
        req.push("SUBSCRIBE", ("topic",));
        req.push("GET", ("k",));
        req.push("UNSUBSCRIBE", ("topic",));
        assert_eq!(req.expected_replies(), 1);
    }

    #[test]
    fn hello_and_quit_detection() {
        let mut req = Request::new();
        req.push("hello", (3,));
        req.push("PING", ());
        req.push("quit", ());
        assert!(req.starts_with_hello());
        assert!(req.contains_quit());

        let mut req = Request::new();
        req.push("PING", ());
        req.push("HELLO", (3,));
        assert!(!req.starts_with_hello());
    }

    #[test]
    fn clear_drops_commands_but_keeps_config() {
        let mut req = Request::new();
        req.get_config().retry = true;
        req.push("PING", ());
        req.clear();
        assert!(req.is_empty());
        assert!(req.payload_bytes().is_empty());
        assert!(req.config().retry);
    }

    #[test]
    fn config_defaults() {
        let config = RequestConfig::default();
        assert!(config.cancel_on_connection_lost);
        assert!(!config.cancel_if_not_connected);
        assert!(config.hello_with_priority);
        assert!(!config.retry);
    }
}
