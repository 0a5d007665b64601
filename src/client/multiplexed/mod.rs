/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The multiplexed connection.
//!
//! One socket, shared by any number of submitters: requests are queued,
//! written in submission order without interleaving, and their replies are
//! demultiplexed back to the submitters in the same order.  Server push
//! frames (pub/sub traffic, invalidations) never consume a reply slot; they
//! are routed to a dedicated stream obtained from
//! [`MultiplexedConnection::pushes`].
//!
//! The handle is cheap to clone.  Nothing happens until one task drives
//! [`MultiplexedConnection::run`], which owns the socket, performs the
//! `HELLO 3` handshake, and keeps reconnecting with backoff until it is shut
//! down gracefully via [`MultiplexedConnection::shutdown`] or a `QUIT`
//! completes.

mod inner;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use futures_util::stream::Stream;

use crate::adapter::{AttributeFilter, Response, ResponseSink};
use crate::client::builder::Settings;
use crate::client::hello::ServerEndpoint;
use crate::error::{self, ConnectionReason, Error};
use crate::protocol::node::{Node, NodeTree};
use crate::protocol::request::{Request, RequestConfig};

use self::inner::{Engine, HelloSink};

/// Where the engine currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Handshaking,
    Running,
    Draining,
}

pub(crate) enum Event {
    Exec(Slot),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Queued,
    Writing,
    AwaitingReply,
}

/// One submitted request awaiting its replies.
pub(crate) struct Slot {
    pub(crate) payload: Bytes,
    pub(crate) expected: usize,
    pub(crate) remaining: usize,
    pub(crate) hello_priority: bool,
    pub(crate) quit: bool,
    pub(crate) config: RequestConfig,
    pub(crate) sink: SlotSink,
    pub(crate) state: SlotState,
}

pub(crate) enum SlotSink {
    User(Box<dyn ReplySink>),
    Hello(HelloSink),
    Ping,
}

impl Slot {
    pub(crate) fn is_internal(&self) -> bool {
        !matches!(self.sink, SlotSink::User(_))
    }

    pub(crate) fn canceled_user(&self) -> bool {
        matches!(&self.sink, SlotSink::User(sink) if sink.is_canceled())
    }

    pub(crate) fn fail(self, err: Error) {
        if let SlotSink::User(sink) = self.sink {
            sink.fail(err);
        }
    }
}

/// The engine-facing face of a submitted request's adapters.
pub(crate) trait ReplySink: Send {
    fn on_node(&mut self, node: &Node<'_>);
    fn end_reply(&mut self);
    /// All expected replies were consumed; deliver the outcome.
    fn resolve(self: Box<Self>);
    /// The request cannot complete; deliver the error.
    fn fail(self: Box<Self>, err: Error);
    /// Whether the submitter has stopped waiting.
    fn is_canceled(&self) -> bool;
}

/// Binds a typed [`Response`] to the reply stream and a completion channel.
/// The first adapter error is remembered and delivered at the end; the
/// stream itself is drained regardless, so one bad target never
/// desynchronises the connection.
pub(crate) struct PipelineSink<T: Response> {
    sink: T::Sink,
    filter: AttributeFilter,
    failed: Option<Error>,
    tx: Option<oneshot::Sender<Result<T, Error>>>,
}

impl<T: Response> ReplySink for PipelineSink<T> {
    fn on_node(&mut self, node: &Node<'_>) {
        if self.failed.is_some() {
            return;
        }
        if self.filter.admit(node) {
            if let Err(e) = self.sink.on_node(node) {
                self.failed = Some(e);
            }
        }
    }

    fn end_reply(&mut self) {
        self.sink.end_reply();
        self.filter = AttributeFilter::default();
    }

    fn resolve(mut self: Box<Self>) {
        let result = match self.failed.take() {
            Some(e) => Err(e),
            None => self.sink.finish(),
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    fn fail(mut self: Box<Self>, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    fn is_canceled(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_canceled()).unwrap_or(true)
    }
}

pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    pub(crate) push_tx: mpsc::UnboundedSender<NodeTree>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeTree>>>,
    state: Mutex<ConnectionState>,
    endpoint: Mutex<Option<ServerEndpoint>>,
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
        if state == ConnectionState::Running {
            let mut waiters = self.waiters.lock().expect("waiters lock poisoned");
            for waiter in waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    pub(crate) fn set_endpoint(&self, endpoint: ServerEndpoint) {
        *self.endpoint.lock().expect("endpoint lock poisoned") = Some(endpoint);
    }

    pub(crate) fn clear_endpoint(&self) {
        *self.endpoint.lock().expect("endpoint lock poisoned") = None;
    }

    /// Registers interest in the engine reaching `Running`; `None` when it
    /// already has.  Registration happens under the state lock so the
    /// notification cannot be missed.
    fn connected_waiter(&self) -> Option<oneshot::Receiver<()>> {
        let state = self.state.lock().expect("state lock poisoned");
        if *state == ConnectionState::Running {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("waiters lock poisoned").push(tx);
        Some(rx)
    }

    pub(crate) fn fail_waiters(&self) {
        self.waiters.lock().expect("waiters lock poisoned").clear();
    }
}

/// A shareable handle to one multiplexed connection.
#[derive(Clone)]
pub struct MultiplexedConnection {
    shared: Arc<Shared>,
}

impl MultiplexedConnection {
    pub(crate) fn new(settings: Settings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        let (push_tx, push_rx) = mpsc::unbounded();
        MultiplexedConnection {
            shared: Arc::new(Shared {
                settings,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                push_tx,
                push_rx: Mutex::new(Some(push_rx)),
                state: Mutex::new(ConnectionState::Disconnected),
                endpoint: Mutex::new(None),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Drives the connection: resolve, connect, handshake, then interleave
    /// writing queued requests with reading and demultiplexing replies.
    /// Reconnects with backoff on connection loss.  Returns `Ok(())` after a
    /// graceful shutdown; dropping the returned future instead tears the
    /// connection down and fails everything in flight.
    pub async fn run(&self) -> Result<(), Error> {
        let events = self
            .shared
            .events_rx
            .lock()
            .expect("events lock poisoned")
            .take()
            .ok_or_else(|| error::internal("run may only be driven once"))?;
        let mut engine = Engine::new(Arc::clone(&self.shared));
        let result = engine.run(events).await;
        self.shared.fail_waiters();
        result
    }

    /// Submits a request and waits for its replies, adapted into `T`.
    ///
    /// `T` is a tuple with one element per expected reply (or
    /// [`Ignore`](crate::adapter::Ignore)): a lone `GET` is read with
    /// `(Option<String>,)`, a `SET`+`GET` pipeline with
    /// `((), Option<String>)`.
    ///
    /// Replies complete in submission order.  Dropping the returned future
    /// cancels the request: if its bytes were not written yet it is removed
    /// from the queue, otherwise its replies are read and discarded.
    pub async fn exec<T: Response>(&self, req: Request) -> Result<T, Error> {
        if req.is_empty() {
            return Err(error::internal("cannot execute an empty request"));
        }
        let expected = req.expected_replies();
        if let Some(wanted) = T::REPLIES {
            if wanted != expected {
                return Err(Error::SizeMismatch {
                    expected: wanted,
                    found: expected,
                });
            }
        }
        let config = *req.config();
        if config.cancel_if_not_connected && self.state() != ConnectionState::Running {
            return Err(Error::Connection(ConnectionReason::NotConnected));
        }

        let (tx, rx) = oneshot::channel();
        let sink = PipelineSink::<T> {
            sink: T::sink(),
            filter: AttributeFilter::default(),
            failed: None,
            tx: Some(tx),
        };
        let slot = Slot {
            hello_priority: config.hello_with_priority && req.starts_with_hello(),
            quit: req.contains_quit(),
            expected,
            remaining: expected,
            config,
            payload: req.into_payload(),
            sink: SlotSink::User(Box::new(sink)),
            state: SlotState::Queued,
        };
        self.shared
            .events_tx
            .unbounded_send(Event::Exec(slot))
            .map_err(|_| Error::Connection(ConnectionReason::NotConnected))?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(ConnectionReason::ConnectionLost)),
        }
    }

    /// The stream of server push frames.  Push frames are buffered from the
    /// moment the connection is created; the stream can be taken once.
    pub fn pushes(&self) -> Result<PushStream, Error> {
        self.shared
            .push_rx
            .lock()
            .expect("push lock poisoned")
            .take()
            .map(|underlying| PushStream { underlying })
            .ok_or_else(|| error::internal("push stream already taken"))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// What the server announced in the handshake, while connected.
    pub fn endpoint(&self) -> Option<ServerEndpoint> {
        self.shared
            .endpoint
            .lock()
            .expect("endpoint lock poisoned")
            .clone()
    }

    /// Resolves once the connection is up and running.
    pub async fn wait_connected(&self) -> Result<(), Error> {
        match self.shared.connected_waiter() {
            None => Ok(()),
            Some(rx) => rx
                .await
                .map_err(|_| Error::Connection(ConnectionReason::ConnectionLost)),
        }
    }

    /// Asks the engine to drain outstanding replies and stop.  New
    /// submissions fail with `not_connected` from that point on.
    pub fn shutdown(&self) {
        let _ = self.shared.events_tx.unbounded_send(Event::Shutdown);
    }
}

/// Server-initiated frames, in arrival order.
#[derive(Debug)]
pub struct PushStream {
    underlying: mpsc::UnboundedReceiver<NodeTree>,
}

impl Stream for PushStream {
    type Item = NodeTree;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().underlying).poll_next(cx)
    }
}
