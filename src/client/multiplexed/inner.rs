/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The connection engine: a single task owning the socket, the pending-slot
//! FIFO and the outbound byte queue.

use std::cmp;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_channel::mpsc;
use futures_util::stream::StreamExt;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::adapter::{remote_error, AttributeFilter, FromResp3, NodeAdapter};
use crate::client::hello::{self, ServerEndpoint};
use crate::error::{self, ConnectionReason, Error, ServerError};
use crate::protocol::node::{Node, NodeKind, NodeTree};
use crate::protocol::parse::Parser;
use crate::protocol::request::{Request, RequestConfig};

use super::{ConnectionState, Event, Shared, Slot, SlotSink, SlotState};

const READ_BUFFER_CAPACITY: usize = 4096;
const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(30);
/// Placeholder deadline for the disabled health-timeout select arm.
const FAR_FUTURE: Duration = Duration::from_secs(3600);

/// Captures the implicit handshake's replies: the `HELLO` map verbatim, and
/// any error the server returned to it or to the trailing `SELECT`.
pub(crate) struct HelloSink {
    adapter: <NodeTree as FromResp3>::Adapter,
    filter: AttributeFilter,
    error: Option<ServerError>,
}

impl HelloSink {
    fn new() -> Self {
        HelloSink {
            adapter: NodeTree::adapter(),
            filter: AttributeFilter::default(),
            error: None,
        }
    }

    fn on_node(&mut self, node: &Node<'_>) {
        if !self.filter.admit(node) {
            return;
        }
        if node.depth == 0 && self.error.is_none() {
            if let Some(err) = remote_error(node) {
                self.error = Some(err);
                return;
            }
        }
        if !self.adapter.is_complete() {
            // capturing a tree cannot fail
            let _ = self.adapter.on_node(node);
        }
    }

    fn finish(mut self) -> Result<ServerEndpoint, Error> {
        if let Some(err) = self.error {
            log::error!("handshake rejected by server: {}", err);
            return Err(Error::Connection(ConnectionReason::HandshakeFailed));
        }
        let tree = self
            .adapter
            .finish()
            .map_err(|_| Error::Connection(ConnectionReason::HandshakeFailed))?;
        if !matches!(tree.root(), Some(root) if root.kind == NodeKind::Map) {
            return Err(Error::Connection(ConnectionReason::HandshakeFailed));
        }
        Ok(hello::parse_endpoint(&tree))
    }
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    queue: VecDeque<Slot>,
    draining: bool,
    events_done: bool,
    /// This connection attempt completed its handshake.
    handshaken: bool,
    ping_outstanding: bool,
    ping_deadline: Option<Instant>,
    ping_counter: u64,
    /// Nodes of a push frame currently being captured off the stream.
    push_nodes: Option<NodeTree>,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Engine {
            shared,
            queue: VecDeque::new(),
            draining: false,
            events_done: false,
            handshaken: false,
            ping_outstanding: false,
            ping_deadline: None,
            ping_counter: 0,
            push_nodes: None,
        }
    }

    pub(crate) async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), Error> {
        let mut attempt: u32 = 0;
        loop {
            self.drain_events(&mut events);
            if self.draining {
                self.shared.set_state(ConnectionState::Disconnected);
                self.fail_queue(ConnectionReason::NotConnected);
                return Ok(());
            }

            let stream = match self.establish().await {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("connection attempt failed: {}", e);
                    self.shared.set_state(ConnectionState::Disconnected);
                    attempt = attempt.saturating_add(1);
                    self.wait_backoff(&mut events, attempt).await;
                    continue;
                }
            };

            self.handshaken = false;
            let result = self.run_connection(stream, &mut events).await;
            self.shared.set_state(ConnectionState::Disconnected);
            self.shared.clear_endpoint();
            match result {
                Ok(()) => {
                    self.fail_queue(ConnectionReason::NotConnected);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("connection lost: {}", e);
                    self.sweep_queue();
                    if self.draining {
                        self.fail_queue(ConnectionReason::NotConnected);
                        return Ok(());
                    }
                    attempt = if self.handshaken {
                        1
                    } else {
                        attempt.saturating_add(1)
                    };
                    self.wait_backoff(&mut events, attempt).await;
                }
            }
        }
    }

    async fn establish(&mut self) -> Result<TcpStream, Error> {
        self.shared.set_state(ConnectionState::Resolving);
        let host = self.shared.settings.host.clone();
        let port = self.shared.settings.port;
        let addrs = with_timeout(
            self.shared.settings.resolve_timeout,
            ConnectionReason::ResolveTimeout,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await??;

        self.shared.set_state(ConnectionState::Connecting);
        let mut last_err = None;
        for addr in addrs {
            match with_timeout(
                self.shared.settings.connect_timeout,
                ConnectionReason::ConnectTimeout,
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.into()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::Connection(ConnectionReason::ConnectionFailed)))
    }

    async fn run_connection<S>(
        &mut self,
        stream: S,
        events: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.shared.set_state(ConnectionState::Handshaking);
        self.ping_outstanding = false;
        self.ping_deadline = None;
        self.push_nodes = None;

        // The implicit handshake goes ahead of everything queued; only
        // requests flagged `hello_with_priority` may be written alongside it
        // before the connection reaches `Running`.
        let hello_req = hello::handshake_request(&self.shared.settings);
        let expected = hello_req.expected_replies();
        self.queue.push_front(Slot {
            payload: hello_req.into_payload(),
            expected,
            remaining: expected,
            hello_priority: true,
            quit: false,
            config: RequestConfig::default(),
            sink: SlotSink::Hello(HelloSink::new()),
            state: SlotState::Queued,
        });

        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        let mut write_buf = BytesMut::new();
        let mut parser = Parser::with_max_depth(self.shared.settings.max_nested_depth);

        let ping_every = self.shared.settings.ping_interval;
        let mut ping_interval = if ping_every.is_zero() {
            None
        } else {
            let mut interval = interval_at(Instant::now() + ping_every, ping_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };

        loop {
            self.stage_writes(&mut write_buf);

            if self.draining && self.queue.is_empty() && write_buf.is_empty() {
                return Ok(());
            }

            let want_write = !write_buf.is_empty();
            let ping_enabled = ping_interval.is_some();
            let deadline = self.ping_deadline;

            tokio::select! {
                event = events.next(), if !self.events_done => match event {
                    Some(Event::Exec(slot)) => self.enqueue(slot),
                    Some(Event::Shutdown) => self.begin_drain(),
                    None => {
                        self.events_done = true;
                        self.begin_drain();
                    }
                },
                result = wr.write_buf(&mut write_buf), if want_write => {
                    if result? == 0 {
                        return Err(Error::EndOfStream);
                    }
                    if write_buf.is_empty() {
                        self.flush_complete();
                    }
                },
                result = rd.read_buf(&mut read_buf) => {
                    if result? == 0 {
                        if self.draining {
                            self.fail_queue(ConnectionReason::ConnectionLost);
                            return Ok(());
                        }
                        return Err(Error::EndOfStream);
                    }
                    self.process_read(&mut parser, &mut read_buf)?;
                },
                _ = async {
                    match ping_interval.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => (),
                    }
                }, if ping_enabled => {
                    self.on_ping_tick()?;
                },
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)
                ), if deadline.is_some() => {
                    log::warn!("health check timed out, closing connection");
                    return Err(Error::Connection(ConnectionReason::IdleTimeout));
                },
            }
        }
    }

    fn begin_drain(&mut self) {
        if !self.draining {
            self.draining = true;
            if self.handshaken {
                self.shared.set_state(ConnectionState::Draining);
            }
        }
    }

    fn enqueue(&mut self, slot: Slot) {
        if self.draining {
            slot.fail(Error::Connection(ConnectionReason::NotConnected));
            return;
        }
        if slot.hello_priority && self.shared.state() != ConnectionState::Running {
            // Ahead of requests that are still queued, never ahead of bytes
            // already staged for the socket.
            let pos = self.queue.iter().position(|s| {
                s.state == SlotState::Queued && !s.hello_priority && !s.is_internal()
            });
            if let Some(pos) = pos {
                self.queue.insert(pos, slot);
                return;
            }
        }
        self.queue.push_back(slot);
    }

    fn enqueue_ping(&mut self, slot: Slot) {
        match self.queue.iter().position(|s| s.state == SlotState::Queued) {
            Some(pos) => self.queue.insert(pos, slot),
            None => self.queue.push_back(slot),
        }
    }

    /// Copies the payloads of eligible queued slots into the write buffer.
    /// A request's bytes enter the buffer whole; the buffer may carry
    /// several requests, but never a partial one.
    fn stage_writes(&mut self, write_buf: &mut BytesMut) {
        self.queue
            .retain(|s| !(s.state == SlotState::Queued && s.canceled_user()));
        let handshaking = !self.handshaken;
        for slot in self.queue.iter_mut() {
            match slot.state {
                SlotState::Queued => {
                    if handshaking && !slot.hello_priority && !slot.is_internal() {
                        // Everything else waits for the handshake; stopping
                        // here keeps the written set a FIFO prefix.
                        break;
                    }
                    write_buf.extend_from_slice(&slot.payload);
                    slot.state = SlotState::Writing;
                }
                _ => continue,
            }
        }
    }

    fn flush_complete(&mut self) {
        for slot in self.queue.iter_mut() {
            if slot.state == SlotState::Writing {
                slot.state = SlotState::AwaitingReply;
            }
        }
        // Requests without replies (the SUBSCRIBE family) complete on flush.
        let mut idx = 0;
        while idx < self.queue.len() {
            let done = self.queue[idx].state == SlotState::AwaitingReply
                && self.queue[idx].remaining == 0;
            if !done {
                idx += 1;
                continue;
            }
            if let Some(slot) = self.queue.remove(idx) {
                let quit = slot.quit;
                if let SlotSink::User(sink) = slot.sink {
                    sink.resolve();
                }
                if quit {
                    self.begin_drain();
                }
            }
        }
    }

    fn process_read(&mut self, parser: &mut Parser, buf: &mut BytesMut) -> Result<(), Error> {
        loop {
            if parser.reply_complete() {
                let consumed = parser.consumed();
                buf.advance(consumed);
                parser.reset();
                self.end_reply()?;
                continue;
            }
            match parser.next(&buf[..])? {
                Some(node) => self.dispatch(&node)?,
                None => return Ok(()),
            }
        }
    }

    fn dispatch(&mut self, node: &Node<'_>) -> Result<(), Error> {
        // Out-of-band frames bypass the reply accounting entirely.
        if self.push_nodes.is_some() || (node.depth == 0 && node.kind == NodeKind::Push) {
            self.push_nodes
                .get_or_insert_with(NodeTree::default)
                .nodes
                .push(node.to_owned());
            return Ok(());
        }
        let slot = match self.queue.front_mut() {
            Some(slot) if slot.state != SlotState::Queued => slot,
            _ => return Err(error::internal("reply received with no request in flight")),
        };
        match &mut slot.sink {
            SlotSink::User(sink) => sink.on_node(node),
            SlotSink::Hello(hello) => hello.on_node(node),
            SlotSink::Ping => {}
        }
        Ok(())
    }

    fn end_reply(&mut self) -> Result<(), Error> {
        if let Some(tree) = self.push_nodes.take() {
            if self.shared.push_tx.unbounded_send(tree).is_err() {
                log::debug!("push frame dropped, receiver gone");
            }
            return Ok(());
        }
        match self.queue.front_mut() {
            Some(slot) if slot.state != SlotState::Queued => {
                if let SlotSink::User(sink) = &mut slot.sink {
                    sink.end_reply();
                }
                slot.remaining = slot.remaining.saturating_sub(1);
                if slot.remaining > 0 {
                    return Ok(());
                }
            }
            _ => return Err(error::internal("reply received with no request in flight")),
        }
        let slot = match self.queue.pop_front() {
            Some(slot) => slot,
            None => return Ok(()),
        };
        self.complete_slot(slot)
    }

    fn complete_slot(&mut self, slot: Slot) -> Result<(), Error> {
        match slot.sink {
            SlotSink::User(sink) => {
                sink.resolve();
                if slot.quit {
                    self.begin_drain();
                }
                Ok(())
            }
            SlotSink::Hello(hello) => {
                let endpoint = hello.finish()?;
                log::debug!(
                    "connected to {} {} (role {})",
                    endpoint.server,
                    endpoint.version,
                    endpoint.role
                );
                self.shared.set_endpoint(endpoint);
                self.handshaken = true;
                self.shared.set_state(ConnectionState::Running);
                Ok(())
            }
            SlotSink::Ping => {
                self.ping_outstanding = false;
                self.ping_deadline = None;
                Ok(())
            }
        }
    }

    fn on_ping_tick(&mut self) -> Result<(), Error> {
        if !self.handshaken || self.draining {
            return Ok(());
        }
        if self.ping_outstanding {
            // With a deadline armed the sleep arm handles expiry; without
            // one, an unanswered ping at the next tick is the timeout.
            return if self.ping_deadline.is_some() {
                Ok(())
            } else {
                Err(Error::Connection(ConnectionReason::IdleTimeout))
            };
        }
        self.ping_counter += 1;
        let mut req = Request::new();
        req.push("PING", (format!("health-check-{}", self.ping_counter),));
        let expected = req.expected_replies();
        self.enqueue_ping(Slot {
            payload: req.into_payload(),
            expected,
            remaining: expected,
            hello_priority: false,
            quit: false,
            config: RequestConfig::default(),
            sink: SlotSink::Ping,
            state: SlotState::Queued,
        });
        self.ping_outstanding = true;
        let timeout = self.shared.settings.health_check_timeout;
        if !timeout.is_zero() {
            self.ping_deadline = Some(Instant::now() + timeout);
        }
        Ok(())
    }

    /// Decides the fate of every pending slot after a connection died.
    /// Partially answered requests can never be retried safely; fully
    /// unanswered ones survive according to their configuration.
    fn sweep_queue(&mut self) {
        let slots: Vec<Slot> = self.queue.drain(..).collect();
        for mut slot in slots {
            if slot.is_internal() {
                continue;
            }
            let partially_read = slot.remaining < slot.expected;
            let written = slot.state != SlotState::Queued;
            if slot.config.cancel_on_connection_lost
                || partially_read
                || (written && !slot.config.retry)
            {
                slot.fail(Error::Connection(ConnectionReason::ConnectionLost));
            } else {
                slot.state = SlotState::Queued;
                slot.remaining = slot.expected;
                self.queue.push_back(slot);
            }
        }
        self.ping_outstanding = false;
        self.ping_deadline = None;
        self.push_nodes = None;
    }

    fn fail_queue(&mut self, reason: ConnectionReason) {
        for slot in self.queue.drain(..) {
            slot.fail(Error::Connection(reason));
        }
    }

    fn drain_events(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        while let Ok(Some(event)) = events.try_next() {
            match event {
                Event::Exec(slot) => self.enqueue(slot),
                Event::Shutdown => self.begin_drain(),
            }
        }
    }

    async fn wait_backoff(&mut self, events: &mut mpsc::UnboundedReceiver<Event>, attempt: u32) {
        let delay = backoff_delay(self.shared.settings.reconnect_wait_interval, attempt);
        if delay.is_zero() {
            return;
        }
        log::debug!("reconnecting in {:?} (attempt {})", delay, attempt);
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                event = events.next(), if !self.events_done => match event {
                    Some(Event::Exec(slot)) => self.enqueue(slot),
                    Some(Event::Shutdown) => {
                        self.begin_drain();
                        return;
                    }
                    None => {
                        self.events_done = true;
                        self.begin_drain();
                        return;
                    }
                },
            }
        }
    }
}

/// Exponential growth on consecutive failures, capped, with uniform jitter
/// so a fleet of clients does not reconnect in lockstep.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(5);
    let exp = base.saturating_mul(1 << shift);
    let capped = cmp::min(exp, MAX_RECONNECT_WAIT);
    capped.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

async fn with_timeout<F>(
    duration: Duration,
    reason: ConnectionReason,
    future: F,
) -> Result<F::Output, Error>
where
    F: std::future::Future,
{
    if duration.is_zero() {
        return Ok(future.await);
    }
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::Connection(reason))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::adapter::Ignore;
    use crate::client::builder::ConnectionBuilder;
    use crate::client::multiplexed::{ConnectionState, MultiplexedConnection};
    use crate::error::{ConnectionReason, Error};
    use crate::protocol::parse::Parser;
    use crate::protocol::request::Request;

    type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

    #[derive(Debug, Default, Clone, Copy)]
    struct ServerOptions {
        /// Accept and immediately drop the first connection.
        drop_first_connection: bool,
        /// Never answer health-check pings.
        mute_health_pings: bool,
    }

    /// A scripted RESP3 server on a loopback socket; enough of one to drive
    /// the engine end-to-end without a real key-value store.
    struct TestServer {
        addr: std::net::SocketAddr,
        log: CommandLog,
    }

    impl TestServer {
        async fn start(options: ServerOptions) -> TestServer {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
            let accept_log = Arc::clone(&log);
            tokio::spawn(async move {
                let mut dropped = false;
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    if options.drop_first_connection && !dropped {
                        dropped = true;
                        drop(stream);
                        continue;
                    }
                    let log = Arc::clone(&accept_log);
                    tokio::spawn(async move {
                        let _ = serve(stream, log, options).await;
                    });
                }
            });
            TestServer { addr, log }
        }

        fn commands(&self) -> Vec<String> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.join(" "))
                .collect()
        }

        fn builder(&self) -> ConnectionBuilder {
            ConnectionBuilder::new(self.addr.ip().to_string(), self.addr.port())
        }

        fn connection(&self) -> MultiplexedConnection {
            let mut builder = self.builder();
            builder
                .ping_interval(Duration::ZERO)
                .reconnect_wait_interval(Duration::from_millis(10));
            builder.build()
        }
    }

    async fn serve(
        mut stream: TcpStream,
        log: CommandLog,
        options: ServerOptions,
    ) -> std::io::Result<()> {
        let mut parser = Parser::new();
        let mut buf = bytes::BytesMut::new();
        let mut store: HashMap<String, String> = HashMap::new();
        let mut current: Vec<String> = Vec::new();
        loop {
            loop {
                if parser.reply_complete() {
                    let consumed = parser.consumed();
                    bytes::Buf::advance(&mut buf, consumed);
                    parser.reset();
                    let cmd = std::mem::take(&mut current);
                    log.lock().unwrap().push(cmd.clone());
                    if respond(&mut stream, &cmd, &mut store, options).await? {
                        return Ok(());
                    }
                    continue;
                }
                match parser.next(&buf[..]) {
                    Ok(Some(node)) => {
                        if !node.kind.is_aggregate() {
                            current.push(String::from_utf8_lossy(node.data).into_owned());
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return Ok(()),
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn respond(
        stream: &mut TcpStream,
        cmd: &[String],
        store: &mut HashMap<String, String>,
        options: ServerOptions,
    ) -> std::io::Result<bool> {
        let name = cmd
            .first()
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_default();
        let mut out: Vec<u8> = Vec::new();
        let mut quit = false;
        match name.as_str() {
            "HELLO" => out.extend_from_slice(
                b"%14\r\n\
                  $6\r\nserver\r\n$5\r\nmockd\r\n\
                  $7\r\nversion\r\n$5\r\n1.0.0\r\n\
                  $5\r\nproto\r\n:3\r\n\
                  $2\r\nid\r\n:7\r\n\
                  $4\r\nmode\r\n$10\r\nstandalone\r\n\
                  $4\r\nrole\r\n$6\r\nmaster\r\n\
                  $7\r\nmodules\r\n*0\r\n",
            ),
            "SELECT" => out.extend_from_slice(b"+OK\r\n"),
            "PING" => match cmd.get(1) {
                Some(payload) => {
                    if options.mute_health_pings && payload.starts_with("health-check-") {
                        return Ok(false);
                    }
                    out.extend_from_slice(
                        format!("${}\r\n{}\r\n", payload.len(), payload).as_bytes(),
                    );
                }
                None => out.extend_from_slice(b"+PONG\r\n"),
            },
            "SET" => {
                store.insert(cmd[1].clone(), cmd[2].clone());
                out.extend_from_slice(b"+OK\r\n");
            }
            "GET" => match store.get(&cmd[1]) {
                Some(value) => out
                    .extend_from_slice(format!("${}\r\n{}\r\n", value.len(), value).as_bytes()),
                None => out.extend_from_slice(b"_\r\n"),
            },
            "SUBSCRIBE" => {
                let topic = &cmd[1];
                out.extend_from_slice(
                    format!(
                        ">3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:1\r\n",
                        topic.len(),
                        topic
                    )
                    .as_bytes(),
                );
            }
            "BLAST" => {
                let count: usize = cmd[1].parse().unwrap_or(0);
                for i in 0..count {
                    let payload = i.to_string();
                    out.extend_from_slice(
                        format!(
                            ">3\r\n$7\r\nmessage\r\n$4\r\ntest\r\n${}\r\n{}\r\n",
                            payload.len(),
                            payload
                        )
                        .as_bytes(),
                    );
                }
                out.extend_from_slice(b"+OK\r\n");
            }
            "QUIT" => {
                out.extend_from_slice(b"+OK\r\n");
                quit = true;
            }
            _ => out.extend_from_slice(b"-ERR unknown command\r\n"),
        }
        stream.write_all(&out).await?;
        Ok(quit)
    }

    fn spawn_runner(
        conn: &MultiplexedConnection,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run().await })
    }

    #[tokio::test]
    async fn pipelines_one_request_per_reply() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let mut req = Request::new();
        req.push("SET", ("x", "1")).push("GET", ("x",));
        let ((), value): ((), Option<String>) = conn.exec(req).await.unwrap();
        assert_eq!(value.as_deref(), Some("1"));
        assert_eq!(conn.state(), ConnectionState::Running);
    }

    #[tokio::test]
    async fn concurrent_submissions_complete_in_order() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let conn = conn.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let mut req = Request::new();
                req.push("PING", (format!("payload-{}", i),));
                let (pong,): (String,) = conn.exec(req).await.unwrap();
                assert_eq!(pong, format!("payload-{}", i));
                order.lock().unwrap().push(i);
            }));
            // let the submission reach the engine before the next one
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn handshake_priority() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        // req1: an ordinary request, submitted first
        {
            let conn = conn.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let mut req = Request::new();
                req.push("PING", ("r1",));
                conn.exec::<(String,)>(req).await.unwrap();
                order.lock().unwrap().push(1);
            }));
        }
        tokio::task::yield_now().await;

        // req2: starts with HELLO but explicitly waives its priority
        {
            let conn = conn.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let mut req = Request::new();
                req.get_config().hello_with_priority = false;
                req.push("HELLO", ("3",))
                    .push("PING", ("r2",))
                    .push("QUIT", ());
                conn.exec::<Ignore>(req).await.unwrap();
                order.lock().unwrap().push(2);
            }));
        }
        tokio::task::yield_now().await;

        // req3: HELLO with priority overtakes both earlier requests
        {
            let conn = conn.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let mut req = Request::new();
                req.push("HELLO", ("3",)).push("PING", ("r3",));
                conn.exec::<Ignore>(req).await.unwrap();
                order.lock().unwrap().push(3);
            }));
        }
        tokio::task::yield_now().await;

        let runner = spawn_runner(&conn);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
        assert_eq!(
            server.commands(),
            vec![
                "HELLO 3".to_string(), // implicit handshake
                "HELLO 3".into(),      // req3
                "PING r3".into(),
                "PING r1".into(),
                "HELLO 3".into(), // req2
                "PING r2".into(),
                "QUIT".into(),
            ]
        );
        // QUIT drained the connection gracefully
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_if_not_connected() {
        let conn = ConnectionBuilder::new("127.0.0.1", 6399).build();
        let mut req = Request::new();
        req.get_config().cancel_if_not_connected = true;
        req.push("HELLO", ("3",)).push("PING", ());
        let err = conn.exec::<Ignore>(req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionReason::NotConnected)
        ));
    }

    #[tokio::test]
    async fn adapter_error_does_not_desynchronise() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let mut req = Request::new();
        req.push("SET", ("a", "b"));
        let err = conn.exec::<(i64,)>(req).await.unwrap_err();
        assert!(matches!(err, Error::NotANumber));

        // the stream position is untouched, the next request succeeds
        let mut req = Request::new();
        req.push("GET", ("a",));
        let (value,): (Option<String>,) = conn.exec(req).await.unwrap();
        assert_eq!(value.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn pushes_do_not_consume_reply_slots() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let mut pushes = conn.pushes().unwrap();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let mut req = Request::new();
        req.push("BLAST", (3,));
        let (ok,): (String,) = conn.exec(req).await.unwrap();
        assert_eq!(ok, "OK");

        let mut req = Request::new();
        req.push("PING", ("after",));
        let (pong,): (String,) = conn.exec(req).await.unwrap();
        assert_eq!(pong, "after");

        for i in 0..3 {
            let tree = pushes.next().await.unwrap();
            assert!(tree.is_push());
            let strings = tree.flat_strings();
            assert_eq!(strings[0], "message");
            assert_eq!(strings[2], i.to_string());
        }
    }

    #[tokio::test]
    async fn subscribe_confirms_via_push() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let mut pushes = conn.pushes().unwrap();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let mut req = Request::new();
        req.push("SUBSCRIBE", ("events",));
        // no reply slot, the request completes once its bytes are written
        conn.exec::<Ignore>(req).await.unwrap();

        let tree = pushes.next().await.unwrap();
        let strings = tree.flat_strings();
        assert_eq!(strings[0], "subscribe");
        assert_eq!(strings[1], "events");
    }

    #[tokio::test]
    async fn reconnects_after_dropped_connection() {
        let server = TestServer::start(ServerOptions {
            drop_first_connection: true,
            ..Default::default()
        })
        .await;
        let conn = server.connection();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        let endpoint = conn.endpoint().unwrap();
        assert_eq!(endpoint.server, "mockd");
        assert_eq!(endpoint.version, "1.0.0");
        assert_eq!(endpoint.proto, 3);
        assert_eq!(endpoint.role, "master");

        let mut req = Request::new();
        req.push("PING", ("back",));
        let (pong,): (String,) = conn.exec(req).await.unwrap();
        assert_eq!(pong, "back");
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops() {
        let server = TestServer::start(ServerOptions::default()).await;
        let conn = server.connection();
        let runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        conn.shutdown();
        assert!(runner.await.unwrap().is_ok());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let mut req = Request::new();
        req.get_config().cancel_if_not_connected = true;
        req.push("PING", ());
        let err = conn.exec::<Ignore>(req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionReason::NotConnected)
        ));
    }

    #[tokio::test]
    async fn health_check_timeout_triggers_reconnect() {
        let server = TestServer::start(ServerOptions {
            mute_health_pings: true,
            ..Default::default()
        })
        .await;
        let mut builder = server.builder();
        builder
            .ping_interval(Duration::from_millis(20))
            .health_check_timeout(Duration::from_millis(20))
            .reconnect_wait_interval(Duration::from_millis(10));
        let conn = builder.build();
        let _runner = spawn_runner(&conn);
        conn.wait_connected().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let handshakes = server
            .commands()
            .iter()
            .filter(|c| c.starts_with("HELLO"))
            .count();
        assert!(
            handshakes >= 2,
            "expected at least one reconnect, saw {} handshakes",
            handshakes
        );
    }
}
