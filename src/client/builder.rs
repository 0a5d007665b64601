/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Connection configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::client::multiplexed::MultiplexedConnection;
use crate::error::Error;
use crate::protocol::parse::DEFAULT_MAX_NESTED_DEPTH;
use crate::task;

const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// The resolved configuration a connection runs with.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: Option<Arc<str>>,
    pub(crate) password: Option<Arc<str>>,
    pub(crate) client_name: Option<Arc<str>>,
    pub(crate) database: Option<i64>,
    pub(crate) resolve_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) health_check_timeout: Duration,
    pub(crate) reconnect_wait_interval: Duration,
    pub(crate) max_nested_depth: usize,
}

/// Connection builder.
///
/// All timeouts default to a few seconds; setting one to zero disables the
/// corresponding check.
#[derive(Debug)]
pub struct ConnectionBuilder {
    settings: Settings,
}

impl ConnectionBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionBuilder {
            settings: Settings {
                host: host.into(),
                port,
                username: None,
                password: None,
                client_name: None,
                database: None,
                resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                ping_interval: DEFAULT_PING_INTERVAL,
                health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
                reconnect_wait_interval: DEFAULT_RECONNECT_WAIT,
                max_nested_depth: DEFAULT_MAX_NESTED_DEPTH,
            },
        }
    }

    /// Set the username used when connecting
    pub fn username<V: Into<Arc<str>>>(&mut self, username: V) -> &mut Self {
        self.settings.username = Some(username.into());
        self
    }

    /// Set the password used when connecting
    pub fn password<V: Into<Arc<str>>>(&mut self, password: V) -> &mut Self {
        self.settings.password = Some(password.into());
        self
    }

    /// Set the client name announced during the handshake
    pub fn client_name<V: Into<Arc<str>>>(&mut self, client_name: V) -> &mut Self {
        self.settings.client_name = Some(client_name.into());
        self
    }

    /// Select a database index after the handshake
    pub fn database(&mut self, index: i64) -> &mut Self {
        self.settings.database = Some(index);
        self
    }

    pub fn resolve_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.resolve_timeout = timeout;
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.connect_timeout = timeout;
        self
    }

    /// Interval between health-check `PING`s; zero disables health checks
    pub fn ping_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.ping_interval = interval;
        self
    }

    /// How long an unanswered health-check `PING` is tolerated
    pub fn health_check_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.health_check_timeout = timeout;
        self
    }

    /// Base delay between reconnect attempts; grows exponentially with
    /// consecutive failures, with jitter
    pub fn reconnect_wait_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.reconnect_wait_interval = interval;
        self
    }

    /// Reply trees nested deeper than this are treated as a protocol error
    pub fn max_nested_depth(&mut self, depth: usize) -> &mut Self {
        self.settings.max_nested_depth = depth;
        self
    }

    /// Creates the connection handle without starting it.  Nothing happens
    /// on the network until [`MultiplexedConnection::run`] is driven.
    pub fn build(&self) -> MultiplexedConnection {
        MultiplexedConnection::new(self.settings.clone())
    }

    /// Creates the connection, spawns its run loop on the current runtime
    /// and waits for the first successful handshake.
    pub async fn connect(&self) -> Result<MultiplexedConnection, Error> {
        let connection = self.build();
        let runner = connection.clone();
        task::spawn(async move {
            if let Err(e) = runner.run().await {
                log::error!("connection terminated: {}", e);
            }
        });
        connection.wait_connected().await?;
        Ok(connection)
    }
}
