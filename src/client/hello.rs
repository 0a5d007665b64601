/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The `HELLO` handshake and the server description it returns.

use crate::client::builder::Settings;
use crate::protocol::node::NodeTree;
use crate::protocol::request::Request;

/// What the server announced about itself in its `HELLO` reply.  Available
/// on a running connection, cleared on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub server: String,
    pub version: String,
    pub proto: i64,
    pub id: i64,
    pub mode: String,
    pub role: String,
    pub modules: Vec<String>,
}

/// Builds the implicit handshake request: `HELLO 3` with optional `AUTH` and
/// `SETNAME` clauses, followed by `SELECT` when a database is configured.
pub(crate) fn handshake_request(settings: &Settings) -> Request {
    let mut args: Vec<String> = vec!["3".into()];
    if let Some(password) = &settings.password {
        let username = settings.username.as_deref().unwrap_or("default");
        args.push("AUTH".into());
        args.push(username.into());
        args.push(password.to_string());
    }
    if let Some(name) = &settings.client_name {
        args.push("SETNAME".into());
        args.push(name.to_string());
    }

    let mut req = Request::new();
    req.push("HELLO", args);
    if let Some(index) = settings.database {
        req.push("SELECT", (index,));
    }
    req
}

/// Reads the endpoint description out of a captured `HELLO` reply map.
/// Unknown keys are skipped, missing ones default; the caller has already
/// verified the root is a map.
pub(crate) fn parse_endpoint(tree: &NodeTree) -> ServerEndpoint {
    let nodes = &tree.nodes;
    let mut endpoint = ServerEndpoint::default();

    let mut i = 1;
    while i < nodes.len() {
        let key = &nodes[i];
        if key.depth != 1 || key.kind.is_aggregate() {
            i = subtree_end(tree, i);
            continue;
        }
        let name = String::from_utf8_lossy(&key.data).to_ascii_lowercase();
        let value_idx = i + 1;
        if value_idx >= nodes.len() {
            break;
        }
        let value = &nodes[value_idx];
        match name.as_str() {
            "server" => endpoint.server = String::from_utf8_lossy(&value.data).into_owned(),
            "version" => endpoint.version = String::from_utf8_lossy(&value.data).into_owned(),
            "mode" => endpoint.mode = String::from_utf8_lossy(&value.data).into_owned(),
            "role" => endpoint.role = String::from_utf8_lossy(&value.data).into_owned(),
            "proto" => endpoint.proto = parse_number(&value.data),
            "id" => endpoint.id = parse_number(&value.data),
            "modules" => {
                endpoint.modules = nodes[value_idx + 1..]
                    .iter()
                    .take_while(|n| n.depth > value.depth)
                    .filter(|n| !n.kind.is_aggregate())
                    .map(|n| String::from_utf8_lossy(&n.data).into_owned())
                    .collect();
            }
            _ => {}
        }
        i = subtree_end(tree, value_idx);
    }
    endpoint
}

/// Index of the first node after the subtree rooted at `idx`.
fn subtree_end(tree: &NodeTree, idx: usize) -> usize {
    let depth = tree.nodes[idx].depth;
    let mut end = idx + 1;
    while end < tree.nodes.len() && tree.nodes[end].depth > depth {
        end += 1;
    }
    end
}

fn parse_number(data: &[u8]) -> i64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}
