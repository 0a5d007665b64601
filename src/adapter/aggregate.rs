/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Adapters for aggregate and composite targets.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{BuildHasher, Hash};
use std::iter;

use crate::error::{self, Error, ServerError, ServerErrorKind};
use crate::protocol::node::{AggregateSize, Node, NodeKind, NodeTree};

use super::{remote_error, FromResp3, NodeAdapter, Response, ResponseSink, TreeGuard};

/// Adapts `null` to `None` and defers everything else to the inner target.
pub struct OptionAdapter<T: FromResp3> {
    inner: Option<T::Adapter>,
    absent: bool,
}

impl<T: FromResp3> NodeAdapter for OptionAdapter<T> {
    type Output = Option<T>;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if self.inner.is_none() && !self.absent {
            if node.kind == NodeKind::Null {
                self.absent = true;
                return Ok(());
            }
            self.inner = Some(T::adapter());
        }
        match self.inner.as_mut() {
            Some(inner) => inner.on_node(node),
            None => Ok(()),
        }
    }

    fn is_complete(&self) -> bool {
        self.absent || matches!(&self.inner, Some(inner) if inner.is_complete())
    }

    fn finish(&mut self) -> Result<Option<T>, Error> {
        if self.absent {
            return Ok(None);
        }
        match self.inner.as_mut() {
            Some(inner) => inner.finish().map(Some),
            None => Err(error::internal("optional reply incomplete")),
        }
    }
}

impl<T: FromResp3> FromResp3 for Option<T> {
    type Adapter = OptionAdapter<T>;

    fn adapter() -> Self::Adapter {
        OptionAdapter {
            inner: None,
            absent: false,
        }
    }
}

/// Drives one child target per element of a sequence-shaped aggregate and
/// collects the results.  Also handles streamed roots, which end on the
/// zero-length chunk instead of a declared count.
pub struct SeqAdapter<T: FromResp3, C> {
    roots: &'static [NodeKind],
    expected: &'static str,
    size: Option<AggregateSize>,
    current: Option<T::Adapter>,
    out: C,
    count: usize,
    done: bool,
}

impl<T: FromResp3, C: Default> SeqAdapter<T, C> {
    fn new(roots: &'static [NodeKind], expected: &'static str) -> Self {
        SeqAdapter {
            roots,
            expected,
            size: None,
            current: None,
            out: C::default(),
            count: 0,
            done: false,
        }
    }
}

impl<T, C> NodeAdapter for SeqAdapter<T, C>
where
    T: FromResp3,
    C: Default + Extend<T> + Send,
{
    type Output = C;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if self.size.is_none() {
            if let Some(err) = remote_error(node) {
                return Err(Error::Remote(err));
            }
            if node.kind == NodeKind::Null {
                return Err(Error::NullUnexpected);
            }
            if !self.roots.contains(&node.kind) {
                return Err(Error::wrong_type(self.expected, node.kind));
            }
            self.size = Some(node.size);
            if node.size == AggregateSize::Finite(0) {
                self.done = true;
            }
            return Ok(());
        }

        // End of a streamed sequence: the terminating chunk arrives at the
        // element level while no element is being built.
        if self.current.is_none()
            && node.kind == NodeKind::StreamedStringPart
            && node.data.is_empty()
        {
            self.done = true;
            return Ok(());
        }

        let child = self.current.get_or_insert_with(T::adapter);
        child.on_node(node)?;
        if child.is_complete() {
            let mut child = match self.current.take() {
                Some(child) => child,
                None => return Err(error::internal("sequence element vanished")),
            };
            self.out.extend(iter::once(child.finish()?));
            self.count += 1;
            if let Some(AggregateSize::Finite(n)) = self.size {
                if self.count == n {
                    self.done = true;
                }
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn finish(&mut self) -> Result<C, Error> {
        if !self.done {
            return Err(error::internal("sequence reply incomplete"));
        }
        Ok(std::mem::take(&mut self.out))
    }
}

const SEQUENCE_ROOTS: &[NodeKind] = &[NodeKind::Array, NodeKind::Push];
const SET_ROOTS: &[NodeKind] = &[NodeKind::Set];

impl<T: FromResp3> FromResp3 for Vec<T> {
    type Adapter = SeqAdapter<T, Vec<T>>;

    fn adapter() -> Self::Adapter {
        SeqAdapter::new(SEQUENCE_ROOTS, "array")
    }
}

impl<T, S> FromResp3 for HashSet<T, S>
where
    T: FromResp3 + Eq + Hash,
    S: BuildHasher + Default + Send + 'static,
{
    type Adapter = SeqAdapter<T, HashSet<T, S>>;

    fn adapter() -> Self::Adapter {
        SeqAdapter::new(SET_ROOTS, "set")
    }
}

impl<T> FromResp3 for BTreeSet<T>
where
    T: FromResp3 + Ord,
{
    type Adapter = SeqAdapter<T, BTreeSet<T>>;

    fn adapter() -> Self::Adapter {
        SeqAdapter::new(SET_ROOTS, "set")
    }
}

/// Drives alternating key and value targets below a map root.  The map
/// header declares the flat slot count, so a map of `n` pairs completes
/// after `2·n` element subtrees.
pub struct MapAdapter<K: FromResp3, V: FromResp3, C> {
    size: Option<AggregateSize>,
    key: Option<K::Adapter>,
    value: Option<V::Adapter>,
    pending_key: Option<K>,
    out: C,
    slots: usize,
    done: bool,
}

impl<K, V, C> NodeAdapter for MapAdapter<K, V, C>
where
    K: FromResp3,
    V: FromResp3,
    C: Default + Extend<(K, V)> + Send,
{
    type Output = C;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if self.size.is_none() {
            if let Some(err) = remote_error(node) {
                return Err(Error::Remote(err));
            }
            if node.kind == NodeKind::Null {
                return Err(Error::NullUnexpected);
            }
            if node.kind != NodeKind::Map {
                return Err(Error::wrong_type("map", node.kind));
            }
            self.size = Some(node.size);
            if node.size == AggregateSize::Finite(0) {
                self.done = true;
            }
            return Ok(());
        }

        if let Some(key) = self.key.as_mut() {
            key.on_node(node)?;
            if key.is_complete() {
                let mut adapter = match self.key.take() {
                    Some(adapter) => adapter,
                    None => return Err(error::internal("map key vanished")),
                };
                self.pending_key = Some(adapter.finish()?);
                self.slots += 1;
            }
            return Ok(());
        }
        if let Some(value) = self.value.as_mut() {
            value.on_node(node)?;
            if value.is_complete() {
                let mut adapter = match self.value.take() {
                    Some(adapter) => adapter,
                    None => return Err(error::internal("map value vanished")),
                };
                let key = match self.pending_key.take() {
                    Some(key) => key,
                    None => return Err(error::internal("map key missing")),
                };
                self.out.extend(iter::once((key, adapter.finish()?)));
                self.slots += 1;
                if let Some(AggregateSize::Finite(n)) = self.size {
                    if self.slots == n {
                        self.done = true;
                    }
                }
            }
            return Ok(());
        }

        if node.kind == NodeKind::StreamedStringPart && node.data.is_empty() {
            // end of a streamed map; a dangling key means the stream lied
            if self.pending_key.is_some() {
                return Err(Error::IncompatibleSize);
            }
            self.done = true;
            return Ok(());
        }

        if self.pending_key.is_none() {
            self.key = Some(K::adapter());
        } else {
            self.value = Some(V::adapter());
        }
        self.on_node(node)
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn finish(&mut self) -> Result<C, Error> {
        if !self.done {
            return Err(error::internal("map reply incomplete"));
        }
        Ok(std::mem::take(&mut self.out))
    }
}

impl<K, V, S> FromResp3 for HashMap<K, V, S>
where
    K: FromResp3 + Eq + Hash,
    V: FromResp3,
    S: BuildHasher + Default + Send + 'static,
{
    type Adapter = MapAdapter<K, V, HashMap<K, V, S>>;

    fn adapter() -> Self::Adapter {
        MapAdapter {
            size: None,
            key: None,
            value: None,
            pending_key: None,
            out: HashMap::default(),
            slots: 0,
            done: false,
        }
    }
}

impl<K, V> FromResp3 for BTreeMap<K, V>
where
    K: FromResp3 + Ord,
    V: FromResp3,
{
    type Adapter = MapAdapter<K, V, BTreeMap<K, V>>;

    fn adapter() -> Self::Adapter {
        MapAdapter {
            size: None,
            key: None,
            value: None,
            pending_key: None,
            out: BTreeMap::new(),
            slots: 0,
            done: false,
        }
    }
}

/// Captures a whole reply verbatim, server errors included.
pub struct NodeTreeAdapter {
    tree: NodeTree,
    guard: TreeGuard,
}

impl NodeAdapter for NodeTreeAdapter {
    type Output = NodeTree;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        self.tree.nodes.push(node.to_owned());
        self.guard.push_node(node);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.guard.is_complete()
    }

    fn finish(&mut self) -> Result<NodeTree, Error> {
        Ok(std::mem::take(&mut self.tree))
    }
}

impl FromResp3 for NodeTree {
    type Adapter = NodeTreeAdapter;

    fn adapter() -> NodeTreeAdapter {
        NodeTreeAdapter {
            tree: NodeTree::default(),
            guard: TreeGuard::new(),
        }
    }
}

enum ResultState<A> {
    Start,
    Inner(A),
    Remote {
        kind: ServerErrorKind,
        message: Vec<u8>,
        streaming: bool,
        done: bool,
    },
}

/// Captures server errors as data instead of failing the request, deferring
/// everything else to the inner target.
pub struct ResultAdapter<T: FromResp3> {
    state: ResultState<T::Adapter>,
}

impl<T: FromResp3> NodeAdapter for ResultAdapter<T> {
    type Output = Result<T, ServerError>;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if matches!(self.state, ResultState::Start) {
            let kind = match node.kind {
                NodeKind::SimpleError => Some(ServerErrorKind::Simple),
                NodeKind::BlobError => Some(ServerErrorKind::Blob),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    self.state = ResultState::Remote {
                        kind,
                        message: node.data.to_vec(),
                        streaming: node.size.is_streamed(),
                        done: !node.size.is_streamed(),
                    };
                }
                None => {
                    let mut inner = T::adapter();
                    inner.on_node(node)?;
                    self.state = ResultState::Inner(inner);
                }
            }
            return Ok(());
        }
        match &mut self.state {
            ResultState::Start => Ok(()),
            ResultState::Inner(inner) => inner.on_node(node),
            ResultState::Remote {
                message,
                streaming,
                done,
                ..
            } => {
                if *streaming && node.kind == NodeKind::StreamedStringPart {
                    if node.data.is_empty() {
                        *done = true;
                    } else {
                        message.extend_from_slice(node.data);
                    }
                }
                Ok(())
            }
        }
    }

    fn is_complete(&self) -> bool {
        match &self.state {
            ResultState::Start => false,
            ResultState::Inner(inner) => inner.is_complete(),
            ResultState::Remote { done, .. } => *done,
        }
    }

    fn finish(&mut self) -> Result<Result<T, ServerError>, Error> {
        match &mut self.state {
            ResultState::Start => Err(error::internal("reply incomplete")),
            ResultState::Inner(inner) => inner.finish().map(Ok),
            ResultState::Remote { kind, message, .. } => Ok(Err(ServerError::new(
                *kind,
                String::from_utf8_lossy(message).into_owned(),
            ))),
        }
    }
}

impl<T: FromResp3> FromResp3 for Result<T, ServerError> {
    type Adapter = ResultAdapter<T>;

    fn adapter() -> Self::Adapter {
        ResultAdapter {
            state: ResultState::Start,
        }
    }
}

/// The reply of `EXEC`: a single array whose children are the replies of the
/// queued commands, forwarded one by one to the wrapped pipeline target.
///
/// A request `[MULTI, LRANGE …, HGETALL …, EXEC]` is adapted by
/// `((), (), (), Transaction<(Vec<i64>, HashMap<String, String>)>)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction<T>(pub T);

impl<T> Transaction<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

pub struct TransactionAdapter<T: Response> {
    sink: T::Sink,
    size: Option<AggregateSize>,
    child: Option<TreeGuard>,
    seen: usize,
    failed: Option<Error>,
    done: bool,
}

impl<T: Response> NodeAdapter for TransactionAdapter<T> {
    type Output = Transaction<T>;

    fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
        if self.size.is_none() {
            if let Some(err) = remote_error(node) {
                return Err(Error::Remote(err));
            }
            match node.kind {
                NodeKind::Null => return Err(Error::NullUnexpected),
                NodeKind::Array => {}
                _ => return Err(Error::ExpectsAggregateType),
            }
            if let AggregateSize::Finite(n) = node.size {
                if let Some(expected) = T::REPLIES {
                    if expected != n {
                        return Err(Error::SizeMismatch {
                            expected,
                            found: n,
                        });
                    }
                }
                if n == 0 {
                    self.done = true;
                }
            }
            self.size = Some(node.size);
            return Ok(());
        }

        if self.child.is_none()
            && node.kind == NodeKind::StreamedStringPart
            && node.data.is_empty()
        {
            self.done = true;
            return Ok(());
        }

        let guard = self.child.get_or_insert_with(TreeGuard::new);
        guard.push_node(node);
        let child_done = guard.is_complete();
        if self.failed.is_none() {
            if let Err(e) = self.sink.on_node(node) {
                self.failed = Some(e);
            }
        }
        if child_done {
            self.child = None;
            self.seen += 1;
            self.sink.end_reply();
            if let Some(AggregateSize::Finite(n)) = self.size {
                if self.seen == n {
                    self.done = true;
                }
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn finish(&mut self) -> Result<Transaction<T>, Error> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        self.sink.finish().map(Transaction)
    }
}

impl<T: Response> FromResp3 for Transaction<T> {
    type Adapter = TransactionAdapter<T>;

    fn adapter() -> Self::Adapter {
        TransactionAdapter {
            sink: T::sink(),
            size: None,
            child: None,
            seen: 0,
            failed: None,
            done: false,
        }
    }
}
