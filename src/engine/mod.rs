//! The reactive computation graph engine.
//!
//! An [`Engine`] owns a directed acyclic graph of nodes: mutable sources
//! ([`Engine::cell`], [`Engine::list`]), pure transforms ([`Engine::derive`]),
//! memoized asynchronous calls ([`Engine::call`]), conditionals
//! ([`Engine::if_else`]) and per-element mapped pipelines ([`Engine::map`]).
//!
//! Evaluation is cooperative and single-threaded: the scheduler never
//! blocks. An asynchronous call suspends by reporting
//! [`State::Pending`](crate::State) while its `exec` runs on the rayon pool;
//! settlement re-enters the scheduler through a channel and only the
//! transitively dependent nodes are recomputed.

mod deps;
mod map;
mod node;
mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;

pub use crate::engine::deps::{Dep, Dependencies, Input};
pub use crate::engine::node::{ElementId, ListNode, Node, Probe};

pub(crate) use crate::engine::node::{
    CallFn, CallOutcome, CollectFn, DeriveFn, Elements, InstantiateFn, MapElement, Slot, SlotKind,
};

use crate::cache::{CacheStore, CallRequest};
use crate::error::CallError;
use crate::hash::Fingerprint;
use crate::state::{Dynamic, State, Value};

/// The evaluator for one computation graph.
///
/// The cache store is injected at construction, so independent engines can
/// either share one store (cross-pattern dedup) or keep isolated caches
/// (tests). All observation goes through the single unwrap surface
/// [`get`](Self::get); values never auto-unwrap based on calling context.
pub struct Engine {
    pub(crate) graph: StableDiGraph<Slot, ()>,
    pub(crate) store: CacheStore,
    /// Nodes whose inputs changed since they were last evaluated.
    pub(crate) dirty: HashSet<NodeIndex>,
    /// Call nodes subscribed to each fingerprint's cache entry.
    pub(crate) subscriptions: HashMap<Fingerprint, HashSet<NodeIndex>>,
    /// Fingerprints with an outstanding execution we expect to hear about.
    pub(crate) inflight: HashSet<Fingerprint>,
    pub(crate) done_tx: Sender<Fingerprint>,
    pub(crate) done_rx: Receiver<Fingerprint>,
    /// Log of nodes created while instantiating a map element.
    pub(crate) recording: Option<Vec<NodeIndex>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_store(CacheStore::new())
    }

    pub fn with_store(store: CacheStore) -> Self {
        let (done_tx, done_rx) = channel();

        Self {
            graph: StableDiGraph::new(),
            store,
            dirty: HashSet::new(),
            subscriptions: HashMap::new(),
            inflight: HashSet::new(),
            done_tx,
            done_rx,
            recording: None,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    fn add_node(&mut self, slot: Slot) -> NodeIndex {
        let index = self.graph.add_node(slot);
        if let Some(recording) = &mut self.recording {
            recording.push(index);
        }
        index
    }

    /// Creates a mutable source cell holding `value`.
    pub fn cell<T>(&mut self, value: T) -> Node<T>
    where
        T: Send + Sync + 'static,
    {
        let index = self.add_node(Slot::new(SlotKind::Source, Value::ready(value)));
        Node::new(index)
    }

    /// Replaces the value of a source cell and recomputes its dependents.
    pub fn set<T>(&mut self, node: Node<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_inner(node, value);
        self.flush();
    }

    pub(crate) fn set_inner<T>(&mut self, node: Node<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let slot = &mut self.graph[node.index];
        assert!(
            matches!(slot.kind, SlotKind::Source),
            "Only source cells can be mutated directly"
        );

        slot.value = Value::ready(value);
        self.mark_dependents_dirty(node.index);
    }

    /// Creates a mutable list source with persistent per-element identity.
    pub fn list<T>(&mut self, values: impl IntoIterator<Item = T>) -> ListNode<T>
    where
        T: Send + Sync + 'static,
    {
        let mut next_id = 0u64;
        let elements: Elements = values
            .into_iter()
            .map(|value| {
                let id = ElementId(next_id);
                next_id += 1;
                (id, Arc::new(value) as Dynamic)
            })
            .collect();

        let index = self.add_node(Slot::new(
            SlotKind::List { next_id },
            Value::ready(elements),
        ));
        ListNode::new(index)
    }

    /// Appends an element, returning its persistent id. Existing elements
    /// and their subgraphs are untouched.
    pub fn push<T>(&mut self, list: ListNode<T>, value: T) -> ElementId
    where
        T: Send + Sync + 'static,
    {
        let id = self.push_inner(list, value);
        self.flush();
        id
    }

    pub(crate) fn push_inner<T>(&mut self, list: ListNode<T>, value: T) -> ElementId
    where
        T: Send + Sync + 'static,
    {
        let id = self.edit_list(list.index, |next_id, elements| {
            let id = ElementId(*next_id);
            *next_id += 1;
            elements.push((id, Arc::new(value) as Dynamic));
            id
        });
        self.mark_dependents_dirty(list.index);
        id
    }

    /// Replaces the value of one element, leaving its identity (and every
    /// sibling) untouched.
    pub fn set_item<T>(&mut self, list: ListNode<T>, id: ElementId, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_item_inner(list, id, value);
        self.flush();
    }

    pub(crate) fn set_item_inner<T>(&mut self, list: ListNode<T>, id: ElementId, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.edit_list(list.index, |_, elements| {
            let slot = elements
                .iter_mut()
                .find(|(eid, _)| *eid == id)
                .expect("Unknown element id");
            slot.1 = Arc::new(value) as Dynamic;
        });
        self.mark_dependents_dirty(list.index);
    }

    /// Removes an element; its per-element subgraph (and only its) is torn
    /// down on the next recomputation pass.
    pub fn remove<T>(&mut self, list: ListNode<T>, id: ElementId)
    where
        T: Send + Sync + 'static,
    {
        self.remove_inner(list, id);
        self.flush();
    }

    pub(crate) fn remove_inner<T>(&mut self, list: ListNode<T>, id: ElementId)
    where
        T: Send + Sync + 'static,
    {
        self.edit_list(list.index, |_, elements| {
            elements.retain(|(eid, _)| *eid != id);
        });
        self.mark_dependents_dirty(list.index);
    }

    fn edit_list<R>(&mut self, index: NodeIndex, edit: impl FnOnce(&mut u64, &mut Elements) -> R) -> R {
        let slot = &mut self.graph[index];
        let SlotKind::List { next_id } = &mut slot.kind else {
            panic!("Only list sources can be edited");
        };

        let Value::Ready(current) = &slot.value else {
            unreachable!("A list source is always ready");
        };
        let mut elements = current
            .downcast_ref::<Elements>()
            .expect("Type mismatch in list source")
            .clone();

        let result = edit(next_id, &mut elements);
        slot.value = Value::ready(elements);
        result
    }

    /// Current elements of a list source.
    pub fn items<T>(&self, list: ListNode<T>) -> Vec<(ElementId, Arc<T>)>
    where
        T: Send + Sync + 'static,
    {
        let Value::Ready(current) = &self.graph[list.index].value else {
            unreachable!("A list source is always ready");
        };

        current
            .downcast_ref::<Elements>()
            .expect("Type mismatch in list source")
            .iter()
            .map(|(id, item)| {
                let item = item
                    .clone()
                    .downcast::<T>()
                    .expect("Type mismatch in list element");
                (*id, item)
            })
            .collect()
    }

    /// Creates a pure transform over `deps`.
    ///
    /// The callback only runs once every dependency is resolved; pending or
    /// failed inputs propagate as the node's own state without invoking it.
    /// A callback error becomes [`State::Failed`] — errors are data here,
    /// never exceptions unwinding through the graph.
    pub fn derive<D, F, R>(&mut self, deps: D, callback: F) -> Node<R>
    where
        D: Dependencies + 'static,
        F: for<'a> Fn(D::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let indices = deps.indices();

        let run: DeriveFn = Arc::new(move |values| match deps.resolve(values) {
            Input::Ready(inputs) => match callback(inputs) {
                Ok(output) => Value::ready(output),
                Err(error) => Value::Failed(CallError::from(error)),
            },
            Input::Pending => Value::Pending,
            Input::Failed(error) => Value::Failed(error),
        });

        let index = self.add_node(Slot::new(
            SlotKind::Derive {
                deps: indices.clone(),
                run,
            },
            Value::Pending,
        ));
        for dep in indices {
            self.graph.add_edge(dep, index, ());
        }

        self.dirty.insert(index);
        Node::new(index)
    }

    /// Creates a memoized asynchronous call.
    ///
    /// Once every dependency is resolved, `request` builds the
    /// [`CallRequest`] whose key fully determines the fingerprint. Equal
    /// fingerprints anywhere in the graph share one cache entry and at most
    /// one in-flight execution; a changed fingerprint issues a new request
    /// and any stale in-flight result settles into the superseded entry.
    pub fn call<D, F, R>(&mut self, deps: D, request: F) -> Node<R>
    where
        D: Dependencies + 'static,
        F: for<'a> Fn(D::Output<'a>) -> CallRequest<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let indices = deps.indices();

        let build: CallFn = Arc::new(move |values| match deps.resolve(values) {
            Input::Ready(inputs) => {
                let request = request(inputs);
                let exec = request.exec;
                CallOutcome::Request {
                    key: request.key,
                    exec: Box::new(move || exec().map(|output| Arc::new(output) as Dynamic)),
                }
            }
            Input::Pending => CallOutcome::Blocked(Value::Pending),
            Input::Failed(error) => CallOutcome::Blocked(Value::Failed(error)),
        });

        let index = self.add_node(Slot::new(
            SlotKind::Call {
                deps: indices.clone(),
                build,
                fingerprint: None,
                entry: None,
            },
            Value::Pending,
        ));
        for dep in indices {
            self.graph.add_edge(dep, index, ());
        }

        self.dirty.insert(index);
        Node::new(index)
    }

    /// Creates a conditional over two lazily-activated branches.
    ///
    /// Only the branch selected by `cond` is ever evaluated; the other
    /// branch's subgraph stays inactive, so its calls are neither
    /// fingerprinted nor executed.
    pub fn if_else<T>(&mut self, cond: Node<bool>, then: Node<T>, otherwise: Node<T>) -> Node<T>
    where
        T: Send + Sync + 'static,
    {
        let index = self.add_node(Slot::new(
            SlotKind::IfElse {
                cond: cond.index,
                then: then.index,
                otherwise: otherwise.index,
                selected: None,
            },
            Value::Pending,
        ));

        self.graph.add_edge(cond.index, index, ());
        self.graph.add_edge(then.index, index, ());
        self.graph.add_edge(otherwise.index, index, ());

        self.dirty.insert(index);
        Node::new(index)
    }

    /// Maps every element of a list through its own stable subgraph.
    ///
    /// `item` runs exactly once per element identity, on first sight, to
    /// build that element's pipeline; appending N elements instantiates
    /// exactly N new subgraphs and re-fingerprints nothing else. The node's
    /// value is the in-order vector of per-element states, tolerant of
    /// partially settled siblings.
    pub fn map<T, R, F>(&mut self, list: ListNode<T>, item: F) -> Node<Vec<State<R>>>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(&mut Scope<'_>, Node<T>) -> Node<R> + Send + Sync + 'static,
    {
        let instantiate: InstantiateFn =
            Arc::new(move |scope, input| item(scope, Node::new(input)).index);

        let collect: CollectFn = Arc::new(|values| {
            let states: Vec<State<R>> = values.iter().map(|value| value.typed::<R>()).collect();
            Arc::new(states) as Dynamic
        });

        let index = self.add_node(Slot::new(
            SlotKind::MapList {
                source: list.index,
                instantiate,
                collect,
                elements: Vec::new(),
                aggregated: Vec::new(),
            },
            Value::Pending,
        ));
        self.graph.add_edge(list.index, index, ());

        self.dirty.insert(index);
        Node::new(index)
    }

    /// Observes a node, evaluating anything out of date first. The node is
    /// demanded directly, so it evaluates even when nothing downstream
    /// (or only an unselected branch) depends on it. Never blocks:
    /// in-flight calls report [`State::Pending`].
    pub fn get<T>(&mut self, node: Node<T>) -> State<T>
    where
        T: Send + Sync + 'static,
    {
        self.flush_demanding(Some(node.index));
        self.graph[node.index].value.typed()
    }

    /// Like [`get`](Self::get), already unwrapped to the settled value.
    pub fn value<T>(&mut self, node: Node<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get(node).value()
    }

    /// The current best-known state without triggering evaluation.
    pub fn peek<T>(&self, node: Node<T>) -> State<T>
    where
        T: Send + Sync + 'static,
    {
        self.graph[node.index].value.typed()
    }

    /// Coalesces several mutations into a single recomputation pass, so a
    /// downstream aggregation never observes a half-applied batch.
    pub fn update<F>(&mut self, mutations: F)
    where
        F: FnOnce(&mut Mutations<'_>),
    {
        let mut tx = Mutations { engine: self };
        mutations(&mut tx);
        self.flush();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.graph.node_count())
            .field("dirty", &self.dirty.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Graph-building surface handed to [`Engine::map`] item callbacks.
///
/// A scope builds the per-element subgraph: transforms, calls and
/// conditionals rooted at the element's input node. Sources cannot be
/// created here; an element's only external input is the element itself.
pub struct Scope<'a> {
    pub(crate) engine: &'a mut Engine,
}

impl<'a> Scope<'a> {
    pub fn derive<D, F, R>(&mut self, deps: D, callback: F) -> Node<R>
    where
        D: Dependencies + 'static,
        F: for<'b> Fn(D::Output<'b>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.engine.derive(deps, callback)
    }

    pub fn call<D, F, R>(&mut self, deps: D, request: F) -> Node<R>
    where
        D: Dependencies + 'static,
        F: for<'b> Fn(D::Output<'b>) -> CallRequest<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.engine.call(deps, request)
    }

    pub fn if_else<T>(&mut self, cond: Node<bool>, then: Node<T>, otherwise: Node<T>) -> Node<T>
    where
        T: Send + Sync + 'static,
    {
        self.engine.if_else(cond, then, otherwise)
    }
}

/// Mutation batch handed to [`Engine::update`].
pub struct Mutations<'a> {
    engine: &'a mut Engine,
}

impl<'a> Mutations<'a> {
    pub fn set<T>(&mut self, node: Node<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.engine.set_inner(node, value);
    }

    pub fn push<T>(&mut self, list: ListNode<T>, value: T) -> ElementId
    where
        T: Send + Sync + 'static,
    {
        self.engine.push_inner(list, value)
    }

    pub fn set_item<T>(&mut self, list: ListNode<T>, id: ElementId, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.engine.set_item_inner(list, id, value);
    }

    pub fn remove<T>(&mut self, list: ListNode<T>, id: ElementId)
    where
        T: Send + Sync + 'static,
    {
        self.engine.remove_inner(list, id);
    }
}
