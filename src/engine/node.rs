use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::cache::CacheEntry;
use crate::hash::Fingerprint;
use crate::state::{Dynamic, Value};

/// A type-safe reference to a node in the computation graph.
///
/// A `Node<T>` is a lightweight token identifying a graph *position*; the
/// identity is structural, never derived from the node's current value, so a
/// node can tell "my input changed" apart from "I am a new node".
///
/// # Phantom handles
///
/// Under the hood the graph is entirely type-erased: every value is stored
/// as `Arc<dyn Any + Send + Sync>`. The handle carries `T` in `PhantomData`
/// so the compiler enforces that a dependent receives exactly the type its
/// upstream produces; the downcast at resolution time only panics if the
/// strictly-typed construction was somehow bypassed.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Node<T> {
    pub(crate) index: NodeIndex,
    _phantom: PhantomData<T>,
}

impl<T> Node<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the node in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Wraps the handle so that a dependent observes the full tri-state
    /// instead of the auto-propagated plain value. Use this where pattern
    /// logic wants to substitute fallbacks for failures or aggregate
    /// partially settled siblings.
    pub fn probe(self) -> Probe<T> {
        Probe(self)
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Node<T> {}

/// A dependency view that resolves to the dependency's [`State`](crate::State)
/// rather than short-circuiting on `Pending`/`Failed`. See [`Node::probe`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Probe<T>(pub(crate) Node<T>);

impl<T> Clone for Probe<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Probe<T> {}

/// A type-safe reference to a mutable list source.
///
/// Elements carry persistent [`ElementId`]s assigned at insertion, so
/// reordering or removal never disturbs the identity (or the cached
/// per-element subgraphs) of unrelated elements.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListNode<T> {
    pub(crate) index: NodeIndex,
    _phantom: PhantomData<T>,
}

impl<T> ListNode<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<T> Clone for ListNode<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ListNode<T> {}

/// Persistent identity of a list element, never reused within its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) u64);

/// The stored payload of a list source: per-element identity plus the
/// type-erased element value.
pub(crate) type Elements = Vec<(ElementId, Dynamic)>;

pub(crate) type DeriveFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

pub(crate) type CallFn = Arc<dyn Fn(&[Value]) -> CallOutcome + Send + Sync>;

pub(crate) type InstantiateFn =
    Arc<dyn Fn(&mut crate::engine::Scope<'_>, NodeIndex) -> NodeIndex + Send + Sync>;

pub(crate) type CollectFn = Arc<dyn Fn(&[Value]) -> Dynamic + Send + Sync>;

/// What a call node wants to do after looking at its resolved inputs.
pub(crate) enum CallOutcome {
    /// An input is still pending or already failed; the node mirrors it and
    /// defers fingerprinting until all inputs are resolved.
    Blocked(Value),
    /// All inputs resolved: fingerprint `key` and route through the store.
    Request {
        key: serde_json::Result<serde_json::Value>,
        exec: Box<dyn FnOnce() -> anyhow::Result<Dynamic> + Send>,
    },
}

/// One element's instantiated subgraph inside a mapped list.
pub(crate) struct MapElement {
    /// Source node seeded with the element's value.
    pub input: NodeIndex,
    /// The node whose state represents this element's pipeline result.
    pub output: NodeIndex,
    /// Every node created while instantiating this element, torn down
    /// together when the element is removed from the source list.
    pub created: Vec<NodeIndex>,
}

pub(crate) enum SlotKind {
    /// Externally mutable cell.
    Source,
    /// Externally mutable keyed sequence.
    List { next_id: u64 },
    /// Pure transform over resolved inputs.
    Derive {
        deps: Vec<NodeIndex>,
        run: DeriveFn,
    },
    /// Memoized asynchronous call, keyed by the fingerprint of its resolved
    /// inputs and backed by a shared cache entry.
    Call {
        deps: Vec<NodeIndex>,
        build: CallFn,
        fingerprint: Option<Fingerprint>,
        entry: Option<Arc<CacheEntry>>,
    },
    /// Conditional selecting one of two lazily-activated subgraphs.
    IfElse {
        cond: NodeIndex,
        then: NodeIndex,
        otherwise: NodeIndex,
        selected: Option<bool>,
    },
    /// Per-element stable subgraphs over a list source.
    MapList {
        source: NodeIndex,
        instantiate: InstantiateFn,
        collect: CollectFn,
        elements: Vec<(ElementId, MapElement)>,
        /// Element output values at the last aggregation; when the next
        /// aggregation is pointwise identical, the aggregate allocation is
        /// reused so dependents are not revisited.
        aggregated: Vec<Value>,
    },
}

pub(crate) struct Slot {
    pub kind: SlotKind,
    pub value: Value,
}

impl Slot {
    pub(crate) fn new(kind: SlotKind, value: Value) -> Self {
        Self { kind, value }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            SlotKind::Source => "Source",
            SlotKind::List { .. } => "List",
            SlotKind::Derive { .. } => "Derive",
            SlotKind::Call { .. } => "Call",
            SlotKind::IfElse { .. } => "IfElse",
            SlotKind::MapList { .. } => "MapList",
        };
        write!(f, "Slot({kind}, {:?})", self.value)
    }
}
