use std::any::Any;
use std::sync::Arc;

use crate::error::CallError;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// The observed state of a node.
///
/// Asynchrony in the graph is a value, not a control-flow effect. Any node
/// whose inputs are still in flight reports `Pending`; a call whose
/// `exec` failed reports `Failed`; everything else is `Ready`. The settled
/// variants hold shared immutable data, so two observers of the same cache
/// entry receive pointer-identical values.
///
/// For a fixed fingerprint the state only moves forward: `Pending` settles
/// into `Ready` or `Failed` exactly once and never reverts.
#[derive(Debug)]
pub enum State<T> {
    Pending,
    Ready(Arc<T>),
    Failed(CallError),
}

impl<T> State<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, State::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, State::Failed(_))
    }

    /// Borrows the settled value, if any.
    pub fn ready(&self) -> Option<&T> {
        match self {
            State::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Clones out the shared settled value, if any.
    pub fn value(&self) -> Option<Arc<T>> {
        match self {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        match self {
            State::Pending => State::Pending,
            State::Ready(value) => State::Ready(value.clone()),
            State::Failed(error) => State::Failed(error.clone()),
        }
    }
}

/// The internal, type-erased counterpart of [`State`], stored per node and
/// per cache entry.
#[derive(Clone)]
pub(crate) enum Value {
    Pending,
    Ready(Dynamic),
    Failed(CallError),
}

impl Value {
    pub(crate) fn ready<T: Send + Sync + 'static>(value: T) -> Self {
        Value::Ready(Arc::new(value))
    }

    /// Downcasts into the typed public view.
    ///
    /// # Panics
    /// Panics on a type mismatch, which indicates that the strictly-typed
    /// handle construction was somehow bypassed.
    pub(crate) fn typed<T: Send + Sync + 'static>(&self) -> State<T> {
        match self {
            Value::Pending => State::Pending,
            Value::Ready(value) => State::Ready(
                value
                    .clone()
                    .downcast::<T>()
                    .expect("Type mismatch in node observation"),
            ),
            Value::Failed(error) => State::Failed(error.clone()),
        }
    }

    /// Cheap identity comparison used by the scheduler to decide whether
    /// dependents need to be revisited. Settled values are immutable shared
    /// pointers, so pointer equality is exact.
    pub(crate) fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Pending, Value::Pending) => true,
            (Value::Ready(a), Value::Ready(b)) => Arc::ptr_eq(a, b),
            (Value::Failed(a), Value::Failed(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Pending => write!(f, "Pending"),
            Value::Ready(_) => write!(f, "Ready(*)"),
            Value::Failed(error) => write!(f, "Failed({error})"),
        }
    }
}
