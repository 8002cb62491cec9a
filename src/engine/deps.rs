use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::engine::node::{ElementId, Elements, ListNode, Node, Probe};
use crate::error::CallError;
use crate::state::{State, Value};

/// A resolved dependency view: either all inputs are ready, or the
/// unresolved tri-state that the dependent node mirrors.
///
/// `Pending` dominates `Failed`: an input that has not settled yet is not an
/// error, and the error (if any) only propagates once everything upstream
/// has stopped moving.
pub enum Input<T> {
    Ready(T),
    Pending,
    Failed(CallError),
}

/// Things that can be used as a single dependency of a node.
pub trait Dep: Copy + Send + Sync {
    type Output<'a>;

    fn index(&self) -> NodeIndex;
    fn resolve<'a>(&self, value: &'a Value) -> Input<Self::Output<'a>>;
}

impl<T> Dep for Node<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn index(&self) -> NodeIndex {
        self.index
    }

    fn resolve<'a>(&self, value: &'a Value) -> Input<Self::Output<'a>> {
        match value {
            Value::Ready(value) => Input::Ready(
                value
                    .downcast_ref::<T>()
                    .expect("Type mismatch in dependency resolution"),
            ),
            Value::Pending => Input::Pending,
            Value::Failed(error) => Input::Failed(error.clone()),
        }
    }
}

impl<T> Dep for Probe<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = State<T>;

    fn index(&self) -> NodeIndex {
        self.0.index
    }

    fn resolve<'a>(&self, value: &'a Value) -> Input<Self::Output<'a>> {
        // The probe never blocks: the tri-state itself is the input.
        Input::Ready(value.typed::<T>())
    }
}

impl<T> Dep for ListNode<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = Vec<(ElementId, Arc<T>)>;

    fn index(&self) -> NodeIndex {
        self.index
    }

    fn resolve<'a>(&self, value: &'a Value) -> Input<Self::Output<'a>> {
        match value {
            Value::Ready(value) => {
                let elements = value
                    .downcast_ref::<Elements>()
                    .expect("Type mismatch in list resolution");

                Input::Ready(
                    elements
                        .iter()
                        .map(|(id, item)| {
                            let item = item
                                .clone()
                                .downcast::<T>()
                                .expect("Type mismatch in list element resolution");
                            (*id, item)
                        })
                        .collect(),
                )
            }
            Value::Pending => Input::Pending,
            Value::Failed(error) => Input::Failed(error.clone()),
        }
    }
}

/// A trait that enables a collection of [`Dep`]s to be used as the
/// dependencies of a node.
///
/// This trait is implemented for single handles, tuples of handles, and
/// `Vec`s of handles. It records the input edges for the graph builder and
/// resolves type-erased upstream values into the concrete tuple the node's
/// callback receives.
pub trait Dependencies: Send + Sync {
    /// The resulting type when all dependencies are resolved.
    type Output<'a>;

    /// Returns the [`NodeIndex`] for each dependency in the collection.
    fn indices(&self) -> Vec<NodeIndex>;

    /// Resolves the slice of upstream values (one per index, in order) into
    /// the concrete `Output`, or the dominating unresolved state.
    fn resolve<'a>(&self, values: &'a [Value]) -> Input<Self::Output<'a>>;
}

impl Dependencies for () {
    type Output<'a> = ();

    fn indices(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Value]) -> Input<Self::Output<'a>> {
        Input::Ready(())
    }
}

impl<D> Dependencies for D
where
    D: Dep,
{
    type Output<'a> = D::Output<'a>;

    fn indices(&self) -> Vec<NodeIndex> {
        vec![Dep::index(self)]
    }

    fn resolve<'a>(&self, values: &'a [Value]) -> Input<Self::Output<'a>> {
        Dep::resolve(self, &values[0])
    }
}

impl<D> Dependencies for Vec<D>
where
    D: Dep,
{
    type Output<'a> = Vec<D::Output<'a>>;

    fn indices(&self) -> Vec<NodeIndex> {
        self.iter().map(|dep| dep.index()).collect()
    }

    fn resolve<'a>(&self, values: &'a [Value]) -> Input<Self::Output<'a>> {
        let mut result = Vec::with_capacity(self.len());
        let mut failed = None;

        for (dep, value) in self.iter().zip(values) {
            match dep.resolve(value) {
                Input::Ready(item) => result.push(item),
                Input::Pending => return Input::Pending,
                Input::Failed(error) => failed = failed.or(Some(error)),
            }
        }

        match failed {
            Some(error) => Input::Failed(error),
            None => Input::Ready(result),
        }
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Dep),* {
            type Output<'a> = ($($D::Output<'a>,)*);

            fn indices(&self) -> Vec<NodeIndex> {
                let ($($D,)*) = self;
                vec![$(Dep::index($D),)*]
            }

            fn resolve<'a>(&self, values: &'a [Value]) -> Input<Self::Output<'a>> {
                let ($($D,)*) = self;

                let mut iter = values.iter();
                $(
                    let $D = $D.resolve(iter.next().expect("Arity mismatch in dependency resolution"));
                )*

                // An unresolved input trumps a failed one.
                if $(matches!($D, Input::Pending))||* {
                    return Input::Pending;
                }

                $(
                    let $D = match $D {
                        Input::Ready(item) => item,
                        Input::Failed(error) => return Input::Failed(error),
                        Input::Pending => unreachable!(),
                    };
                )*

                Input::Ready(($($D,)*))
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
