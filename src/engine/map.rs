//! Per-element stable subgraphs over list sources.
//!
//! A map node diffs its source list by [`ElementId`] on every evaluation.
//! An id seen for the first time gets its own subgraph, instantiated once
//! and kept for as long as the id stays in the list; a kept id whose value
//! changed is re-seeded in place; a removed id has its subgraph torn down.
//! Sibling elements never observe each other's churn.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::engine::{ElementId, Elements, Engine, MapElement, Scope, Slot, SlotKind};
use crate::state::Value;

impl Engine {
    pub(crate) fn evaluate_map(&mut self, index: NodeIndex) {
        let (source, instantiate, collect, previous, last) = match &mut self.graph[index].kind {
            SlotKind::MapList {
                source,
                instantiate,
                collect,
                elements,
                aggregated,
            } => (
                *source,
                instantiate.clone(),
                collect.clone(),
                mem::take(elements),
                mem::take(aggregated),
            ),
            _ => unreachable!("evaluate_map on a non-map node"),
        };

        let current: Elements = {
            let Value::Ready(value) = &self.graph[source].value else {
                unreachable!("A list source is always ready");
            };
            value
                .downcast_ref::<Elements>()
                .expect("Type mismatch in list source")
                .clone()
        };

        let mut previous: HashMap<ElementId, MapElement> = previous.into_iter().collect();
        let mut elements: Vec<(ElementId, MapElement)> = Vec::with_capacity(current.len());

        for (id, value) in current {
            match previous.remove(&id) {
                // A kept element: re-seed its input only if the value is a
                // different allocation than last time.
                Some(element) => {
                    let changed = match &self.graph[element.input].value {
                        Value::Ready(existing) => !Arc::ptr_eq(existing, &value),
                        _ => true,
                    };
                    if changed {
                        self.graph[element.input].value = Value::Ready(value);
                        self.mark_dependents_dirty(element.input);
                    }
                    elements.push((id, element));
                }
                // A new identity: instantiate its subgraph exactly once,
                // logging created nodes for later teardown.
                None => {
                    let input = self.graph.add_node(Slot::new(
                        SlotKind::Source,
                        Value::Ready(value),
                    ));
                    let saved = self.recording.replace(vec![input]);

                    let output = {
                        let mut scope = Scope { engine: self };
                        instantiate(&mut scope, input)
                    };

                    let created = mem::replace(&mut self.recording, saved)
                        .unwrap_or_default();
                    self.graph.add_edge(output, index, ());
                    elements.push((
                        id,
                        MapElement {
                            input,
                            output,
                            created,
                        },
                    ));
                }
            }
        }

        for element in previous.into_values() {
            self.remove_subgraph(&element);
        }

        let states: Vec<Value> = elements
            .iter()
            .map(|(_, element)| self.graph[element.output].value.clone())
            .collect();

        // A pointwise-identical aggregation keeps the previous allocation,
        // so dependents are not revisited for nothing.
        let unchanged = matches!(self.graph[index].value, Value::Ready(_))
            && states.len() == last.len()
            && states.iter().zip(&last).all(|(now, then)| now.same_as(then));
        if !unchanged {
            self.graph[index].value = Value::Ready(collect(&states));
        }

        if let SlotKind::MapList {
            elements: slot_elements,
            aggregated,
            ..
        } = &mut self.graph[index].kind
        {
            *slot_elements = elements;
            *aggregated = states;
        }
    }

    /// Removes every node an element's instantiation created, detaching
    /// call subscriptions first so stale settlements don't dirty a freed
    /// index.
    fn remove_subgraph(&mut self, element: &MapElement) {
        for &node in &element.created {
            if !self.graph.contains_node(node) {
                continue;
            }

            if let SlotKind::Call {
                entry: Some(entry), ..
            } = &self.graph[node].kind
            {
                let entry = entry.clone();
                self.detach(node, &entry);
            }

            self.graph.remove_node(node);
            self.dirty.remove(&node);
        }
    }
}
