//! Incremental recomputation.
//!
//! A mutation (or a call settlement) marks the direct dependents of the
//! changed node dirty. A recomputation pass then:
//!
//! 1. computes the *active set* — a reverse walk from the graph's roots
//!    that, at every conditional, descends only into the currently selected
//!    branch, so unselected subgraphs stay cold;
//! 2. topologically sorts the graph and evaluates the dirty, active nodes
//!    in dependency order, exactly once each;
//! 3. repeats when evaluation changed the structure (a mapped list
//!    instantiated new element subgraphs, a conditional switched branches)
//!    until a fixpoint.
//!
//! Evaluation itself never blocks and never re-enters the pass: a call node
//! only recomputes its fingerprint (cheap) and consults the store; the
//! actual execution runs on the rayon pool and re-enters through the
//! settlement channel.

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::CacheEntry;
use crate::engine::{CallFn, CallOutcome, DeriveFn, Engine, SlotKind};
use crate::error::CallError;
use crate::hash::Fingerprint;
use crate::state::Value;

impl Engine {
    pub(crate) fn mark_dependents_dirty(&mut self, index: NodeIndex) {
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        self.dirty.extend(dependents);
    }

    /// Runs recomputation passes until nothing active is dirty.
    pub(crate) fn flush(&mut self) {
        self.flush_demanding(None);
    }

    /// Like [`flush`](Self::flush), with `demanded` injected as an extra
    /// demand root, so a directly observed node evaluates even when its
    /// only dependent sits on an unselected branch.
    pub(crate) fn flush_demanding(&mut self, demanded: Option<NodeIndex>) {
        self.adopt_foreign_settlements();

        loop {
            if self.dirty.is_empty() {
                return;
            }

            let active = self.active_set(demanded);
            let order = petgraph::algo::toposort(&self.graph, None)
                .expect("Cycle detected in computation graph");

            let mut progressed = false;

            for index in order {
                // Evaluating a map node may tear down element subgraphs
                // that appear later in this pass's order.
                if !self.graph.contains_node(index) {
                    self.dirty.remove(&index);
                    continue;
                }

                if !self.dirty.contains(&index) || !active.contains(&index) {
                    continue;
                }

                self.dirty.remove(&index);
                let before = self.graph[index].value.clone();
                self.evaluate(index);
                progressed = true;

                if !self.graph[index].value.same_as(&before) {
                    self.mark_dependents_dirty(index);
                }
            }

            // Whatever is left dirty sits on unselected branches; it stays
            // cold until some conditional picks it.
            if !progressed {
                return;
            }
        }
    }

    /// The demand-reachable part of the graph: everything transitively
    /// needed by the roots, where a conditional only demands its condition
    /// and its currently selected branch.
    fn active_set(&self, demanded: Option<NodeIndex>) -> HashSet<NodeIndex> {
        let mut active = HashSet::new();
        let mut stack: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect();
        stack.extend(demanded);

        while let Some(index) = stack.pop() {
            if !active.insert(index) {
                continue;
            }

            match &self.graph[index].kind {
                SlotKind::Source | SlotKind::List { .. } => {}
                SlotKind::Derive { deps, .. } | SlotKind::Call { deps, .. } => {
                    stack.extend(deps.iter().copied());
                }
                SlotKind::IfElse {
                    cond,
                    then,
                    otherwise,
                    selected,
                } => {
                    stack.push(*cond);
                    match selected {
                        Some(true) => stack.push(*then),
                        Some(false) => stack.push(*otherwise),
                        // Until the condition settles neither branch is
                        // demanded.
                        None => {}
                    }
                }
                SlotKind::MapList {
                    source, elements, ..
                } => {
                    stack.push(*source);
                    stack.extend(elements.iter().map(|(_, element)| element.output));
                }
            }
        }

        active
    }

    pub(crate) fn evaluate(&mut self, index: NodeIndex) {
        enum Plan {
            Noop,
            Derive(Vec<NodeIndex>, DeriveFn),
            Call(Vec<NodeIndex>, CallFn),
            IfElse(NodeIndex, NodeIndex, NodeIndex),
            Map,
        }

        let plan = match &self.graph[index].kind {
            SlotKind::Source | SlotKind::List { .. } => Plan::Noop,
            SlotKind::Derive { deps, run } => Plan::Derive(deps.clone(), run.clone()),
            SlotKind::Call { deps, build, .. } => Plan::Call(deps.clone(), build.clone()),
            SlotKind::IfElse {
                cond,
                then,
                otherwise,
                ..
            } => Plan::IfElse(*cond, *then, *otherwise),
            SlotKind::MapList { .. } => Plan::Map,
        };

        match plan {
            Plan::Noop => {}
            Plan::Derive(deps, run) => {
                let values = self.values_of(&deps);
                self.graph[index].value = run(&values);
            }
            Plan::Call(deps, build) => {
                let values = self.values_of(&deps);
                let outcome = build(&values);
                self.apply_call(index, outcome);
            }
            Plan::IfElse(cond, then, otherwise) => {
                self.evaluate_if_else(index, cond, then, otherwise);
            }
            Plan::Map => self.evaluate_map(index),
        }
    }

    fn values_of(&self, deps: &[NodeIndex]) -> Vec<Value> {
        deps.iter().map(|&dep| self.graph[dep].value.clone()).collect()
    }

    fn evaluate_if_else(
        &mut self,
        index: NodeIndex,
        cond: NodeIndex,
        then: NodeIndex,
        otherwise: NodeIndex,
    ) {
        let (selected, value) = match &self.graph[cond].value {
            Value::Pending => (None, Value::Pending),
            Value::Failed(error) => (None, Value::Failed(error.clone())),
            Value::Ready(flag) => {
                let flag = *flag
                    .downcast_ref::<bool>()
                    .expect("Type mismatch in condition resolution");
                let chosen = if flag { then } else { otherwise };

                // Best-known state of the chosen branch; if the branch was
                // cold until now, the next pass warms it up and revisits us.
                (Some(flag), self.graph[chosen].value.clone())
            }
        };

        if let SlotKind::IfElse {
            selected: slot_selected,
            ..
        } = &mut self.graph[index].kind
        {
            *slot_selected = selected;
        }
        self.graph[index].value = value;
    }

    fn apply_call(&mut self, index: NodeIndex, outcome: CallOutcome) {
        match outcome {
            // Inputs not resolved: mirror them, defer fingerprinting.
            CallOutcome::Blocked(value) => {
                self.graph[index].value = value;
            }
            CallOutcome::Request { key, exec } => {
                let key = match key {
                    Ok(key) => key,
                    Err(error) => {
                        self.graph[index].value = Value::Failed(CallError::new(error));
                        return;
                    }
                };
                let fingerprint = Fingerprint::of_key(&key);

                let (previous, entry) = match &self.graph[index].kind {
                    SlotKind::Call {
                        fingerprint, entry, ..
                    } => (*fingerprint, entry.clone()),
                    _ => unreachable!("apply_call on a non-call node"),
                };

                // Unchanged inputs: refresh the snapshot from the shared
                // entry, no new request.
                if previous == Some(fingerprint)
                    && let Some(entry) = entry
                {
                    self.graph[index].value = entry.state();
                    return;
                }

                // The fingerprint changed: whatever is still in flight for
                // the superseded entry settles there and is ignored.
                if let Some(stale) = entry {
                    self.detach(index, &stale);
                }

                let (entry, spawned) = self
                    .store
                    .request(fingerprint, exec, self.done_tx.clone());
                entry.subscribe();
                self.subscriptions
                    .entry(fingerprint)
                    .or_default()
                    .insert(index);

                // Only wait for settlements this engine will hear about; a
                // hit on another engine's pending entry (shared store) has
                // no wake-up of its own.
                if spawned {
                    self.inflight.insert(fingerprint);
                }

                let state = entry.state();
                if let SlotKind::Call {
                    fingerprint: slot_fingerprint,
                    entry: slot_entry,
                    ..
                } = &mut self.graph[index].kind
                {
                    *slot_fingerprint = Some(fingerprint);
                    *slot_entry = Some(entry);
                }
                self.graph[index].value = state;
            }
        }
    }

    pub(crate) fn detach(&mut self, index: NodeIndex, entry: &Arc<CacheEntry>) {
        entry.unsubscribe();

        let fingerprint = entry.fingerprint();
        if let Some(subscribers) = self.subscriptions.get_mut(&fingerprint) {
            subscribers.remove(&index);
            if subscribers.is_empty() {
                self.subscriptions.remove(&fingerprint);
            }
        }
    }

    /// Blocks until every outstanding call has settled, recomputing as
    /// settlements land. Intended for headless callers and tests; an
    /// interactive caller would rather [`poll`](Self::poll) from its own
    /// tick.
    pub fn settle(&mut self) {
        self.flush();

        while !self.inflight.is_empty() {
            let fingerprint = self
                .done_rx
                .recv()
                .expect("Call executor channel disconnected");
            self.apply_settlement(fingerprint);

            while let Ok(fingerprint) = self.done_rx.try_recv() {
                self.apply_settlement(fingerprint);
            }

            self.flush();
        }
    }

    /// Drains any settlements that have arrived, recomputing if there were
    /// some. Returns whether anything settled. Never blocks.
    pub fn poll(&mut self) -> bool {
        let mut settled = false;

        while let Ok(fingerprint) = self.done_rx.try_recv() {
            self.apply_settlement(fingerprint);
            settled = true;
        }
        settled |= self.adopt_foreign_settlements();

        if settled {
            self.flush();
        }
        settled
    }

    /// Re-dirties subscribed call nodes whose snapshot is still pending
    /// although their shared entry has settled. An execution spawned by
    /// another engine sharing the store notifies that engine's channel, not
    /// ours, so the settlement is adopted here instead.
    fn adopt_foreign_settlements(&mut self) -> bool {
        let mut adopted: Vec<NodeIndex> = Vec::new();

        for (fingerprint, subscribers) in &self.subscriptions {
            // Our own executions come back over the channel.
            if self.inflight.contains(fingerprint) {
                continue;
            }

            for &index in subscribers {
                if !self.graph.contains_node(index)
                    || !matches!(self.graph[index].value, Value::Pending)
                {
                    continue;
                }

                if let SlotKind::Call {
                    entry: Some(entry), ..
                } = &self.graph[index].kind
                    && !matches!(entry.state(), Value::Pending)
                {
                    adopted.push(index);
                }
            }
        }

        if adopted.is_empty() {
            return false;
        }

        tracing::debug!(nodes = adopted.len(), "adopted foreign settlements");
        self.dirty.extend(adopted);
        true
    }

    fn apply_settlement(&mut self, fingerprint: Fingerprint) {
        tracing::debug!(fingerprint = %fingerprint.to_hex(), "call settled");
        self.inflight.remove(&fingerprint);

        if let Some(subscribers) = self.subscriptions.get(&fingerprint) {
            self.dirty.extend(subscribers.iter().copied());
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{Receiver, channel};
    use std::sync::{Arc, Mutex};

    use crate::cache::{CacheStore, CallRequest};
    use crate::engine::Engine;
    use crate::spec::HttpSpec;
    use crate::state::State;

    /// A call whose exec increments `counter` and returns `result`.
    fn counted_fetch(
        key: impl serde::Serialize,
        counter: &Arc<AtomicUsize>,
        result: &str,
    ) -> CallRequest<String> {
        let counter = counter.clone();
        let result = result.to_string();
        CallRequest::new(key, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(result)
        })
    }

    #[test]
    fn derive_recomputes_only_dependents() {
        let mut engine = Engine::new();
        let left_runs = Arc::new(AtomicUsize::new(0));
        let right_runs = Arc::new(AtomicUsize::new(0));

        let a = engine.cell(1u32);
        let b = engine.cell(10u32);
        let left = {
            let runs = left_runs.clone();
            engine.derive(a, move |a| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(a * 2)
            })
        };
        let right = {
            let runs = right_runs.clone();
            engine.derive(b, move |b| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(b * 2)
            })
        };

        assert_eq!(engine.value(left).unwrap().as_ref(), &2);
        assert_eq!(engine.value(right).unwrap().as_ref(), &20);

        engine.set(a, 3);
        assert_eq!(engine.value(left).unwrap().as_ref(), &6);
        assert_eq!(left_runs.load(Ordering::SeqCst), 2);
        assert_eq!(right_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_as_a_plain_dependency() {
        let mut engine = Engine::new();

        let list = engine.list(vec![1u32, 2, 3]);
        let sum = engine.derive(list, |items| {
            Ok(items.iter().map(|(_, n)| **n).sum::<u32>())
        });

        assert_eq!(engine.value(sum).unwrap().as_ref(), &6);

        engine.push(list, 4);
        assert_eq!(engine.value(sum).unwrap().as_ref(), &10);
    }

    #[test]
    fn update_coalesces_mutations_into_one_pass() {
        let mut engine = Engine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let a = engine.cell(1u32);
        let b = engine.cell(2u32);
        let sum = {
            let runs = runs.clone();
            engine.derive((a, b), move |(a, b)| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(a + b)
            })
        };
        assert_eq!(engine.value(sum).unwrap().as_ref(), &3);

        engine.update(|tx| {
            tx.set(a, 10);
            tx.set(b, 20);
        });

        assert_eq!(engine.value(sum).unwrap().as_ref(), &30);
        // One initial run plus one for the whole batch.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unchanged_inputs_never_rerun_a_call() {
        let mut engine = Engine::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        let url = engine.cell("https://example.com/a".to_string());
        let fetched = {
            let fetches = fetches.clone();
            engine.call(url, move |url| counted_fetch(("fetch", url), &fetches, "body"))
        };

        engine.settle();
        assert_eq!(engine.value(fetched).unwrap().as_ref(), "body");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        engine.set(url, "https://example.com/b".to_string());
        engine.settle();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        // Reverting the input hits the original entry; no third execution.
        engine.set(url, "https://example.com/a".to_string());
        engine.settle();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert!(engine.get(fetched).is_ready());
    }

    #[test]
    fn equal_fingerprints_share_one_execution() {
        let mut engine = Engine::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        // Cosmetic URL variants collapse onto one fingerprint.
        let spec_a = HttpSpec::get("https://example.com/a?b=1&a=2#frag").normalize();
        let spec_b = HttpSpec::get("https://example.com/a?a=2&utm_source=x&b=1").normalize();
        assert_eq!(spec_a, spec_b);

        let first = {
            let fetches = fetches.clone();
            engine.call((), move |()| counted_fetch(&spec_a, &fetches, "body"))
        };
        let second = {
            let fetches = fetches.clone();
            engine.call((), move |()| counted_fetch(&spec_b, &fetches, "body"))
        };

        engine.settle();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let first = engine.value(first).unwrap();
        let second = engine.value(second).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn in_flight_calls_read_as_pending() {
        let mut engine = Engine::new();
        let (release_tx, release_rx) = channel::<()>();
        let gate: Arc<Mutex<Option<Receiver<()>>>> = Arc::new(Mutex::new(Some(release_rx)));

        let input = engine.cell(2u32);
        let doubled = engine.call(input, move |n| {
            let n = *n;
            let gate = gate.clone();
            CallRequest::new(("double", n), move || {
                let gate = gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
                Ok(n * 2)
            })
        });

        assert!(engine.get(doubled).is_pending());

        release_tx.send(()).unwrap();
        engine.settle();
        assert_eq!(engine.value(doubled).unwrap().as_ref(), &4);
    }

    #[test]
    fn poll_never_blocks() {
        let mut engine = Engine::new();
        let (release_tx, release_rx) = channel::<()>();
        let gate: Arc<Mutex<Option<Receiver<()>>>> = Arc::new(Mutex::new(Some(release_rx)));

        let result = engine.call((), move |()| {
            let gate = gate.clone();
            CallRequest::new("gated", move || {
                let gate = gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
                Ok("done".to_string())
            })
        });

        assert!(engine.get(result).is_pending());
        assert!(!engine.poll());

        release_tx.send(()).unwrap();
        while !engine.poll() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(engine.value(result).unwrap().as_ref(), "done");
    }

    #[test]
    fn failures_flow_as_data() {
        let mut engine = Engine::new();

        let fetched = engine.call((), |()| {
            CallRequest::new("broken", || {
                Err::<String, _>(anyhow::anyhow!("network down"))
            })
        });
        let shouted = engine.derive(fetched, |text| Ok(text.to_uppercase()));

        engine.settle();

        // The downstream callback never ran; both nodes share the error.
        let upstream = engine.get(fetched);
        let downstream = engine.get(shouted);
        match (upstream.error(), downstream.error()) {
            (Some(a), Some(b)) => assert!(a.same_as(b)),
            _ => panic!("expected both nodes to report the failure"),
        }
    }

    #[test]
    fn probe_substitutes_a_fallback_for_failure() {
        let mut engine = Engine::new();

        let fetched = engine.call((), |()| {
            CallRequest::new("broken", || {
                Err::<String, _>(anyhow::anyhow!("network down"))
            })
        });
        let lenient = engine.derive(fetched.probe(), |state| {
            Ok(match state {
                State::Ready(text) => text.as_ref().clone(),
                State::Failed(_) => "fallback".to_string(),
                State::Pending => "pending".to_string(),
            })
        });

        engine.settle();
        assert_eq!(engine.value(lenient).unwrap().as_ref(), "fallback");
    }

    #[test]
    fn unselected_branches_stay_cold() {
        let mut engine = Engine::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        let cond = engine.cell(false);
        let expensive = {
            let fetches = fetches.clone();
            engine.call((), move |()| counted_fetch("expensive", &fetches, "fetched"))
        };
        let cheap = engine.cell("cheap".to_string());
        let picked = engine.if_else(cond, expensive, cheap);

        engine.settle();
        assert_eq!(engine.value(picked).unwrap().as_ref(), "cheap");
        // The unselected branch was never fingerprinted or executed.
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert_eq!(engine.store().len(), 0);

        engine.set(cond, true);
        engine.settle();
        assert_eq!(engine.value(picked).unwrap().as_ref(), "fetched");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observing_a_cold_branch_node_evaluates_it() {
        let mut engine = Engine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let cond = engine.cell(false);
        let x = engine.cell(1u32);
        let expensive = {
            let runs = runs.clone();
            engine.derive(x, move |x| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(x + 1)
            })
        };
        let cheap = engine.cell(0u32);
        let picked = engine.if_else(cond, expensive, cheap);

        engine.settle();
        assert_eq!(engine.value(picked).unwrap().as_ref(), &0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Direct observation demands the node itself; the branch it feeds
        // being unselected does not matter.
        assert_eq!(engine.value(expensive).unwrap().as_ref(), &2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_settlements_reach_a_sharing_engine() {
        let store = CacheStore::new();
        let (release_tx, release_rx) = channel::<()>();
        let gate: Arc<Mutex<Option<Receiver<()>>>> = Arc::new(Mutex::new(Some(release_rx)));

        let mut first = Engine::with_store(store.clone());
        let a = first.call((), move |()| {
            let gate = gate.clone();
            CallRequest::new("slow", move || {
                let gate = gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
                Ok("body".to_string())
            })
        });
        assert!(first.get(a).is_pending());

        // The second engine hits the entry while it is still in flight.
        let mut second = Engine::with_store(store);
        let b = second.call((), |()| CallRequest::new("slow", || Ok("never".to_string())));
        assert!(second.get(b).is_pending());

        release_tx.send(()).unwrap();
        first.settle();
        assert_eq!(first.value(a).unwrap().as_ref(), "body");

        // The execution notified only the first engine's channel; the
        // second adopts the settled entry on its next poll.
        assert!(second.poll());
        let a = first.value(a).unwrap();
        let b = second.value(b).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn engines_share_settled_entries_through_one_store() {
        let store = CacheStore::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut first = Engine::with_store(store.clone());
        let a = {
            let fetches = fetches.clone();
            first.call((), move |()| counted_fetch("shared", &fetches, "body"))
        };
        first.settle();
        assert_eq!(first.value(a).unwrap().as_ref(), "body");

        let mut second = Engine::with_store(store);
        let b = {
            let fetches = fetches.clone();
            second.call((), move |()| counted_fetch("shared", &fetches, "body"))
        };
        second.settle();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        let a = first.value(a).unwrap();
        let b = second.value(b).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
