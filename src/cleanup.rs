//! Dependency-ordered teardown.
//!
//! Every lifetime gets a cleanup graph: a DAG over its cleanup-bearing
//! records where a node's dependants (its consumers) are always cleaned
//! before the node itself. Nodes are arena entries in a vector with index
//! edges; actions start as no-ops and are published after the first
//! successful construction.
//!
//! Two workers drive the graphs:
//!
//! - the singleton worker applies cleanup updates for the locator's
//!   lifetime and runs the singleton graph exactly once at shutdown;
//! - the per-context worker watches live scopes, tears each one down when
//!   it ends, and uses a periodic randomized swap of the watched scope so
//!   one slow teardown cannot starve the rest of the queue.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{never, select, tick, Receiver, Sender, TryRecvError};
use rand::Rng;
use tracing::{debug, error};

use crate::constructor::{Cleanup, ConstructorKind};
use crate::error::panic_message;
use crate::lifetime::Lifetime;
use crate::locator::{DepRef, LocatorRecord};
use crate::scope::{ContextBucket, ContextInstances};

/// Publishes a constructed service's real cleanup action into the node
/// matching its record.
pub(crate) struct CleanupNodeUpdate {
    pub(crate) record: usize,
    pub(crate) action: Cleanup,
}

/// First-visit registration of a scope with the per-context worker.
pub(crate) struct ScopeWatch {
    pub(crate) scope_id: u64,
    pub(crate) done: Receiver<()>,
    pub(crate) bucket: Arc<ContextBucket>,
}

struct CleanupNode {
    /// Arena index of the record this node belongs to.
    record: usize,
    action: Option<Cleanup>,
    /// Nodes that depend on this one; cleaned strictly before it.
    dependants: Vec<usize>,
    cleaned: bool,
}

/// A per-lifetime teardown DAG.
pub(crate) struct CleanupGraph {
    lifetime: Lifetime,
    nodes: Vec<CleanupNode>,
    /// Nodes with no cleanup-bearing dependencies; cleaning from here
    /// transitively cleans the whole graph.
    roots: Vec<usize>,
    by_record: HashMap<usize, usize>,
    finished: bool,
}

impl CleanupGraph {
    pub(crate) fn empty(lifetime: Lifetime) -> Self {
        Self {
            lifetime,
            nodes: Vec::new(),
            roots: Vec::new(),
            by_record: HashMap::new(),
            finished: false,
        }
    }

    /// Builds the graph for one lifetime over the frozen record arena.
    pub(crate) fn build(records: &[Arc<LocatorRecord>], lifetime: Lifetime) -> Self {
        let candidates: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, rec)| {
                rec.lifetime == lifetime && rec.kind == ConstructorKind::WithErrorAndCleanup
            })
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return Self::empty(lifetime);
        }

        // Per candidate, the cleanup-bearing same-lifetime records in its
        // transitive dependency closure.
        let mut deps_of: HashMap<usize, Vec<usize>> = HashMap::new();
        for &idx in &candidates {
            deps_of.insert(idx, cleanup_dependencies(records, idx, lifetime));
        }

        let mut graph = Self::empty(lifetime);
        for &idx in &candidates {
            graph.by_record.insert(idx, graph.nodes.len());
            graph.nodes.push(CleanupNode {
                record: idx,
                action: None,
                dependants: Vec::new(),
                cleaned: false,
            });
        }

        for &idx in &candidates {
            let node = graph.by_record[&idx];
            for &dep in &deps_of[&idx] {
                let provider = graph.by_record[&dep];
                graph.nodes[provider].dependants.push(node);
            }
            if deps_of[&idx].is_empty() {
                graph.roots.push(node);
            }
        }

        graph
    }

    /// A structural copy with every action reset; used to stamp out one
    /// graph per scope from the per-context prototype.
    pub(crate) fn fresh_copy(&self) -> Self {
        Self {
            lifetime: self.lifetime,
            nodes: self
                .nodes
                .iter()
                .map(|node| CleanupNode {
                    record: node.record,
                    action: None,
                    dependants: node.dependants.clone(),
                    cleaned: false,
                })
                .collect(),
            roots: self.roots.clone(),
            by_record: self.by_record.clone(),
            finished: false,
        }
    }

    /// Installs the real action for a record's node.
    ///
    /// An update that arrives after the graph has already run executes
    /// immediately: the scope is tearing down and the resource must not
    /// leak.
    pub(crate) fn update(&mut self, record: usize, action: Cleanup) {
        match self.by_record.get(&record) {
            Some(&node) if !self.finished => self.nodes[node].action = Some(action),
            Some(_) => run_with_recovery(action, self.lifetime),
            None => debug!(record, "cleanup update for a record outside the graph"),
        }
    }

    /// Runs every pending action, dependants first. Panics in individual
    /// actions are recovered and logged; traversal continues.
    pub(crate) fn clean(&mut self) {
        let roots = self.roots.clone();
        for root in roots {
            self.clean_node(root);
        }
        self.finished = true;
    }

    fn clean_node(&mut self, node: usize) {
        let dependants = self.nodes[node].dependants.clone();
        for dependant in dependants {
            self.clean_node(dependant);
        }

        if !self.nodes[node].cleaned {
            if let Some(action) = self.nodes[node].action.take() {
                run_with_recovery(action, self.lifetime);
            }
        }
        self.nodes[node].cleaned = true;
    }

    /// Resets the graph for reuse from the bucket pool.
    pub(crate) fn zero_out(&mut self) {
        for node in &mut self.nodes {
            node.action = None;
            node.cleaned = false;
        }
        self.finished = false;
    }
}

fn cleanup_dependencies(
    records: &[Arc<LocatorRecord>],
    start: usize,
    lifetime: Lifetime,
) -> Vec<usize> {
    let mut seen = vec![false; records.len()];
    let mut out = Vec::new();
    let mut stack: Vec<usize> = records[start]
        .dependencies
        .iter()
        .filter_map(|dep| match dep {
            DepRef::Record(idx) => Some(*idx),
            DepRef::Scope => None,
        })
        .collect();

    while let Some(idx) = stack.pop() {
        if seen[idx] {
            continue;
        }
        seen[idx] = true;

        let rec = &records[idx];
        if rec.lifetime == lifetime && rec.kind == ConstructorKind::WithErrorAndCleanup {
            out.push(idx);
        }
        for dep in &rec.dependencies {
            if let DepRef::Record(next) = dep {
                stack.push(*next);
            }
        }
    }

    out
}

fn run_with_recovery(action: Cleanup, lifetime: Lifetime) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action.run())) {
        error!(
            %lifetime,
            panic = %panic_message(payload.as_ref()),
            "recovered from panic during cleanup"
        );
    }
}

/// Singleton cleanup worker: installs update messages into the singleton
/// graph and runs it once when the locator shuts down.
///
/// Waits for the per-context worker to finish draining first so consumers
/// across lifetimes are gone before their providers are torn down.
pub(crate) fn singleton_cleanup_worker(
    shutdown: Receiver<()>,
    external_shutdown: Receiver<()>,
    updates: Receiver<CleanupNodeUpdate>,
    mut graph: CleanupGraph,
    per_context_drained: Receiver<()>,
) {
    loop {
        select! {
            recv(updates) -> msg => match msg {
                Ok(update) => graph.update(update.record, update.action),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            recv(external_shutdown) -> _ => break,
        }
    }

    let _ = per_context_drained.recv();
    // Updates published between the shutdown signal and now must still be
    // installed, or their resources would leak.
    while let Ok(update) = updates.try_recv() {
        graph.update(update.record, update.action);
    }
    graph.clean();
}

/// Per-context cleanup worker.
///
/// Watches one scope at a time and keeps the rest in a FIFO queue. A
/// periodic tick swaps the watched scope with a randomly chosen queued one
/// so a scope that never ends cannot block cleanup of the others; expected
/// delay stays bounded by O(queue * tick).
pub(crate) fn per_context_cleanup_worker(
    shutdown: Receiver<()>,
    external_shutdown: Receiver<()>,
    watches: Receiver<ScopeWatch>,
    store: Arc<ContextInstances>,
    tick_every: Duration,
    _drained_tx: Sender<()>,
) {
    let ticker = tick(tick_every);
    let mut watched: Option<ScopeWatch> = None;
    let mut queue: VecDeque<ScopeWatch> = VecDeque::new();

    loop {
        let watched_done = watched
            .as_ref()
            .map(|watch| watch.done.clone())
            .unwrap_or_else(never);

        select! {
            recv(watches) -> msg => match msg {
                Ok(watch) => {
                    if watched.is_none() {
                        watched = Some(watch);
                    } else {
                        queue.push_back(watch);
                    }
                }
                Err(_) => break,
            },
            recv(watched_done) -> _ => {
                if let Some(watch) = watched.take() {
                    teardown(&store, watch);
                }
                watched = queue.pop_front();
            },
            recv(ticker) -> _ => {
                if queue.is_empty() {
                    continue;
                }
                if let Some(current) = watched.take() {
                    if current.done.try_recv() == Err(TryRecvError::Disconnected) {
                        // Finished between selects; handle it now.
                        teardown(&store, current);
                        watched = queue.pop_front();
                    } else {
                        queue.push_back(current);
                        let pick = rand::thread_rng().gen_range(0..queue.len());
                        watched = queue.remove(pick);
                    }
                }
            },
            recv(shutdown) -> _ => break,
            recv(external_shutdown) -> _ => break,
        }
    }

    // Drain every remaining live scope before exiting, including watch
    // registrations still sitting in the channel.
    if let Some(watch) = watched.take() {
        teardown(&store, watch);
    }
    for watch in queue.drain(..) {
        teardown(&store, watch);
    }
    while let Ok(watch) = watches.try_recv() {
        teardown(&store, watch);
    }
}

fn teardown(store: &ContextInstances, watch: ScopeWatch) {
    drop(store.remove(watch.scope_id));
    watch.bucket.cleanup.lock().clean();
    store.recycle(watch.bucket);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructor::{AnyService, CallError, DepValue};
    use crate::key::ServiceKey;
    use std::sync::Mutex;

    fn record(
        index: usize,
        lifetime: Lifetime,
        kind: ConstructorKind,
        dependencies: Vec<DepRef>,
    ) -> Arc<LocatorRecord> {
        Arc::new(LocatorRecord {
            key: ServiceKey::of::<()>(),
            lifetime,
            kind,
            index,
            slot: 0,
            dependencies,
            depends_on_context: false,
            call: Arc::new(
                |_: &[DepValue]| -> Result<(AnyService, Option<Cleanup>), CallError> {
                    Ok((Arc::new(()) as AnyService, None))
                },
            ),
        })
    }

    fn tracker(order: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Cleanup {
        let order = Arc::clone(order);
        Cleanup::new(move || order.lock().unwrap().push(name))
    }

    #[test]
    fn test_dependants_clean_before_providers() {
        // hero depends on name; hero's cleanup must run first.
        let records = vec![
            record(
                0,
                Lifetime::PerContext,
                ConstructorKind::WithErrorAndCleanup,
                vec![],
            ),
            record(
                1,
                Lifetime::PerContext,
                ConstructorKind::WithErrorAndCleanup,
                vec![DepRef::Record(0)],
            ),
        ];
        let mut graph = CleanupGraph::build(&records, Lifetime::PerContext);

        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(0, tracker(&order, "name"));
        graph.update(1, tracker(&order, "hero"));
        graph.clean();

        assert_eq!(*order.lock().unwrap(), vec!["hero", "name"]);
    }

    #[test]
    fn test_transitive_dependency_through_plain_record() {
        // api -> middle (no cleanup) -> db: api still cleans before db.
        let records = vec![
            record(
                0,
                Lifetime::Singleton,
                ConstructorKind::WithErrorAndCleanup,
                vec![],
            ),
            record(
                1,
                Lifetime::Singleton,
                ConstructorKind::OnlyService,
                vec![DepRef::Record(0)],
            ),
            record(
                2,
                Lifetime::Singleton,
                ConstructorKind::WithErrorAndCleanup,
                vec![DepRef::Record(1)],
            ),
        ];
        let mut graph = CleanupGraph::build(&records, Lifetime::Singleton);

        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(0, tracker(&order, "db"));
        graph.update(2, tracker(&order, "api"));
        graph.clean();

        assert_eq!(*order.lock().unwrap(), vec!["api", "db"]);
    }

    #[test]
    fn test_clean_runs_actions_at_most_once() {
        let records = vec![record(
            0,
            Lifetime::Singleton,
            ConstructorKind::WithErrorAndCleanup,
            vec![],
        )];
        let mut graph = CleanupGraph::build(&records, Lifetime::Singleton);

        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(0, tracker(&order, "once"));
        graph.clean();
        graph.clean();

        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_update_after_clean_runs_immediately() {
        let records = vec![record(
            0,
            Lifetime::PerContext,
            ConstructorKind::WithErrorAndCleanup,
            vec![],
        )];
        let mut graph = CleanupGraph::build(&records, Lifetime::PerContext);
        graph.clean();

        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(0, tracker(&order, "late"));
        assert_eq!(*order.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_panicking_action_does_not_stop_traversal() {
        let records = vec![
            record(
                0,
                Lifetime::PerContext,
                ConstructorKind::WithErrorAndCleanup,
                vec![],
            ),
            record(
                1,
                Lifetime::PerContext,
                ConstructorKind::WithErrorAndCleanup,
                vec![DepRef::Record(0)],
            ),
        ];
        let mut graph = CleanupGraph::build(&records, Lifetime::PerContext);

        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(1, Cleanup::new(|| panic!("teardown exploded")));
        graph.update(0, tracker(&order, "survivor"));
        graph.clean();

        assert_eq!(*order.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_fresh_copy_has_no_actions() {
        let records = vec![record(
            0,
            Lifetime::PerContext,
            ConstructorKind::WithErrorAndCleanup,
            vec![],
        )];
        let mut graph = CleanupGraph::build(&records, Lifetime::PerContext);
        let order = Arc::new(Mutex::new(Vec::new()));
        graph.update(0, tracker(&order, "original"));

        let mut copy = graph.fresh_copy();
        copy.clean();
        assert!(order.lock().unwrap().is_empty());
    }

    #[test]
    fn test_singleton_worker_applies_updates_and_cleans_on_shutdown() {
        let records = vec![record(
            0,
            Lifetime::Singleton,
            ConstructorKind::WithErrorAndCleanup,
            vec![],
        )];
        let graph = CleanupGraph::build(&records, Lifetime::Singleton);

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        let (drained_tx, drained_rx) = crossbeam_channel::bounded::<()>(0);

        let order = Arc::new(Mutex::new(Vec::new()));
        let action = tracker(&order, "db");

        let worker = std::thread::spawn(move || {
            singleton_cleanup_worker(shutdown_rx, never(), update_rx, graph, drained_rx)
        });

        update_tx
            .send(CleanupNodeUpdate {
                record: 0,
                action,
            })
            .unwrap();

        drop(drained_tx);
        drop(shutdown_tx);
        worker.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["db"]);
    }
}
