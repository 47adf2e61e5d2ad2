//! Dependency task graph executed on a rayon worker pool.
//!
//! Nodes are one-shot closures; an edge `a → b` means `b` fires only after
//! `a` has finished. Nodes with no predecessors are released when `run`
//! starts; everything else fires automatically as its dependencies complete.
//! Every closure receives the index of the worker executing it, so callers
//! can route per-worker resources (such as independent RNG streams) without
//! sharing them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Task<'env> = Box<dyn FnOnce(usize) + Send + 'env>;

/// A one-shot directed acyclic graph of tasks.
///
/// The graph itself does no cycle detection; the schedulers in this crate
/// only build chains and fan-ins, which are acyclic by construction. A node
/// that is part of a cycle would simply never fire.
pub(crate) struct TaskGraph<'env> {
    tasks: Vec<Mutex<Option<Task<'env>>>>,
    successors: Vec<Vec<usize>>,
    pending: Vec<AtomicUsize>,
}

impl<'env> TaskGraph<'env> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Vec::new(),
            successors: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Adds a node and returns its id.
    pub(crate) fn add_node(&mut self, task: impl FnOnce(usize) + Send + 'env) -> usize {
        let id = self.tasks.len();
        self.tasks.push(Mutex::new(Some(Box::new(task))));
        self.successors.push(Vec::new());
        self.pending.push(AtomicUsize::new(0));
        id
    }

    /// Declares that `to` must not fire before `from` has completed.
    pub(crate) fn add_edge(&mut self, from: usize, to: usize) {
        self.successors[from].push(to);
        self.pending[to].fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the whole graph to completion on `pool`, blocking until every
    /// node has fired.
    pub(crate) fn run(&self, pool: &rayon::ThreadPool) {
        pool.scope(|scope| {
            for id in 0..self.tasks.len() {
                if self.pending[id].load(Ordering::Relaxed) == 0 {
                    scope.spawn(move |scope| self.fire(id, scope));
                }
            }
        });
    }

    fn fire<'s>(&'s self, id: usize, scope: &rayon::Scope<'s>) {
        let task = self.tasks[id]
            .lock()
            .expect("task slot lock poisoned")
            .take();
        if let Some(task) = task {
            let worker = rayon::current_thread_index().unwrap_or(0);
            task(worker);
        }
        for &next in &self.successors[id] {
            // The last completed predecessor releases the node.
            if self.pending[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                scope.spawn(move |scope| self.fire(next, scope));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(n: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .expect("building test pool")
    }

    #[test]
    fn chain_preserves_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        let mut prev = None;
        for i in 0..16 {
            let log = Arc::clone(&log);
            let node = graph.add_node(move |_| log.lock().unwrap().push(i));
            if let Some(p) = prev {
                graph.add_edge(p, node);
            }
            prev = Some(node);
        }
        graph.run(&pool(4));
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn every_node_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        let mut heads = Vec::new();
        for _ in 0..4 {
            let count = Arc::clone(&count);
            heads.push(graph.add_node(move |_| {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        // Fan-in: one sink depending on all four heads.
        let count2 = Arc::clone(&count);
        let sink = graph.add_node(move |_| {
            // All predecessors must be done by now.
            assert_eq!(count2.load(Ordering::Relaxed), 4);
            count2.fetch_add(1, Ordering::Relaxed);
        });
        for &h in &heads {
            graph.add_edge(h, sink);
        }
        graph.run(&pool(4));
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn two_chains_with_cross_links_commit_in_order() {
        // Shape of the speculative scheduler: two independent chains plus a
        // totally ordered chain of joins, each depending on one chain node
        // and its predecessor join.
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        let mut chain_a = Vec::new();
        let mut chain_b = Vec::new();
        for i in 0..8 {
            let node = graph.add_node(move |_| {});
            let chain = if i % 2 == 0 {
                &mut chain_a
            } else {
                &mut chain_b
            };
            if let Some(&p) = chain.last() {
                graph.add_edge(p, node);
            }
            chain.push(node);
        }
        let mut joins: Vec<usize> = Vec::new();
        for (i, &owner) in chain_a.iter().chain(chain_b.iter()).enumerate() {
            let log = Arc::clone(&log);
            let join = graph.add_node(move |_| log.lock().unwrap().push(i));
            graph.add_edge(owner, join);
            if let Some(&p) = joins.last() {
                graph.add_edge(p, join);
            }
            joins.push(join);
        }
        graph.run(&pool(4));
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn single_worker_pool_runs_to_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        let mut prev = None;
        for _ in 0..32 {
            let count = Arc::clone(&count);
            let node = graph.add_node(move |worker| {
                assert_eq!(worker, 0);
                count.fetch_add(1, Ordering::Relaxed);
            });
            if let Some(p) = prev {
                graph.add_edge(p, node);
            }
            prev = Some(node);
        }
        graph.run(&pool(1));
        assert_eq!(count.load(Ordering::Relaxed), 32);
    }
}
