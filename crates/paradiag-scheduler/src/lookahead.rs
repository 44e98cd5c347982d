// SPECULATIVE LOOK-AHEAD
//
// The diagnosis recursion's future queries follow from its current (C, B, Δ)
// state; only their answers are unknown. A look-ahead pass materializes the
// tree of possible future states breadth-first, branching on "B ∪ C is
// consistent" and "B ∪ C is inconsistent", and submits check tasks for the
// states most likely to be asked about next.
//
// Node identifiers are indices into a per-pass arena and never outlive it.
//
// DISPATCH RULE (all must hold):
// 1. The node is not the root and was reached assuming consistency
// 2. |CC| + frontier_slack >= |root CC|
// 3. CC is not in the cache yet
// 4. level >= max_level
// 5. Fewer than `parallelism` tasks were dispatched by this pass

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use paradiag_core::{ConstraintSet, Oracle};
use paradiag_telemetry::counters;

use crate::result_cache::ResultCache;
use crate::task::{CheckContext, CheckTask, TaskHandle};
use crate::worker_pool::{PoolJob, WorkerPool};

/// Index of a node in its [`SpeculationTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Assumption labelling the arc into a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assumption {
    Consistent,
    Inconsistent,
}

/// Which branch rule produced a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRule {
    /// Consistent, Δ[0] singleton already cached: split Δ[1]
    SplitSecondRemainder,
    /// Consistent, Δ[0] singleton already cached, Δ[1] singleton: take Δ[1]
    TakeSecondSingleton,
    /// Consistent, Δ[0] singleton: take it
    TakeSingleton,
    /// Consistent: split Δ[0]
    SplitFirstRemainder,
    /// Inconsistent, |C| > 1: split C
    SplitCandidates,
    /// Inconsistent, |C| = 1, Δ[0] singleton: take it
    SwapSingleton,
    /// Inconsistent, |C| = 1: split Δ[0]
    SwapSplit,
}

impl fmt::Display for BranchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BranchRule::SplitSecondRemainder => "consistent/split-second",
            BranchRule::TakeSecondSingleton => "consistent/take-second",
            BranchRule::TakeSingleton => "consistent/take-singleton",
            BranchRule::SplitFirstRemainder => "consistent/split-first",
            BranchRule::SplitCandidates => "inconsistent/split-candidates",
            BranchRule::SwapSingleton => "inconsistent/swap-singleton",
            BranchRule::SwapSplit => "inconsistent/swap-split",
        };
        f.write_str(label)
    }
}

/// One predicted recursion state
#[derive(Debug, Clone)]
pub struct SpeculationNode {
    pub id: NodeId,
    pub level: usize,
    pub parent: Option<NodeId>,
    pub assumption: Option<Assumption>,
    pub rule: Option<BranchRule>,
    pub c: ConstraintSet,
    pub b: ConstraintSet,
    pub delta: Vec<ConstraintSet>,
    /// B ∪ C, fixed at construction
    pub cc: ConstraintSet,
    pub consistency: Option<bool>,
    pub task: Option<Arc<TaskHandle>>,
    pub children: Vec<NodeId>,
}

impl SpeculationNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Successor state before it is placed in a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Successor {
    pub assumption: Assumption,
    pub rule: BranchRule,
    pub c: ConstraintSet,
    pub b: ConstraintSet,
    pub delta: Vec<ConstraintSet>,
}

impl Successor {
    pub fn cc(&self) -> ConstraintSet {
        self.b.union(&self.c)
    }
}

/// Arena of nodes for one look-ahead pass
#[derive(Debug, Default)]
pub struct SpeculationTree {
    nodes: Vec<SpeculationNode>,
}

impl SpeculationTree {
    pub fn new(c: ConstraintSet, b: ConstraintSet, delta: Vec<ConstraintSet>) -> Self {
        let cc = b.union(&c);
        SpeculationTree {
            nodes: vec![SpeculationNode {
                id: NodeId(0),
                level: 0,
                parent: None,
                assumption: None,
                rule: None,
                c,
                b,
                delta,
                cc,
                consistency: None,
                task: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> &SpeculationNode {
        &self.nodes[0]
    }

    pub fn get(&self, id: NodeId) -> Option<&SpeculationNode> {
        self.nodes.get(id.0)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut SpeculationNode> {
        self.nodes.get_mut(id.0)
    }

    /// Adds `successor` below `parent` and returns the new node's id.
    pub fn attach(&mut self, parent: NodeId, successor: Successor) -> Option<NodeId> {
        let level = self.get(parent)?.level + 1;
        let id = NodeId(self.nodes.len());
        let cc = successor.cc();
        self.nodes.push(SpeculationNode {
            id,
            level,
            parent: Some(parent),
            assumption: Some(successor.assumption),
            rule: Some(successor.rule),
            c: successor.c,
            b: successor.b,
            delta: successor.delta,
            cc,
            consistency: None,
            task: None,
            children: Vec::new(),
        });
        self.get_mut(parent)?.children.push(id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SpeculationNode> {
        self.nodes.iter()
    }

    /// Nodes with a dispatched task
    pub fn dispatched(&self) -> impl Iterator<Item = &SpeculationNode> {
        self.nodes.iter().filter(|node| node.task.is_some())
    }
}

/// Children of the state (C, B, Δ), at most one per assumption.
///
/// `is_cached` tells whether a combined set is already known to the cache; it
/// only matters for the first consistent-branch rule.
pub fn successors<F>(c: &ConstraintSet, b: &ConstraintSet, delta: &[ConstraintSet], is_cached: F) -> Vec<Successor>
where
    F: Fn(&ConstraintSet) -> bool,
{
    let mut children = Vec::with_capacity(2);
    let cc = b.union(c);

    // B ∪ C assumed consistent: B grows to B ∪ C
    let consistent = match delta {
        [first, second, rest @ ..] if first.len() == 1 && is_cached(&cc.union(first)) => {
            match second.split() {
                Some((left, right)) => {
                    let mut next = Vec::with_capacity(rest.len() + 1);
                    next.push(right);
                    next.extend(rest.iter().cloned());
                    Some((BranchRule::SplitSecondRemainder, left, next))
                }
                None => (second.len() == 1).then(|| (BranchRule::TakeSecondSingleton, second.clone(), rest.to_vec())),
            }
        }
        [first, rest @ ..] if first.len() == 1 => {
            Some((BranchRule::TakeSingleton, first.clone(), rest.to_vec()))
        }
        [first, rest @ ..] => first.split().map(|(left, right)| {
            let mut next = Vec::with_capacity(rest.len() + 1);
            next.push(right);
            next.extend(rest.iter().cloned());
            (BranchRule::SplitFirstRemainder, left, next)
        }),
        [] => None,
    };
    if let Some((rule, child_c, child_delta)) = consistent {
        children.push(Successor {
            assumption: Assumption::Consistent,
            rule,
            c: child_c,
            b: cc.clone(),
            delta: child_delta,
        });
    }

    // B ∪ C assumed inconsistent: B stays, C shrinks
    let inconsistent = if c.len() > 1 {
        c.split().map(|(left, right)| {
            let mut next = Vec::with_capacity(delta.len() + 1);
            next.push(right);
            next.extend(delta.iter().cloned());
            (BranchRule::SplitCandidates, left, next)
        })
    } else if c.len() == 1 {
        match delta {
            [first, rest @ ..] if first.len() == 1 => Some((BranchRule::SwapSingleton, first.clone(), rest.to_vec())),
            [first, rest @ ..] => first.split().map(|(left, right)| {
                let mut next = Vec::with_capacity(rest.len() + 1);
                next.push(right);
                next.extend(rest.iter().cloned());
                (BranchRule::SwapSplit, left, next)
            }),
            [] => None,
        }
    } else {
        None
    };
    if let Some((rule, child_c, child_delta)) = inconsistent {
        children.push(Successor {
            assumption: Assumption::Inconsistent,
            rule,
            c: child_c,
            b: b.clone(),
            delta: child_delta,
        });
    }

    children
}

/// What one look-ahead pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookaheadSummary {
    pub nodes: usize,
    pub dispatched: usize,
    pub inferred: usize,
}

/// Walks the speculation tree and dispatches check tasks into the check pool.
pub struct SpeculativeScheduler<O: Oracle> {
    context: CheckContext<O>,
    check_pool: Arc<WorkerPool>,
    frontier_slack: usize,
}

impl<O: Oracle> Clone for SpeculativeScheduler<O> {
    fn clone(&self) -> Self {
        SpeculativeScheduler {
            context: self.context.clone(),
            check_pool: Arc::clone(&self.check_pool),
            frontier_slack: self.frontier_slack,
        }
    }
}

impl<O: Oracle> SpeculativeScheduler<O> {
    pub fn new(context: CheckContext<O>, check_pool: Arc<WorkerPool>, frontier_slack: usize) -> Self {
        SpeculativeScheduler {
            context,
            check_pool,
            frontier_slack,
        }
    }

    fn cache(&self) -> &ResultCache {
        &self.context.cache
    }

    /// Maximum number of tasks one pass may dispatch
    pub fn parallelism(&self) -> usize {
        self.check_pool.threads()
    }

    /// Runs one pass for the state (C, B, Δ) and returns the materialized tree.
    pub fn run(
        &self,
        c: ConstraintSet,
        b: ConstraintSet,
        delta: Vec<ConstraintSet>,
        max_level: usize,
    ) -> (SpeculationTree, LookaheadSummary) {
        self.context.telemetry.incr(counters::LOOKAHEADS);
        let mut tree = SpeculationTree::new(c, b, delta);
        let root_cc = tree.root().cc.clone();
        let parallelism = self.parallelism();
        let mut summary = LookaheadSummary::default();
        let mut open = VecDeque::from([NodeId(0)]);

        debug!(
            "Look-ahead for C={} B={} (|Δ|={}, max level {})",
            tree.root().c,
            tree.root().b,
            tree.root().delta.len(),
            max_level
        );

        while let Some(id) = open.pop_front() {
            let Some(node) = tree.get(id) else {
                continue;
            };

            let dispatchable = !node.is_root()
                && node.assumption == Some(Assumption::Consistent)
                && node.cc.len() + self.frontier_slack >= root_cc.len()
                && !self.cache().contains(&node.cc)
                && node.level >= max_level
                && summary.dispatched < parallelism;
            if dispatchable {
                let cc = node.cc.clone();
                let (consistency, task) = self.dispatch(cc, &mut summary);
                if let Some(node) = tree.get_mut(id) {
                    node.consistency = consistency;
                    node.task = task;
                }
            }

            let Some(node) = tree.get(id) else {
                continue;
            };
            if node.level > max_level {
                continue;
            }
            let child_level = node.level + 1;
            let children = successors(&node.c, &node.b, &node.delta, |set| self.cache().contains(set));
            for successor in children {
                if successor.cc() == root_cc {
                    continue;
                }
                trace!("Look-ahead node at level {} via {}", child_level, successor.rule);
                if let Some(child) = tree.attach(id, successor) {
                    open.push_back(child);
                }
            }
        }

        summary.nodes = tree.len();
        self.context.telemetry.add(counters::SPECULATION_NODES, summary.nodes as u64);
        debug!(
            "Look-ahead done: {} nodes, {} tasks dispatched, {} inferred",
            summary.nodes, summary.dispatched, summary.inferred
        );
        (tree, summary)
    }

    fn dispatch(&self, cc: ConstraintSet, summary: &mut LookaheadSummary) -> (Option<bool>, Option<Arc<TaskHandle>>) {
        let registration = self.cache().register(cc, true);
        if let Some(consistent) = registration.entry.consistency() {
            if registration.inserted {
                summary.inferred += 1;
            }
            return (Some(consistent), None);
        }
        if !registration.inserted {
            return (None, registration.entry.owner());
        }

        let task = CheckTask::new(Arc::clone(&registration.entry), self.context.clone());
        let handle = task.handle();
        match self.check_pool.submit(Box::new(task)) {
            Ok(()) => {
                summary.dispatched += 1;
                trace!("Dispatched check task {} for {}", handle.id(), registration.entry.set());
                (None, Some(handle))
            }
            Err(e) => {
                warn!("Could not dispatch check for {}: {}", registration.entry.set(), e);
                (None, None)
            }
        }
    }
}

/// A look-ahead pass queued on the scheduler pool
pub struct LookaheadJob<O: Oracle> {
    scheduler: SpeculativeScheduler<O>,
    c: ConstraintSet,
    b: ConstraintSet,
    delta: Vec<ConstraintSet>,
    max_level: usize,
}

impl<O: Oracle> LookaheadJob<O> {
    pub fn new(
        scheduler: SpeculativeScheduler<O>,
        c: ConstraintSet,
        b: ConstraintSet,
        delta: Vec<ConstraintSet>,
        max_level: usize,
    ) -> Self {
        LookaheadJob {
            scheduler,
            c,
            b,
            delta,
            max_level,
        }
    }
}

impl<O: Oracle> PoolJob for LookaheadJob<O> {
    fn process(self: Box<Self>) {
        let job = *self;
        job.scheduler.run(job.c, job.b, job.delta, job.max_level);
    }
}
