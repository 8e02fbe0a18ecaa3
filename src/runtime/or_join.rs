//! OR-join enablement.
//!
//! The net is abstracted as a reset net: every condition is a place, every task `t`
//! gets a busy place `p_t` plus start transitions (consume the join inputs, mark `p_t`)
//! and end transitions (consume `p_t`, produce the split outputs). A cancellation
//! region becomes reset arcs on the end transitions of its owner.
//!
//! The OR-join waits as long as some hypothetical marking that adds a token to one of
//! its empty inputs is still coverable from the current marking. Coverability is
//! decided with the classic backward algorithm: the upward-closed set of markings that
//! can reach the goal is represented by its finite basis of minimal elements and grown
//! by predecessor steps until it stabilises.

use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::dsl::{JoinType, SplitType};
use crate::error::{EngineError, Result};
use crate::runtime::context::Context;
use crate::runtime::net::{NetModel, TaskDef};
use crate::runtime::storage::TaskState;

/// Active locations of an instance at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkingSnapshot {
    /// Conditions with a positive marking.
    pub marked: BTreeSet<String>,
    /// Tasks in the `Active` state.
    pub active: BTreeSet<String>,
}

impl MarkingSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marked(mut self, condition: &str) -> Self {
        self.marked.insert(condition.to_string());
        self
    }

    pub fn with_active(mut self, task: &str) -> Self {
        self.active.insert(task.to_string());
        self
    }

    pub async fn capture(ctx: &Context) -> Result<Self> {
        let conditions = ctx.store.load_conditions(&ctx.workflow_id).await?;
        let tasks = ctx.store.load_tasks(&ctx.workflow_id).await?;
        Ok(Self {
            marked: conditions
                .into_iter()
                .filter(|c| c.marking > 0)
                .map(|c| c.name)
                .collect(),
            active: tasks
                .into_iter()
                .filter(|t| t.state == TaskState::Active)
                .map(|t| t.name)
                .collect(),
        })
    }
}

pub struct OrJoinAnalyzer<'a> {
    net: &'a NetModel,
    search_limit: usize,
}

impl<'a> OrJoinAnalyzer<'a> {
    pub fn new(net: &'a NetModel, search_limit: usize) -> Self {
        Self { net, search_limit }
    }

    /// Decides whether the OR-join `task` may be enabled under `snapshot`. Pure.
    pub fn is_enabled(&self, task: &str, snapshot: &MarkingSnapshot) -> Result<bool> {
        let join = self.net.task(task)?;
        let (marked, empty): (Vec<&String>, Vec<&String>) =
            join.preset.iter().partition(|c| snapshot.marked.contains(c.as_str()));

        if marked.is_empty() {
            return Ok(false);
        }
        if empty.is_empty() {
            return Ok(true);
        }

        let inputs: Vec<Place> = join.preset.iter().map(|c| Place::Condition(c.clone())).collect();
        let reset_net = ResetNet::build(self.net, join).restrict(&inputs);
        let current = reset_net.marking_of(snapshot);

        for q in empty {
            let mut goal = vec![0u32; reset_net.places.len()];
            for c in marked.iter().chain(std::iter::once(&q)) {
                if let Some(idx) = reset_net.index_of(&Place::Condition((*c).clone())) {
                    goal[idx] = 1;
                }
            }
            if reset_net.coverable(&current, goal, self.search_limit)? {
                debug!(task = %task, waiting_on = %q, "OR-join blocked: input still coverable");
                return Ok(false);
            }
        }
        debug!(task = %task, "OR-join enabled");
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Place {
    Condition(String),
    Busy(String),
}

#[derive(Debug, Clone)]
struct ResetTransition {
    pre: Vec<(usize, u32)>,
    post: Vec<(usize, u32)>,
    resets: Vec<usize>,
}

type Marking = Vec<u32>;

#[derive(Debug, Default)]
struct ResetNet {
    places: Vec<Place>,
    index: HashMap<Place, usize>,
    transitions: Vec<ResetTransition>,
}

impl ResetNet {
    fn place(&mut self, place: Place) -> usize {
        if let Some(idx) = self.index.get(&place) {
            return *idx;
        }
        let idx = self.places.len();
        self.places.push(place.clone());
        self.index.insert(place, idx);
        idx
    }

    fn index_of(&self, place: &Place) -> Option<usize> {
        self.index.get(place).copied()
    }

    /// Whole-net abstraction. The analysed join gets no start transition; other
    /// OR-joins are treated as XOR-joins.
    fn build(net: &NetModel, join: &TaskDef) -> Self {
        let mut rn = ResetNet::default();

        for task in net.tasks.values() {
            let busy = rn.place(Place::Busy(task.name.clone()));

            if task.name != join.name {
                match task.join_type {
                    JoinType::And => {
                        let pre = task
                            .preset
                            .iter()
                            .map(|c| (rn.place(Place::Condition(c.clone())), 1))
                            .collect();
                        rn.transitions.push(ResetTransition {
                            pre,
                            post: vec![(busy, 1)],
                            resets: Vec::new(),
                        });
                    }
                    JoinType::Xor | JoinType::Or => {
                        for c in &task.preset {
                            let input = rn.place(Place::Condition(c.clone()));
                            rn.transitions.push(ResetTransition {
                                pre: vec![(input, 1)],
                                post: vec![(busy, 1)],
                                resets: Vec::new(),
                            });
                        }
                    }
                }
            }

            let mut resets: Vec<usize> = task
                .cancellation_region
                .tasks
                .iter()
                .map(|t| rn.place(Place::Busy(t.clone())))
                .collect();
            resets.extend(
                task.cancellation_region
                    .conditions
                    .iter()
                    .map(|c| rn.place(Place::Condition(c.clone()))),
            );

            let outputs: Vec<usize> = task
                .postset()
                .map(|c| rn.place(Place::Condition(c.to_string())))
                .collect();
            match task.split_type {
                // The full fan-out dominates every subset, so one transition suffices for OR.
                SplitType::And | SplitType::Or => {
                    rn.transitions.push(ResetTransition {
                        pre: vec![(busy, 1)],
                        post: outputs.iter().map(|o| (*o, 1)).collect(),
                        resets: resets.clone(),
                    });
                }
                SplitType::Xor => {
                    for o in &outputs {
                        rn.transitions.push(ResetTransition {
                            pre: vec![(busy, 1)],
                            post: vec![(*o, 1)],
                            resets: resets.clone(),
                        });
                    }
                }
            }
        }
        rn
    }

    /// Keeps only places that can feed `targets` and transitions producing into them.
    fn restrict(self, targets: &[Place]) -> Self {
        let mut producers: HashMap<usize, Vec<usize>> = HashMap::new();
        for (ti, t) in self.transitions.iter().enumerate() {
            for (p, _) in &t.post {
                producers.entry(*p).or_default().push(ti);
            }
        }

        let mut relevant = vec![false; self.places.len()];
        let mut worklist: VecDeque<usize> = targets.iter().filter_map(|p| self.index_of(p)).collect();
        for p in &worklist {
            relevant[*p] = true;
        }
        while let Some(p) = worklist.pop_front() {
            for ti in producers.get(&p).map(|v| v.as_slice()).unwrap_or(&[]) {
                for (q, _) in &self.transitions[*ti].pre {
                    if !relevant[*q] {
                        relevant[*q] = true;
                        worklist.push_back(*q);
                    }
                }
            }
        }

        let mut restricted = ResetNet::default();
        let mut remap = vec![None; self.places.len()];
        for (old, place) in self.places.iter().enumerate() {
            if relevant[old] {
                remap[old] = Some(restricted.place(place.clone()));
            }
        }
        for t in self.transitions {
            if !t.post.iter().any(|(p, _)| relevant[*p]) {
                continue;
            }
            let project = |arcs: &[(usize, u32)]| -> Vec<(usize, u32)> {
                arcs.iter().filter_map(|(p, n)| remap[*p].map(|np| (np, *n))).collect()
            };
            restricted.transitions.push(ResetTransition {
                pre: project(&t.pre),
                post: project(&t.post),
                resets: t.resets.iter().filter_map(|p| remap[*p]).collect(),
            });
        }
        restricted
    }

    /// One token per marked condition and per active task.
    fn marking_of(&self, snapshot: &MarkingSnapshot) -> Marking {
        let mut m = vec![0u32; self.places.len()];
        for c in &snapshot.marked {
            if let Some(idx) = self.index_of(&Place::Condition(c.clone())) {
                m[idx] = 1;
            }
        }
        for t in &snapshot.active {
            if let Some(idx) = self.index_of(&Place::Busy(t.clone())) {
                m[idx] = 1;
            }
        }
        m
    }

    /// Minimal marking from which firing `t` lands in the upward closure of `m`.
    fn predecessor(t: &ResetTransition, m: &Marking) -> Option<Marking> {
        if !t.post.iter().any(|(p, _)| m[*p] > 0) {
            // pred >= m, already covered by m itself
            return None;
        }
        let produced = |p: usize| t.post.iter().filter(|(q, _)| *q == p).map(|(_, n)| *n).sum::<u32>();

        let mut pred = m.clone();
        for &r in &t.resets {
            if produced(r) < m[r] {
                return None;
            }
            pred[r] = 0;
        }
        for (p, n) in &t.post {
            if !t.resets.contains(p) {
                pred[*p] = pred[*p].saturating_sub(*n);
            }
        }
        for (p, n) in &t.pre {
            pred[*p] += *n;
        }
        Some(pred)
    }

    fn coverable(&self, current: &Marking, goal: Marking, search_limit: usize) -> Result<bool> {
        if covers(current, &goal) {
            return Ok(true);
        }

        let mut basis: Vec<Marking> = vec![goal.clone()];
        let mut frontier: VecDeque<Marking> = VecDeque::from([goal]);
        let mut inserted = 0usize;

        while let Some(m) = frontier.pop_front() {
            if !basis.contains(&m) {
                // superseded by a smaller element
                continue;
            }
            for t in &self.transitions {
                let Some(pred) = Self::predecessor(t, &m) else {
                    continue;
                };
                if covers(current, &pred) {
                    return Ok(true);
                }
                if basis.iter().any(|b| covers(&pred, b)) {
                    continue;
                }
                basis.retain(|b| !covers(b, &pred));
                basis.push(pred.clone());
                frontier.push_back(pred);

                inserted += 1;
                if inserted > search_limit {
                    return Err(EngineError::NetConsistency(format!(
                        "OR-join coverability search did not converge within {} basis markings",
                        search_limit
                    )));
                }
            }
        }
        Ok(false)
    }
}

/// `a >= b` componentwise.
fn covers(a: &Marking, b: &Marking) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x >= y)
}
