//! Dependency-ordered task execution with a concurrency ceiling.
//!
//! Work is described as a [`TaskGraph`]: tasks plus "runs after" edges. The graph
//! is checked for cycles when it is built, so a bad wiring fails up front instead
//! of stalling a run. A [`Scheduler`] then drives the resulting [`ExecutionPlan`]
//! on the tokio runtime:
//!
//! - a task starts only once every predecessor has completed, whether the
//!   predecessor produced a value or "no result" (`None`);
//! - at most `ceiling` tasks run at the same time, eligible tasks start in the
//!   order they became eligible;
//! - each task's completion callback fires exactly once, before any dependent
//!   becomes eligible.
//!
//! Tasks never fail a run. A task that cannot produce its value returns `None`;
//! a task that panics is logged and treated the same way.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Index of a task inside the graph that created it.
pub type TaskId = usize;

/// Callback receiving a task's outcome.
pub type Completion<T> = Box<dyn FnOnce(Option<T>) + Send>;

/// A unit of deferred work. `None` is the "no result" outcome.
#[async_trait]
pub trait Task: Send {
    type Output: Send + 'static;

    async fn run(self: Box<Self>) -> Option<Self::Output>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} is not part of this graph")]
    UnknownTask(TaskId),

    #[error("cyclic dependency detected involving tasks: {0:?}")]
    Cycle(Vec<TaskId>),
}

struct Node<T> {
    task: Box<dyn Task<Output = T>>,
    completion: Completion<T>,
    predecessors: Vec<TaskId>,
}

/// Builder for a set of tasks and the order constraints between them.
pub struct TaskGraph<T> {
    nodes: Vec<Node<T>>,
}

impl<T: Send + 'static> Default for TaskGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGraph<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a task with no predecessors.
    pub fn add<K, F>(&mut self, task: K, completion: F) -> TaskId
    where
        K: Task<Output = T> + 'static,
        F: FnOnce(Option<T>) + Send + 'static,
    {
        self.nodes.push(Node {
            task: Box::new(task),
            completion: Box::new(completion),
            predecessors: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Adds a task that may only start after every task in `after` has completed.
    pub fn add_after<K, F>(
        &mut self,
        task: K,
        completion: F,
        after: &[TaskId],
    ) -> Result<TaskId, GraphError>
    where
        K: Task<Output = T> + 'static,
        F: FnOnce(Option<T>) + Send + 'static,
    {
        if let Some(&unknown) = after.iter().find(|&&id| id >= self.nodes.len()) {
            return Err(GraphError::UnknownTask(unknown));
        }

        let id = self.add(task, completion);
        self.nodes[id].predecessors.extend_from_slice(after);
        Ok(id)
    }

    /// Declares that `task` must not start before `on` has completed.
    pub fn add_dependency(&mut self, task: TaskId, on: TaskId) -> Result<(), GraphError> {
        if on >= self.nodes.len() {
            return Err(GraphError::UnknownTask(on));
        }
        let node = self
            .nodes
            .get_mut(task)
            .ok_or(GraphError::UnknownTask(task))?;

        if !node.predecessors.contains(&on) {
            node.predecessors.push(on);
        }
        Ok(())
    }

    /// Validates the graph and turns it into something a [`Scheduler`] can run.
    pub fn build(self) -> Result<ExecutionPlan<T>, GraphError> {
        let count = self.nodes.len();
        let mut dependents: Vec<Vec<TaskId>> = vec![Vec::new(); count];
        let mut remaining: Vec<usize> = vec![0; count];

        for (id, node) in self.nodes.iter().enumerate() {
            remaining[id] = node.predecessors.len();
            for &predecessor in &node.predecessors {
                dependents[predecessor].push(id);
            }
        }

        // Kahn's algorithm: anything never reaching in-degree zero sits on a cycle.
        let mut in_degree = remaining.clone();
        let mut queue: VecDeque<TaskId> = (0..count).filter(|&id| in_degree[id] == 0).collect();
        let mut visited = 0;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &dependent in &dependents[id] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != count {
            let cycle: Vec<TaskId> = (0..count).filter(|&id| in_degree[id] > 0).collect();
            return Err(GraphError::Cycle(cycle));
        }

        let slots = self
            .nodes
            .into_iter()
            .map(|node| Some((node.task, node.completion)))
            .collect();

        Ok(ExecutionPlan {
            slots,
            dependents,
            remaining,
        })
    }
}

/// A validated, acyclic task graph.
pub struct ExecutionPlan<T> {
    slots: Vec<Option<(Box<dyn Task<Output = T>>, Completion<T>)>>,
    dependents: Vec<Vec<TaskId>>,
    remaining: Vec<usize>,
}

/// Outcome counts of one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub produced: usize,
    pub no_result: usize,
    pub peak_running: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    ceiling: Option<NonZeroUsize>,
}

impl Scheduler {
    /// At most `ceiling` tasks run at once. A ceiling of zero is treated as one.
    pub fn bounded(ceiling: usize) -> Self {
        Self {
            ceiling: Some(NonZeroUsize::new(ceiling).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn unbounded() -> Self {
        Self { ceiling: None }
    }

    fn has_capacity(&self, running: usize) -> bool {
        self.ceiling.is_none_or(|ceiling| running < ceiling.get())
    }

    /// Runs every task of `plan` to completion.
    pub async fn run<T: Send + 'static>(&self, plan: ExecutionPlan<T>) -> RunSummary {
        let ExecutionPlan {
            mut slots,
            dependents,
            mut remaining,
        } = plan;

        let mut completions: Vec<Option<Completion<T>>> = slots.iter().map(|_| None).collect();
        let mut ready: VecDeque<TaskId> = (0..slots.len()).filter(|&id| remaining[id] == 0).collect();
        let mut running: JoinSet<(TaskId, Option<T>)> = JoinSet::new();
        let mut summary = RunSummary::default();

        loop {
            while self.has_capacity(running.len()) {
                let Some(id) = ready.pop_front() else { break };
                let Some((task, completion)) = slots[id].take() else { continue };

                completions[id] = Some(completion);
                running.spawn(async move {
                    let outcome = match tokio::spawn(task.run()).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(task = id, error = %err, "task aborted, treating as no result");
                            None
                        }
                    };
                    (id, outcome)
                });
                summary.peak_running = summary.peak_running.max(running.len());
                debug!(task = id, running = running.len(), "task started");
            }

            let Some(joined) = running.join_next().await else { break };
            let Ok((id, outcome)) = joined else { continue };

            if outcome.is_some() {
                summary.produced += 1;
            } else {
                summary.no_result += 1;
            }
            debug!(task = id, produced = outcome.is_some(), "task finished");

            if let Some(completion) = completions[id].take() {
                completion(outcome);
            }

            for &dependent in &dependents[id] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        summary
    }
}

/// Sending half of a one-shot gate. Signalling consumes it.
#[derive(Debug)]
pub struct Signal<T>(oneshot::Sender<Option<T>>);

impl<T> Signal<T> {
    pub fn signal(self, value: Option<T>) {
        // The waiter may have gone away; nothing is left to unblock then.
        let _ = self.0.send(value);
    }
}

/// Waiting half of a one-shot gate.
#[derive(Debug)]
pub struct Gate<T>(oneshot::Receiver<Option<T>>);

impl<T> Gate<T> {
    /// Resolves once the paired [`Signal`] fires, or with `None` if it is dropped unsignalled.
    pub async fn wait(self) -> Option<T> {
        self.0.await.ok().flatten()
    }
}

/// Creates a single-use gate: one signal, one waiter, no re-arming.
pub fn gate<T>() -> (Signal<T>, Gate<T>) {
    let (tx, rx) = oneshot::channel();
    (Signal(tx), Gate(rx))
}
