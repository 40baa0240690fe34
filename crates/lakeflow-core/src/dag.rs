// Arena-based task graph for a single workflow.
// Tasks are integer indices into the arena; edges point from a downstream
// node to its upstream dependencies. The executor owns the status vector and
// asks the graph which tasks are ready each round.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::workflow::{DependencyType, ExecutionStatus, WorkflowDependency, WorkflowTask};

#[derive(Debug, Clone, Copy)]
struct Edge {
    upstream: usize,
    dependency_type: DependencyType,
}

/// How an unfinished task relates to its upstream statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResolution {
    /// Every edge is satisfied; the task may be dispatched
    Ready,
    /// An edge resolved to "never runnable": the task must become SKIPPED
    Skip,
    /// Some upstream has not reached a terminal status yet
    Blocked,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    priorities: Vec<i32>,
    upstream: Vec<Vec<Edge>>,
}

impl TaskGraph {
    /// Build the arena from a workflow's tasks and dependency edges.
    /// Rejects edges naming unknown tasks and self-edges.
    pub fn build(
        tasks: &[WorkflowTask],
        dependencies: &[WorkflowDependency],
    ) -> Result<Self, CoreError> {
        let mut names = Vec::with_capacity(tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        let mut priorities = Vec::with_capacity(tasks.len());

        for task in tasks {
            if index.contains_key(&task.task_name) {
                return Err(CoreError::config(format!(
                    "duplicate task name: {}",
                    task.task_name
                )));
            }
            index.insert(task.task_name.clone(), names.len());
            names.push(task.task_name.clone());
            priorities.push(task.priority);
        }

        let mut upstream = vec![Vec::new(); names.len()];
        for dep in dependencies {
            let up = *index.get(&dep.upstream_task).ok_or_else(|| {
                CoreError::config(format!("dependency names unknown task: {}", dep.upstream_task))
            })?;
            let down = *index.get(&dep.downstream_task).ok_or_else(|| {
                CoreError::config(format!(
                    "dependency names unknown task: {}",
                    dep.downstream_task
                ))
            })?;
            if up == down {
                return Err(CoreError::config(format!(
                    "task depends on itself: {}",
                    dep.upstream_task
                )));
            }
            upstream[down].push(Edge {
                upstream: up,
                dependency_type: dep.dependency_type,
            });
        }

        Ok(Self {
            names,
            index,
            priorities,
            upstream,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Kahn's algorithm; an incomplete ordering means a cycle.
    pub fn validate_acyclic(&self, workflow_name: &str) -> Result<(), CoreError> {
        if self.topo_order().len() == self.len() {
            Ok(())
        } else {
            Err(CoreError::CycleDetected(workflow_name.to_string()))
        }
    }

    /// Topological order over the whole graph (partial if cyclic)
    pub fn topo_order(&self) -> Vec<usize> {
        let mut in_degree = vec![0usize; self.len()];
        for (node, edges) in self.upstream.iter().enumerate() {
            in_degree[node] = edges.len();
        }

        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.len()];
        for (node, edges) in self.upstream.iter().enumerate() {
            for edge in edges {
                downstream[edge.upstream].push(node);
            }
        }

        let mut queue: Vec<usize> = (0..self.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(node) = queue.pop() {
            order.push(node);
            for &next in &downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }
        order
    }

    /// Resolve one unfinished task against current terminal statuses.
    /// `statuses[i]` is Some only once task i reached a terminal status.
    pub fn resolve(&self, node: usize, statuses: &[Option<ExecutionStatus>]) -> TaskResolution {
        let mut ready = true;
        for edge in &self.upstream[node] {
            match (edge.dependency_type, statuses[edge.upstream]) {
                (_, None) => ready = false,
                (DependencyType::Success, Some(s)) => match s {
                    ExecutionStatus::Success | ExecutionStatus::Skipped => {}
                    // Upstream can never succeed, so the task is unreachable
                    _ => return TaskResolution::Skip,
                },
                (DependencyType::Completion, Some(s)) => {
                    if !s.is_terminal() {
                        ready = false;
                    }
                }
                (DependencyType::SkipOnFailure, Some(s)) => match s {
                    ExecutionStatus::Success | ExecutionStatus::Skipped => {}
                    _ => return TaskResolution::Skip,
                },
            }
        }
        if ready {
            TaskResolution::Ready
        } else {
            TaskResolution::Blocked
        }
    }

    /// One scheduling round: the ready cohort ordered by priority descending
    /// (insertion order breaks ties) plus the tasks that must be skipped.
    pub fn ready_cohort(
        &self,
        statuses: &[Option<ExecutionStatus>],
    ) -> (Vec<usize>, Vec<usize>) {
        let mut ready = Vec::new();
        let mut skip = Vec::new();
        for node in 0..self.len() {
            if statuses[node].is_some() {
                continue;
            }
            match self.resolve(node, statuses) {
                TaskResolution::Ready => ready.push(node),
                TaskResolution::Skip => skip.push(node),
                TaskResolution::Blocked => {}
            }
        }
        ready.sort_by(|&a, &b| {
            self.priorities[b]
                .cmp(&self.priorities[a])
                .then_with(|| a.cmp(&b))
        });
        (ready, skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskType;

    fn task(name: &str, priority: i32) -> WorkflowTask {
        let mut t = WorkflowTask::new("wf", name, TaskType::CustomJob, name);
        t.priority = priority;
        t
    }

    fn dep(up: &str, down: &str, dt: DependencyType) -> WorkflowDependency {
        WorkflowDependency {
            workflow_name: "wf".into(),
            upstream_task: up.into(),
            downstream_task: down.into(),
            dependency_type: dt,
            condition_expression: None,
        }
    }

    fn diamond() -> TaskGraph {
        let tasks = vec![task("a", 0), task("b", 0), task("c", 5), task("d", 0)];
        let deps = vec![
            dep("a", "b", DependencyType::Success),
            dep("a", "c", DependencyType::Success),
            dep("b", "d", DependencyType::Success),
            dep("c", "d", DependencyType::Success),
        ];
        TaskGraph::build(&tasks, &deps).unwrap()
    }

    #[test]
    fn cycle_is_rejected() {
        let tasks = vec![task("a", 0), task("b", 0)];
        let deps = vec![
            dep("a", "b", DependencyType::Success),
            dep("b", "a", DependencyType::Success),
        ];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();
        assert!(matches!(
            graph.validate_acyclic("wf"),
            Err(CoreError::CycleDetected(_))
        ));
    }

    #[test]
    fn self_edge_is_rejected_at_build() {
        let tasks = vec![task("a", 0)];
        let deps = vec![dep("a", "a", DependencyType::Success)];
        assert!(TaskGraph::build(&tasks, &deps).is_err());
    }

    #[test]
    fn unknown_task_in_dependency_is_rejected() {
        let tasks = vec![task("a", 0)];
        let deps = vec![dep("a", "ghost", DependencyType::Success)];
        assert!(TaskGraph::build(&tasks, &deps).is_err());
    }

    #[test]
    fn diamond_schedules_in_waves() {
        let graph = diamond();
        let mut statuses = vec![None; graph.len()];

        let (ready, skip) = graph.ready_cohort(&statuses);
        assert_eq!(ready, vec![graph.index_of("a").unwrap()]);
        assert!(skip.is_empty());

        statuses[graph.index_of("a").unwrap()] = Some(ExecutionStatus::Success);
        let (ready, _) = graph.ready_cohort(&statuses);
        // c has priority 5 and must come first in the cohort
        assert_eq!(ready.len(), 2);
        assert_eq!(graph.name(ready[0]), "c");
        assert_eq!(graph.name(ready[1]), "b");

        statuses[graph.index_of("b").unwrap()] = Some(ExecutionStatus::Success);
        let (ready, _) = graph.ready_cohort(&statuses);
        assert!(ready.is_empty(), "d waits for both b and c");

        statuses[graph.index_of("c").unwrap()] = Some(ExecutionStatus::Success);
        let (ready, _) = graph.ready_cohort(&statuses);
        assert_eq!(ready, vec![graph.index_of("d").unwrap()]);
    }

    #[test]
    fn success_edge_accepts_skipped_upstream() {
        let tasks = vec![task("a", 0), task("b", 0)];
        let deps = vec![dep("a", "b", DependencyType::Success)];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();
        let statuses = vec![Some(ExecutionStatus::Skipped), None];
        assert_eq!(graph.resolve(1, &statuses), TaskResolution::Ready);
    }

    #[test]
    fn success_edge_skips_downstream_of_failure() {
        let tasks = vec![task("a", 0), task("b", 0)];
        let deps = vec![dep("a", "b", DependencyType::Success)];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();
        let statuses = vec![Some(ExecutionStatus::Failed), None];
        assert_eq!(graph.resolve(1, &statuses), TaskResolution::Skip);
    }

    #[test]
    fn completion_edge_accepts_any_terminal() {
        let tasks = vec![task("a", 0), task("b", 0)];
        let deps = vec![dep("a", "b", DependencyType::Completion)];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
            ExecutionStatus::Cancelled,
        ] {
            let statuses = vec![Some(status), None];
            assert_eq!(graph.resolve(1, &statuses), TaskResolution::Ready);
        }
    }

    #[test]
    fn skip_on_failure_edge() {
        let tasks = vec![task("a", 0), task("b", 0)];
        let deps = vec![dep("a", "b", DependencyType::SkipOnFailure)];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();

        let statuses = vec![Some(ExecutionStatus::Success), None];
        assert_eq!(graph.resolve(1, &statuses), TaskResolution::Ready);

        let statuses = vec![Some(ExecutionStatus::Failed), None];
        assert_eq!(graph.resolve(1, &statuses), TaskResolution::Skip);
    }

    #[test]
    fn skip_cascades_through_success_chain() {
        // a -> b -> c; a fails, so b skips, then c skips too
        let tasks = vec![task("a", 0), task("b", 0), task("c", 0)];
        let deps = vec![
            dep("a", "b", DependencyType::SkipOnFailure),
            dep("b", "c", DependencyType::Success),
        ];
        let graph = TaskGraph::build(&tasks, &deps).unwrap();
        let mut statuses = vec![Some(ExecutionStatus::Failed), None, None];

        let (ready, skip) = graph.ready_cohort(&statuses);
        assert!(ready.is_empty());
        assert_eq!(skip, vec![1]);

        statuses[1] = Some(ExecutionStatus::Skipped);
        let (ready, skip) = graph.ready_cohort(&statuses);
        // SUCCESS edge treats SKIPPED upstream as satisfied
        assert_eq!(ready, vec![2]);
        assert!(skip.is_empty());
    }

    #[test]
    fn topo_order_is_complete_for_acyclic_graph() {
        let graph = diamond();
        let order = graph.topo_order();
        assert_eq!(order.len(), 4);
        let pos =
            |n: &str| order.iter().position(|&i| graph.name(i) == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}
