//! Operation graphs: all outbound operations generated by one commit.

use crate::error::{SyncError, SyncResult};
use crate::operation::{CloudOperation, OpStatus};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The set of operations generated by one local commit.
///
/// Graphs drain strictly in commit order: every operation of graph N must
/// reach a terminal status before any operation of graph N+1 starts. Within
/// a graph, operations execute in dependency-and-priority order.
#[derive(Debug, Clone)]
pub struct OperationGraph {
    /// The snapshot of the commit that produced this graph.
    pub snapshot: u64,
    /// The graph's operations.
    pub operations: Vec<CloudOperation>,
}

impl OperationGraph {
    /// Creates a graph for the commit at `snapshot`.
    #[must_use]
    pub fn new(snapshot: u64, operations: Vec<CloudOperation>) -> Self {
        Self {
            snapshot,
            operations,
        }
    }

    /// Validates the graph's dependency structure.
    ///
    /// Dependencies on uuids outside the graph are treated as satisfied; a
    /// cycle among the graph's own operations is a fatal configuration
    /// error.
    pub fn validate(&self, pipeline: &str) -> SyncResult<()> {
        let members: HashSet<Uuid> = self.operations.iter().map(|op| op.uuid).collect();
        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for op in &self.operations {
            let internal = op
                .dependencies
                .iter()
                .filter(|dep| members.contains(dep))
                .count();
            in_degree.insert(op.uuid, internal);
            for dep in &op.dependencies {
                if members.contains(dep) {
                    dependents.entry(*dep).or_default().push(op.uuid);
                }
            }
        }

        let mut ready: Vec<Uuid> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&uuid, _)| uuid)
            .collect();
        let mut visited = 0usize;
        while let Some(uuid) = ready.pop() {
            visited += 1;
            if let Some(children) = dependents.get(&uuid) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(*child);
                        }
                    }
                }
            }
        }
        if visited != self.operations.len() {
            return Err(SyncError::CircularDependency {
                pipeline: pipeline.to_string(),
            });
        }
        Ok(())
    }

    /// Returns true once every operation reached a terminal status.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.operations.iter().all(|op| op.status.is_terminal())
    }

    /// Returns the operation with the given uuid.
    #[must_use]
    pub fn operation(&self, uuid: Uuid) -> Option<&CloudOperation> {
        self.operations.iter().find(|op| op.uuid == uuid)
    }

    pub(crate) fn operation_mut(&mut self, uuid: Uuid) -> Option<&mut CloudOperation> {
        self.operations.iter_mut().find(|op| op.uuid == uuid)
    }

    /// Uuids of operations whose dependencies are all terminal and which
    /// are still pending, sorted by descending priority.
    pub(crate) fn eligible(&self) -> Vec<Uuid> {
        let done: HashSet<Uuid> = self
            .operations
            .iter()
            .filter(|op| op.status.is_terminal())
            .map(|op| op.uuid)
            .collect();
        let members: HashSet<Uuid> = self.operations.iter().map(|op| op.uuid).collect();

        let mut candidates: Vec<(i32, Uuid)> = self
            .operations
            .iter()
            .filter(|op| op.status == OpStatus::Pending)
            .filter(|op| {
                op.dependencies
                    .iter()
                    .all(|dep| !members.contains(dep) || done.contains(dep))
            })
            .map(|op| (op.priority, op.uuid))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.into_iter().map(|(_, uuid)| uuid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_codec::Value;

    fn op(kind: &str) -> CloudOperation {
        CloudOperation::new(kind, "p", Value::Null)
    }

    #[test]
    fn validate_accepts_dag() {
        let a = op("a");
        let b = op("b").with_dependency(a.uuid);
        let c = op("c").with_dependency(a.uuid).with_dependency(b.uuid);
        let graph = OperationGraph::new(1, vec![a, b, c]);
        assert!(graph.validate("p").is_ok());
    }

    #[test]
    fn validate_rejects_cycle() {
        let mut a = op("a");
        let mut b = op("b");
        let (ua, ub) = (a.uuid, b.uuid);
        a.dependencies.push(ub);
        b.dependencies.push(ua);
        let graph = OperationGraph::new(1, vec![a, b]);
        assert!(matches!(
            graph.validate("p"),
            Err(SyncError::CircularDependency { .. })
        ));
    }

    #[test]
    fn external_dependencies_are_satisfied() {
        let a = op("a").with_dependency(Uuid::new_v4());
        let graph = OperationGraph::new(1, vec![a.clone()]);
        assert!(graph.validate("p").is_ok());
        assert_eq!(graph.eligible(), vec![a.uuid]);
    }

    #[test]
    fn eligible_respects_dependencies_and_priority() {
        let a = op("a").with_priority(1);
        let b = op("b").with_priority(5).with_dependency(a.uuid);
        let c = op("c").with_priority(3);
        let graph = OperationGraph::new(1, vec![a.clone(), b.clone(), c.clone()]);

        // b's dependency is unmet; c outranks a.
        assert_eq!(graph.eligible(), vec![c.uuid, a.uuid]);

        let mut graph = graph;
        if let Some(done) = graph.operation_mut(a.uuid) {
            done.status = OpStatus::Completed;
        }
        if let Some(done) = graph.operation_mut(c.uuid) {
            done.status = OpStatus::Completed;
        }
        assert_eq!(graph.eligible(), vec![b.uuid]);
        assert!(!graph.is_complete());
    }
}
