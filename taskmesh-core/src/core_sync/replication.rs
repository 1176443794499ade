//! Replication policy: whole-state overwrite
//!
//! The replicator owns the local tree replica and the two replication
//! operations: serialize-and-hand-off on local mutation, and
//! decode-and-replace on receipt. An incoming well-formed snapshot
//! replaces the entire tree unconditionally (last-received-wins); this
//! guarantees all peers converge to some common state quickly, at the
//! cost of discarding concurrent local edits the sender had not seen.
//! A malformed payload changes nothing.

use tracing::{debug, warn};

use crate::core_model::{decode_snapshot, encode_snapshot, SnapshotDecodeError, TaskTree};

/// Owner of the local tree replica
#[derive(Default)]
pub struct Replicator {
    tree: TaskTree,
}

impl Replicator {
    pub fn new(tree: TaskTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Record a local mutation and produce the snapshot to broadcast
    pub fn local_mutation(&mut self, tree: TaskTree) -> String {
        self.tree = tree;
        let snapshot = encode_snapshot(&self.tree);
        debug!(bytes = snapshot.len(), "Local mutation encoded");
        snapshot
    }

    /// Apply an incoming snapshot, replacing the whole tree
    ///
    /// On decode failure the existing tree is left untouched; a
    /// corrupt snapshot is never partially applied.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<&TaskTree, SnapshotDecodeError> {
        match decode_snapshot(bytes) {
            Ok(tasks) => {
                self.tree.replace(tasks);
                Ok(&self.tree)
            }
            Err(e) => {
                warn!(error = %e, "Discarding undecodable snapshot");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_model::Task;

    #[test]
    fn test_apply_remote_overwrites_whole_state() {
        let mut local = TaskTree::new();
        local.add_task(Task::new("Local only", ""));
        let mut replicator = Replicator::new(local);

        let mut remote = TaskTree::new();
        remote.add_task(Task::new("Remote truth", ""));
        let snapshot = encode_snapshot(&remote);

        let applied = replicator.apply_remote(snapshot.as_bytes()).unwrap();
        assert_eq!(applied, &remote);
        // The concurrent local edit is gone: whole-state overwrite.
        assert!(replicator
            .tree()
            .tasks
            .iter()
            .all(|t| t.title != "Local only"));
    }

    #[test]
    fn test_apply_remote_regardless_of_prior_content() {
        for prior in [TaskTree::new(), {
            let mut t = TaskTree::new();
            t.add_task(Task::new("a", ""));
            t.add_task(Task::new("b", ""));
            t
        }] {
            let mut replicator = Replicator::new(prior);
            let snapshot = r#"[{"id":"1","title":"Buy milk","completed":true,"subTasks":[]}]"#;
            let applied = replicator.apply_remote(snapshot.as_bytes()).unwrap();
            assert_eq!(applied.tasks.len(), 1);
            assert!(applied.tasks[0].completed);
        }
    }

    #[test]
    fn test_malformed_payload_leaves_tree_unchanged() {
        let mut tree = TaskTree::new();
        tree.add_task(Task::new("Keep me", ""));
        let mut replicator = Replicator::new(tree.clone());

        assert!(replicator.apply_remote(b"{{{ not json").is_err());
        assert_eq!(replicator.tree(), &tree);
    }

    #[test]
    fn test_local_mutation_round_trips() {
        let mut replicator = Replicator::default();
        let mut tree = TaskTree::new();
        tree.add_task(Task::new("Buy milk", ""));

        let snapshot = replicator.local_mutation(tree.clone());
        let mut other = Replicator::default();
        let applied = other.apply_remote(snapshot.as_bytes()).unwrap();
        assert_eq!(applied, &tree);
    }
}
