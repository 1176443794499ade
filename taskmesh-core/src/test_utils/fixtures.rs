//! Test fixtures for building task trees

use crate::core_model::{Task, TaskTree};

/// Builder for trees used across the test suites
pub struct TestTreeBuilder {
    tree: TaskTree,
}

impl TestTreeBuilder {
    pub fn new() -> Self {
        Self {
            tree: TaskTree::new(),
        }
    }

    pub fn with_task(mut self, title: &str) -> Self {
        self.tree.add_task(Task::new(title, ""));
        self
    }

    pub fn with_completed_task(mut self, title: &str) -> Self {
        let mut task = Task::new(title, "");
        task.completed = true;
        self.tree.add_task(task);
        self
    }

    pub fn with_subtask(mut self, parent_title: &str, title: &str) -> Self {
        let parent_id = self
            .tree
            .tasks
            .iter()
            .find(|t| t.title == parent_title)
            .expect("parent task not in fixture")
            .id
            .clone();
        self.tree.add_subtask(&parent_id, Task::new(title, ""));
        self
    }

    pub fn build(self) -> TaskTree {
        self.tree
    }
}

impl Default for TestTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_nests_subtasks() {
        let tree = TestTreeBuilder::new()
            .with_task("Groceries")
            .with_subtask("Groceries", "Buy milk")
            .with_completed_task("Laundry")
            .build();

        assert_eq!(tree.tasks.len(), 2);
        let by_title =
            |title: &str| tree.tasks.iter().find(|t| t.title == title).unwrap();
        assert_eq!(by_title("Groceries").sub_tasks.len(), 1);
        assert!(by_title("Laundry").completed);
    }
}
