//! Task tree model
//!
//! A task is a recursive record: the parent exclusively owns its
//! subtasks by value, so the no-cycle invariant is structural. The
//! whole tree is what replication transmits; mutation helpers here are
//! what the UI/CLI layer drives between broadcasts.

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// A single task with its nested subtasks
///
/// Field names on the wire are camelCase to match the snapshot
/// encoding shared by all peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub starred: bool,
    /// Due timestamp in epoch milliseconds
    #[serde(default)]
    pub due_date: Option<i64>,
    /// Peer/user reference this task is assigned to
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Display-ordered subtasks
    #[serde(default)]
    pub sub_tasks: Vec<Task>,
}

impl Task {
    /// Create a new task with a fresh process-unique id
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Task {
            id: TaskId::generate(),
            title: title.into(),
            description: description.into(),
            completed: false,
            starred: false,
            due_date: None,
            assigned_to: None,
            sub_tasks: Vec::new(),
        }
    }
}

/// The local replica of the shared task list
///
/// Root tasks are kept in display order. All mutation goes through the
/// single engine task, so no interior locking is needed here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTree {
    pub tasks: Vec<Task>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Append a task at the root level
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Append a subtask under the task with the given id
    ///
    /// Returns false when no task with that id exists anywhere in the
    /// tree.
    pub fn add_subtask(&mut self, parent_id: &str, subtask: Task) -> bool {
        match self.find_mut(parent_id) {
            Some(parent) => {
                parent.sub_tasks.push(subtask);
                true
            }
            None => false,
        }
    }

    /// Flip the completed flag on a task
    pub fn toggle_completed(&mut self, id: &str) -> bool {
        match self.find_mut(id) {
            Some(task) => {
                task.completed = !task.completed;
                true
            }
            None => false,
        }
    }

    /// Flip the starred flag on a task
    pub fn toggle_starred(&mut self, id: &str) -> bool {
        match self.find_mut(id) {
            Some(task) => {
                task.starred = !task.starred;
                true
            }
            None => false,
        }
    }

    /// Set or clear the due timestamp on a task
    pub fn schedule(&mut self, id: &str, due_date: Option<i64>) -> bool {
        match self.find_mut(id) {
            Some(task) => {
                task.due_date = due_date;
                true
            }
            None => false,
        }
    }

    /// Set or clear the assignee on a task
    pub fn assign(&mut self, id: &str, assignee: Option<String>) -> bool {
        match self.find_mut(id) {
            Some(task) => {
                task.assigned_to = assignee;
                true
            }
            None => false,
        }
    }

    /// Look up a task anywhere in the tree
    pub fn find(&self, id: &str) -> Option<&Task> {
        fn walk<'a>(tasks: &'a [Task], id: &str) -> Option<&'a Task> {
            for task in tasks {
                if task.id == id {
                    return Some(task);
                }
                if let Some(found) = walk(&task.sub_tasks, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.tasks, id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Task> {
        fn walk<'a>(tasks: &'a mut [Task], id: &str) -> Option<&'a mut Task> {
            for task in tasks {
                if task.id == id {
                    return Some(task);
                }
                if let Some(found) = walk(&mut task.sub_tasks, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.tasks, id)
    }

    /// Replace the entire tree with an incoming snapshot
    ///
    /// Tasks absent from the snapshot are implicitly deleted.
    pub fn replace(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TaskTree {
        let mut tree = TaskTree::new();
        let mut groceries = Task::new("Groceries", "weekly run");
        groceries.sub_tasks.push(Task::new("Buy milk", ""));
        tree.add_task(groceries);
        tree.add_task(Task::new("File taxes", ""));
        tree
    }

    #[test]
    fn test_add_and_find_nested() {
        let tree = sample_tree();
        let milk_id = tree.tasks[0].sub_tasks[0].id.clone();
        assert!(tree.find(&milk_id).is_some());
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn test_toggle_completed_nested() {
        let mut tree = sample_tree();
        let milk_id = tree.tasks[0].sub_tasks[0].id.clone();

        assert!(tree.toggle_completed(&milk_id));
        assert!(tree.find(&milk_id).unwrap().completed);

        assert!(tree.toggle_completed(&milk_id));
        assert!(!tree.find(&milk_id).unwrap().completed);
    }

    #[test]
    fn test_toggle_missing_task() {
        let mut tree = sample_tree();
        assert!(!tree.toggle_completed("does-not-exist"));
        assert!(!tree.toggle_starred("does-not-exist"));
    }

    #[test]
    fn test_add_subtask() {
        let mut tree = sample_tree();
        let parent_id = tree.tasks[1].id.clone();
        assert!(tree.add_subtask(&parent_id, Task::new("Gather receipts", "")));
        assert_eq!(tree.tasks[1].sub_tasks.len(), 1);
    }

    #[test]
    fn test_schedule_and_assign() {
        let mut tree = sample_tree();
        let id = tree.tasks[1].id.clone();

        assert!(tree.schedule(&id, Some(1_700_000_000_000)));
        assert_eq!(tree.find(&id).unwrap().due_date, Some(1_700_000_000_000));

        assert!(tree.assign(&id, Some("alice".to_string())));
        assert_eq!(
            tree.find(&id).unwrap().assigned_to.as_deref(),
            Some("alice")
        );

        assert!(tree.assign(&id, None));
        assert!(tree.find(&id).unwrap().assigned_to.is_none());
    }

    #[test]
    fn test_replace_discards_previous_tasks() {
        let mut tree = sample_tree();
        tree.replace(vec![Task::new("Only survivor", "")]);
        assert_eq!(tree.tasks.len(), 1);
        assert_eq!(tree.tasks[0].title, "Only survivor");
    }
}
