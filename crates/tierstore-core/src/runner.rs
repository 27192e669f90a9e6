//! Background task runner interface.
//!
//! Implemented by `tierstore-io::executor`. Used for fire-and-forget work such
//! as deleting freed scratch files and memory pressure relief.

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskRunner: Send + Sync {
    /// Submit a task. Must not block on the task itself.
    fn execute(&self, task: Task);
}
