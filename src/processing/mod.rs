mod strand;
mod thread;

pub use strand::ProcessingStrand;
pub use thread::{PermanentTaskId, ProcessingThread, MAXIMUM_TASKS_PROCESSABLE_AT_ONCE};
