mod job;
mod store;

pub use job::{Job, JobState, StateCounts, preview};
pub use store::JobStore;
