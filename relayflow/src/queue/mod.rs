//! Recoverable queue of incomplete submissions.

mod record;
mod store;

pub use record::{NewSubmission, QueueStats, RecordUpdate, SubmissionRecord, SubmissionStatus};
pub use store::{InMemorySubmissionStore, SubmissionStore};
