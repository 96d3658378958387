pub(crate) mod blobs;
pub mod gc;
pub mod job;
pub mod service;
pub mod store;

pub use gc::GarbageCollector;
pub use job::{JobRecord, JobStatus};
pub use service::{JobResult, SchedulerService, SubmitReceipt};
pub use store::JobStore;
