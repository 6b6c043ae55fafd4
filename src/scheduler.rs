pub mod jobs;
pub mod registry;

pub use jobs::{JobContext, PipelineFactory, Scheduler};
pub use registry::{CancelOutcome, JobRegistry};
