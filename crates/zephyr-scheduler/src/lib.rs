//! Run scheduling for Zephyr.
//!
//! The scheduler is a single coordinator task that owns each run's job DAG,
//! admits ready jobs under a global concurrency cap and hands them to a
//! `JobRunner`. Log chunks fan out through the in-process bus; durability
//! lives in the store.

pub mod bus;
pub mod dag;
pub mod resolver;
pub mod runner;
pub mod scheduler;

pub use bus::{BusEvent, LogBus};
pub use dag::{CompletionEffects, JobDag, NodeStatus};
pub use resolver::{FileResolver, PipelineResolver};
pub use runner::{JobOutcome, JobRequest, JobRunner, WorkspaceFile};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
