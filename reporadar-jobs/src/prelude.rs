//! The purpose of this module is to alleviate the need to import many of the
//! `[reporadar_jobs]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use reporadar_jobs::prelude::*;
//! ```
pub use crate::backend::{Backend, QueueStats};
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::config::QueueConfig;
pub use crate::job::options::JobOptions;
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::maintenance::MaintenanceConfig;
pub use crate::processor::{Processor, ProcessorError, ProgressHandle};
pub use crate::{JobQueue, QueueError};
