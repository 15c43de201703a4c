//! Turns enrollments of RUNNING campaigns into SCHEDULED rows.

mod core;

pub use core::{EmailScheduler, ScheduleSummary, DEFAULT_JITTER_SECONDS};
