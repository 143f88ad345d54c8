//! OBD-II Poll Scheduler
//!
//! Shares one slow request/response channel across many sensors: keys that
//! matter visually are refreshed every tick, the rest in rotation.

mod scheduler;

pub use scheduler::{InterlacedScheduler, PollPlan, SchedulerConfig, HIGH_PRIORITY_SENSORS};
