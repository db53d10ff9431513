//! Pipeline module for Sift
//!
//! The two-stage concurrent pipeline: bounded queues carry packet jobs from
//! the reader through load balancers to fast-path workers, with flow
//! affinity guaranteed by the five-tuple hash at both stages.

pub mod fast_path;
pub mod lb;
pub mod queue;

use std::time::Duration;

/// Pop timeout shared by every stage's consume loop; doubles as the cadence
/// for idle housekeeping in the workers.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
