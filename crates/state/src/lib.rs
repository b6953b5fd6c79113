#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Data model and replicated-state stand-in for the stevedore scheduling core.
//!
//! The [`store::StateStore`] plays the role of the raft-backed state store:
//! a linearizable log of [`store::LogEntry`] values with monotonically
//! increasing indices, MVCC snapshots for readers, and an event stream for
//! controllers. Everything else in this crate is the record model those
//! entries carry.

pub mod alloc;
pub mod clock;
pub mod deploy;
pub mod eval;
pub mod job;
pub mod node;
pub mod plan;
pub mod store;

pub use alloc::{
    AllocDeploymentStatus, AllocatedPort, Allocation, ClientStatus, DesiredStatus, RescheduleEvent,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use deploy::{Deployment, DeploymentGroupState, DeploymentStatus};
pub use eval::{EvalStatus, Evaluation, PlacementMetrics, TriggeredBy};
pub use job::{
    Affinity, Constraint, ConstraintOperand, DelayFunction, HealthCheckMode, Job, JobId,
    JobStatus, JobType, MigrateStrategy, PortRequest, ReschedulePolicy, Resources, Spread,
    SpreadTarget, Task, TaskGroup, UpdateStrategy, VolumeRequest,
};
pub use node::{HostVolume, Node, NodeStatus, SchedulingEligibility};
pub use plan::{Plan, PlanCommit, PlanResult, PlanStop};
pub use store::{ClientAllocUpdate, Event, LogEntry, StateError, StateSnapshot, StateStore, Topic};
