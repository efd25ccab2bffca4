//! # Conductor Runtime
//!
//! Turns inbound requests into scheduled jobs.
//!
//! ```text
//! Intent ─► Dispatcher ─► CapabilityRules
//!              │              └── scheduler.job.run ─► JobScheduler::schedule_job
//!              ├── EventSink (tracing, ring buffer, fan-out)
//!              └── DispatchMetrics (prometheus)
//! ```
//!
//! FSM: accepted → planned → running → done | failed.

pub mod capability;
pub mod dispatcher;
pub mod event;
pub mod intent;
pub mod metrics;
pub mod sink;

pub use capability::{CapabilityRule, CapabilityRules, SCHEDULER_JOB_RUN, WEBHOOK_RECEIVE};
pub use dispatcher::Dispatcher;
pub use event::{Event, State};
pub use intent::Intent;
pub use metrics::DispatchMetrics;
pub use sink::{EventSink, FanoutSink, RecentEvents, TracingSink};
