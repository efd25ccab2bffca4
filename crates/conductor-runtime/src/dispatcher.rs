//! Intent dispatcher — resolves an intent to a capability and drives the
//! accepted → planned → running → done | failed state machine.
//!
//! Every transition is published to the [`EventSink`] and counted in
//! [`DispatchMetrics`]. An intent whose path does not resolve to
//! `scheduler.job.run` stops at `planned`.

use std::sync::Arc;
use std::time::Instant;

use conductor_core::error::{ConductorError, Result};
use conductor_scheduler::{CommandJob, Job, JobScheduler, JobStatusResponse};

use crate::capability::{CapabilityRules, SCHEDULER_JOB_RUN};
use crate::event::{Event, State};
use crate::intent::Intent;
use crate::metrics::DispatchMetrics;
use crate::sink::EventSink;

pub struct Dispatcher {
    scheduler: Arc<dyn JobScheduler>,
    rules: CapabilityRules,
    sink: Arc<dyn EventSink>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    /// Dispatcher with the standard capability rules.
    pub fn new(
        scheduler: Arc<dyn JobScheduler>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            scheduler,
            rules: CapabilityRules::standard(),
            sink,
            metrics,
        }
    }

    pub fn with_rules(mut self, rules: CapabilityRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &CapabilityRules {
        &self.rules
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Dispatch one intent. Safe to call concurrently.
    pub async fn dispatch(&self, intent: &Intent) -> Result<JobStatusResponse> {
        let started = Instant::now();
        self.metrics.record_intent();
        self.publish(Event::accepted(intent));
        self.publish(Event::transition(
            intent,
            State::Accepted,
            State::Planned,
            "intent received",
        ));

        let outcome = match self.rules.resolve(&intent.path) {
            Some(SCHEDULER_JOB_RUN) => self.dispatch_to_scheduler(intent).await,
            Some(capability) => Err(ConductorError::CapabilityUnwired(capability.to_string())),
            None => Err(ConductorError::CapabilityUnresolved(intent.path.clone())),
        };

        self.metrics.observe_latency(started.elapsed().as_secs_f64());
        if let Err(e) = &outcome {
            tracing::warn!("⚠️ Intent {} ({} {}) not dispatched: {e}", intent.id, intent.method, intent.path);
        }
        outcome
    }

    async fn dispatch_to_scheduler(&self, intent: &Intent) -> Result<JobStatusResponse> {
        self.publish(Event::transition(
            intent,
            State::Planned,
            State::Running,
            "dispatching to scheduler",
        ));

        let mut job = CommandJob::new(&intent.path, &intent.job_schedule(), &intent.job_command());
        if let Some(user) = intent.user_id() {
            job = job.with_user(user);
        }
        let job_id = job.id();

        match self.scheduler.schedule_job(job).await {
            Ok(response) => {
                self.publish(
                    Event::transition(
                        intent,
                        State::Running,
                        State::Done,
                        "job completed (scheduled/queued)",
                    )
                    .with_meta("job_id", job_id)
                    .with_meta("status", response.status.code)
                    .with_meta("message", &response.status.message),
                );
                Ok(response)
            }
            Err(e) => {
                self.publish(
                    Event::transition(intent, State::Running, State::Failed, &e.to_string())
                        .with_meta("job_id", job_id)
                        .with_meta("error_kind", e.kind()),
                );
                Err(e)
            }
        }
    }

    fn publish(&self, event: Event) {
        if let (Some(from), Some(to)) = (event.from, event.to) {
            self.metrics.record_transition(from, to);
        }
        if let Err(e) = self.sink.publish(&event) {
            tracing::warn!("⚠️ Event sink rejected '{}' for intent {}: {e}", event.kind, event.intent_id);
        }
    }
}
