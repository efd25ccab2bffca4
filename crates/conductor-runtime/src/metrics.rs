//! Dispatch metrics, exported through a per-dispatcher Prometheus registry.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use conductor_core::error::{ConductorError, Result};
use prometheus::{Counter, Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};

use crate::event::State;

pub struct DispatchMetrics {
    registry: Registry,
    intents_total: IntCounter,
    accepted_planned: IntCounter,
    planned_running: IntCounter,
    running_done: IntCounter,
    running_failed: IntCounter,
    latency_sum: Counter,
    latency_count: IntCounter,
    latency_avg: Gauge,
    /// Keeps sum, count and avg consistent with each other.
    latency_lock: Mutex<()>,
}

fn metric_err(e: prometheus::Error) -> ConductorError {
    ConductorError::Config(format!("metrics: {e}"))
}

impl DispatchMetrics {
    /// Metrics named `<namespace>_<metric>`; an empty namespace means no prefix.
    pub fn new(namespace: &str) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace);
        let int_counter = |name: &str, help: &str| IntCounter::with_opts(opts(name, help));

        let metrics = Self {
            registry: Registry::new(),
            intents_total: int_counter("intents_total", "Intents accepted for dispatch")
                .map_err(metric_err)?,
            accepted_planned: int_counter(
                "fsm_total_accepted_planned",
                "accepted → planned transitions",
            )
            .map_err(metric_err)?,
            planned_running: int_counter(
                "fsm_total_planned_running",
                "planned → running transitions",
            )
            .map_err(metric_err)?,
            running_done: int_counter("fsm_total_running_done", "running → done transitions")
                .map_err(metric_err)?,
            running_failed: int_counter(
                "fsm_total_running_failed",
                "running → failed transitions",
            )
            .map_err(metric_err)?,
            latency_sum: Counter::with_opts(opts(
                "dispatch_latency_seconds_sum",
                "Total dispatch latency in seconds",
            ))
            .map_err(metric_err)?,
            latency_count: int_counter(
                "dispatch_latency_seconds_count",
                "Dispatches with a recorded latency",
            )
            .map_err(metric_err)?,
            latency_avg: Gauge::with_opts(opts(
                "dispatch_latency_seconds_avg",
                "Mean dispatch latency in seconds",
            ))
            .map_err(metric_err)?,
            latency_lock: Mutex::new(()),
        };

        for collector in [
            &metrics.intents_total,
            &metrics.accepted_planned,
            &metrics.planned_running,
            &metrics.running_done,
            &metrics.running_failed,
            &metrics.latency_count,
        ] {
            metrics
                .registry
                .register(Box::new(collector.clone()))
                .map_err(metric_err)?;
        }
        metrics
            .registry
            .register(Box::new(metrics.latency_sum.clone()))
            .map_err(metric_err)?;
        metrics
            .registry
            .register(Box::new(metrics.latency_avg.clone()))
            .map_err(metric_err)?;

        Ok(metrics)
    }

    pub fn record_intent(&self) {
        self.intents_total.inc();
    }

    /// Count an FSM edge. Pairs that are not edges are ignored.
    pub fn record_transition(&self, from: State, to: State) {
        let counter = match (from, to) {
            (State::Accepted, State::Planned) => &self.accepted_planned,
            (State::Planned, State::Running) => &self.planned_running,
            (State::Running, State::Done) => &self.running_done,
            (State::Running, State::Failed) => &self.running_failed,
            _ => return,
        };
        counter.inc();
    }

    pub fn observe_latency(&self, seconds: f64) {
        let _guard = self.latency_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.latency_sum.inc_by(seconds.max(0.0));
        self.latency_count.inc();
        let count = self.latency_count.get();
        if count > 0 {
            self.latency_avg.set(self.latency_sum.get() / count as f64);
        }
        tracing::debug!("latency observed: {seconds:.4}s");
    }

    pub fn intents_total(&self) -> u64 {
        self.intents_total.get()
    }

    pub fn transitions(&self, from: State, to: State) -> u64 {
        match (from, to) {
            (State::Accepted, State::Planned) => self.accepted_planned.get(),
            (State::Planned, State::Running) => self.planned_running.get(),
            (State::Running, State::Done) => self.running_done.get(),
            (State::Running, State::Failed) => self.running_failed.get(),
            _ => 0,
        }
    }

    pub fn latency_count(&self) -> u64 {
        self.latency_count.get()
    }

    /// Current values keyed by exported metric name.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.registry
            .gather()
            .iter()
            .filter_map(|family| {
                let metric = family.get_metric().first()?;
                let value = if metric.has_counter() {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                };
                Some((family.get_name().to_string(), value))
            })
            .collect()
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| ConductorError::Config(format!("metrics: {e}")))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_names_carry_namespace() {
        let metrics = DispatchMetrics::new("conductor").unwrap();
        let snapshot = metrics.snapshot();
        for name in [
            "conductor_intents_total",
            "conductor_fsm_total_accepted_planned",
            "conductor_fsm_total_planned_running",
            "conductor_fsm_total_running_done",
            "conductor_fsm_total_running_failed",
            "conductor_dispatch_latency_seconds_sum",
            "conductor_dispatch_latency_seconds_count",
            "conductor_dispatch_latency_seconds_avg",
        ] {
            assert_eq!(snapshot.get(name), Some(&0.0), "missing {name}");
        }
    }

    #[test]
    fn test_empty_namespace() {
        let metrics = DispatchMetrics::new("").unwrap();
        assert!(metrics.snapshot().contains_key("intents_total"));
    }

    #[test]
    fn test_latency_average() {
        let metrics = DispatchMetrics::new("t").unwrap();
        metrics.observe_latency(0.2);
        metrics.observe_latency(0.4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["t_dispatch_latency_seconds_count"], 2.0);
        assert!((snapshot["t_dispatch_latency_seconds_sum"] - 0.6).abs() < 1e-9);
        assert!((snapshot["t_dispatch_latency_seconds_avg"] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_transition_counters() {
        let metrics = DispatchMetrics::new("t").unwrap();
        metrics.record_transition(State::Accepted, State::Planned);
        metrics.record_transition(State::Running, State::Failed);
        metrics.record_transition(State::Done, State::Accepted);
        assert_eq!(metrics.transitions(State::Accepted, State::Planned), 1);
        assert_eq!(metrics.transitions(State::Running, State::Failed), 1);
        assert_eq!(metrics.transitions(State::Running, State::Done), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(DispatchMetrics::new("t").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_intent();
                        metrics.observe_latency(0.001);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.intents_total(), 8000);
        assert_eq!(metrics.latency_count(), 8000);
    }

    #[test]
    fn test_render_text() {
        let metrics = DispatchMetrics::new("conductor").unwrap();
        metrics.record_intent();
        let text = metrics.render().unwrap();
        assert!(text.contains("conductor_intents_total 1"));
        assert!(text.contains("# TYPE conductor_dispatch_latency_seconds_avg gauge"));
    }
}
