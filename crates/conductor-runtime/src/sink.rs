//! Event sinks — where the dispatch trail goes.
//! Publishing is best effort: the dispatcher logs a sink error and moves on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conductor_core::error::Result;

use crate::event::Event;

/// Receives every event the dispatcher emits. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<()>;
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &Event) -> Result<()> {
        match (event.from, event.to) {
            (Some(from), Some(to)) => tracing::info!(
                intent_id = %event.intent_id,
                path = %event.path,
                "🔀 [{}] {} ({from} → {to})",
                event.kind,
                event.message
            ),
            _ => tracing::info!(
                intent_id = %event.intent_id,
                path = %event.path,
                "📨 [{}] {} {}",
                event.kind,
                event.method,
                event.path
            ),
        }
        Ok(())
    }
}

/// In-memory ring buffer of the most recent events.
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.guard().iter().cloned().collect()
    }

    /// Events belonging to one intent, oldest first.
    pub fn for_intent(&self, intent_id: uuid::Uuid) -> Vec<Event> {
        self.guard()
            .iter()
            .filter(|e| e.intent_id == intent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventSink for RecentEvents {
    fn publish(&self, event: &Event) -> Result<()> {
        let mut events = self.guard();
        events.push_back(event.clone());
        while events.len() > self.capacity {
            events.pop_front();
        }
        Ok(())
    }
}

/// Publishes to every inner sink. One failing sink does not stop the rest;
/// the first error is returned.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &Event) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
