//! Ordered, acknowledgment-truncated log of searcher events.

use hp_types::{QueueError, SearcherEvent, SearcherEventKind};
use serde::{Deserialize, Serialize};

/// Events not yet acknowledged by the custom-search client, plus the counter
/// used to id them.
///
/// Ids start at 1, grow by one per [`enqueue`](Self::enqueue) and are never
/// reused; truncation keeps the surviving events' ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearcherEventQueue {
    events: Vec<SearcherEvent>,
    event_count: i32,
}

impl SearcherEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return the id assigned to it.
    pub fn enqueue(&mut self, event: SearcherEventKind) -> i32 {
        self.event_count += 1;
        let id = self.event_count;
        self.events.push(SearcherEvent { id, event });
        id
    }

    /// All unacknowledged events in id order.
    pub fn events(&self) -> &[SearcherEvent] {
        &self.events
    }

    /// Number of events ever enqueued.
    pub fn event_count(&self) -> i32 {
        self.event_count
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every event up to and including `event_id`.
    ///
    /// Fails without touching the queue if no remaining event has that id,
    /// including ids that were removed earlier.
    pub fn remove_up_to(&mut self, event_id: i32) -> Result<(), QueueError> {
        let position = self
            .events
            .iter()
            .position(|event| event.id == event_id)
            .ok_or(QueueError::EventNotFound(event_id))?;
        self.events.drain(..=position);
        Ok(())
    }
}
