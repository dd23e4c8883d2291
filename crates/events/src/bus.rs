//! Event publishing/subscription abstraction.
//!
//! The bus is the seam between code that mutates forms/responses and the
//! code that reacts to it (the plugin dispatcher, usage metering, telemetry).
//!
//! ## Delivery model
//!
//! - `publish` is fire-and-forget: it enqueues and returns.
//! - Listeners are grouped. Within a group, listeners run sequentially in
//!   registration order; different groups run independently of each other.
//! - A listener that errors or panics is logged and skipped; the rest of its
//!   group and every other group still see the event.
//! - Ordering is only guaranteed within a single group, never across groups.
//! - There is no persistence. Events queued but not yet handled when the
//!   process crashes are lost. Graceful shutdown drains the queues.

use std::sync::Arc;

use async_trait::async_trait;

use formplug_core::EventType;

use crate::Event;

/// Reacts to events delivered by a bus.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<L> EventListener for Arc<L>
where
    L: EventListener + ?Sized,
{
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        (**self).on_event(event).await
    }
}

/// Bus operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus was shut down and accepts no more events or listeners.
    #[error("event bus is closed")]
    Closed,
    /// Internal lock poisoning.
    #[error("event bus state poisoned")]
    Poisoned,
}

/// Publish/subscribe contract.
///
/// Implementations must be shareable across tasks; publishers and subscribers
/// receive the bus by injection rather than through a global.
pub trait EventBus: Send + Sync {
    /// Enqueue an event for every group with a listener for its type.
    fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Register `listener` for `event_type` within `group`.
    fn subscribe(
        &self,
        group: &str,
        event_type: EventType,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), BusError>;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, event: Event) -> Result<(), BusError> {
        (**self).publish(event)
    }

    fn subscribe(
        &self,
        group: &str,
        event_type: EventType,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), BusError> {
        (**self).subscribe(group, event_type, listener)
    }
}
