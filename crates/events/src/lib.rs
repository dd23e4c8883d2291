//! Event types and the publish/subscribe bus connecting producers to the
//! plugin dispatcher and other observers.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, EventListener};
pub use event::Event;
pub use formplug_core::EventType;
pub use in_memory_bus::InMemoryEventBus;
