//! Shared infrastructure: the process-wide event bus.

pub mod event_bus;
