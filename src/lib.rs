//! encoderd - out-of-process encode worker.
//!
//! Isolates a crash-prone media-encoding engine in a separate process and
//! exposes its control surface to a host application over a token-guarded
//! loopback HTTP API: encode lifecycle (start/pause/resume/stop/poll) plus a
//! multi-instance log registry for concurrent scan/encode sessions.
//!
//! Re-exports all modules for use by the binary target.

// Shared infrastructure (event bus)
pub mod core;

// Worker modules
pub mod auth;
pub mod cli;
pub mod engine;
pub mod logging;
pub mod router;
pub mod server;

// Re-export commonly used types
pub use auth::TokenService;
pub use core::event_bus::EventBus;
pub use engine::{EncodeEngine, EncodeJob, EncodeProgress, EncodeState};
pub use logging::{LogInstanceManager, SessionLog};
pub use router::{ApiRouter, TerminationEvent};
pub use server::HttpServer;
