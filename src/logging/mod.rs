//! Multi-instance log management.
//!
//! Every scan/encode session owns a [`SessionLog`], an append-only in-memory
//! buffer identified by a filename-like key. The [`LogInstanceManager`] is
//! the process-wide registry multiplexing those buffers: router threads read
//! them concurrently while sessions register and deregister.
//!
//! The buffer content is what `GetAllLogMessages` / `GetLogMessagesFromIndex`
//! serve over the API; it is not persisted across restarts.

mod instance_manager;
mod session_log;

pub use instance_manager::{LogInstanceManager, RegistryChangedEvent, RegistryError, MAIN_LOG_MARKER};
pub use session_log::{LogMessage, SessionLog};
