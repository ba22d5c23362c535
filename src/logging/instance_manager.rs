//! Registry of named log streams.

use log::debug;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::event_bus::EventBus;
use crate::logging::SessionLog;

/// Substring marking the main/application log key; such keys are skipped in
/// `log_files()` because the master entry already covers them.
pub const MAIN_LOG_MARKER: &str = "main";

/// Raised on the bus after every successful register and every deregister.
/// Carries no data: subscribers re-enumerate via `log_files()`.
#[derive(Clone, Debug)]
pub struct RegistryChangedEvent;

#[derive(Debug)]
pub enum RegistryError {
    /// A stream is already registered under this key. Silent overwrite would
    /// orphan the live session's buffer, so collisions are caller errors.
    DuplicateKey(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateKey(key) => {
                write!(f, "log stream already registered: {}", key)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
struct Registry {
    instances: HashMap<String, Arc<SessionLog>>,
    master: Option<Arc<SessionLog>>,
    // First key ever registered; the application startup sets the initial log.
    app_log_key: Option<String>,
}

/// Process-wide registry mapping key -> log stream.
///
/// All operations serialize on one exclusive lock so a router thread
/// enumerating active logs never observes a half-applied registration. Change
/// notifications are dispatched after the lock is released, so subscribers
/// may re-enter the manager without deadlocking.
pub struct LogInstanceManager {
    inner: Mutex<Registry>,
    bus: EventBus,
}

impl LogInstanceManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            bus,
        }
    }

    /// Insert `key -> log`. The first-ever registration is remembered as the
    /// application/scan log; `is_master` replaces the master reference.
    pub fn register(
        &self,
        key: &str,
        log: Arc<SessionLog>,
        is_master: bool,
    ) -> Result<(), RegistryError> {
        {
            let mut reg = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if reg.instances.contains_key(key) {
                return Err(RegistryError::DuplicateKey(key.to_string()));
            }
            if reg.app_log_key.is_none() {
                reg.app_log_key = Some(key.to_string());
            }
            reg.instances.insert(key.to_string(), Arc::clone(&log));
            if is_master {
                reg.master = Some(log);
            }
        }
        debug!("Log stream registered: {}", key);
        self.bus.emit(RegistryChangedEvent);
        Ok(())
    }

    /// Remove the entry if present; absent keys are a no-op.
    pub fn deregister(&self, key: &str) {
        {
            let mut reg = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            reg.instances.remove(key);
        }
        debug!("Log stream deregistered: {}", key);
        self.bus.emit(RegistryChangedEvent);
    }

    /// Keys for display: the master log's file name first (if a master is
    /// set), then all non-main session keys in ascending order.
    pub fn log_files(&self) -> Vec<String> {
        let reg = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut session_keys: Vec<String> = reg
            .instances
            .keys()
            .filter(|k| !k.contains(MAIN_LOG_MARKER))
            .cloned()
            .collect();
        session_keys.sort();

        let mut files = Vec::with_capacity(session_keys.len() + 1);
        if let Some(master) = &reg.master {
            let name = master.file_name();
            let file_name = Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string());
            files.push(file_name);
        }
        files.extend(session_keys);
        files
    }

    /// Look up a stream by key; empty or unknown keys yield None.
    pub fn get(&self, key: &str) -> Option<Arc<SessionLog>> {
        if key.is_empty() {
            return None;
        }
        let reg = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        reg.instances.get(key).cloned()
    }

    /// The master (application/scan-level) stream, if one was registered.
    pub fn master(&self) -> Option<Arc<SessionLog>> {
        let reg = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        reg.master.clone()
    }
}
