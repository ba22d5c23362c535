//! Encode lifecycle controller.
//!
//! Translates named API commands into calls against the engine capability
//! and serializes every lifecycle transition behind one mutex:
//!
//! ```text
//! Idle -> Encoding <-> Paused -> (stop requested)
//!   ^                                  |
//!   +---- engine `finished` callback --+
//! ```
//!
//! `start_encode` commits `Idle -> Encoding` under the lock *before*
//! dispatching the engine, so a second Start racing the first always loses
//! with `AlreadyEncoding`. Stop is a cooperative request: the state stays
//! Encoding/Paused until the engine acknowledges through its `finished`
//! callback, at which point the controller returns to Idle and stamps the
//! outcome into the shared progress snapshot.

use log::{info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::core::event_bus::EventBus;
use crate::engine::{
    EncodeEngine, EncodeJob, EncodeOutcome, EncodeProgress, EncodeState, EngineSink,
};
use crate::logging::{LogInstanceManager, LogMessage, SessionLog};

/// Version string served by the `Version` command.
pub const WORKER_VERSION: &str =
    const_format::concatcp!("encoderd ", env!("CARGO_PKG_VERSION"));

/// Raised on the bus when the `Shutdown` command arrives; the entry point
/// observes it to begin graceful teardown.
#[derive(Clone, Debug)]
pub struct TerminationEvent;

/// Status strings returned by lifecycle commands. Transition violations are
/// data, not errors: the HTTP layer serves them as plain 200 responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiStatus {
    Ok,
    AlreadyEncoding,
    InvalidState,
    BadPayload(String),
    Failed(String),
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiStatus::Ok => write!(f, "OK"),
            ApiStatus::AlreadyEncoding => write!(f, "AlreadyEncoding"),
            ApiStatus::InvalidState => write!(f, "InvalidState"),
            ApiStatus::BadPayload(msg) => write!(f, "BadPayload: {}", msg),
            ApiStatus::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

/// Body of `GetLogMessagesFromIndex`.
#[derive(Debug, Deserialize)]
pub struct LogIndexRequest {
    pub key: String,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Encoding,
    Paused,
}

struct Lifecycle {
    phase: Phase,
    session_key: Option<String>,
}

/// API router: one per worker process, shared across request threads.
pub struct ApiRouter {
    state: Mutex<Lifecycle>,
    progress: RwLock<EncodeProgress>,
    logs: Arc<LogInstanceManager>,
    engine: Box<dyn EncodeEngine>,
    bus: EventBus,
    next_activity_id: AtomicU64,
    // Handle to ourselves for the engine-callback closures; Weak so a
    // session outliving the router cannot keep it alive.
    weak_self: Weak<ApiRouter>,
}

impl ApiRouter {
    pub fn new(
        logs: Arc<LogInstanceManager>,
        engine: Box<dyn EncodeEngine>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                session_key: None,
            }),
            progress: RwLock::new(EncodeProgress::idle()),
            logs,
            engine,
            bus,
            next_activity_id: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn version_info(&self) -> &'static str {
        WORKER_VERSION
    }

    /// Deserialize the job, register its session log, commit
    /// `Idle -> Encoding` and hand the job to the engine.
    pub fn start_encode(&self, payload: &str) -> ApiStatus {
        let job: EncodeJob = match serde_json::from_str(payload) {
            Ok(job) => job,
            Err(e) => return ApiStatus::BadPayload(e.to_string()),
        };

        // Register outside the lifecycle lock: registry-changed subscribers
        // may re-enter the router, and a subscriber blocking on the state
        // lock we hold would deadlock. A losing racer deregisters its key.
        let activity_id = self.next_activity_id.fetch_add(1, Ordering::Relaxed) + 1;
        let key = format!("activity_log.{}.txt", activity_id);
        let session_log = Arc::new(SessionLog::new(&key));
        session_log.set_activity_id(activity_id);
        if let Err(e) = self.logs.register(&key, Arc::clone(&session_log), false) {
            return ApiStatus::Failed(e.to_string());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase != Phase::Idle {
            drop(state);
            self.logs.deregister(&key);
            return ApiStatus::AlreadyEncoding;
        }

        // Commit point: the transition lands before the engine is dispatched,
        // still under the lifecycle lock.
        state.phase = Phase::Encoding;
        state.session_key = Some(key.clone());
        {
            let mut progress = self.progress.write().unwrap_or_else(|e| e.into_inner());
            *progress = EncodeProgress::idle();
            progress.state = EncodeState::Encoding;
            progress.total_frames = job.total_frames();
        }

        let sink = self.engine_sink(Arc::clone(&session_log));
        if let Err(e) = self.engine.start(job, sink) {
            warn!("Engine rejected job: {}", e);
            state.phase = Phase::Idle;
            state.session_key = None;
            self.progress.write().unwrap_or_else(|p| p.into_inner()).state = EncodeState::Failed;
            drop(state);
            self.logs.deregister(&key);
            return ApiStatus::Failed(e.to_string());
        }
        drop(state);

        info!("Encode session {} started (log {})", activity_id, key);
        ApiStatus::Ok
    }

    /// Valid only while `Encoding`.
    pub fn pause_encode(&self) -> ApiStatus {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase != Phase::Encoding {
            return ApiStatus::InvalidState;
        }
        if let Err(e) = self.engine.pause() {
            return ApiStatus::Failed(e.to_string());
        }
        state.phase = Phase::Paused;
        self.progress.write().unwrap_or_else(|p| p.into_inner()).state = EncodeState::Paused;
        ApiStatus::Ok
    }

    /// Valid only while `Paused`.
    pub fn resume_encode(&self) -> ApiStatus {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase != Phase::Paused {
            return ApiStatus::InvalidState;
        }
        if let Err(e) = self.engine.resume() {
            return ApiStatus::Failed(e.to_string());
        }
        state.phase = Phase::Encoding;
        self.progress.write().unwrap_or_else(|p| p.into_inner()).state = EncodeState::Encoding;
        ApiStatus::Ok
    }

    /// Valid from `Encoding` or `Paused`. Cooperative: the phase stays put
    /// until the engine acknowledges through its `finished` callback.
    pub fn stop_encode(&self) -> ApiStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase == Phase::Idle {
            return ApiStatus::InvalidState;
        }
        if let Err(e) = self.engine.stop() {
            return ApiStatus::Failed(e.to_string());
        }
        info!(
            "Stop requested for session {}",
            state.session_key.as_deref().unwrap_or("<unknown>")
        );
        ApiStatus::Ok
    }

    /// Latest cached snapshot; never blocks on the engine.
    pub fn poll_progress(&self) -> EncodeProgress {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Full buffer for `key`; unknown keys yield an empty list.
    pub fn get_all_log_messages(&self, key: &str) -> Vec<LogMessage> {
        self.logs.get(key).map(|l| l.messages()).unwrap_or_default()
    }

    /// Buffer tail from `index` onward; unknown keys yield an empty list.
    pub fn get_log_messages_from_index(&self, request: &LogIndexRequest) -> Vec<LogMessage> {
        self.logs
            .get(&request.key)
            .map(|l| l.messages_from_index(request.index))
            .unwrap_or_default()
    }

    /// Clear the named stream and bump its reset generation. No-op on
    /// unknown keys.
    pub fn reset_logging(&self, key: &str) -> ApiStatus {
        if let Some(log) = self.logs.get(key) {
            log.reset();
        }
        ApiStatus::Ok
    }

    /// Cancel any active session, then raise the process-wide termination
    /// event. The engine gets its cooperative stop before the entry point
    /// begins tearing the process down, instead of being killed mid-frame
    /// by process exit.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        if self.stop_encode() == ApiStatus::Ok {
            info!("Active encode cancelled for shutdown");
        }
        self.bus.emit(TerminationEvent);
    }

    fn engine_sink(&self, session_log: Arc<SessionLog>) -> EngineSink {
        let progress_router: Weak<ApiRouter> = self.weak_self.clone();
        let finish_router: Weak<ApiRouter> = self.weak_self.clone();
        let log = Arc::clone(&session_log);
        let finish_log = session_log;
        EngineSink {
            on_progress: Box::new(move |p| {
                if let Some(router) = progress_router.upgrade() {
                    router.apply_progress(p);
                }
            }),
            on_log: Box::new(move |line| log.log_message(&line)),
            on_finished: Box::new(move |outcome| {
                if let Some(router) = finish_router.upgrade() {
                    router.finish_session(outcome, &finish_log);
                }
            }),
        }
    }

    /// Engine-callback thread: replace the counters, keep the lifecycle tag
    /// the router transitions own.
    fn apply_progress(&self, update: EncodeProgress) {
        let mut progress = self.progress.write().unwrap_or_else(|e| e.into_inner());
        let state = progress.state;
        *progress = update;
        progress.state = state;
    }

    /// Engine acknowledgment: finalize the `-> Idle` transition and stamp the
    /// outcome in the same critical section. A `StartEncode` racing the
    /// acknowledgment cannot observe `Idle` before the stamp has landed, so
    /// its fresh snapshot is never overwritten with the previous session's
    /// terminal state. The session log stays registered and readable by key.
    fn finish_session(&self, outcome: EncodeOutcome, session_log: &Arc<SessionLog>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut progress = self.progress.write().unwrap_or_else(|e| e.into_inner());
        state.phase = Phase::Idle;
        state.session_key = None;
        match outcome {
            EncodeOutcome::Completed => progress.state = EncodeState::Completed,
            EncodeOutcome::Stopped => progress.state = EncodeState::Stopped,
            EncodeOutcome::Failed(msg) => {
                progress.state = EncodeState::Failed;
                progress.error = Some(msg);
            }
        }
        drop(progress);
        drop(state);
        info!(
            "Encode session finished ({}), lifecycle back to Idle",
            session_log.file_name()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::engine::EngineError;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_router() -> (Arc<ApiRouter>, Arc<LogInstanceManager>, EventBus) {
        let bus = EventBus::new();
        let logs = Arc::new(LogInstanceManager::new(bus.clone()));
        let engine = Box::new(SimEngine::new(Duration::from_millis(1)));
        let router = ApiRouter::new(Arc::clone(&logs), engine, bus.clone());
        (router, logs, bus)
    }

    fn job_json(frames: u64) -> String {
        format!(
            r#"{{"source":"in.mov","destination":"out.mp4","container":"MP4",
                "codec":"H264","quality_mode":"CRF","quality_value":23,
                "fps":24.0,"frame_count":{}}}"#,
            frames
        )
    }

    fn wait_for_state(router: &ApiRouter, state: EncodeState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while router.poll_progress().state != state {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, current {:?}",
                state,
                router.poll_progress().state
            );
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_transitions_invalid_while_idle() {
        let (router, _, _) = test_router();
        assert_eq!(router.pause_encode(), ApiStatus::InvalidState);
        assert_eq!(router.resume_encode(), ApiStatus::InvalidState);
        assert_eq!(router.stop_encode(), ApiStatus::InvalidState);
        assert_eq!(router.poll_progress().state, EncodeState::Idle);
    }

    #[test]
    fn test_bad_payload_leaves_state_untouched() {
        let (router, logs, _) = test_router();
        assert!(matches!(
            router.start_encode("{not json"),
            ApiStatus::BadPayload(_)
        ));
        assert_eq!(router.poll_progress().state, EncodeState::Idle);
        assert!(logs.log_files().is_empty());
    }

    #[test]
    fn test_double_start_creates_one_session() {
        let (router, logs, _) = test_router();
        assert_eq!(router.start_encode(&job_json(500)), ApiStatus::Ok);
        assert_eq!(router.start_encode(&job_json(500)), ApiStatus::AlreadyEncoding);
        // Exactly one session log was registered
        assert_eq!(logs.log_files(), vec!["activity_log.1.txt".to_string()]);

        router.stop_encode();
        wait_for_state(&router, EncodeState::Stopped, Duration::from_secs(5));
    }

    #[test]
    fn test_full_lifecycle_and_restart() {
        let (router, logs, _) = test_router();
        assert_eq!(router.start_encode(&job_json(20)), ApiStatus::Ok);
        wait_for_state(&router, EncodeState::Completed, Duration::from_secs(5));

        let progress = router.poll_progress();
        assert!((progress.completion - 1.0).abs() < f64::EPSILON);
        assert_eq!(progress.current_frame, 20);

        // Session log survived termination and accumulated lines
        let log = logs.get("activity_log.1.txt").unwrap();
        assert!(log.message_count() >= 2);
        assert_eq!(log.activity_id(), 1);

        // Lifecycle returned to Idle: a new session is accepted
        assert_eq!(router.start_encode(&job_json(10)), ApiStatus::Ok);
        wait_for_state(&router, EncodeState::Completed, Duration::from_secs(5));
        assert!(logs.get("activity_log.2.txt").is_some());
    }

    #[test]
    fn test_pause_resume_stop() {
        let (router, _, _) = test_router();
        assert_eq!(router.start_encode(&job_json(100_000)), ApiStatus::Ok);

        assert_eq!(router.pause_encode(), ApiStatus::Ok);
        assert_eq!(router.poll_progress().state, EncodeState::Paused);
        // Pause is not idempotent: a second pause is a transition violation
        assert_eq!(router.pause_encode(), ApiStatus::InvalidState);

        assert_eq!(router.resume_encode(), ApiStatus::Ok);
        assert_eq!(router.poll_progress().state, EncodeState::Encoding);

        assert_eq!(router.stop_encode(), ApiStatus::Ok);
        wait_for_state(&router, EncodeState::Stopped, Duration::from_secs(5));
        assert_eq!(router.stop_encode(), ApiStatus::InvalidState);
    }

    #[test]
    fn test_concurrent_polls_never_block_and_stay_monotonic() {
        let (router, _, _) = test_router();
        assert_eq!(router.start_encode(&job_json(2_000)), ApiStatus::Ok);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let r = Arc::clone(&router);
            handles.push(thread::spawn(move || {
                let mut last = 0.0;
                for _ in 0..50 {
                    let p = r.poll_progress();
                    assert!(p.completion >= last);
                    last = p.completion;
                }
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        for h in handles {
            h.join().unwrap();
            assert!(Instant::now() < deadline, "poll threads did not finish in time");
        }

        router.stop_encode();
        wait_for_state(&router, EncodeState::Stopped, Duration::from_secs(5));
    }

    #[test]
    fn test_log_reads_by_key() {
        let (router, _, _) = test_router();
        assert_eq!(router.start_encode(&job_json(30)), ApiStatus::Ok);
        wait_for_state(&router, EncodeState::Completed, Duration::from_secs(5));

        let all = router.get_all_log_messages("activity_log.1.txt");
        assert!(!all.is_empty());

        let tail = router.get_log_messages_from_index(&LogIndexRequest {
            key: "activity_log.1.txt".to_string(),
            index: all.len() as u64 - 1,
        });
        assert_eq!(tail.len(), 1);

        // Unknown keys fail soft
        assert!(router.get_all_log_messages("nope.txt").is_empty());
        assert_eq!(router.reset_logging("nope.txt"), ApiStatus::Ok);

        assert_eq!(router.reset_logging("activity_log.1.txt"), ApiStatus::Ok);
        assert!(router.get_all_log_messages("activity_log.1.txt").is_empty());
    }

    #[test]
    fn test_shutdown_emits_termination_event() {
        let (router, _, bus) = test_router();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = Arc::clone(&fired);
        bus.subscribe::<TerminationEvent, _>(move |_| {
            f.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        router.shutdown();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_cancels_active_session() {
        let (router, _, _) = test_router();
        assert_eq!(router.start_encode(&job_json(100_000)), ApiStatus::Ok);

        router.shutdown();
        wait_for_state(&router, EncodeState::Stopped, Duration::from_secs(5));
    }

    #[test]
    fn test_registry_subscriber_may_reenter_lifecycle() {
        let bus = EventBus::new();
        let logs = Arc::new(LogInstanceManager::new(bus.clone()));
        let engine = Box::new(SimEngine::new(Duration::from_millis(1)));
        let router = ApiRouter::new(Arc::clone(&logs), engine, bus.clone());

        // A registry-changed subscriber issuing lifecycle calls must not
        // deadlock on the state lock of the operation that registered.
        let weak = Arc::downgrade(&router);
        bus.subscribe::<crate::logging::RegistryChangedEvent, _>(move |_| {
            if let Some(r) = weak.upgrade() {
                let _ = r.poll_progress();
                assert_eq!(r.resume_encode(), ApiStatus::InvalidState);
            }
        });

        assert_eq!(router.start_encode(&job_json(10)), ApiStatus::Ok);
        wait_for_state(&router, EncodeState::Completed, Duration::from_secs(5));
    }

    /// Engine double that hands its sinks back to the test so session
    /// termination can be driven by hand.
    #[derive(Default)]
    struct CapturedSinks(Mutex<Vec<EngineSink>>);

    struct ManualEngine {
        sinks: Arc<CapturedSinks>,
    }

    impl EncodeEngine for ManualEngine {
        fn start(&self, _job: EncodeJob, events: EngineSink) -> Result<(), EngineError> {
            self.sinks.0.lock().unwrap().push(events);
            Ok(())
        }
        fn pause(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn resume(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn test_finished_ack_cannot_mark_successor_terminal() {
        // A StartEncode racing the previous session's finished acknowledgment
        // must never end up with its snapshot showing the old session's
        // terminal state.
        for _ in 0..200 {
            let bus = EventBus::new();
            let logs = Arc::new(LogInstanceManager::new(bus.clone()));
            let sinks = Arc::new(CapturedSinks::default());
            let engine = Box::new(ManualEngine {
                sinks: Arc::clone(&sinks),
            });
            let router = ApiRouter::new(logs, engine, bus);

            assert_eq!(router.start_encode(&job_json(100)), ApiStatus::Ok);
            let first = sinks.0.lock().unwrap().remove(0);

            let r = Arc::clone(&router);
            let racer = thread::spawn(move || loop {
                match r.start_encode(&job_json(100)) {
                    ApiStatus::Ok => break,
                    ApiStatus::AlreadyEncoding => thread::yield_now(),
                    other => panic!("unexpected status: {:?}", other),
                }
            });
            first.finished(EncodeOutcome::Completed);
            racer.join().unwrap();

            assert_eq!(router.poll_progress().state, EncodeState::Encoding);
        }
    }
}
