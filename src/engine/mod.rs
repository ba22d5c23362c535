//! Encoding engine capability boundary.
//!
//! The control plane treats the codec engine as an opaque capability: it
//! hands over a job description, receives progress and log text through
//! callbacks, and can request pause/resume/stop. All trait methods are
//! non-blocking from the caller's perspective - the encode itself runs on the
//! engine's own thread and termination is acknowledged asynchronously via
//! [`EngineSink::finished`].
//!
//! [`sim::SimEngine`] is the bundled deterministic backend that paces through
//! the job's frame range; a real codec integration plugs in behind
//! [`EncodeEngine`] without touching the router or server.

pub mod sim;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Container format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Container {
    MP4,
    MOV,
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Container::MP4 => write!(f, "MP4"),
            Container::MOV => write!(f, "MOV"),
        }
    }
}

/// Video codec
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum VideoCodec {
    H264,
    H265,
    ProRes,
    AV1,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::H265 => write!(f, "H.265 (HEVC)"),
            VideoCodec::ProRes => write!(f, "ProRes"),
            VideoCodec::AV1 => write!(f, "AV1"),
        }
    }
}

/// Quality mode for encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum QualityMode {
    CRF,     // Constant Rate Factor (quality-based)
    Bitrate, // Target bitrate in kbps
}

/// Job description handed to the engine by `StartEncode`.
///
/// Wire format is JSON; unknown fields from newer hosts are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncodeJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub container: Container,
    pub codec: VideoCodec,
    pub quality_mode: QualityMode,
    pub quality_value: u32,
    pub fps: f32,
    #[serde(default = "default_frame_count")]
    pub frame_count: u64,
    #[serde(default = "default_pass_count")]
    pub pass_count: u32,
}

fn default_frame_count() -> u64 {
    240
}

fn default_pass_count() -> u32 {
    1
}

impl EncodeJob {
    pub fn total_frames(&self) -> u64 {
        self.frame_count.max(1)
    }
}

/// Lifecycle tag carried in progress snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodeState {
    Idle,
    Encoding,
    Paused,
    Completed,
    Stopped,
    Failed,
}

/// Progress snapshot. The engine-callback thread is the sole writer of the
/// counters; readers always copy the whole struct under a lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncodeProgress {
    pub state: EncodeState,
    pub completion: f64,
    pub current_frame: u64,
    pub total_frames: u64,
    pub fps: f64,
    pub eta_seconds: u64,
    pub pass: u32,
    pub pass_count: u32,
    pub error: Option<String>,
}

impl EncodeProgress {
    pub fn idle() -> Self {
        Self {
            state: EncodeState::Idle,
            completion: 0.0,
            current_frame: 0,
            total_frames: 0,
            fps: 0.0,
            eta_seconds: 0,
            pass: 0,
            pass_count: 0,
            error: None,
        }
    }
}

/// How a session ended, delivered through [`EngineSink::finished`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodeOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Callbacks the engine drives for the duration of one session.
///
/// All three fire on the engine thread. `finished` is delivered exactly once,
/// last, for every accepted job - including cancelled and failed ones.
pub struct EngineSink {
    pub on_progress: Box<dyn Fn(EncodeProgress) + Send + Sync>,
    pub on_log: Box<dyn Fn(String) + Send + Sync>,
    pub on_finished: Box<dyn Fn(EncodeOutcome) + Send + Sync>,
}

impl EngineSink {
    pub fn progress(&self, progress: EncodeProgress) {
        (self.on_progress)(progress);
    }

    pub fn log(&self, line: String) {
        (self.on_log)(line);
    }

    pub fn finished(&self, outcome: EncodeOutcome) {
        (self.on_finished)(outcome);
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The engine already has an active session.
    Busy,
    SpawnFailed(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Busy => write!(f, "engine already has an active session"),
            EngineError::SpawnFailed(msg) => write!(f, "failed to spawn engine thread: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// The engine capability. Implementations own their encode thread; every
/// method returns as soon as the request is accepted.
pub trait EncodeEngine: Send + Sync {
    /// Begin encoding `job` asynchronously. Rejects with [`EngineError::Busy`]
    /// if a session is still active.
    fn start(&self, job: EncodeJob, events: EngineSink) -> Result<(), EngineError>;

    /// Suspend frame processing. No-op without an active session.
    fn pause(&self) -> Result<(), EngineError>;

    /// Continue a paused session. No-op without an active session.
    fn resume(&self) -> Result<(), EngineError>;

    /// Cooperative cancellation: the session winds down on its own thread and
    /// acknowledges through `finished(Stopped)`.
    fn stop(&self) -> Result<(), EngineError>;
}
