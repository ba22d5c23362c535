//! Deterministic pacing engine.
//!
//! Walks the job's frame range on a dedicated thread, one tick per frame,
//! with cooperative pause (Condvar gate) and cancellation (atomic flag).
//! Stands in for a native codec backend behind [`EncodeEngine`]; the control
//! plane cannot tell the difference, which is also what makes the lifecycle
//! tests deterministic.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    EncodeEngine, EncodeJob, EncodeOutcome, EncodeProgress, EncodeState, EngineError, EngineSink,
};

struct SessionCtl {
    cancel: Arc<AtomicBool>,
    pause: Arc<(Mutex<bool>, Condvar)>,
}

/// Thread-based engine pacing `tick` per frame.
pub struct SimEngine {
    tick: Duration,
    session: Arc<Mutex<Option<SessionCtl>>>,
}

impl SimEngine {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            session: Arc::new(Mutex::new(None)),
        }
    }
}

impl EncodeEngine for SimEngine {
    fn start(&self, job: EncodeJob, events: EngineSink) -> Result<(), EngineError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let pause = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(EngineError::Busy);
            }
            *slot = Some(SessionCtl {
                cancel: Arc::clone(&cancel),
                pause: Arc::clone(&pause),
            });
        }

        let tick = self.tick;
        let session = Arc::clone(&self.session);
        thread::Builder::new()
            .name("encoderd-engine".to_string())
            .spawn(move || run_session(job, events, cancel, pause, tick, session))
            .map_err(|e| {
                // Roll back the slot so the engine stays usable
                let mut slot = self.session.lock().unwrap_or_else(|p| p.into_inner());
                *slot = None;
                EngineError::SpawnFailed(e.to_string())
            })?;
        Ok(())
    }

    fn pause(&self) -> Result<(), EngineError> {
        let slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctl) = slot.as_ref() {
            let (lock, _cvar) = &*ctl.pause;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
            debug!("Engine paused");
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), EngineError> {
        let slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctl) = slot.as_ref() {
            let (lock, cvar) = &*ctl.pause;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = false;
            cvar.notify_all();
            debug!("Engine resumed");
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        let slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctl) = slot.as_ref() {
            ctl.cancel.store(true, Ordering::Relaxed);
            // Wake the session if it is sitting in the pause gate
            let (lock, cvar) = &*ctl.pause;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = false;
            cvar.notify_all();
            debug!("Engine stop requested");
        }
        Ok(())
    }
}

fn run_session(
    job: EncodeJob,
    events: EngineSink,
    cancel: Arc<AtomicBool>,
    pause: Arc<(Mutex<bool>, Condvar)>,
    tick: Duration,
    session: Arc<Mutex<Option<SessionCtl>>>,
) {
    let total = job.total_frames();
    let started = Instant::now();
    info!(
        "Engine session started: {} -> {} ({} frames, {} {})",
        job.source.display(),
        job.destination.display(),
        total,
        job.codec,
        job.container,
    );
    events.log(format!(
        "encode started: {} -> {} ({} frames @ {:.3} fps, {} in {})",
        job.source.display(),
        job.destination.display(),
        total,
        job.fps,
        job.codec,
        job.container,
    ));

    let mut outcome = EncodeOutcome::Completed;
    for frame in 1..=total {
        // Pause gate; a stop request also releases it
        {
            let (lock, cvar) = &*pause;
            let mut paused = lock.lock().unwrap_or_else(|e| e.into_inner());
            while *paused && !cancel.load(Ordering::Relaxed) {
                let (guard, _) = cvar
                    .wait_timeout(paused, Duration::from_millis(50))
                    .unwrap_or_else(|e| e.into_inner());
                paused = guard;
            }
        }
        if cancel.load(Ordering::Relaxed) {
            outcome = EncodeOutcome::Stopped;
            break;
        }

        thread::sleep(tick);

        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let fps = frame as f64 / elapsed;
        let remaining = total - frame;
        events.progress(EncodeProgress {
            state: EncodeState::Encoding,
            completion: frame as f64 / total as f64,
            current_frame: frame,
            total_frames: total,
            fps,
            eta_seconds: (remaining as f64 / fps.max(1e-6)).ceil() as u64,
            pass: 1,
            pass_count: job.pass_count,
            error: None,
        });
        if frame % 24 == 0 {
            events.log(format!("encoded frame {}/{}", frame, total));
        }
    }

    match &outcome {
        EncodeOutcome::Completed => events.log("encode complete".to_string()),
        EncodeOutcome::Stopped => events.log("encode cancelled".to_string()),
        EncodeOutcome::Failed(msg) => events.log(format!("encode failed: {}", msg)),
    }
    info!("Engine session finished: {:?}", outcome);

    // Free the session slot before acknowledging so a StartEncode racing the
    // callback finds the engine idle again.
    {
        let mut slot = session.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
    events.finished(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::mpsc;

    fn job(frames: u64) -> EncodeJob {
        EncodeJob {
            source: PathBuf::from("in.mov"),
            destination: PathBuf::from("out.mp4"),
            container: super::super::Container::MP4,
            codec: super::super::VideoCodec::H264,
            quality_mode: super::super::QualityMode::CRF,
            quality_value: 23,
            fps: 24.0,
            frame_count: frames,
            pass_count: 1,
        }
    }

    fn sink(
        progress_tx: mpsc::Sender<EncodeProgress>,
        done_tx: mpsc::Sender<EncodeOutcome>,
    ) -> EngineSink {
        EngineSink {
            on_progress: Box::new(move |p| {
                let _ = progress_tx.send(p);
            }),
            on_log: Box::new(|_| {}),
            on_finished: Box::new(move |o| {
                let _ = done_tx.send(o);
            }),
        }
    }

    #[test]
    fn test_session_runs_to_completion() {
        let engine = SimEngine::new(Duration::from_millis(1));
        let (ptx, prx) = mpsc::channel();
        let (dtx, drx) = mpsc::channel();

        engine.start(job(10), sink(ptx, dtx)).unwrap();
        let outcome = drx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, EncodeOutcome::Completed);

        // Progress is monotonically non-decreasing and ends at 1.0
        let mut last = 0.0;
        let mut final_completion = 0.0;
        while let Ok(p) = prx.try_recv() {
            assert!(p.completion >= last);
            last = p.completion;
            final_completion = p.completion;
        }
        assert!((final_completion - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_second_start_rejected_while_busy() {
        let engine = SimEngine::new(Duration::from_millis(5));
        let (ptx, _prx) = mpsc::channel();
        let (dtx, drx) = mpsc::channel();

        engine.start(job(200), sink(ptx, dtx)).unwrap();
        let (ptx2, _prx2) = mpsc::channel();
        let (dtx2, _drx2) = mpsc::channel();
        assert!(matches!(
            engine.start(job(10), sink(ptx2, dtx2)),
            Err(EngineError::Busy)
        ));

        engine.stop().unwrap();
        assert_eq!(
            drx.recv_timeout(Duration::from_secs(5)).unwrap(),
            EncodeOutcome::Stopped
        );
    }

    #[test]
    fn test_stop_releases_pause_gate() {
        let engine = SimEngine::new(Duration::from_millis(1));
        let (ptx, prx) = mpsc::channel();
        let (dtx, drx) = mpsc::channel();

        engine.start(job(10_000), sink(ptx, dtx)).unwrap();
        // Wait for the session to actually tick
        prx.recv_timeout(Duration::from_secs(5)).unwrap();

        engine.pause().unwrap();
        engine.stop().unwrap();
        assert_eq!(
            drx.recv_timeout(Duration::from_secs(5)).unwrap(),
            EncodeOutcome::Stopped
        );
    }

    #[test]
    fn test_engine_reusable_after_completion() {
        let engine = SimEngine::new(Duration::from_millis(1));
        for _ in 0..2 {
            let (ptx, _prx) = mpsc::channel();
            let (dtx, drx) = mpsc::channel();
            engine.start(job(5), sink(ptx, dtx)).unwrap();
            assert_eq!(
                drx.recv_timeout(Duration::from_secs(5)).unwrap(),
                EncodeOutcome::Completed
            );
        }
    }
}
