//! Session lifecycle: validation, source acquisition and the worker thread.
//!
//! All session state lives on the worker thread. The caller only gets a
//! [`SessionHandle`], which can read published snapshots and raise the stop
//! flag; it never touches detectors directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::detector::RepSummary;
use crate::landmark::{open_with_retry, LandmarkSource, SourceProvider};
use crate::log::LogSink;
use crate::rules::RuleRegistry;
use crate::session::Session;
use crate::snapshot::{snapshot_channel, SnapshotPublisher, SnapshotReceiver};
use crate::{RepCounterError, Result};

/// Why a session's frame loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    Stopped,
    SourceClosed,
    /// The source kept failing to deliver frames.
    SourceFailed(String),
}

/// Final account of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub exercise_id: String,
    pub rep_count: u32,
    pub frames_processed: u64,
    pub frames_without_detection: u64,
    pub dropped_log_writes: u64,
    pub reps: Vec<RepSummary>,
    pub end_reason: EndReason,
}

/// Starts sessions against a rule registry with a fixed configuration.
#[derive(Debug, Clone)]
pub struct SessionOrchestrator<'r> {
    registry: &'r RuleRegistry,
    config: AppConfig,
}

impl<'r> SessionOrchestrator<'r> {
    /// Creates an orchestrator that looks exercises up in `registry`.
    pub fn new(registry: &'r RuleRegistry, config: AppConfig) -> Self {
        Self { registry, config }
    }

    /// Configuration applied to every session started here.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Validates `exercise_id`, opens a landmark source (trying alternates)
    /// and launches the frame loop on its own thread.
    ///
    /// The exercise is checked before any source is opened, so an unknown id
    /// fails without touching the camera or building detectors.
    pub fn start<P: SourceProvider>(
        &self,
        exercise_id: &str,
        provider: &P,
        sink: Box<dyn LogSink>,
    ) -> Result<SessionHandle> {
        self.start_with_sink(exercise_id, provider, move || Ok(sink))
    }

    /// Like [`SessionOrchestrator::start`], but builds the log sink only once
    /// a landmark source is open. A start that fails leaves no log behind.
    pub fn start_with_sink<P, F>(
        &self,
        exercise_id: &str,
        provider: &P,
        make_sink: F,
    ) -> Result<SessionHandle>
    where
        P: SourceProvider,
        F: FnOnce() -> Result<Box<dyn LogSink>>,
    {
        let rule = self.registry.get_rule(exercise_id)?.clone();
        let source = open_with_retry(provider, self.config.source.max_attempts)?;
        let sink = make_sink()?;
        let session = Session::from_rule(rule, self.config.session.clone());

        let (publisher, receiver) = snapshot_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = FrameLoop {
            session,
            source,
            sink,
            publisher,
            stop: stop.clone(),
            max_consecutive_failures: self.config.source.max_consecutive_read_failures.max(1),
        };

        let handle = thread::Builder::new()
            .name(format!("session-{exercise_id}"))
            .spawn(move || worker.run())?;

        Ok(SessionHandle {
            exercise_id: exercise_id.to_string(),
            stop,
            receiver,
            worker: Some(handle),
        })
    }
}

struct FrameLoop<S> {
    session: Session,
    source: S,
    sink: Box<dyn LogSink>,
    publisher: SnapshotPublisher,
    stop: Arc<AtomicBool>,
    max_consecutive_failures: u32,
}

impl<S: LandmarkSource> FrameLoop<S> {
    fn run(mut self) -> SessionSummary {
        let exercise_id = self.session.rule().exercise_id.clone();
        let span = tracing::info_span!("session", exercise = %exercise_id);
        let _entered = span.enter();

        let mut consecutive_failures = 0u32;
        let mut dropped_log_writes = 0u64;

        let end_reason = loop {
            if self.stop.load(Ordering::Acquire) {
                break EndReason::Stopped;
            }

            let outcome = match self.source.next_frame() {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    outcome
                }
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %err, consecutive_failures, "failed to read landmark frame");
                    if consecutive_failures >= self.max_consecutive_failures {
                        break EndReason::SourceFailed(err.to_string());
                    }
                    continue;
                }
            };

            let Some(snapshot) = self.session.process_frame(&outcome) else {
                break EndReason::SourceClosed;
            };

            if let Err(err) = self.sink.append(&snapshot) {
                dropped_log_writes += 1;
                tracing::warn!(
                    error = %err,
                    timestamp_ms = snapshot.frame_timestamp_ms,
                    "dropping session log record"
                );
            }
            if let Err(err) = self.publisher.publish(snapshot) {
                tracing::warn!(error = %err, "failed to publish snapshot");
            }
        };

        self.session.stop();
        tracing::info!(?end_reason, reps = self.session.rep_count(), "frame loop finished");

        SessionSummary {
            exercise_id,
            rep_count: self.session.rep_count(),
            frames_processed: self.session.frames_processed(),
            frames_without_detection: self.session.frames_without_detection(),
            dropped_log_writes,
            reps: self.session.reps().to_vec(),
            end_reason,
        }
    }
}

/// Caller-side view of a running session.
///
/// Dropping the handle stops the session and waits for the worker to release
/// its landmark source.
#[derive(Debug)]
pub struct SessionHandle {
    exercise_id: String,
    stop: Arc<AtomicBool>,
    receiver: SnapshotReceiver,
    worker: Option<JoinHandle<SessionSummary>>,
}

impl SessionHandle {
    /// Exercise the session is counting.
    pub fn exercise_id(&self) -> &str {
        &self.exercise_id
    }

    /// Snapshot mailbox for the display thread.
    pub fn snapshots(&self) -> &SnapshotReceiver {
        &self.receiver
    }

    /// Asks the worker to exit at its next loop iteration. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::info!(exercise = %self.exercise_id, "stop requested");
        }
    }

    /// True once [`SessionHandle::stop`] has been called.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// True once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| worker.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the frame loop to end on its own, e.g. when the source
    /// closes, and returns the session summary.
    pub fn join(mut self) -> Result<SessionSummary> {
        self.join_worker()
    }

    /// Stops the session and waits for the worker to finish.
    pub fn stop_and_join(mut self) -> Result<SessionSummary> {
        self.stop();
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<SessionSummary> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| RepCounterError::msg("session worker already joined"))?;
        worker
            .join()
            .map_err(|_| RepCounterError::msg("session worker panicked"))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            let _ = self.join_worker();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::landmark::{FrameOutcome, JointLandmarks, Landmark, LandmarkFrame, ScriptedSource};
    use crate::log::{LogRecord, NullSink};
    use crate::snapshot::SessionSnapshot;

    struct ScriptProvider {
        script: RefCell<Option<ScriptedSource>>,
        failing_opens: u32,
        opens: Cell<u32>,
    }

    impl ScriptProvider {
        fn new(script: ScriptedSource) -> Self {
            Self {
                script: RefCell::new(Some(script)),
                failing_opens: 0,
                opens: Cell::new(0),
            }
        }
    }

    impl SourceProvider for ScriptProvider {
        type Source = ScriptedSource;

        fn open(&self, index: u32) -> Result<ScriptedSource> {
            self.opens.set(self.opens.get() + 1);
            if index < self.failing_opens {
                return Err(RepCounterError::source_unavailable(format!("device {index} busy")));
            }
            self.script
                .borrow_mut()
                .take()
                .ok_or_else(|| RepCounterError::source_unavailable("script already taken"))
        }
    }

    /// Never runs dry; reports an empty scene every couple of milliseconds.
    struct EmptyRoom {
        ts: u64,
    }

    impl LandmarkSource for EmptyRoom {
        fn next_frame(&mut self) -> Result<FrameOutcome> {
            thread::sleep(Duration::from_millis(2));
            self.ts += 33;
            Ok(FrameOutcome::NoDetection { timestamp_ms: self.ts })
        }
    }

    struct EmptyRoomProvider;

    impl SourceProvider for EmptyRoomProvider {
        type Source = EmptyRoom;

        fn open(&self, _index: u32) -> Result<EmptyRoom> {
            Ok(EmptyRoom { ts: 0 })
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink {
        records: Arc<Mutex<Vec<LogRecord>>>,
    }

    impl LogSink for SharedSink {
        fn append(&mut self, snapshot: &SessionSnapshot) -> Result<()> {
            self.records.lock().unwrap().push(LogRecord::from(snapshot));
            Ok(())
        }
    }

    struct FailingSink;

    impl LogSink for FailingSink {
        fn append(&mut self, _snapshot: &SessionSnapshot) -> Result<()> {
            Err(RepCounterError::LogWrite("disk full".to_string()))
        }
    }

    fn bent(degrees: f32) -> JointLandmarks {
        let radians = degrees.to_radians();
        JointLandmarks::new(
            Landmark::new(0.0, 0.0, 0.0, 1.0),
            Landmark::new(1.0, 0.0, 0.0, 1.0),
            Landmark::new(radians.cos(), radians.sin(), 0.0, 1.0),
        )
    }

    fn pushup_script() -> ScriptedSource {
        let mut script = ScriptedSource::new();
        for (step, angle) in [170.0, 170.0, 85.0, 85.0, 165.0, 165.0].iter().enumerate() {
            let ts = step as u64 * 200;
            script.push(FrameOutcome::Detected(
                LandmarkFrame::new(ts)
                    .with_joint("left_elbow", bent(*angle))
                    .with_joint("right_elbow", bent(*angle)),
            ));
            if step == 3 {
                script.push(FrameOutcome::NoDetection { timestamp_ms: ts + 100 });
            }
        }
        script
    }

    fn orchestrator() -> SessionOrchestrator<'static> {
        SessionOrchestrator::new(RuleRegistry::global().unwrap(), AppConfig::default())
    }

    #[test]
    fn runs_scripted_session_until_source_closes() {
        let provider = ScriptProvider::new(pushup_script());
        let sink = SharedSink::default();

        let handle = orchestrator()
            .start("pushup", &provider, Box::new(sink.clone()))
            .unwrap();
        let receiver = handle.snapshots().clone();
        let summary = handle.join().unwrap();

        assert_eq!(summary.rep_count, 1);
        assert_eq!(summary.frames_processed, 7);
        assert_eq!(summary.frames_without_detection, 1);
        assert_eq!(summary.dropped_log_writes, 0);
        assert_eq!(summary.end_reason, EndReason::SourceClosed);
        assert_eq!(summary.reps.len(), 1);

        let last = receiver.try_latest().unwrap().unwrap();
        assert_eq!(last.rep_count, 1);
        assert_eq!(last.frame_timestamp_ms, 1_000);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(
            records[4].angles,
            BTreeMap::from([
                ("left_elbow".to_string(), None),
                ("right_elbow".to_string(), None),
            ])
        );
    }

    #[test]
    fn unknown_exercise_fails_before_opening_source() {
        let provider = ScriptProvider::new(ScriptedSource::new());

        let err = orchestrator()
            .start("unknown_id", &provider, Box::new(NullSink))
            .unwrap_err();

        assert!(matches!(err, RepCounterError::UnknownExercise(id) if id == "unknown_id"));
        assert_eq!(provider.opens.get(), 0);
    }

    #[test]
    fn falls_back_to_alternate_source() {
        let mut provider = ScriptProvider::new(pushup_script());
        provider.failing_opens = 2;

        let summary = orchestrator()
            .start("pushup", &provider, Box::new(NullSink))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(provider.opens.get(), 3);
        assert_eq!(summary.rep_count, 1);
    }

    #[test]
    fn exhausted_source_retries_fail_the_start() {
        let mut provider = ScriptProvider::new(ScriptedSource::new());
        provider.failing_opens = u32::MAX;

        let err = orchestrator()
            .start("pushup", &provider, Box::new(NullSink))
            .unwrap_err();

        assert!(matches!(err, RepCounterError::SourceUnavailable { attempts: 3, .. }));
        assert_eq!(provider.opens.get(), 3);
    }

    #[test]
    fn sink_is_not_built_when_no_source_opens() {
        let mut provider = ScriptProvider::new(ScriptedSource::new());
        provider.failing_opens = u32::MAX;
        let built = Cell::new(false);

        let err = orchestrator()
            .start_with_sink("pushup", &provider, || {
                built.set(true);
                Ok(Box::new(NullSink) as Box<dyn LogSink>)
            })
            .unwrap_err();

        assert!(matches!(err, RepCounterError::SourceUnavailable { .. }));
        assert!(!built.get());
    }

    #[test]
    fn sink_is_built_after_the_source_opens() {
        let provider = ScriptProvider::new(pushup_script());
        let sink = SharedSink::default();
        let shared = sink.clone();

        let summary = orchestrator()
            .start_with_sink("pushup", &provider, move || {
                Ok(Box::new(shared) as Box<dyn LogSink>)
            })
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(provider.opens.get(), 1);
        assert_eq!(sink.records.lock().unwrap().len() as u64, summary.frames_processed);
    }

    #[test]
    fn log_failures_do_not_interrupt_the_session() {
        let provider = ScriptProvider::new(pushup_script());

        let handle = orchestrator()
            .start("pushup", &provider, Box::new(FailingSink))
            .unwrap();
        let receiver = handle.snapshots().clone();
        let summary = handle.join().unwrap();

        assert_eq!(summary.rep_count, 1);
        assert_eq!(summary.dropped_log_writes, summary.frames_processed);
        assert_eq!(receiver.try_latest().unwrap().map(|s| s.rep_count), Some(1));
    }

    #[test]
    fn repeated_read_failures_end_the_session() {
        let mut script = ScriptedSource::new();
        for _ in 0..5 {
            script.push_failure("usb reset");
        }
        let provider = ScriptProvider::new(script);
        let mut config = AppConfig::default();
        config.source.max_consecutive_read_failures = 3;

        let registry = RuleRegistry::global().unwrap();
        let summary = SessionOrchestrator::new(registry, config)
            .start("squat", &provider, Box::new(NullSink))
            .unwrap()
            .join()
            .unwrap();

        assert!(matches!(summary.end_reason, EndReason::SourceFailed(reason) if reason.contains("usb reset")));
        assert_eq!(summary.frames_processed, 0);
    }

    #[test]
    fn stop_ends_an_endless_session() {
        let handle = orchestrator()
            .start("lunge", &EmptyRoomProvider, Box::new(NullSink))
            .unwrap();

        let first = handle.snapshots().recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.is_some());

        handle.stop();
        handle.stop();
        assert!(handle.is_stop_requested());

        let summary = handle.stop_and_join().unwrap();
        assert_eq!(summary.end_reason, EndReason::Stopped);
        assert_eq!(summary.frames_processed, summary.frames_without_detection);
        assert_eq!(summary.rep_count, 0);
    }

    #[test]
    fn dropping_the_handle_stops_the_worker() {
        let handle = orchestrator()
            .start("bicep_curl", &EmptyRoomProvider, Box::new(NullSink))
            .unwrap();
        let receiver = handle.snapshots().clone();
        drop(handle);

        assert!(receiver.is_closed().unwrap());
    }
}
