//! Core library for the Rep Counter application.
//!
//! Landmark frames from an external pose estimator are turned into joint
//! angles, fed through one hysteresis detector per tracked joint, and combined
//! per the active exercise rule into a rep count and a form cue. A session
//! runs on its own worker thread and hands immutable snapshots to the display
//! side through a latest-value mailbox, appending one JSON record per frame
//! to the session log as it goes.

pub mod angle;
pub mod config;
pub mod detector;
pub mod error;
pub mod landmark;
pub mod log;
pub mod orchestrator;
pub mod rules;
pub mod session;
pub mod snapshot;

pub use angle::{compute_angle, compute_angle_with_floor, JointAngleSample};
pub use config::{AppConfig, LogConfig, SessionConfig, SourceConfig};
pub use detector::{DetectorUpdate, Phase, RepDetector, RepDetectorState, RepSummary};
pub use error::{RepCounterError, Result};
pub use landmark::{
    FrameOutcome, JointLandmarks, JsonlLandmarkSource, JsonlSourceProvider, Landmark,
    LandmarkFrame, LandmarkSource, ScriptedSource, SourceProvider,
};
pub use log::{read_records, LogRecord, LogSink, NullSink, SessionLogWriter};
pub use orchestrator::{EndReason, SessionHandle, SessionOrchestrator, SessionSummary};
pub use rules::{get_rule, Aggregation, ExerciseRule, RuleRegistry};
pub use session::Session;
pub use snapshot::{snapshot_channel, SessionSnapshot, SnapshotPublisher, SnapshotReceiver};
