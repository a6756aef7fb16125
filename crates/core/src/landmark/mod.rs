use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{RepCounterError, Result};

/// A single estimated body keypoint with its confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    /// Confidence in [0, 1] that the point is actually visible.
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }

    pub fn is_visible(&self, floor: f32) -> bool {
        self.visibility >= floor
    }
}

/// The three landmarks needed to measure one joint: the joint itself and the
/// far ends of the two limb segments that meet there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLandmarks {
    pub vertex: Landmark,
    pub a: Landmark,
    pub b: Landmark,
}

impl JointLandmarks {
    pub fn new(vertex: Landmark, a: Landmark, b: Landmark) -> Self {
        Self { vertex, a, b }
    }
}

/// Landmarks for every joint the upstream estimator resolved in one frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LandmarkFrame {
    pub timestamp_ms: u64,
    pub joints: BTreeMap<String, JointLandmarks>,
}

impl LandmarkFrame {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            joints: BTreeMap::new(),
        }
    }

    pub fn with_joint(mut self, joint_id: impl Into<String>, landmarks: JointLandmarks) -> Self {
        self.joints.insert(joint_id.into(), landmarks);
        self
    }

    pub fn joint(&self, joint_id: &str) -> Option<&JointLandmarks> {
        self.joints.get(joint_id)
    }
}

/// Result of asking a [`LandmarkSource`] for its next frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Detected(LandmarkFrame),
    /// A frame was captured but no person was found in it.
    NoDetection { timestamp_ms: u64 },
    /// The source has no more frames and will not produce any again.
    Closed,
}

/// Upstream pose estimator as seen by the session worker. Implementations may
/// block while waiting for the next frame.
pub trait LandmarkSource: Send {
    fn next_frame(&mut self) -> Result<FrameOutcome>;
}

/// Opens landmark sources by index so that alternate devices or files can be
/// tried when the preferred one is unavailable.
pub trait SourceProvider {
    type Source: LandmarkSource + 'static;

    fn open(&self, index: u32) -> Result<Self::Source>;
}

/// Tries source indices `0..max_attempts` in order and returns the first one
/// that opens.
pub fn open_with_retry<P: SourceProvider>(provider: &P, max_attempts: u32) -> Result<P::Source> {
    let attempts = max_attempts.max(1);
    let mut last_reason = String::from("no source attempted");

    for index in 0..attempts {
        match provider.open(index) {
            Ok(source) => {
                if index > 0 {
                    tracing::info!(index, "opened alternate landmark source");
                }
                return Ok(source);
            }
            Err(err) => {
                tracing::debug!(index, error = %err, "landmark source failed to open");
                last_reason = err.to_string();
            }
        }
    }

    Err(RepCounterError::SourceUnavailable {
        attempts,
        reason: last_reason,
    })
}

/// In-memory source that replays a fixed script of outcomes and read failures,
/// then reports [`FrameOutcome::Closed`].
#[derive(Debug, Default)]
pub struct ScriptedSource {
    steps: VecDeque<std::result::Result<FrameOutcome, String>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_outcomes(outcomes: impl IntoIterator<Item = FrameOutcome>) -> Self {
        Self {
            steps: outcomes.into_iter().map(Ok).collect(),
        }
    }

    pub fn push(&mut self, outcome: FrameOutcome) {
        self.steps.push_back(Ok(outcome));
    }

    pub fn push_failure(&mut self, reason: impl Into<String>) {
        self.steps.push_back(Err(reason.into()));
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl LandmarkSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<FrameOutcome> {
        match self.steps.pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(RepCounterError::source_unavailable(reason)),
            None => Ok(FrameOutcome::Closed),
        }
    }
}

/// One line of a landmark replay file. A missing or `null` `joints` field
/// marks a frame in which nobody was detected.
#[derive(Debug, Deserialize)]
struct FrameLine {
    timestamp_ms: u64,
    #[serde(default)]
    joints: Option<BTreeMap<String, JointLandmarks>>,
}

/// Reads newline-delimited landmark frames, e.g. recorded from a pose
/// estimator, and serves them one per call.
pub struct JsonlLandmarkSource<R> {
    reader: R,
    line: String,
    line_number: usize,
}

impl<R: BufRead> JsonlLandmarkSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
        }
    }
}

impl<R: BufRead + Send> LandmarkSource for JsonlLandmarkSource<R> {
    fn next_frame(&mut self) -> Result<FrameOutcome> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|err| RepCounterError::source_unavailable(err.to_string()))?;
            if read == 0 {
                return Ok(FrameOutcome::Closed);
            }
            self.line_number += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed: FrameLine = serde_json::from_str(trimmed).map_err(|err| {
                RepCounterError::source_unavailable(format!(
                    "malformed frame on line {}: {err}",
                    self.line_number
                ))
            })?;

            return Ok(match parsed.joints {
                Some(joints) => FrameOutcome::Detected(LandmarkFrame {
                    timestamp_ms: parsed.timestamp_ms,
                    joints,
                }),
                None => FrameOutcome::NoDetection {
                    timestamp_ms: parsed.timestamp_ms,
                },
            });
        }
    }
}

impl<R> std::fmt::Debug for JsonlLandmarkSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLandmarkSource")
            .field("line_number", &self.line_number)
            .finish()
    }
}

/// Maps source indices onto a list of replay files; index `n` opens the
/// `n`-th path.
#[derive(Debug, Clone)]
pub struct JsonlSourceProvider {
    paths: Vec<PathBuf>,
}

impl JsonlSourceProvider {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl SourceProvider for JsonlSourceProvider {
    type Source = JsonlLandmarkSource<BufReader<File>>;

    fn open(&self, index: u32) -> Result<Self::Source> {
        let path = self.paths.get(index as usize).ok_or_else(|| {
            RepCounterError::source_unavailable(format!("no landmark source at index {index}"))
        })?;
        let file = File::open(path).map_err(|err| {
            RepCounterError::source_unavailable(format!("{}: {err}", path.display()))
        })?;
        Ok(JsonlLandmarkSource::new(BufReader::new(file)))
    }
}
