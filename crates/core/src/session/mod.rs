use std::collections::BTreeMap;

use crate::angle::{joint_angle, JointAngleSample};
use crate::config::SessionConfig;
use crate::detector::{RepDetector, RepSummary};
use crate::landmark::{FrameOutcome, LandmarkFrame};
use crate::rules::{Aggregation, ExerciseRule, RuleRegistry};
use crate::snapshot::SessionSnapshot;
use crate::Result;

/// Combines per-joint rep completions into the session count.
#[derive(Debug, Clone)]
enum RepAggregator {
    Primary {
        index: usize,
    },
    CoPrimary {
        indices: [usize; 2],
        window_ms: u64,
        /// Completion time of each co-primary joint still waiting for its pair.
        pending: [Option<u64>; 2],
    },
}

impl RepAggregator {
    fn new(rule: &ExerciseRule, default_window_ms: u64) -> Self {
        let position = |joint: &str| {
            rule.joints
                .iter()
                .position(|tracked| tracked == joint)
                .unwrap_or(0)
        };

        match &rule.aggregation {
            Aggregation::Primary(joint) => RepAggregator::Primary {
                index: position(joint.as_str()),
            },
            Aggregation::CoPrimary {
                joints,
                sync_window_ms,
            } => RepAggregator::CoPrimary {
                indices: [position(joints[0].as_str()), position(joints[1].as_str())],
                window_ms: sync_window_ms.unwrap_or(default_window_ms),
                pending: [None, None],
            },
        }
    }

    fn lead_index(&self) -> usize {
        match self {
            RepAggregator::Primary { index } => *index,
            RepAggregator::CoPrimary { indices, .. } => indices[0],
        }
    }

    fn counting_indices(&self) -> &[usize] {
        match self {
            RepAggregator::Primary { index } => std::slice::from_ref(index),
            RepAggregator::CoPrimary { indices, .. } => indices,
        }
    }

    /// Records that the detector at `index` completed a rep at `timestamp_ms`.
    /// Returns `true` when this completes a session-level rep.
    fn observe(&mut self, index: usize, timestamp_ms: u64) -> bool {
        match self {
            RepAggregator::Primary { index: primary } => *primary == index,
            RepAggregator::CoPrimary {
                indices,
                window_ms,
                pending,
            } => {
                let Some(slot) = indices.iter().position(|i| *i == index) else {
                    return false;
                };
                let other = 1 - slot;

                if let Some(paired_at) = pending[other] {
                    if timestamp_ms.abs_diff(paired_at) <= *window_ms {
                        *pending = [None, None];
                        return true;
                    }
                    tracing::debug!(
                        waited_ms = timestamp_ms.abs_diff(paired_at),
                        "co-primary completion expired without its pair"
                    );
                    pending[other] = None;
                }

                pending[slot] = Some(timestamp_ms);
                false
            }
        }
    }
}

/// State of one active session. Owned by exactly one thread.
#[derive(Debug)]
pub struct Session {
    rule: ExerciseRule,
    settings: SessionConfig,
    detectors: Vec<RepDetector>,
    aggregator: RepAggregator,
    rep_count: u32,
    reps: Vec<RepSummary>,
    lead_summary: Option<RepSummary>,
    frames_processed: u64,
    frames_without_detection: u64,
    running: bool,
}

impl Session {
    /// Looks `exercise_id` up and builds one detector per tracked joint.
    /// Nothing is constructed when the exercise is unknown.
    pub fn start(registry: &RuleRegistry, exercise_id: &str, settings: &SessionConfig) -> Result<Self> {
        let rule = registry.get_rule(exercise_id)?;
        Ok(Self::from_rule(rule.clone(), settings.clone()))
    }

    /// Creates a session for an already resolved rule. Used when replaying
    /// logs against a rule the caller picked up front.
    pub fn from_rule(rule: ExerciseRule, settings: SessionConfig) -> Self {
        let detectors = rule
            .joints
            .iter()
            .map(|joint| {
                RepDetector::with_debounce(
                    joint.clone(),
                    rule.min_threshold,
                    rule.max_threshold,
                    settings.debounce_ms,
                )
            })
            .collect();
        let aggregator = RepAggregator::new(&rule, settings.sync_window_ms);

        tracing::info!(
            exercise = %rule.exercise_id,
            joints = rule.joints.len(),
            "session started"
        );

        Self {
            rule,
            settings,
            detectors,
            aggregator,
            rep_count: 0,
            reps: Vec::new(),
            lead_summary: None,
            frames_processed: 0,
            frames_without_detection: 0,
            running: true,
        }
    }

    /// The rule this session counts against.
    pub fn rule(&self) -> &ExerciseRule {
        &self.rule
    }

    /// One detector per tracked joint, in rule order. Empty once stopped.
    pub fn detectors(&self) -> &[RepDetector] {
        &self.detectors
    }

    /// Session-level reps counted so far.
    pub fn rep_count(&self) -> u32 {
        self.rep_count
    }

    /// Summaries of every counted rep, as reported by the lead counting joint.
    pub fn reps(&self) -> &[RepSummary] {
        &self.reps
    }

    /// Frames fed while the session was running, with or without a person.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Frames in which the estimator found nobody.
    pub fn frames_without_detection(&self) -> u64 {
        self.frames_without_detection
    }

    /// `false` after [`Session::stop`].
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Measures every tracked joint in `frame`. Joints missing from the frame
    /// or failing the visibility floor come back as `None`.
    pub fn measure(&self, frame: &LandmarkFrame) -> Vec<JointAngleSample> {
        self.rule
            .joints
            .iter()
            .map(|joint| {
                let angle = frame
                    .joint(joint)
                    .and_then(|landmarks| joint_angle(landmarks, self.settings.visibility_floor));
                JointAngleSample::new(joint.clone(), angle, frame.timestamp_ms)
            })
            .collect()
    }

    /// Runs one frame through the detectors. Returns `None` for a closed
    /// source or a stopped session.
    pub fn process_frame(&mut self, outcome: &FrameOutcome) -> Option<SessionSnapshot> {
        match outcome {
            FrameOutcome::Detected(frame) => {
                let angles: BTreeMap<String, Option<f32>> = self
                    .measure(frame)
                    .into_iter()
                    .map(|sample| (sample.joint_id, sample.angle_degrees))
                    .collect();
                self.apply(frame.timestamp_ms, &angles, true)
            }
            FrameOutcome::NoDetection { timestamp_ms } => {
                if self.running {
                    self.frames_without_detection += 1;
                }
                let angles: BTreeMap<String, Option<f32>> =
                    self.rule.joints.iter().map(|joint| (joint.clone(), None)).collect();
                self.apply(*timestamp_ms, &angles, false)
            }
            FrameOutcome::Closed => None,
        }
    }

    /// Feeds already computed angles, e.g. read back from a session log.
    /// Joints absent from `angles` are treated as unavailable.
    pub fn apply_angles(
        &mut self,
        timestamp_ms: u64,
        angles: &BTreeMap<String, Option<f32>>,
    ) -> Option<SessionSnapshot> {
        let detected = angles.values().any(Option::is_some);
        self.apply(timestamp_ms, angles, detected)
    }

    fn apply(
        &mut self,
        timestamp_ms: u64,
        angles: &BTreeMap<String, Option<f32>>,
        person_detected: bool,
    ) -> Option<SessionSnapshot> {
        if !self.running {
            return None;
        }
        self.frames_processed += 1;

        let lead = self.aggregator.lead_index();
        let mut counted = false;

        for index in 0..self.detectors.len() {
            let angle = angles
                .get(self.detectors[index].joint_id())
                .copied()
                .flatten();
            let update = self.detectors[index].update(angle, timestamp_ms);
            if !update.rep_completed {
                continue;
            }

            if index == lead {
                self.lead_summary = update.summary;
            }
            if self.aggregator.observe(index, timestamp_ms) {
                counted = true;
            }
        }

        if counted {
            self.rep_count += 1;
            if let Some(summary) = self.lead_summary.take() {
                self.reps.push(summary);
            }
            tracing::info!(
                exercise = %self.rule.exercise_id,
                reps = self.rep_count,
                "rep counted"
            );
        }

        Some(self.snapshot(timestamp_ms, angles, person_detected))
    }

    fn snapshot(
        &self,
        timestamp_ms: u64,
        measured: &BTreeMap<String, Option<f32>>,
        person_detected: bool,
    ) -> SessionSnapshot {
        let angles: BTreeMap<String, Option<f32>> = self
            .rule
            .joints
            .iter()
            .map(|joint| (joint.clone(), measured.get(joint).copied().flatten()))
            .collect();
        let per_joint_phase = self
            .detectors
            .iter()
            .map(|detector| (detector.joint_id().to_string(), detector.phase()))
            .collect();

        let counting: Vec<f32> = self
            .aggregator
            .counting_indices()
            .iter()
            .filter_map(|&index| angles.get(self.detectors[index].joint_id()).copied().flatten())
            .collect();
        let feedback_angle = if counting.is_empty() {
            None
        } else {
            Some(counting.iter().sum::<f32>() / counting.len() as f32)
        };
        let lead_phase = self.detectors[self.aggregator.lead_index()].phase();

        SessionSnapshot {
            workout_id: self.rule.exercise_id.clone(),
            rep_count: self.rep_count,
            per_joint_phase,
            feedback_text: self.rule.feedback(feedback_angle, lead_phase),
            angles,
            frame_timestamp_ms: timestamp_ms,
            person_detected,
            last_rep: self.reps.last().cloned(),
        }
    }

    /// Ends the session and releases its detectors. Calling it again is a
    /// no-op.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.detectors.clear();
        tracing::info!(
            exercise = %self.rule.exercise_id,
            reps = self.rep_count,
            frames = self.frames_processed,
            "session stopped"
        );
    }
}
