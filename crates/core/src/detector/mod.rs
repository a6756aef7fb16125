use serde::{Deserialize, Serialize};

/// Default minimum time between two accepted phase transitions.
pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

/// Position of a joint within its repetition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// No threshold has been reached since the detector was created.
    #[default]
    Neutral,
    Bottom,
    Top,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Neutral => "NEUTRAL",
            Phase::Bottom => "BOTTOM",
            Phase::Top => "TOP",
        };
        f.write_str(label)
    }
}

/// Mutable state owned by a single [`RepDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepDetectorState {
    pub joint_id: String,
    pub phase: Phase,
    pub rep_count: u32,
    /// Time of the last accepted transition, `None` until the first one.
    pub last_transition_ms: Option<u64>,
}

/// Shape of one counted repetition, measured over every defined sample from
/// the previous rep edge up to and including the completing sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepSummary {
    pub joint_id: String,
    pub min_angle: f32,
    pub max_angle: f32,
    pub range_of_motion: f32,
    pub duration_ms: u64,
    pub num_samples: usize,
}

/// Outcome of feeding one sample into a [`RepDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorUpdate {
    pub phase: Phase,
    /// Set exactly once per accepted BOTTOM -> TOP edge.
    pub rep_completed: bool,
    /// A threshold was crossed but the dwell time had not yet elapsed.
    pub transition_rejected: bool,
    pub summary: Option<RepSummary>,
}

impl DetectorUpdate {
    fn hold(phase: Phase) -> Self {
        Self {
            phase,
            rep_completed: false,
            transition_rejected: false,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RepWindow {
    start_ms: Option<u64>,
    min_angle: f32,
    max_angle: f32,
    samples: usize,
}

impl RepWindow {
    fn record(&mut self, angle: f32, timestamp_ms: u64) {
        if self.start_ms.is_none() {
            self.start_ms = Some(timestamp_ms);
            self.min_angle = angle;
            self.max_angle = angle;
        } else {
            self.min_angle = self.min_angle.min(angle);
            self.max_angle = self.max_angle.max(angle);
        }
        self.samples += 1;
    }

    /// Closes the window and opens the next one at the completing sample.
    fn finish(&mut self, joint_id: &str, angle: f32, timestamp_ms: u64) -> RepSummary {
        let start = self.start_ms.unwrap_or(timestamp_ms);
        let summary = RepSummary {
            joint_id: joint_id.to_string(),
            min_angle: self.min_angle,
            max_angle: self.max_angle,
            range_of_motion: self.max_angle - self.min_angle,
            duration_ms: timestamp_ms.saturating_sub(start),
            num_samples: self.samples,
        };

        *self = RepWindow::default();
        self.record(angle, timestamp_ms);
        summary
    }
}

/// Hysteresis state machine turning one joint's angle signal into counted
/// repetitions.
///
/// Angles at or below `min_threshold` put the joint at the bottom of the
/// movement; reaching `max_threshold` from the bottom completes a rep. The
/// band between the thresholds never triggers a transition, and transitions
/// closer together than the debounce interval are ignored.
#[derive(Debug, Clone)]
pub struct RepDetector {
    state: RepDetectorState,
    min_threshold: f32,
    max_threshold: f32,
    debounce_ms: u64,
    window: RepWindow,
}

impl RepDetector {
    /// Creates a detector in [`Phase::Neutral`] using the default debounce
    /// interval.
    pub fn new(joint_id: impl Into<String>, min_threshold: f32, max_threshold: f32) -> Self {
        Self::with_debounce(joint_id, min_threshold, max_threshold, DEFAULT_DEBOUNCE_MS)
    }

    /// Creates a detector with an explicit debounce interval in milliseconds.
    pub fn with_debounce(
        joint_id: impl Into<String>,
        min_threshold: f32,
        max_threshold: f32,
        debounce_ms: u64,
    ) -> Self {
        Self {
            state: RepDetectorState {
                joint_id: joint_id.into(),
                phase: Phase::Neutral,
                rep_count: 0,
                last_transition_ms: None,
            },
            min_threshold,
            max_threshold,
            debounce_ms,
            window: RepWindow::default(),
        }
    }

    /// Joint this detector watches.
    pub fn joint_id(&self) -> &str {
        &self.state.joint_id
    }

    /// Current hysteresis phase.
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Reps completed by this joint alone, before any aggregation.
    pub fn rep_count(&self) -> u32 {
        self.state.rep_count
    }

    /// Snapshot of the detector's externally visible state.
    pub fn state(&self) -> &RepDetectorState {
        &self.state
    }

    /// Feeds one angle sample. `None` samples are ignored entirely.
    pub fn update(&mut self, angle: Option<f32>, timestamp_ms: u64) -> DetectorUpdate {
        let Some(angle) = angle else {
            return DetectorUpdate::hold(self.state.phase);
        };
        self.window.record(angle, timestamp_ms);

        let target = match self.state.phase {
            Phase::Bottom if angle >= self.max_threshold => Some(Phase::Top),
            Phase::Bottom => None,
            _ if angle <= self.min_threshold => Some(Phase::Bottom),
            _ => None,
        };
        let Some(target) = target else {
            return DetectorUpdate::hold(self.state.phase);
        };

        if let Some(last) = self.state.last_transition_ms {
            let elapsed = timestamp_ms.saturating_sub(last);
            if elapsed < self.debounce_ms {
                tracing::debug!(
                    joint = %self.state.joint_id,
                    from = %self.state.phase,
                    to = %target,
                    angle,
                    elapsed,
                    "transition rejected by debounce"
                );
                return DetectorUpdate {
                    transition_rejected: true,
                    ..DetectorUpdate::hold(self.state.phase)
                };
            }
        }

        tracing::debug!(
            joint = %self.state.joint_id,
            from = %self.state.phase,
            to = %target,
            angle,
            "phase transition"
        );
        self.state.phase = target;
        self.state.last_transition_ms = Some(timestamp_ms);

        if target == Phase::Top {
            self.state.rep_count += 1;
            let summary = self
                .window
                .finish(&self.state.joint_id, angle, timestamp_ms);
            return DetectorUpdate {
                phase: target,
                rep_completed: true,
                transition_rejected: false,
                summary: Some(summary),
            };
        }

        DetectorUpdate::hold(target)
    }
}
