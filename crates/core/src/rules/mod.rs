//! Exercise rules and the process-wide registry they are looked up in.
//!
//! Every exercise is plain data in [`RULE_TABLE`]. The table is validated once
//! when the registry is first touched and is read-only from then on, so it can
//! be shared between threads without locking.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::detector::Phase;
use crate::{RepCounterError, Result};

/// Produces the live form cue for the current frame.
pub type FeedbackFn = fn(&FeedbackContext<'_>) -> String;

/// Inputs handed to a rule's feedback function.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackContext<'a> {
    pub rule: &'a ExerciseRule,
    /// Angle of the counting joint(s); `None` if they could not be measured.
    pub angle: Option<f32>,
    pub phase: Phase,
}

/// How per-joint detector results combine into the session rep count.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// A single joint drives the count.
    Primary(String),
    /// Two symmetric joints must both complete a rep within the window.
    /// `sync_window_ms` of `None` defers to the session configuration.
    CoPrimary {
        joints: [String; 2],
        sync_window_ms: Option<u64>,
    },
}

impl Aggregation {
    /// Joints whose detectors decide the count, in lead order.
    pub fn counting_joints(&self) -> Vec<&str> {
        match self {
            Aggregation::Primary(joint) => vec![joint.as_str()],
            Aggregation::CoPrimary { joints, .. } => joints.iter().map(String::as_str).collect(),
        }
    }
}

/// Immutable configuration for one exercise.
#[derive(Debug, Clone)]
pub struct ExerciseRule {
    pub exercise_id: String,
    pub display_name: String,
    /// Tracked joints. Snapshots and log records key angles by joint name,
    /// so they come out sorted by name rather than in this order.
    pub joints: Vec<String>,
    pub min_threshold: f32,
    pub max_threshold: f32,
    /// Angle band at the bottom of the movement that counts as good depth.
    pub target_range: (f32, f32),
    pub aggregation: Aggregation,
    pub feedback_fn: FeedbackFn,
}

impl ExerciseRule {
    /// Form cue for the counting joints' angle and the lead joint's phase.
    pub fn feedback(&self, angle: Option<f32>, phase: Phase) -> String {
        (self.feedback_fn)(&FeedbackContext {
            rule: self,
            angle,
            phase,
        })
    }

    /// Whether `joint_id` is one of the rule's tracked joints.
    pub fn tracks(&self, joint_id: &str) -> bool {
        self.joints.iter().any(|joint| joint == joint_id)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RepCounterError::InvalidRule {
            exercise: self.exercise_id.clone(),
            reason,
        };

        if !(self.min_threshold < self.max_threshold) {
            return Err(invalid(format!(
                "min_threshold {} must be below max_threshold {}",
                self.min_threshold, self.max_threshold
            )));
        }
        if !(self.target_range.0 < self.target_range.1) {
            return Err(invalid(format!(
                "target range {:?} is empty",
                self.target_range
            )));
        }
        if self.joints.is_empty() {
            return Err(invalid("no joints tracked".to_string()));
        }
        for (index, joint) in self.joints.iter().enumerate() {
            if self.joints[..index].contains(joint) {
                return Err(invalid(format!("joint `{joint}` listed twice")));
            }
        }

        let counting = self.aggregation.counting_joints();
        if let Some(missing) = counting.iter().find(|joint| !self.tracks(joint)) {
            return Err(invalid(format!("counting joint `{missing}` is not tracked")));
        }
        if counting.len() == 2 && counting[0] == counting[1] {
            return Err(invalid("co-primary joints must differ".to_string()));
        }

        Ok(())
    }
}

/// Static description of an exercise as written in [`RULE_TABLE`].
#[derive(Debug, Clone, Copy)]
pub struct RuleDefinition {
    pub exercise_id: &'static str,
    pub display_name: &'static str,
    pub joints: &'static [&'static str],
    pub min_threshold: f32,
    pub max_threshold: f32,
    pub target_range: (f32, f32),
    pub counting: Counting,
    pub feedback_fn: FeedbackFn,
}

#[derive(Debug, Clone, Copy)]
pub enum Counting {
    Primary(&'static str),
    CoPrimary([&'static str; 2]),
}

impl RuleDefinition {
    fn build(&self) -> ExerciseRule {
        let aggregation = match self.counting {
            Counting::Primary(joint) => Aggregation::Primary(joint.to_string()),
            Counting::CoPrimary([a, b]) => Aggregation::CoPrimary {
                joints: [a.to_string(), b.to_string()],
                sync_window_ms: None,
            },
        };

        ExerciseRule {
            exercise_id: self.exercise_id.to_string(),
            display_name: self.display_name.to_string(),
            joints: self.joints.iter().map(|joint| joint.to_string()).collect(),
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
            target_range: self.target_range,
            aggregation,
            feedback_fn: self.feedback_fn,
        }
    }
}

/// Exercises known to the application.
pub const RULE_TABLE: &[RuleDefinition] = &[
    RuleDefinition {
        exercise_id: "pushup",
        display_name: "Push-ups",
        joints: &["left_elbow", "right_elbow"],
        min_threshold: 90.0,
        max_threshold: 160.0,
        target_range: (60.0, 90.0),
        counting: Counting::CoPrimary(["left_elbow", "right_elbow"]),
        feedback_fn: pushup_feedback,
    },
    RuleDefinition {
        exercise_id: "squat",
        display_name: "Squats",
        joints: &["left_knee", "right_knee"],
        min_threshold: 100.0,
        max_threshold: 165.0,
        target_range: (70.0, 100.0),
        counting: Counting::CoPrimary(["left_knee", "right_knee"]),
        feedback_fn: squat_feedback,
    },
    RuleDefinition {
        exercise_id: "bicep_curl",
        display_name: "Bicep Curls",
        joints: &["right_elbow", "left_elbow"],
        min_threshold: 50.0,
        max_threshold: 150.0,
        target_range: (30.0, 50.0),
        counting: Counting::Primary("right_elbow"),
        feedback_fn: curl_feedback,
    },
    RuleDefinition {
        exercise_id: "lunge",
        display_name: "Lunges",
        joints: &["left_knee", "right_knee"],
        min_threshold: 100.0,
        max_threshold: 160.0,
        target_range: (80.0, 100.0),
        counting: Counting::Primary("left_knee"),
        feedback_fn: lunge_feedback,
    },
];

/// Registry of validated exercise rules keyed by exercise id.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, ExerciseRule>,
}

impl RuleRegistry {
    /// Builds and validates a registry from static definitions.
    pub fn from_definitions(definitions: &[RuleDefinition]) -> Result<Self> {
        let mut rules = BTreeMap::new();
        for definition in definitions {
            let rule = definition.build();
            rule.validate()?;
            if rules.contains_key(&rule.exercise_id) {
                return Err(RepCounterError::InvalidRule {
                    exercise: rule.exercise_id,
                    reason: "registered twice".to_string(),
                });
            }
            rules.insert(rule.exercise_id.clone(), rule);
        }
        Ok(Self { rules })
    }

    /// The process-wide registry, loaded from [`RULE_TABLE`] on first use.
    pub fn global() -> Result<&'static RuleRegistry> {
        static REGISTRY: OnceLock<std::result::Result<RuleRegistry, (String, String)>> =
            OnceLock::new();

        REGISTRY
            .get_or_init(|| {
                RuleRegistry::from_definitions(RULE_TABLE).map_err(|err| match err {
                    RepCounterError::InvalidRule { exercise, reason } => (exercise, reason),
                    other => (String::new(), other.to_string()),
                })
            })
            .as_ref()
            .map_err(|(exercise, reason)| RepCounterError::InvalidRule {
                exercise: exercise.clone(),
                reason: reason.clone(),
            })
    }

    /// Looks a rule up by id, failing with `UnknownExercise` if it is not
    /// registered.
    pub fn get_rule(&self, exercise_id: &str) -> Result<&ExerciseRule> {
        self.rules
            .get(exercise_id)
            .ok_or_else(|| RepCounterError::UnknownExercise(exercise_id.to_string()))
    }

    /// Registered exercise ids in sorted order.
    pub fn exercise_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Registered rules, sorted by exercise id.
    pub fn rules(&self) -> impl Iterator<Item = &ExerciseRule> {
        self.rules.values()
    }

    /// Number of registered exercises.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Looks an exercise up in the process-wide registry.
pub fn get_rule(exercise_id: &str) -> Result<&'static ExerciseRule> {
    RuleRegistry::global()?.get_rule(exercise_id)
}

/// Share of the dead zone, measured up from `min_threshold`, in which a joint
/// still at the top is told to go deeper.
const NEAR_BOTTOM_FRACTION: f32 = 0.25;

struct Cues {
    out_of_view: &'static str,
    start: &'static str,
    too_deep: &'static str,
    good_depth: &'static str,
    shallow: &'static str,
    rising: &'static str,
    lockout: &'static str,
    lowering: &'static str,
}

fn phase_cue(ctx: &FeedbackContext<'_>, cues: &Cues) -> String {
    let Some(angle) = ctx.angle else {
        return cues.out_of_view.to_string();
    };
    let rule = ctx.rule;
    let (target_low, target_high) = rule.target_range;

    let near_bottom =
        rule.min_threshold + (rule.max_threshold - rule.min_threshold) * NEAR_BOTTOM_FRACTION;

    let cue = match ctx.phase {
        Phase::Neutral => cues.start,
        Phase::Bottom if angle < target_low => cues.too_deep,
        Phase::Bottom if angle <= target_high => cues.good_depth,
        Phase::Bottom => cues.rising,
        Phase::Top if angle >= rule.max_threshold => cues.lockout,
        Phase::Top if angle <= near_bottom => cues.shallow,
        Phase::Top => cues.lowering,
    };
    cue.to_string()
}

fn pushup_feedback(ctx: &FeedbackContext<'_>) -> String {
    phase_cue(
        ctx,
        &Cues {
            out_of_view: "Keep both arms in view of the camera",
            start: "Get into plank and lower your chest",
            too_deep: "Too low, keep your chest off the floor",
            good_depth: "Good depth, push up",
            shallow: "Go a little lower",
            rising: "Push through to straight arms",
            lockout: "Nice rep, lower with control",
            lowering: "Keep your body straight on the way down",
        },
    )
}

fn squat_feedback(ctx: &FeedbackContext<'_>) -> String {
    phase_cue(
        ctx,
        &Cues {
            out_of_view: "Step back so both legs are visible",
            start: "Feet shoulder width apart, sit back",
            too_deep: "Too deep, stop with thighs near parallel",
            good_depth: "Good depth, drive up",
            shallow: "Sit a little deeper",
            rising: "Stand all the way up",
            lockout: "Nice rep, keep your chest up",
            lowering: "Push your hips back as you descend",
        },
    )
}

fn curl_feedback(ctx: &FeedbackContext<'_>) -> String {
    phase_cue(
        ctx,
        &Cues {
            out_of_view: "Keep your working arm in view",
            start: "Elbow at your side, curl up",
            too_deep: "Don't let the elbow drift forward",
            good_depth: "Full squeeze, now lower slowly",
            shallow: "Curl a little higher",
            rising: "Lower all the way down",
            lockout: "Nice rep, curl again",
            lowering: "Control the weight on the way down",
        },
    )
}

fn lunge_feedback(ctx: &FeedbackContext<'_>) -> String {
    phase_cue(
        ctx,
        &Cues {
            out_of_view: "Turn sideways so your front knee is visible",
            start: "Step forward and lower your back knee",
            too_deep: "Front knee is too bent, shorten the stride",
            good_depth: "Good depth, push back up",
            shallow: "Lower a little further",
            rising: "Drive through your front heel",
            lockout: "Nice rep, switch when ready",
            lowering: "Keep your torso upright",
        },
    )
}
