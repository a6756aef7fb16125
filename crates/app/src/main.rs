use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rep_counter_core::{
    read_records, AppConfig, JsonlSourceProvider, LogSink, NullSink, RepCounterError, RuleRegistry,
    Session, SessionLogWriter, SessionOrchestrator, SessionSnapshot,
};
use tracing_subscriber::EnvFilter;

const DISPLAY_POLL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Exercises => list_exercises(),
        Commands::Run {
            exercise,
            input,
            log,
            no_log,
        } => run_live(config, &exercise, input, log, no_log),
        Commands::Replay { exercise, log, json } => run_replay(&config, &exercise, &log, json),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("{}", user_message(&err));
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> rep_counter_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn list_exercises() -> rep_counter_core::Result<()> {
    let registry = RuleRegistry::global()?;
    for rule in registry.rules() {
        println!(
            "{:<12} {:<12} joints={} bottom<={}° top>={}°",
            rule.exercise_id,
            rule.display_name,
            rule.joints.join(","),
            rule.min_threshold,
            rule.max_threshold,
        );
    }
    Ok(())
}

fn run_live(
    mut config: AppConfig,
    exercise: &str,
    inputs: Vec<PathBuf>,
    log: Option<PathBuf>,
    no_log: bool,
) -> rep_counter_core::Result<()> {
    if let Some(path) = log {
        config.log.path = path;
    }
    if no_log {
        config.log.enabled = false;
    }
    tracing::info!(exercise, sources = inputs.len(), "starting live session");

    let registry = RuleRegistry::global()?;
    let provider = JsonlSourceProvider::new(inputs);
    let log = config.log.clone();
    let orchestrator = SessionOrchestrator::new(registry, config);

    // The log file is only created once the exercise is known and a source is open.
    let handle = orchestrator.start_with_sink(exercise, &provider, move || {
        let sink: Box<dyn LogSink> = if log.enabled {
            Box::new(SessionLogWriter::open(&log.path)?)
        } else {
            Box::new(NullSink)
        };
        Ok(sink)
    })?;

    let snapshots = handle.snapshots().clone();
    let mut display = Display::default();
    loop {
        match snapshots.recv_timeout(DISPLAY_POLL)? {
            Some(snapshot) => display.render(&snapshot),
            None if snapshots.is_closed()? => {
                if let Some(snapshot) = snapshots.try_latest()? {
                    display.render(&snapshot);
                }
                break;
            }
            None => {}
        }
    }

    let summary = handle.join()?;
    println!(
        "{}: {} rep(s) over {} frame(s), {} without a person, {} log record(s) dropped ({:?})",
        summary.exercise_id,
        summary.rep_count,
        summary.frames_processed,
        summary.frames_without_detection,
        summary.dropped_log_writes,
        summary.end_reason,
    );
    Ok(())
}

fn run_replay(
    config: &AppConfig,
    exercise: &str,
    log: &Path,
    json: bool,
) -> rep_counter_core::Result<()> {
    let registry = RuleRegistry::global()?;
    let rule = registry.get_rule(exercise)?;
    let records = read_records(BufReader::new(File::open(log)?))?;
    tracing::info!(exercise, records = records.len(), ?log, "replaying session log");

    let mut session = Session::from_rule(rule.clone(), config.session.clone());
    for record in &records {
        session.apply_angles(record.timestamp_ms, &record.angles);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(session.reps())?);
    } else {
        for (index, rep) in session.reps().iter().enumerate() {
            println!(
                "rep {:>3}: {:.1}°..{:.1}° (range {:.1}°) in {} ms over {} sample(s)",
                index + 1,
                rep.min_angle,
                rep.max_angle,
                rep.range_of_motion,
                rep.duration_ms,
                rep.num_samples,
            );
        }
        println!("{}: {} rep(s)", rule.display_name, session.rep_count());
    }
    Ok(())
}

/// Stand-in for the graphical display: prints whenever what a user would see
/// changes.
#[derive(Default)]
struct Display {
    reps: Option<u32>,
    feedback: String,
}

impl Display {
    fn render(&mut self, snapshot: &SessionSnapshot) {
        if self.reps != Some(snapshot.rep_count) {
            self.reps = Some(snapshot.rep_count);
            println!("[{:>7} ms] reps: {}", snapshot.frame_timestamp_ms, snapshot.rep_count);
        }
        if self.feedback != snapshot.feedback_text {
            self.feedback.clone_from(&snapshot.feedback_text);
            let angles: Vec<String> = snapshot
                .angles
                .iter()
                .map(|(joint, angle)| match angle {
                    Some(angle) => format!("{joint}={angle:.1}°"),
                    None => format!("{joint}=--"),
                })
                .collect();
            println!(
                "[{:>7} ms] {} ({})",
                snapshot.frame_timestamp_ms,
                snapshot.feedback_text,
                angles.join(" ")
            );
        }
    }
}

fn user_message(err: &RepCounterError) -> String {
    match err {
        RepCounterError::UnknownExercise(id) => {
            format!("Unknown exercise `{id}`. Run `rep-counter exercises` to see what is available.")
        }
        RepCounterError::SourceUnavailable { attempts, reason } => format!(
            "Could not open a landmark source after {attempts} attempt(s): {reason}"
        ),
        other => format!("error: {other}"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Counts exercise repetitions from body landmarks", long_about = None)]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the registered exercises and their thresholds.
    Exercises,
    /// Run a session against recorded landmark frames.
    Run {
        /// Exercise identifier, e.g. `pushup`.
        #[arg(short, long)]
        exercise: String,
        /// Landmark JSONL files; later ones are alternates tried in order.
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,
        /// Session log path, overriding the configuration.
        #[arg(short, long)]
        log: Option<PathBuf>,
        /// Do not write a session log.
        #[arg(long)]
        no_log: bool,
    },
    /// Recount repetitions from an existing session log.
    Replay {
        #[arg(short, long)]
        exercise: String,
        /// Session log produced by `run`.
        log: PathBuf,
        /// Print rep summaries as JSON.
        #[arg(long)]
        json: bool,
    },
}
