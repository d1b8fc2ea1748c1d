use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use glob::{glob_with, MatchOptions};
use log::{debug, error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use simple_logger::SimpleLogger;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::macros::format_description;

const RECORDING_EXTENSION: &str = "fif";
const EMPTY_ROOM_SUBJECT: &str = "emptyroom";
const COMPACT_DATE: &str = "%Y%m%d";

#[derive(Parser, Clone)]
#[command(name = "MEG Session Organizer")]
#[command(about = "Classifies raw MEG recordings by filename and dispatches each one to a BIDS converter with fully populated metadata.")]
#[command(version = "0.3.0")]
struct Cli {
    #[arg(long, help = "Directory containing the raw .fif recordings", required = true)]
    input: PathBuf,
    #[arg(long, help = "Root of the BIDS dataset the converter writes into", required = true)]
    bids_root: PathBuf,
    #[arg(long, help = "Path to the dataset configuration YAML file", required = true)]
    dataset_config: PathBuf,
    #[arg(long, default_value = "problem_files.txt", help = "Append-only log of filenames that failed classification")]
    problem_log: PathBuf,
    #[arg(long, default_value = "mne-bids-write", help = "Converter executable; receives each conversion job as JSON on stdin")]
    converter: String,
    #[arg(long, help = "Log each conversion job instead of invoking the converter")]
    dry_run: bool,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatasetConfig {
    dataset_name: String,
    authors: Vec<String>,
    institution_name: String,
    institution_address: Option<String>,
    manufacturer: String,
    line_freq: f64,
}

#[derive(Debug, Clone)]
struct RawFileDescriptor {
    path: PathBuf,
    name: String,
    // Filesystem mtime stands in for the acquisition time; the scanner does
    // not record a true acquisition timestamp anywhere we can reach.
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum ClassificationFailure {
    #[error("task unresolved: '{0}'")]
    TaskUnresolved(String),
    #[error("session unresolved: '{0}'")]
    SessionUnresolved(String),
    #[error("expected 3 underscore-separated segments, found {0}")]
    MalformedName(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    V1,
    V2,
}

impl Session {
    fn from_token(token: &str) -> Result<Self, ClassificationFailure> {
        if token.eq_ignore_ascii_case("v1") {
            Ok(Session::V1)
        } else if token.eq_ignore_ascii_case("v2") {
            Ok(Session::V2)
        } else {
            Err(ClassificationFailure::SessionUnresolved(token.to_string()))
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Session::V1 => "v1",
            Session::V2 => "v2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingCategory {
    FirstRest,
    PostTaskRest,
    NavigationRun1,
    NavigationRun2,
    EmptyRoom,
}

impl RecordingCategory {
    fn id(&self) -> &'static str {
        match self {
            RecordingCategory::FirstRest => "first-rest",
            RecordingCategory::PostTaskRest => "post-task-rest",
            RecordingCategory::NavigationRun1 => "navigation-task-run-1",
            RecordingCategory::NavigationRun2 => "navigation-task-run-2",
            RecordingCategory::EmptyRoom => "background-noise-reference",
        }
    }
}

#[derive(Debug)]
struct CategorySpec {
    token: &'static str,
    category: RecordingCategory,
    task_label: &'static str,
    run: Option<u32>,
    description: &'static str,
    instructions: &'static str,
    cogatlas_ids: &'static [&'static str],
    // EmptyRoom replaces the parsed subject and session; the session token in
    // the filename is never inspected for these files.
    overrides_identity: bool,
}

const CATEGORY_TABLE: [CategorySpec; 5] = [
    CategorySpec {
        token: "rest1",
        category: RecordingCategory::FirstRest,
        task_label: "rest1",
        run: Some(1),
        description: "Five-minute eyes-open resting-state recording acquired before the water maze navigation task.",
        instructions: "Sit still, relax and keep your eyes on the fixation cross. Try not to fall asleep.",
        cogatlas_ids: &["trm_4c8a834779883"],
        overrides_identity: false,
    },
    CategorySpec {
        token: "rest2",
        category: RecordingCategory::PostTaskRest,
        task_label: "rest2",
        run: Some(1),
        description: "Five-minute eyes-open resting-state recording acquired after the water maze navigation task.",
        instructions: "Sit still, relax and keep your eyes on the fixation cross. Try not to fall asleep.",
        cogatlas_ids: &["trm_4c8a834779883"],
        overrides_identity: false,
    },
    CategorySpec {
        token: "watermaze1",
        category: RecordingCategory::NavigationRun1,
        task_label: "watermaze",
        run: Some(1),
        description: "First run of the virtual Morris water maze spatial navigation task.",
        instructions: "Use the joystick to swim to the hidden platform as quickly as you can. The platform stays in the same place on every trial.",
        cogatlas_ids: &["tsk_4a57abb949dd0", "trm_4da890594742a"],
        overrides_identity: false,
    },
    CategorySpec {
        token: "watermaze2",
        category: RecordingCategory::NavigationRun2,
        task_label: "watermaze",
        run: Some(2),
        description: "Second run of the virtual Morris water maze spatial navigation task.",
        instructions: "Use the joystick to swim to the hidden platform as quickly as you can. The platform stays in the same place on every trial.",
        cogatlas_ids: &["tsk_4a57abb949dd0", "trm_4da890594742a"],
        overrides_identity: false,
    },
    CategorySpec {
        token: "empty",
        category: RecordingCategory::EmptyRoom,
        task_label: "noise",
        run: None,
        description: "Empty-room recording with no participant present, used as a noise baseline for the recordings of the same day.",
        instructions: "",
        cogatlas_ids: &[],
        overrides_identity: true,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedIdentity {
    subject: String,
    session: String,
    task: String,
    run: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ConversionJob {
    source_path: PathBuf,
    bids_root: PathBuf,
    subject: String,
    session: String,
    task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<u32>,
    acquisition_time: String,
    task_description: String,
    instructions: String,
    cogatlas_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    associated_empty_room: Option<String>,
    dataset: DatasetConfig,
}

/// Splits a raw filename on underscores and strips the recording extension
/// from whichever token it is attached to. Case is preserved; callers compare
/// tokens case-insensitively. Never fails: malformed names simply yield a
/// token sequence that resolution will reject.
fn tokenize(name: &str) -> Vec<String> {
    let suffix = format!(".{}", RECORDING_EXTENSION);
    name.split('_')
        .map(|part| {
            let lower = part.to_ascii_lowercase();
            match lower.strip_suffix(&suffix) {
                Some(stripped) => part[..stripped.len()].to_string(),
                None => part.to_string(),
            }
        })
        .collect()
}

fn classify(task_token: &str) -> Result<&'static CategorySpec, ClassificationFailure> {
    CATEGORY_TABLE
        .iter()
        .find(|spec| spec.token.eq_ignore_ascii_case(task_token))
        .ok_or_else(|| ClassificationFailure::TaskUnresolved(task_token.to_string()))
}

/// Maps a token sequence to a typed identity. The task is classified before
/// the session token is touched so that empty-room files, whose identity is
/// overridden wholesale, accept any third segment.
fn resolve(
    tokens: &[String],
    modified: DateTime<Utc>,
) -> Result<(ResolvedIdentity, &'static CategorySpec), ClassificationFailure> {
    if tokens.len() != 3 {
        return Err(ClassificationFailure::MalformedName(tokens.len()));
    }
    let spec = classify(&tokens[1])?;
    let (subject, session) = if spec.overrides_identity {
        (
            EMPTY_ROOM_SUBJECT.to_string(),
            modified.format(COMPACT_DATE).to_string(),
        )
    } else {
        (
            tokens[0].clone(),
            Session::from_token(&tokens[2])?.label().to_string(),
        )
    };
    Ok((
        ResolvedIdentity {
            subject,
            session,
            task: spec.task_label.to_string(),
            run: spec.run,
        },
        spec,
    ))
}

/// Relative path of the empty-room recording expected for a given acquisition
/// date. Derived from filesystem mtime; only one reference path is
/// representable per calendar date.
fn empty_room_path(acquired: DateTime<Utc>) -> String {
    let date = acquired.format(COMPACT_DATE).to_string();
    format!(
        "sub-emptyroom/ses-{}/meg/sub-emptyroom_ses-{}_task-noise_meg.{}",
        date, date, RECORDING_EXTENSION
    )
}

fn build_job(
    file: &RawFileDescriptor,
    identity: ResolvedIdentity,
    spec: &CategorySpec,
    config: &DatasetConfig,
    bids_root: &Path,
) -> ConversionJob {
    let associated_empty_room = if spec.category == RecordingCategory::EmptyRoom {
        None
    } else {
        Some(empty_room_path(file.modified))
    };
    ConversionJob {
        source_path: file.path.clone(),
        bids_root: bids_root.to_path_buf(),
        subject: identity.subject,
        session: identity.session,
        task: identity.task,
        run: identity.run,
        acquisition_time: file.modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        task_description: spec.description.to_string(),
        instructions: spec.instructions.to_string(),
        cogatlas_ids: spec.cogatlas_ids.iter().map(|id| id.to_string()).collect(),
        associated_empty_room,
        dataset: config.clone(),
    }
}

trait RecordingConverter {
    fn convert(&self, job: &ConversionJob) -> Result<()>;
}

struct ExternalConverter {
    command: String,
}

impl RecordingConverter for ExternalConverter {
    fn convert(&self, job: &ConversionJob) -> Result<()> {
        let payload = serde_json::to_vec(job).context("Failed to serialize conversion job")?;
        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to launch converter '{}'", self.command))?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("Converter stdin unavailable"))?;
            stdin.write_all(&payload).with_context(|| {
                format!(
                    "Failed to write job for {} to converter stdin",
                    job.source_path.display()
                )
            })?;
        }
        let status = child.wait().context("Failed to wait for converter")?;
        if !status.success() {
            return Err(anyhow::anyhow!("Converter exited with {}", status));
        }
        Ok(())
    }
}

struct DryRunConverter;

impl RecordingConverter for DryRunConverter {
    fn convert(&self, job: &ConversionJob) -> Result<()> {
        let run_msg = job.run.map_or(String::new(), |r| format!(" run-{}", r));
        info!(
            "[dry-run] {} -> sub-{} ses-{} task-{}{}",
            job.source_path.display(),
            job.subject,
            job.session,
            job.task,
            run_msg
        );
        debug!("[dry-run] job: {}", serde_json::to_string_pretty(job)?);
        Ok(())
    }
}

/// One line per unclassifiable file: the filename verbatim, then the failure
/// kind. The sink is opened and closed per entry; no handle is held across
/// batch iterations.
fn append_problem(problem_log: &Path, name: &str, failure: &ClassificationFailure) -> Result<()> {
    let mut sink = OpenOptions::new()
        .append(true)
        .create(true)
        .open(problem_log)
        .with_context(|| format!("Failed to open problem log: {}", problem_log.display()))?;
    writeln!(sink, "{}\t{}", name, failure)
        .with_context(|| format!("Failed to append {} to problem log", name))?;
    Ok(())
}

fn find_recordings(directory: &Path) -> Result<Vec<RawFileDescriptor>> {
    let pattern = directory.join(format!("*.{}", RECORDING_EXTENSION));
    let pattern_str = pattern.to_string_lossy();
    info!("Searching for recordings matching pattern: {}", pattern_str);
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let mut found = Vec::new();
    for entry in glob_with(&pattern_str, options)? {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => {
                warn!("Skipping path with non-UTF-8 name: {}", path.display());
                continue;
            }
        };
        if name.starts_with('.') {
            debug!("Skipping hidden or partial file: {}", name);
            continue;
        }
        let metadata =
            fs::metadata(&path).with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .with_context(|| format!("Failed to read modification time of {}", path.display()))?
            .into();
        found.push(RawFileDescriptor { path, name, modified });
    }
    if found.is_empty() {
        warn!(
            "No *.{} files found in {}",
            RECORDING_EXTENSION,
            directory.display()
        );
    }
    Ok(found)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BatchSummary {
    converted: usize,
    unclassified: usize,
    converter_errors: usize,
}

/// Visits every discovered file in enumeration order. Classification failures
/// are appended to the problem log and the batch continues; converter failures
/// are logged and the batch continues. Nothing here aborts the run.
fn run_batch(
    files: &[RawFileDescriptor],
    config: &DatasetConfig,
    bids_root: &Path,
    converter: &dyn RecordingConverter,
    problem_log: &Path,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for file in files {
        let tokens = tokenize(&file.name);
        let (identity, spec) = match resolve(&tokens, file.modified) {
            Ok(resolved) => resolved,
            Err(failure) => {
                warn!("Skipping {}: {}", file.name, failure);
                summary.unclassified += 1;
                if let Err(e) = append_problem(problem_log, &file.name, &failure) {
                    error!("Failed to record {} in problem log: {}", file.name, e);
                }
                continue;
            }
        };
        debug!("{} classified as {}", file.name, spec.category.id());
        let job = build_job(file, identity, spec, config, bids_root);
        info!(
            "Converting {} (subject {}, session {}, task {})",
            file.name, job.subject, job.session, job.task
        );
        match converter.convert(&job) {
            Ok(()) => summary.converted += 1,
            Err(e) => {
                error!("Converter failed for {}: {:#}", file.name, e);
                summary.converter_errors += 1;
            }
        }
    }
    summary
}

fn load_dataset_config(path: &Path) -> Result<DatasetConfig> {
    let file = File::open(path).with_context(|| {
        format!("Failed to open dataset configuration file: {}", path.display())
    })?;
    let config: DatasetConfig = serde_yaml::from_reader(file).with_context(|| {
        format!("Failed to parse dataset configuration YAML from {}", path.display())
    })?;
    Ok(config)
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else {
        format!("{}.{:03}s", total_secs, elapsed.subsec_millis())
    }
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .init()?;

    info!("Starting MEG Session Organizer");
    info!("Input directory: {}", cli.input.display());
    info!("BIDS root: {}", cli.bids_root.display());

    let config = load_dataset_config(&cli.dataset_config)?;
    info!(
        "Dataset configuration loaded: '{}' ({})",
        config.dataset_name, config.institution_name
    );

    fs::create_dir_all(&cli.bids_root)
        .with_context(|| format!("Failed to create BIDS root: {}", cli.bids_root.display()))?;

    let files = find_recordings(&cli.input)?;
    if files.is_empty() {
        return Ok(());
    }
    info!("Recordings to process: {}", files.len());

    let converter: Box<dyn RecordingConverter> = if cli.dry_run {
        info!("Dry run: conversion jobs will be logged, not dispatched.");
        Box::new(DryRunConverter)
    } else {
        Box::new(ExternalConverter {
            command: cli.converter.clone(),
        })
    };

    let summary = run_batch(
        &files,
        &config,
        &cli.bids_root,
        converter.as_ref(),
        &cli.problem_log,
    );

    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Recordings discovered: {}", files.len());
    info!("Converted: {}", summary.converted);
    if summary.unclassified > 0 {
        warn!(
            "Unclassified filenames (see {}): {}",
            cli.problem_log.display(),
            summary.unclassified
        );
    }
    if summary.converter_errors > 0 {
        warn!("Converter errors: {}", summary.converter_errors);
    }
    info!("-------------------------------------------------------");

    // The batch visits every file and the process exits 0 either way; failures
    // live in the problem log and the converter's own reporting, not in the
    // exit code.
    Ok(())
}
