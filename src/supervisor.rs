/// Supervised run lifecycle: launch the target under the counter tool in a
/// fresh process group, poll it until it exits or a verdict is reached,
/// enforce termination, then turn everything observed into a `RunResult`.
use crate::classifier::{Classifier, Phase};
use crate::config::{Config, CounterConfig, TargetConfig};
use crate::metrics::{self, LiveStats, Metrics, RunContext};
use crate::resolver;
use crate::sampler::{self, ThreadState};
use crate::termination::{Enforcer, TerminationOutcome};
use crate::verdict::{self, Markers, RunObservation, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};

/// Exit code reported when the supervisor killed the run for a confirmed deadlock.
pub const EXIT_DEADLOCK: i32 = -1;
/// Exit code reported when the supervisor killed the run at the global timeout.
pub const EXIT_TIMEOUT: i32 = -2;
/// Exit code reported when the target could not be started.
pub const EXIT_LAUNCH_FAILED: i32 = -3;

/// Final record of one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub name: String,
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Target exit code, or one of the negative `EXIT_*` sentinels.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub metrics: Metrics,
    pub deadlock_detected: bool,
    pub data_race_detected: bool,
    pub timed_out: bool,
    pub phase: Phase,
    pub verdict: Verdict,
    pub target_pid: Option<i32>,
    /// Set only when a verdict forced the process group down.
    pub termination: Option<TerminationOutcome>,
    /// Processes the target left running in its group after a normal exit.
    pub stragglers: Option<TerminationOutcome>,
    pub termination_error: Option<String>,
    pub launch_error: Option<String>,
}

impl RunResult {
    fn launch_failed(name: &str, command: Vec<String>, error: &LaunchError) -> RunResult {
        RunResult {
            name: name.to_string(),
            command,
            started_at: Utc::now(),
            exit_code: EXIT_LAUNCH_FAILED,
            stdout: String::new(),
            stderr: String::new(),
            metrics: Metrics::default(),
            deadlock_detected: false,
            data_race_detected: false,
            timed_out: false,
            phase: Phase::Running,
            verdict: Verdict::LaunchFailed {
                error: error.to_string(),
            },
            target_pid: None,
            termination: None,
            stragglers: None,
            termination_error: None,
            launch_error: Some(error.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that prevent a run from starting.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to create the per-run artifact directory or capture files.
    Artifacts { source: std::io::Error },
    /// Failed to spawn the (wrapped) target.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The child exited before its PID could be read.
    NoPid,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Artifacts { source } => {
                write!(f, "failed to prepare run artifacts: {}", source)
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            LaunchError::NoPid => write!(f, "launched process has no pid"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Artifacts { source } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::NoPid => None,
        }
    }
}

/// Per-run scratch files, deleted when the run is dropped.
struct RunArtifacts {
    dir: TempDir,
}

impl RunArtifacts {
    fn create() -> std::io::Result<RunArtifacts> {
        let dir = tempfile::Builder::new().prefix("threadwatch-").tempdir()?;
        Ok(RunArtifacts { dir })
    }

    fn counter_report(&self) -> PathBuf {
        self.dir.path().join("counter.txt")
    }

    fn stdout(&self) -> PathBuf {
        self.dir.path().join("stdout.txt")
    }

    fn stderr(&self) -> PathBuf {
        self.dir.path().join("stderr.txt")
    }
}

/// One launched invocation, owned by the poll loop.
struct SupervisedRun {
    name: String,
    command: Vec<String>,
    program_name: String,
    child: Child,
    pgid: i32,
    target_pid: i32,
    resolved: bool,
    /// The leader is the counter tool rather than the target.
    wrapped: bool,
    started: Instant,
    started_at: DateTime<Utc>,
    artifacts: RunArtifacts,
}

/// What the poll loop and termination left behind for classification.
struct LoopOutcome {
    phase: Phase,
    streak: u32,
    wall: Duration,
    live: LiveStats,
    exit_code: i32,
    termination: Option<TerminationOutcome>,
    stragglers: Option<TerminationOutcome>,
    termination_error: Option<String>,
}

/// Build the full argv: the counter tool's args (with `{output}` replaced)
/// followed by the target program and its args, or the target alone.
fn build_command(
    counter: &CounterConfig,
    program: &Path,
    args: &[String],
    counter_output: &Path,
) -> Vec<String> {
    let mut argv = Vec::new();
    if counter.enabled {
        let output = counter_output.to_string_lossy();
        argv.push(counter.command.clone());
        argv.extend(counter.args.iter().map(|a| a.replace("{output}", &output)));
    }
    argv.push(program.to_string_lossy().into_owned());
    argv.extend(args.iter().cloned());
    argv
}

/// Exit code of a naturally finished target. Signal deaths map to 128+N.
fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 128,
    }
}

fn read_lossy(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "capture file unreadable");
            String::new()
        }
    }
}

pub struct Supervisor<'a> {
    config: &'a Config,
    markers: Markers,
    enforcer: Enforcer,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            markers: Markers::new(&config.markers),
            enforcer: Enforcer::new(&config.termination),
        }
    }

    /// Supervise one target to completion. Never fails: launch problems are
    /// reported in the returned record.
    pub async fn run(&self, target: &TargetConfig) -> RunResult {
        let args = target.resolved_args(self.config.supervisor.threads);
        match self.launch(target, &args) {
            Ok(run) => self.supervise(run).await,
            Err(e) => {
                tracing::error!(name = %target.name, error = %e, "launch failed");
                let mut command = vec![target.program.to_string_lossy().into_owned()];
                command.extend(args);
                RunResult::launch_failed(&target.name, command, &e)
            }
        }
    }

    fn launch(&self, target: &TargetConfig, args: &[String]) -> Result<SupervisedRun, LaunchError> {
        let artifacts = RunArtifacts::create().map_err(|e| LaunchError::Artifacts { source: e })?;
        let stdout = std::fs::File::create(artifacts.stdout())
            .map_err(|e| LaunchError::Artifacts { source: e })?;
        let stderr = std::fs::File::create(artifacts.stderr())
            .map_err(|e| LaunchError::Artifacts { source: e })?;

        let counter = &self.config.counter;
        let command = build_command(counter, &target.program, args, &artifacts.counter_report());
        tracing::info!(
            name = %target.name,
            command = ?command,
            "launching supervised run"
        );

        let started = Instant::now();
        let started_at = Utc::now();
        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0) // New process group so the whole tree can be signaled
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: command[0].clone(),
                source: e,
            })?;

        let pgid = child.id().ok_or(LaunchError::NoPid)? as i32;
        tracing::info!(pgid, "supervised process group started");

        Ok(SupervisedRun {
            name: target.name.clone(),
            command,
            program_name: resolver::program_name(&target.program),
            child,
            pgid,
            target_pid: pgid,
            resolved: false,
            wrapped: counter.enabled,
            started,
            started_at,
            artifacts,
        })
    }

    async fn resolve_target(&self, run: &mut SupervisedRun) {
        match resolver::resolve(run.pgid, &run.program_name).await {
            Some(pid) => {
                tracing::info!(pid, leader = run.pgid, "sampling target resolved");
                run.target_pid = pid;
                run.resolved = true;
            }
            None => {
                tracing::debug!(leader = run.pgid, "target not resolved yet, sampling degraded");
            }
        }
    }

    async fn supervise(&self, mut run: SupervisedRun) -> RunResult {
        let settings = &self.config.supervisor;
        let interval = settings.check_interval();
        let tick = settings.poll_tick();
        let mut classifier = Classifier::new(settings.confidence_threshold, settings.global_timeout());
        let mut live = LiveStats::default();
        let mut next_check = interval;
        let mut exit_status = None;

        loop {
            match run.child.try_wait() {
                Ok(Some(status)) => {
                    classifier.complete();
                    exit_status = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "failed to poll child status"),
            }

            let elapsed = run.started.elapsed();
            let phase = if elapsed >= next_check {
                while next_check <= elapsed {
                    next_check += interval;
                }
                if !run.resolved {
                    self.resolve_target(&mut run).await;
                }
                // An unresolved wrapper's own state says nothing about the target.
                let target = (run.resolved || !run.wrapped).then_some(run.target_pid);
                let started = run.started;
                classifier.tick(elapsed, || {
                    let pid = target?;
                    if let Some(usage) = sampler::resource_usage(pid) {
                        live.record_threads(usage.num_threads);
                        live.record_cpu_secs(usage.cpu_secs);
                        if let Some(mb) = usage.rss_mb {
                            live.record_memory_mb(mb);
                        }
                    }
                    let sample = sampler::sample(pid)?;
                    tracing::debug!(
                        pid,
                        at_ms = sample.taken_at.duration_since(started).as_millis() as u64,
                        running = sample.count(ThreadState::Running),
                        blocked = sample.count(ThreadState::Blocked),
                        "thread states sampled"
                    );
                    Some(sample)
                })
            } else {
                classifier.check_deadline(elapsed)
            };

            if phase.is_terminal() {
                break;
            }
            tokio::time::sleep(tick).await;
        }

        let wall = run.started.elapsed();
        let phase = classifier.phase();
        tracing::info!(
            name = %run.name,
            phase = ?phase,
            wall_secs = wall.as_secs_f64(),
            "supervision loop finished"
        );

        let mut termination = None;
        let mut stragglers = None;
        let mut termination_error = None;
        if phase.requires_termination() {
            tracing::warn!(name = %run.name, pgid = run.pgid, "terminating process group");
            match self.enforcer.terminate(run.pgid, Some(&mut run.child)).await {
                Ok(outcome) => termination = Some(outcome),
                Err(e) => {
                    tracing::error!(pgid = run.pgid, error = %e, "termination failed");
                    termination_error = Some(e.to_string());
                }
            }
        } else {
            // The leader exited on its own; reap whatever it left in the group.
            match self.enforcer.terminate(run.pgid, Some(&mut run.child)).await {
                Ok(TerminationOutcome::AlreadyGone) => {}
                Ok(outcome) => {
                    tracing::warn!(pgid = run.pgid, ?outcome, "killed processes left behind by the target");
                    stragglers = Some(outcome);
                }
                Err(e) => {
                    tracing::error!(pgid = run.pgid, error = %e, "failed to clean up process group");
                    termination_error = Some(e.to_string());
                }
            }
        }

        let exit_code = match phase {
            Phase::ConfirmedDeadlock => EXIT_DEADLOCK,
            Phase::TimedOut => EXIT_TIMEOUT,
            Phase::Completed | Phase::Running => exit_status.map(exit_code_of).unwrap_or(128),
        };

        self.finish(
            run,
            LoopOutcome {
                phase,
                streak: classifier.streak(),
                wall,
                live,
                exit_code,
                termination,
                stragglers,
                termination_error,
            },
        )
    }

    fn finish(&self, run: SupervisedRun, outcome: LoopOutcome) -> RunResult {
        let LoopOutcome {
            phase,
            streak,
            wall,
            live,
            exit_code,
            termination,
            stragglers,
            termination_error,
        } = outcome;
        let stdout = read_lossy(&run.artifacts.stdout());
        let stderr = read_lossy(&run.artifacts.stderr());

        let report = if self.config.counter.enabled {
            let report = metrics::parse_counter_report(&read_lossy(&run.artifacts.counter_report()));
            if report.is_empty() {
                tracing::warn!(name = %run.name, "counter report missing or empty, using live measurements");
            }
            report
        } else {
            Default::default()
        };

        let metrics = Metrics::derive(
            &report,
            &live,
            RunContext {
                measured_wall_secs: wall.as_secs_f64(),
                threads: self.config.supervisor.threads,
                system_cores: metrics::system_core_count(),
            },
        );

        let output = format!("{stdout}{stderr}");
        let assessment = verdict::assess(
            &RunObservation {
                phase,
                streak,
                metrics: &metrics,
                output: &output,
            },
            &self.markers,
            &self.config.corroboration,
        );

        tracing::info!(
            name = %run.name,
            exit_code,
            deadlock = assessment.deadlock_detected,
            data_race = assessment.data_race_detected,
            timed_out = assessment.timed_out,
            "run classified"
        );

        RunResult {
            name: run.name,
            command: run.command,
            started_at: run.started_at,
            exit_code,
            stdout,
            stderr,
            metrics,
            deadlock_detected: assessment.deadlock_detected,
            data_race_detected: assessment.data_race_detected,
            timed_out: assessment.timed_out,
            phase,
            verdict: assessment.verdict,
            target_pid: run.resolved.then_some(run.target_pid),
            termination,
            stragglers,
            termination_error,
            launch_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CounterConfig;

    fn config(global_timeout_secs: f64) -> Config {
        let mut config = Config::default();
        config.counter.enabled = false;
        config.supervisor.global_timeout_secs = global_timeout_secs;
        config.supervisor.poll_tick_ms = 50;
        config
    }

    fn target(program: &str, args: &[&str]) -> TargetConfig {
        TargetConfig {
            name: "test".to_string(),
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_build_command_with_counter() {
        let counter = CounterConfig::default();
        let argv = build_command(
            &counter,
            Path::new("./build/normal"),
            &["4".to_string()],
            Path::new("/tmp/run/counter.txt"),
        );
        assert_eq!(
            argv,
            vec!["perf", "stat", "-o", "/tmp/run/counter.txt", "--", "./build/normal", "4"]
        );
    }

    #[test]
    fn test_build_command_without_counter() {
        let counter = CounterConfig {
            enabled: false,
            ..Default::default()
        };
        let argv = build_command(&counter, Path::new("sleep"), &["1".to_string()], Path::new("x"));
        assert_eq!(argv, vec!["sleep", "1"]);
    }

    #[test]
    fn test_exit_code_of_signal_death() {
        let status = ExitStatus::from_raw(9); // killed by SIGKILL
        assert_eq!(exit_code_of(status), 137);
        let status = ExitStatus::from_raw(3 << 8); // exit(3)
        assert_eq!(exit_code_of(status), 3);
    }

    #[test]
    fn test_sentinels_are_distinct_and_negative() {
        let sentinels = [EXIT_DEADLOCK, EXIT_TIMEOUT, EXIT_LAUNCH_FAILED];
        assert!(sentinels.iter().all(|c| *c < 0));
        assert_ne!(EXIT_DEADLOCK, EXIT_TIMEOUT);
        assert_ne!(EXIT_TIMEOUT, EXIT_LAUNCH_FAILED);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_busy_target_exits_normally() {
        let config = config(20.0);
        let supervisor = Supervisor::new(&config);
        let result = supervisor
            .run(&target(
                "sh",
                &["-c", "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"],
            ))
            .await;

        assert_eq!(result.exit_code, 0);
        assert!(!result.deadlock_detected);
        assert!(!result.timed_out);
        assert_eq!(result.phase, Phase::Completed);
        assert!(result.metrics.wall_time > 0.0);
        assert_eq!(result.termination, None);
        assert_eq!(result.stragglers, None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_blocked_target_is_killed_as_deadlock() {
        let config = config(20.0);
        let supervisor = Supervisor::new(&config);
        let result = supervisor.run(&target("sleep", &["30"])).await;

        assert_eq!(result.exit_code, EXIT_DEADLOCK);
        assert!(result.deadlock_detected);
        assert_eq!(result.phase, Phase::ConfirmedDeadlock);
        // Three checks at 0.5s each, give or take one tick.
        assert!(result.metrics.wall_time >= 1.4, "{}", result.metrics.wall_time);
        assert!(result.metrics.wall_time < 2.5, "{}", result.metrics.wall_time);
        assert!(matches!(
            result.termination,
            Some(TerminationOutcome::Graceful | TerminationOutcome::Killed)
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_spinning_target_times_out() {
        let config = config(1.5);
        let supervisor = Supervisor::new(&config);
        let result = supervisor
            .run(&target("sh", &["-c", "while :; do :; done"]))
            .await;

        assert_eq!(result.exit_code, EXIT_TIMEOUT);
        assert!(result.timed_out);
        assert_eq!(result.phase, Phase::TimedOut);
        assert!(result.metrics.wall_time >= 1.5);
        assert!(result.metrics.wall_time < 3.0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_children_are_cleaned_up_after_exit() {
        let config = config(20.0);
        let result = Supervisor::new(&config)
            .run(&target("sh", &["-c", "sleep 30 & exit 0"]))
            .await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.phase, Phase::Completed);
        assert_eq!(result.termination, None);
        assert!(matches!(
            result.stragglers,
            Some(TerminationOutcome::Graceful | TerminationOutcome::Killed)
        ));
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let config = config(20.0);
        let result = Supervisor::new(&config)
            .run(&target("sh", &["-c", "exit 42"]))
            .await;
        assert_eq!(result.exit_code, 42);
        assert!(!result.succeeded());
        assert!(!result.deadlock_detected);
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let config = config(20.0);
        let result = Supervisor::new(&config)
            .run(&target("sh", &["-c", "echo stdout-line; echo stderr-line >&2"]))
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "stdout-line\n");
        assert_eq!(result.stderr, "stderr-line\n");
    }

    #[tokio::test]
    async fn test_output_markers_set_flags() {
        let config = config(20.0);
        let supervisor = Supervisor::new(&config);

        let race = supervisor
            .run(&target("sh", &["-c", "echo 'data race on counter'"]))
            .await;
        assert!(race.data_race_detected);
        assert!(!race.deadlock_detected);
        assert!(matches!(race.verdict, Verdict::DataRace { .. }));

        let deadlock = supervisor
            .run(&target("sh", &["-c", "echo DEADLOCK >&2"]))
            .await;
        assert!(deadlock.deadlock_detected);
        assert_eq!(deadlock.exit_code, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let config = config(20.0);
        let result = Supervisor::new(&config)
            .run(&target("nonexistent-binary-xyz", &[]))
            .await;
        assert_eq!(result.exit_code, EXIT_LAUNCH_FAILED);
        assert!(result.launch_error.unwrap().contains("failed to spawn"));
        assert!(matches!(result.verdict, Verdict::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_threads_placeholder_reaches_target() {
        let mut config = config(20.0);
        config.supervisor.threads = 7;
        let result = Supervisor::new(&config)
            .run(&target("sh", &["-c", "echo $0", "{threads}"]))
            .await;
        assert_eq!(result.stdout.trim(), "7");
    }

    #[tokio::test]
    async fn test_counter_report_is_parsed() {
        let mut config = config(20.0);
        config.counter = CounterConfig {
            enabled: true,
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "\"$0\" \"$@\"; rc=$?; printf '0.25 CPUs utilized\\n2.0 seconds time elapsed\\n0.4 seconds user\\n0.1 seconds sys\\n' > {output}; exit $rc".to_string(),
            ],
        };
        let result = Supervisor::new(&config)
            .run(&target("sh", &["-c", "exit 3"]))
            .await;

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.metrics.cpus_utilized, 0.25);
        assert_eq!(result.metrics.wall_time, 2.0);
        assert_eq!(result.metrics.cpu_time, 0.5);
        assert_eq!(result.metrics.parallelism, Some(0.25));
    }
}
