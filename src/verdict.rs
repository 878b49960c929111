//! Final verdict for a run: live phase plus post-run corroboration.
//!
//! The live phase machine can miss a hang (target not resolved, hang shorter
//! than the confidence window). After the run we re-check with aggregate
//! metrics and the captured output; any single signal flags a deadlock.

use crate::classifier::Phase;
use crate::config::{CorroborationConfig, MarkerConfig};
use crate::metrics::Metrics;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::ops::Range;

/// One independent piece of deadlock evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadlockEvidence {
    /// The live sampler saw every thread blocked for consecutive checks.
    LiveSampling { consecutive_checks: u32 },
    /// Long wall time with almost no CPU consumed.
    IdleCpu { wall_time: f64, cpus_utilized: f64 },
    /// The program itself reported a deadlock.
    OutputMarker { marker: String },
    /// Timed out while staying nearly idle.
    IdleTimeout { cpus_utilized: f64 },
}

/// Typed outcome of a run, carrying what it was decided on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    DataRace { marker: String },
    Deadlock { evidence: Vec<DeadlockEvidence> },
    Timeout { wall_time: f64, cpus_utilized: f64 },
    /// The target never started; nothing was observed.
    LaunchFailed { error: String },
}

/// Everything the corroboration pass looks at.
pub struct RunObservation<'a> {
    pub phase: Phase,
    /// Streak length when the live phase machine stopped.
    pub streak: u32,
    pub metrics: &'a Metrics,
    /// Captured stdout followed by stderr.
    pub output: &'a str,
}

/// Flags and verdict derived from one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub deadlock_detected: bool,
    pub data_race_detected: bool,
    pub timed_out: bool,
    pub verdict: Verdict,
}

/// Output markers, compiled once per batch.
pub struct Markers {
    deadlock: Option<String>,
    data_race: Option<Regex>,
    data_race_clear: Option<Regex>,
    data_race_text: String,
}

fn case_insensitive(text: &str) -> Option<Regex> {
    if text.is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(text))
        .case_insensitive(true)
        .build()
        .ok()
}

impl Markers {
    pub fn new(config: &MarkerConfig) -> Markers {
        Markers {
            deadlock: (!config.deadlock.is_empty()).then(|| config.deadlock.clone()),
            data_race: case_insensitive(&config.data_race),
            data_race_clear: case_insensitive(&config.data_race_clear),
            data_race_text: config.data_race.clone(),
        }
    }

    /// Literal, case-sensitive deadlock marker.
    pub fn find_deadlock(&self, output: &str) -> Option<&str> {
        self.deadlock
            .as_deref()
            .filter(|marker| output.contains(marker))
    }

    /// Case-insensitive race marker; returns the configured marker text.
    /// Occurrences inside the all-clear line ("No data race") do not count.
    pub fn find_data_race(&self, output: &str) -> Option<&str> {
        let race = self.data_race.as_ref()?;
        let cleared: Vec<Range<usize>> = self
            .data_race_clear
            .as_ref()
            .map(|re| re.find_iter(output).map(|m| m.range()).collect())
            .unwrap_or_default();
        race.find_iter(output)
            .any(|m| {
                !cleared
                    .iter()
                    .any(|c| c.start <= m.start() && m.end() <= c.end)
            })
            .then_some(self.data_race_text.as_str())
    }
}

/// Corroborate the live phase with aggregate evidence.
pub fn assess(
    run: &RunObservation<'_>,
    markers: &Markers,
    thresholds: &CorroborationConfig,
) -> Assessment {
    let metrics = run.metrics;
    let timed_out = run.phase == Phase::TimedOut;
    let mut evidence = Vec::new();

    if run.phase == Phase::ConfirmedDeadlock {
        evidence.push(DeadlockEvidence::LiveSampling {
            consecutive_checks: run.streak,
        });
    }
    if metrics.wall_time > thresholds.idle_wall_secs && metrics.cpus_utilized < thresholds.idle_cpus
    {
        evidence.push(DeadlockEvidence::IdleCpu {
            wall_time: metrics.wall_time,
            cpus_utilized: metrics.cpus_utilized,
        });
    }
    if let Some(marker) = markers.find_deadlock(run.output) {
        evidence.push(DeadlockEvidence::OutputMarker {
            marker: marker.to_string(),
        });
    }
    if timed_out && metrics.cpus_utilized < thresholds.timeout_idle_cpus {
        evidence.push(DeadlockEvidence::IdleTimeout {
            cpus_utilized: metrics.cpus_utilized,
        });
    }

    let race_marker = markers.find_data_race(run.output);
    let deadlock_detected = !evidence.is_empty();

    if deadlock_detected && run.phase != Phase::ConfirmedDeadlock {
        tracing::info!(?evidence, "deadlock corroborated after the run");
    }

    let verdict = if deadlock_detected {
        Verdict::Deadlock { evidence }
    } else if timed_out {
        Verdict::Timeout {
            wall_time: metrics.wall_time,
            cpus_utilized: metrics.cpus_utilized,
        }
    } else if let Some(marker) = race_marker {
        Verdict::DataRace {
            marker: marker.to_string(),
        }
    } else {
        Verdict::Ok
    };

    Assessment {
        deadlock_detected,
        data_race_detected: race_marker.is_some(),
        timed_out,
        verdict,
    }
}
