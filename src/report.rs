/// Console summary of a batch of supervised runs.
use crate::supervisor::{RunResult, EXIT_DEADLOCK, EXIT_LAUNCH_FAILED, EXIT_TIMEOUT};
use crate::verdict::Verdict;

/// Short status word for one run.
pub fn status_label(result: &RunResult) -> &'static str {
    match result.exit_code {
        0 => "okay",
        EXIT_DEADLOCK => "deadlock",
        EXIT_TIMEOUT => "timeout",
        EXIT_LAUNCH_FAILED => "no-start",
        _ => "bad",
    }
}

fn verdict_label(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Ok => "ok",
        Verdict::DataRace { .. } => "data race",
        Verdict::Deadlock { .. } => "deadlock",
        Verdict::Timeout { .. } => "timeout",
        Verdict::LaunchFailed { .. } => "launch failed",
    }
}

/// One line per run: status, name, duration, CPUs, verdict.
pub fn render_summary(results: &[RunResult]) -> String {
    let mut out = String::new();
    for result in results {
        let m = &result.metrics;
        let cpu_info = if m.cpus_utilized > 0.0 {
            format!(", CPU: {:.1} cores", m.cpus_utilized)
        } else {
            String::new()
        };
        let parallelism = m
            .parallelism
            .map(|p| format!(", parallelism: {p:.2}x"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<8} {:25} {:6.2}s{}{} [{}]\n",
            status_label(result),
            result.name,
            m.wall_time,
            cpu_info,
            parallelism,
            verdict_label(&result.verdict),
        ));
    }
    out
}

pub fn render_json(results: &[RunResult]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(results)
}
