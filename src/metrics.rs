//! Counter-report parsing and derived run metrics.
//!
//! The counter tool (`perf stat` by default) writes a plain-text report.
//! Each field we care about is described once in [`FIELD_RULES`] as a
//! pattern plus a unit conversion; everything else in the report is ignored.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Fields extracted from a counter report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    CpusUtilized,
    WallTime,
    UserTime,
    SysTime,
    TaskClock,
    Instructions,
    Cycles,
}

/// How a captured number is converted into the stored value.
#[derive(Debug, Clone, Copy)]
enum Unit {
    /// Plain number, stored as-is.
    Scalar,
    /// Seconds, stored as-is.
    Seconds,
    /// Milliseconds, converted to seconds.
    Millis,
}

struct FieldRule {
    field: Field,
    pattern: Regex,
    unit: Unit,
}

/// Declarative table of counter-report lines.
static FIELD_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    let rule = |field, pattern: &str, unit| FieldRule {
        field,
        pattern: Regex::new(pattern).unwrap(),
        unit,
    };
    vec![
        rule(Field::CpusUtilized, r"([\d.,]+)\s+CPUs utilized", Unit::Scalar),
        rule(Field::WallTime, r"([\d.,]+)\s+seconds time elapsed", Unit::Seconds),
        rule(Field::UserTime, r"([\d.,]+)\s+seconds user", Unit::Seconds),
        rule(Field::SysTime, r"([\d.,]+)\s+seconds sys", Unit::Seconds),
        rule(Field::TaskClock, r"([\d.,]+)\s+msec\s+task-clock", Unit::Millis),
        rule(Field::Instructions, r"([\d.,]+)\s+instructions(?::u)?", Unit::Scalar),
        rule(Field::Cycles, r"([\d.,]+)\s+cycles(?::u)?", Unit::Scalar),
    ]
});

/// Raw values found in a counter report. Absent lines stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterReport {
    pub cpus_utilized: Option<f64>,
    pub wall_time: Option<f64>,
    pub user_time: Option<f64>,
    pub sys_time: Option<f64>,
    pub task_clock_secs: Option<f64>,
    pub instructions: Option<f64>,
    pub cycles: Option<f64>,
}

impl CounterReport {
    fn set(&mut self, field: Field, value: f64) {
        let slot = match field {
            Field::CpusUtilized => &mut self.cpus_utilized,
            Field::WallTime => &mut self.wall_time,
            Field::UserTime => &mut self.user_time,
            Field::SysTime => &mut self.sys_time,
            Field::TaskClock => &mut self.task_clock_secs,
            Field::Instructions => &mut self.instructions,
            Field::Cycles => &mut self.cycles,
        };
        *slot = Some(value);
    }

    /// True when the report carried no recognizable line at all.
    pub fn is_empty(&self) -> bool {
        *self == CounterReport::default()
    }
}

/// Parse counter-tool text. Never fails: malformed or missing lines leave
/// their field unset.
pub fn parse_counter_report(text: &str) -> CounterReport {
    let mut report = CounterReport::default();
    for rule in FIELD_RULES.iter() {
        let Some(caps) = rule.pattern.captures(text) else {
            continue;
        };
        let raw = caps[1].replace(',', "");
        match raw.parse::<f64>() {
            Ok(value) => {
                let value = match rule.unit {
                    Unit::Scalar | Unit::Seconds => value,
                    Unit::Millis => value / 1000.0,
                };
                report.set(rule.field, value);
            }
            Err(e) => {
                tracing::debug!(
                    field = ?rule.field,
                    raw = %raw,
                    error = %e,
                    "unparseable counter value, ignoring"
                );
            }
        }
    }
    report
}

/// Aggregates of the live per-tick observations of the target process.
#[derive(Debug, Clone, Default)]
pub struct LiveStats {
    thread_counts: Vec<u64>,
    memory_mb: Vec<f64>,
    /// Latest accumulated user+sys CPU seconds seen for the target.
    last_cpu_secs: Option<f64>,
}

impl LiveStats {
    pub fn record_threads(&mut self, count: u64) {
        self.thread_counts.push(count);
    }

    pub fn record_memory_mb(&mut self, mb: f64) {
        self.memory_mb.push(mb);
    }

    pub fn record_cpu_secs(&mut self, secs: f64) {
        self.last_cpu_secs = Some(secs);
    }

    pub fn last_cpu_secs(&self) -> Option<f64> {
        self.last_cpu_secs
    }

    pub fn max_threads(&self) -> Option<u64> {
        self.thread_counts.iter().copied().max()
    }

    pub fn avg_threads(&self) -> Option<f64> {
        mean(self.thread_counts.iter().map(|&t| t as f64))
    }

    pub fn max_memory_mb(&self) -> Option<f64> {
        self.memory_mb.iter().copied().reduce(f64::max)
    }

    pub fn avg_memory_mb(&self) -> Option<f64> {
        mean(self.memory_mb.iter().copied())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Derived measurement record for one run.
///
/// Ratios are `None` whenever their denominator (or numerator) is not
/// strictly positive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub wall_time: f64,
    pub user_time: f64,
    pub sys_time: f64,
    pub cpu_time: f64,
    pub cpus_utilized: f64,
    pub task_clock_secs: Option<f64>,
    pub instructions: Option<f64>,
    pub cycles: Option<f64>,
    pub parallelism: Option<f64>,
    pub cpu_efficiency: Option<f64>,
    pub thread_efficiency: Option<f64>,
    pub cpu_percent_single_core: Option<f64>,
    /// `None` when the system core count is unknown.
    pub cpu_percent_total: Option<f64>,
    pub system_cores: Option<usize>,
    pub max_threads: Option<u64>,
    pub avg_threads: Option<f64>,
    pub max_memory_mb: Option<f64>,
    pub avg_memory_mb: Option<f64>,
}

/// Inputs for [`Metrics::derive`] that do not come from the counter report.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunContext {
    /// Wall time measured by the supervisor itself.
    pub measured_wall_secs: f64,
    /// Configured worker thread count.
    pub threads: u32,
    pub system_cores: Option<usize>,
}

impl Metrics {
    pub fn derive(report: &CounterReport, live: &LiveStats, ctx: RunContext) -> Metrics {
        let wall_time = report
            .wall_time
            .filter(|w| *w > 0.0)
            .unwrap_or(ctx.measured_wall_secs);

        let (user_time, sys_time, cpu_time) = match (report.user_time, report.sys_time) {
            (None, None) => {
                let live_cpu = live.last_cpu_secs().unwrap_or(0.0);
                (0.0, 0.0, live_cpu)
            }
            (user, sys) => {
                let user = user.unwrap_or(0.0);
                let sys = sys.unwrap_or(0.0);
                (user, sys, user + sys)
            }
        };

        let cpus_utilized = match report.cpus_utilized {
            Some(c) => c,
            None if wall_time > 0.0 && cpu_time > 0.0 => cpu_time / wall_time,
            None => 0.0,
        };

        let parallelism = ratio(cpu_time, wall_time);
        let thread_efficiency = parallelism.and_then(|p| ratio(p, ctx.threads as f64));
        let cpus_known = report.cpus_utilized.is_some() || cpus_utilized > 0.0;

        Metrics {
            wall_time,
            user_time,
            sys_time,
            cpu_time,
            cpus_utilized,
            task_clock_secs: report.task_clock_secs,
            instructions: report.instructions,
            cycles: report.cycles,
            parallelism,
            cpu_efficiency: parallelism.map(|p| p * 100.0),
            thread_efficiency,
            cpu_percent_single_core: cpus_known.then(|| cpus_utilized * 100.0),
            cpu_percent_total: if cpus_known {
                ctx.system_cores
                    .filter(|&n| n > 0)
                    .map(|n| cpus_utilized / n as f64 * 100.0)
            } else {
                None
            },
            system_cores: ctx.system_cores,
            max_threads: live.max_threads(),
            avg_threads: live.avg_threads(),
            max_memory_mb: live.max_memory_mb(),
            avg_memory_mb: live.avg_memory_mb(),
        }
    }
}

/// `num / den`, only when both are strictly positive.
fn ratio(num: f64, den: f64) -> Option<f64> {
    (num > 0.0 && den > 0.0).then(|| num / den)
}

/// Logical core count of this machine, if it can be determined.
pub fn system_core_count() -> Option<usize> {
    std::thread::available_parallelism().ok().map(|n| n.get())
}
