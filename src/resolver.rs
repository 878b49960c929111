//! Locate the real target process beneath the counter/shell wrapper.
//!
//! The supervisor only knows the PID of the process it spawned. When the
//! target runs under a wrapper (the counter tool, a shell), the threads that
//! matter belong to a descendant. Lookup order:
//!
//! 1. `/proc`: the wrapper itself, then its descendants breadth-first,
//!    matching the target's file name against each command line.
//! 2. `ps -A -o pid=,ppid=,args=`, filtered by parent PID then command text.
//!
//! Processes that vanish mid-scan are simply not matches.

use std::collections::VecDeque;
use std::path::Path;
use tokio::process::Command;

/// How deep below the wrapper we look for the target.
const MAX_DEPTH: usize = 4;

/// One process as seen by a listing source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub cmdline: String,
}

/// The bare file name matched against command lines.
pub fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned())
}

/// Find the PID of the process running `program_name` at or below `wrapper_pid`.
///
/// The `/proc` walk runs on the blocking pool and `ps` is awaited, so the
/// poll loop never stalls on a slow listing.
pub async fn resolve(wrapper_pid: i32, program_name: &str) -> Option<i32> {
    if program_name.is_empty() {
        return None;
    }

    let from_proc = match tokio::task::spawn_blocking(proc_entries).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "/proc scan task failed");
            None
        }
    };
    if let Some(pid) = from_proc
        .as_deref()
        .and_then(|entries| find_target(entries, wrapper_pid, program_name))
    {
        tracing::debug!(wrapper_pid, pid, "resolved target via /proc");
        return Some(pid);
    }

    let entries = ps_entries().await?;
    let found = find_target(&entries, wrapper_pid, program_name);
    if let Some(pid) = found {
        tracing::debug!(wrapper_pid, pid, "resolved target via ps");
    }
    found
}

/// Search `entries` for the target: the wrapper itself first (it may have
/// exec'd the target directly), then its descendants breadth-first.
pub fn find_target(entries: &[ProcessEntry], wrapper_pid: i32, program_name: &str) -> Option<i32> {
    if let Some(wrapper) = entries.iter().find(|e| e.pid == wrapper_pid) {
        if runs_program(wrapper, program_name) {
            return Some(wrapper.pid);
        }
    }

    let mut queue = VecDeque::from([(wrapper_pid, 0usize)]);
    while let Some((parent, depth)) = queue.pop_front() {
        if depth >= MAX_DEPTH {
            continue;
        }
        let mut children: Vec<&ProcessEntry> =
            entries.iter().filter(|e| e.ppid == parent).collect();
        children.sort_by_key(|e| e.pid);
        if let Some(hit) = children.iter().find(|e| is_target(e, program_name)) {
            return Some(hit.pid);
        }
        queue.extend(children.iter().map(|e| (e.pid, depth + 1)));
    }
    None
}

/// The executable's file name is exactly `program_name`.
fn runs_program(entry: &ProcessEntry, program_name: &str) -> bool {
    entry
        .cmdline
        .split_whitespace()
        .next()
        .is_some_and(|first| program_name_of(first) == program_name)
}

/// Match for a descendant: exact executable name, or a substring of the
/// command line unless the executable is a known wrapper (whose arguments
/// name the target without being it).
fn is_target(entry: &ProcessEntry, program_name: &str) -> bool {
    let Some(first) = entry.cmdline.split_whitespace().next() else {
        return false;
    };
    let exe = program_name_of(first);
    if exe == program_name {
        return true;
    }
    if WRAPPERS.contains(&exe.as_str()) {
        return false;
    }
    entry.cmdline.contains(program_name)
}

const WRAPPERS: &[&str] = &["perf", "sh", "bash", "dash", "env", "time", "timeout"];

fn program_name_of(word: &str) -> String {
    program_name(Path::new(word))
}

#[cfg(target_os = "linux")]
fn proc_entries() -> Option<Vec<ProcessEntry>> {
    let all = match procfs::process::all_processes() {
        Ok(all) => all,
        Err(e) => {
            tracing::debug!(error = %e, "/proc unavailable for target resolution");
            return None;
        }
    };
    let entries: Vec<ProcessEntry> = all
        .flatten()
        .filter_map(|process| {
            let stat = process.stat().ok()?;
            let cmdline = process.cmdline().ok()?.join(" ");
            Some(ProcessEntry {
                pid: stat.pid,
                ppid: stat.ppid,
                cmdline,
            })
        })
        .collect();
    (!entries.is_empty()).then_some(entries)
}

#[cfg(not(target_os = "linux"))]
fn proc_entries() -> Option<Vec<ProcessEntry>> {
    None
}

async fn ps_entries() -> Option<Vec<ProcessEntry>> {
    let output = match Command::new("ps")
        .args(["-A", "-o", "pid=,ppid=,args="])
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!(error = %e, "ps unavailable for target resolution");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(status = ?output.status, "ps exited unsuccessfully");
        return None;
    }
    Some(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `pid ppid args...` lines; malformed lines are dropped.
pub fn parse_ps_output(text: &str) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            let cmdline = parts.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry { pid, ppid, cmdline })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32, ppid: i32, cmdline: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid,
            cmdline: cmdline.to_string(),
        }
    }

    #[test]
    fn test_program_name_strips_directories() {
        assert_eq!(program_name(Path::new("/work/build/deadlock_demo")), "deadlock_demo");
        assert_eq!(program_name(Path::new("normal")), "normal");
    }

    #[test]
    fn test_finds_direct_child_under_counter_tool() {
        let entries = vec![
            entry(100, 1, "perf stat -o /tmp/x/counter.txt -- ./build/deadlock_demo 4"),
            entry(101, 100, "./build/deadlock_demo 4"),
        ];
        assert_eq!(find_target(&entries, 100, "deadlock_demo"), Some(101));
    }

    #[test]
    fn test_finds_grandchild_under_shell() {
        let entries = vec![
            entry(100, 1, "perf stat -o out -- sh -c ./normal 4"),
            entry(101, 100, "sh -c ./normal 4"),
            entry(102, 101, "./normal 4"),
        ];
        assert_eq!(find_target(&entries, 100, "normal"), Some(102));
    }

    #[test]
    fn test_wrapper_that_is_target() {
        let entries = vec![entry(100, 1, "/usr/bin/sleep 30")];
        assert_eq!(find_target(&entries, 100, "sleep"), Some(100));
    }

    #[test]
    fn test_short_name_inside_wrapper_name_is_not_the_wrapper() {
        let entries = vec![
            entry(100, 1, "perf stat -o /tmp/c.txt -- ./build/f 4"),
            entry(101, 100, "./build/f 4"),
        ];
        assert_eq!(find_target(&entries, 100, "f"), Some(101));
        assert_eq!(find_target(&entries, 100, "erf"), None);

        let entries = vec![
            entry(200, 1, "/bin/sh -c ./bin 2"),
            entry(201, 200, "./bin 2"),
        ];
        assert_eq!(find_target(&entries, 200, "bin"), Some(201));
    }

    #[test]
    fn test_no_match_returns_none() {
        let entries = vec![
            entry(100, 1, "perf stat -- ./other"),
            entry(101, 100, "./other"),
        ];
        assert_eq!(find_target(&entries, 100, "normal"), None);
    }

    #[test]
    fn test_ignores_unrelated_processes() {
        let entries = vec![
            entry(100, 1, "perf stat -- ./normal"),
            entry(200, 1, "./normal"),
        ];
        assert_eq!(find_target(&entries, 100, "normal"), None);
    }

    #[test]
    fn test_first_matching_child_wins() {
        let entries = vec![
            entry(100, 1, "sh -c x"),
            entry(103, 100, "./race_demo 2"),
            entry(102, 100, "./race_demo 4"),
        ];
        assert_eq!(find_target(&entries, 100, "race_demo"), Some(102));
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut entries = vec![entry(100, 1, "sh")];
        for pid in 101..110 {
            entries.push(entry(pid, pid - 1, "sh"));
        }
        entries.push(entry(200, 109, "./deep"));
        assert_eq!(find_target(&entries, 100, "deep"), None);
    }

    #[test]
    fn test_parse_ps_output() {
        let text = "    1     0 /sbin/init\n  101   100 ./normal 4\ngarbage\n  102   x bad\n";
        let entries = parse_ps_output(text);
        assert_eq!(
            entries,
            vec![entry(1, 0, "/sbin/init"), entry(101, 100, "./normal 4")]
        );
    }

    #[tokio::test]
    async fn test_empty_program_name() {
        assert_eq!(resolve(std::process::id() as i32, "").await, None);
    }

    #[tokio::test]
    async fn test_ps_listing_includes_self() {
        let Some(entries) = ps_entries().await else {
            return; // no ps on this host
        };
        let me = std::process::id() as i32;
        assert!(entries.iter().any(|e| e.pid == me));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_resolve_live_grandchild() {
        use std::os::unix::process::CommandExt;

        let mut shell = std::process::Command::new("sh")
            .args(["-c", "sleep 5; true"])
            .process_group(0)
            .spawn()
            .unwrap();
        let shell_pid = shell.id() as i32;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        let mut found = None;
        while found.is_none() && std::time::Instant::now() < deadline {
            found = resolve(shell_pid, "sleep").await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(shell_pid),
            nix::sys::signal::Signal::SIGKILL,
        );
        shell.wait().unwrap();

        let found = found.expect("sleep child should be resolved");
        assert_ne!(found, shell_pid);
    }
}
