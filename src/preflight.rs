/// One-time environment checks run before a batch of supervised runs.
use crate::config::CounterConfig;
use std::process::{Command, Stdio};

/// Errors that abort the whole batch.
#[derive(Debug)]
pub enum PreflightError {
    /// The counter tool is enabled but cannot be executed.
    CounterToolMissing {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreflightError::CounterToolMissing { command, source } => write!(
                f,
                "counter tool '{command}' is not available ({source}); install it or set counter.enabled = false"
            ),
        }
    }
}

impl std::error::Error for PreflightError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PreflightError::CounterToolMissing { source, .. } => Some(source),
        }
    }
}

/// Verify the counter tool can be launched at all.
///
/// Only a spawn failure counts; a non-zero `--version` exit (some builds
/// print usage instead) still means the binary exists.
pub fn check_counter_tool(counter: &CounterConfig) -> Result<(), PreflightError> {
    if !counter.enabled {
        tracing::debug!("counter tool disabled, skipping preflight");
        return Ok(());
    }

    match Command::new(&counter.command)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => {
            tracing::debug!(command = %counter.command, ?status, "counter tool available");
            Ok(())
        }
        Err(e) => Err(PreflightError::CounterToolMissing {
            command: counter.command.clone(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(command: &str, enabled: bool) -> CounterConfig {
        CounterConfig {
            enabled,
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_counter_always_passes() {
        assert!(check_counter_tool(&counter("nonexistent-binary-xyz", false)).is_ok());
    }

    #[test]
    fn test_missing_counter_tool_is_error() {
        let err = check_counter_tool(&counter("nonexistent-binary-xyz", true)).unwrap_err();
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[test]
    fn test_present_tool_passes() {
        // `sh --version` may exit non-zero; only spawnability matters.
        assert!(check_counter_tool(&counter("sh", true)).is_ok());
    }
}
