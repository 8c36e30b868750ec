//! Shell-backed reference adapters.
//!
//! Every command runs through `sh -c` with the target and the action,
//! check or signal name exported as `ROLLGATE_*` variables. Children are
//! killed when their future is dropped, so executor timeouts and aborts
//! do not leave stray processes behind.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use rollgate_core::{Action, PreflightCheck};
use rollgate_health::{DataPoint, QueryWindow, SignalSource, SourceError, SourceFuture};
use rollgate_rollout::CommandExecutor;
use rollgate_rollout::executor::ExecFuture;
use rollgate_rollout::preflight::{PreflightProbe, ProbeFuture};

fn shell(command: &str, target: &str, params: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env("ROLLGATE_TARGET", target)
        .envs(
            params
                .iter()
                .map(|(k, v)| (format!("ROLLGATE_PARAM_{}", k.to_uppercase()), v)),
        )
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

// ── Executor ──────────────────────────────────────────────────────

/// Runs each action's `command`. Stdout becomes the success payload.
pub struct ShellExecutor;

impl CommandExecutor for ShellExecutor {
    fn execute<'a>(&'a self, target: &'a str, action: &'a Action) -> ExecFuture<'a> {
        Box::pin(async move {
            let Some(command) = action.command.as_deref() else {
                return Err(format!("action `{}` has no command", action.name));
            };
            debug!(%target, action = %action.name, %command, "running action");
            let output = shell(command, target, &action.params)
                .env("ROLLGATE_ACTION", &action.name)
                .output()
                .await
                .map_err(|e| format!("failed to spawn `{command}`: {e}"))?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                Err(format!(
                    "`{command}` exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
        })
    }
}

// ── Preflight ─────────────────────────────────────────────────────

/// A check passes when its command exits 0.
pub struct ShellProbe;

impl PreflightProbe for ShellProbe {
    fn check<'a>(&'a self, target: &'a str, check: &'a PreflightCheck) -> ProbeFuture<'a> {
        Box::pin(async move {
            let Some(command) = check.command.as_deref() else {
                return Err(format!("check `{}` has no command", check.name));
            };
            let status = shell(command, target, &check.params)
                .env("ROLLGATE_CHECK", &check.name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| format!("failed to spawn `{command}`: {e}"))?;
            Ok(status.success())
        })
    }
}

// ── Signals ───────────────────────────────────────────────────────

/// Runs the configured command for a signal and reads one number from
/// the last line of its stdout.
pub struct CommandSignalSource {
    commands: BTreeMap<String, String>,
}

impl CommandSignalSource {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self { commands }
    }
}

impl SignalSource for CommandSignalSource {
    fn query<'a>(
        &'a self,
        target: &'a str,
        signal: &'a str,
        window: QueryWindow,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            let command = self
                .commands
                .get(signal)
                .ok_or_else(|| SourceError::UnknownSignal(signal.to_string()))?;
            let output = shell(command, target, &BTreeMap::new())
                .env("ROLLGATE_SIGNAL", signal)
                .env("ROLLGATE_WINDOW_START", window.start.to_string())
                .env("ROLLGATE_WINDOW_END", window.end.to_string())
                .output()
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            if !output.status.success() {
                return Err(SourceError::Unavailable(format!(
                    "`{command}` exited with {}",
                    output.status
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
                return Ok(Vec::new());
            };
            let value: f64 = line.trim().parse().map_err(|e| SourceError::Malformed {
                signal: signal.to_string(),
                detail: format!("{line:?}: {e}"),
            })?;
            Ok(vec![DataPoint {
                timestamp: window.end,
                value,
            }])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::ActionKind;

    fn action(command: &str) -> Action {
        Action {
            name: "deploy".into(),
            kind: ActionKind::Deploy,
            command: Some(command.into()),
            params: BTreeMap::from([("version".to_string(), "v2".to_string())]),
        }
    }

    #[tokio::test]
    async fn executor_returns_stdout() {
        let out = ShellExecutor
            .execute("prod/api", &action("echo \"$ROLLGATE_TARGET $ROLLGATE_ACTION $ROLLGATE_PARAM_VERSION\""))
            .await;
        assert_eq!(out, Ok("prod/api deploy v2".to_string()));
    }

    #[tokio::test]
    async fn executor_reports_nonzero_exit() {
        let err = ShellExecutor
            .execute("prod/api", &action("echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        assert!(err.contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn executor_needs_a_command() {
        let mut action = action("true");
        action.command = None;
        assert!(ShellExecutor.execute("prod/api", &action).await.is_err());
    }

    #[tokio::test]
    async fn probe_follows_exit_status() {
        let check = |command: &str| PreflightCheck {
            name: "reachable".into(),
            description: String::new(),
            deadline: std::time::Duration::from_secs(5),
            command: Some(command.into()),
            params: BTreeMap::new(),
        };
        assert_eq!(ShellProbe.check("prod/api", &check("true")).await, Ok(true));
        assert_eq!(ShellProbe.check("prod/api", &check("false")).await, Ok(false));
    }

    fn source() -> CommandSignalSource {
        CommandSignalSource::new(BTreeMap::from([
            ("error_rate".to_string(), "echo header; echo 0.25".to_string()),
            ("latency_ms".to_string(), "echo fast".to_string()),
            ("empty".to_string(), "true".to_string()),
        ]))
    }

    const WINDOW: QueryWindow = QueryWindow {
        start: 1_000,
        end: 31_000,
    };

    #[tokio::test]
    async fn source_parses_last_line() {
        let points = source().query("prod/api", "error_rate", WINDOW).await.unwrap();
        assert_eq!(
            points,
            [DataPoint {
                timestamp: 31_000,
                value: 0.25
            }]
        );
    }

    #[tokio::test]
    async fn source_rejects_non_numeric_output() {
        let err = source().query("prod/api", "latency_ms", WINDOW).await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[tokio::test]
    async fn source_empty_output_is_no_data() {
        assert!(source().query("prod/api", "empty", WINDOW).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_unknown_signal() {
        let err = source().query("prod/api", "cpu", WINDOW).await.unwrap_err();
        assert_eq!(err, SourceError::UnknownSignal("cpu".into()));
    }
}
