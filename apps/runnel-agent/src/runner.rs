//! The agent's polling loop: fetch pending commands, claim, execute as a
//! local subprocess, report the result.
//!
//! The loop is single-worker on purpose: one command at a time per machine
//! bounds local resource use. Executed results must not be lost, so a
//! report is retried until the relay accepts it or declares the command
//! finished.

use std::process::ExitStatus;
use std::time::Duration;

use runnel_proto::{CommandReport, PendingCommand};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::client::{ClaimOutcome, RelayClient, ReportOutcome};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub poll_interval: Duration,
    pub execution_timeout: Duration,
}

pub async fn run_loop(client: RelayClient, opts: RunnerOptions) -> anyhow::Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match poll_once(&client, opts.execution_timeout).await {
            Ok(executed) => {
                backoff = INITIAL_BACKOFF;
                if executed > 0 {
                    debug!(executed, "poll cycle finished");
                }
                tokio::time::sleep(opts.poll_interval).await;
            }
            Err(err) => {
                warn!(error = %err, delay_secs = backoff.as_secs(), "poll failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// One poll cycle: returns how many commands this agent executed.
pub async fn poll_once(
    client: &RelayClient,
    execution_timeout: Duration,
) -> anyhow::Result<usize> {
    let pending = client.pending().await?;
    let mut executed = 0;
    for command in pending {
        if handle_command(client, &command, execution_timeout).await {
            executed += 1;
        }
    }
    Ok(executed)
}

/// Claim, execute, and report one command. Returns whether this agent ran it.
async fn handle_command(
    client: &RelayClient,
    command: &PendingCommand,
    execution_timeout: Duration,
) -> bool {
    match client.claim(command.command_id).await {
        Ok(ClaimOutcome::Claimed) => {}
        Ok(ClaimOutcome::AlreadyClaimed) => {
            debug!(command = command.command_id, "already claimed elsewhere, skipping");
            return false;
        }
        Err(err) => {
            // Still pending server-side; the next poll retries it.
            warn!(command = command.command_id, error = %err, "claim failed");
            return false;
        }
    }

    info!(
        command = command.command_id,
        script = %command.script_name,
        "executing command"
    );
    let report = execute_script(&command.script_content, execution_timeout).await;
    deliver_report(client, command.command_id, &report).await;
    true
}

/// Run the script under `sh -c`, capturing stdout/stderr and the exit
/// status. Failures become error payloads, never loop-level errors.
pub async fn execute_script(content: &str, timeout: Duration) -> CommandReport {
    let output = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(content)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match output {
        Err(_) => CommandReport::failure(format!(
            "execution timed out after {}s",
            timeout.as_secs()
        )),
        Ok(Err(err)) => CommandReport::failure(format!("failed to spawn script: {err}")),
        Ok(Ok(output)) => {
            if output.status.success() {
                CommandReport::success(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                CommandReport::failure(describe_failure(
                    output.status,
                    &String::from_utf8_lossy(&output.stderr),
                ))
            }
        }
    }
}

fn describe_failure(status: ExitStatus, stderr: &str) -> String {
    let code = status
        .code()
        .map_or_else(|| "killed by signal".to_string(), |c| format!("exit status {c}"));
    let stderr = stderr.trim();
    if stderr.is_empty() {
        code
    } else {
        format!("{code}: {stderr}")
    }
}

/// Push the result until the relay accepts it or tells us to stop. An
/// executed result is only discarded on an explicit `Gone`/`Rejected`
/// answer, and that discard is always logged.
async fn deliver_report(client: &RelayClient, command_id: i64, report: &CommandReport) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match client.report(command_id, report).await {
            Ok(ReportOutcome::Accepted) => {
                info!(command = command_id, success = report.is_success(), "result recorded");
                return;
            }
            Ok(ReportOutcome::Gone) => {
                warn!(
                    command = command_id,
                    "relay no longer accepts this result; discarding"
                );
                return;
            }
            Ok(ReportOutcome::Rejected) => {
                error!(
                    command = command_id,
                    "relay rejected result as coming from a non-claimant; discarding"
                );
                return;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    command = command_id,
                    error = %err,
                    delay_secs = backoff.as_secs(),
                    "result delivery failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => {
                error!(command = command_id, error = %err, "result delivery failed permanently");
                return;
            }
        }
    }
}
