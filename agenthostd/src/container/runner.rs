//! Async container runner: spawns a Docker container for one turn, registers
//! the live process with the group queue, and streams parsed output to the
//! output router for the lifetime of the run.
//!
//! A run covers however many turns arrive on the same container's stdin
//! before it exits (idle timeout, explicit stop, or the agent closing the
//! loop on its own) — not just the turn that triggered the spawn.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use agenthost_core::{
    container_image, extract_output_lines, strip_internal_blocks, ContainerInput,
    ContainerOutputRecord, RouterEvent, RunOutcome, RunStatus, RuntimeKind, VolumeMount,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::mounts::{build_volume_mounts, container_name, GroupInfo};
use super::secrets::{build_container_args, read_extra_env, read_secrets};
use super::security::MountAllowlist;
use crate::output_router::OutputRouter;
use crate::queue::GroupQueue;

const CONTAINER_RUNTIME_BIN: &str = "docker";

/// Output accumulated per stream before truncation kicks in, for the log file.
const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Configuration shared by every container run.
pub struct RunConfig {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub timezone: String,
    pub allowlist: Option<MountAllowlist>,
}

/// Spawn a container for `group`, write `initial_input_line` as the first
/// stdin line, register the process with `queue` so subsequent turns can be
/// piped in, and forward parsed output to `router` until the process exits.
///
/// `initial_input_line` must already be the serialized JSON for the
/// `ContainerInput` that triggered this spawn — `GroupQueue::submit` and
/// `GroupQueue::register_process` share that same wire format, so the queue
/// and the runner agree on exactly what crosses the pipe.
pub async fn run(
    group: &GroupInfo,
    runtime: RuntimeKind,
    is_main: bool,
    initial_input: ContainerInput,
    config: &RunConfig,
    queue: &GroupQueue,
    router: &OutputRouter,
) -> anyhow::Result<RunOutcome> {
    let start = Instant::now();

    let group_dir = config.groups_dir.join(&group.folder);
    tokio::fs::create_dir_all(&group_dir).await.ok();
    let logs_dir = group_dir.join("logs");
    tokio::fs::create_dir_all(&logs_dir).await.ok();

    let mounts = build_volume_mounts(
        group,
        is_main,
        runtime,
        &config.project_root,
        &config.groups_dir,
        &config.data_dir,
        config.allowlist.as_ref(),
    );

    let name = container_name(&group.folder);
    let image = container_image(runtime);
    let container_args = build_container_args(&mounts, &name, image, &config.timezone);

    info!(
        group = %group.name,
        container_name = %name,
        mount_count = mounts.len(),
        is_main,
        runtime = runtime.as_str(),
        "spawning container agent"
    );

    let mut child = Command::new(CONTAINER_RUNTIME_BIN)
        .args(&container_args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn container: {e}"))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("container process exited before it could be registered"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("container stdin not piped"))?;

    let mut first_turn = initial_input;
    first_turn.env = read_secrets(&config.project_root);
    if let Some(container_config) = &group.container_config {
        first_turn
            .env
            .extend(read_extra_env(&container_config.extra_env_allowlist));
    }
    let first_line = serde_json::to_string(&first_turn)?;
    drop(first_turn);

    // The queue owns stdin from here on, including this very first line,
    // matching how every later turn is piped in.
    queue
        .register_process(&group.folder, stdin, name.clone(), pid, first_line)
        .await;

    let stdout = child.stdout.take().expect("stdout piped");
    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stdout_log = String::new();
    let mut stdout_truncated = false;

    let stderr = child.stderr.take().expect("stderr piped");
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stderr_log = String::new();
    let mut stderr_truncated = false;

    let mut new_session_id = None;
    let mut had_output = false;
    let mut run_error = None;

    loop {
        tokio::select! {
            line = stdout_reader.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        append_truncated(&mut stdout_log, &raw, &mut stdout_truncated, &group.name, "stdout");
                        let (records, _) = extract_output_lines(&format!("{raw}\n"));
                        for record_json in records {
                            match serde_json::from_str::<ContainerOutputRecord>(&record_json) {
                                Ok(record) => {
                                    had_output = true;
                                    queue.record_activity(&group.folder).await;
                                    handle_record(record, &group.folder, router, &mut new_session_id, &mut run_error).await;
                                }
                                Err(err) => {
                                    debug!(group = %group.name, error = %err, line = %record_json, "ignoring non-protocol stdout line");
                                }
                            }
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(err) => {
                        warn!(group = %group.name, error = %err, "error reading container stdout");
                        break;
                    }
                }
            }
            line = stderr_reader.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if !raw.trim().is_empty() {
                            debug!(container = %group.folder, "{}", raw.trim());
                        }
                        append_truncated(&mut stderr_log, &raw, &mut stderr_truncated, &group.name, "stderr");
                    }
                    Ok(None) => {} // stderr EOF, keep reading stdout
                    Err(_) => {}
                }
            }
        }
    }

    let status = child.wait().await?;
    let duration = start.elapsed();
    let exit_code = status.code();

    write_container_log(
        &logs_dir,
        &group.name,
        &name,
        duration,
        exit_code,
        had_output,
        &mounts,
        &stdout_log,
        stdout_truncated,
        &stderr_log,
        stderr_truncated,
    )
    .await;

    let outcome = if let Some(error) = run_error {
        RunOutcome {
            status: RunStatus::Error,
            new_session_id,
            error: Some(error),
        }
    } else if !status.success() {
        let tail = tail_of(&stderr_log, 200);
        error!(group = %group.name, exit_code = ?exit_code, duration_ms = duration.as_millis(), "container exited with error");
        RunOutcome {
            status: RunStatus::Error,
            new_session_id,
            error: Some(format!(
                "container exited with code {}: {}",
                exit_code.unwrap_or(-1),
                tail
            )),
        }
    } else {
        info!(group = %group.name, duration_ms = duration.as_millis(), "container run complete");
        RunOutcome {
            status: RunStatus::Success,
            new_session_id,
            error: None,
        }
    };

    Ok(outcome)
}

async fn handle_record(
    record: ContainerOutputRecord,
    group_folder: &str,
    router: &OutputRouter,
    new_session_id: &mut Option<String>,
    run_error: &mut Option<String>,
) {
    match record {
        ContainerOutputRecord::Message { text } => {
            let cleaned = strip_internal_blocks(&text);
            router
                .emit(group_folder, RouterEvent::Message { text: cleaned })
                .await;
        }
        ContainerOutputRecord::Session { session_id } => {
            *new_session_id = Some(session_id);
        }
        ContainerOutputRecord::Error { error } => {
            *run_error = Some(error.clone());
            router.emit(group_folder, RouterEvent::Error { error }).await;
        }
        ContainerOutputRecord::Done => {
            router
                .emit(
                    group_folder,
                    RouterEvent::Done {
                        session_id: new_session_id.clone(),
                    },
                )
                .await;
        }
    }
}

fn append_truncated(total: &mut String, line: &str, truncated: &mut bool, group_name: &str, stream: &str) {
    if *truncated {
        return;
    }
    let remaining = MAX_OUTPUT_SIZE.saturating_sub(total.len());
    if line.len() + 1 > remaining {
        total.push_str(&line[..remaining.min(line.len())]);
        *truncated = true;
        warn!(group = %group_name, stream, "container output truncated");
    } else {
        total.push_str(line);
        total.push('\n');
    }
}

fn tail_of(s: &str, n: usize) -> &str {
    if s.len() > n {
        &s[s.len() - n..]
    } else {
        s
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_container_log(
    logs_dir: &Path,
    group_name: &str,
    container_name: &str,
    duration: Duration,
    exit_code: Option<i32>,
    had_output: bool,
    mounts: &[VolumeMount],
    stdout: &str,
    stdout_truncated: bool,
    stderr: &str,
    stderr_truncated: bool,
) {
    let timestamp = chrono_timestamp();
    let log_file = logs_dir.join(format!("container-{timestamp}.log"));
    let is_error = exit_code.unwrap_or(0) != 0;

    let mut lines = vec![
        "=== Container Run Log ===".to_string(),
        format!("Timestamp: {timestamp}"),
        format!("Group: {group_name}"),
        format!("Container: {container_name}"),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit Code: {exit_code:?}"),
        format!("Had Output: {had_output}"),
        String::new(),
    ];

    if is_error {
        lines.push("=== Mounts ===".to_string());
        for m in mounts {
            lines.push(format!(
                "{} -> {}{}",
                m.host_path,
                m.container_path,
                if m.readonly { " (ro)" } else { "" }
            ));
        }
        lines.push(String::new());
        lines.push(format!(
            "=== Stderr{} ===",
            if stderr_truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stderr.to_string());
        lines.push(String::new());
        lines.push(format!(
            "=== Stdout{} ===",
            if stdout_truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stdout.to_string());
    } else {
        lines.push("=== Mounts ===".to_string());
        for m in mounts {
            lines.push(format!(
                "{}{}",
                m.container_path,
                if m.readonly { " (ro)" } else { "" }
            ));
        }
    }

    let content = lines.join("\n");
    if let Err(e) = tokio::fs::write(&log_file, &content).await {
        warn!(log_file = %log_file.display(), error = %e, "failed to write container log");
    } else {
        debug!(log_file = %log_file.display(), "container log written");
    }
}

fn chrono_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{:03}", now.as_secs(), now.subsec_millis())
}

/// Write task and group snapshots for a group's container to read, per the
/// fixed `snapshots/<folder>/{tasks.json,groups.json}` layout.
pub async fn write_snapshots(data_dir: &Path, group_folder: &str, tasks_json: &str, groups_json: &str) {
    let snapshot_dir = data_dir.join("snapshots").join(group_folder);
    if let Err(e) = tokio::fs::create_dir_all(&snapshot_dir).await {
        warn!(error = %e, "failed to create snapshot directory");
        return;
    }
    if let Err(e) = tokio::fs::write(snapshot_dir.join("tasks.json"), tasks_json).await {
        warn!(error = %e, "failed to write tasks snapshot");
    }
    if let Err(e) = tokio::fs::write(snapshot_dir.join("groups.json"), groups_json).await {
        warn!(error = %e, "failed to write groups snapshot");
    }
}

/// Check that the container runtime is reachable. Called once at startup;
/// a failure here is fatal.
pub async fn ensure_runtime_available() -> anyhow::Result<()> {
    let output = Command::new(CONTAINER_RUNTIME_BIN)
        .args(["info"])
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("container runtime not found: {e}"))?;

    if !output.status.success() {
        anyhow::bail!("container runtime is not running; ensure Docker is installed and started");
    }

    debug!("container runtime available");
    Ok(())
}

/// Stop any containers left over from a previous, uncleanly-terminated run.
pub async fn cleanup_orphans() {
    let output = match Command::new(CONTAINER_RUNTIME_BIN)
        .args(["ps", "--filter", "name=agenthost-", "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "failed to list orphaned containers");
            return;
        }
    };

    let names: Vec<&str> = std::str::from_utf8(&output.stdout)
        .unwrap_or("")
        .trim()
        .split('\n')
        .filter(|s| !s.is_empty())
        .collect();

    for name in &names {
        let _ = Command::new(CONTAINER_RUNTIME_BIN).args(["stop", name]).output().await;
    }

    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned containers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrono_timestamp_format() {
        let ts = chrono_timestamp();
        let parts: Vec<&str> = ts.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].parse::<u64>().is_ok());
        assert!(parts[1].parse::<u32>().is_ok());
    }

    #[test]
    fn tail_of_truncates_from_end() {
        assert_eq!(tail_of("hello world", 5), "world");
        assert_eq!(tail_of("short", 50), "short");
    }

    #[test]
    fn append_truncated_stops_growing_past_cap() {
        let mut total = String::new();
        let mut truncated = false;
        append_truncated(&mut total, "line one", &mut truncated, "g", "stdout");
        assert!(!truncated);
        assert_eq!(total, "line one\n");
    }
}
