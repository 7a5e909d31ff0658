//! Per-group serialization queue.
//!
//! Exactly one container subprocess may be live per group at a time. A
//! prompt is piped directly to a live, open standard input; otherwise it
//! fills a single pending slot and the caller is told to spawn a new
//! container. A second submit while one prompt is already pending replaces
//! it only if no subscriber has observed it yet — otherwise it is rejected.
//! There is no retry: a failed run discards its prompt after one attempt.
//!
//! Each live container gets an idle watchdog: once no output has been
//! observed for `idle_timeout`, its standard input is closed so the agent
//! can notice EOF and exit on its own; if it does not exit within a grace
//! period it is sent a terminate signal, then (after a further grace
//! period) a kill signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period between closing stdin and sending SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Result of attempting to submit a prompt to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No container was running for the group; caller must spawn one now,
    /// passing the same serialized input line as the container's stdin
    /// payload.
    Start,
    /// A live container's standard input was open; the line was written
    /// directly.
    Piped,
    /// A container is already running (or starting); the line was queued
    /// behind it.
    Queued,
    /// A prompt was already queued and its predecessor has an observing
    /// subscriber — the group is at capacity.
    Rejected,
}

struct LiveProcess {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    container_name: String,
    pid: u32,
    activity: watch::Sender<Instant>,
    idle_task: JoinHandle<()>,
}

#[derive(Default)]
struct GroupSlot {
    process: Option<LiveProcess>,
    pending: Option<String>,
    observed: bool,
}

/// Serializes container execution per group.
#[derive(Clone)]
pub struct GroupQueue {
    groups: Arc<RwLock<HashMap<String, Arc<Mutex<GroupSlot>>>>>,
    shutting_down: Arc<AtomicBool>,
    idle_timeout: Duration,
}

impl GroupQueue {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            idle_timeout,
        }
    }

    async fn slot_for(&self, group_folder: &str) -> Arc<Mutex<GroupSlot>> {
        if let Some(slot) = self.groups.read().await.get(group_folder) {
            return slot.clone();
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(group_folder.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(GroupSlot::default())))
            .clone()
    }

    /// Submit a serialized container-input line for execution against a
    /// group's container.
    pub async fn submit(&self, group_folder: &str, line: String) -> SubmitOutcome {
        if self.shutting_down.load(Ordering::SeqCst) {
            return SubmitOutcome::Rejected;
        }

        let slot = self.slot_for(group_folder).await;
        let mut s = slot.lock().await;

        if let Some(proc) = &s.process {
            match write_line(&proc.stdin, &line).await {
                Ok(()) => {
                    s.observed = false;
                    debug!(group_folder, "prompt piped to live container stdin");
                    return SubmitOutcome::Piped;
                }
                Err(err) => {
                    warn!(group_folder, error = %err, "stdin write failed, treating container as gone");
                    s.process = None;
                }
            }
        }

        if s.pending.is_none() || !s.observed {
            let was_empty = s.pending.is_none();
            if s.pending.replace(line).is_some() {
                debug!(group_folder, "pending prompt superseded, prior run unobserved");
            }
            s.observed = false;
            return if was_empty {
                SubmitOutcome::Start
            } else {
                SubmitOutcome::Queued
            };
        }

        warn!(group_folder, "rejecting submit: pending slot full and observed");
        SubmitOutcome::Rejected
    }

    /// Mark the currently running prompt for a group as observed by a
    /// subscriber — from this point a queued successor can no longer be
    /// silently superseded.
    pub async fn mark_observed(&self, group_folder: &str) {
        let slot = self.slot_for(group_folder).await;
        slot.lock().await.observed = true;
    }

    /// Must be called by the container runner as soon as the subprocess is
    /// spawned. Takes ownership of its standard input, writes
    /// `initial_line` (the serialized input that triggered this spawn) as
    /// the first line, and starts the idle watchdog. Clears whatever is in
    /// the pending slot, since the caller is now handling it directly.
    pub async fn register_process(
        &self,
        group_folder: &str,
        stdin: ChildStdin,
        container_name: String,
        pid: u32,
        initial_line: String,
    ) {
        let slot = self.slot_for(group_folder).await;
        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let (activity_tx, activity_rx) = watch::channel(Instant::now());

        let idle_task = tokio::spawn(run_idle_watchdog(
            group_folder.to_string(),
            container_name.clone(),
            pid,
            stdin.clone(),
            activity_rx,
            self.idle_timeout,
        ));

        {
            let mut s = slot.lock().await;
            s.pending = None;
            s.observed = false;
            s.process = Some(LiveProcess {
                stdin: stdin.clone(),
                container_name,
                pid,
                activity: activity_tx,
                idle_task,
            });
        }

        if let Err(err) = write_line(&stdin, &initial_line).await {
            warn!(group_folder, error = %err, "failed to write initial prompt to container stdin");
        }
    }

    /// Record that output was received from the live container, resetting
    /// its idle timer.
    pub async fn record_activity(&self, group_folder: &str) {
        let slot = self.slot_for(group_folder).await;
        let s = slot.lock().await;
        if let Some(proc) = &s.process {
            let _ = proc.activity.send(Instant::now());
        }
    }

    /// Called when a container run completes (success, error, or exit after
    /// idle closure). Returns the next pending prompt, if any, which the
    /// caller must immediately run by spawning a fresh container; otherwise
    /// the group is left idle.
    pub async fn finish_run(&self, group_folder: &str) -> Option<String> {
        let slot = self.slot_for(group_folder).await;
        let mut s = slot.lock().await;
        if let Some(proc) = s.process.take() {
            proc.idle_task.abort();
        }

        match s.pending.take() {
            Some(next) => {
                s.observed = false;
                info!(group_folder, "dequeued pending prompt for next run");
                Some(next)
            }
            None => None,
        }
    }

    pub async fn is_running(&self, group_folder: &str) -> bool {
        let slot = self.slot_for(group_folder).await;
        slot.lock().await.process.is_some()
    }

    /// Send a terminate signal to a group's live container, if any.
    /// Returns `true` if a container was running.
    pub async fn stop(&self, group_folder: &str) -> bool {
        let slot = self.slot_for(group_folder).await;
        let mut s = slot.lock().await;
        match s.process.take() {
            Some(proc) => {
                close_stdin(&proc.stdin).await;
                send_signal(proc.pid, libc::SIGTERM);
                proc.idle_task.abort();
                true
            }
            None => false,
        }
    }

    /// Graceful shutdown: stop accepting new submissions, close standard
    /// input of every live container, wait up to `timeout`, then kill
    /// anything still running.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let slots: Vec<(String, Arc<Mutex<GroupSlot>>)> = self
            .groups
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut draining = Vec::new();
        for (name, slot) in &slots {
            let s = slot.lock().await;
            if let Some(proc) = &s.process {
                close_stdin(&proc.stdin).await;
                draining.push(name.clone());
            }
        }

        if draining.is_empty() {
            return;
        }
        info!(groups = ?draining, "group queue shutting down, draining in-flight containers");
        tokio::time::sleep(timeout).await;

        for (name, slot) in slots {
            let mut s = slot.lock().await;
            if let Some(proc) = s.process.take() {
                warn!(group_folder = %name, "force killing container after drain timeout");
                send_signal(proc.pid, libc::SIGKILL);
                proc.idle_task.abort();
            }
        }
    }
}

async fn write_line(stdin: &Arc<Mutex<Option<ChildStdin>>>, line: &str) -> std::io::Result<()> {
    let mut guard = stdin.lock().await;
    let handle = match guard.as_mut() {
        Some(h) => h,
        None => return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
    };
    let result = async {
        handle.write_all(line.as_bytes()).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await
    }
    .await;
    if result.is_err() {
        *guard = None;
    }
    result
}

async fn close_stdin(stdin: &Arc<Mutex<Option<ChildStdin>>>) {
    let mut guard = stdin.lock().await;
    *guard = None;
}

fn send_signal(pid: u32, signal: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, signal);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

async fn run_idle_watchdog(
    group_folder: String,
    container_name: String,
    pid: u32,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    mut activity_rx: watch::Receiver<Instant>,
    idle_timeout: Duration,
) {
    loop {
        let last = *activity_rx.borrow();
        let elapsed = last.elapsed();
        if elapsed >= idle_timeout {
            break;
        }
        let remaining = idle_timeout - elapsed;
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            changed = activity_rx.changed() => {
                if changed.is_err() {
                    return; // sender dropped: process already reaped
                }
            }
        }
    }

    info!(group_folder, container_name, "idle timeout reached, closing stdin");
    close_stdin(&stdin).await;

    tokio::time::sleep(TERMINATE_GRACE).await;
    debug!(group_folder, container_name, "sending terminate signal after idle grace period");
    send_signal(pid, libc::SIGTERM);

    tokio::time::sleep(KILL_GRACE).await;
    debug!(group_folder, container_name, "sending kill signal after terminate grace period");
    send_signal(pid, libc::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    #[tokio::test]
    async fn first_submit_starts() {
        let q = GroupQueue::new(Duration::from_secs(60));
        assert_eq!(q.submit("team-a", "hi".into()).await, SubmitOutcome::Start);
        assert!(!q.is_running("team-a").await); // not running until registerProcess
    }

    #[tokio::test]
    async fn second_submit_queues_while_unobserved() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.submit("team-a", "first".into()).await;
        let outcome = q.submit("team-a", "second".into()).await;
        assert_eq!(outcome, SubmitOutcome::Queued);
    }

    #[tokio::test]
    async fn third_submit_supersedes_unobserved_pending() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.submit("team-a", "first".into()).await;
        q.submit("team-a", "second".into()).await;
        let outcome = q.submit("team-a", "third".into()).await;
        assert_eq!(outcome, SubmitOutcome::Queued);
    }

    #[tokio::test]
    async fn submit_rejected_once_pending_observed() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.submit("team-a", "first".into()).await;
        q.submit("team-a", "second".into()).await;
        q.mark_observed("team-a").await;
        let outcome = q.submit("team-a", "third".into()).await;
        assert_eq!(outcome, SubmitOutcome::Rejected);
    }

    #[tokio::test]
    async fn finish_run_dequeues_pending() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.submit("team-a", "first".into()).await;
        q.submit("team-a", "second".into()).await;
        let next = q.finish_run("team-a").await;
        assert_eq!(next, Some("second".to_string()));
    }

    #[tokio::test]
    async fn finish_run_with_no_pending_goes_idle() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.submit("team-a", "first".into()).await;
        let next = q.finish_run("team-a").await;
        assert!(next.is_none());
        assert!(!q.is_running("team-a").await);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submits() {
        let q = GroupQueue::new(Duration::from_secs(60));
        q.shutdown(Duration::from_millis(10)).await;
        let outcome = q.submit("team-a", "hi".into()).await;
        assert_eq!(outcome, SubmitOutcome::Rejected);
    }

    /// Uses a real `cat` subprocess in place of a container image to verify
    /// the pipe-to-live-stdin path end to end.
    #[tokio::test]
    async fn register_process_writes_pending_then_pipes_followups() {
        let q = GroupQueue::new(Duration::from_secs(60));
        let outcome = q.submit("team-a", "turn-one".into()).await;
        assert_eq!(outcome, SubmitOutcome::Start);

        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn cat");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let pid = child.id().unwrap();

        q.register_process("team-a", stdin, "test-container".into(), pid, "turn-one".into())
            .await;
        assert!(q.is_running("team-a").await);

        let outcome = q.submit("team-a", "turn-two".into()).await;
        assert_eq!(outcome, SubmitOutcome::Piped);

        let mut reader = BufReader::new(stdout).lines();
        let first = reader.next_line().await.unwrap().unwrap();
        let second = reader.next_line().await.unwrap().unwrap();
        assert_eq!(first, "turn-one");
        assert_eq!(second, "turn-two");

        q.stop("team-a").await;
        let _ = child.wait().await;
    }
}
