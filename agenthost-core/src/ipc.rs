//! IPC wire types shared between container agents and the host daemon.
//!
//! Containers write JSON files into `<dataDir>/ipc/<group>/{messages,tasks}/`.
//! The host daemon polls these directories, authorizes and applies each file,
//! then deletes it. The directory name is the only trusted identity of the
//! writer — no field inside the file is trusted for that purpose.

use serde::{Deserialize, Serialize};

/// Outbound async message from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Must be "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Target chat JID / groupId.
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    pub text: String,
    pub timestamp: Option<String>,
}

/// Task / group management command from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTask {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: String,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: String,
        #[serde(default, rename = "containerConfig")]
        container_config: Option<serde_json::Value>,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

/// Context for authorization decisions — derived from the IPC directory path,
/// never from a field inside the file itself.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    pub group_folder: String,
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_folder: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_folder;
        Self {
            group_folder,
            is_main,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn schedule_task_parses_with_defaults() {
        let json = r#"{"type":"schedule_task","prompt":"report","schedule_type":"cron","schedule_value":"0 9 * * *","targetJid":"main"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask { context_mode, target_jid, .. } => {
                assert_eq!(context_mode, "isolated");
                assert_eq!(target_jid, "main");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn register_group_parses() {
        let json = r#"{"type":"register_group","jid":"team-eng","name":"Engineering","folder":"team-eng","trigger":"!eng"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        assert!(matches!(task, IpcTask::RegisterGroup { .. }));
    }

    #[test]
    fn register_group_parses_camel_case_container_config() {
        let json = r#"{"type":"register_group","jid":"team-eng","name":"Engineering","folder":"team-eng","containerConfig":{"additionalMounts":[]}}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::RegisterGroup { container_config, .. } => {
                assert!(container_config.is_some());
            }
            _ => panic!("wrong variant"),
        }
    }
}
