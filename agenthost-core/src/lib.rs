pub mod config;
pub mod container;
pub mod ipc;
pub mod persistence;
pub mod runtime;

pub use config::{AgentHostConfig, DaemonConfig, RuntimeConfig, RuntimeProfile, SchedulerConfig, load_config};
pub use container::{
    ContainerInput, ContainerOutputRecord, RouterEvent, RunOutcome, RunStatus, VolumeMount,
    container_image, extract_output_lines, runner_container_path, runner_dir_name,
    strip_internal_blocks,
};
pub use ipc::{IpcGroupContext, IpcMessage, IpcTask};
pub use persistence::{PgPool, RegisteredGroup, ScheduledTask, TaskRunLog, TaskUpdate};
pub use runtime::RuntimeKind;
