//! Group registry: the authoritative in-memory map of groupId → metadata,
//! write-through to the persistent store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use agenthost_core::{PgPool, RegisteredGroup};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid group id: {0}")]
    InvalidId(String),
    #[error("group already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Lowercase, replace anything outside `[A-Za-z0-9_-]` with `-`, collapse
/// runs of `-`, trim leading/trailing `-`. Rejects empty, `.`, `..`.
pub fn normalize_group_id(raw: &str) -> Result<String, RegistryError> {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut prev_dash = false;
    for ch in lowered.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(RegistryError::InvalidId(raw.to_string()));
    }
    Ok(trimmed)
}

/// Router-state key prefix for per-group last-activity bookkeeping. The
/// full key is `last_activity:<folder>`.
const LAST_ACTIVITY_PREFIX: &str = "last_activity:";

/// Live group registry. `register` is write-through: it updates the
/// in-memory map, persists to the store, and creates the group's log
/// directory on disk.
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, RegisteredGroup>>,
    last_activity: RwLock<HashMap<String, String>>,
    store: Arc<PgPool>,
    groups_dir: PathBuf,
}

impl GroupRegistry {
    pub fn new(store: Arc<PgPool>, groups_dir: PathBuf) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            last_activity: RwLock::new(HashMap::new()),
            store,
            groups_dir,
        }
    }

    /// Record that a group just had activity (a turn started). Write-through
    /// to the store's `router_state` table so last-activity survives a
    /// restart, per SPEC_FULL's RouterState rehydration requirement.
    pub async fn touch(&self, folder: &str) {
        let now = crate::util::now_rfc3339();
        self.last_activity.write().await.insert(folder.to_string(), now.clone());
        let key = format!("{LAST_ACTIVITY_PREFIX}{folder}");
        if let Err(e) = self.store.set_router_state(&key, &now).await {
            warn!(folder, error = %e, "failed to persist last-activity router state");
        }
    }

    pub async fn last_activity(&self, folder: &str) -> Option<String> {
        self.last_activity.read().await.get(folder).cloned()
    }

    /// Load all registered groups, and the persisted router-state scalars
    /// (currently just per-group last-activity), into memory. Called once at
    /// startup. Returns the number of groups rehydrated.
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let loaded = self.store.get_all_registered_groups().await?;
        let count = loaded.len();
        {
            let mut groups = self.groups.write().await;
            // The store keys by jid; the in-memory registry keys by folder, so
            // re-key on insert rather than reusing the map's own key.
            for (_jid, group) in loaded {
                groups.insert(group.folder.clone(), group);
            }
        }

        let router_state = self.store.get_all_router_state().await?;
        let mut last_activity = self.last_activity.write().await;
        for (key, value) in router_state {
            if let Some(folder) = key.strip_prefix(LAST_ACTIVITY_PREFIX) {
                last_activity.insert(folder.to_string(), value);
            }
        }
        Ok(count)
    }

    /// Ensure the distinguished `main` group exists, creating it if absent.
    pub async fn ensure_main(&self, main_folder: &str) -> Result<(), RegistryError> {
        if self.exists(main_folder).await {
            return Ok(());
        }
        let group = RegisteredGroup {
            jid: main_folder.to_string(),
            name: "Main".to_string(),
            folder: main_folder.to_string(),
            trigger: String::new(),
            added_at: crate::util::now_rfc3339(),
            container_config: None,
            runtime: None,
            model: None,
        };
        self.insert(group).await?;
        info!(folder = main_folder, "main group ensured");
        Ok(())
    }

    pub async fn exists(&self, folder: &str) -> bool {
        self.groups.read().await.contains_key(folder)
    }

    pub async fn get(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups.read().await.get(folder).cloned()
    }

    pub async fn list(&self) -> Vec<RegisteredGroup> {
        self.groups.read().await.values().cloned().collect()
    }

    /// Register a new group. Fails if the folder is already taken.
    pub async fn register(&self, group: RegisteredGroup) -> Result<RegisteredGroup, RegistryError> {
        if self.exists(&group.folder).await {
            return Err(RegistryError::AlreadyExists(group.folder.clone()));
        }
        let folder = group.folder.clone();
        self.insert(group.clone()).await.map_err(|err| {
            warn!(error = %err, folder = %folder, "failed to persist new group");
            err
        })?;
        Ok(group)
    }

    /// Register a group if absent, returning the existing one otherwise
    /// (auto-registration on first chat to an unknown group).
    pub async fn get_or_register(&self, group: RegisteredGroup) -> Result<RegisteredGroup, RegistryError> {
        if let Some(existing) = self.get(&group.folder).await {
            return Ok(existing);
        }
        self.insert(group.clone()).await?;
        Ok(group)
    }

    /// Write-through insert/overwrite, unconditionally. Used by the IPC
    /// mediator's `register_group` handling, which must be idempotent on
    /// replay after a crash between persisting and deleting the inbox file.
    pub async fn upsert(&self, group: RegisteredGroup) -> Result<(), RegistryError> {
        self.insert(group).await
    }

    async fn insert(&self, group: RegisteredGroup) -> Result<(), RegistryError> {
        let log_dir = self.groups_dir.join(&group.folder).join("logs");
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| RegistryError::Storage(e.into()))?;
        self.store.set_registered_group(&group).await?;
        self.groups.write().await.insert(group.folder.clone(), group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_dashes() {
        assert_eq!(normalize_group_id("Team A").unwrap(), "team-a");
        assert_eq!(normalize_group_id("  weird!! name__ok  ").unwrap(), "weird-name__ok");
    }

    #[test]
    fn normalize_collapses_runs_of_dashes() {
        assert_eq!(normalize_group_id("a---b").unwrap(), "a-b");
        assert_eq!(normalize_group_id("--a--").unwrap(), "a");
    }

    #[test]
    fn normalize_rejects_empty_and_dots() {
        assert!(normalize_group_id("").is_err());
        assert!(normalize_group_id("...").is_err());
        assert!(normalize_group_id("!!!").is_err());
    }

    #[test]
    fn normalize_is_idempotent_routing_key() {
        let once = normalize_group_id("Team--A!!").unwrap();
        let twice = normalize_group_id(&once).unwrap();
        assert_eq!(once, twice);
    }
}
