//! Push notification configuration storage.
//!
//! The `tasks/pushNotificationConfig/*` methods are reserved by the
//! protocol with CRUD semantics only; webhook delivery ordering and
//! retry are deliberately unspecified, so no sender lives here.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{JsonRpcError, Result};
use crate::types::{PushConfig, TaskPushConfig};

/// In-memory store of per-task push configurations.
#[derive(Debug, Default)]
pub struct PushConfigStore {
    configs: RwLock<HashMap<String, Vec<PushConfig>>>,
}

impl PushConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves or replaces a configuration; a config without an id gets
    /// one assigned.
    pub async fn save(&self, config: TaskPushConfig) -> Result<TaskPushConfig> {
        let mut push = config.push_notification_config;
        if push.id.is_none() {
            push.id = Some(uuid::Uuid::new_v4().to_string());
        }

        let mut configs = self.configs.write().await;
        let entries = configs.entry(config.task_id.clone()).or_default();
        if let Some(existing) = entries.iter_mut().find(|c| c.id == push.id) {
            *existing = push.clone();
        } else {
            entries.push(push.clone());
        }
        Ok(TaskPushConfig {
            task_id: config.task_id,
            push_notification_config: push,
        })
    }

    /// Fetches a configuration by id, or the first one when no id is
    /// given.
    pub async fn get(&self, task_id: &str, config_id: Option<&str>) -> Result<TaskPushConfig> {
        let configs = self.configs.read().await;
        let entries = configs
            .get(task_id)
            .ok_or_else(|| JsonRpcError::task_not_found(task_id))?;
        let found = match config_id {
            Some(id) => entries.iter().find(|c| c.id.as_deref() == Some(id)),
            None => entries.first(),
        };
        found
            .map(|push| TaskPushConfig {
                task_id: task_id.to_string(),
                push_notification_config: push.clone(),
            })
            .ok_or_else(|| {
                JsonRpcError::invalid_params(format!(
                    "no push configuration for task '{task_id}'"
                ))
                .into()
            })
    }

    /// Lists every configuration registered for a task.
    pub async fn list(&self, task_id: &str) -> Vec<TaskPushConfig> {
        self.configs
            .read()
            .await
            .get(task_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|push| TaskPushConfig {
                        task_id: task_id.to_string(),
                        push_notification_config: push.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deletes one configuration.
    pub async fn delete(&self, task_id: &str, config_id: &str) -> Result<()> {
        let mut configs = self.configs.write().await;
        if let Some(entries) = configs.get_mut(task_id) {
            entries.retain(|c| c.id.as_deref() != Some(config_id));
            if entries.is_empty() {
                configs.remove(task_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_assigns_id() {
        let store = PushConfigStore::new();
        let saved = store
            .save(TaskPushConfig {
                task_id: "t-1".into(),
                push_notification_config: PushConfig::new("https://hooks.example.com/cb"),
            })
            .await
            .unwrap();
        assert!(saved.push_notification_config.id.is_some());
    }

    #[tokio::test]
    async fn test_get_list_delete() {
        let store = PushConfigStore::new();
        let saved = store
            .save(TaskPushConfig {
                task_id: "t-1".into(),
                push_notification_config: PushConfig::new("https://hooks.example.com/cb"),
            })
            .await
            .unwrap();
        let id = saved.push_notification_config.id.clone().unwrap();

        let fetched = store.get("t-1", Some(&id)).await.unwrap();
        assert_eq!(fetched.push_notification_config.url, "https://hooks.example.com/cb");

        assert_eq!(store.list("t-1").await.len(), 1);
        store.delete("t-1", &id).await.unwrap();
        assert!(store.list("t-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = PushConfigStore::new();
        assert!(store.get("nope", None).await.is_err());
    }
}
