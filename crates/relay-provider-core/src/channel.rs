use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::meta::ChannelConfig;

/// A configured upstream account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Adaptor registry key.
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    /// Origin model name to the name sent upstream.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default)]
    pub status: ChannelStatus,
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    /// Disabled by health feedback; a later success may re-enable it.
    AutoDisabled,
}

/// Feedback from one relay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelHealth {
    Healthy,
    Disable { reason: String },
    /// Keep the channel enabled but skip it until the cooldown passes.
    Cooldown(Duration),
}

/// Channel selection and health bookkeeping.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    /// A live channel serving `model` to `group`, skipping `exclude`.
    async fn select(&self, group: &str, model: &str, exclude: &[i64]) -> Option<Channel>;

    async fn get(&self, channel_id: i64) -> Option<Channel>;

    async fn report(&self, channel_id: i64, health: ChannelHealth);

    /// Distinct `(model, channel type)` pairs served to `group`, sorted by model.
    async fn models_for_group(&self, group: &str) -> Vec<(String, String)>;
}

#[derive(Debug)]
struct ChannelEntry {
    channel: Channel,
    cooldown_until: Option<Instant>,
}

impl ChannelEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.channel.status == ChannelStatus::Enabled
            && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// In-process registry: highest priority first, random among equals.
#[derive(Debug, Default)]
pub struct MemoryChannelRegistry {
    entries: RwLock<Vec<ChannelEntry>>,
}

impl MemoryChannelRegistry {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            entries: RwLock::new(
                channels
                    .into_iter()
                    .map(|channel| ChannelEntry {
                        channel,
                        cooldown_until: None,
                    })
                    .collect(),
            ),
        }
    }

    pub fn upsert(&self, channel: Channel) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match entries
            .iter_mut()
            .find(|entry| entry.channel.id == channel.id)
        {
            Some(entry) => entry.channel = channel,
            None => entries.push(ChannelEntry {
                channel,
                cooldown_until: None,
            }),
        }
    }

    pub fn status(&self, channel_id: i64) -> Option<ChannelStatus> {
        let entries = self.entries.read().ok()?;
        entries
            .iter()
            .find(|entry| entry.channel.id == channel_id)
            .map(|entry| entry.channel.status)
    }

    pub fn in_cooldown(&self, channel_id: i64) -> bool {
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        let now = Instant::now();
        entries
            .iter()
            .find(|entry| entry.channel.id == channel_id)
            .and_then(|entry| entry.cooldown_until)
            .is_some_and(|until| until > now)
    }
}

fn serves(channel: &Channel, group: &str, model: &str) -> bool {
    channel.groups.iter().any(|g| g == group) && channel.models.iter().any(|m| m == model)
}

#[async_trait]
impl ChannelRegistry for MemoryChannelRegistry {
    async fn select(&self, group: &str, model: &str, exclude: &[i64]) -> Option<Channel> {
        let entries = self.entries.read().ok()?;
        let now = Instant::now();
        let live: Vec<&ChannelEntry> = entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .filter(|entry| !exclude.contains(&entry.channel.id))
            .filter(|entry| serves(&entry.channel, group, model))
            .collect();
        let top = live.iter().map(|entry| entry.channel.priority).max()?;
        let best: Vec<&ChannelEntry> = live
            .into_iter()
            .filter(|entry| entry.channel.priority == top)
            .collect();
        best.choose(&mut rand::rng())
            .map(|entry| entry.channel.clone())
    }

    async fn get(&self, channel_id: i64) -> Option<Channel> {
        let entries = self.entries.read().ok()?;
        entries
            .iter()
            .find(|entry| entry.channel.id == channel_id)
            .map(|entry| entry.channel.clone())
    }

    async fn report(&self, channel_id: i64, health: ChannelHealth) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.channel.id == channel_id)
        else {
            return;
        };
        match health {
            ChannelHealth::Healthy => {
                entry.cooldown_until = None;
                if entry.channel.status == ChannelStatus::AutoDisabled {
                    entry.channel.status = ChannelStatus::Enabled;
                    info!(
                        event = "channel_health",
                        action = "enable",
                        channel_id,
                        channel = %entry.channel.name
                    );
                }
            }
            ChannelHealth::Disable { reason } => {
                if entry.channel.status == ChannelStatus::Enabled {
                    entry.channel.status = ChannelStatus::AutoDisabled;
                    warn!(
                        event = "channel_health",
                        action = "disable",
                        channel_id,
                        channel = %entry.channel.name,
                        reason = %reason
                    );
                }
            }
            ChannelHealth::Cooldown(duration) => {
                entry.cooldown_until = Some(Instant::now() + duration);
                info!(
                    event = "channel_health",
                    action = "cooldown",
                    channel_id,
                    channel = %entry.channel.name,
                    cooldown_secs = duration.as_secs()
                );
            }
        }
    }

    async fn models_for_group(&self, group: &str) -> Vec<(String, String)> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        let mut models: Vec<(String, String)> = Vec::new();
        for entry in entries.iter() {
            if entry.channel.status != ChannelStatus::Enabled
                || !entry.channel.groups.iter().any(|g| g == group)
            {
                continue;
            }
            for model in &entry.channel.models {
                if !models.iter().any(|(known, _)| known == model) {
                    models.push((model.clone(), entry.channel.channel_type.clone()));
                }
            }
        }
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, priority: i64) -> Channel {
        Channel {
            id,
            name: format!("ch{id}"),
            channel_type: "openai".to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: "sk".to_string(),
            models: vec!["gpt-4o".to_string()],
            groups: vec!["default".to_string()],
            model_mapping: HashMap::new(),
            priority,
            config: ChannelConfig::default(),
            status: ChannelStatus::Enabled,
        }
    }

    #[tokio::test]
    async fn highest_priority_wins_and_exclusions_apply() {
        let registry = MemoryChannelRegistry::new(vec![channel(1, 0), channel(2, 10)]);
        let picked = registry.select("default", "gpt-4o", &[]).await.expect("channel");
        assert_eq!(picked.id, 2);
        let picked = registry.select("default", "gpt-4o", &[2]).await.expect("channel");
        assert_eq!(picked.id, 1);
        assert!(registry.select("vip", "gpt-4o", &[]).await.is_none());
    }

    #[tokio::test]
    async fn disable_then_success_re_enables() {
        let registry = MemoryChannelRegistry::new(vec![channel(1, 0)]);
        registry
            .report(
                1,
                ChannelHealth::Disable {
                    reason: "invalid_api_key".to_string(),
                },
            )
            .await;
        assert_eq!(registry.status(1), Some(ChannelStatus::AutoDisabled));
        assert!(registry.select("default", "gpt-4o", &[]).await.is_none());
        registry.report(1, ChannelHealth::Healthy).await;
        assert_eq!(registry.status(1), Some(ChannelStatus::Enabled));
    }

    #[tokio::test]
    async fn cooldown_skips_without_disabling() {
        let registry = MemoryChannelRegistry::new(vec![channel(1, 0)]);
        registry
            .report(1, ChannelHealth::Cooldown(Duration::from_secs(60)))
            .await;
        assert!(registry.in_cooldown(1));
        assert_eq!(registry.status(1), Some(ChannelStatus::Enabled));
        assert!(registry.select("default", "gpt-4o", &[]).await.is_none());
    }

    #[tokio::test]
    async fn manual_disable_is_not_undone_by_success() {
        let mut ch = channel(1, 0);
        ch.status = ChannelStatus::ManuallyDisabled;
        let registry = MemoryChannelRegistry::new(vec![ch]);
        registry.report(1, ChannelHealth::Healthy).await;
        assert_eq!(registry.status(1), Some(ChannelStatus::ManuallyDisabled));
    }
}
