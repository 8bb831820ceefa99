use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, RoleId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::queue::LoopMode;
use crate::error::PersistenceError;
use crate::sources::Track;

/// Durable mirror of a guild's queue. Best effort: it may lag the live
/// session by up to one snapshot interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub guild_id: GuildId,
    pub voice_channel: Option<ChannelId>,
    pub current: Option<Track>,
    /// Playback position within `current`.
    pub position: Duration,
    pub queue: Vec<Track>,
    pub volume: u8,
    pub loop_mode: LoopMode,
    pub saved_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }
}

/// Per-guild preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildPreferences {
    pub guild_id: u64,
    /// Percent, 0..=200. `None` uses the global default.
    #[serde(default)]
    pub default_volume: Option<u8>,
    #[serde(default)]
    pub dj_role_id: Option<RoleId>,
    #[serde(default)]
    pub announcement_channel_id: Option<ChannelId>,
}

impl GuildPreferences {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id: guild_id.get(),
            default_volume: None,
            dj_role_id: None,
            announcement_channel_id: None,
        }
    }
}

/// Where sessions keep their durable state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError>;

    async fn load_snapshot(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError>;

    async fn delete_snapshot(&self, guild_id: GuildId) -> Result<(), PersistenceError>;

    async fn load_preferences(&self, guild_id: GuildId) -> Result<GuildPreferences, PersistenceError>;
}

/// File storage: one JSON document per guild.
///
/// ```text
/// DATA_DIR/
///   servers/guild_<id>.json     preferences
///   snapshots/guild_<id>.json   queue snapshots
/// ```
pub struct JsonStorage {
    data_dir: PathBuf,
    preferences: DashMap<GuildId, GuildPreferences>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(data_dir.join("servers")).await?;
        fs::create_dir_all(data_dir.join("snapshots")).await?;

        info!("📁 Storage ready at {}", data_dir.display());

        let storage = Self {
            data_dir,
            preferences: DashMap::new(),
        };
        storage.load_all_preferences().await?;
        Ok(storage)
    }

    pub async fn update_preferences(&self, preferences: GuildPreferences) -> Result<(), PersistenceError> {
        let guild_id = GuildId::new(preferences.guild_id);
        write_json(&self.server_path(guild_id), &preferences).await?;
        self.preferences.insert(guild_id, preferences);
        info!("💾 Preferences updated for guild {}", guild_id);
        Ok(())
    }

    /// Guilds with a stored snapshot, used to restore sessions at start-up.
    pub async fn snapshot_guilds(&self) -> Result<Vec<GuildId>> {
        let mut guilds = Vec::new();
        let mut entries = fs::read_dir(self.data_dir.join("snapshots")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(guild_id) = guild_from_path(&entry.path()) {
                guilds.push(guild_id);
            }
        }
        Ok(guilds)
    }

    async fn load_all_preferences(&self) -> Result<()> {
        let mut entries = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(guild_id) = guild_from_path(&path) else {
                continue;
            };

            match read_json::<GuildPreferences>(&path).await {
                Ok(Some(preferences)) => {
                    self.preferences.insert(guild_id, preferences);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Couldn't load preferences for guild {}: {}", guild_id, e),
            }
        }

        if loaded > 0 {
            info!("📂 Loaded preferences for {} guilds", loaded);
        }
        Ok(())
    }

    fn server_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir.join("servers").join(format!("guild_{}.json", guild_id))
    }

    fn snapshot_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir.join("snapshots").join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl SnapshotStore for JsonStorage {
    async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        write_json(&self.snapshot_path(snapshot.guild_id), snapshot).await?;
        debug!(
            "💾 Snapshot saved for guild {} ({} queued)",
            snapshot.guild_id,
            snapshot.queue.len()
        );
        Ok(())
    }

    async fn load_snapshot(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError> {
        read_json(&self.snapshot_path(guild_id)).await
    }

    async fn delete_snapshot(&self, guild_id: GuildId) -> Result<(), PersistenceError> {
        match fs::remove_file(self.snapshot_path(guild_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_preferences(&self, guild_id: GuildId) -> Result<GuildPreferences, PersistenceError> {
        if let Some(preferences) = self.preferences.get(&guild_id) {
            return Ok(preferences.clone());
        }

        let preferences = read_json(&self.server_path(guild_id))
            .await?
            .unwrap_or_else(|| GuildPreferences::new(guild_id));
        self.preferences.insert(guild_id, preferences.clone());
        Ok(preferences)
    }
}

fn guild_from_path(path: &Path) -> Option<GuildId> {
    if path.extension().map_or(true, |ext| ext != "json") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("guild_")?
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(GuildId::new)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

/// Writes next to the target and renames, so readers never see half a file.
/// Each write gets its own temporary file; concurrent writers never share one.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("json.{}.tmp", NEXT_TMP.fetch_add(1, Ordering::Relaxed)));
    fs::write(&tmp, content).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// In-memory store for engine tests.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub struct MemoryStore {
        pub snapshots: DashMap<GuildId, QueueSnapshot>,
        pub preferences: DashMap<GuildId, GuildPreferences>,
        /// How long each save takes, like a slow disk.
        pub save_delay: parking_lot::Mutex<Duration>,
        pub saves_started: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
            self.saves_started.fetch_add(1, Ordering::SeqCst);
            let delay = *self.save_delay.lock();
            tokio::time::sleep(delay).await;
            self.snapshots.insert(snapshot.guild_id, snapshot.clone());
            Ok(())
        }

        async fn load_snapshot(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError> {
            Ok(self.snapshots.get(&guild_id).map(|s| s.clone()))
        }

        async fn delete_snapshot(&self, guild_id: GuildId) -> Result<(), PersistenceError> {
            self.snapshots.remove(&guild_id);
            Ok(())
        }

        async fn load_preferences(&self, guild_id: GuildId) -> Result<GuildPreferences, PersistenceError> {
            Ok(self
                .preferences
                .get(&guild_id)
                .map(|p| p.clone())
                .unwrap_or_else(|| GuildPreferences::new(guild_id)))
        }
    }
}
