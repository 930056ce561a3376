use crate::{archive::TitleStore, error::AppError};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};
use teloxide::types::UserId;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A JSON file mirrored in memory. Updates become visible only after they reach disk.
pub struct JsonDocument<T> {
    path: PathBuf,
    state: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send,
{
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(event = "json_store_created", path = %path.display());
                T::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AppError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = f(&mut next);
        persist(&self.path, &next).await?;
        *state = next;
        Ok(result)
    }
}

async fn persist<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(event = "json_store_persisted", path = %path.display());
    Ok(())
}

pub struct JsonTitleStore {
    doc: JsonDocument<BTreeSet<String>>,
}

impl JsonTitleStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        Ok(Self {
            doc: JsonDocument::open(path).await?,
        })
    }
}

#[async_trait]
impl TitleStore for JsonTitleStore {
    async fn claim(&self, title: &str) -> Result<bool, AppError> {
        if self.doc.read(|titles| titles.contains(title)).await {
            return Ok(false);
        }
        self.doc.update(|titles| titles.insert(title.to_string())).await
    }

    async fn release(&self, title: &str) -> Result<(), AppError> {
        self.doc.update(|titles| titles.remove(title)).await?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Telegram file id of the custom thumbnail photo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl UserSettings {
    fn is_empty(&self) -> bool {
        self.caption.is_none() && self.thumbnail.is_none()
    }
}

/// Per-user rename preferences.
pub struct SettingsStore {
    doc: JsonDocument<HashMap<u64, UserSettings>>,
}

impl SettingsStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        Ok(Self {
            doc: JsonDocument::open(path).await?,
        })
    }

    pub async fn get(&self, user: UserId) -> UserSettings {
        self.doc
            .read(|all| all.get(&user.0).cloned().unwrap_or_default())
            .await
    }

    pub async fn set_caption(&self, user: UserId, caption: Option<String>) -> Result<(), AppError> {
        self.modify(user, |settings| settings.caption = caption).await
    }

    pub async fn set_thumbnail(&self, user: UserId, file_id: Option<String>) -> Result<(), AppError> {
        self.modify(user, |settings| settings.thumbnail = file_id).await
    }

    async fn modify(&self, user: UserId, f: impl FnOnce(&mut UserSettings)) -> Result<(), AppError> {
        self.doc
            .update(|all| {
                let settings = all.entry(user.0).or_default();
                f(settings);
                if settings.is_empty() {
                    all.remove(&user.0);
                }
            })
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub chat_id: i64,
    pub message_id: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub protect: bool,
    pub items: Vec<StoredMessage>,
}

/// Manifests behind `BATCH-<key>` deep links.
pub struct BatchStore {
    doc: JsonDocument<HashMap<String, BatchManifest>>,
}

impl BatchStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        Ok(Self {
            doc: JsonDocument::open(path).await?,
        })
    }

    pub async fn insert(&self, manifest: BatchManifest) -> Result<String, AppError> {
        self.doc
            .update(|all| {
                let key = loop {
                    let candidate: String = rand::thread_rng()
                        .sample_iter(&Alphanumeric)
                        .take(12)
                        .map(char::from)
                        .collect();
                    if !all.contains_key(&candidate) {
                        break candidate;
                    }
                };
                all.insert(key.clone(), manifest);
                key
            })
            .await
    }

    pub async fn get(&self, key: &str) -> Option<BatchManifest> {
        self.doc.read(|all| all.get(key).cloned()).await
    }
}
