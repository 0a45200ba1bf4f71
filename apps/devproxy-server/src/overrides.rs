//! Operator overrides that survive restarts: group promotions and conflict
//! resolutions, persisted as `state_dir/overrides.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use utoipa::ToSchema;

use devproxy_core::topology::Promotion;

use crate::remediation::save_bytes_atomic;

pub(crate) const OVERRIDES_FILE: &str = "overrides.json";

#[derive(Debug, thiserror::Error)]
pub(crate) enum OverridesError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid overrides JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Overrides {
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub promotions: Vec<Promotion>,
    /// route → winning source file
    #[serde(default)]
    pub resolutions: BTreeMap<String, String>,
}

pub(crate) struct OverridesStore {
    path: PathBuf,
    current: Mutex<Overrides>,
}

impl OverridesStore {
    /// Load from `state_dir`; a missing file means no overrides.
    pub fn load(state_dir: &Path) -> Result<Self, OverridesError> {
        let path = state_dir.join(OVERRIDES_FILE);
        let current = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| OverridesError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Overrides::default(),
            Err(source) => return Err(OverridesError::Io { path, source }),
        };
        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Overrides {
        self.current.lock().await.clone()
    }

    /// Record a promotion, replacing any earlier one for the same group.
    pub async fn set_promotion(&self, promotion: Promotion) -> Result<(), OverridesError> {
        let mut current = self.current.lock().await;
        let mut next = current.clone();
        next.promotions.retain(|p| p.base_key != promotion.base_key);
        next.promotions.push(promotion);
        self.persist(&next).await?;
        *current = next;
        Ok(())
    }

    pub async fn set_resolution(&self, route: &str, winner_file: &str) -> Result<(), OverridesError> {
        let mut current = self.current.lock().await;
        let mut next = current.clone();
        next.resolutions
            .insert(route.to_string(), winner_file.to_string());
        self.persist(&next).await?;
        *current = next;
        Ok(())
    }

    async fn persist(&self, overrides: &Overrides) -> Result<(), OverridesError> {
        let io = |source| OverridesError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(overrides)
            .map_err(|e| io(std::io::Error::other(e)))?;
        save_bytes_atomic(&self.path, &bytes).await.map_err(io)?;
        debug!(path = %self.path.display(), "overrides saved");
        Ok(())
    }
}
