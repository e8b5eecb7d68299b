//! Helm repository index loading.
//!
//! An index (`<repo>/index.yaml`) maps chart names to their published
//! versions. The loader memoizes per repository URL so a file with many
//! markers against the same repo costs one fetch per run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::changemaker::ChangerError;

/// The subset of the index schema the bot reads. Indexes carry plenty of
/// other metadata per entry; everything unknown is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelmIndex {
    #[serde(default)]
    pub entries: HashMap<String, Vec<HelmIndexEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelmIndexEntry {
    pub version: String,
}

/// Where indexes come from. The HTTP loader is the real one; tests supply a
/// canned source.
#[async_trait]
pub trait IndexSource: Send + Sync {
    async fn load_index(&self, repo_url: &str) -> Result<Arc<HelmIndex>, ChangerError>;
}

/// HTTP-backed index source with per-run memoization.
#[derive(Default)]
pub struct HelmRepoLoader {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Arc<HelmIndex>>>,
}

impl HelmRepoLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexSource for HelmRepoLoader {
    async fn load_index(&self, repo_url: &str) -> Result<Arc<HelmIndex>, ChangerError> {
        let mut cache = self.cache.lock().await;
        if let Some(index) = cache.get(repo_url) {
            return Ok(Arc::clone(index));
        }
        let url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
        debug!(url, "fetching helm index");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ChangerError::IndexStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        let text = response.text().await?;
        let index: Arc<HelmIndex> = Arc::new(serde_yaml::from_str(&text)?);
        cache.insert(repo_url.to_string(), Arc::clone(&index));
        Ok(index)
    }
}
