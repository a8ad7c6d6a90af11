use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{self, ResourceKind};
use crate::utils;

/// Default run configuration baked into an image by its build recipe and
/// inherited by containers that do not override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageOptions {
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub port: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub tag: String,
    pub id: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    /// Layer content hashes, base layers first. Each entry names a
    /// directory under the image's `layers/`.
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub run_options: ImageOptions,
}

impl Image {
    /// Absolute layer directories in stacking order.
    pub fn layer_dirs(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .map(|hash| store::image_layer_dir(&self.id, hash))
            .collect()
    }

    pub fn save_archive(&self, output: &Path) -> Result<()> {
        utils::create_archive(
            store::resource_dir(ResourceKind::Image, &self.id),
            output,
            true,
        )
    }

    /// Deletes the manifest and every layer of the image.
    pub fn remove(&self) -> Result<()> {
        let dir = store::resource_dir(ResourceKind::Image, &self.id);
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }

    pub fn save_config(&mut self) -> Result<()> {
        let dir = store::resource_dir(ResourceKind::Image, &self.id);
        utils::ensure_dir(&dir)?;
        self.size = utils::dir_size(&dir);
        store::save(ResourceKind::Image, &self.id, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let image: Image =
            serde_json::from_str(r#"{"tag": "demo:latest", "id": "0123456789ab"}"#).unwrap();

        assert!(image.layers.is_empty());
        assert_eq!(image.size, 0);
        assert!(!image.hidden);
        assert!(image.run_options.cmd.is_empty());
        assert_eq!(image.created_at.timestamp(), 0);
    }

    #[test]
    fn test_layer_dirs_follow_manifest_order() {
        let image: Image = serde_json::from_str(
            r#"{"tag": "demo:latest", "id": "0123456789ab", "layers": ["aaa", "bbb"]}"#,
        )
        .unwrap();

        let dirs = image.layer_dirs();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("0123456789ab/layers/aaa"));
        assert!(dirs[1].ends_with("0123456789ab/layers/bbb"));
    }
}
