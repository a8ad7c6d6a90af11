//! On-disk object store. Every resource (image, container, volume, network)
//! owns a directory under the store root and describes itself with an
//! indented JSON manifest named `config.json`. Directory names are 12-hex
//! IDs derived from the resource name, so lookups never need an index file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const ROOT_ENV: &str = "DUCKER_ROOT";
const DEFAULT_ROOT: &str = "/var/lib/ducker";

pub const CONFIG_FILE: &str = "config.json";

static ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var(ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Container,
    Volume,
    Network,
}

impl ResourceKind {
    fn dir_name(&self) -> &'static str {
        match self {
            ResourceKind::Image => "images",
            ResourceKind::Container => "containers",
            ResourceKind::Volume => "volumes",
            ResourceKind::Network => "nets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Image => "image",
            ResourceKind::Container => "container",
            ResourceKind::Volume => "volume",
            ResourceKind::Network => "network",
        };
        write!(f, "{name}")
    }
}

pub fn root_dir(kind: ResourceKind) -> PathBuf {
    ROOT.join(kind.dir_name())
}

pub fn resource_dir(kind: ResourceKind, id: &str) -> PathBuf {
    root_dir(kind).join(id)
}

pub fn config_path(kind: ResourceKind, id: &str) -> PathBuf {
    resource_dir(kind, id).join(CONFIG_FILE)
}

// container paths

pub fn container_upper_dir(id: &str) -> PathBuf {
    resource_dir(ResourceKind::Container, id).join("upper")
}

pub fn container_work_dir(id: &str) -> PathBuf {
    resource_dir(ResourceKind::Container, id).join("work")
}

pub fn container_merged_dir(id: &str) -> PathBuf {
    resource_dir(ResourceKind::Container, id).join("merged")
}

pub fn container_log_path(id: &str) -> PathBuf {
    container_merged_dir(id).join("var/log/container.log")
}

// image paths

pub fn image_layers_dir(id: &str) -> PathBuf {
    resource_dir(ResourceKind::Image, id).join("layers")
}

pub fn image_layer_dir(id: &str, layer_hash: &str) -> PathBuf {
    image_layers_dir(id).join(layer_hash)
}

// volume paths (volumes are stored under their name, not their hashed ID)

pub fn volume_data_dir(name: &str) -> PathBuf {
    resource_dir(ResourceKind::Volume, name).join("data")
}

/// Loads the manifest of `kind`/`id` into the caller-chosen record type.
/// The directory name is authoritative; an `id` field inside the manifest
/// is informational and not checked here.
pub fn load<T: DeserializeOwned>(kind: ResourceKind, id: &str) -> Result<T> {
    let path = config_path(kind, id);
    if !path.exists() {
        bail!("{kind} {id} not found");
    }
    read_config(&path)
}

/// Writes the manifest of `kind`/`id` as indented JSON, truncating any
/// previous content.
pub fn save<T: Serialize>(kind: ResourceKind, id: &str, value: &T) -> Result<()> {
    write_config(&config_path(kind, id), value)
}

/// Iterates the store directory of `kind` and yields every resource whose
/// manifest deserializes. Unreadable entries are skipped, a missing store
/// root yields an empty list.
pub fn load_all<T: DeserializeOwned>(kind: ResourceKind) -> Result<Vec<T>> {
    let root = root_dir(kind);
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", root.display())),
    };

    let mut result = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str() {
            if let Ok(value) = load(kind, id) {
                result.push(value);
            }
        }
    }
    Ok(result)
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("unmarshal {}", path.display()))
}

fn write_config<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("marshal config")?;
    fs::write(path, data).with_context(|| format!("write {}", path.display()))
}

/// Derives the 12-hex resource ID for a name: the first 48 bits of the
/// name's MD5 digest. Equal names always map to equal IDs.
pub fn generate_id(name: &str) -> String {
    let digest = Md5::digest(name.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// A random 48-bit ID for resources created without a name.
pub fn random_id() -> String {
    format!("{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff)
}

pub fn is_valid_id(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Manifest {
        id: String,
        #[serde(default)]
        labels: Vec<String>,
    }

    #[test]
    fn test_generate_id_known_value() {
        // md5("alpine:latest") = 73a8e6197e0d...
        assert_eq!(generate_id("alpine:latest"), "73a8e6197e0d");
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("0123456789ab"));
        assert!(!is_valid_id("0123456789a"));
        assert!(!is_valid_id("0123456789abc"));
        assert!(!is_valid_id("0123456789aG"));
        assert!(!is_valid_id("0123456789AB"));
    }

    #[test]
    fn test_config_round_trip() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let path = tmp.path().join(CONFIG_FILE);
        let manifest = Manifest {
            id: "0123456789ab".to_string(),
            labels: vec!["a".to_string()],
        };

        write_config(&path, &manifest).expect("write config");
        let loaded: Manifest = read_config(&path).expect("read config");

        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_config_missing_fields_default() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, br#"{"id": "0123456789ab"}"#).expect("write fixture");

        let loaded: Manifest = read_config(&path).expect("read config");

        assert!(loaded.labels.is_empty());
    }

    quickcheck! {
        fn prop_generate_id_deterministic(name: String) -> bool {
            generate_id(&name) == generate_id(&name)
        }

        fn prop_generate_id_valid(name: String) -> bool {
            is_valid_id(&generate_id(&name))
        }
    }

    #[test]
    fn test_random_id_valid() {
        for _ in 0..32 {
            assert!(is_valid_id(&random_id()));
        }
    }
}
