//! Named volumes and ad-hoc host-path mounts. A volume is a plain data
//! directory on the host that gets bind-mounted into container rootfs
//! trees; it outlives every container that mounts it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nix::mount::{mount, MsFlags};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tabwriter::TabWriter;

use crate::store::{self, ResourceKind};
use crate::utils;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

pub fn create(name: &str) -> Result<Volume> {
    get_or_create(name, false)
}

pub fn find(name_or_id: &str) -> Result<Volume> {
    store::load(ResourceKind::Volume, name_or_id)
}

fn get_or_create(name: &str, allow_existing: bool) -> Result<Volume> {
    let name = if name.is_empty() {
        store::random_id()
    } else {
        name.to_string()
    };

    if let Ok(volume) = find(&name) {
        if allow_existing {
            return Ok(volume);
        }
        bail!("volume {name} already exists");
    }

    let volume = Volume {
        id: store::generate_id(&name),
        name: name.clone(),
        created_at: Utc::now(),
    };

    utils::ensure_dir(store::volume_data_dir(&name)).context("create volume dir")?;
    if let Err(e) = store::save(ResourceKind::Volume, &name, &volume) {
        let _ = fs::remove_dir_all(store::resource_dir(ResourceKind::Volume, &name));
        return Err(e).context("save config");
    }
    Ok(volume)
}

pub fn remove(name: &str) -> Result<()> {
    let dir = store::resource_dir(ResourceKind::Volume, name);
    fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
}

pub fn inspect(name: &str) -> Result<()> {
    let volume = find(name)?;
    let info = json!({
        "ID": volume.id,
        "Name": volume.name,
        "CreatedAt": volume.created_at.to_rfc3339(),
        "Mountpoint": store::volume_data_dir(&volume.name),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

pub fn list() -> Result<()> {
    let mut volumes = store::load_all::<Volume>(ResourceKind::Volume)?;
    volumes.sort_by_key(|volume| volume.created_at);

    let mut writer = TabWriter::new(std::io::stdout()).padding(2);
    writeln!(writer, "VOLUME ID\tVOLUME NAME\tSIZE\tCREATED")?;
    for volume in &volumes {
        let size = utils::dir_size(store::volume_data_dir(&volume.name));
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            volume.id,
            volume.name,
            utils::format_size(size),
            utils::format_age(volume.created_at)
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Bind-mounts `source` onto `guest_path` inside a container's merged dir.
/// An absolute source is a host path used verbatim; anything else names a
/// volume that is created on first use.
pub fn mount_into(source: &str, guest_path: &str, merged_dir: &Path) -> Result<()> {
    let host_path = if source.starts_with('/') {
        PathBuf::from(source)
    } else {
        get_or_create(source, true)
            .with_context(|| format!("get or create volume {source}"))?;
        store::volume_data_dir(source)
    };

    let target = guest_mount_path(merged_dir, guest_path);
    let meta = fs::metadata(&host_path)
        .with_context(|| format!("stat host path {}", host_path.display()))?;

    if meta.is_dir() {
        utils::ensure_dir(&target).context("create mount point")?;
    } else {
        if let Some(parent) = target.parent() {
            utils::ensure_dir(parent).context("create parent dir")?;
        }
        if !target.exists() {
            fs::write(&target, b"").context("create mount file")?;
        }
    }

    mount(
        Some(&host_path),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind mount {} to {}", host_path.display(), target.display()))?;
    Ok(())
}

/// The fully qualified mount point of a guest path inside a merged dir. The
/// guest path is absolute from the container's point of view, so its
/// leading slash must not clobber the merged prefix.
fn guest_mount_path(merged_dir: &Path, guest_path: &str) -> PathBuf {
    merged_dir.join(guest_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_mount_path_strips_leading_slash() {
        let merged = Path::new("/var/lib/ducker/containers/abc/merged");
        assert_eq!(
            guest_mount_path(merged, "/work/data"),
            PathBuf::from("/var/lib/ducker/containers/abc/merged/work/data")
        );
        assert_eq!(
            guest_mount_path(merged, "work"),
            PathBuf::from("/var/lib/ducker/containers/abc/merged/work")
        );
    }

    #[test]
    fn test_volume_manifest_defaults() {
        let volume: Volume =
            serde_json::from_str(r#"{"id": "0123456789ab", "name": "data"}"#).unwrap();
        assert_eq!(volume.created_at.timestamp(), 0);
    }
}
