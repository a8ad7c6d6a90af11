//! Filesystem and archive helpers shared by the image, container and volume
//! subsystems.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::mount::{mount, MsFlags};
use sha2::{Digest, Sha256};

/// Creates `dir` and all missing parents. Idempotent.
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    fs::create_dir_all(dir.as_ref())
        .with_context(|| format!("ensure dir {}", dir.as_ref().display()))
}

/// Recursively copies `src` to `dst`, preserving ownership, permissions and
/// symlinks. Delegates to `cp -raf`, which already implements all the
/// attribute plumbing a rootfs copy needs.
pub fn copy_dir<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if !src.exists() {
        bail!("source {} does not exist", src.display());
    }

    let status = Command::new("cp")
        .arg("-raf")
        .arg(src)
        .arg(dst)
        .status()
        .context("spawn cp")?;
    if !status.success() {
        bail!("copy {} to {} failed", src.display(), dst.display());
    }
    Ok(())
}

/// Content hash of a directory: SHA-256 over the sorted relative paths of
/// all non-directory entries concatenated with their byte contents,
/// truncated to 12 hex characters. Renaming the directory itself does not
/// change the hash; touching any file inside does.
pub fn hash_dir<P: AsRef<Path>>(dir: P) -> Result<String> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)
        .with_context(|| format!("walk dir {}", dir.display()))?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        hasher.update(rel.to_string_lossy().as_bytes());
        let contents = fs::read(dir.join(rel))
            .with_context(|| format!("read {}", rel.display()))?;
        hasher.update(&contents);
    }

    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(12);
    Ok(digest)
}

fn collect_files(dir: &Path, base: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), base, files)?;
        } else {
            files.push(entry.path().strip_prefix(base)?.to_path_buf());
        }
    }
    Ok(())
}

/// Total size in bytes of the regular files under `dir`. Unreadable trees
/// count as zero, matching the informational use in listings.
pub fn dir_size<P: AsRef<Path>>(dir: P) -> u64 {
    fn walk(dir: &Path) -> std::io::Result<u64> {
        let mut size = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                size += walk(&entry.path())?;
            } else {
                size += entry.metadata()?.len();
            }
        }
        Ok(size)
    }
    walk(dir.as_ref()).unwrap_or(0)
}

/// Packs the *contents* of `src_dir` (not the directory itself) into a tar
/// archive at `out`, gzip-compressed when `gzip` is set.
pub fn create_archive<P: AsRef<Path>, Q: AsRef<Path>>(src_dir: P, out: Q, gzip: bool) -> Result<()> {
    let (src_dir, out) = (src_dir.as_ref(), out.as_ref());
    if !src_dir.exists() {
        bail!("source {} does not exist", src_dir.display());
    }
    if let Some(parent) = out.parent() {
        ensure_dir(parent)?;
    }

    let file = File::create(out).with_context(|| format!("create {}", out.display()))?;
    if gzip {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", src_dir).context("append archive entries")?;
        builder
            .into_inner()
            .context("finish archive")?
            .finish()
            .context("finish gzip stream")?;
    } else {
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", src_dir).context("append archive entries")?;
        builder.into_inner().context("finish archive")?;
    }
    Ok(())
}

/// Unpacks a tar / tar.gz archive into `dst_dir`, creating it if needed.
pub fn extract_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    archive: P,
    dst_dir: Q,
    gzip: bool,
) -> Result<()> {
    let (archive, dst_dir) = (archive.as_ref(), dst_dir.as_ref());
    if !archive.exists() {
        bail!("archive {} does not exist", archive.display());
    }
    ensure_dir(dst_dir)?;

    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    if gzip {
        tar::Archive::new(GzDecoder::new(file))
            .unpack(dst_dir)
            .context("extract archive")?;
    } else {
        tar::Archive::new(file)
            .unpack(dst_dir)
            .context("extract archive")?;
    }
    Ok(())
}

/// Extracts the raw bytes of a gzip'd tar archive into `dst_dir`.
pub fn extract_archive_bytes(data: &[u8], dst_dir: &Path) -> Result<()> {
    ensure_dir(dst_dir)?;
    tar::Archive::new(GzDecoder::new(data))
        .unpack(dst_dir)
        .context("extract embedded archive")?;
    Ok(())
}

/// Mounts an overlay filesystem at `merged`, stacking `lower_dirs` under a
/// writable `upper` with its scratch `work` directory.
pub fn mount_overlay(
    lower_dirs: &[PathBuf],
    upper: &Path,
    work: &Path,
    merged: &Path,
) -> Result<()> {
    let lower: Vec<String> = lower_dirs
        .iter()
        .map(|dir| dir.to_string_lossy().into_owned())
        .collect();
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.join(":"),
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .with_context(|| format!("mount overlay at {}", merged.display()))?;
    Ok(())
}

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

pub fn format_size(bytes: u64) -> String {
    match bytes {
        b if b < KB => format!("{b}B"),
        b if b < MB => format!("{:.1}KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1}MB", b as f64 / MB as f64),
        b => format!("{:.1}GB", b as f64 / GB as f64),
    }
}

pub fn format_age(t: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(t);
    match elapsed.num_seconds() {
        s if s < 60 => format!("{s} seconds ago"),
        s if s < 3600 => format!("{} minutes ago", s / 60),
        s if s < 86400 => format!("{} hours ago", s / 3600),
        s => format!("{} days ago", s / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_hash_dir_ignores_dir_name() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("renamed");
        for dir in [&a, &b] {
            fs::create_dir_all(dir.join("sub")).unwrap();
            fs::write(dir.join("top.txt"), b"one").unwrap();
            fs::write(dir.join("sub/deep.txt"), b"two").unwrap();
        }

        assert_eq!(hash_dir(&a).unwrap(), hash_dir(&b).unwrap());
    }

    #[test]
    fn test_hash_dir_tracks_content() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let dir = tmp.path().join("layer");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("f"), b"before").unwrap();
        let before = hash_dir(&dir).unwrap();

        fs::write(dir.join("f"), b"after").unwrap();
        let after = hash_dir(&dir).unwrap();

        assert_ne!(before, after);
        assert_eq!(before.len(), 12);
    }

    #[test]
    fn test_hash_dir_tracks_paths() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let dir = tmp.path().join("layer");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("f"), b"data").unwrap();
        let before = hash_dir(&dir).unwrap();

        fs::rename(dir.join("f"), dir.join("g")).unwrap();
        let after = hash_dir(&dir).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_archive_round_trip() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file.txt"), b"payload").unwrap();
        let archive = tmp.path().join("out.tar.gz");

        create_archive(&src, &archive, true).expect("create archive");
        let dst = tmp.path().join("dst");
        extract_archive(&archive, &dst, true).expect("extract archive");

        // archives are rooted at the directory contents
        let restored = fs::read(dst.join("nested/file.txt")).unwrap();
        assert_eq!(restored, b"payload");
    }

    #[test]
    fn test_copy_dir_preserves_tree() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/f"), b"x").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir(&src, &dst).expect("copy dir");

        assert_eq!(fs::read(dst.join("sub/f")).unwrap(), b"x");
    }

    #[test]
    fn test_dir_size() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        fs::write(tmp.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/b"), vec![0u8; 24]).unwrap();

        assert_eq!(dir_size(tmp.path()), 124);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(5 * MB + MB / 2), "5.5MB");
        assert_eq!(format_size(3 * GB), "3.0GB");
    }

    #[test]
    fn test_format_age() {
        let now = Utc::now();
        assert!(format_age(now).ends_with("seconds ago"));
        assert!(format_age(now - Duration::minutes(5)).starts_with("5 minutes"));
        assert!(format_age(now - Duration::hours(3)).starts_with("3 hours"));
        assert!(format_age(now - Duration::days(2)).starts_with("2 days"));
    }
}
