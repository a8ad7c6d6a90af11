//! Images: content-addressed layer stacks plus a manifest of default run
//! options. Tags without an explicit version get `:latest` appended at
//! every entry point, and the canonical image ID is derived from the
//! normalized tag.

pub mod builder;
pub mod image;
pub mod recipe;

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tabwriter::TabWriter;

pub use builder::ImageBuilder;
pub use image::{Image, ImageOptions};
pub use recipe::{Instruction, Recipe};

use crate::store::{self, ResourceKind};
use crate::utils;

pub const BUILTIN_IMAGE_TAG: &str = "alpine:latest";

static BUILTIN_IMAGE: &[u8] = include_bytes!("../../assets/alpine.tar.gz");

pub fn normalize_tag(tag: &str) -> String {
    if tag.contains(':') {
        tag.to_string()
    } else {
        format!("{tag}:latest")
    }
}

pub fn find(tag_or_id: &str) -> Result<Image> {
    let image_id = if store::is_valid_id(tag_or_id) {
        tag_or_id.to_string()
    } else {
        store::generate_id(&normalize_tag(tag_or_id))
    };
    store::load(ResourceKind::Image, &image_id)
        .with_context(|| format!("image {tag_or_id} not found"))
}

/// Builds an image from the recipe found in `context_dir`.
pub fn build(tag: &str, recipe_file: &str, context_dir: &Path) -> Result<()> {
    let recipe = Recipe::parse_file(context_dir, recipe_file).context("parse recipe")?;
    let base = resolve_base_image(&recipe.base_tag).context("resolve base image")?;

    let mut builder = ImageBuilder::new(base, tag, None);
    builder.apply(&recipe.instructions).context("apply instructions")?;
    builder.build()
}

/// Creates a new image from a base image plus one extra layer directory.
/// This is the `commit` path.
pub fn create_from_layer(
    base_tag: &str,
    new_tag: &str,
    layer_dir: &Path,
    opts: ImageOptions,
) -> Result<()> {
    let base = resolve_base_image(base_tag).context("resolve base image")?;
    let mut builder = ImageBuilder::new(base, new_tag, Some(opts));
    builder.add_layer(layer_dir).context("create new layer")?;
    builder.build()
}

fn resolve_base_image(tag: &str) -> Result<Image> {
    if let Ok(image) = find(tag) {
        return Ok(image);
    }
    if normalize_tag(tag) != BUILTIN_IMAGE_TAG {
        bail!("base image {tag:?} not found, only {BUILTIN_IMAGE_TAG} supports auto-import");
    }
    load_builtin()?;
    find(BUILTIN_IMAGE_TAG)
}

/// Imports the embedded base image unless it is already present.
pub fn load_builtin() -> Result<()> {
    if find(BUILTIN_IMAGE_TAG).is_ok() {
        return Ok(());
    }

    let staging = tempfile::tempdir().context("create staging dir")?;
    utils::extract_archive_bytes(BUILTIN_IMAGE, staging.path()).context("extract builtin image")?;
    install_image_dir(staging.path(), BUILTIN_IMAGE_TAG)?;
    Ok(())
}

/// Loads an image archive under `tag`, replacing any image already stored
/// under the same ID.
pub fn load(archive: &Path, tag: &str) -> Result<Image> {
    let tag = normalize_tag(tag);
    let staging = tempfile::tempdir().context("create staging dir")?;
    utils::extract_archive(archive, staging.path(), true).context("extract image")?;
    install_image_dir(staging.path(), &tag)
}

/// Moves an unpacked image tree into the store and rewrites its manifest so
/// tag and ID match the import, whatever the archive said.
fn install_image_dir(staging: &Path, tag: &str) -> Result<Image> {
    let image_id = store::generate_id(tag);
    let image_dir = store::resource_dir(ResourceKind::Image, &image_id);
    if image_dir.exists() {
        std::fs::remove_dir_all(&image_dir).context("clear previous image")?;
    }
    utils::ensure_dir(store::root_dir(ResourceKind::Image))?;
    utils::copy_dir(staging, &image_dir).context("install image dir")?;

    let mut image: Image = store::load(ResourceKind::Image, &image_id).context("read config")?;
    image.tag = tag.to_string();
    image.id = image_id;
    image.save_config().context("save config")?;
    Ok(image)
}

pub fn save(tags: &[String], output: &Path) -> Result<()> {
    for tag in tags {
        let image = find(tag)?;
        image
            .save_archive(output)
            .with_context(|| format!("save image {tag}"))?;
    }
    Ok(())
}

pub fn remove(tags: &[String], _force: bool) -> Result<()> {
    for tag in tags {
        let image = find(tag)?;
        image
            .remove()
            .with_context(|| format!("remove image {tag}"))?;
    }
    Ok(())
}

pub fn list(show_all: bool, quiet: bool) -> Result<()> {
    let mut images = store::load_all::<Image>(ResourceKind::Image)?;
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if quiet {
        for image in &images {
            println!("{}", image.tag);
        }
        return Ok(());
    }

    if !show_all {
        images.retain(|image| !image.hidden);
    }

    let mut writer = TabWriter::new(std::io::stdout()).padding(2);
    writeln!(writer, "IMAGE TAG\tIMAGE ID\tCREATED\tSIZE")?;
    for image in &images {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            image.tag,
            image.id,
            utils::format_age(image.created_at),
            utils::format_size(image.size)
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tag_appends_latest() {
        assert_eq!(normalize_tag("alpine"), "alpine:latest");
        assert_eq!(normalize_tag("alpine:3.18"), "alpine:3.18");
    }

    #[test]
    fn test_normalize_tag_idempotent() {
        assert_eq!(
            normalize_tag(&normalize_tag("demo")),
            normalize_tag("demo")
        );
    }

    quickcheck! {
        fn prop_normalized_tags_have_version(tag: String) -> bool {
            normalize_tag(&tag).contains(':')
        }
    }
}
