use std::path::Path;

use anyhow::{bail, Result};
use clap::Parser;

use crate::image;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Load an image from a tar.gz archive
#[derive(Parser, Debug)]
pub struct Load {
    /// Read from a tar.gz file
    #[clap(short, long)]
    input: String,
}

impl Load {
    pub fn exec(&self) -> Result<()> {
        let tag = derive_tag(&self.input)?;
        image::load(Path::new(&self.input), &tag)?;
        Ok(())
    }
}

/// The image tag is the archive's file name without the suffix.
fn derive_tag(input: &str) -> Result<String> {
    if !input.ends_with(ARCHIVE_SUFFIX) {
        bail!("input file must be a tar.gz");
    }
    let name = Path::new(input)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(name.trim_end_matches(ARCHIVE_SUFFIX).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_tag_from_file_name() {
        assert_eq!(derive_tag("/tmp/a.tar.gz").unwrap(), "a");
        assert_eq!(derive_tag("alpine.tar.gz").unwrap(), "alpine");
    }

    #[test]
    fn test_derive_tag_rejects_other_suffixes() {
        assert!(derive_tag("/tmp/a.tar").is_err());
        assert!(derive_tag("image.zip").is_err());
    }
}
