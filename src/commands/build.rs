use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::image;

/// Build an image from a recipe file
#[derive(Parser, Debug)]
pub struct Build {
    /// Name and optionally a tag in the 'name:tag' format
    #[clap(short, long, default_value = "")]
    tag: String,
    /// Name of the recipe file inside the build context
    #[clap(short, long, default_value = "Duckerfile")]
    file: String,
    /// Build context path
    path: PathBuf,
}

impl Build {
    pub fn exec(&self) -> Result<()> {
        image::build(&self.tag, &self.file, &self.path)
    }
}
