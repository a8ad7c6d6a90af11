use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::image;

/// Save one or more images to a tar.gz archive
#[derive(Parser, Debug)]
pub struct Save {
    /// Write to a file
    #[clap(short, long, default_value = "image.tar.gz")]
    output: PathBuf,
    #[clap(required = true)]
    images: Vec<String>,
}

impl Save {
    pub fn exec(&self) -> Result<()> {
        image::save(&self.images, &self.output)
    }
}
