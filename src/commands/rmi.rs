use anyhow::Result;
use clap::Parser;

use crate::image;

/// Remove one or more images
#[derive(Parser, Debug)]
pub struct Rmi {
    /// Force removal of images
    #[clap(short, long)]
    force: bool,
    #[clap(required = true)]
    images: Vec<String>,
}

impl Rmi {
    pub fn exec(&self) -> Result<()> {
        image::remove(&self.images, self.force)
    }
}
