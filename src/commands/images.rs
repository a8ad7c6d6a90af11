use anyhow::Result;
use clap::Parser;

use crate::image;

/// List images
#[derive(Parser, Debug)]
pub struct Images {
    /// Show all images (including hidden ones)
    #[clap(short, long)]
    all: bool,
    /// Only display image tags
    #[clap(short, long)]
    quiet: bool,
}

impl Images {
    pub fn exec(&self) -> Result<()> {
        image::list(self.all, self.quiet)
    }
}
