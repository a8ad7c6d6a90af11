use anyhow::{Context, Result};
use clap::Parser;

use crate::container;

/// Create a new image from a container's changes
#[derive(Parser, Debug)]
pub struct Commit {
    container: String,
    tag: String,
}

impl Commit {
    pub fn exec(&self) -> Result<()> {
        let target = container::find(&self.container)
            .with_context(|| format!("find container {}", self.container))?;
        target
            .commit(&self.tag)
            .with_context(|| format!("commit container {}", self.container))
    }
}
