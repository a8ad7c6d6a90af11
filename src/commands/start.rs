use anyhow::{Context, Result};
use clap::Parser;

use crate::container;

/// Start one or more stopped containers
#[derive(Parser, Debug)]
pub struct Start {
    /// Attach STDOUT/STDERR and forward signals
    // parsed for CLI compatibility; the stored run options decide attachment
    #[clap(short, long)]
    attach: bool,
    /// Attach STDIN when --attach is used
    #[clap(short, long)]
    interactive: bool,
    #[clap(required = true)]
    containers: Vec<String>,
}

impl Start {
    pub fn exec(&self) -> Result<()> {
        for target in &self.containers {
            let mut c = container::find(target)
                .with_context(|| format!("find container {target}"))?;
            c.start()
                .with_context(|| format!("start container {target}"))?;
        }
        Ok(())
    }
}
