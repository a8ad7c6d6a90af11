use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::container::{self, Status};

/// Remove one or more containers
#[derive(Parser, Debug)]
pub struct Rm {
    /// Force removal of a running container
    #[clap(short, long)]
    force: bool,
    /// Remove anonymous volumes associated with the container
    // accepted for CLI compatibility; anonymous volumes are not tracked
    #[clap(short, long)]
    volumes: bool,
    #[clap(required = true)]
    containers: Vec<String>,
}

impl Rm {
    pub fn exec(&self) -> Result<()> {
        for target in &self.containers {
            let mut c = container::find(target)
                .with_context(|| format!("find container {target}"))?;
            if c.status == Status::Running {
                if !self.force {
                    bail!("container {target} is running, use -f to force remove");
                }
                c.stop(0).with_context(|| format!("stop container {target}"))?;
            }
            c.remove()
                .with_context(|| format!("remove container {target}"))?;
        }
        Ok(())
    }
}
