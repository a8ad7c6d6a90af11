use anyhow::{Context, Result};
use clap::Parser;

use crate::container;

/// Stop one or more running containers
#[derive(Parser, Debug)]
pub struct Stop {
    /// Seconds to wait before killing the container
    #[clap(short, long, default_value_t = 10)]
    time: u64,
    #[clap(required = true)]
    containers: Vec<String>,
}

impl Stop {
    pub fn exec(&self) -> Result<()> {
        for target in &self.containers {
            let mut c = container::find(target)
                .with_context(|| format!("find container {target}"))?;
            c.stop(self.time)
                .with_context(|| format!("stop container {target}"))?;
        }
        Ok(())
    }
}
