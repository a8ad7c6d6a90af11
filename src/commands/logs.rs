use anyhow::{Context, Result};
use clap::Parser;

use crate::container;

/// Fetch the logs of a container
#[derive(Parser, Debug)]
pub struct Logs {
    /// Follow log output
    #[clap(short, long)]
    follow: bool,
    /// Number of lines to show from the end of the logs
    #[clap(long, default_value_t = 100)]
    tail: usize,
    container: String,
}

impl Logs {
    pub fn exec(&self) -> Result<()> {
        let target = container::find(&self.container)
            .with_context(|| format!("find container {}", self.container))?;
        target
            .logs(self.follow, self.tail)
            .with_context(|| format!("get logs for {}", self.container))
    }
}
