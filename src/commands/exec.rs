use anyhow::{Context, Result};
use clap::Parser;

use crate::container;

/// Run a command in a running container
#[derive(Parser, Debug)]
pub struct Exec {
    /// Keep STDIN open even if not attached
    #[clap(short, long)]
    interactive: bool,
    /// Detached mode: run the command without STDIN
    #[clap(short, long)]
    detach: bool,
    /// Set environment variables
    #[clap(short, long)]
    env: Vec<String>,
    /// Working directory inside the container
    #[clap(short, long)]
    workdir: Option<String>,
    container: String,
    #[clap(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

impl Exec {
    pub fn exec(&self) -> Result<()> {
        let target = container::find(&self.container)
            .with_context(|| format!("find container {}", self.container))?;
        let interactive = self.interactive || !self.detach;
        target
            .exec(
                interactive,
                &self.env,
                &self.command,
                self.workdir.as_deref().unwrap_or(""),
            )
            .with_context(|| format!("exec in container {}", self.container))
    }
}
