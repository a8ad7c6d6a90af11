use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tabwriter::TabWriter;

use crate::container::{self, Status};
use crate::utils;

/// List containers
#[derive(Parser, Debug)]
pub struct Ps {
    /// Show all containers (default shows just running)
    #[clap(short, long)]
    all: bool,
    /// Only display container IDs
    #[clap(short, long)]
    quiet: bool,
}

impl Ps {
    pub fn exec(&self) -> Result<()> {
        let mut containers = container::all()?;
        if !self.all {
            containers.retain(|c| c.live_status() == Status::Running);
        }
        containers.sort_by_key(|c| c.created_at);

        if self.quiet {
            for c in &containers {
                println!("{}", c.id);
            }
            return Ok(());
        }

        let mut writer = TabWriter::new(std::io::stdout()).padding(2);
        writeln!(writer, "CONTAINER ID\tIMAGE\tCOMMAND\tCREATED\tSTATUS\tNAMES")?;
        for c in &containers {
            let status = match c.live_status() {
                Status::Running => "running",
                Status::Exited => "exited",
            };
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}",
                c.id,
                c.image,
                c.opts.cmd.join(" "),
                utils::format_age(c.created_at),
                status,
                c.name
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}
