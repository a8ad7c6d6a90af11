use anyhow::Result;
use clap::Parser;

use crate::container;

/// Hidden re-entry point for the container child process
#[derive(Parser, Debug)]
pub struct Init {}

impl Init {
    pub fn exec(&self) -> Result<()> {
        container::init::run()
    }
}
