use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::volume;

/// Manage volumes
#[derive(Subcommand, Debug)]
pub enum VolumeCmd {
    /// Create a volume
    Create(VolumeCreate),
    /// List volumes
    #[clap(alias = "list")]
    Ls(VolumeLs),
    /// Remove one or more volumes
    #[clap(alias = "remove")]
    Rm(VolumeRm),
    /// Display detailed information on a volume
    Inspect(VolumeInspect),
}

impl VolumeCmd {
    pub fn exec(&self) -> Result<()> {
        match self {
            VolumeCmd::Create(cmd) => cmd.exec(),
            VolumeCmd::Ls(cmd) => cmd.exec(),
            VolumeCmd::Rm(cmd) => cmd.exec(),
            VolumeCmd::Inspect(cmd) => cmd.exec(),
        }
    }
}

#[derive(Parser, Debug)]
pub struct VolumeCreate {
    /// Volume name; a random name is generated when omitted
    name: Option<String>,
}

impl VolumeCreate {
    fn exec(&self) -> Result<()> {
        let created = volume::create(self.name.as_deref().unwrap_or(""))?;
        println!("{}", created.name);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct VolumeLs {}

impl VolumeLs {
    fn exec(&self) -> Result<()> {
        volume::list()
    }
}

#[derive(Parser, Debug)]
pub struct VolumeRm {
    #[clap(required = true)]
    volumes: Vec<String>,
}

impl VolumeRm {
    fn exec(&self) -> Result<()> {
        for name in &self.volumes {
            volume::remove(name).with_context(|| format!("remove volume {name}"))?;
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct VolumeInspect {
    volume: String,
}

impl VolumeInspect {
    fn exec(&self) -> Result<()> {
        volume::inspect(&self.volume)
    }
}
