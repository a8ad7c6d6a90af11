use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::container;
use crate::network;

/// Manage networks
#[derive(Subcommand, Debug)]
pub enum NetworkCmd {
    /// Create a new network
    Create(NetworkCreate),
    /// List networks
    #[clap(alias = "list")]
    Ls(NetworkLs),
    /// Remove one or more networks
    Rm(NetworkRm),
    /// Connect a running container to a network
    Connect(NetworkConnect),
    /// Disconnect a container from a network
    Disconnect(NetworkDisconnect),
}

impl NetworkCmd {
    pub fn exec(&self) -> Result<()> {
        match self {
            NetworkCmd::Create(cmd) => cmd.exec(),
            NetworkCmd::Ls(cmd) => cmd.exec(),
            NetworkCmd::Rm(cmd) => cmd.exec(),
            NetworkCmd::Connect(cmd) => cmd.exec(),
            NetworkCmd::Disconnect(cmd) => cmd.exec(),
        }
    }
}

#[derive(Parser, Debug)]
pub struct NetworkCreate {
    /// Subnet in CIDR format
    #[clap(long, default_value = "")]
    subnet: String,
    /// IPv4 gateway in CIDR format
    #[clap(long, default_value = "")]
    gateway: String,
    /// Allocate container IPs from a sub-range
    #[clap(long = "ip-range", default_value = "")]
    ip_range: String,
    name: String,
}

impl NetworkCreate {
    fn exec(&self) -> Result<()> {
        network::create(&self.name, &self.subnet, &self.gateway, &self.ip_range)
    }
}

#[derive(Parser, Debug)]
pub struct NetworkLs {
    /// Only display network IDs
    #[clap(short, long)]
    quiet: bool,
}

impl NetworkLs {
    fn exec(&self) -> Result<()> {
        network::list(self.quiet)
    }
}

#[derive(Parser, Debug)]
pub struct NetworkRm {
    #[clap(required = true)]
    networks: Vec<String>,
}

impl NetworkRm {
    fn exec(&self) -> Result<()> {
        for name in &self.networks {
            network::remove(name).with_context(|| format!("remove network {name}"))?;
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct NetworkConnect {
    network: String,
    container: String,
}

impl NetworkConnect {
    fn exec(&self) -> Result<()> {
        let target = container::find(&self.container).context("get container")?;
        network::connect(&self.network, &target.id, target.pid)
    }
}

#[derive(Parser, Debug)]
pub struct NetworkDisconnect {
    network: String,
    container: String,
}

impl NetworkDisconnect {
    fn exec(&self) -> Result<()> {
        let target = container::find(&self.container).context("get container")?;
        network::disconnect(&self.network, &target.id)
    }
}
