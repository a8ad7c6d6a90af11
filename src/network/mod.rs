//! Virtual networks. Each network is a kernel bridge with its own subnet;
//! containers join by having one end of a veth pair moved into their
//! network namespace. A default network is kept alive across invocations.

pub mod bridge;
pub mod ip;
pub mod iptables;
pub mod link;

use std::collections::HashMap;
use std::io::Write;

use anyhow::{bail, Context, Result};
use tabwriter::TabWriter;

pub use bridge::BridgeDriver;

use crate::store::{self, ResourceKind};

pub const DEFAULT_NETWORK_NAME: &str = "ducker";
pub const DEFAULT_SUBNET: &str = "172.18.0.0/16";
pub const DEFAULT_GATEWAY: &str = "172.18.0.1/16";

/// Creates the default network on first run, otherwise re-establishes its
/// bridge and NAT rules.
pub fn init() -> Result<()> {
    match find(DEFAULT_NETWORK_NAME) {
        Ok(driver) => driver.restore(),
        Err(_) => create(DEFAULT_NETWORK_NAME, DEFAULT_SUBNET, DEFAULT_GATEWAY, ""),
    }
}

pub fn create(name: &str, subnet: &str, gateway: &str, ip_range: &str) -> Result<()> {
    if find(name).is_ok() {
        bail!("network {name} already exists");
    }
    let driver = BridgeDriver::new(name, subnet, gateway, ip_range).context("create driver")?;
    driver.set_up().context("set up driver")?;
    Ok(())
}

pub fn remove(name: &str) -> Result<()> {
    if name == DEFAULT_NETWORK_NAME {
        bail!("cannot remove default network {DEFAULT_NETWORK_NAME}");
    }
    let driver = find(name)?;
    driver.tear_down()
}

pub fn list(quiet: bool) -> Result<()> {
    let mut networks = Vec::new();
    for mut driver in store::load_all::<BridgeDriver>(ResourceKind::Network)? {
        if driver.ipm.init().is_ok() {
            networks.push(driver);
        }
    }

    if quiet {
        for network in &networks {
            println!("{}", network.id);
        }
        return Ok(());
    }

    let mut writer = TabWriter::new(std::io::stdout()).padding(2);
    writeln!(writer, "NETWORK ID\tNAME\tSUBNET\tGATEWAY")?;
    for network in &networks {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            network.id, network.name, network.ipm.cidr, network.ipm.gateway
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn connect(network: &str, container_id: &str, pid: i32) -> Result<()> {
    let mut driver = find(network)?;
    driver.connect(container_id, pid)
}

pub fn disconnect(network: &str, container_id: &str) -> Result<()> {
    let mut driver = find(network)?;
    driver.disconnect(container_id)
}

pub fn container_ip(network: &str, container_id: &str) -> Result<String> {
    let driver = find(network)?;
    Ok(driver.container_ip(container_id)?.to_string())
}

/// Installs the DNAT rules publishing `ports` of a connected container.
pub fn setup_port_mappings(
    network: &str,
    container_id: &str,
    ports: &HashMap<String, String>,
) -> Result<()> {
    if ports.is_empty() {
        return Ok(());
    }
    let ip = container_ip(network, container_id).context("get container ip")?;
    iptables::setup_port_mapping(&ip, ports)
}

/// Withdraws published ports. A container that already lost its address has
/// nothing to clean.
pub fn clean_port_mappings(network: &str, container_id: &str, ports: &HashMap<String, String>) {
    if ports.is_empty() {
        return;
    }
    if let Ok(ip) = container_ip(network, container_id) {
        iptables::clean_port_mapping(&ip, ports);
    }
}

/// Loads a network by name or 12-hex ID and reconstructs its non-persistent
/// state. Name lookups verify the stored name to rule out an accidental
/// hash collision with an unrelated resource.
pub fn find(name_or_id: &str) -> Result<BridgeDriver> {
    if name_or_id.is_empty() {
        bail!("network name is empty");
    }

    let by_name = !store::is_valid_id(name_or_id);
    let network_id = if by_name {
        store::generate_id(name_or_id)
    } else {
        name_or_id.to_string()
    };

    let mut driver: BridgeDriver = store::load(ResourceKind::Network, &network_id)
        .with_context(|| format!("network {name_or_id} not found"))?;
    if by_name && driver.name != name_or_id {
        bail!("network {name_or_id} not found");
    }

    driver.ipm.init().context("init ip allocator")?;
    Ok(driver)
}
