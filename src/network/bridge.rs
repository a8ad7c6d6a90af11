//! Bridge network driver. The serialized record (allocator state plus the
//! container->CIDR map) lives in the network's manifest; bridge and veth
//! kernel handles are reconstructed from the ID on every load.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::network::ip::{parse_cidr_addr, IpAllocator};
use crate::network::iptables;
use crate::network::link::Netlink;
use crate::store::{self, ResourceKind};
use crate::utils;

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeDriver {
    pub id: String,
    pub name: String,
    pub ipm: IpAllocator,
    #[serde(default)]
    pub container_ips: HashMap<String, String>,
}

pub fn bridge_name(network_id: &str) -> String {
    format!("br-{}", &network_id[..6])
}

/// Host-side and container-side interface names for a container.
pub fn veth_names(container_id: &str) -> (String, String) {
    let short = &container_id[..6];
    (format!("veth-{short}"), format!("ceth-{short}"))
}

impl BridgeDriver {
    pub fn new(name: &str, subnet: &str, gateway: &str, ip_range: &str) -> Result<Self> {
        let id = store::generate_id(name);
        utils::ensure_dir(store::resource_dir(ResourceKind::Network, &id))?;
        let ipm = IpAllocator::new(subnet, ip_range, gateway)?;
        Ok(Self {
            id,
            name: name.to_string(),
            ipm,
            container_ips: HashMap::new(),
        })
    }

    pub fn bridge_name(&self) -> String {
        bridge_name(&self.id)
    }

    /// Creates the bridge, assigns the gateway address, installs the NAT
    /// rules and persists the record.
    pub fn set_up(&self) -> Result<()> {
        let mut nl = Netlink::new()?;
        self.create_bridge_link(&mut nl).context("create bridge")?;
        if let Err(e) = self.setup_nat() {
            let _ = nl.delete_link(&self.bridge_name());
            return Err(e).context("setup nat");
        }
        self.save_config()
    }

    /// Re-creates the bridge if it disappeared (for example after a reboot)
    /// and reinstalls the NAT rules, deleting stale copies first so repeated
    /// restores never stack duplicates.
    pub fn restore(&self) -> Result<()> {
        let mut nl = Netlink::new()?;
        if !nl.link_exists(&self.bridge_name()) {
            self.create_bridge_link(&mut nl).context("restore bridge")?;
        }
        self.clean_nat();
        self.setup_nat().context("restore nat")?;
        Ok(())
    }

    pub fn tear_down(&self) -> Result<()> {
        self.clean_nat();
        let mut nl = Netlink::new()?;
        nl.delete_link(&self.bridge_name()).context("delete bridge")?;
        let dir = store::resource_dir(ResourceKind::Network, &self.id);
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }

    fn create_bridge_link(&self, nl: &mut Netlink) -> Result<()> {
        let name = self.bridge_name();
        nl.create_bridge(&name)?;

        let gateway: Ipv4Network = self
            .ipm
            .gateway
            .parse()
            .with_context(|| format!("parse gateway {}", self.ipm.gateway))?;
        if let Err(e) = nl.add_address(&name, gateway).and_then(|_| nl.set_up(&name)) {
            let _ = nl.delete_link(&name);
            return Err(e);
        }
        Ok(())
    }

    fn setup_nat(&self) -> Result<()> {
        iptables::setup_bridge_nat(&self.bridge_name(), &self.ipm.cidr)
    }

    fn clean_nat(&self) {
        iptables::clean_bridge_nat(&self.bridge_name(), &self.ipm.cidr);
    }

    /// Wires a container into the network: veth pair on the bridge, peer end
    /// moved into the container's namespace and configured as `eth0` with an
    /// allocated address and a default route via the gateway. Partial
    /// progress is rolled back before the error surfaces.
    pub fn connect(&mut self, container_id: &str, pid: i32) -> Result<()> {
        let (veth, ceth) = veth_names(container_id);
        let mut nl = Netlink::new()?;
        nl.create_veth(&veth, &ceth).context("create veth")?;

        if let Err(e) = self.wire_container(&mut nl, &veth, &ceth, container_id, pid) {
            if let Some(cidr) = self.container_ips.remove(container_id) {
                self.ipm.release(&cidr);
            }
            let _ = nl.delete_link(&veth);
            return Err(e);
        }
        self.save_config()
    }

    fn wire_container(
        &mut self,
        nl: &mut Netlink,
        veth: &str,
        ceth: &str,
        container_id: &str,
        pid: i32,
    ) -> Result<()> {
        nl.set_master(veth, &self.bridge_name()).context("attach to bridge")?;
        nl.set_up(veth).context("set veth up")?;

        let cidr = self.ipm.allocate().context("allocate ip")?;
        self.container_ips.insert(container_id.to_string(), cidr.clone());

        nl.move_to_pid_netns(ceth, pid).context("move peer to netns")?;
        self.configure_container_ns(ceth, &cidr, pid)
            .context("configure container interface")
    }

    fn configure_container_ns(&self, peer: &str, cidr: &str, pid: i32) -> Result<()> {
        let mut ns = Netlink::in_namespace_of(pid)?;
        if ns.link_exists("lo") {
            let _ = ns.set_up("lo");
        }
        ns.rename(peer, "eth0")?;
        let addr: Ipv4Network = cidr.parse().with_context(|| format!("parse addr {cidr}"))?;
        ns.add_address("eth0", addr)?;
        ns.set_up("eth0")?;
        ns.add_default_route("eth0", self.gateway_ip()?)?;
        Ok(())
    }

    /// Detaches a container. Missing links are fine; the address always goes
    /// back to the pool.
    pub fn disconnect(&mut self, container_id: &str) -> Result<()> {
        let (veth, _) = veth_names(container_id);
        if let Ok(mut nl) = Netlink::new() {
            let _ = nl.delete_link(&veth);
        }

        if let Some(cidr) = self.container_ips.remove(container_id) {
            self.ipm.release(&cidr);
        }
        self.save_config()
    }

    /// The container's bare address (no prefix) inside this network.
    pub fn container_ip(&self, container_id: &str) -> Result<Ipv4Addr> {
        let cidr = self.container_ips.get(container_id).with_context(|| {
            format!("container {container_id} not connected to network {}", self.name)
        })?;
        parse_cidr_addr(cidr)
    }

    fn gateway_ip(&self) -> Result<Ipv4Addr> {
        self.ipm.gateway_ip()
    }

    pub fn save_config(&self) -> Result<()> {
        store::save(ResourceKind::Network, &self.id, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_name_uses_short_id() {
        assert_eq!(bridge_name("0123456789ab"), "br-012345");
    }

    #[test]
    fn test_veth_names() {
        let (host, guest) = veth_names("fedcba987654");
        assert_eq!(host, "veth-fedcba");
        assert_eq!(guest, "ceth-fedcba");
    }

    #[test]
    fn test_record_defaults() {
        let json = r#"{
            "id": "0123456789ab",
            "name": "blue",
            "ipm": {"cidr": "10.0.0.0/24"}
        }"#;
        let mut driver: BridgeDriver = serde_json::from_str(json).unwrap();
        driver.ipm.init().unwrap();

        assert!(driver.container_ips.is_empty());
        assert_eq!(driver.ipm.gateway, "10.0.0.1/24");
    }
}
